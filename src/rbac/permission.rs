//! Permission evaluation with wildcard matching and decision caching.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cache::CacheFacade;
use crate::principal::Principal;
use crate::rbac::RoleHierarchyManager;

/// Whether a granted permission matches a required `(resource, action)`.
///
/// Rules, short-circuiting on the first match:
/// - `*` alone grants everything;
/// - exact `resource:action`;
/// - `resource:*` (any action on the resource);
/// - `*:action` (the action on any resource).
///
/// Plain comparisons, no regex: the pattern language is two literal slots
/// with an optional `*` in each.
#[must_use]
pub fn permission_matches(granted: &str, resource: &str, action: &str) -> bool {
    if granted == "*" {
        return true;
    }
    let (granted_resource, granted_action) = match granted.split_once(':') {
        Some(parts) => parts,
        // A bare grant names a resource with any action
        None => (granted, "*"),
    };
    (granted_resource == resource || granted_resource == "*")
        && (granted_action == action || granted_action == "*")
}

/// Outcome of a permission check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    /// Whether the action is allowed.
    pub allowed: bool,
    /// Roles after hierarchy expansion.
    pub effective_roles: Vec<String>,
    /// Union of permissions across the effective roles and the principal.
    pub effective_permissions: Vec<String>,
    /// Policies that produced the decision (`local_rbac` when allowed).
    pub matched_policies: Vec<String>,
    /// Stable reason string.
    pub reason: String,
    /// Context echo, when the caller supplied one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

/// Computes effective permissions and caches decisions.
pub struct PermissionEvaluator {
    hierarchy: Arc<RoleHierarchyManager>,
    cache: CacheFacade,
    ttl: Duration,
}

impl PermissionEvaluator {
    /// Create an evaluator over the shared hierarchy and cache.
    #[must_use]
    pub fn new(hierarchy: Arc<RoleHierarchyManager>, cache: CacheFacade, ttl_secs: u64) -> Self {
        Self {
            hierarchy,
            cache,
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    /// Check whether `principal` may perform `action` on `resource`.
    pub async fn check(
        &self,
        principal: &Principal,
        resource: &str,
        action: &str,
        context: Option<serde_json::Value>,
    ) -> Decision {
        if resource.is_empty() || action.is_empty() {
            return Decision {
                allowed: false,
                effective_roles: Vec::new(),
                effective_permissions: Vec::new(),
                matched_policies: Vec::new(),
                reason: "rbac_check_error".to_string(),
                context,
            };
        }

        let key = format!(
            "rbac:{resource}:{action}:{}",
            principal_hash(principal)
        );
        if let Some(mut cached) = self.cache.get::<Decision>(&key).await {
            cached.context = context;
            return cached;
        }

        let decision = self.compute(principal, resource, action, context);
        self.cache.set(&key, &decision, self.ttl).await;
        decision
    }

    /// Sequential checks, keyed by `"resource:action"`.
    pub async fn check_many(
        &self,
        principal: &Principal,
        pairs: &[(String, String)],
    ) -> HashMap<String, Decision> {
        let mut results = HashMap::with_capacity(pairs.len());
        for (resource, action) in pairs {
            let decision = self.check(principal, resource, action, None).await;
            results.insert(format!("{resource}:{action}"), decision);
        }
        results
    }

    fn compute(
        &self,
        principal: &Principal,
        resource: &str,
        action: &str,
        context: Option<serde_json::Value>,
    ) -> Decision {
        let effective_roles = self.hierarchy.expand_roles(&principal.roles);

        // Union of role-declared permissions and permissions carried on the
        // principal itself (explicit claim)
        let mut permissions: BTreeSet<String> = self
            .hierarchy
            .permissions_for(&effective_roles)
            .into_iter()
            .collect();
        permissions.extend(principal.permissions.iter().cloned());
        let effective_permissions: Vec<String> = permissions.into_iter().collect();

        let allowed = effective_permissions
            .iter()
            .any(|granted| permission_matches(granted, resource, action));

        Decision {
            allowed,
            effective_roles,
            effective_permissions,
            matched_policies: if allowed {
                vec!["local_rbac".to_string()]
            } else {
                Vec::new()
            },
            reason: if allowed {
                "authorized".to_string()
            } else {
                "insufficient permissions".to_string()
            },
            context,
        }
    }
}

/// Short digest of the principal's identity and role set; decision cache
/// entries are invalid the moment either changes.
fn principal_hash(principal: &Principal) -> String {
    let mut roles = principal.roles.clone();
    roles.sort();
    let mut permissions = principal.permissions.clone();
    permissions.sort();

    let mut hasher = Sha256::new();
    hasher.update(principal.id.as_bytes());
    hasher.update([0]);
    hasher.update(roles.join(",").as_bytes());
    hasher.update([0]);
    hasher.update(permissions.join(",").as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}
