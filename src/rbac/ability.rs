//! Compiled per-principal abilities.
//!
//! An [`Ability`] is an immutable decision object answering
//! `can(action, subject)` for one principal. Rules are compiled from the
//! permissions of the principal's expanded roles; role-level conditions may
//! reference context attributes through `${attr.path}` templates, resolved
//! at build time (unresolvable templates stay literal).
//!
//! Abilities cache as serialized rule lists keyed by
//! `ability:<user_id>:<hash>`. A cache hit reconstructs an *equivalent*
//! ability, not the same instance.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::cache::CacheFacade;
use crate::rbac::RoleHierarchyManager;

/// One compiled rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbilityRule {
    /// Stable rule id (`<role>:<permission>`).
    pub id: String,
    /// Action this rule grants (`manage` is a wildcard).
    pub action: String,
    /// Subject this rule applies to (`all` is a wildcard).
    pub subject: String,
    /// Attribute conditions that must hold on the call context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Outcome of [`Ability::can`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbilityDecision {
    /// Whether any rule granted the action.
    pub granted: bool,
    /// Stable reason string.
    pub reason: String,
}

/// Immutable, principal-scoped decision object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ability {
    /// Principal this ability was compiled for.
    pub user_id: String,
    /// Compiled rules.
    rules: Vec<AbilityRule>,
}

impl Ability {
    /// Build from an explicit rule list (also the deserialization path).
    #[must_use]
    pub fn from_rules(user_id: String, rules: Vec<AbilityRule>) -> Self {
        Self { user_id, rules }
    }

    /// The restrictive ability: no rules, every check denied.
    #[must_use]
    pub fn restrictive(user_id: String) -> Self {
        Self {
            user_id,
            rules: Vec::new(),
        }
    }

    /// The compiled rules.
    #[must_use]
    pub fn rules(&self) -> &[AbilityRule] {
        &self.rules
    }

    /// Whether this ability grants `action` on `subject` under `context`.
    #[must_use]
    pub fn can(
        &self,
        action: &str,
        subject: &str,
        context: Option<&HashMap<String, serde_json::Value>>,
    ) -> AbilityDecision {
        let granted = self.rules.iter().any(|rule| {
            let action_ok = rule.action == action || rule.action == "manage" || rule.action == "*";
            let subject_ok =
                rule.subject == subject || rule.subject == "all" || rule.subject == "*";
            action_ok && subject_ok && conditions_hold(rule.conditions.as_ref(), context)
        });

        AbilityDecision {
            granted,
            reason: if granted {
                "authorized".to_string()
            } else {
                "insufficient permissions".to_string()
            },
        }
    }
}

/// Set-diff of two abilities by rule id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AbilityDiff {
    /// Rule ids present only in the new ability.
    pub added: Vec<String>,
    /// Rule ids present only in the old ability.
    pub removed: Vec<String>,
    /// Rule ids present in both with differing action/subject/conditions.
    pub modified: Vec<String>,
}

/// Inputs to [`AbilityFactory::create_ability`].
#[derive(Debug, Clone, Default)]
pub struct AbilityContext {
    /// Principal id.
    pub user_id: String,
    /// Roles (prefixed or bare).
    pub roles: Vec<String>,
    /// Context attributes for `${attr.path}` resolution.
    pub attributes: HashMap<String, serde_json::Value>,
    /// Session id, part of the cache key so per-session context shifts
    /// do not collide.
    pub session_id: Option<String>,
}

/// Compiles and caches abilities.
pub struct AbilityFactory {
    hierarchy: Arc<RoleHierarchyManager>,
    cache: CacheFacade,
    ttl: Duration,
}

impl AbilityFactory {
    /// Create a factory over the shared hierarchy and cache.
    #[must_use]
    pub fn new(hierarchy: Arc<RoleHierarchyManager>, cache: CacheFacade, ttl_secs: u64) -> Self {
        Self {
            hierarchy,
            cache,
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    /// Compile (or load from cache) the ability for `ctx`.
    pub async fn create_ability(&self, ctx: &AbilityContext) -> Ability {
        if ctx.roles.is_empty() {
            return Ability::restrictive(ctx.user_id.clone());
        }

        let key = self.cache_key(ctx);
        if let Some(rules) = self.cache.get::<Vec<AbilityRule>>(&key).await {
            return Ability::from_rules(ctx.user_id.clone(), rules);
        }

        let ability = self.compile(ctx);
        self.cache.set(&key, &ability.rules, self.ttl).await;
        ability
    }

    /// Diff two abilities by rule id.
    #[must_use]
    pub fn permission_changes(old: &Ability, new: &Ability) -> AbilityDiff {
        let old_by_id: HashMap<&str, &AbilityRule> =
            old.rules.iter().map(|r| (r.id.as_str(), r)).collect();
        let new_by_id: HashMap<&str, &AbilityRule> =
            new.rules.iter().map(|r| (r.id.as_str(), r)).collect();

        let mut diff = AbilityDiff::default();
        for (id, rule) in &new_by_id {
            match old_by_id.get(id) {
                None => diff.added.push((*id).to_string()),
                Some(old_rule) if *old_rule != *rule => diff.modified.push((*id).to_string()),
                Some(_) => {}
            }
        }
        for id in old_by_id.keys() {
            if !new_by_id.contains_key(id) {
                diff.removed.push((*id).to_string());
            }
        }
        diff.added.sort();
        diff.removed.sort();
        diff.modified.sort();
        diff
    }

    /// Invalidate cached abilities for `user_id`, or all when omitted.
    pub async fn clear_cache(&self, user_id: Option<&str>) {
        let prefix = match user_id {
            Some(user_id) => format!("ability:{user_id}:"),
            None => "ability:".to_string(),
        };
        let removed = self.cache.invalidate_prefix(&prefix).await;
        debug!(prefix = %prefix, removed, "Cleared ability cache");
    }

    fn compile(&self, ctx: &AbilityContext) -> Ability {
        let expanded = self.hierarchy.expand_roles(&ctx.roles);
        let mut rules = Vec::new();
        let mut seen: BTreeSet<String> = BTreeSet::new();

        for role_name in &expanded {
            let Some(role) = self.hierarchy.role(role_name) else {
                continue;
            };
            let conditions = role
                .conditions
                .as_ref()
                .map(|c| resolve_templates(c, &ctx.attributes));

            for permission in &role.permissions {
                let id = format!("{role_name}:{permission}");
                if !seen.insert(id.clone()) {
                    continue;
                }
                let (subject, action) = match permission.split_once(':') {
                    Some((resource, action)) => (resource.to_string(), action.to_string()),
                    None => (permission.clone(), "*".to_string()),
                };
                rules.push(AbilityRule {
                    id,
                    action,
                    subject,
                    conditions: conditions.clone(),
                });
            }
        }

        Ability::from_rules(ctx.user_id.clone(), rules)
    }

    fn cache_key(&self, ctx: &AbilityContext) -> String {
        let mut roles = ctx.roles.clone();
        roles.sort();
        let mut attrs: Vec<(&String, String)> = ctx
            .attributes
            .iter()
            .map(|(k, v)| (k, v.to_string()))
            .collect();
        attrs.sort();

        let mut hasher = Sha256::new();
        hasher.update(roles.join(",").as_bytes());
        hasher.update([0]);
        for (k, v) in attrs {
            hasher.update(k.as_bytes());
            hasher.update([1]);
            hasher.update(v.as_bytes());
        }
        hasher.update([0]);
        hasher.update(ctx.session_id.as_deref().unwrap_or_default().as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("ability:{}:{}", ctx.user_id, &digest[..16])
    }
}

/// Whether a rule's conditions hold against the call context.
///
/// Every condition key must equal the corresponding context attribute.
/// Conditions left as literal `${...}` templates (unresolvable at build
/// time) never match a concrete value, which fails closed.
fn conditions_hold(
    conditions: Option<&serde_json::Map<String, serde_json::Value>>,
    context: Option<&HashMap<String, serde_json::Value>>,
) -> bool {
    let Some(conditions) = conditions else {
        return true;
    };
    if conditions.is_empty() {
        return true;
    }
    let Some(context) = context else {
        return false;
    };
    conditions
        .iter()
        .all(|(key, expected)| context.get(key) == Some(expected))
}

/// Resolve `${attr.path}` templates in string condition values.
fn resolve_templates(
    conditions: &serde_json::Map<String, serde_json::Value>,
    attributes: &HashMap<String, serde_json::Value>,
) -> serde_json::Map<String, serde_json::Value> {
    conditions
        .iter()
        .map(|(key, value)| {
            let resolved = match value.as_str() {
                Some(s) => resolve_one(s, attributes),
                None => value.clone(),
            };
            (key.clone(), resolved)
        })
        .collect()
}

fn resolve_one(value: &str, attributes: &HashMap<String, serde_json::Value>) -> serde_json::Value {
    let Some(path) = value
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
    else {
        return serde_json::Value::String(value.to_string());
    };
    let Some(attr_path) = path.strip_prefix("attr.") else {
        return serde_json::Value::String(value.to_string());
    };

    // Dot path into the attribute map
    let mut segments = attr_path.split('.');
    let first = segments.next().unwrap_or_default();
    let mut current = match attributes.get(first) {
        Some(v) => v.clone(),
        // Unresolvable: keep the literal template
        None => return serde_json::Value::String(value.to_string()),
    };
    for segment in segments {
        match current.get(segment) {
            Some(v) => current = v.clone(),
            None => return serde_json::Value::String(value.to_string()),
        }
    }
    current
}
