//! Role hierarchy: definitions, transitive expansion, cycle detection.
//!
//! Expansion is an iterative DFS with an explicit stack and a per-root
//! visited set; recursion is avoided so the depth cap is trivial to enforce
//! and adversarial graphs cannot exhaust the stack. Cycles terminate the
//! offending branch with a structured warning and never abort expansion.

use std::collections::{BTreeSet, HashMap, HashSet};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Hard cap on inheritance depth during expansion.
const MAX_DEPTH: usize = 10;

/// One role: its inherited roles and declared permissions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleDefinition {
    /// Role name (bare, no `realm:`/`client:` prefix).
    pub name: String,
    /// Roles this role inherits from.
    #[serde(default)]
    pub inherits: Vec<String>,
    /// Permission strings (`resource:action`, `*` allowed in either slot).
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Attribute conditions applied to rules compiled from this role.
    /// String values support `${attr.path}` templates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<serde_json::Map<String, serde_json::Value>>,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
}

/// Result of [`RoleHierarchyManager::validate_hierarchy`].
#[derive(Debug, Clone)]
pub struct HierarchyValidation {
    /// Whether the map is acyclic with no dangling edges.
    pub valid: bool,
    /// Human-readable problems found.
    pub errors: Vec<String>,
}

/// Maintains the role graph and expands roles transitively.
pub struct RoleHierarchyManager {
    roles: RwLock<HashMap<String, RoleDefinition>>,
}

impl RoleHierarchyManager {
    /// Create an empty hierarchy.
    #[must_use]
    pub fn new() -> Self {
        Self {
            roles: RwLock::new(HashMap::new()),
        }
    }

    /// Merge `definitions` into the current graph.
    ///
    /// Edges to roles that remain undefined after the merge are dropped with
    /// a warning rather than poisoning expansion.
    pub fn update_hierarchy(&self, definitions: HashMap<String, RoleDefinition>) {
        let mut roles = self.roles.write();
        for (name, mut definition) in definitions {
            definition.name.clone_from(&name);
            roles.insert(name, definition);
        }

        // Second pass: prune dangling edges against the merged graph
        let known: HashSet<String> = roles.keys().cloned().collect();
        for definition in roles.values_mut() {
            definition.inherits.retain(|parent| {
                let defined = known.contains(parent);
                if !defined {
                    warn!(
                        role = %definition.name,
                        parent = %parent,
                        "Dropping inheritance edge to undefined role"
                    );
                }
                defined
            });
        }
    }

    /// The definition for `role`, when present.
    #[must_use]
    pub fn role(&self, role: &str) -> Option<RoleDefinition> {
        self.roles.read().get(role).cloned()
    }

    /// Transitive closure of `input` over the inheritance graph.
    ///
    /// Accepts prefixed (`realm:user`) or bare names; returns sorted bare
    /// names. Unknown roles pass through unexpanded (they still matter for
    /// matching). Cycles terminate the branch with a warning.
    #[must_use]
    pub fn expand_roles(&self, input: &[String]) -> Vec<String> {
        let roles = self.roles.read();
        let mut expanded: BTreeSet<String> = BTreeSet::new();

        for raw in input {
            let root = strip_prefix(raw);
            // Per-root visited set: a role reachable from two roots is fine,
            // revisiting within one root's walk is a cycle
            let mut visited: HashSet<String> = HashSet::new();
            let mut stack: Vec<(String, usize)> = vec![(root.to_string(), 0)];

            while let Some((name, depth)) = stack.pop() {
                if depth > MAX_DEPTH {
                    warn!(role = %root, depth, "Role expansion depth cap reached, truncating branch");
                    continue;
                }
                if !visited.insert(name.clone()) {
                    warn!(role = %root, via = %name, "Role inheritance cycle detected, terminating branch");
                    continue;
                }
                expanded.insert(name.clone());

                if let Some(definition) = roles.get(&name) {
                    for parent in &definition.inherits {
                        stack.push((parent.clone(), depth + 1));
                    }
                }
            }
        }

        expanded.into_iter().collect()
    }

    /// Union of permissions declared by `roles` (expanded names).
    #[must_use]
    pub fn permissions_for(&self, roles: &[String]) -> Vec<String> {
        let graph = self.roles.read();
        let mut permissions: BTreeSet<String> = BTreeSet::new();
        for role in roles {
            if let Some(definition) = graph.get(role) {
                permissions.extend(definition.permissions.iter().cloned());
            }
        }
        permissions.into_iter().collect()
    }

    /// Union of `realm_access.roles` and every `resource_access.<client>.roles`
    /// from a JWT payload, without signature verification.
    ///
    /// The caller is responsible for having validated the token; this is a
    /// claims peek, not a trust decision.
    #[must_use]
    pub fn extract_roles_from_token(token: &str) -> Vec<String> {
        let Some(payload) = token.split('.').nth(1) else {
            return Vec::new();
        };
        let Ok(bytes) = URL_SAFE_NO_PAD.decode(payload) else {
            return Vec::new();
        };
        let Ok(claims) = serde_json::from_slice::<serde_json::Value>(&bytes) else {
            return Vec::new();
        };

        let mut roles: BTreeSet<String> = BTreeSet::new();
        if let Some(realm_roles) = claims
            .pointer("/realm_access/roles")
            .and_then(|v| v.as_array())
        {
            roles.extend(
                realm_roles
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from)),
            );
        }
        if let Some(clients) = claims.get("resource_access").and_then(|v| v.as_object()) {
            for access in clients.values() {
                if let Some(client_roles) = access.get("roles").and_then(|v| v.as_array()) {
                    roles.extend(
                        client_roles
                            .iter()
                            .filter_map(|v| v.as_str().map(String::from)),
                    );
                }
            }
        }
        roles.into_iter().collect()
    }

    /// Standalone validation used at config load: detects cycles (DFS with
    /// a recursion stack) and dangling edges.
    #[must_use]
    pub fn validate_hierarchy(map: &HashMap<String, RoleDefinition>) -> HierarchyValidation {
        let mut errors = Vec::new();

        for (name, definition) in map {
            for parent in &definition.inherits {
                if !map.contains_key(parent) {
                    errors.push(format!("Role {name} inherits from undefined role: {parent}"));
                }
            }
        }

        // Iterative colored DFS: white = unvisited, grey = on the current
        // path, black = done
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Grey,
            Black,
        }
        let mut colors: HashMap<&str, Color> =
            map.keys().map(|k| (k.as_str(), Color::White)).collect();

        let mut names: Vec<&String> = map.keys().collect();
        names.sort();
        for start in names {
            if colors[start.as_str()] != Color::White {
                continue;
            }
            let mut stack: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
            while let Some(&(node, child_idx)) = stack.last() {
                if child_idx == 0 {
                    colors.insert(node, Color::Grey);
                }
                let parents = map.get(node).map(|d| &d.inherits);
                let next = parents.and_then(|p| p.get(child_idx));
                match next {
                    Some(parent) => {
                        stack.last_mut().expect("non-empty stack").1 += 1;
                        match colors.get(parent.as_str()) {
                            Some(Color::Grey) => {
                                errors.push(format!(
                                    "Circular role inheritance: {node} -> {parent}"
                                ));
                            }
                            Some(Color::White) => stack.push((parent.as_str(), 0)),
                            _ => {}
                        }
                    }
                    None => {
                        colors.insert(node, Color::Black);
                        stack.pop();
                    }
                }
            }
        }

        HierarchyValidation {
            valid: errors.is_empty(),
            errors,
        }
    }
}

impl Default for RoleHierarchyManager {
    fn default() -> Self {
        Self::new()
    }
}

fn strip_prefix(role: &str) -> &str {
    role.strip_prefix("realm:")
        .or_else(|| role.strip_prefix("client:"))
        .unwrap_or(role)
}
