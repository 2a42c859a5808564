// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Richard Majewski - Varanid Works

//! Role-based access control.
//!
//! Roles come from two places, unioned: every subdirectory name under a
//! configured template (e.g. `Templates/standard/backend/`) is a role, and
//! `.MyOS/ACLs.md` can declare additional explicit role sections. When a
//! role has both an explicit section and a template-derived default, the
//! explicit section wins outright rather than merging with the default.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use myos_config::{parse_file, Value};
use myos_project::ProjectConfig;

const ACLS_MD: &str = "ACLs.md";
const RESERVED_SECTIONS: [&str; 3] = ["permissions", "inherit", "roles"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionRule {
    pub path: String,
    pub rights: HashSet<String>,
}

/// The resolved access-control policy for a project.
#[derive(Debug, Clone, Default)]
pub struct AclPolicy {
    pub roles: HashSet<String>,
    pub permissions: HashMap<String, Vec<PermissionRule>>,
    pub users: HashMap<String, HashSet<String>>,
}

impl AclPolicy {
    /// Builds a policy from `project_root`'s configured templates and its
    /// `.MyOS/ACLs.md`, if present. Never fails: a missing or unparseable
    /// `ACLs.md` simply yields an empty policy.
    pub fn from_project(project_root: &Path, templates_dir: &Path) -> AclPolicy {
        let project = ProjectConfig::new(project_root);

        let mut template_roles = HashSet::new();
        for name in &project.templates {
            for role in myos_templates::list_template_roles(templates_dir, name) {
                template_roles.insert(normalize_role(&role));
            }
        }

        let acls_path = project_root.join(".MyOS").join(ACLS_MD);
        let doc = parse_file(&acls_path).unwrap_or_default();

        let mut role_permissions: HashMap<String, Vec<PermissionRule>> = HashMap::new();
        let mut folder_defaults: Vec<PermissionRule> = Vec::new();
        let mut acl_roles = HashSet::new();
        let mut users: HashMap<String, HashSet<String>> = HashMap::new();

        for (name, value) in &doc {
            let lowered = name.to_lowercase();
            if RESERVED_SECTIONS.contains(&lowered.as_str()) {
                continue;
            }
            let Value::Dict(map) = value else { continue };

            if lowered == "users" {
                for (user, roles) in map {
                    users
                        .entry(user.to_lowercase())
                        .or_default()
                        .extend(roles.iter().map(|r| normalize_role(r)));
                }
                continue;
            }

            if lowered == "folder" {
                folder_defaults = parse_rule_entries(map);
                continue;
            }

            let role = normalize_role(name);
            acl_roles.insert(role.clone());
            role_permissions.insert(role, expand_rules(name, map));
        }

        let roles: HashSet<String> = template_roles.union(&acl_roles).cloned().collect();
        let mut permissions = HashMap::new();
        for role in &roles {
            let rules = if let Some(explicit) = role_permissions.get(role) {
                explicit.clone()
            } else if template_roles.contains(role) {
                substitute_folder(&folder_defaults, role)
            } else {
                Vec::new()
            };
            permissions.insert(role.clone(), rules);
        }

        AclPolicy {
            roles,
            permissions,
            users,
        }
    }

    /// Roles assigned to `username` in the `Users` table, if any.
    pub fn roles_for_user(&self, username: &str) -> HashSet<String> {
        self.users.get(&username.to_lowercase()).cloned().unwrap_or_default()
    }

    /// Whether `role` has `right` (or wildcard `*`) on `path`.
    pub fn can_access(&self, role: &str, path: &str, right: &str) -> bool {
        let role = normalize_role(role);
        let Some(rules) = self.permissions.get(&role) else {
            return false;
        };
        let query = normalize_path(path);
        for rule in rules {
            let matches = rule.path == "/*"
                || rule.path == query
                || query.starts_with(&format!("{}/", rule.path));
            if matches && (rule.rights.contains("*") || rule.rights.contains(right)) {
                return true;
            }
        }
        false
    }
}

fn normalize_role(name: &str) -> String {
    name.trim().to_lowercase()
}

fn normalize_path(path: &str) -> String {
    if path == "/*" {
        return path.to_string();
    }
    let with_leading = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    with_leading.trim_end_matches('/').to_string()
}

/// Parses a section's raw `path: rights` entries without substituting any
/// `{Folder}`/`{folder}` placeholder or normalizing the path yet.
fn parse_rule_entries(map: &HashMap<String, Vec<String>>) -> Vec<PermissionRule> {
    let mut merged: HashMap<String, HashSet<String>> = HashMap::new();
    for (raw_path, raw_rights) in map {
        let path = raw_path
            .trim_start_matches("- ")
            .trim_start_matches("* ")
            .trim()
            .to_string();
        let rights: HashSet<String> = raw_rights
            .iter()
            .flat_map(|r| r.split(','))
            .map(|r| r.trim().to_lowercase())
            .filter(|r| !r.is_empty())
            .collect();
        merged.entry(path).or_default().extend(rights);
    }
    merged
        .into_iter()
        .map(|(path, rights)| PermissionRule { path, rights })
        .collect()
}

/// Expands an explicit role section's rules, substituting the role's own
/// name for any `{Folder}`/`{folder}` placeholder (rare but harmless for
/// an explicit section) and normalizing each path.
fn expand_rules(role_key: &str, map: &HashMap<String, Vec<String>>) -> Vec<PermissionRule> {
    substitute_folder(&parse_rule_entries(map), role_key)
}

/// Substitutes the `Folder` section's placeholder paths with a concrete
/// template-derived role name and normalizes the result.
fn substitute_folder(defaults: &[PermissionRule], role_key: &str) -> Vec<PermissionRule> {
    defaults
        .iter()
        .map(|rule| PermissionRule {
            path: normalize_path(
                &rule
                    .path
                    .replace("{Folder}", role_key)
                    .replace("{folder}", role_key),
            ),
            rights: rule.rights.clone(),
        })
        .collect()
}

/// Resolves the effective role set for the current invocation: `MYOS_ROLES`
/// wins unconditionally when set and non-empty, otherwise the `Users`
/// table entry for the current OS user.
pub fn resolve_effective_roles(policy: &AclPolicy) -> HashSet<String> {
    if let Ok(raw) = std::env::var("MYOS_ROLES") {
        let roles: HashSet<String> = raw
            .split(',')
            .map(|r| normalize_role(r))
            .filter(|r| !r.is_empty())
            .collect();
        if !roles.is_empty() {
            return roles;
        }
    }
    if policy.users.is_empty() {
        return HashSet::new();
    }
    let user = whoami::username();
    let roles = policy.roles_for_user(&user);
    tracing::debug!(user, role_count = roles.len(), "resolved acl roles from Users table");
    roles
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write_acls(project_root: &Path, content: &str) {
        let dir = project_root.join(".MyOS");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("ACLs.md"), content).unwrap();
    }

    #[test]
    fn template_roles_get_folder_defaults() {
        let dir = tempdir().unwrap();
        let project_root = dir.path().join("proj");
        myos_project::ProjectConfig::make_project(&project_root, Some("standard")).unwrap();
        let templates_dir = dir.path().join("templates");
        fs::create_dir_all(templates_dir.join("standard/backend")).unwrap();
        write_acls(&project_root, "# Folder\n/{Folder}: read, write\n");

        let policy = AclPolicy::from_project(&project_root, &templates_dir);
        assert!(policy.roles.contains("backend"));
        assert!(policy.can_access("backend", "/backend", "read"));
        assert!(!policy.can_access("backend", "/other", "read"));
    }

    #[test]
    fn explicit_role_section_overrides_folder_default() {
        let dir = tempdir().unwrap();
        let project_root = dir.path().join("proj");
        myos_project::ProjectConfig::make_project(&project_root, Some("standard")).unwrap();
        let templates_dir = dir.path().join("templates");
        fs::create_dir_all(templates_dir.join("standard/backend")).unwrap();
        write_acls(
            &project_root,
            "# Folder\n/{Folder}: read\n\n# backend\n/custom: read, write\n",
        );

        let policy = AclPolicy::from_project(&project_root, &templates_dir);
        assert!(policy.can_access("backend", "/custom", "write"));
        assert!(!policy.can_access("backend", "/backend", "read"));
    }

    #[test]
    fn wildcard_path_matches_everything() {
        let dir = tempdir().unwrap();
        let project_root = dir.path().join("proj");
        myos_project::ProjectConfig::make_project(&project_root, None).unwrap();
        let templates_dir = dir.path().join("templates");
        write_acls(&project_root, "# admin\n/*: read, write\n");

        let policy = AclPolicy::from_project(&project_root, &templates_dir);
        assert!(policy.can_access("admin", "/anything/goes", "write"));
    }

    #[test]
    fn users_table_maps_to_roles() {
        let dir = tempdir().unwrap();
        let project_root = dir.path().join("proj");
        myos_project::ProjectConfig::make_project(&project_root, None).unwrap();
        let templates_dir = dir.path().join("templates");
        write_acls(&project_root, "# Users\nalice: admin\n");

        let policy = AclPolicy::from_project(&project_root, &templates_dir);
        assert_eq!(policy.roles_for_user("ALICE"), HashSet::from(["admin".to_string()]));
    }
}
