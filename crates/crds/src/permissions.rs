//! Permission rules
//!
//! Shared by `VirtualMachine` and `VmPool`. A rule grants a set of
//! permissions to a user, a role, or both.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A permission on a VM or pool
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum Permission {
    #[serde(rename = "start")]
    Start,

    #[serde(rename = "stop")]
    Stop,

    #[serde(rename = "accessConsole")]
    AccessConsole,

    /// Grants every permission
    #[serde(rename = "*")]
    All,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRule {
    /// User the rule applies to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Role the rule applies to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    /// Granted permissions
    #[serde(default)]
    pub may: Vec<Permission>,
}

impl PermissionRule {
    fn applies_to(&self, user: &str, roles: &[String]) -> bool {
        self.user.as_deref() == Some(user)
            || self
                .role
                .as_ref()
                .is_some_and(|role| roles.iter().any(|r| r == role))
    }
}

/// Whether `rules` grant `permission` to `user` directly or through any of `roles`
pub fn grants(rules: &[PermissionRule], user: &str, roles: &[String], permission: Permission) -> bool {
    rules
        .iter()
        .filter(|rule| rule.applies_to(user, roles))
        .flat_map(|rule| rule.may.iter())
        .any(|p| *p == permission || *p == Permission::All)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> Vec<PermissionRule> {
        vec![
            PermissionRule {
                user: Some("alice".to_string()),
                role: None,
                may: vec![Permission::AccessConsole],
            },
            PermissionRule {
                user: None,
                role: Some("admin".to_string()),
                may: vec![Permission::All],
            },
        ]
    }

    #[test]
    fn test_user_rule() {
        assert!(grants(&rules(), "alice", &[], Permission::AccessConsole));
        assert!(!grants(&rules(), "alice", &[], Permission::Stop));
        assert!(!grants(&rules(), "bob", &[], Permission::AccessConsole));
    }

    #[test]
    fn test_role_wildcard() {
        let roles = vec!["admin".to_string()];
        assert!(grants(&rules(), "bob", &roles, Permission::Stop));
        assert!(grants(&rules(), "bob", &roles, Permission::AccessConsole));
    }

    #[test]
    fn test_wire_names() {
        let json = serde_json::to_string(&vec![Permission::AccessConsole, Permission::All]).unwrap();
        assert_eq!(json, r#"["accessConsole","*"]"#);
    }
}
