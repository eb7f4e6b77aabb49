//! Catalogue of user-facing actions and who may see them.

use serde::Deserialize;

use crate::auth::Role;

/// Role name that makes an action visible to everyone.
pub const ALL_ROLES: &str = "all";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ActionSpec {
  pub id: String,
  pub label: String,
  #[serde(default)]
  pub allowed_roles: Vec<String>,
  /// Sensitive actions need a live step-up token before they run
  #[serde(default)]
  pub requires_step_up: bool,
}

impl ActionSpec {
  pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      label: label.into(),
      allowed_roles: Vec::new(),
      requires_step_up: false,
    }
  }

  pub fn allow(mut self, role: impl Into<String>) -> Self {
    self.allowed_roles.push(role.into().to_lowercase());
    self
  }

  pub fn step_up(mut self) -> Self {
    self.requires_step_up = true;
    self
  }

  /// Display hint only. The server re-checks every action it executes.
  pub fn is_visible_to(&self, role: &Role) -> bool {
    self.allowed_roles.iter().any(|allowed| {
      let allowed = allowed.to_lowercase();
      allowed == ALL_ROLES || allowed == role.as_str() || (allowed == "admin" && role.is_admin())
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_visibility_rules() {
    let refund = ActionSpec::new("refund", "Refund").allow("admin");
    assert!(refund.is_visible_to(&Role::new("admin")));
    assert!(refund.is_visible_to(&Role::new("Administrator")));
    assert!(!refund.is_visible_to(&Role::new("staff")));

    let scan = ActionSpec::new("scan", "Scan card").allow("all");
    assert!(scan.is_visible_to(&Role::default()));

    let hidden = ActionSpec::new("noop", "Nothing");
    assert!(!hidden.is_visible_to(&Role::new("admin")));
  }

  #[test]
  fn test_deserialize_catalogue() {
    let yaml = r#"
- id: adjust
  label: Adjust points
  allowed_roles: [Manager, admin]
  requires_step_up: true
- id: scan
  label: Scan card
  allowed_roles: [all]
"#;
    let actions: Vec<ActionSpec> = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(actions.len(), 2);
    assert!(actions[0].requires_step_up);
    assert!(!actions[1].requires_step_up);
    assert!(actions[0].is_visible_to(&Role::new("manager")));
  }
}
