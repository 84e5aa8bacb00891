//! Validation applied to rules before they are written to a store.

use regex::Regex;
use std::sync::OnceLock;

use crate::error::StoreError;
use crate::lang;
use crate::rule::FailureAssociationRule;

/// The special user recorded for changes made by the system itself.
pub const SYSTEM_USER: &str = "weetbix";

fn project_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9\-]{1,40}$").expect("static regex"))
}

fn rule_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9a-f]{32}$").expect("static regex"))
}

fn user_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(weetbix|[a-zA-Z0-9_.+\-]+@[a-zA-Z0-9\-]+\.[a-zA-Z0-9\-.]+)$")
            .expect("static regex")
    })
}

pub fn validate_project(project: &str) -> Result<(), StoreError> {
    if project_re().is_match(project) {
        Ok(())
    } else {
        Err(StoreError::Validation("project must be valid".to_string()))
    }
}

pub fn validate_rule_id(rule_id: &str) -> Result<(), StoreError> {
    if rule_id_re().is_match(rule_id) {
        Ok(())
    } else {
        Err(StoreError::Validation("rule ID must be valid".to_string()))
    }
}

pub fn validate_user(user: &str) -> Result<(), StoreError> {
    if user_re().is_match(user) {
        Ok(())
    } else {
        Err(StoreError::Validation("user must be valid".to_string()))
    }
}

/// Checks the identifying fields, bug, source cluster and definition of a rule.
///
/// An empty source cluster is allowed.
pub fn validate_rule(rule: &FailureAssociationRule) -> Result<(), StoreError> {
    validate_project(&rule.project)?;
    validate_rule_id(&rule.rule_id)?;
    if rule.bug_id.system.is_empty() || rule.bug_id.id.is_empty() {
        return Err(StoreError::Validation("bug ID is not valid".to_string()));
    }
    if !rule.source_cluster.is_empty() {
        rule.source_cluster.validate().map_err(|e| {
            StoreError::Validation(format!("source cluster ID is not valid: {}", e))
        })?;
    }
    lang::parse(&rule.rule_definition).map_err(|e| {
        StoreError::Validation(format!("rule definition is not valid: {}", e))
    })?;
    Ok(())
}

/// Generates a random 128-bit rule ID as 32 lowercase hexadecimal characters.
pub fn generate_rule_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{BugId, ClusterId};
    use chrono::Utc;

    fn rule() -> FailureAssociationRule {
        FailureAssociationRule {
            project: "chromium".to_string(),
            rule_id: generate_rule_id(),
            rule_definition: r#"test = "a""#.to_string(),
            bug_id: BugId {
                system: "monorail".to_string(),
                id: "chromium/1".to_string(),
            },
            is_active: true,
            creation_time: Utc::now(),
            creation_user: String::new(),
            last_updated: Utc::now(),
            last_updated_user: String::new(),
            source_cluster: ClusterId::default(),
        }
    }

    #[test]
    fn test_generated_ids_are_valid() {
        let id = generate_rule_id();
        assert_eq!(id.len(), 32);
        assert!(validate_rule_id(&id).is_ok());
        assert_ne!(id, generate_rule_id());
    }

    #[test]
    fn test_validate_rule() {
        assert!(validate_rule(&rule()).is_ok());

        let mut bad = rule();
        bad.project = "Not Valid".to_string();
        assert!(validate_rule(&bad).is_err());

        let mut bad = rule();
        bad.rule_id = "XYZ".to_string();
        assert!(validate_rule(&bad).is_err());

        let mut bad = rule();
        bad.bug_id.id.clear();
        assert!(validate_rule(&bad).is_err());

        let mut bad = rule();
        bad.source_cluster = ClusterId::new("reason-v1", "not hex");
        let err = validate_rule(&bad).unwrap_err();
        assert!(err.to_string().contains("source cluster ID is not valid"));

        let mut good = rule();
        good.source_cluster = ClusterId::new("reason-v1", "0123abcd");
        assert!(validate_rule(&good).is_ok());

        let mut bad = rule();
        bad.rule_definition = "test = ".to_string();
        assert!(validate_rule(&bad).is_err());
    }

    #[test]
    fn test_validate_user() {
        assert!(validate_user(SYSTEM_USER).is_ok());
        assert!(validate_user("someone@example.com").is_ok());
        assert!(validate_user("").is_err());
        assert!(validate_user("not a user").is_err());
        // Anchored on both sides: no prefix or suffix matches.
        assert!(validate_user("weetbixbot").is_err());
        assert!(validate_user("x weetbix").is_err());
    }
}
