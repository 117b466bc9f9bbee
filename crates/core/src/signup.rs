use std::collections::BTreeMap;

use serde::Deserialize;

use crate::identifier::{IdentifierPolicy, TenantIdentifier};

pub const MAX_DISPLAY_NAME_LEN: usize = 100;
pub const MAX_ADMIN_NAME_LEN: usize = 100;
const REQUIRED: &str = "This field is required.";

/// Per-field validation messages, keyed by request field name.
pub type FieldErrors = BTreeMap<&'static str, Vec<String>>;

/// Workspace signup payload as received from clients.
///
/// Every field defaults to an empty string so that missing fields are
/// reported alongside the other validation errors.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignupRequest {
    #[serde(default)]
    pub identifier: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub admin_email: String,
    #[serde(default)]
    pub admin_name: String,
}

/// Signup payload whose fields passed every local check.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedSignup {
    pub identifier: TenantIdentifier,
    pub display_name: String,
    pub admin_email: String,
    pub admin_name: String,
}

impl SignupRequest {
    /// Runs all checks that do not need the registry.
    pub fn validate(&self, policy: IdentifierPolicy) -> Result<ValidatedSignup, FieldErrors> {
        let mut errors = FieldErrors::new();

        let identifier = if self.identifier.trim().is_empty() {
            errors.insert("identifier", vec![REQUIRED.to_string()]);
            None
        } else {
            match policy.check(&self.identifier) {
                Ok(identifier) => Some(identifier),
                Err(err) => {
                    errors.insert("identifier", vec![err.to_string()]);
                    return Err(self.merge_other_fields(errors));
                }
            }
        };

        let errors = self.merge_other_fields(errors);
        match identifier {
            Some(identifier) if errors.is_empty() => Ok(ValidatedSignup {
                identifier,
                display_name: self.display_name.trim().to_string(),
                admin_email: self.admin_email.trim().to_string(),
                admin_name: self.admin_name.trim().to_string(),
            }),
            _ => Err(errors),
        }
    }

    fn merge_other_fields(&self, mut errors: FieldErrors) -> FieldErrors {
        if let Some(message) = check_text(&self.display_name, MAX_DISPLAY_NAME_LEN) {
            errors.insert("display_name", vec![message]);
        }
        if let Some(message) = check_email(&self.admin_email) {
            errors.insert("admin_email", vec![message]);
        }
        if let Some(message) = check_text(&self.admin_name, MAX_ADMIN_NAME_LEN) {
            errors.insert("admin_name", vec![message]);
        }
        errors
    }
}

fn check_text(value: &str, max_len: usize) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Some(REQUIRED.to_string());
    }
    if trimmed.chars().count() > max_len {
        return Some(format!(
            "Ensure this field has no more than {max_len} characters."
        ));
    }
    None
}

fn check_email(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Some(REQUIRED.to_string());
    }
    if !is_plausible_email(trimmed) {
        return Some("Enter a valid email address.".to_string());
    }
    None
}

fn is_plausible_email(value: &str) -> bool {
    let Some((local, domain)) = value.rsplit_once('@') else {
        return false;
    };
    if local.is_empty() || local.contains('@') || value.chars().any(char::is_whitespace) {
        return false;
    }
    let labels: Vec<&str> = domain.split('.').collect();
    labels.len() >= 2 && labels.iter().all(|label| !label.is_empty())
}
