use crate::error::{Error, Result};
use regex::Regex;
use std::sync::OnceLock;

/// Longest accepted service name.
pub const MAX_SERVICE_NAME_LEN: usize = 63;

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("static regex pattern is valid"))
}

/// Reject names that are empty, too long, contain characters outside
/// `[A-Za-z0-9._-]`, or could be read as a path.
pub fn validate_service_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| {
        Err(Error::InvalidServiceName {
            name: name.to_string(),
            reason: reason.to_string(),
        })
    };

    if name.is_empty() {
        return invalid("name is empty");
    }
    if name.len() > MAX_SERVICE_NAME_LEN {
        return invalid("name is longer than 63 characters");
    }
    if name.contains("..") || name.contains('/') || name.contains('\\') {
        return invalid("name must not contain '..', '/' or '\\'");
    }
    if !name_pattern().is_match(name) {
        return invalid("only letters, digits, '.', '_' and '-' are allowed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_accepts_common_names() {
        for name in ["api", "web-1", "worker_2", "svc.v2", "A"] {
            assert!(validate_service_name(name).is_ok(), "{}", name);
        }
    }

    #[test]
    fn test_rejects_bad_names() {
        for name in ["", "..", "a..b", "a/b", "a\\b", "has space", "semi;colon", "ünï"] {
            let err = validate_service_name(name).unwrap_err();
            assert!(matches!(err, Error::InvalidServiceName { .. }), "{}", name);
        }
        assert!(validate_service_name(&"x".repeat(63)).is_ok());
        assert!(validate_service_name(&"x".repeat(64)).is_err());
    }

    proptest! {
        #[test]
        fn prop_valid_charset_accepted(name in "[A-Za-z0-9_-][A-Za-z0-9_-]{0,62}") {
            prop_assert!(validate_service_name(&name).is_ok());
        }

        #[test]
        fn prop_separators_rejected(prefix in "[a-z]{0,10}", suffix in "[a-z]{0,10}", sep in prop_oneof![Just("/"), Just("\\"), Just("..")]) {
            let name = format!("{}{}{}", prefix, sep, suffix);
            prop_assert!(validate_service_name(&name).is_err());
        }
    }
}
