//! Property-based tests for manifest parsing and marker naming
//!
//! These tests use proptest to verify invariants across many generated
//! inputs rather than a handful of hand-picked cases.

use proptest::prelude::*;

use piprovision::config::{split_list, Config};
use piprovision::state::{sanitize, StateKey};

// ============================================================================
// List splitting
// ============================================================================

proptest! {
    /// Split elements are trimmed and never blank
    #[test]
    fn split_list_yields_trimmed_non_blank_items(raw in "[a-z ,]{0,40}") {
        for item in split_list(&raw) {
            prop_assert!(!item.is_empty());
            prop_assert_eq!(item.trim(), item.as_str());
            prop_assert!(!item.contains(','));
        }
    }

    /// Joining words with padded commas splits back to the same words
    #[test]
    fn split_list_recovers_words(words in prop::collection::vec("[a-z0-9]{1,8}", 0..6)) {
        let raw = words.join(" , ");
        prop_assert_eq!(split_list(&raw), words);
    }
}

// ============================================================================
// Boolean values
// ============================================================================

proptest! {
    /// Only the literal `true` is truthy, quoted or not
    #[test]
    fn get_bool_only_accepts_literal_true(value in "[A-Za-z0-9]{1,6}", quoted in any::<bool>()) {
        let yaml = if quoted {
            format!("flag: \"{}\"\n", value)
        } else {
            format!("flag: {}\n", value)
        };
        let config = Config::from_yaml(&yaml).unwrap();
        prop_assert_eq!(config.get_bool("flag"), value == "true");
    }

    /// Unquoted scalars read back exactly as written
    #[test]
    fn unquoted_scalars_keep_authored_text(value in "[A-Za-z0-9][A-Za-z0-9.]{0,11}") {
        prop_assume!(!matches!(value.as_str(), "null" | "Null" | "NULL"));
        let config = Config::from_yaml(&format!("secret: {}\n", value)).unwrap();
        prop_assert_eq!(config.get("secret", ""), value);
    }
}

// ============================================================================
// Marker names
// ============================================================================

proptest! {
    /// Sanitized names are non-empty and filesystem safe
    #[test]
    fn sanitize_produces_safe_names(raw in ".{0,32}") {
        let name = sanitize(&raw);
        prop_assert!(!name.is_empty());
        prop_assert!(name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'));
        prop_assert!(!name.contains('/'));
    }

    /// Sanitizing is idempotent
    #[test]
    fn sanitize_is_idempotent(raw in ".{0,32}") {
        let once = sanitize(&raw);
        prop_assert_eq!(sanitize(&once), once);
    }

    /// Distinct services of the same unit never share a marker file
    #[test]
    fn sub_markers_differ_from_unit_marker(service in "[a-z]{1,12}") {
        let unit = StateKey::unit("printing").file_name();
        let sub = StateKey::sub("printing", &service).file_name();
        prop_assert_ne!(unit, sub);
    }
}
