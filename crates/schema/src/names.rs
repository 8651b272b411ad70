//! Canonical identifier handling. Every table and column name that enters a
//! schema passes through `normalize_identifier`, so the rest of the system can
//! assume destination-safe snake_case names.

use crate::SchemaError;
use lazy_static::lazy_static;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

/// Separator between nested keys in a flattened column path, e.g.
/// `address__city`.
pub const PATH_SEPARATOR: &str = "__";

/// Identifier cap of the most restrictive supported destination. Longer paths
/// are truncated with a deterministic digest suffix.
pub const DEFAULT_MAX_IDENTIFIER_LENGTH: usize = 127;

lazy_static! {
    /// A fully-normalized identifier: snake_case ASCII, no leading digit.
    pub static ref RE_NORMALIZED_IDENT: Regex = Regex::new(r"^[a-z_][a-z0-9_]*$").unwrap();
    /// A normalized schema name: like an identifier but with no underscores,
    /// so it never collides with the dot-delimited staged-file grammar.
    /// A leading digit is harmless here because schema names are delimited
    /// by dots, never parsed as numbers.
    pub static ref RE_SCHEMA_NAME: Regex = Regex::new(r"^[a-z0-9]+$").unwrap();
}

/// Folds `name` to a destination-safe identifier: NFKD ASCII fold, lowercase,
/// non `[a-z0-9_]` replaced with `_`, runs of `_` collapsed, and a `_` prefix
/// when the result would start with a digit.
pub fn normalize_identifier(name: &str) -> Result<String, SchemaError> {
    let mut folded = String::with_capacity(name.len());
    for c in name.nfkd() {
        if c.is_ascii_alphanumeric() || c == '_' {
            folded.push(c.to_ascii_lowercase());
        } else if c.is_ascii() {
            folded.push('_');
        }
        // Non-ASCII residue of the fold (combining marks and untransliterable
        // symbols) is dropped rather than padded with underscores.
    }

    let mut out = String::with_capacity(folded.len());
    for c in folded.chars() {
        if c == '_' && out.ends_with('_') {
            continue;
        }
        out.push(c);
    }
    if out.chars().next().map_or(false, |c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    if out.is_empty() || out == "_" && name != "_" {
        return Err(SchemaError::InvalidName(name.to_string()));
    }
    Ok(out)
}

/// Normalizes a schema name. Schema names additionally drop underscores and
/// the empty string is allowed: it is the one spelling of "no schema" that the
/// staged-file grammar can carry.
pub fn normalize_schema_name(name: &str) -> Result<String, SchemaError> {
    if name.is_empty() {
        return Ok(String::new());
    }
    let normalized = normalize_identifier(name)?.replace('_', "");
    if normalized.is_empty() {
        return Err(SchemaError::InvalidName(name.to_string()));
    }
    Ok(normalized)
}

/// Joins a flattened path prefix with one more normalized key.
pub fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}{}{}", prefix, PATH_SEPARATOR, key)
    }
}

/// Caps `name` at `max_length` characters, replacing the tail with an 8-hex
/// digest of the full name so that distinct long paths stay distinct.
pub fn shorten_identifier(name: &str, max_length: usize) -> String {
    if name.len() <= max_length {
        return name.to_string();
    }
    let digest = format!("{:x}", md5::compute(name.as_bytes()));
    let keep = max_length.saturating_sub(9);
    format!("{}_{}", &name[..keep], &digest[..8])
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn identifiers_fold_to_snake_case() {
        assert_eq!("foo_bar_", normalize_identifier("Foo Bar!").unwrap());
        assert_eq!("_x", normalize_identifier("__x").unwrap());
        assert_eq!("_1column", normalize_identifier("1column").unwrap());
        assert_eq!("acl", normalize_identifier("ąćł").unwrap());
        assert_eq!("event_value", normalize_identifier("event.value").unwrap());
    }

    #[test]
    fn empty_identifiers_are_rejected() {
        assert!(normalize_identifier("").is_err());
        assert!(normalize_identifier("!!!").is_err());
    }

    #[test]
    fn schema_names_drop_underscores() {
        assert_eq!("myevents", normalize_schema_name("my_events").unwrap());
        assert_eq!("", normalize_schema_name("").unwrap());
        assert!(RE_SCHEMA_NAME.is_match("myevents"));
        assert!(!RE_SCHEMA_NAME.is_match("my_events"));
    }

    #[test]
    fn long_paths_shorten_deterministically() {
        let long = "a".repeat(300);
        let short = shorten_identifier(&long, 127);
        assert_eq!(127, short.len());
        assert_eq!(short, shorten_identifier(&long, 127));

        let other = format!("{}b", "a".repeat(299));
        assert_ne!(short, shorten_identifier(&other, 127));
    }

    #[test]
    fn short_paths_are_untouched() {
        assert_eq!("col", shorten_identifier("col", 127));
    }
}
