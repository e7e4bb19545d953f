//! Session tokens never reach the database as identifiers; they are
//! mapped to schema names through a one-way derivation so that a token
//! can be re-derived to the same schema but a schema name cannot leak
//! the token back out.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use utils::token::SessionToken;

/// Schema names must satisfy this shape before they are ever spliced
/// into DDL. The check runs at derivation time and again immediately
/// before every raw statement composition.
static SCHEMA_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^preview_[A-Za-z0-9_]{1,54}$").expect("static regex must compile"));

/// Hex characters of the token digest kept in the schema name.
const SCHEMA_SUFFIX_LEN: usize = 24;

/// A validated `preview_*` schema identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SchemaName(String);

#[derive(Debug, thiserror::Error)]
#[error("invalid preview schema name: {0:?}")]
pub struct InvalidSchemaName(pub String);

impl SchemaName {
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidSchemaName> {
        let name = name.into();
        if SCHEMA_NAME_RE.is_match(&name) {
            Ok(SchemaName(name))
        } else {
            Err(InvalidSchemaName(name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SchemaName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SchemaName {
    type Error = InvalidSchemaName;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        SchemaName::new(value)
    }
}

impl From<SchemaName> for String {
    fn from(value: SchemaName) -> String {
        value.0
    }
}

/// Pure derivation from token to schema name. The output alphabet is
/// lowercase hex, so the result always passes the schema-name check.
pub fn schema_name_for_token(token: &SessionToken) -> SchemaName {
    let digest = Sha256::digest(token.as_str().as_bytes());
    let hex = hex::encode(digest);
    SchemaName(format!("preview_{}", &hex[..SCHEMA_SUFFIX_LEN]))
}

/// Standalone validity check for names that arrive over the wire or
/// from `pg_namespace` listings.
pub fn is_valid_schema_name(name: &str) -> bool {
    SCHEMA_NAME_RE.is_match(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_pure() {
        let token = SessionToken::from("3b1f8a9f4f2c4d21a0e7".to_owned());
        let a = schema_name_for_token(&token);
        let b = schema_name_for_token(&token);
        assert_eq!(a, b);
        assert!(is_valid_schema_name(a.as_str()));
    }

    #[test]
    fn distinct_tokens_get_distinct_schemas() {
        let a = schema_name_for_token(&SessionToken::from("token-a".to_owned()));
        let b = schema_name_for_token(&SessionToken::from("token-b".to_owned()));
        assert_ne!(a, b);
    }

    #[test]
    fn derived_names_are_injection_safe() {
        // Tokens are caller-supplied on the resolve path; even hostile
        // input must hash down to the constrained alphabet.
        let hostile = SessionToken::from("x\"; DROP SCHEMA public CASCADE; --".to_owned());
        let name = schema_name_for_token(&hostile);
        assert!(is_valid_schema_name(name.as_str()));
        assert!(name.as_str().starts_with("preview_"));
    }

    #[test]
    fn rejects_malformed_names() {
        for bad in [
            "preview_",
            "preview_has-dash",
            "preview_has.dot",
            "other_abc",
            "preview_abc; DROP TABLE x",
            &format!("preview_{}", "a".repeat(55)),
        ] {
            assert!(!is_valid_schema_name(bad), "accepted {bad:?}");
            assert!(SchemaName::new(bad.to_owned()).is_err());
        }
        assert!(is_valid_schema_name(&format!("preview_{}", "a".repeat(54))));
    }

    #[test]
    fn serde_rejects_malformed_names() {
        let ok: Result<SchemaName, _> = serde_json::from_str("\"preview_ab12cd\"");
        assert!(ok.is_ok());
        let bad: Result<SchemaName, _> = serde_json::from_str("\"public\"");
        assert!(bad.is_err());
    }
}
