use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Random bytes behind a freshly generated token; 16 bytes gives the
/// 128 bits of entropy the session catalogue requires.
const TOKEN_ENTROPY_BYTES: usize = 16;

/// An opaque, URL-safe preview session token.
///
/// The token doubles as a bearer credential, so `Debug` only ever
/// prints a short prefix. Use [`SessionToken::as_str`] where the full
/// value is genuinely needed (URLs, database keys).
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_ENTROPY_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        SessionToken(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionToken {
    fn from(value: String) -> Self {
        SessionToken(value)
    }
}

impl std::fmt::Display for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix: String = self.0.chars().take(6).collect();
        write!(f, "SessionToken({prefix}..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_are_unique_and_url_safe() {
        let a = SessionToken::generate();
        let b = SessionToken::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), TOKEN_ENTROPY_BYTES * 2);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn debug_redacts_token() {
        let token = SessionToken::from("deadbeefdeadbeefdeadbeefdeadbeef".to_owned());
        let debug = format!("{token:?}");
        assert!(!debug.contains("deadbeefdeadbeefdeadbeefdeadbeef"));
        assert!(debug.contains("deadbe"));
    }
}
