//! Bearer token authentication for the event gateway
//!
//! Tokens are held only as SHA-256 digests and map to the user id that owns
//! every conversation and prediction created over the connection.

use sha2::{Digest, Sha256};
use std::collections::HashMap;

type TokenDigest = [u8; 32];

#[derive(Debug, Default, Clone)]
pub struct TokenAuthenticator {
    users: HashMap<TokenDigest, String>,
}

impl TokenAuthenticator {
    /// Build from `(user_id, token)` pairs
    pub fn new<I, U, T>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (U, T)>,
        U: Into<String>,
        T: AsRef<str>,
    {
        let users = pairs
            .into_iter()
            .map(|(user, token)| (digest(token.as_ref()), user.into()))
            .collect();
        Self { users }
    }

    /// The user a token belongs to, if any
    pub fn authenticate(&self, token: &str) -> Option<&str> {
        let token = token.trim();
        if token.is_empty() {
            return None;
        }
        self.users.get(&digest(token)).map(String::as_str)
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

fn digest(token: &str) -> TokenDigest {
    Sha256::digest(token.as_bytes()).into()
}
