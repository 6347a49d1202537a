use std::fmt::{Debug, Formatter};
use std::path::Path;

use anyhow::Context;
use rand::seq::SliceRandom;
use serde::Deserialize;

/// A username and password for the identity provider.
#[derive(Clone, Deserialize, PartialEq)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Debug for Credential {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// The users that a run can log in as, read from a JSON file of the form
/// `{"users": [{"username": "...", "password": "..."}]}`.
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialPool {
    users: Vec<Credential>,
}

impl CredentialPool {
    pub fn new(users: Vec<Credential>) -> anyhow::Result<Self> {
        if users.is_empty() {
            anyhow::bail!("The credential pool is empty");
        }

        Ok(Self { users })
    }

    pub fn from_json_str(s: &str) -> anyhow::Result<Self> {
        let pool: CredentialPool = serde_json::from_str(s).context("Invalid credentials file")?;
        Self::new(pool.users)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read credentials from {}", path.display()))?;
        Self::from_json_str(&content)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Pick one credential uniformly at random.
    pub fn choose(&self) -> Option<&Credential> {
        self.users.choose(&mut rand::thread_rng())
    }
}
