//! Credential source for per-target connection strings.
//!
//! Credentials are loaded once at startup and shared by every exporter the
//! proxy constructs. The password never appears in `Debug` output.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::load_config;
use crate::error::{Error, Result};

/// Username/password pair combined with a target address to form a
/// connection string.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Database user.
    pub username: String,

    /// Database password.
    #[serde(default)]
    pub password: String,
}

impl Credentials {
    /// Create a credential pair.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Load a standalone credentials file (JSON5, `{ username, password }`).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let credentials: Credentials = load_config(path)?;
        credentials.validate()?;
        Ok(credentials)
    }

    /// Reject credentials that could never authenticate.
    pub fn validate(&self) -> Result<()> {
        if self.username.trim().is_empty() {
            return Err(Error::Config(
                "credentials.username must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}
