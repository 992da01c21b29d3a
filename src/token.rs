//! Bootstrap token generation and validation
//!
//! kubeadm bootstrap tokens have the shape `[a-z0-9]{6}.[a-z0-9]{16}`: a
//! public token ID and a secret. The same token is embedded in the
//! control plane's init manifest and every worker's join manifest.

use std::time::Duration;

use rand::Rng;

use crate::{Error, Result};

const TOKEN_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const TOKEN_ID_LEN: usize = 6;
const TOKEN_SECRET_LEN: usize = 16;

/// Default validity window, matching kubeadm's own default
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(24 * 3600);

/// A kubeadm bootstrap token shared by every node of a cluster
#[derive(Clone, PartialEq, Eq)]
pub struct BootstrapToken {
    id: String,
    secret: String,
    ttl: Duration,
}

impl BootstrapToken {
    /// Generate a new random bootstrap token
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut pick = |len: usize| -> String {
            (0..len)
                .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
                .collect()
        };
        let id = pick(TOKEN_ID_LEN);
        let secret = pick(TOKEN_SECRET_LEN);
        Self {
            id,
            secret,
            ttl: DEFAULT_TOKEN_TTL,
        }
    }

    /// Parse a token supplied by the provisioning layer
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let (id, secret) = s.split_once('.').ok_or_else(|| {
            Error::configuration("bootstrapToken", "expected <id>.<secret> format")
        })?;

        let valid = |part: &str, len: usize| {
            part.len() == len
                && part
                    .bytes()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
        };
        if !valid(id, TOKEN_ID_LEN) || !valid(secret, TOKEN_SECRET_LEN) {
            return Err(Error::configuration(
                "bootstrapToken",
                "token must match [a-z0-9]{6}.[a-z0-9]{16}",
            ));
        }

        Ok(Self {
            id: id.to_string(),
            secret: secret.to_string(),
            ttl: DEFAULT_TOKEN_TTL,
        })
    }

    /// Public token ID (safe to log)
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Full token string for embedding in manifests
    pub fn expose(&self) -> String {
        format!("{}.{}", self.id, self.secret)
    }

    /// Validity window in Go duration syntax, as kubeadm expects
    pub fn ttl_string(&self) -> String {
        go_duration(self.ttl)
    }
}

impl std::fmt::Debug for BootstrapToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Don't expose the secret half in debug output
        f.debug_struct("BootstrapToken")
            .field("id", &self.id)
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// Render a duration the way Go's `time.Duration.String` does for whole seconds
pub fn go_duration(d: Duration) -> String {
    let total = d.as_secs();
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{}h{}m{}s", h, m, s)
    } else if m > 0 {
        format!("{}m{}s", m, s)
    } else {
        format!("{}s", s)
    }
}
