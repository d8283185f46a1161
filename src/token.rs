//! One-time distribution tokens
//!
//! A token is minted for every node a distribution reaches and persisted as
//! `<tokens_dir>/<random_hash>`. The node later presents it once, as
//! `Authorization: Token <random_hash>`, to get its CSR signed. Consuming a
//! token deletes its file, so a token is never accepted twice; tokens older
//! than the configured lifetime are refused and removed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{BootError, Result};
use crate::persist;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Token {
    pub random_hash: String,
    pub created_at: DateTime<Utc>,
}

impl Token {
    /// Mint a token whose hash is `id_len + secret_len` random alphanumerics.
    pub fn generate(id_len: usize, secret_len: usize) -> Self {
        let random_hash = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(id_len + secret_len)
            .map(char::from)
            .collect();
        Self {
            random_hash,
            created_at: Utc::now(),
        }
    }

    /// Leading `id_len` characters, safe to log.
    pub fn id(&self, id_len: usize) -> &str {
        let end = id_len.min(self.random_hash.len());
        &self.random_hash[..end]
    }
}

#[derive(Debug, Clone)]
pub struct TokenStore {
    dir: PathBuf,
    id_len: usize,
    secret_len: usize,
    ttl: Option<Duration>,
}

impl TokenStore {
    pub fn new(dir: impl Into<PathBuf>, id_len: usize, secret_len: usize, ttl: Option<Duration>) -> Self {
        Self {
            dir: dir.into(),
            id_len,
            secret_len,
            ttl,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Mint a fresh token and persist it.
    ///
    /// With a lifetime configured, expired records are swept first.
    pub fn mint(&self) -> Result<Token> {
        persist::ensure_dir(&self.dir)?;
        if self.ttl.is_some() {
            self.purge_expired()?;
        }
        let token = Token::generate(self.id_len, self.secret_len);
        let contents = serde_json::to_vec(&token)
            .map_err(|e| BootError::io("Failed to encode token", std::io::Error::other(e)))?;
        persist::create_new_owner_only(&self.path_for(&token.random_hash), &contents)?;
        debug!("Minted token {}...", token.id(self.id_len));
        Ok(token)
    }

    /// Redeem `random_hash`, deleting it so it cannot be presented again.
    ///
    /// Returns `Ok(false)` when the token is unknown, already used, expired
    /// or malformed.
    pub fn consume(&self, random_hash: &str) -> Result<bool> {
        if !is_well_formed(random_hash) {
            warn!("Rejecting malformed token");
            return Ok(false);
        }
        let path = self.path_for(random_hash);
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(BootError::io(format!("Failed to read {}", path.display()), e)),
        };
        // Whoever removes the file owns the token; a concurrent redeemer
        // sees NotFound.
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(BootError::io(format!("Failed to remove {}", path.display()), e)),
        }

        let token: Token = match serde_json::from_slice(&raw) {
            Ok(token) => token,
            Err(e) => {
                warn!("Discarding unreadable token record: {}", e);
                return Ok(false);
            }
        };
        if token.random_hash != random_hash {
            return Ok(false);
        }
        if self.ttl.is_some_and(|ttl| is_expired(&token, ttl)) {
            warn!("Token {}... expired", token.id(self.id_len));
            return Ok(false);
        }
        debug!("Consumed token {}...", token.id(self.id_len));
        Ok(true)
    }

    /// Delete every record older than the token lifetime, returning how
    /// many were removed. Unreadable records are removed as well.
    pub fn purge_expired(&self) -> Result<usize> {
        let Some(ttl) = self.ttl else {
            return Ok(0);
        };
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(BootError::io(format!("Failed to list {}", self.dir.display()), e)),
        };

        let mut purged = 0;
        for entry in entries {
            let path = entry
                .map_err(|e| BootError::io(format!("Failed to list {}", self.dir.display()), e))?
                .path();
            let stale = match std::fs::read(&path) {
                Ok(raw) => serde_json::from_slice::<Token>(&raw)
                    .map(|token| is_expired(&token, ttl))
                    .unwrap_or(true),
                // Consumed concurrently.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
                Err(e) => return Err(BootError::io(format!("Failed to read {}", path.display()), e)),
            };
            if !stale {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => purged += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(BootError::io(format!("Failed to remove {}", path.display()), e)),
            }
        }
        if purged > 0 {
            debug!("Purged {} expired token(s)", purged);
        }
        Ok(purged)
    }

    fn path_for(&self, random_hash: &str) -> PathBuf {
        self.dir.join(random_hash)
    }
}

fn is_expired(token: &Token, ttl: Duration) -> bool {
    Utc::now()
        .signed_duration_since(token.created_at)
        .to_std()
        .map(|age| age > ttl)
        .unwrap_or(false)
}

/// Tokens are plain alphanumerics; anything else could escape the directory.
fn is_well_formed(random_hash: &str) -> bool {
    !random_hash.is_empty() && random_hash.chars().all(|c| c.is_ascii_alphanumeric())
}
