//! Token bookkeeping.
//!
//! The WebSocket auth token is replaced wholesale on renewal, regeneration and
//! heartbeat rotation. Those fetches run concurrently, so [`TokenCell`] stamps
//! each with a request id and refuses answers older than the last one
//! adopted. [`TokenStore`] is where tokens persist between sessions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tracing::debug;

use crate::error::Result;

/// Store key of the WebSocket token.
pub const WS_TOKEN_KEY: &str = "wsToken";

/// Store key of the long-lived user credential used to regenerate tokens.
pub const USER_TOKEN_KEY: &str = "userToken";

/// Result of [`TokenCell::adopt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adoption {
    /// The token was replaced.
    Adopted,
    /// Same token as the current one; nothing changed.
    Unchanged,
    /// A newer request was already adopted; the answer was discarded.
    Stale,
}

/// The current token plus request sequencing.
#[derive(Debug, Clone, Default)]
pub struct TokenCell {
    token: String,
    issued: u64,
    adopted: u64,
}

impl TokenCell {
    /// Cell holding `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            issued: 0,
            adopted: 0,
        }
    }

    /// The current token (may be empty).
    pub fn get(&self) -> &str {
        &self.token
    }

    /// Id to attach to a fetch that may return a new token.
    pub fn begin_request(&mut self) -> u64 {
        self.issued += 1;
        self.issued
    }

    /// Adopt `token` returned by request `request_id`.
    ///
    /// Empty tokens are treated like [`Adoption::Unchanged`].
    pub fn adopt(&mut self, request_id: u64, token: String) -> Adoption {
        if request_id <= self.adopted {
            debug!(request_id, adopted = self.adopted, "discarding stale token response");
            return Adoption::Stale;
        }
        self.adopted = request_id;
        if token.is_empty() || token == self.token {
            return Adoption::Unchanged;
        }
        self.token = token;
        Adoption::Adopted
    }

    /// Adopt `token` returned by a request that presented `sent_with`.
    ///
    /// An echo of `sent_with` is [`Adoption::Unchanged`]. If the current token
    /// is no longer `sent_with`, the answer rotates a token already replaced
    /// and is [`Adoption::Stale`].
    pub fn adopt_rotation(
        &mut self,
        request_id: u64,
        sent_with: &str,
        token: String,
    ) -> Adoption {
        if token == sent_with {
            return Adoption::Unchanged;
        }
        if sent_with != self.token {
            debug!(request_id, "discarding rotation of a replaced token");
            return Adoption::Stale;
        }
        self.adopt(request_id, token)
    }
}

/// Persistent key/value storage for tokens.
pub trait TokenStore: Send + Sync + 'static {
    /// Value stored under `key`, if any.
    fn load(&self, key: &str) -> Option<String>;

    /// Store `value` under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the value could not be persisted.
    fn save(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the removal could not be persisted.
    fn remove(&self, key: &str) -> Result<()>;
}

/// Process-local [`TokenStore`].
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryTokenStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `entries`.
    pub fn with_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let values = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            values: Mutex::new(values),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn save(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

/// [`TokenStore`] backed by a JSON object in a file.
///
/// The file is re-read on every access so several processes can share it.
/// A missing file reads as empty.
#[derive(Debug)]
pub struct FileTokenStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileTokenStore {
    /// Store persisting to `path`. The file is created on first save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<HashMap<String, String>> {
        match std::fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => Ok(HashMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn update(&self, apply: impl FnOnce(&mut HashMap<String, String>)) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut values = self.read_all()?;
        apply(&mut values);
        std::fs::write(&self.path, serde_json::to_vec_pretty(&values)?)?;
        Ok(())
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self, key: &str) -> Option<String> {
        match self.read_all() {
            Ok(mut values) => values.remove(key),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "token file unreadable");
                None
            }
        }
    }

    fn save(&self, key: &str, value: &str) -> Result<()> {
        self.update(|values| {
            values.insert(key.to_owned(), value.to_owned());
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.update(|values| {
            values.remove(key);
        })
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn newer_request_wins_over_late_older_one() {
        let mut cell = TokenCell::new("t0");
        let renew = cell.begin_request();
        let heartbeat = cell.begin_request();

        assert_eq!(cell.adopt(heartbeat, "t-heartbeat".into()), Adoption::Adopted);
        assert_eq!(cell.adopt(renew, "t-renew".into()), Adoption::Stale);
        assert_eq!(cell.get(), "t-heartbeat");
    }

    #[test]
    fn same_or_empty_token_is_unchanged() {
        let mut cell = TokenCell::new("t0");
        let id = cell.begin_request();
        assert_eq!(cell.adopt(id, "t0".into()), Adoption::Unchanged);
        let id = cell.begin_request();
        assert_eq!(cell.adopt(id, String::new()), Adoption::Unchanged);
        assert_eq!(cell.get(), "t0");
    }

    #[test]
    fn echo_of_old_token_does_not_undo_renewal() {
        let mut cell = TokenCell::new("t0");
        let renew = cell.begin_request();
        let heartbeat = cell.begin_request();

        assert_eq!(cell.adopt(renew, "t1".into()), Adoption::Adopted);
        assert_eq!(
            cell.adopt_rotation(heartbeat, "t0", "t0".into()),
            Adoption::Unchanged
        );
        assert_eq!(cell.get(), "t1");
    }

    #[test]
    fn rotation_of_replaced_token_is_stale() {
        let mut cell = TokenCell::new("t0");
        let renew = cell.begin_request();
        let heartbeat = cell.begin_request();

        assert_eq!(cell.adopt(renew, "t1".into()), Adoption::Adopted);
        assert_eq!(
            cell.adopt_rotation(heartbeat, "t0", "t9".into()),
            Adoption::Stale
        );
        assert_eq!(cell.get(), "t1");

        let next = cell.begin_request();
        assert_eq!(cell.adopt_rotation(next, "t1", "t2".into()), Adoption::Adopted);
        assert_eq!(cell.get(), "t2");
    }

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryTokenStore::with_entries([(USER_TOKEN_KEY, "user-1")]);
        assert_eq!(store.load(USER_TOKEN_KEY).as_deref(), Some("user-1"));
        assert_eq!(store.load(WS_TOKEN_KEY), None);

        store.save(WS_TOKEN_KEY, "ws-1").unwrap();
        assert_eq!(store.load(WS_TOKEN_KEY).as_deref(), Some("ws-1"));
        store.remove(WS_TOKEN_KEY).unwrap();
        assert_eq!(store.load(WS_TOKEN_KEY), None);
    }

    #[test]
    fn file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");

        let store = FileTokenStore::new(&path);
        assert_eq!(store.load(WS_TOKEN_KEY), None);
        store.save(WS_TOKEN_KEY, "ws-1").unwrap();
        store.save(USER_TOKEN_KEY, "user-1").unwrap();

        let reopened = FileTokenStore::new(&path);
        assert_eq!(reopened.load(WS_TOKEN_KEY).as_deref(), Some("ws-1"));
        reopened.remove(WS_TOKEN_KEY).unwrap();
        assert_eq!(store.load(WS_TOKEN_KEY), None);
        assert_eq!(store.load(USER_TOKEN_KEY).as_deref(), Some("user-1"));
    }

    #[test]
    fn corrupt_file_reads_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        std::fs::write(&path, b"not json").unwrap();

        let store = FileTokenStore::new(&path);
        assert_eq!(store.load(WS_TOKEN_KEY), None);
        assert!(store.save(WS_TOKEN_KEY, "x").is_err());
    }
}
