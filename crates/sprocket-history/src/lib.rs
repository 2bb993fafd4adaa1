//! Sprocket History
//!
//! Per-user result history: a fixed-capacity ring buffer of artifact
//! reference sets, lazily loaded from and best-effort persisted to the
//! key-value store. History is a convenience cache; persistence failures
//! are logged, never surfaced to the enclosing command.

pub mod ring;

pub use ring::{RingBuffer, RingError};

use regex::Regex;
use sprocket_storage::KvStore;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

pub const DEFAULT_HISTORY_CAPACITY: usize = 16;

const HISTORY_NAMESPACE: &str = "history";

/// Artifact references produced by one invocation.
pub type ResultSet = Vec<String>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HistoryKey {
    pub tenant: String,
    pub user: String,
}

impl HistoryKey {
    pub fn new(tenant: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            user: user.into(),
        }
    }

    fn storage_key(&self) -> String {
        format!("{}+{}$", self.tenant, self.user)
    }
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("failed to resolve reference token \"{0}\"")]
    UnresolvedReference(String),
}

type SharedBuffer = Arc<Mutex<RingBuffer<ResultSet>>>;

pub struct HistoryStore {
    kv: Arc<Mutex<KvStore>>,
    template: RingBuffer<ResultSet>,
    buffers: Mutex<HashMap<HistoryKey, SharedBuffer>>,
}

impl HistoryStore {
    pub fn new(kv: Arc<Mutex<KvStore>>, capacity: usize) -> Result<Self, RingError> {
        Ok(Self {
            kv,
            template: RingBuffer::new(capacity)?,
            buffers: Mutex::new(HashMap::new()),
        })
    }

    pub fn capacity(&self) -> usize {
        self.template.capacity()
    }

    /// Record the artifact references of one invocation. Empty sets are
    /// ignored. The in-memory push completes before this returns; the
    /// snapshot write runs as a detached task whose failure is only
    /// observable via logs. The returned handle may be dropped by callers
    /// that outlive the write, or awaited by short-lived ones.
    pub async fn record_result_set(
        &self,
        key: &HistoryKey,
        refs: ResultSet,
    ) -> tokio::task::JoinHandle<()> {
        if refs.is_empty() {
            return tokio::spawn(async {});
        }
        let buffer = self.buffer_for(key).await;
        let snapshot = {
            let mut guard = buffer.lock().await;
            guard.push(refs);
            guard.to_vec()
        };

        let kv = self.kv.clone();
        let storage_key = key.storage_key();
        tokio::spawn(async move {
            // Best-effort cache write. Never surfaces to the invocation.
            let payload = match serde_json::to_vec(&snapshot) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("failed to encode history snapshot for {}: {}", storage_key, e);
                    return;
                }
            };
            let store = kv.lock().await;
            if let Err(e) = store.put(HISTORY_NAMESPACE, &storage_key, &payload) {
                warn!("failed to persist history snapshot for {}: {}", storage_key, e);
            }
        })
    }

    /// The result set recorded `offset` invocations ago, or `None` when the
    /// key has no history or the offset is out of range.
    pub async fn resolve_last(&self, key: &HistoryKey, offset: usize) -> Option<ResultSet> {
        let buffer = self.buffer_for(key).await;
        let guard = buffer.lock().await;
        guard.last(offset).cloned()
    }

    /// All recorded result sets for the key, oldest to newest.
    pub async fn chronological(&self, key: &HistoryKey) -> Vec<ResultSet> {
        let buffer = self.buffer_for(key).await;
        let guard = buffer.lock().await;
        guard.to_vec()
    }

    async fn buffer_for(&self, key: &HistoryKey) -> SharedBuffer {
        let mut buffers = self.buffers.lock().await;
        if let Some(buffer) = buffers.get(key) {
            return buffer.clone();
        }
        let buffer = Arc::new(Mutex::new(self.load_snapshot(key).await));
        buffers.insert(key.clone(), buffer.clone());
        buffer
    }

    async fn load_snapshot(&self, key: &HistoryKey) -> RingBuffer<ResultSet> {
        let storage_key = key.storage_key();
        let stored = {
            let kv = self.kv.lock().await;
            kv.get(HISTORY_NAMESPACE, &storage_key)
        };
        let seed: Vec<ResultSet> = match stored {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(seed) => seed,
                Err(e) => {
                    warn!("malformed history snapshot for {}: {}", storage_key, e);
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("failed to load history snapshot for {}: {}", storage_key, e);
                Vec::new()
            }
        };
        RingBuffer::with_seed(self.template.capacity(), seed)
            .unwrap_or_else(|_| self.template.clone())
    }
}

fn last_token_regex() -> &'static Regex {
    static LAST_TOKEN: OnceLock<Regex> = OnceLock::new();
    LAST_TOKEN.get_or_init(|| Regex::new(r"^\$LAST([-~]([0-9]+))?$").expect("valid regex"))
}

/// Parse a `$LAST`, `$LAST-<n>` or `$LAST~<n>` token (case-insensitive)
/// into a lookback offset. Anything else is not a reference token.
pub fn parse_last_token(token: &str) -> Option<usize> {
    let upper = token.to_uppercase();
    let captures = last_token_regex().captures(&upper)?;
    match captures.get(2) {
        // The capture is all digits, so parse can only fail on overflow;
        // saturate to an offset no history can satisfy.
        Some(digits) => Some(digits.as_str().parse().unwrap_or(usize::MAX)),
        None => Some(0),
    }
}

/// Expand reference tokens in a raw input list against the user's history.
/// Non-token inputs pass through unchanged; an unresolvable token fails the
/// whole expansion rather than proceeding with partial inputs.
pub async fn expand_references(
    store: &HistoryStore,
    key: &HistoryKey,
    raw_inputs: &[String],
) -> Result<Vec<String>, HistoryError> {
    let mut resolved = Vec::new();
    for input in raw_inputs {
        match parse_last_token(input) {
            Some(offset) => {
                let refs = store
                    .resolve_last(key, offset)
                    .await
                    .ok_or_else(|| HistoryError::UnresolvedReference(input.clone()))?;
                resolved.extend(refs);
            }
            None => resolved.push(input.clone()),
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_db_path(name: &str) -> std::path::PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("sprocket-history-{}-{}.db", name, ts))
    }

    fn open_kv(path: &std::path::Path) -> Arc<Mutex<KvStore>> {
        Arc::new(Mutex::new(KvStore::open(path).expect("open kv")))
    }

    #[tokio::test]
    async fn record_then_resolve_in_process() {
        let path = temp_db_path("record");
        let store = HistoryStore::new(open_kv(&path), 16).expect("store");
        let key = HistoryKey::new("guild-1", "user-1");

        let _ = store
            .record_result_set(&key, vec!["https://example.test/a.png".to_string()])
            .await;

        let resolved = store.resolve_last(&key, 0).await.expect("resolved");
        assert_eq!(resolved, vec!["https://example.test/a.png".to_string()]);
        assert_eq!(store.resolve_last(&key, 1).await, None);
    }

    #[tokio::test]
    async fn empty_result_sets_are_not_recorded() {
        let path = temp_db_path("empty");
        let store = HistoryStore::new(open_kv(&path), 16).expect("store");
        let key = HistoryKey::new("g", "u");

        let _ = store.record_result_set(&key, Vec::new()).await;
        assert_eq!(store.resolve_last(&key, 0).await, None);
    }

    #[tokio::test]
    async fn capacity_sixteen_lookback_scenario() {
        let path = temp_db_path("scenario");
        let store = HistoryStore::new(open_kv(&path), 16).expect("store");
        let key = HistoryKey::new("g", "u");

        for n in 1..=20 {
            let _ = store.record_result_set(&key, vec![format!("R{}", n)]).await;
        }

        assert_eq!(store.resolve_last(&key, 0).await, Some(vec!["R20".to_string()]));
        assert_eq!(store.resolve_last(&key, 15).await, Some(vec!["R5".to_string()]));
        assert_eq!(store.resolve_last(&key, 16).await, None);
    }

    #[tokio::test]
    async fn history_survives_restart() {
        let path = temp_db_path("restart");
        let key = HistoryKey::new("guild-1", "user-1");
        {
            let store = HistoryStore::new(open_kv(&path), 16).expect("store");
            let persisted = store
                .record_result_set(&key, vec!["kept-across-restart".to_string()])
                .await;
            persisted.await.expect("persist task");
        }

        let store = HistoryStore::new(open_kv(&path), 16).expect("fresh store");
        assert_eq!(
            store.resolve_last(&key, 0).await,
            Some(vec!["kept-across-restart".to_string()])
        );
    }

    #[tokio::test]
    async fn malformed_snapshot_yields_fresh_buffer() {
        let path = temp_db_path("malformed");
        let key = HistoryKey::new("g", "u");
        let kv = open_kv(&path);
        {
            let store = kv.lock().await;
            store
                .put(HISTORY_NAMESPACE, &key.storage_key(), b"not json")
                .expect("put");
        }

        let store = HistoryStore::new(kv, 16).expect("store");
        assert_eq!(store.resolve_last(&key, 0).await, None);
    }

    #[tokio::test]
    async fn keys_are_isolated() {
        let path = temp_db_path("isolated");
        let store = HistoryStore::new(open_kv(&path), 16).expect("store");
        let alice = HistoryKey::new("g", "alice");
        let bob = HistoryKey::new("g", "bob");

        let _ = store.record_result_set(&alice, vec!["a".to_string()]).await;
        assert_eq!(store.resolve_last(&bob, 0).await, None);
    }

    #[test]
    fn zero_capacity_store_is_rejected() {
        let path = temp_db_path("zero");
        let kv = Arc::new(Mutex::new(KvStore::open(&path).expect("open kv")));
        assert!(HistoryStore::new(kv, 0).is_err());
    }

    #[test]
    fn last_token_parsing() {
        assert_eq!(parse_last_token("$LAST"), Some(0));
        assert_eq!(parse_last_token("$last"), Some(0));
        assert_eq!(parse_last_token("$LAST-3"), Some(3));
        assert_eq!(parse_last_token("$last~2"), Some(2));
        assert_eq!(
            parse_last_token("$LAST-99999999999999999999"),
            Some(usize::MAX)
        );
        assert_eq!(parse_last_token("LAST"), None);
        assert_eq!(parse_last_token("$LAST-"), None);
        assert_eq!(parse_last_token("$LASTING"), None);
        assert_eq!(parse_last_token("https://example.test/a.png"), None);
    }

    #[tokio::test]
    async fn expand_references_mixes_tokens_and_urls() {
        let path = temp_db_path("expand");
        let store = HistoryStore::new(open_kv(&path), 16).expect("store");
        let key = HistoryKey::new("g", "u");

        let _ = store
            .record_result_set(&key, vec!["old-1".to_string(), "old-2".to_string()])
            .await;

        let inputs = vec!["https://example.test/new.png".to_string(), "$LAST".to_string()];
        let expanded = expand_references(&store, &key, &inputs).await.expect("expand");
        assert_eq!(
            expanded,
            vec![
                "https://example.test/new.png".to_string(),
                "old-1".to_string(),
                "old-2".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn unresolved_token_fails_the_whole_expansion() {
        let path = temp_db_path("unresolved");
        let store = HistoryStore::new(open_kv(&path), 16).expect("store");
        let key = HistoryKey::new("g", "u");

        let inputs = vec!["$LAST-5".to_string()];
        let result = expand_references(&store, &key, &inputs).await;
        assert!(matches!(result, Err(HistoryError::UnresolvedReference(_))));
    }

    #[tokio::test]
    async fn overflowing_offset_is_unresolved_not_a_literal_input() {
        let path = temp_db_path("overflow");
        let store = HistoryStore::new(open_kv(&path), 16).expect("store");
        let key = HistoryKey::new("g", "u");
        let _ = store.record_result_set(&key, vec!["r".to_string()]).await;

        let inputs = vec!["$LAST-99999999999999999999".to_string()];
        let result = expand_references(&store, &key, &inputs).await;
        assert!(matches!(result, Err(HistoryError::UnresolvedReference(_))));
    }
}
