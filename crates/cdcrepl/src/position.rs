//! # Replication position tracking
//!
//! A [`Gtid`] is MariaDB's `domain-server-sequence` triple. The last fully
//! applied GTID is persisted by a [`PositionStore`] and read back when the
//! replicator (re)connects.
//!
//! ## Durability
//!
//! [`FilePositionStore::save`] writes `position.json.tmp`, fsyncs it, renames
//! it over `position.json` and fsyncs the directory. A crash after `save`
//! returns cannot lose the position.
//!
//! ```ignore
//! let store = FilePositionStore::open("/var/lib/cdcrepl").await?;
//! let start = store.load_or(Some(&"0-3000-1".parse()?)).await?;
//! ```

use crate::error::StoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// MariaDB global transaction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Gtid {
    pub domain: u32,
    pub server_id: u32,
    pub sequence: u64,
}

impl Gtid {
    pub const fn new(domain: u32, server_id: u32, sequence: u64) -> Self {
        Self {
            domain,
            server_id,
            sequence,
        }
    }

    /// True when both ids share a domain and `self` is strictly later.
    pub fn dominates(&self, other: &Gtid) -> bool {
        self.domain == other.domain && self.sequence > other.sequence
    }
}

/// GTIDs are ordered by sequence within a domain; different domains are
/// incomparable.
impl PartialOrd for Gtid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.domain != other.domain {
            return None;
        }
        match self.sequence.cmp(&other.sequence) {
            Ordering::Equal => (self.server_id == other.server_id).then_some(Ordering::Equal),
            ord => Some(ord),
        }
    }
}

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.domain, self.server_id, self.sequence)
    }
}

/// Error returned when parsing a GTID string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid GTID '{0}': expected <domain>-<server_id>-<sequence>")]
pub struct ParseGtidError(pub String);

impl FromStr for Gtid {
    type Err = ParseGtidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseGtidError(s.to_string());
        let mut parts = s.trim().splitn(3, '-');
        let domain = parts.next().and_then(|p| p.parse().ok()).ok_or_else(err)?;
        let server_id = parts.next().and_then(|p| p.parse().ok()).ok_or_else(err)?;
        let sequence = parts.next().and_then(|p| p.parse().ok()).ok_or_else(err)?;
        Ok(Self::new(domain, server_id, sequence))
    }
}

impl TryFrom<String> for Gtid {
    type Error = ParseGtidError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Gtid> for String {
    fn from(gtid: Gtid) -> Self {
        gtid.to_string()
    }
}

/// Durable storage of the last applied position.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Last saved position, `None` on first run.
    async fn load(&self) -> Result<Option<Gtid>, StoreError>;

    /// Persist `position`. Must be durable before returning `Ok`.
    async fn save(&self, position: &Gtid) -> Result<(), StoreError>;

    /// Stored position, else `default`, else [`StoreError::NoCheckpoint`].
    async fn load_or(&self, default: Option<&Gtid>) -> Result<Gtid, StoreError> {
        match self.load().await? {
            Some(stored) => Ok(stored),
            None => default.copied().ok_or(StoreError::NoCheckpoint),
        }
    }
}

/// Rejects saves that would move backwards within a domain.
/// Returns `false` when `next` equals what is stored and nothing must be written.
fn check_advance(stored: Option<&Gtid>, next: &Gtid) -> Result<bool, StoreError> {
    match stored {
        Some(stored) if stored == next => Ok(false),
        Some(stored) if stored.dominates(next) => Err(StoreError::Regression {
            stored: *stored,
            attempted: *next,
        }),
        _ => Ok(true),
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PositionDocument {
    gtid: Gtid,
    updated_at: u64,
}

fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Position store backed by a JSON file in a state directory.
pub struct FilePositionStore {
    path: PathBuf,
    dir: PathBuf,
    /// Last value known to be on disk; also serializes writers.
    current: Mutex<Option<Gtid>>,
}

impl FilePositionStore {
    pub const FILE_NAME: &'static str = "position.json";

    /// Open (creating if needed) the state directory and read any stored position.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        let path = dir.join(Self::FILE_NAME);
        let current = read_document(&path).await?;
        if let Some(gtid) = &current {
            info!("Loaded stored position {} from {}", gtid, path.display());
        }
        Ok(Self {
            path,
            dir,
            current: Mutex::new(current),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

async fn read_document(path: &Path) -> Result<Option<Gtid>, StoreError> {
    let contents = match fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let doc: PositionDocument =
        serde_json::from_str(&contents).map_err(|e| StoreError::Format(e.to_string()))?;
    Ok(Some(doc.gtid))
}

#[async_trait]
impl PositionStore for FilePositionStore {
    async fn load(&self) -> Result<Option<Gtid>, StoreError> {
        Ok(*self.current.lock().await)
    }

    async fn save(&self, position: &Gtid) -> Result<(), StoreError> {
        let mut current = self.current.lock().await;
        if !check_advance(current.as_ref(), position)? {
            return Ok(());
        }

        let doc = PositionDocument {
            gtid: *position,
            updated_at: current_timestamp(),
        };
        let json =
            serde_json::to_string_pretty(&doc).map_err(|e| StoreError::Format(e.to_string()))?;

        let temp_path = self.path.with_extension("json.tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &self.path).await?;
        sync_dir(&self.dir).await?;

        *current = Some(*position);
        debug!(gtid = %position, "Saved position");
        Ok(())
    }
}

/// Makes the rename itself durable.
#[cfg(unix)]
async fn sync_dir(dir: &Path) -> Result<(), StoreError> {
    fs::File::open(dir).await?.sync_all().await?;
    Ok(())
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> Result<(), StoreError> {
    Ok(())
}

/// In-memory position store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryPositionStore {
    current: parking_lot::Mutex<Option<Gtid>>,
    history: parking_lot::Mutex<Vec<Gtid>>,
}

impl MemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_position(gtid: Gtid) -> Self {
        let store = Self::default();
        *store.current.lock() = Some(gtid);
        store
    }

    /// Every position written, in order.
    pub fn history(&self) -> Vec<Gtid> {
        self.history.lock().clone()
    }

    pub fn current(&self) -> Option<Gtid> {
        *self.current.lock()
    }
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn load(&self) -> Result<Option<Gtid>, StoreError> {
        Ok(*self.current.lock())
    }

    async fn save(&self, position: &Gtid) -> Result<(), StoreError> {
        let mut current = self.current.lock();
        if check_advance(current.as_ref(), position)? {
            *current = Some(*position);
            self.history.lock().push(*position);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_gtid_parse_and_display() {
        let gtid: Gtid = "0-3000-42".parse().unwrap();
        assert_eq!(gtid, Gtid::new(0, 3000, 42));
        assert_eq!(gtid.to_string(), "0-3000-42");

        assert!("".parse::<Gtid>().is_err());
        assert!("0-1".parse::<Gtid>().is_err());
        assert!("a-b-c".parse::<Gtid>().is_err());
        assert!("0-1-2-3".parse::<Gtid>().is_err());
        assert!("-1-1-1".parse::<Gtid>().is_err());
    }

    #[test]
    fn test_gtid_ordering() {
        let a = Gtid::new(0, 1, 5);
        let b = Gtid::new(0, 2, 6);
        let other_domain = Gtid::new(1, 1, 100);

        assert!(b > a);
        assert!(b.dominates(&a));
        assert!(!a.dominates(&b));
        assert!(!a.dominates(&a));
        assert_eq!(a.partial_cmp(&other_domain), None);
        assert!(!other_domain.dominates(&a));
    }

    #[test]
    fn test_gtid_serde_as_string() {
        let json = serde_json::to_string(&Gtid::new(2, 7, 9)).unwrap();
        assert_eq!(json, "\"2-7-9\"");
        let back: Gtid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Gtid::new(2, 7, 9));
        assert!(serde_json::from_str::<Gtid>("\"nope\"").is_err());
    }

    #[tokio::test]
    async fn test_file_store_first_run() {
        let dir = tempdir().unwrap();
        let store = FilePositionStore::open(dir.path()).await.unwrap();

        assert_eq!(store.load().await.unwrap(), None);
        assert!(matches!(
            store.load_or(None).await,
            Err(StoreError::NoCheckpoint)
        ));
        let default = Gtid::new(0, 1, 1);
        assert_eq!(store.load_or(Some(&default)).await.unwrap(), default);
    }

    #[tokio::test]
    async fn test_file_store_persists_across_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = FilePositionStore::open(dir.path()).await.unwrap();
            store.save(&Gtid::new(0, 3000, 10)).await.unwrap();
            store.save(&Gtid::new(0, 3000, 11)).await.unwrap();
        }

        let store = FilePositionStore::open(dir.path()).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(Gtid::new(0, 3000, 11)));
        // Stored value beats the configured default
        assert_eq!(
            store.load_or(Some(&Gtid::new(0, 3000, 1))).await.unwrap(),
            Gtid::new(0, 3000, 11)
        );
        assert!(!dir.path().join("position.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_store_idempotent_and_rejects_regression() {
        let dir = tempdir().unwrap();
        let store = FilePositionStore::open(dir.path()).await.unwrap();
        let p = Gtid::new(0, 1, 20);

        store.save(&p).await.unwrap();
        store.save(&p).await.unwrap();

        let err = store.save(&Gtid::new(0, 1, 19)).await.unwrap_err();
        assert!(matches!(err, StoreError::Regression { .. }));

        let reopened = FilePositionStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.load().await.unwrap(), Some(p));
    }

    #[tokio::test]
    async fn test_file_store_corrupt_document() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("position.json"), "{not json").unwrap();
        let err = FilePositionStore::open(dir.path()).await.err().unwrap();
        assert!(matches!(err, StoreError::Format(_)));
    }

    #[tokio::test]
    async fn test_memory_store_history() {
        let store = MemoryPositionStore::new();
        store.save(&Gtid::new(0, 1, 1)).await.unwrap();
        store.save(&Gtid::new(0, 1, 1)).await.unwrap();
        store.save(&Gtid::new(0, 1, 2)).await.unwrap();
        assert_eq!(store.history(), vec![Gtid::new(0, 1, 1), Gtid::new(0, 1, 2)]);
        assert!(store.save(&Gtid::new(0, 1, 0)).await.is_err());
    }
}
