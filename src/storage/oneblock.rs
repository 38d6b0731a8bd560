use super::traits::{BlockSink, SinkError};
use crate::codec::Block;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

const NO_PARENT: &str = "00000000";
const HASH_PREFIX_LEN: usize = 8;

/// Writes one immutable JSON file per block.
///
/// Files are staged in `working_dir` and moved into `store_dir` once fully
/// written, so readers of the store never see a partial file.
#[derive(Debug, Clone)]
pub struct OneBlockStore {
    store_dir: PathBuf,
    working_dir: PathBuf,
    suffix: String,
}

impl OneBlockStore {
    pub fn new(store_dir: impl Into<PathBuf>, working_dir: impl Into<PathBuf>, suffix: &str) -> Self {
        Self {
            store_dir: store_dir.into(),
            working_dir: working_dir.into(),
            suffix: suffix.to_string(),
        }
    }

    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    /// `<number:010>-<hash[..8]>-<parent[..8]>[-<suffix>].json`
    pub fn file_name(&self, block: &Block) -> String {
        let parent = block
            .parent_hash
            .as_deref()
            .map(hash_prefix)
            .unwrap_or(NO_PARENT);

        let mut name = format!("{:010}-{}-{}", block.number, hash_prefix(&block.hash), parent);
        if !self.suffix.is_empty() {
            name.push('-');
            name.push_str(&self.suffix);
        }
        name.push_str(".json");
        name
    }

    /// Reads back the stored block with the given number, if any.
    pub async fn read_block(&self, number: u64) -> Result<Option<Block>, SinkError> {
        let prefix = format!("{:010}-", number);
        let mut entries = fs::read_dir(&self.store_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with(&prefix) && name.ends_with(".json") {
                let bytes = fs::read(entry.path()).await?;
                return Ok(Some(serde_json::from_slice(&bytes)?));
            }
        }

        Ok(None)
    }

    /// Block numbers present in the store, ascending.
    pub async fn list_numbers(&self) -> Result<Vec<u64>, SinkError> {
        let mut entries = fs::read_dir(&self.store_dir).await?;
        let mut numbers = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !name.ends_with(".json") {
                continue;
            }
            if let Some(number) = name.get(..10).and_then(|n| n.parse::<u64>().ok()) {
                numbers.push(number);
            }
        }

        numbers.sort_unstable();
        numbers.dedup();
        Ok(numbers)
    }

    async fn move_into_store(&self, staged: &Path, target: &Path) -> Result<(), SinkError> {
        if fs::rename(staged, target).await.is_ok() {
            return Ok(());
        }

        // Staging and store may live on different filesystems
        fs::copy(staged, target).await?;
        if let Err(e) = fs::remove_file(staged).await {
            warn!(path = %staged.display(), error = %e, "Failed to remove staged block file");
        }
        Ok(())
    }
}

#[async_trait]
impl BlockSink for OneBlockStore {
    async fn init(&self) -> Result<(), SinkError> {
        fs::create_dir_all(&self.store_dir).await?;
        fs::create_dir_all(&self.working_dir).await?;
        Ok(())
    }

    async fn persist(&self, block: &Block) -> Result<(), SinkError> {
        let name = self.file_name(block);
        let target = self.store_dir.join(&name);

        if fs::try_exists(&target).await? {
            debug!(block_num = block.number, file = %name, "One-block file already exists, keeping it");
            return Ok(());
        }

        let json = serde_json::to_vec_pretty(block)?;
        let staged = self
            .working_dir
            .join(format!("{}.{}.tmp", name, Uuid::new_v4().simple()));
        fs::write(&staged, &json).await?;

        if let Err(e) = self.move_into_store(&staged, &target).await {
            let _ = fs::remove_file(&staged).await;
            return Err(e);
        }

        debug!(block_num = block.number, file = %name, "Wrote one-block file");
        Ok(())
    }
}

fn hash_prefix(hash: &str) -> &str {
    hash.get(..HASH_PREFIX_LEN).unwrap_or(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn block(number: u64, hash: &str, parent: Option<&str>) -> Block {
        Block {
            number,
            hash: hash.to_string(),
            parent_hash: parent.map(str::to_string),
            payload: format!("payload-{}", number),
        }
    }

    async fn store(dir: &TempDir, suffix: &str) -> OneBlockStore {
        let store = OneBlockStore::new(dir.path().join("blocks"), dir.path().join("work"), suffix);
        store.init().await.unwrap();
        store
    }

    #[test]
    fn test_file_name() {
        let store = OneBlockStore::new("/s", "/w", "");
        let name = store.file_name(&block(42, "abcdef0123456789", Some("99887766554433")));
        assert_eq!(name, "0000000042-abcdef01-99887766.json");

        let genesis = store.file_name(&block(0, "abcdef0123456789", None));
        assert_eq!(genesis, "0000000000-abcdef01-00000000.json");

        let suffixed = OneBlockStore::new("/s", "/w", "node-a");
        assert_eq!(
            suffixed.file_name(&block(1, "ab", None)),
            "0000000001-ab-00000000-node-a.json"
        );
    }

    #[tokio::test]
    async fn test_persist_and_read_back() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, "").await;

        let b = block(3, "0123456789abcdef", Some("fedcba9876543210"));
        store.persist(&b).await.unwrap();

        assert_eq!(store.read_block(3).await.unwrap(), Some(b));
        assert_eq!(store.read_block(4).await.unwrap(), None);

        // Nothing left behind in the staging area
        let staged: Vec<_> = std::fs::read_dir(dir.path().join("work")).unwrap().collect();
        assert!(staged.is_empty());
    }

    #[tokio::test]
    async fn test_existing_file_is_not_rewritten() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, "").await;

        let original = block(1, "aaaaaaaaaaaa", None);
        store.persist(&original).await.unwrap();

        let mut changed = original.clone();
        changed.payload = "something else".to_string();
        store.persist(&changed).await.unwrap();

        assert_eq!(store.read_block(1).await.unwrap(), Some(original));
    }

    #[tokio::test]
    async fn test_list_numbers() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, "x").await;

        for n in [5, 1, 3] {
            store.persist(&block(n, "1234567890", None)).await.unwrap();
        }
        std::fs::write(store.store_dir().join("README"), "not a block").unwrap();

        assert_eq!(store.list_numbers().await.unwrap(), vec![1, 3, 5]);
    }

    #[tokio::test]
    async fn test_persist_fails_without_store_dir() {
        let dir = TempDir::new().unwrap();
        let store = OneBlockStore::new(dir.path().join("missing"), dir.path(), "");

        let err = store.persist(&block(1, "ab", None)).await.unwrap_err();
        assert!(matches!(err, SinkError::Io(_)));
    }
}
