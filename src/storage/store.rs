use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use tokio::fs::File;
use tracing::debug;

use crate::namespace::{NamespaceTree, NodeKind, Permissions};
use crate::{Result, ShardError};

/// Directory under the root that holds in-flight transfers. Never part of the
/// namespace.
pub const TEMP_DIR_NAME: &str = ".shardfs-tmp";

/// The directory a storage node serves from. Node locations are absolute
/// paths under `root`.
pub struct LocalStore {
    root: PathBuf,
    temp_dir: PathBuf,
}

/// On-disk facts about one location.
#[derive(Debug, Clone, Copy)]
pub struct DiskInfo {
    pub size: u64,
    pub modified: u64,
}

fn permissions_of(meta: &fs::Metadata) -> Permissions {
    if meta.permissions().readonly() {
        Permissions::READ
    } else {
        Permissions::READ | Permissions::WRITE
    }
}

impl LocalStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        let temp_dir = root.join(TEMP_DIR_NAME);
        fs::create_dir_all(&temp_dir)?;
        Ok(Self { root, temp_dir })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Build a namespace tree from whatever is already under the root.
    /// Only regular files and directories are picked up.
    pub fn scan(&self) -> Result<NamespaceTree> {
        let root_location = self.root.to_string_lossy().to_string();
        let mut tree = NamespaceTree::new(&root_location);
        let mut pending = vec![(tree.root(), self.root.clone())];

        while let Some((dir_id, dir_path)) = pending.pop() {
            let mut entries = fs::read_dir(&dir_path)?.collect::<std::io::Result<Vec<_>>>()?;
            entries.sort_by_key(|e| e.file_name());
            for entry in entries {
                let path = entry.path();
                if path == self.temp_dir {
                    continue;
                }
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    debug!(path = ?path, "Skipping non UTF-8 name");
                    continue;
                };
                let meta = entry.metadata()?;
                let kind = if meta.is_dir() {
                    NodeKind::Directory
                } else if meta.is_file() {
                    NodeKind::File
                } else {
                    continue;
                };
                let id = tree.insert_node(dir_id, &name, kind, permissions_of(&meta))?;
                if kind == NodeKind::Directory {
                    pending.push((id, path));
                }
            }
        }
        Ok(tree)
    }

    pub async fn create_file(&self, location: &str) -> Result<()> {
        tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(location)
            .await?;
        Ok(())
    }

    pub async fn create_dir(&self, location: &str) -> Result<()> {
        tokio::fs::create_dir(location).await?;
        Ok(())
    }

    /// Remove one file or one empty directory.
    pub async fn remove(&self, location: &str, kind: NodeKind) -> Result<()> {
        match kind {
            NodeKind::File => tokio::fs::remove_file(location).await?,
            NodeKind::Directory => tokio::fs::remove_dir(location).await?,
        }
        Ok(())
    }

    pub async fn copy_file(&self, from: &str, to: &str) -> Result<u64> {
        Ok(tokio::fs::copy(from, to).await?)
    }

    pub async fn open(&self, location: &str) -> Result<File> {
        File::open(location)
            .await
            .map_err(|e| ShardError::PathNotFound(format!("{location}: {e}")))
    }

    pub async fn info(&self, location: &str) -> Result<DiskInfo> {
        let meta = tokio::fs::metadata(location).await?;
        let modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs());
        Ok(DiskInfo {
            size: if meta.is_file() { meta.len() } else { 0 },
            modified,
        })
    }

    /// Create a new temp file for writing, returning (path, file).
    pub async fn create_temp(&self) -> Result<(PathBuf, File)> {
        let path = self.temp_dir.join(uuid::Uuid::new_v4().to_string());
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        Ok((path, file))
    }

    /// Move a finished temp file into place, replacing what is there.
    pub async fn commit_temp(&self, temp: &Path, location: &str) -> Result<()> {
        tokio::fs::rename(temp, location).await?;
        Ok(())
    }

    pub async fn discard_temp(&self, temp: &Path) {
        if let Err(e) = tokio::fs::remove_file(temp).await {
            debug!(path = ?temp, error = %e, "Temp file already gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::AsyncWriteExt;

    fn setup() -> (LocalStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path().join("root")).unwrap();
        (store, dir)
    }

    fn location(store: &LocalStore, rel: &str) -> String {
        store.root().join(rel).to_string_lossy().to_string()
    }

    #[test]
    fn test_scan_builds_tree() {
        let (store, _dir) = setup();
        fs::create_dir_all(store.root().join("home/docs")).unwrap();
        fs::write(store.root().join("home/a.txt"), b"aaa").unwrap();
        fs::write(store.root().join("home/docs/b.txt"), b"b").unwrap();

        let tree = store.scan().unwrap();
        assert_eq!(tree.len(), 5);
        let id = tree.resolve_path("/home/docs/b.txt").unwrap();
        let node = tree.node(id).unwrap();
        assert_eq!(node.kind, NodeKind::File);
        assert_eq!(node.location, location(&store, "home/docs/b.txt"));
        // The temp area is not part of the namespace.
        assert!(tree.resolve_path(&format!("/{TEMP_DIR_NAME}")).is_err());
    }

    #[tokio::test]
    async fn test_create_and_remove() {
        let (store, _dir) = setup();
        let dir = location(&store, "d");
        let file = location(&store, "d/f");
        store.create_dir(&dir).await.unwrap();
        store.create_file(&file).await.unwrap();
        assert!(store.create_file(&file).await.is_err());

        // Non-empty directory cannot go first.
        assert!(store.remove(&dir, NodeKind::Directory).await.is_err());
        store.remove(&file, NodeKind::File).await.unwrap();
        store.remove(&dir, NodeKind::Directory).await.unwrap();
        assert!(!Path::new(&dir).exists());
    }

    #[tokio::test]
    async fn test_temp_commit() {
        let (store, _dir) = setup();
        let dest = location(&store, "final.bin");
        let (temp, mut file) = store.create_temp().await.unwrap();
        file.write_all(b"payload").await.unwrap();
        file.flush().await.unwrap();
        drop(file);

        store.commit_temp(&temp, &dest).await.unwrap();
        assert!(!temp.exists());
        assert_eq!(fs::read(&dest).unwrap(), b"payload");
        assert_eq!(store.info(&dest).await.unwrap().size, 7);
    }
}
