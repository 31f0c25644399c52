use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

/// Result of writing one evidence artifact.
#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    /// The blob already existed and nothing was written.
    pub deduplicated: bool,
}

/// Immutable, hash-addressed artifact files under one root directory.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// `<company>/<kind>/<hh>/<hash>.<ext>` where `hh` is the first byte of the hash.
    pub fn blob_relative_path(
        &self,
        company_id: &str,
        kind: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = match extension.trim().trim_start_matches('.') {
            "" => "bin",
            ext => ext,
        };
        let shard = content_hash.get(..2).unwrap_or("00");
        let file_name = format!("{content_hash}.{ext}");
        [company_id, kind, shard, file_name.as_str()].iter().collect()
    }

    /// Writes `bytes` unless a blob with the same hash is already present.
    ///
    /// The final path only ever holds complete content: bytes go to a
    /// sibling temp file which is synced and then renamed into place.
    pub async fn store_bytes(
        &self,
        company_id: &str,
        kind: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredBlob> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.blob_relative_path(company_id, kind, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let mut blob = StoredBlob {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated: true,
        };

        if fs::try_exists(&blob.absolute_path)
            .await
            .with_context(|| format!("checking {}", blob.absolute_path.display()))?
        {
            debug!(path = %blob.relative_path.display(), "blob already stored");
            return Ok(blob);
        }

        blob.deduplicated = !write_atomically(&blob.absolute_path, bytes).await?;
        Ok(blob)
    }

    pub async fn read_bytes(&self, relative_path: impl AsRef<Path>) -> anyhow::Result<Vec<u8>> {
        let path = self.root.join(relative_path);
        fs::read(&path)
            .await
            .with_context(|| format!("reading blob {}", path.display()))
    }
}

/// Returns `false` when another writer won the rename race.
async fn write_atomically(target: &Path, bytes: &[u8]) -> anyhow::Result<bool> {
    let dir = target
        .parent()
        .with_context(|| format!("{} has no parent directory", target.display()))?;
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let temp = dir.join(format!(".{}.partial", Uuid::new_v4()));
    if let Err(err) = write_synced(&temp, bytes).await {
        let _ = fs::remove_file(&temp).await;
        return Err(err);
    }

    let renamed = fs::rename(&temp, target).await;
    if renamed.is_err() {
        let _ = fs::remove_file(&temp).await;
    }
    match renamed {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err).with_context(|| format!("moving blob into {}", target.display())),
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("creating {}", path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn hashes_are_lowercase_sha256() {
        assert_eq!(
            BlobStore::sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn paths_depend_only_on_company_kind_and_hash() {
        let store = BlobStore::new("/evidence");
        assert_eq!(
            store.blob_relative_path("jnj", "pipeline_pdf", "abcdef", ".pdf"),
            PathBuf::from("jnj/pipeline_pdf/ab/abcdef.pdf")
        );
        assert_eq!(
            store.blob_relative_path("jnj", "pipeline_pdf", "abcdef", " "),
            PathBuf::from("jnj/pipeline_pdf/ab/abcdef.bin")
        );
    }

    #[tokio::test]
    async fn second_store_of_same_bytes_is_deduplicated() {
        let dir = tempdir().expect("tempdir");
        let store = BlobStore::new(dir.path());

        let first = store
            .store_bytes("jnj", "pipeline_html", "html", b"<html>same</html>")
            .await
            .expect("first store");
        let second = store
            .store_bytes("jnj", "pipeline_html", "html", b"<html>same</html>")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        let bytes = store.read_bytes(&first.relative_path).await.expect("read back");
        assert_eq!(bytes, b"<html>same</html>");
    }

    #[tokio::test]
    async fn partial_files_do_not_survive_a_store() {
        let dir = tempdir().expect("tempdir");
        let store = BlobStore::new(dir.path());
        let stored = store
            .store_bytes("immatics", "pipeline_image", "png", b"\x89PNG")
            .await
            .expect("store");

        let parent = stored.absolute_path.parent().expect("parent");
        let names = std::fs::read_dir(parent)
            .expect("read dir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        assert_eq!(names, vec![format!("{}.png", stored.content_hash)]);
    }

    #[tokio::test]
    async fn unwritable_root_surfaces_an_error() {
        let dir = tempdir().expect("tempdir");
        let file_root = dir.path().join("not-a-dir");
        std::fs::write(&file_root, b"x").expect("seed file");
        let store = BlobStore::new(&file_root);

        let result = store.store_bytes("jnj", "ctg_study_json", "json", b"{}").await;
        assert!(result.is_err());
    }
}
