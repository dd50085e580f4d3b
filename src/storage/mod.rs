// src/storage/mod.rs
use crate::utils::error::StorageError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

/// Descriptor of one stored binary attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub filename: String,
    pub hash: String,
    pub path: String,
}

/// Owns the on-disk working layout: one private directory per issuer,
/// with extracted attachments under an `attachments` subdirectory.
pub struct StorageManager {
    base_dir: PathBuf,
}

impl StorageManager {
    /// Creates a new StorageManager rooted at `base_dir`.
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Result<Self, StorageError> {
        let base_path = base_dir.as_ref().to_path_buf();

        // Create the base directory if it doesn't exist
        if !base_path.exists() {
            fs::create_dir_all(&base_path).map_err(StorageError::IoError)?;
        }

        Ok(Self { base_dir: base_path })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Working directory for one issuer, e.g. `014206_files/`.
    /// Created lazily on first use.
    pub fn issuer_dir(&self, cod_cvm: u32) -> Result<PathBuf, StorageError> {
        let dir = self.base_dir.join(format!("{cod_cvm:06}_files"));
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(StorageError::IoError)?;
        }
        Ok(dir)
    }

    /// Attachment directory for one issuer.
    pub fn attachments_dir(&self, cod_cvm: u32) -> Result<PathBuf, StorageError> {
        let dir = self.issuer_dir(cod_cvm)?.join("attachments");
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(StorageError::IoError)?;
        }
        Ok(dir)
    }

    /// Saves one attachment under a content-addressed name:
    /// `{section}_{sha256}.pdf`. Identical payloads collapse to the same
    /// file, so re-extraction and cross-section duplicates are free.
    pub fn save_attachment(
        &self,
        cod_cvm: u32,
        section: &str,
        content: &[u8],
    ) -> Result<AttachmentRef, StorageError> {
        let hash = format!("{:x}", Sha256::digest(content));
        let filename = format!("{section}_{hash}.pdf");
        let path = self.attachments_dir(cod_cvm)?.join(&filename);

        if path.exists() {
            tracing::debug!("Attachment already stored, skipping write: {}", filename);
        } else {
            fs::write(&path, content).map_err(StorageError::IoError)?;
            tracing::info!("Saved attachment {} ({} bytes)", filename, content.len());
        }

        Ok(AttachmentRef {
            filename,
            hash,
            path: path.display().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issuer_dirs_are_zero_padded_and_private() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = StorageManager::new(tmp.path()).unwrap();

        let dir = storage.issuer_dir(14206).unwrap();
        assert!(dir.ends_with("014206_files"));
        assert!(dir.is_dir());

        let other = storage.issuer_dir(950).unwrap();
        assert_ne!(dir, other);
    }

    #[test]
    fn identical_content_collapses_to_one_file() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = StorageManager::new(tmp.path()).unwrap();

        let a = storage.save_attachment(1, "info_asg", b"%PDF-fake").unwrap();
        let b = storage.save_attachment(1, "info_asg", b"%PDF-fake").unwrap();
        assert_eq!(a, b);

        let files: Vec<_> = fs::read_dir(storage.attachments_dir(1).unwrap())
            .unwrap()
            .collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn same_payload_different_sections_share_a_hash() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = StorageManager::new(tmp.path()).unwrap();

        let a = storage.save_attachment(1, "info_asg", b"%PDF-fake").unwrap();
        let b = storage.save_attachment(1, "gestao_riscos", b"%PDF-fake").unwrap();
        assert_eq!(a.hash, b.hash);
        assert_ne!(a.filename, b.filename);
    }

    #[test]
    fn different_payloads_get_different_names() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = StorageManager::new(tmp.path()).unwrap();

        let a = storage.save_attachment(1, "info_asg", b"one").unwrap();
        let b = storage.save_attachment(1, "info_asg", b"two").unwrap();
        assert_ne!(a.hash, b.hash);
        assert_ne!(a.filename, b.filename);
    }
}
