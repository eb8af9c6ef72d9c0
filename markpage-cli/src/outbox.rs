use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use markpage_core::Uploader;
use tracing::debug;

/// Stores uploads as files in a local directory. The returned reference is
/// the final path.
pub struct DirectoryUploader {
    root: PathBuf,
}

impl DirectoryUploader {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create output directory {:?}", root))?;
        Ok(Self { root })
    }
}

#[async_trait]
impl Uploader for DirectoryUploader {
    async fn upload(&self, name: &str, bytes: Vec<u8>) -> Result<String> {
        let path = self.root.join(name);
        let tmp = path.with_extension("partial");
        let written = tokio::task::spawn_blocking({
            let tmp = tmp.clone();
            let path = path.clone();
            move || -> Result<()> {
                let mut file = File::create(&tmp)
                    .with_context(|| format!("failed to create {:?}", tmp))?;
                file.write_all(&bytes)?;
                file.sync_all()?;
                fs::rename(&tmp, &path)
                    .with_context(|| format!("failed to move {:?} into place", tmp))?;
                Ok(())
            }
        })
        .await
        .context("writer task failed")?;
        written?;
        debug!(path = %path.display(), "stored upload");
        Ok(path.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_into_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = DirectoryUploader::new(dir.path().join("out")).unwrap();
        let reference = uploader.upload("a_marks.json", b"[]".to_vec()).await.unwrap();
        assert!(reference.ends_with("a_marks.json"));
        assert_eq!(fs::read(dir.path().join("out/a_marks.json")).unwrap(), b"[]");
    }
}
