use std::path::{Path, PathBuf};

use tokio::{fs, io::AsyncWriteExt};

use crate::error::StoreError;

/// Writes `bytes` to `path` through a sibling `.tmp` file and a rename, so
/// readers never see a half-written file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = tmp_path(path);
    {
        let mut f = fs::File::create(&tmp).await.map_err(|e| StoreError::io(&tmp, e))?;
        f.write_all(bytes).await.map_err(|e| StoreError::io(&tmp, e))?;
        let _ = f.sync_all().await; // best-effort
    }
    fs::rename(&tmp, path).await.map_err(|e| StoreError::io(path, e))
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Append-only line log. Each line goes out in one `write_all` followed by a
/// flush.
pub struct LineLog {
    file: fs::File,
    path: PathBuf,
}

impl LineLog {
    pub async fn open(path: PathBuf) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| StoreError::io(parent, e))?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StoreError::io(&path, e))?;
        Ok(Self { file, path })
    }

    /// `line` must already end with a newline.
    pub async fn append(&mut self, line: &str) -> Result<(), StoreError> {
        self.file.write_all(line.as_bytes()).await.map_err(|e| StoreError::io(&self.path, e))?;
        self.file.flush().await.map_err(|e| StoreError::io(&self.path, e))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
