use std::{
    collections::HashMap,
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use thiserror::Error;

/// 儲存操作可能發生的錯誤類型。
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Path not found: {0}")]
    NotFound(PathBuf),
    #[error("Lock poisoned")]
    LockPoisoned,
}

/// 儲存操作的結果類型，封裝 [`StorageError`]。
pub type Result<T> = std::result::Result<T, StorageError>;

/// 定義憑證生命週期引擎所需的儲存 API。
///
/// 金鑰、CSR、憑證與備份全部經由此特徵讀寫，讓安裝流程可以在測試中
/// 以記憶體實作替換真實檔案系統。
pub trait Storage: Send + Sync + fmt::Debug {
    /// 讀取指定路徑的完整內容。
    fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// 將資料寫入指定路徑，必要時自動建立父目錄。
    fn write(&self, path: &Path, data: &[u8]) -> Result<()>;

    /// 檢查指定路徑是否存在。
    fn exists(&self, path: &Path) -> Result<bool>;

    /// 刪除指定路徑的檔案。
    fn remove(&self, path: &Path) -> Result<()>;

    /// 將檔案內容複製到另一個路徑。
    fn copy(&self, from: &Path, to: &Path) -> Result<()>;

    /// 以硬連結方式建立別名檔案，連結與原始檔案共享相同內容。
    fn hard_link(&self, original: &Path, link: &Path) -> Result<()>;

    /// 將檔案改名，用於產生備份副本。
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// 建立目錄樹，若已存在則不做任何事。
    fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// 預設方法：以字串形式讀取檔案內容。
    fn read_to_string(&self, path: &Path) -> Result<String> {
        let bytes = self.read(path)?;
        String::from_utf8(bytes).map_err(|e| StorageError::Io {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidData, e),
        })
    }
}

fn io_err(path: &Path, source: io::Error) -> StorageError {
    if source.kind() == io::ErrorKind::NotFound {
        StorageError::NotFound(path.to_path_buf())
    } else {
        StorageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// 直接操作檔案系統的儲存實作。
///
/// 路徑一律由 [`crate::config::Config`] 提供，本實作不做任何路徑推導。
#[derive(Debug, Default)]
pub struct DiskStorage;

impl DiskStorage {
    pub fn new() -> Self {
        DiskStorage
    }
}

impl Storage for DiskStorage {
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path).map_err(|e| io_err(path, e))
    }

    fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        fs::write(path, data).map_err(|e| io_err(path, e))
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(path.exists())
    }

    fn remove(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).map_err(|e| io_err(path, e))
    }

    fn copy(&self, from: &Path, to: &Path) -> Result<()> {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        fs::copy(from, to).map(|_| ()).map_err(|e| io_err(from, e))
    }

    fn hard_link(&self, original: &Path, link: &Path) -> Result<()> {
        fs::hard_link(original, link).map_err(|e| io_err(link, e))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to).map_err(|e| io_err(from, e))
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).map_err(|e| io_err(path, e))
    }
}

/// 基於記憶體的儲存實作，供測試使用。
///
/// 硬連結以內容複製模擬；別名在每次安裝時重建，因此測試語義不受影響。
#[derive(Debug, Default)]
pub struct MemStorage {
    files: Arc<RwLock<HashMap<PathBuf, Vec<u8>>>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemStorage {
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let files = self.files.read().map_err(|_| StorageError::LockPoisoned)?;
        files
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(path.to_path_buf()))
    }

    fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        self.files
            .write()
            .map_err(|_| StorageError::LockPoisoned)?
            .insert(path.to_path_buf(), data.to_vec());
        Ok(())
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        let files = self.files.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(files.contains_key(path))
    }

    fn remove(&self, path: &Path) -> Result<()> {
        self.files
            .write()
            .map_err(|_| StorageError::LockPoisoned)?
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(path.to_path_buf()))
    }

    fn copy(&self, from: &Path, to: &Path) -> Result<()> {
        let data = self.read(from)?;
        self.write(to, &data)
    }

    fn hard_link(&self, original: &Path, link: &Path) -> Result<()> {
        let data = self.read(original)?;
        self.write(link, &data)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let data = self.read(from)?;
        self.write(to, &data)?;
        self.remove(from)
    }

    fn create_dir_all(&self, _path: &Path) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_mem_storage_basic_operations() -> Result<()> {
        let storage = MemStorage::new();
        let path = Path::new("/certs/example.com.crt");

        storage.write(path, b"PEM data")?;
        assert_eq!(storage.read(path)?, b"PEM data");
        assert!(storage.exists(path)?);

        storage.remove(path)?;
        assert!(!storage.exists(path)?);
        match storage.read(path) {
            Err(StorageError::NotFound(_)) => {}
            _ => panic!("預期 NotFound 錯誤"),
        }
        Ok(())
    }

    #[test]
    fn test_mem_storage_rename_keeps_content() -> Result<()> {
        let storage = MemStorage::new();
        let from = Path::new("/certs/a.crt");
        let to = Path::new("/certs/a.crt-2026-01-01T00:00:00.000");

        storage.write(from, b"old cert")?;
        storage.rename(from, to)?;

        assert!(!storage.exists(from)?);
        assert_eq!(storage.read(to)?, b"old cert");
        Ok(())
    }

    #[test]
    fn test_disk_storage_basic_operations() -> Result<()> {
        let dir = tempdir().map_err(|e| io_err(Path::new("tempdir"), e))?;
        let storage = DiskStorage::new();
        let path = dir.path().join("sub/file.txt");

        storage.write(&path, b"Hello, DiskStorage")?;
        assert_eq!(storage.read(&path)?, b"Hello, DiskStorage");

        storage.remove(&path)?;
        match storage.read(&path) {
            Err(StorageError::NotFound(_)) => {}
            _ => panic!("預期 NotFound 錯誤"),
        }
        Ok(())
    }

    #[test]
    fn test_disk_storage_hard_link_shares_content() -> Result<()> {
        let dir = tempdir().map_err(|e| io_err(Path::new("tempdir"), e))?;
        let storage = DiskStorage::new();
        let original = dir.path().join("example.com.crt");
        let link = dir.path().join("www.example.com.crt");

        storage.write(&original, b"leaf cert")?;
        storage.hard_link(&original, &link)?;

        assert_eq!(storage.read(&link)?, b"leaf cert");
        Ok(())
    }
}
