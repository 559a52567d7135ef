use std::path::Path;

use openssl::{
    error::ErrorStack,
    pkey::{PKey, Private, Public},
    rsa::Rsa,
    sha::sha256,
};
use thiserror::Error;
use tracing::info;

use crate::{
    b64_url,
    jwk::{Jwk, JwkError},
    storage::{Storage, StorageError},
};

/// 金鑰相關操作的錯誤列舉，涵蓋 OpenSSL、存儲與 JWK 錯誤。
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("OpenSSL error: {0}")]
    OpenSSL(#[from] ErrorStack),
    #[error("Key generation failed: {0}")]
    Generation(ErrorStack),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("JWK error: {0}")]
    Jwk(#[from] JwkError),
}

type Result<T> = std::result::Result<T, KeyError>;

/// 表示一組 RSA 金鑰對，包含私鑰與派生的公鑰。
#[derive(Debug)]
pub struct KeyPair {
    /// 私鑰，使用 OpenSSL 的 `PKey` 封裝。
    pub pri_key: PKey<Private>,
    /// 公鑰，從私鑰派生而來。
    pub pub_key: PKey<Public>,
}

impl KeyPair {
    /// 域名金鑰的預設長度。
    pub const DEFAULT_BITS: u32 = 4096;

    /// 產生指定長度的新 RSA 金鑰對。
    ///
    /// # Errors
    ///
    /// 底層金鑰生成呼叫失敗時回傳 [`KeyError::Generation`]。
    pub fn generate(bits: u32) -> Result<Self> {
        let rsa = Rsa::generate(bits).map_err(KeyError::Generation)?;
        let pri_key = PKey::from_rsa(rsa).map_err(KeyError::Generation)?;
        let pub_key = Self::derive_public_key(&pri_key)?;
        Ok(Self { pri_key, pub_key })
    }

    /// 根據 PEM 格式的私鑰資料建立金鑰對。
    pub fn from_pem(pri_key_pem: &[u8]) -> Result<Self> {
        let pri_key = PKey::private_key_from_pem(pri_key_pem)?;
        let pub_key = Self::derive_public_key(&pri_key)?;
        Ok(Self { pri_key, pub_key })
    }

    /// 將私鑰序列化為 PKCS#8 PEM 格式。
    pub fn to_pem(&self) -> Result<Vec<u8>> {
        Ok(self.pri_key.private_key_to_pem_pkcs8()?)
    }

    /// 根據私鑰派生出對應的公鑰。
    fn derive_public_key(pri_key: &PKey<Private>) -> Result<PKey<Public>> {
        let rsa = pri_key.rsa()?;
        let pub_rsa = Rsa::from_public_components(rsa.n().to_owned()?, rsa.e().to_owned()?)?;
        Ok(PKey::from_rsa(pub_rsa)?)
    }

    /// 計算金鑰對的縮影（thumbprint），用於 ACME key authorization。
    ///
    /// 透過 JWK 標準格式與 SHA-256 雜湊運算產生，以 URL-safe Base64 字串回傳。
    pub fn thumbprint(&self) -> Result<String> {
        let jwk = Jwk::from_key_pair(self)?;
        let hash = sha256(jwk.to_acme_json()?.as_bytes());
        Ok(b64_url(hash))
    }

    /// 取得金鑰的位元長度。
    pub fn bits(&self) -> Result<u32> {
        let rsa = self.pri_key.rsa()?;
        Ok(rsa.size() * 8)
    }
}

/// 域名金鑰的存取策略。
///
/// 每個域名對應一個金鑰檔案；[`create_key`](KeyStore::create_key) 無條件覆寫，
/// 屬於明確的破壞性操作，呼叫端若不允許覆寫必須先檢查存在性。
#[derive(Debug)]
pub struct KeyStore<'a> {
    storage: &'a dyn Storage,
}

impl<'a> KeyStore<'a> {
    pub fn new(storage: &'a dyn Storage) -> Self {
        Self { storage }
    }

    /// 產生新金鑰並寫入指定路徑，已存在的檔案會被覆寫。
    ///
    /// # Errors
    ///
    /// 金鑰生成失敗回傳 [`KeyError::Generation`]；
    /// 檔案無法寫入（權限、磁碟空間）回傳 [`KeyError::Storage`]。
    pub fn create_key(&self, path: &Path, bits: u32) -> Result<KeyPair> {
        let key_pair = KeyPair::generate(bits)?;
        self.storage.write(path, &key_pair.to_pem()?)?;
        info!(path = %path.display(), bits, "generated new private key");
        Ok(key_pair)
    }

    /// 從指定路徑讀取金鑰。
    pub fn load(&self, path: &Path) -> Result<KeyPair> {
        let pem = self.storage.read(path)?;
        KeyPair::from_pem(&pem)
    }

    /// 讀取既有金鑰，不存在時才產生新金鑰並寫入。
    pub fn ensure(&self, path: &Path, bits: u32) -> Result<KeyPair> {
        match self.storage.read(path) {
            Ok(pem) => KeyPair::from_pem(&pem),
            Err(StorageError::NotFound(_)) => self.create_key(path, bits),
            Err(e) => Err(KeyError::Storage(e)),
        }
    }

    /// 檢查指定路徑是否已有金鑰檔案。
    pub fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.storage.exists(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStorage;

    #[test]
    fn test_generate_and_pem_round_trip() -> Result<()> {
        let key_pair = KeyPair::generate(2048)?;
        assert_eq!(key_pair.bits()?, 2048);

        let pem = key_pair.to_pem()?;
        let restored = KeyPair::from_pem(&pem)?;
        assert_eq!(restored.to_pem()?, pem);
        Ok(())
    }

    #[test]
    fn test_create_key_overwrites_existing() -> Result<()> {
        let storage = MemStorage::new();
        let store = KeyStore::new(&storage);
        let path = Path::new("/keys/example.com.key");

        let first = store.create_key(path, 2048)?;
        let second = store.create_key(path, 2048)?;
        assert_ne!(first.to_pem()?, second.to_pem()?);

        // 檔案內容必須是最後一次生成的金鑰
        assert_eq!(store.load(path)?.to_pem()?, second.to_pem()?);
        Ok(())
    }

    #[test]
    fn test_ensure_keeps_existing_key() -> Result<()> {
        let storage = MemStorage::new();
        let store = KeyStore::new(&storage);
        let path = Path::new("/keys/example.com.key");

        let first = store.ensure(path, 2048)?;
        let second = store.ensure(path, 2048)?;
        assert_eq!(first.to_pem()?, second.to_pem()?);
        Ok(())
    }

    #[test]
    fn test_thumbprint_is_url_safe() -> Result<()> {
        let key_pair = KeyPair::generate(2048)?;
        let thumbprint = key_pair.thumbprint()?;
        assert!(!thumbprint.is_empty());
        assert!(!thumbprint.contains('+'));
        assert!(!thumbprint.contains('/'));
        assert!(!thumbprint.contains('='));
        Ok(())
    }
}
