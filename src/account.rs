//! ACME 會話的起點：載入帳戶金鑰、取得目錄並解析帳戶 URL。
//!
//! 帳戶註冊與金鑰輪替不在本庫範圍內；帳戶金鑰必須事先備妥，
//! 帳戶 URL 以 `onlyReturnExisting` 查詢取得並快取。

use std::{path::PathBuf, string::FromUtf8Error};

use reqwest::blocking::{Client, Response};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    config::Config,
    directory::{Directory, DirectoryError},
    jws::{sign_request, JwsError, SignerIdentity},
    key_store::{KeyError, KeyPair, KeyStore},
    nonce::ReplayNonce,
    payload::{ExistingAccountPayload, PayloadT},
    storage::{Storage, StorageError},
};

/// 帳戶相關操作可能發生的錯誤類型。
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Request header error: {0}")]
    RequestHeader(#[from] reqwest::header::ToStrError),
    #[error("Request failed: {status}, {body}")]
    RequestFailed {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("UTF-8 error: {0}")]
    Utf8(#[from] FromUtf8Error),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("JWS error: {0}")]
    Jws(#[from] JwsError),
    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),
    #[error("Account key not found at {0}; register an account first")]
    AccountKeyMissing(PathBuf),
    #[error("Missing Location header in account response")]
    MissingLocationHeader,
}

pub type Result<T> = std::result::Result<T, AccountError>;

/// 一次 ACME 會話所需的帳戶狀態。
#[derive(Debug)]
pub struct Account {
    /// 帳戶金鑰對，所有請求以此簽名。
    pub key_pair: KeyPair,
    /// ACME 服務目錄。
    pub directory: Directory,
    /// 帳戶 URL，作為後續請求的 kid。
    pub account_url: String,
    /// nonce 來源。
    pub nonce: ReplayNonce,
    client: Client,
}

impl Account {
    /// 載入帳戶並解析帳戶 URL。
    ///
    /// 帳戶金鑰必須存在於組態指定的路徑；帳戶 URL 優先取自快取，
    /// 否則向 CA 發出 `onlyReturnExisting` 查詢並寫入快取。
    ///
    /// # Errors
    ///
    /// 金鑰檔案不存在回傳 [`AccountError::AccountKeyMissing`]；
    /// 查詢失敗回傳 [`AccountError::RequestFailed`]。
    pub fn load(storage: &dyn Storage, config: &Config) -> Result<Self> {
        let key_path = config.account_key_path();
        let key_pair = match KeyStore::new(storage).load(&key_path) {
            Ok(key_pair) => key_pair,
            Err(KeyError::Storage(StorageError::NotFound(_))) => {
                return Err(AccountError::AccountKeyMissing(key_path))
            }
            Err(e) => return Err(AccountError::Key(e)),
        };

        let directory = Directory::fetch(storage, &config.directory_cache_path(), config.endpoint)?;
        let nonce = ReplayNonce::new(&directory.new_nonce);
        let client = Client::new();

        let cache_path = config.account_url_cache_path();
        let account_url = match storage.read(&cache_path) {
            Ok(bytes) => {
                debug!("account URL loaded from cache");
                String::from_utf8(bytes)?
            }
            Err(StorageError::NotFound(_)) => {
                let url = Self::lookup_account_url(&client, &directory, &key_pair, &nonce)?;
                storage.write(&cache_path, url.as_bytes())?;
                url
            }
            Err(e) => return Err(AccountError::Storage(e)),
        };

        info!(account_url, "ACME account ready");
        Ok(Account {
            key_pair,
            directory,
            account_url,
            nonce,
            client,
        })
    }

    /// 以 `onlyReturnExisting` 向 CA 查詢既有帳戶的 URL。
    fn lookup_account_url(
        client: &Client,
        directory: &Directory,
        key_pair: &KeyPair,
        nonce: &ReplayNonce,
    ) -> Result<String> {
        let payload = ExistingAccountPayload::new().to_json_string()?;
        let jws = sign_request(
            key_pair,
            SignerIdentity::Jwk,
            nonce,
            &directory.new_account,
            &payload,
        )?;

        let response = client
            .post(&directory.new_account)
            .header("Content-Type", "application/jose+json")
            .body(jws.to_json()?)
            .send()?;
        nonce.store(response.headers());

        if !response.status().is_success() {
            return Err(AccountError::RequestFailed {
                status: response.status(),
                body: response.text()?,
            });
        }

        response
            .headers()
            .get("Location")
            .ok_or(AccountError::MissingLocationHeader)?
            .to_str()
            .map(str::to_owned)
            .map_err(AccountError::from)
    }

    /// 以帳戶身分對指定 URL 發出簽名請求。
    ///
    /// `payload_json` 為空字串時即為 POST-as-GET。
    /// 回應標頭中的 `Replay-Nonce` 會自動快取。
    pub fn signed_post(&self, url: &str, payload_json: &str) -> Result<Response> {
        let jws = sign_request(
            &self.key_pair,
            SignerIdentity::AccountUrl(&self.account_url),
            &self.nonce,
            url,
            payload_json,
        )?;

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/jose+json")
            .body(jws.to_json()?)
            .send()?;
        self.nonce.store(response.headers());
        Ok(response)
    }

    /// 檢查回應狀態，非成功時轉換為帶狀態碼與主體的錯誤。
    pub fn ensure_success(response: Response) -> Result<Response> {
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(AccountError::RequestFailed {
                status: response.status(),
                body: response.text()?,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStorage;

    #[test]
    fn test_load_without_account_key_fails() {
        let storage = MemStorage::new();
        let config = Config::builder("/srv/certmill").build();

        match Account::load(&storage, &config) {
            Err(AccountError::AccountKeyMissing(path)) => {
                assert!(path.ends_with("account.key"));
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }
}
