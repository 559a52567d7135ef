use std::path::Path;

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::storage::{Storage, StorageError};

/// 表示處理目錄操作時可能發生的錯誤類型。
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// JSON 解析或序列化錯誤。
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// HTTP 請求錯誤。
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),
    /// 儲存操作錯誤。
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

type Result<T> = std::result::Result<T, DirectoryError>;

/// ACME 目錄端點的選項；production 與 staging 互斥，每次呼叫僅能擇一。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Production,
    Staging,
}

impl Endpoint {
    /// 回傳端點對應的目錄 URL。
    pub fn directory_url(&self) -> &'static str {
        match self {
            Endpoint::Production => "https://acme-v02.api.letsencrypt.org/directory",
            Endpoint::Staging => "https://acme-staging-v02.api.letsencrypt.org/directory",
        }
    }
}

/// ACME 目錄文件，列出本庫所需的 API 端點。
#[derive(Debug, Deserialize, Serialize)]
pub struct Directory {
    /// 用於帳戶查詢的 API 路徑。
    #[serde(rename = "newAccount")]
    pub new_account: String,
    /// 用於取得新的 nonce 值的 API 路徑。
    #[serde(rename = "newNonce")]
    pub new_nonce: String,
    /// 用於訂單相關操作的 API 路徑。
    #[serde(rename = "newOrder")]
    pub new_order: String,
    /// 用於撤銷憑證的 API 路徑，可能不存在。
    #[serde(rename = "revokeCert")]
    pub revoke_cert: Option<String>,
}

impl Directory {
    /// 取得 `Directory` 實例。
    ///
    /// 先檢查快取路徑是否已有目錄資料，若存在則直接反序列化回傳；
    /// 否則向端點發送 GET 請求，並將結果寫入快取供後續呼叫使用。
    ///
    /// # 參數
    ///
    /// - `storage`: 用以讀寫快取的儲存系統。
    /// - `cache_path`: 目錄文件的快取路徑。
    /// - `endpoint`: 選定的 ACME 端點。
    ///
    /// # 回傳
    ///
    /// 成功時回傳 `Directory` 實例，否則回傳 [`DirectoryError`]。
    pub fn fetch(storage: &dyn Storage, cache_path: &Path, endpoint: Endpoint) -> Result<Self> {
        match storage.read(cache_path) {
            Ok(data) => {
                debug!(path = %cache_path.display(), "directory loaded from cache");
                return Ok(serde_json::from_slice(&data)?);
            }
            Err(StorageError::NotFound(_)) => {}
            Err(e) => return Err(DirectoryError::Storage(e)),
        }

        let url = endpoint.directory_url();
        debug!(url, "fetching ACME directory");
        let response = Client::new().get(url).send()?;
        let directory: Directory = response.json()?;

        storage.write(cache_path, &serde_json::to_vec(&directory)?)?;
        Ok(directory)
    }
}
