use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{b64_url, key_store::KeyPair};

/// JWK 相關操作的錯誤類型。
#[derive(Debug, Error)]
pub enum JwkError {
    /// 金鑰轉換失敗。
    #[error("Failed to convert key: {0}")]
    KeyConversionError(String),
    /// 序列化錯誤。
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

type Result<T> = std::result::Result<T, JwkError>;

/// RSA 格式的 JSON Web Key，包含 ACME 協議所需的公開參數。
///
/// 帳戶金鑰的 thumbprint 與首次請求的 `jwk` 標頭欄位均由此結構產生。
#[derive(Debug, Serialize)]
pub struct Jwk {
    kty: &'static str,
    n: String,
    e: String,
}

impl Jwk {
    /// 根據給定的金鑰對產生 JWK。
    ///
    /// # Errors
    ///
    /// 當金鑰無法轉換為 RSA 公開參數時回傳 [`JwkError::KeyConversionError`]。
    pub fn from_key_pair(key_pair: &KeyPair) -> Result<Self> {
        let rsa = key_pair
            .pub_key
            .rsa()
            .map_err(|e| JwkError::KeyConversionError(e.to_string()))?;

        Ok(Jwk {
            kty: "RSA",
            n: b64_url(rsa.n().to_vec()),
            e: b64_url(rsa.e().to_vec()),
        })
    }

    /// 產生符合 ACME thumbprint 規範的 JSON 表示。
    ///
    /// RFC 7638 要求欄位依 `e`、`kty`、`n` 的字典序排列，不得包含空白。
    pub fn to_acme_json(&self) -> Result<String> {
        let mut map = Map::new();
        map.insert("e".to_string(), Value::String(self.e.clone()));
        map.insert("kty".to_string(), Value::String(self.kty.to_string()));
        map.insert("n".to_string(), Value::String(self.n.clone()));

        serde_json::to_string(&Value::Object(map)).map_err(JwkError::from)
    }

    /// 將 JWK 轉換為 JSON 值，供保護標頭的 `jwk` 欄位使用。
    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(JwkError::from)
    }
}
