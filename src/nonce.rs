use std::sync::Mutex;

use reqwest::blocking::Client;
use thiserror::Error;

/// 表示在取得 nonce 時可能發生的錯誤狀況。
#[derive(Error, Debug)]
pub enum NonceError {
    /// 當請求過程中發生錯誤時回傳此錯誤。
    #[error("Failed to make request: {0}")]
    RequestFailed(#[from] reqwest::Error),
    /// 當回應中缺少 `Replay-Nonce` 標頭時回傳此錯誤。
    #[error("No Replay-Nonce header found in response")]
    NoNonceHeader,
    /// 當標頭值無法轉換成字串時回傳此錯誤。
    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] reqwest::header::ToStrError),
}

/// 定義取得 nonce 的行為。
pub trait NonceT: Send + Sync {
    /// 取得一個可用的 nonce。
    fn get(&self) -> Result<String, NonceError>;
}

/// 透過 ACME newNonce 端點取得 `Replay-Nonce` 的實作。
///
/// 每個回應都會附帶新的 nonce，呼叫端可透過 [`ReplayNonce::store`]
/// 快取回應標頭中的值，省下一次 HEAD 請求。
#[derive(Debug)]
pub struct ReplayNonce {
    client: Client,
    url: String,
    cached: Mutex<Option<String>>,
}

impl ReplayNonce {
    /// 建立一個新的 `ReplayNonce` 實例，指向目錄的 newNonce URL。
    pub fn new(url: impl Into<String>) -> Self {
        ReplayNonce {
            client: Client::new(),
            url: url.into(),
            cached: Mutex::new(None),
        }
    }

    /// 快取回應標頭附帶的 `Replay-Nonce`，供下一次請求使用。
    pub fn store(&self, headers: &reqwest::header::HeaderMap) {
        if let Some(value) = headers
            .get("Replay-Nonce")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
        {
            if let Ok(mut cached) = self.cached.lock() {
                *cached = Some(value);
            }
        }
    }
}

impl NonceT for ReplayNonce {
    /// 優先取用快取的 nonce，否則以 HTTP HEAD 請求向端點索取。
    fn get(&self) -> Result<String, NonceError> {
        if let Ok(mut cached) = self.cached.lock() {
            if let Some(nonce) = cached.take() {
                return Ok(nonce);
            }
        }

        let response = self.client.head(&self.url).send()?;
        match response.headers().get("Replay-Nonce") {
            Some(nonce) => Ok(nonce.to_str()?.to_string()),
            None => Err(NonceError::NoNonceHeader),
        }
    }
}

/// 模擬 nonce 實作，用於測試環境中提供固定的值。
#[derive(Debug, Clone)]
pub struct MockNonce {
    value: String,
}

impl MockNonce {
    /// 建立一個新的 `MockNonce` 實例，並指定固定的 nonce 值。
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

impl NonceT for MockNonce {
    fn get(&self) -> Result<String, NonceError> {
        Ok(self.value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_nonce() {
        let nonce = MockNonce::new("test-nonce-123");
        assert_eq!(nonce.get().unwrap(), "test-nonce-123");
    }

    #[test]
    fn test_cached_nonce_is_consumed_once() {
        let nonce = ReplayNonce::new("http://unused.invalid/new-nonce");
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("Replay-Nonce", "cached-value".parse().unwrap());

        nonce.store(&headers);
        assert_eq!(nonce.get().unwrap(), "cached-value");
        // 第二次取得必須重新發出請求，不可重用已消耗的 nonce
        assert!(nonce.cached.lock().unwrap().is_none());
    }
}
