use openssl::{hash::MessageDigest, sign::Signer};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::{
    b64_url,
    jwk::{Jwk, JwkError},
    key_store::KeyPair,
    nonce::{NonceError, NonceT},
};

/// JWS 建構過程可能產生的錯誤類型。
#[derive(Debug, Error)]
pub enum JwsError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Nonce error: {0}")]
    Nonce(#[from] NonceError),
    #[error("JWK error: {0}")]
    Jwk(#[from] JwkError),
    #[error("Signing error: {0}")]
    Signing(#[from] openssl::error::ErrorStack),
}

type Result<T> = std::result::Result<T, JwsError>;

/// ACME 請求的保護標頭。
///
/// `jwk` 與 `kid` 互斥：帳戶查詢請求附上完整 JWK，
/// 其餘請求以帳戶 URL 作為金鑰識別符。
#[derive(Debug, Serialize)]
struct ProtectedHeader {
    alg: &'static str,
    nonce: String,
    url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    jwk: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}

/// 已簽名的 JWS 物件，可直接序列化為 `application/jose+json` 請求主體。
#[derive(Debug, Serialize)]
pub struct Jws {
    protected: String,
    payload: String,
    signature: String,
}

impl Jws {
    /// 將 `Jws` 實例序列化為 JSON 字串。
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// 標示簽名請求要以何種身分識別填入保護標頭。
#[derive(Debug)]
pub enum SignerIdentity<'a> {
    /// 附上完整 JWK（帳戶查詢時使用）。
    Jwk,
    /// 以帳戶 URL 作為 kid。
    AccountUrl(&'a str),
}

/// 建立一個完成簽名的 JWS。
///
/// 流程：取得新 nonce、組合保護標頭、將標頭與負載以 URL-safe Base64 編碼後
/// 用帳戶私鑰做 RS256 簽名。
///
/// # 參數
///
/// - `key_pair`: 帳戶金鑰對，用於簽名。
/// - `identity`: 保護標頭的身分識別方式。
/// - `nonce`: 實作 [`NonceT`] 的 nonce 來源。
/// - `url`: 請求目標 URL。
/// - `payload_json`: 已序列化的負載 JSON；空字串表示 POST-as-GET。
///
/// # Errors
///
/// nonce 取得、序列化或簽名失敗時回傳對應的 [`JwsError`]。
pub fn sign_request(
    key_pair: &KeyPair,
    identity: SignerIdentity<'_>,
    nonce: &dyn NonceT,
    url: &str,
    payload_json: &str,
) -> Result<Jws> {
    let (jwk, kid) = match identity {
        SignerIdentity::Jwk => (Some(Jwk::from_key_pair(key_pair)?.to_value()?), None),
        SignerIdentity::AccountUrl(account_url) => (None, Some(account_url.to_string())),
    };

    let header = ProtectedHeader {
        alg: "RS256",
        nonce: nonce.get()?,
        url: url.to_string(),
        jwk,
        kid,
    };

    let protected = b64_url(serde_json::to_string(&header)?);
    let payload = if payload_json.is_empty() {
        String::new()
    } else {
        b64_url(payload_json)
    };

    let signing_input = format!("{}.{}", protected, payload);
    let mut signer = Signer::new(MessageDigest::sha256(), &key_pair.pri_key)?;
    signer.update(signing_input.as_bytes())?;
    let signature = b64_url(signer.sign_to_vec()?);

    Ok(Jws {
        protected,
        payload,
        signature,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nonce::MockNonce;

    fn test_key_pair() -> KeyPair {
        KeyPair::generate(2048).expect("key generation failed")
    }

    #[test]
    fn test_jwk_identity_includes_jwk_field() -> Result<()> {
        let key_pair = test_key_pair();
        let nonce = MockNonce::new("test-nonce");
        let jws = sign_request(
            &key_pair,
            SignerIdentity::Jwk,
            &nonce,
            "https://example.com/acme/new-acct",
            r#"{"onlyReturnExisting":true}"#,
        )?;

        let json = jws.to_json()?;
        let value: JsonValue = serde_json::from_str(&json)?;
        let protected: Vec<u8> = {
            use base64::Engine;
            base64::engine::general_purpose::URL_SAFE_NO_PAD
                .decode(value["protected"].as_str().unwrap())
                .unwrap()
        };
        let header: JsonValue = serde_json::from_slice(&protected)?;

        assert_eq!(header["alg"], "RS256");
        assert_eq!(header["nonce"], "test-nonce");
        assert!(header.get("jwk").is_some());
        assert!(header.get("kid").is_none());
        Ok(())
    }

    #[test]
    fn test_kid_identity_includes_kid_field() -> Result<()> {
        let key_pair = test_key_pair();
        let nonce = MockNonce::new("test-nonce");
        let jws = sign_request(
            &key_pair,
            SignerIdentity::AccountUrl("https://example.com/acme/acct/1"),
            &nonce,
            "https://example.com/acme/new-order",
            r#"{"identifiers":[]}"#,
        )?;

        let json = jws.to_json()?;
        let value: JsonValue = serde_json::from_str(&json)?;
        let protected: Vec<u8> = {
            use base64::Engine;
            base64::engine::general_purpose::URL_SAFE_NO_PAD
                .decode(value["protected"].as_str().unwrap())
                .unwrap()
        };
        let header: JsonValue = serde_json::from_slice(&protected)?;

        assert_eq!(header["kid"], "https://example.com/acme/acct/1");
        assert!(header.get("jwk").is_none());
        Ok(())
    }

    #[test]
    fn test_post_as_get_has_empty_payload() -> Result<()> {
        let key_pair = test_key_pair();
        let nonce = MockNonce::new("test-nonce");
        let jws = sign_request(
            &key_pair,
            SignerIdentity::AccountUrl("https://example.com/acme/acct/1"),
            &nonce,
            "https://example.com/acme/order/2",
            "",
        )?;

        let value: JsonValue = serde_json::from_str(&jws.to_json()?)?;
        assert_eq!(value["payload"], "");
        Ok(())
    }
}
