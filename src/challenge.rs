use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    account::{Account, AccountError},
    payload::{ChallengeReadyPayload, PayloadT},
    storage::{Storage, StorageError},
};

/// 挑戰流程相關的錯誤類型。
#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("Account error: {0}")]
    Account(#[from] AccountError),
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Invalid challenge status: {0}")]
    InvalidStatus(String),
    #[error("No http-01 challenge offered for authorization {0}")]
    NoHttpChallenge(String),
    #[error("Challenge token contains invalid characters: {0}")]
    InvalidToken(String),
    /// CA 明確拒絕挑戰，屬於終止狀態，不可重試。
    #[error("Challenge rejected by CA for {identifier}: {detail}")]
    Rejected { identifier: String, detail: String },
}

type Result<T> = std::result::Result<T, ChallengeError>;

/// 表示 ACME 挑戰的狀態。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

impl ChallengeStatus {
    fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "valid" => Some(Self::Valid),
            "invalid" => Some(Self::Invalid),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct AuthorizationResponse {
    identifier: IdentifierResponse,
    challenges: Vec<ChallengeResponse>,
}

#[derive(Deserialize)]
struct IdentifierResponse {
    value: String,
}

#[derive(Deserialize)]
struct ChallengeResponse {
    r#type: String,
    url: String,
    status: String,
    token: String,
    error: Option<ProblemDetail>,
}

#[derive(Deserialize)]
struct ProblemDetail {
    #[serde(rename = "type")]
    problem_type: String,
    detail: String,
}

/// 一個 HTTP-01 驗證挑戰。
///
/// key authorization 為 `<token>.<thumbprint>`，必須經由外部網頁伺服器
/// 在 `/.well-known/acme-challenge/<token>` 以純 HTTP 提供。
#[derive(Debug, Clone)]
pub struct Http01Challenge {
    /// 挑戰所屬的識別項（DNS 名稱）。
    pub identifier: String,
    /// 挑戰驗證的 URL。
    pub url: String,
    /// 挑戰 token。
    pub token: String,
    /// 當前挑戰狀態。
    pub status: ChallengeStatus,
    /// key authorization 字串。
    pub key_authorization: String,
}

impl Http01Challenge {
    /// 從授權 URL 取得 HTTP-01 挑戰。
    ///
    /// # Errors
    ///
    /// 授權中沒有 http-01 挑戰時回傳 [`ChallengeError::NoHttpChallenge`]；
    /// 已被 CA 拒絕的挑戰回傳 [`ChallengeError::Rejected`]。
    pub fn fetch(account: &Account, auth_url: &str) -> Result<Self> {
        let response = Account::ensure_success(account.signed_post(auth_url, "")?)?;
        let authorization: AuthorizationResponse =
            serde_json::from_str(&response.text().map_err(AccountError::from)?)?;
        let identifier = authorization.identifier.value;

        let challenge = authorization
            .challenges
            .into_iter()
            .find(|c| c.r#type == "http-01")
            .ok_or_else(|| ChallengeError::NoHttpChallenge(auth_url.to_string()))?;

        let status = ChallengeStatus::from_str(&challenge.status)
            .ok_or_else(|| ChallengeError::InvalidStatus(challenge.status.clone()))?;

        if status == ChallengeStatus::Invalid {
            let detail = challenge
                .error
                .map(|e| format!("{}: {}", e.problem_type, e.detail))
                .unwrap_or_else(|| "unknown CA error".to_string());
            return Err(ChallengeError::Rejected { identifier, detail });
        }

        let thumbprint = account
            .key_pair
            .thumbprint()
            .map_err(AccountError::from)?;
        let key_authorization = format!("{}.{}", challenge.token, thumbprint);

        Ok(Http01Challenge {
            identifier,
            url: challenge.url,
            token: challenge.token,
            status,
            key_authorization,
        })
    }

    /// 將 key authorization 寫入挑戰目錄，檔名即 token。
    ///
    /// 外部網頁伺服器負責讓該檔案在
    /// `/.well-known/acme-challenge/<token>` 可被存取；
    /// 驗證完成後的清理同樣由外部協作者處理。
    pub fn publish(&self, storage: &dyn Storage, challenge_dir: &Path) -> Result<PathBuf> {
        if !Self::token_is_safe(&self.token) {
            return Err(ChallengeError::InvalidToken(self.token.clone()));
        }

        let path = challenge_dir.join(&self.token);
        storage.write(&path, self.key_authorization.as_bytes())?;
        info!(
            identifier = %self.identifier,
            path = %path.display(),
            "challenge response published"
        );
        Ok(path)
    }

    /// 挑戰在網頁伺服器上的公開路徑。
    pub fn well_known_path(&self) -> String {
        format!("/.well-known/acme-challenge/{}", self.token)
    }

    /// 通知 CA 挑戰已就緒並更新本地狀態。
    pub fn ready(&mut self, account: &Account) -> Result<()> {
        if self.status == ChallengeStatus::Valid {
            return Ok(());
        }

        let payload = ChallengeReadyPayload::new()
            .to_json_string()
            .map_err(ChallengeError::Json)?;
        let response = account.signed_post(&self.url, &payload)?;
        let status_code = response.status();
        let body = response.text().map_err(AccountError::from)?;

        let update: ChallengeResponse = serde_json::from_str(&body)?;
        self.status = ChallengeStatus::from_str(&update.status)
            .ok_or_else(|| ChallengeError::InvalidStatus(update.status.clone()))?;
        debug!(identifier = %self.identifier, status = ?self.status, "challenge acknowledged");

        if self.status == ChallengeStatus::Invalid || !status_code.is_success() {
            let detail = update
                .error
                .map(|e| format!("{}: {}", e.problem_type, e.detail))
                .unwrap_or_else(|| format!("HTTP {}", status_code));
            return Err(ChallengeError::Rejected {
                identifier: self.identifier.clone(),
                detail,
            });
        }
        Ok(())
    }

    /// token 只允許 URL-safe Base64 字元，防止寫入挑戰目錄之外的路徑。
    fn token_is_safe(token: &str) -> bool {
        !token.is_empty()
            && token
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    }
}
