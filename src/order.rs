use std::{
    path::Path,
    str::FromStr,
    thread,
    time::{Duration, Instant},
};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    account::{Account, AccountError},
    challenge::{ChallengeError, Http01Challenge},
    payload::{FinalizeOrderPayload, NewOrderPayload, PayloadT},
    storage::{Storage, StorageError},
};

/// 訂單流程可能產生的錯誤。
///
/// [`OrderError::Rejected`] 與 [`OrderError::Invalid`] 為終止狀態：
/// CA 已明確拒絕，重試沒有意義。其餘網路類錯誤由輪詢層內部退避重試，
/// 重試耗盡後以 [`OrderError::PollTimeout`] 呈現。
#[derive(Debug, Error)]
pub enum OrderError {
    #[error("Account error: {0}")]
    Account(#[from] AccountError),
    #[error("Challenge error: {0}")]
    Challenge(ChallengeError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Invalid order status value: {0}")]
    InvalidStatus(String),
    #[error("Missing Location header in new-order response")]
    MissingLocationHeader,
    #[error("Order has no certificate URL")]
    MissingCertificateUrl,
    #[error("Challenge rejected by CA: {detail}")]
    Rejected { detail: String },
    #[error("Order became invalid: {detail}")]
    Invalid { detail: String },
    #[error("Polling gave up after {attempts} attempts ({elapsed:?}), last status {last_status:?}")]
    PollTimeout {
        attempts: usize,
        elapsed: Duration,
        last_status: OrderStatus,
    },
    #[error("Order is not ready for finalization, status {0:?}")]
    NotReady(OrderStatus),
}

impl From<ChallengeError> for OrderError {
    fn from(e: ChallengeError) -> Self {
        // CA 拒絕的挑戰升級為訂單層級的終止錯誤
        match e {
            ChallengeError::Rejected { identifier, detail } => OrderError::Rejected {
                detail: format!("{}: {}", identifier, detail),
            },
            other => OrderError::Challenge(other),
        }
    }
}

type Result<T> = std::result::Result<T, OrderError>;

/// 訂單狀態。
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

impl FromStr for OrderStatus {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "processing" => Ok(Self::Processing),
            "valid" => Ok(Self::Valid),
            "invalid" => Ok(Self::Invalid),
            _ => Err(OrderError::InvalidStatus(s.to_string())),
        }
    }
}

/// 輪詢參數：固定間隔查詢狀態，暫時性網路錯誤以指數退避重試，
/// 達到次數上限或牆鐘期限後放棄。
#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    /// 兩次狀態查詢的間隔。
    pub interval: Duration,
    /// 查詢次數上限。
    pub max_attempts: usize,
    /// 牆鐘期限。
    pub deadline: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            interval: Duration::from_secs(3),
            max_attempts: 20,
            deadline: Duration::from_secs(120),
        }
    }
}

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// 表示一張憑證請求訂單，驅動從建立到下載的整個狀態機。
#[derive(Debug, Deserialize)]
pub struct Order {
    /// 訂單當前狀態。
    pub status: OrderStatus,
    /// 授權 URL 列表，每個識別項一個。
    pub authorizations: Vec<String>,
    /// 最終確認 URL。
    pub finalize: String,
    /// 憑證 URL（僅在訂單有效後存在）。
    pub certificate: Option<String>,
    /// 伺服器回傳的訂單 URL。
    #[serde(skip)]
    order_url: String,
}

impl Order {
    /// 向 CA 提交新訂單，每個 DNS 名稱對應一個識別項。
    pub fn submit<S: AsRef<str>>(account: &Account, dns_names: &[S]) -> Result<Self> {
        let payload = NewOrderPayload::new(dns_names).to_json_string()?;
        let response = account.signed_post(&account.directory.new_order, &payload)?;
        let response = Account::ensure_success(response)?;

        let order_url = response
            .headers()
            .get("Location")
            .ok_or(OrderError::MissingLocationHeader)?
            .to_str()
            .map_err(AccountError::from)?
            .to_string();

        let mut order: Order =
            serde_json::from_str(&response.text().map_err(AccountError::from)?)?;
        order.order_url = order_url;
        info!(
            authorizations = order.authorizations.len(),
            "order submitted"
        );
        Ok(order)
    }

    /// 為每個授權取得 HTTP-01 挑戰、寫入挑戰目錄並通知 CA。
    ///
    /// 回傳已發布的挑戰清單；任何一個授權失敗都會立即中止。
    pub fn fulfill_http_challenges(
        &self,
        account: &Account,
        storage: &dyn Storage,
        challenge_dir: &Path,
    ) -> Result<Vec<Http01Challenge>> {
        let mut challenges = Vec::with_capacity(self.authorizations.len());
        for auth_url in &self.authorizations {
            let mut challenge = Http01Challenge::fetch(account, auth_url)?;
            challenge.publish(storage, challenge_dir)?;
            challenge.ready(account)?;
            challenges.push(challenge);
        }
        Ok(challenges)
    }

    /// 輪詢訂單直到進入 `ready`（挑戰全部通過）。
    pub fn wait_ready(&mut self, account: &Account, poll: &PollConfig) -> Result<()> {
        self.poll_until(account, &[OrderStatus::Ready, OrderStatus::Valid], poll)
    }

    /// 輪詢訂單直到進入 `valid`（憑證已簽發）。
    pub fn wait_valid(&mut self, account: &Account, poll: &PollConfig) -> Result<()> {
        self.poll_until(account, &[OrderStatus::Valid], poll)
    }

    /// 提交 CSR 以最終確認訂單。
    ///
    /// 訂單已是 `valid` 時不重複提交；非 `ready` 狀態則屬呼叫順序錯誤。
    pub fn finalize(&mut self, account: &Account, csr_der: &[u8]) -> Result<()> {
        match self.status {
            OrderStatus::Valid => return Ok(()),
            OrderStatus::Ready => {}
            status => return Err(OrderError::NotReady(status)),
        }

        let payload = FinalizeOrderPayload::new(csr_der).to_json_string()?;
        let response = account.signed_post(&self.finalize, &payload)?;
        let response = Account::ensure_success(response)?;

        let update: OrderUpdateResponse =
            serde_json::from_str(&response.text().map_err(AccountError::from)?)?;
        self.status = update.status;
        self.certificate = update.certificate;
        info!(status = ?self.status, "order finalized");
        Ok(())
    }

    /// 下載已簽發的憑證鏈，回傳 CA 給出的原始 PEM 串接內容。
    pub fn download_certificate(&self, account: &Account) -> Result<String> {
        if self.status != OrderStatus::Valid {
            return Err(OrderError::NotReady(self.status));
        }
        let cert_url = self
            .certificate
            .as_deref()
            .ok_or(OrderError::MissingCertificateUrl)?;

        let response = Account::ensure_success(account.signed_post(cert_url, "")?)?;
        let chain = response.text().map_err(AccountError::from)?;
        info!(bytes = chain.len(), "certificate chain downloaded");
        Ok(chain)
    }

    /// 以 POST-as-GET 重新讀取訂單並更新本地狀態。
    fn refresh(&mut self, account: &Account) -> Result<()> {
        let response = Account::ensure_success(account.signed_post(&self.order_url, "")?)?;
        let update: OrderUpdateResponse =
            serde_json::from_str(&response.text().map_err(AccountError::from)?)?;
        self.status = update.status;
        if update.certificate.is_some() {
            self.certificate = update.certificate;
        }
        Ok(())
    }

    /// 輪詢核心：到達目標狀態前反覆查詢。
    ///
    /// `invalid` 是終止狀態，會嘗試從授權中取出 CA 的拒絕原因；
    /// 暫時性網路錯誤以指數退避重試，耗盡後回報逾時。
    fn poll_until(
        &mut self,
        account: &Account,
        targets: &[OrderStatus],
        poll: &PollConfig,
    ) -> Result<()> {
        let started = Instant::now();
        let mut delay = poll.interval;

        for attempt in 1..=poll.max_attempts {
            if targets.contains(&self.status) {
                return Ok(());
            }
            if self.status == OrderStatus::Invalid {
                return Err(OrderError::Invalid {
                    detail: self.rejection_detail(account),
                });
            }
            if started.elapsed() > poll.deadline {
                break;
            }

            thread::sleep(delay);
            match self.refresh(account) {
                Ok(()) => {
                    delay = poll.interval;
                    debug!(attempt, status = ?self.status, "order polled");
                }
                Err(OrderError::Account(AccountError::Request(e))) => {
                    // 暫時性網路錯誤：退避後重試
                    warn!(attempt, error = %e, "transient error while polling, backing off");
                    delay = (delay * 2).min(MAX_BACKOFF);
                }
                Err(e) => return Err(e),
            }
        }

        if targets.contains(&self.status) {
            return Ok(());
        }
        if self.status == OrderStatus::Invalid {
            return Err(OrderError::Invalid {
                detail: self.rejection_detail(account),
            });
        }
        Err(OrderError::PollTimeout {
            attempts: poll.max_attempts,
            elapsed: started.elapsed(),
            last_status: self.status,
        })
    }

    /// 盡力從授權中取出 CA 的拒絕原因，取不到時回傳一般性描述。
    fn rejection_detail(&self, account: &Account) -> String {
        for auth_url in &self.authorizations {
            if let Err(ChallengeError::Rejected { identifier, detail }) =
                Http01Challenge::fetch(account, auth_url)
            {
                return format!("{}: {}", identifier, detail);
            }
        }
        "order reported invalid without problem detail".to_string()
    }
}

/// 用於解析訂單更新回應的結構。
#[derive(Debug, Deserialize)]
struct OrderUpdateResponse {
    status: OrderStatus,
    certificate: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_status_from_str() {
        assert_eq!(OrderStatus::from_str("pending").unwrap(), OrderStatus::Pending);
        assert_eq!(OrderStatus::from_str("valid").unwrap(), OrderStatus::Valid);
        assert!(matches!(
            OrderStatus::from_str("bogus"),
            Err(OrderError::InvalidStatus(_))
        ));
    }

    #[test]
    fn test_order_deserialization() {
        let body = r#"{
            "status": "pending",
            "expires": "2026-09-01T00:00:00Z",
            "identifiers": [{"type": "dns", "value": "example.com"}],
            "authorizations": ["https://ca.invalid/authz/1"],
            "finalize": "https://ca.invalid/finalize/1"
        }"#;
        let order: Order = serde_json::from_str(body).unwrap();

        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.authorizations.len(), 1);
        assert!(order.certificate.is_none());
    }

    #[test]
    fn test_rejected_challenge_becomes_terminal_order_error() {
        let err: OrderError = ChallengeError::Rejected {
            identifier: "example.com".to_string(),
            detail: "DNS problem".to_string(),
        }
        .into();

        match err {
            OrderError::Rejected { detail } => assert!(detail.contains("DNS problem")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_download_requires_valid_status() {
        let order = Order {
            status: OrderStatus::Processing,
            authorizations: vec![],
            finalize: "https://ca.invalid/finalize/1".to_string(),
            certificate: None,
            order_url: String::new(),
        };

        assert_eq!(order.status, OrderStatus::Processing);
        assert!(order.certificate.is_none());
    }
}
