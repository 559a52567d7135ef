use thiserror::Error;
use tracing::info;

use crate::certificate::{Certificate, CertificateError};

/// 續約判斷過程可能發生的錯誤（僅憑證解析）。
#[derive(Debug, Error)]
pub enum RenewalError {
    #[error("Certificate error: {0}")]
    Certificate(#[from] CertificateError),
}

type Result<T> = std::result::Result<T, RenewalError>;

/// 續約判斷的結果。
///
/// `NotDue` 不是錯誤，而是帶資訊的決定；外部 CLI 會將其映射為
/// 獨立的結束狀態碼。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalDecision {
    /// 應進行續約。
    Due(RenewalReason),
    /// 尚未到期，附上計算出的剩餘天數。
    NotDue { days_left: i64 },
}

/// 觸發續約的原因。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalReason {
    /// 呼叫端強制續約。
    Forced,
    /// 尚無憑證。
    NoCertificate,
    /// 剩餘天數已達門檻。
    Expiring { days_left: i64 },
}

/// 以剩餘效期決定是否續約。
#[derive(Debug, Clone, Copy)]
pub struct RenewalPolicy {
    min_days_left: i64,
}

impl RenewalPolicy {
    pub fn new(min_days_left: i64) -> Self {
        Self { min_days_left }
    }

    /// 純判斷函式：`force` 或 `days_left <= min_days_left` 時續約。
    ///
    /// 對固定的 `force` 與門檻，本函式對 `days_left` 單調：
    /// 天數遞減時結果至多翻轉一次，且恰好發生在門檻值上。
    pub fn is_due(&self, days_left: i64, force: bool) -> bool {
        force || days_left <= self.min_days_left
    }

    /// 對域名當前的憑證做出續約決定。
    ///
    /// `certificate` 為 `None` 表示尚無憑證，一律續約。
    pub fn decide(&self, certificate: Option<&Certificate>, force: bool) -> Result<RenewalDecision> {
        if force {
            return Ok(RenewalDecision::Due(RenewalReason::Forced));
        }

        let certificate = match certificate {
            Some(certificate) => certificate,
            None => return Ok(RenewalDecision::Due(RenewalReason::NoCertificate)),
        };

        let days_left = certificate.days_left()?;
        if days_left <= self.min_days_left {
            Ok(RenewalDecision::Due(RenewalReason::Expiring { days_left }))
        } else {
            info!(days_left, min_days_left = self.min_days_left, "not due for renewal");
            Ok(RenewalDecision::NotDue { days_left })
        }
    }
}
