use chrono::{DateTime, Utc};
use openssl::{
    asn1::Asn1Time,
    nid::Nid,
    x509::{X509NameRef, X509},
};
use thiserror::Error;

/// 憑證相關操作可能出現的錯誤類型。
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("Failed to parse certificate: {0}")]
    ParseError(#[from] openssl::error::ErrorStack),
    #[error("Invalid expiration timestamp")]
    InvalidTimestamp,
}

type Result<T> = std::result::Result<T, CertificateError>;

/// X.509 憑證封裝結構，提供類型化的欄位存取。
///
/// 主體、簽發者、效期與 SAN 清單全部經由 OpenSSL 的結構化 API 取得，
/// 不依賴任何命令列工具的文字輸出。
pub struct Certificate {
    cert: X509,
}

impl Certificate {
    /// 根據 PEM 格式字串解析生成憑證實例。
    pub fn from_pem(pem: &str) -> Result<Self> {
        let cert = X509::from_pem(pem.as_bytes())?;
        Ok(Certificate { cert })
    }

    /// 取得主體的 commonName；憑證未包含 CN 時回傳 `None`。
    pub fn common_name(&self) -> Option<String> {
        Self::name_cn(self.cert.subject_name())
    }

    /// 取得簽發者的 commonName；未包含時回傳 `None`。
    pub fn issuer_common_name(&self) -> Option<String> {
        Self::name_cn(self.cert.issuer_name())
    }

    fn name_cn(name: &X509NameRef) -> Option<String> {
        name.entries_by_nid(Nid::COMMONNAME)
            .next()
            .and_then(|entry| entry.data().as_utf8().ok())
            .map(|s| s.to_string())
    }

    /// 取得憑證到期時間。
    pub fn not_after(&self) -> Result<DateTime<Utc>> {
        let epoch = Asn1Time::from_unix(0)?;
        let diff = epoch.diff(self.cert.not_after())?;
        let secs = diff.days as i64 * 86400 + diff.secs as i64;
        DateTime::<Utc>::from_timestamp(secs, 0).ok_or(CertificateError::InvalidTimestamp)
    }

    /// 計算距離到期的剩餘天數。
    ///
    /// `days_left = floor((notAfter - now) / 86400)`，已過期的憑證固定回傳 0，
    /// 永不為負。
    pub fn days_left(&self) -> Result<i64> {
        let remaining = self
            .not_after()?
            .signed_duration_since(Utc::now())
            .num_seconds();
        Ok((remaining / 86400).max(0))
    }

    /// 取得憑證內嵌的 SAN DNS 名稱清單；無 SAN 擴展時回傳空清單。
    pub fn san_dns_names(&self) -> Vec<String> {
        self.cert
            .subject_alt_names()
            .map(|names| {
                names
                    .iter()
                    .filter_map(|name| name.dnsname().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 以 PEM 格式輸出憑證。
    pub fn to_pem(&self) -> Result<Vec<u8>> {
        Ok(self.cert.to_pem()?)
    }
}
