use std::path::PathBuf;

use openssl::{
    hash::MessageDigest,
    stack::Stack,
    x509::{extension::SubjectAlternativeName, X509NameBuilder, X509Req},
};
use thiserror::Error;
use tracing::info;

use crate::{
    config::{Config, ConfigError, RequestProfile},
    key_store::{KeyError, KeyPair, KeyStore},
    storage::{Storage, StorageError},
};

/// CSR 建立與檢驗過程可能發生的錯誤。
#[derive(Debug, Error)]
pub enum CsrError {
    #[error("OpenSSL error: {0}")]
    OpenSSL(#[from] openssl::error::ErrorStack),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("No subject alternative names defined for domain {0}")]
    NoSanDefined(String),
    #[error("No CSR found for domain at {0}")]
    CsrMissing(PathBuf),
    #[error("CSR signature verification failed: {0}")]
    VerificationFailed(PathBuf),
}

type Result<T> = std::result::Result<T, CsrError>;

/// 域名的 SAN 清單。
///
/// 第一個項目永遠是域名本身，其後為 `<label>.<domain>` 展開的完整名稱；
/// 重複項目會被去除。清單一律由組態推導，不從憑證回存。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanList {
    entries: Vec<String>,
}

impl SanList {
    /// 由域名與標籤清單建立 SAN 清單。
    ///
    /// # Errors
    ///
    /// 展開後清單為空（域名為空字串）時回傳 [`CsrError::NoSanDefined`]。
    pub fn build<S: AsRef<str>>(domain: &str, labels: &[S]) -> Result<Self> {
        let mut entries = Vec::with_capacity(labels.len() + 1);
        if !domain.is_empty() {
            entries.push(domain.to_string());
        }
        for label in labels {
            let label = label.as_ref();
            if label.is_empty() {
                continue;
            }
            let full = format!("{}.{}", label, domain);
            if !entries.contains(&full) {
                entries.push(full);
            }
        }

        if entries.is_empty() {
            return Err(CsrError::NoSanDefined(domain.to_string()));
        }
        Ok(SanList { entries })
    }

    /// 完整的 DNS 名稱清單，域名本身在最前。
    pub fn dns_names(&self) -> &[String] {
        &self.entries
    }

    /// 域名以外的別名，安裝時據此建立硬連結。
    pub fn aliases(&self) -> &[String] {
        &self.entries[1..]
    }

    /// OpenSSL 擴展欄位格式：`DNS:<domain>, DNS:<san1>.<domain>, ...`。
    pub fn extension_value(&self) -> String {
        self.entries
            .iter()
            .map(|name| format!("DNS:{}", name))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// CSR 的結構化檢視結果。
#[derive(Debug)]
pub struct CsrReport {
    /// 主體欄位，依憑證中出現的順序列出（欄位短名、值）。
    pub subject: Vec<(String, String)>,
    /// SAN 清單；僅於 verbose 檢視時填入，由組態重新推導。
    pub san: Option<Vec<String>>,
}

/// 建立與檢驗 PKCS#10 簽名請求。
///
/// CN 固定為域名，SAN 擴展由 [`SanList`] 提供，
/// 其餘主體欄位來自共用的簽名請求範本。
#[derive(Debug)]
pub struct CsrBuilder<'a> {
    storage: &'a dyn Storage,
    config: &'a Config,
}

impl<'a> CsrBuilder<'a> {
    pub fn new(storage: &'a dyn Storage, config: &'a Config) -> Self {
        Self { storage, config }
    }

    /// 由組態推導域名的 SAN 清單。
    pub fn san_list(&self, domain: &str) -> Result<SanList> {
        let labels = self.config.load_san_labels(self.storage, domain)?;
        SanList::build(domain, &labels)
    }

    /// 為域名建立 CSR 並寫入工作目錄。
    ///
    /// 金鑰不存在時會先建立；既有的 CSR 一律被覆寫。
    ///
    /// # 回傳
    ///
    /// 成功時回傳 CSR 檔案路徑。
    pub fn create(&self, domain: &str) -> Result<PathBuf> {
        let san_list = self.san_list(domain)?;
        let profile = self.config.load_profile(self.storage)?;
        let key_pair =
            KeyStore::new(self.storage).ensure(&self.config.key_path(domain), KeyPair::DEFAULT_BITS)?;

        let req = Self::build_request(domain, &san_list, &profile, &key_pair)?;

        let csr_path = self.config.csr_path(domain);
        self.storage.write(&csr_path, &req.to_pem()?)?;
        info!(domain, path = %csr_path.display(), sans = san_list.dns_names().len(), "CSR written");
        Ok(csr_path)
    }

    /// 根據 SAN 清單、範本與金鑰對構建 X509 簽名請求。
    fn build_request(
        domain: &str,
        san_list: &SanList,
        profile: &RequestProfile,
        key_pair: &KeyPair,
    ) -> Result<X509Req> {
        let mut subject = X509NameBuilder::new()?;
        subject.append_entry_by_text("C", &profile.country)?;
        subject.append_entry_by_text("ST", &profile.state)?;
        subject.append_entry_by_text("L", &profile.locality)?;
        subject.append_entry_by_text("O", &profile.organization)?;
        if let Some(ou) = &profile.organizational_unit {
            subject.append_entry_by_text("OU", ou)?;
        }
        subject.append_entry_by_text("CN", domain)?;
        subject.append_entry_by_text("emailAddress", &profile.email)?;
        let subject = subject.build();

        let mut req_builder = X509Req::builder()?;
        req_builder.set_subject_name(&subject)?;

        let mut san_builder = SubjectAlternativeName::new();
        for entry in san_list.dns_names() {
            san_builder.dns(entry);
        }
        let san_extension = san_builder.build(&req_builder.x509v3_context(None))?;

        let mut stack = Stack::new()?;
        stack.push(san_extension)?;
        req_builder.add_extensions(&stack)?;

        req_builder.set_pubkey(&key_pair.pri_key)?;
        req_builder.sign(&key_pair.pri_key, MessageDigest::sha256())?;

        Ok(req_builder.build())
    }

    /// 讀取既有 CSR。
    fn load(&self, domain: &str) -> Result<X509Req> {
        let path = self.config.csr_path(domain);
        let pem = match self.storage.read(&path) {
            Ok(pem) => pem,
            Err(StorageError::NotFound(_)) => return Err(CsrError::CsrMissing(path)),
            Err(e) => return Err(CsrError::Storage(e)),
        };
        Ok(X509Req::from_pem(&pem)?)
    }

    /// 讀取既有 CSR 並輸出 DER，供訂單最終化使用。
    pub fn load_der(&self, domain: &str) -> Result<Vec<u8>> {
        Ok(self.load(domain)?.to_der()?)
    }

    /// 以 CSR 內嵌的公鑰自我驗證簽名。
    ///
    /// # Errors
    ///
    /// CSR 不存在回傳 [`CsrError::CsrMissing`]；
    /// 簽名驗證未通過回傳 [`CsrError::VerificationFailed`]。
    pub fn verify(&self, domain: &str) -> Result<()> {
        let req = self.load(domain)?;
        let public_key = req.public_key()?;
        if !req.verify(&public_key)? {
            return Err(CsrError::VerificationFailed(self.config.csr_path(domain)));
        }
        Ok(())
    }

    /// 唯讀檢視 CSR 的主體欄位；verbose 時附上 SAN 清單。
    pub fn inspect(&self, domain: &str, verbose: bool) -> Result<CsrReport> {
        let req = self.load(domain)?;

        let subject = req
            .subject_name()
            .entries()
            .map(|entry| {
                let field = entry.object().nid().short_name().unwrap_or("UNDEF");
                let value = entry
                    .data()
                    .as_utf8()
                    .map(|s| s.to_string())
                    .unwrap_or_default();
                (field.to_string(), value)
            })
            .collect();

        let san = if verbose {
            Some(self.san_list(domain)?.dns_names().to_vec())
        } else {
            None
        };

        Ok(CsrReport { subject, san })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStorage;

    fn write_profile(storage: &MemStorage, config: &Config) {
        storage
            .write(
                &config.profile_path(),
                br#"{
                    "country": "DE",
                    "state": "Berlin",
                    "locality": "Berlin",
                    "organization": "Example GmbH",
                    "email": "hostmaster@example.com"
                }"#,
            )
            .unwrap();
    }

    #[test]
    fn test_san_list_starts_with_domain_and_dedups() -> Result<()> {
        let labels = vec!["www", "mail", "www"];
        let san_list = SanList::build("example.com", &labels)?;

        assert_eq!(
            san_list.dns_names(),
            &[
                "example.com".to_string(),
                "www.example.com".to_string(),
                "mail.example.com".to_string(),
            ]
        );
        assert_eq!(
            san_list.extension_value(),
            "DNS:example.com, DNS:www.example.com, DNS:mail.example.com"
        );
        assert_eq!(san_list.aliases(), &["www.example.com", "mail.example.com"]);
        Ok(())
    }

    #[test]
    fn test_empty_label_list_still_contains_domain() -> Result<()> {
        let san_list = SanList::build::<&str>("example.com", &[])?;
        assert_eq!(san_list.dns_names(), &["example.com".to_string()]);
        assert!(san_list.aliases().is_empty());
        Ok(())
    }

    #[test]
    fn test_empty_domain_is_no_san_error() {
        match SanList::build::<&str>("", &[]) {
            Err(CsrError::NoSanDefined(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_create_without_san_file_fails() {
        let storage = MemStorage::new();
        let config = Config::builder("/srv/certmill").build();
        write_profile(&storage, &config);

        let builder = CsrBuilder::new(&storage, &config);
        match builder.create("example.com") {
            Err(CsrError::Config(ConfigError::SanFileMissing { .. })) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_create_and_verify_round_trip() -> Result<()> {
        let storage = MemStorage::new();
        let config = Config::builder("/srv/certmill").build();
        write_profile(&storage, &config);
        storage.write(&config.san_file("example.com"), b"www\n")?;
        // 預先放入較短的金鑰，避免測試中生成 4096 位元金鑰
        KeyStore::new(&storage).create_key(&config.key_path("example.com"), 2048)?;

        let builder = CsrBuilder::new(&storage, &config);
        let csr_path = builder.create("example.com")?;
        assert!(storage.exists(&csr_path)?);
        assert!(storage.exists(&config.key_path("example.com"))?);

        builder.verify("example.com")?;
        Ok(())
    }

    #[test]
    fn test_verify_missing_csr() {
        let storage = MemStorage::new();
        let config = Config::builder("/srv/certmill").build();
        let builder = CsrBuilder::new(&storage, &config);

        match builder.verify("example.com") {
            Err(CsrError::CsrMissing(path)) => assert!(path.ends_with("example.com.csr")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_inspect_reports_subject_and_san() -> Result<()> {
        let storage = MemStorage::new();
        let config = Config::builder("/srv/certmill").build();
        write_profile(&storage, &config);
        storage.write(&config.san_file("example.com"), b"www\n")?;
        KeyStore::new(&storage).create_key(&config.key_path("example.com"), 2048)?;

        let builder = CsrBuilder::new(&storage, &config);
        builder.create("example.com")?;

        let report = builder.inspect("example.com", true)?;
        assert!(report
            .subject
            .iter()
            .any(|(field, value)| field == "CN" && value == "example.com"));
        assert!(report
            .subject
            .iter()
            .any(|(field, value)| field == "O" && value == "Example GmbH"));
        assert_eq!(
            report.san.as_deref(),
            Some(&["example.com".to_string(), "www.example.com".to_string()][..])
        );

        let terse = builder.inspect("example.com", false)?;
        assert!(terse.san.is_none());
        Ok(())
    }
}
