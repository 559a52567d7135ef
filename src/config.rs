use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::{
    directory::Endpoint,
    storage::{Storage, StorageError},
};

/// 組態載入過程可能發生的錯誤類型。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Required file is missing: {0}")]
    MissingFile(PathBuf),
    #[error("Domain list is empty: {0}")]
    EmptyDomainList(PathBuf),
    #[error("No SAN definition file for domain {domain}: {path}")]
    SanFileMissing { domain: String, path: PathBuf },
    #[error("Invalid request profile {path}: {source}")]
    InvalidProfile {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

type Result<T> = std::result::Result<T, ConfigError>;

/// 簽名請求範本，提供 CSR 主體中除 CN 以外的欄位。
///
/// 此範本由外部協作者維護（`etc/request-profile.json`），本庫僅讀取。
#[derive(Debug, Clone, Deserialize)]
pub struct RequestProfile {
    pub country: String,
    pub state: String,
    pub locality: String,
    pub organization: String,
    #[serde(default)]
    pub organizational_unit: Option<String>,
    pub email: String,
}

/// 一次呼叫的完整組態。
///
/// 建構完成後不可變，以引用方式傳入各元件；整個庫沒有任何
/// 行程層級的可變狀態。
#[derive(Debug)]
pub struct Config {
    /// 域名工作金鑰目錄（`keys/<domain>.key`）。
    pub key_dir: PathBuf,
    /// 工作憑證與 CSR 目錄（`certs/<domain>.csr`、`certs/<domain>.crt`）。
    pub cert_dir: PathBuf,
    /// 組態檔目錄（`domain.txt`、`<domain>-san.txt`、請求範本）。
    pub etc_dir: PathBuf,
    /// ACME 挑戰目錄，由外部網頁伺服器以
    /// `/.well-known/acme-challenge/` 路徑對外提供。
    pub challenge_dir: PathBuf,
    /// 系統憑證安裝目錄。
    pub install_cert_dir: PathBuf,
    /// 系統金鑰安裝目錄。
    pub install_key_dir: PathBuf,
    /// 網頁伺服器重載指令；空清單表示跳過重載（僅限測試環境）。
    pub reload_command: Vec<String>,
    /// 選定的 ACME 端點，production 與 staging 互斥。
    pub endpoint: Endpoint,
    /// 續約門檻：剩餘天數小於等於此值時觸發續約。
    pub min_days_left: i64,
    /// 中繼憑證的檔名前綴。
    pub intermediate_prefix: String,
    /// 簽發者比對標記，命中者歸類為中繼／交叉簽署憑證。
    pub ca_issuer_markers: Vec<String>,
    /// CN 佔位符標記；包含這些字樣的 CN 不視為葉憑證。
    pub leaf_placeholder_tokens: Vec<String>,
}

impl Config {
    /// 以預設目錄配置建立 [`ConfigBuilder`]。
    pub fn builder(base_dir: impl Into<PathBuf>) -> ConfigBuilder {
        ConfigBuilder::new(base_dir)
    }

    /// 域名私鑰檔案路徑。
    pub fn key_path(&self, domain: &str) -> PathBuf {
        self.key_dir.join(format!("{}.key", domain))
    }

    /// 域名 CSR 檔案路徑。
    pub fn csr_path(&self, domain: &str) -> PathBuf {
        self.cert_dir.join(format!("{}.csr", domain))
    }

    /// 域名葉憑證檔案路徑。
    pub fn cert_path(&self, domain: &str) -> PathBuf {
        self.cert_dir.join(format!("{}.crt", domain))
    }

    /// CA 回傳的原始憑證鏈暫存路徑；拆分成功後即刪除。
    pub fn chain_artifact_path(&self, domain: &str) -> PathBuf {
        self.cert_dir.join(format!("{}-chain.pem", domain))
    }

    /// 域名清單檔案路徑（第一行為預設域名）。
    pub fn domain_file(&self) -> PathBuf {
        self.etc_dir.join("domain.txt")
    }

    /// 域名 SAN 標籤檔案路徑。
    pub fn san_file(&self, domain: &str) -> PathBuf {
        self.etc_dir.join(format!("{}-san.txt", domain))
    }

    /// 簽名請求範本路徑。
    pub fn profile_path(&self) -> PathBuf {
        self.etc_dir.join("request-profile.json")
    }

    /// ACME 帳戶金鑰路徑；檔案必須事先備妥，本庫不註冊帳戶。
    pub fn account_key_path(&self) -> PathBuf {
        self.etc_dir.join("account.key")
    }

    /// 帳戶 URL 快取路徑。
    pub fn account_url_cache_path(&self) -> PathBuf {
        self.etc_dir.join("account-url.txt")
    }

    /// 目錄文件快取路徑。
    pub fn directory_cache_path(&self) -> PathBuf {
        self.etc_dir.join("directory.json")
    }

    /// 系統安裝憑證路徑；`name` 為域名或 SAN 別名。
    pub fn installed_cert_path(&self, name: &str) -> PathBuf {
        self.install_cert_dir.join(format!("{}.crt", name))
    }

    /// 系統安裝金鑰路徑。
    pub fn installed_key_path(&self, domain: &str) -> PathBuf {
        self.install_key_dir.join(format!("{}.key", domain))
    }

    /// 讀取受管理的域名清單。
    ///
    /// 第一行為預設域名；空行與 `#` 開頭的註解行會被略過。
    ///
    /// # Errors
    ///
    /// 檔案不存在回傳 [`ConfigError::MissingFile`]；
    /// 清單為空回傳 [`ConfigError::EmptyDomainList`]。
    pub fn load_domains(&self, storage: &dyn Storage) -> Result<Vec<String>> {
        let path = self.domain_file();
        let content = match storage.read_to_string(&path) {
            Ok(content) => content,
            Err(StorageError::NotFound(_)) => return Err(ConfigError::MissingFile(path)),
            Err(e) => return Err(ConfigError::Storage(e)),
        };

        let domains: Vec<String> = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_owned)
            .collect();

        if domains.is_empty() {
            return Err(ConfigError::EmptyDomainList(path));
        }
        Ok(domains)
    }

    /// 讀取域名的 SAN 標籤清單。
    ///
    /// 標籤為相對名稱，完整 SAN 為 `<label>.<domain>`。
    /// 檔案存在但為空是合法的（SAN 清單仍包含域名本身）；
    /// 檔案不存在則是組態錯誤。
    pub fn load_san_labels(&self, storage: &dyn Storage, domain: &str) -> Result<Vec<String>> {
        let path = self.san_file(domain);
        let content = match storage.read_to_string(&path) {
            Ok(content) => content,
            Err(StorageError::NotFound(_)) => {
                return Err(ConfigError::SanFileMissing {
                    domain: domain.to_string(),
                    path,
                })
            }
            Err(e) => return Err(ConfigError::Storage(e)),
        };

        Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_owned)
            .collect())
    }

    /// 讀取簽名請求範本。
    pub fn load_profile(&self, storage: &dyn Storage) -> Result<RequestProfile> {
        let path = self.profile_path();
        let content = match storage.read(&path) {
            Ok(content) => content,
            Err(StorageError::NotFound(_)) => return Err(ConfigError::MissingFile(path)),
            Err(e) => return Err(ConfigError::Storage(e)),
        };

        serde_json::from_slice(&content)
            .map_err(|source| ConfigError::InvalidProfile { path, source })
    }
}

/// [`Config`] 的構造器，提供與目錄佈局對應的預設值。
pub struct ConfigBuilder {
    base_dir: PathBuf,
    key_dir: Option<PathBuf>,
    cert_dir: Option<PathBuf>,
    etc_dir: Option<PathBuf>,
    challenge_dir: Option<PathBuf>,
    install_cert_dir: Option<PathBuf>,
    install_key_dir: Option<PathBuf>,
    reload_command: Vec<String>,
    endpoint: Endpoint,
    min_days_left: i64,
    intermediate_prefix: String,
    ca_issuer_markers: Vec<String>,
    leaf_placeholder_tokens: Vec<String>,
}

impl ConfigBuilder {
    /// 預設的續約門檻天數。
    const DEFAULT_MIN_DAYS_LEFT: i64 = 30;
    /// 預設的中繼憑證檔名前綴。
    const DEFAULT_INTERMEDIATE_PREFIX: &'static str = "lets-encrypt-x1-cross-signed";

    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        ConfigBuilder {
            base_dir: base_dir.into(),
            key_dir: None,
            cert_dir: None,
            etc_dir: None,
            challenge_dir: None,
            install_cert_dir: None,
            install_key_dir: None,
            reload_command: Vec::new(),
            endpoint: Endpoint::Production,
            min_days_left: Self::DEFAULT_MIN_DAYS_LEFT,
            intermediate_prefix: Self::DEFAULT_INTERMEDIATE_PREFIX.to_string(),
            ca_issuer_markers: vec![
                "Let's Encrypt".to_string(),
                "ISRG".to_string(),
                "(STAGING)".to_string(),
                "Fake LE".to_string(),
            ],
            leaf_placeholder_tokens: vec![
                "Fake LE".to_string(),
                "(STAGING)".to_string(),
                "happy hacker".to_string(),
            ],
        }
    }

    pub fn key_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.key_dir = Some(dir.into());
        self
    }

    pub fn cert_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cert_dir = Some(dir.into());
        self
    }

    pub fn etc_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.etc_dir = Some(dir.into());
        self
    }

    pub fn challenge_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.challenge_dir = Some(dir.into());
        self
    }

    pub fn install_cert_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.install_cert_dir = Some(dir.into());
        self
    }

    pub fn install_key_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.install_key_dir = Some(dir.into());
        self
    }

    pub fn reload_command<S: Into<String>>(mut self, command: Vec<S>) -> Self {
        self.reload_command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn min_days_left(mut self, days: i64) -> Self {
        self.min_days_left = days;
        self
    }

    pub fn intermediate_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.intermediate_prefix = prefix.into();
        self
    }

    pub fn build(self) -> Config {
        let base = &self.base_dir;
        Config {
            key_dir: self.key_dir.unwrap_or_else(|| base.join("keys")),
            cert_dir: self.cert_dir.unwrap_or_else(|| base.join("certs")),
            etc_dir: self.etc_dir.unwrap_or_else(|| base.join("etc")),
            challenge_dir: self
                .challenge_dir
                .unwrap_or_else(|| base.join("challenges")),
            install_cert_dir: self
                .install_cert_dir
                .unwrap_or_else(|| base.join("system/certs")),
            install_key_dir: self
                .install_key_dir
                .unwrap_or_else(|| base.join("system/private")),
            reload_command: self.reload_command,
            endpoint: self.endpoint,
            min_days_left: self.min_days_left,
            intermediate_prefix: self.intermediate_prefix,
            ca_issuer_markers: self.ca_issuer_markers,
            leaf_placeholder_tokens: self.leaf_placeholder_tokens,
        }
    }
}
