use std::path::PathBuf;

use thiserror::Error;
use tracing::info;

use crate::{
    account::{Account, AccountError},
    certificate::{Certificate, CertificateError},
    chain::{ChainError, ChainSplitter, SplitChain},
    config::{Config, ConfigError},
    csr::{CsrBuilder, CsrError, CsrReport},
    install::{InstallError, InstallReport, Installer},
    key_store::{KeyError, KeyPair, KeyStore},
    order::{Order, OrderError, PollConfig},
    renewal::{RenewalDecision, RenewalError, RenewalPolicy},
    storage::{Storage, StorageError},
};

/// 引擎層的錯誤，聚合各元件的錯誤類型。
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("Key already exists at {0}; overwriting must be requested explicitly")]
    KeyExists(PathBuf),
    #[error("CSR error: {0}")]
    Csr(#[from] CsrError),
    #[error("Account error: {0}")]
    Account(#[from] AccountError),
    #[error("Order error: {0}")]
    Order(#[from] OrderError),
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),
    #[error("Install error: {0}")]
    Install(#[from] InstallError),
    #[error("Certificate error: {0}")]
    Certificate(#[from] CertificateError),
    #[error("Renewal error: {0}")]
    Renewal(#[from] RenewalError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// 錯誤的穩定分類。
///
/// 外部 CLI 據此將結果映射為可枚舉的結束狀態碼；
/// 分類是封閉的，新增錯誤必須歸入既有分類或擴充此列舉。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Key,
    Csr,
    /// ACME 協議層的網路或格式錯誤。
    Protocol,
    /// CA 拒絕挑戰或訂單失效（終止狀態）。
    Challenge,
    ChainParse,
    Certificate,
    Install,
    Storage,
}

impl EngineError {
    /// 回傳錯誤所屬的穩定分類。
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Config(_) => ErrorKind::Configuration,
            EngineError::Key(_) | EngineError::KeyExists(_) => ErrorKind::Key,
            EngineError::Csr(_) => ErrorKind::Csr,
            EngineError::Account(_) => ErrorKind::Protocol,
            EngineError::Order(e) => match e {
                OrderError::Rejected { .. }
                | OrderError::Invalid { .. }
                | OrderError::PollTimeout { .. } => ErrorKind::Challenge,
                _ => ErrorKind::Protocol,
            },
            EngineError::Chain(_) => ErrorKind::ChainParse,
            EngineError::Install(_) => ErrorKind::Install,
            EngineError::Certificate(_) | EngineError::Renewal(_) => ErrorKind::Certificate,
            EngineError::Storage(_) => ErrorKind::Storage,
        }
    }
}

type Result<T> = std::result::Result<T, EngineError>;

/// 引擎支援的操作，以封閉列舉取代字串分派。
///
/// 新增操作時擴充此列舉並在 [`Engine::run`] 的單一分派點補上分支。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// 產生域名私鑰；`overwrite` 為 false 且金鑰已存在時拒絕執行。
    CreateKey { overwrite: bool },
    /// 建立（或重建）CSR；必要時一併產生金鑰。
    CreateCsr,
    /// 自我驗證 CSR 簽名。
    VerifyCsr,
    /// 唯讀檢視 CSR。
    ListCsr { verbose: bool },
    /// 依續約判斷執行完整簽發流程，結果寫入工作目錄。
    Renew { force: bool },
    /// 將工作目錄中的憑證安裝進系統目錄。
    Install,
    /// 續約後立即安裝。
    Run { force: bool },
}

/// 操作的成功結果。
#[derive(Debug)]
pub enum Outcome {
    KeyCreated(PathBuf),
    CsrCreated(PathBuf),
    CsrVerified,
    CsrInspected(CsrReport),
    /// 簽發完成，附上拆分後的憑證路徑。
    Renewed(SplitChain),
    /// 尚未到期，附上剩餘天數；外部 CLI 映射為獨立的結束狀態碼。
    NotDue { days_left: i64 },
    Installed(InstallReport),
}

/// 憑證生命週期引擎。
///
/// 一次處理一個域名；步驟嚴格依「金鑰 → CSR → ACME 簽發 → 鏈拆分 → 安裝」
/// 的順序執行，前一步成功前不開始下一步。
#[derive(Debug)]
pub struct Engine<'a> {
    storage: &'a dyn Storage,
    config: &'a Config,
    poll: PollConfig,
}

impl<'a> Engine<'a> {
    pub fn new(storage: &'a dyn Storage, config: &'a Config) -> Self {
        Self {
            storage,
            config,
            poll: PollConfig::default(),
        }
    }

    /// 覆寫輪詢參數（間隔、次數上限、期限）。
    pub fn with_poll_config(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    /// 唯一的操作分派點。
    pub fn run(&self, domain: &str, operation: Operation) -> Result<Outcome> {
        info!(domain, ?operation, "operation started");
        match operation {
            Operation::CreateKey { overwrite } => self.create_key(domain, overwrite),
            Operation::CreateCsr => {
                let path = CsrBuilder::new(self.storage, self.config).create(domain)?;
                Ok(Outcome::CsrCreated(path))
            }
            Operation::VerifyCsr => {
                CsrBuilder::new(self.storage, self.config).verify(domain)?;
                Ok(Outcome::CsrVerified)
            }
            Operation::ListCsr { verbose } => {
                let report = CsrBuilder::new(self.storage, self.config).inspect(domain, verbose)?;
                Ok(Outcome::CsrInspected(report))
            }
            Operation::Renew { force } => self.renew(domain, force),
            Operation::Install => {
                let report = Installer::new(self.storage, self.config).install(domain)?;
                Ok(Outcome::Installed(report))
            }
            Operation::Run { force } => match self.renew(domain, force)? {
                Outcome::NotDue { days_left } => Ok(Outcome::NotDue { days_left }),
                _ => {
                    let report = Installer::new(self.storage, self.config).install(domain)?;
                    Ok(Outcome::Installed(report))
                }
            },
        }
    }

    /// 產生域名私鑰。覆寫既有金鑰是破壞性操作，必須明確要求。
    fn create_key(&self, domain: &str, overwrite: bool) -> Result<Outcome> {
        let store = KeyStore::new(self.storage);
        let path = self.config.key_path(domain);
        if !overwrite && store.exists(&path)? {
            return Err(EngineError::KeyExists(path));
        }
        store.create_key(&path, KeyPair::DEFAULT_BITS)?;
        Ok(Outcome::KeyCreated(path))
    }

    /// 讀取工作目錄中的現任葉憑證；不存在時回傳 `None`。
    fn current_certificate(&self, domain: &str) -> Result<Option<Certificate>> {
        let path = self.config.cert_path(domain);
        match self.storage.read_to_string(&path) {
            Ok(pem) => Ok(Some(Certificate::from_pem(&pem)?)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(EngineError::Storage(e)),
        }
    }

    /// 續約入口：先做到期判斷，需要時才走完整簽發流程。
    fn renew(&self, domain: &str, force: bool) -> Result<Outcome> {
        let certificate = self.current_certificate(domain)?;
        let policy = RenewalPolicy::new(self.config.min_days_left);

        match policy.decide(certificate.as_ref(), force)? {
            RenewalDecision::NotDue { days_left } => Ok(Outcome::NotDue { days_left }),
            RenewalDecision::Due(reason) => {
                info!(domain, ?reason, "renewal due");
                let split = self.issue(domain)?;
                Ok(Outcome::Renewed(split))
            }
        }
    }

    /// 完整簽發流程：CSR → 訂單 → 挑戰 → 最終化 → 下載 → 拆分。
    ///
    /// 任何一步失敗都立即中止；原始鏈檔案只在下載成功後寫入，
    /// 拆分失敗時保留供事後檢查，成功後由拆分器刪除。
    fn issue(&self, domain: &str) -> Result<SplitChain> {
        let csr_builder = CsrBuilder::new(self.storage, self.config);
        csr_builder.create(domain)?;
        let san_list = csr_builder.san_list(domain)?;

        let account = Account::load(self.storage, self.config)?;
        let mut order = Order::submit(&account, san_list.dns_names())?;
        order.fulfill_http_challenges(&account, self.storage, &self.config.challenge_dir)?;
        order.wait_ready(&account, &self.poll)?;

        let csr_der = csr_builder.load_der(domain)?;
        order.finalize(&account, &csr_der)?;
        order.wait_valid(&account, &self.poll)?;

        let chain = order.download_certificate(&account)?;
        let artifact = self.config.chain_artifact_path(domain);
        self.storage.write(&artifact, chain.as_bytes())?;

        let split = ChainSplitter::new(self.storage, self.config).split(&artifact, domain)?;
        info!(domain, leaf = %split.leaf.display(), "certificate issued");
        Ok(split)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::test_support::make_cert_pem;
    use crate::storage::MemStorage;

    fn setup() -> (MemStorage, Config) {
        (MemStorage::new(), Config::builder("/srv/certmill").build())
    }

    #[test]
    fn test_create_key_refuses_silent_overwrite() {
        let (storage, config) = setup();
        let path = config.key_path("example.com");
        storage.write(&path, b"existing key").unwrap();

        let engine = Engine::new(&storage, &config);
        match engine.run("example.com", Operation::CreateKey { overwrite: false }) {
            Err(EngineError::KeyExists(p)) => assert_eq!(p, path),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        // 既有金鑰不得被動到
        assert_eq!(storage.read(&path).unwrap(), b"existing key");
    }

    #[test]
    fn test_verify_without_csr_maps_to_csr_kind() {
        let (storage, config) = setup();
        let engine = Engine::new(&storage, &config);

        let err = engine
            .run("example.com", Operation::VerifyCsr)
            .expect_err("verify must fail without a CSR");
        assert_eq!(err.kind(), ErrorKind::Csr);
    }

    #[test]
    fn test_renew_not_due_short_circuits() -> Result<()> {
        let (storage, config) = setup();
        // 46 天後到期 → 剩 45 天，高於預設門檻 30
        let pem = make_cert_pem("example.com", "Test CA", 46, &[]);
        storage
            .write(&config.cert_path("example.com"), pem.as_bytes())
            .unwrap();

        let engine = Engine::new(&storage, &config);
        match engine.run("example.com", Operation::Renew { force: false })? {
            Outcome::NotDue { days_left } => assert_eq!(days_left, 45),
            other => panic!("unexpected outcome: {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_run_not_due_skips_install() -> Result<()> {
        let (storage, config) = setup();
        let pem = make_cert_pem("example.com", "Test CA", 46, &[]);
        storage
            .write(&config.cert_path("example.com"), pem.as_bytes())
            .unwrap();

        let engine = Engine::new(&storage, &config);
        match engine.run("example.com", Operation::Run { force: false })? {
            Outcome::NotDue { .. } => {}
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(!storage
            .exists(&config.installed_cert_path("example.com"))
            .unwrap());
        Ok(())
    }

    #[test]
    fn test_error_kinds_are_stable() {
        let config_err = EngineError::Config(ConfigError::EmptyDomainList("x".into()));
        assert_eq!(config_err.kind(), ErrorKind::Configuration);

        let rejected = EngineError::Order(OrderError::Rejected {
            detail: "CA said no".to_string(),
        });
        assert_eq!(rejected.kind(), ErrorKind::Challenge);

        let key_err = EngineError::KeyExists("/keys/example.com.key".into());
        assert_eq!(key_err.kind(), ErrorKind::Key);
    }
}
