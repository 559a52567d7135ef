use std::{
    fmt,
    path::{Path, PathBuf},
    process::Command,
};

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    certificate::Certificate,
    config::Config,
    csr::{CsrBuilder, CsrError, SanList},
    storage::{Storage, StorageError},
};

/// 安裝流程的步驟名稱，錯誤回報時指出失敗位置。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStep {
    Backup,
    RemoveAlias,
    CopyCertificate,
    LinkAlias,
    InstallKey,
    Reload,
}

impl fmt::Display for InstallStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstallStep::Backup => "backup",
            InstallStep::RemoveAlias => "remove-alias",
            InstallStep::CopyCertificate => "copy-certificate",
            InstallStep::LinkAlias => "link-alias",
            InstallStep::InstallKey => "install-key",
            InstallStep::Reload => "reload",
        };
        f.write_str(name)
    }
}

/// 安裝過程可能發生的錯誤；每一步失敗都立即中止，不回滾先前步驟。
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("No leaf certificate for domain at {0}")]
    CertificateMissing(PathBuf),
    #[error("Install step {step} failed at {path}: {source}")]
    Step {
        step: InstallStep,
        path: PathBuf,
        #[source]
        source: StorageError,
    },
    #[error("Web server reload failed ({command}): {detail}")]
    Reload { command: String, detail: String },
    #[error("CSR error: {0}")]
    Csr(#[from] CsrError),
}

type Result<T> = std::result::Result<T, InstallError>;

/// 內嵌 SAN 集合與組態 SAN 集合的差異。
///
/// 移除別名時重新推導的是「現在的」組態清單；若組態在簽發後變動，
/// 舊憑證的別名檔案可能殘留。此結構讓呼叫端看見差異，而非默默修正。
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SanDrift {
    /// 舊憑證涵蓋、但目前組態已不含的名稱（別名檔案可能殘留）。
    pub orphaned: Vec<String>,
    /// 目前組態新增、舊憑證未涵蓋的名稱。
    pub added: Vec<String>,
}

impl SanDrift {
    pub fn is_empty(&self) -> bool {
        self.orphaned.is_empty() && self.added.is_empty()
    }
}

/// 安裝結果摘要。
#[derive(Debug)]
pub struct InstallReport {
    /// 既有憑證的備份路徑；首次安裝為 `None`。
    pub backup: Option<PathBuf>,
    /// 安裝後的系統憑證路徑。
    pub installed_cert: PathBuf,
    /// 安裝後的系統金鑰路徑。
    pub installed_key: PathBuf,
    /// 本次建立的別名硬連結。
    pub aliases: Vec<PathBuf>,
    /// SAN 集合差異。
    pub drift: SanDrift,
}

/// 將工作目錄中的憑證與金鑰安裝進系統目錄並重載網頁伺服器。
#[derive(Debug)]
pub struct Installer<'a> {
    storage: &'a dyn Storage,
    config: &'a Config,
}

impl<'a> Installer<'a> {
    pub fn new(storage: &'a dyn Storage, config: &'a Config) -> Self {
        Self { storage, config }
    }

    /// 執行安裝流程。
    ///
    /// 步驟依序為：備份既有憑證（毫秒時間戳改名，永不覆寫舊備份）、
    /// 移除依目前組態推導的別名檔案、複製新葉憑證、重建別名硬連結、
    /// 安裝私鑰、重載網頁伺服器。重載失敗時檔案已經換妥，屬於已接受
    /// 的不對稱；單獨重跑 [`reload`](Installer::reload) 即可恢復。
    pub fn install(&self, domain: &str) -> Result<InstallReport> {
        let leaf_src = self.config.cert_path(domain);
        if !self.step_exists(InstallStep::CopyCertificate, &leaf_src)? {
            return Err(InstallError::CertificateMissing(leaf_src));
        }

        let san_list = CsrBuilder::new(self.storage, self.config).san_list(domain)?;
        let installed_cert = self.config.installed_cert_path(domain);

        // 備份既有憑證並計算 SAN 差異
        let mut drift = SanDrift::default();
        let backup = if self.step_exists(InstallStep::Backup, &installed_cert)? {
            drift = self.compute_drift(&installed_cert, &san_list);
            let backup_path = Self::backup_path(&installed_cert);
            self.storage
                .rename(&installed_cert, &backup_path)
                .map_err(|source| InstallError::Step {
                    step: InstallStep::Backup,
                    path: installed_cert.clone(),
                    source,
                })?;
            info!(path = %backup_path.display(), "previous certificate backed up");
            Some(backup_path)
        } else {
            None
        };

        // 移除依目前組態推導的別名檔案
        for alias in san_list.aliases() {
            let alias_path = self.config.installed_cert_path(alias);
            if self.step_exists(InstallStep::RemoveAlias, &alias_path)? {
                self.storage
                    .remove(&alias_path)
                    .map_err(|source| InstallError::Step {
                        step: InstallStep::RemoveAlias,
                        path: alias_path.clone(),
                        source,
                    })?;
            }
        }

        // 複製新葉憑證
        self.storage
            .copy(&leaf_src, &installed_cert)
            .map_err(|source| InstallError::Step {
                step: InstallStep::CopyCertificate,
                path: installed_cert.clone(),
                source,
            })?;

        // 重建別名硬連結；所有別名與正式檔案共享相同位元組
        let mut aliases = Vec::with_capacity(san_list.aliases().len());
        for alias in san_list.aliases() {
            let alias_path = self.config.installed_cert_path(alias);
            self.storage
                .hard_link(&installed_cert, &alias_path)
                .map_err(|source| InstallError::Step {
                    step: InstallStep::LinkAlias,
                    path: alias_path.clone(),
                    source,
                })?;
            aliases.push(alias_path);
        }

        // 安裝私鑰
        let key_src = self.config.key_path(domain);
        let installed_key = self.config.installed_key_path(domain);
        self.storage
            .copy(&key_src, &installed_key)
            .map_err(|source| InstallError::Step {
                step: InstallStep::InstallKey,
                path: key_src.clone(),
                source,
            })?;

        if !drift.is_empty() {
            warn!(
                domain,
                orphaned = ?drift.orphaned,
                added = ?drift.added,
                "SAN configuration changed since last issuance"
            );
        }

        // 重載網頁伺服器；此時憑證檔案已經換妥
        self.reload()?;

        info!(domain, cert = %installed_cert.display(), "certificate installed");
        Ok(InstallReport {
            backup,
            installed_cert,
            installed_key,
            aliases,
            drift,
        })
    }

    /// 執行網頁伺服器重載指令。
    ///
    /// 重載是冪等的，安裝後若重載失敗可單獨重跑本方法。
    /// 組態未提供指令時跳過（僅限測試環境）。
    pub fn reload(&self) -> Result<()> {
        let command = &self.config.reload_command;
        if command.is_empty() {
            warn!("no reload command configured, skipping web server reload");
            return Ok(());
        }

        let rendered = command.join(" ");
        let status = Command::new(&command[0])
            .args(&command[1..])
            .status()
            .map_err(|e| InstallError::Reload {
                command: rendered.clone(),
                detail: e.to_string(),
            })?;

        if !status.success() {
            return Err(InstallError::Reload {
                command: rendered,
                detail: format!("exit status {}", status),
            });
        }
        info!(command = %rendered, "web server reloaded");
        Ok(())
    }

    fn step_exists(&self, step: InstallStep, path: &Path) -> Result<bool> {
        self.storage
            .exists(path)
            .map_err(|source| InstallError::Step {
                step,
                path: path.to_path_buf(),
                source,
            })
    }

    /// 備份檔名：原檔名加上毫秒精度時間戳。
    ///
    /// 時間戳碰撞視為機率上可忽略，不另行處理。
    fn backup_path(installed: &Path) -> PathBuf {
        let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3f");
        PathBuf::from(format!("{}-{}", installed.display(), timestamp))
    }

    /// 比對舊憑證內嵌的 SAN 集合與目前組態推導的集合。
    ///
    /// 舊憑證無法解析時只記錄警告；差異屬於診斷資訊，不阻擋安裝。
    fn compute_drift(&self, installed_cert: &Path, san_list: &SanList) -> SanDrift {
        let embedded = self
            .storage
            .read_to_string(installed_cert)
            .ok()
            .and_then(|pem| Certificate::from_pem(&pem).ok())
            .map(|cert| cert.san_dns_names());

        let embedded = match embedded {
            Some(names) => names,
            None => {
                warn!(path = %installed_cert.display(), "installed certificate unreadable, skipping drift check");
                return SanDrift::default();
            }
        };

        let configured = san_list.dns_names();
        SanDrift {
            orphaned: embedded
                .iter()
                .filter(|name| !configured.contains(name))
                .cloned()
                .collect(),
            added: configured
                .iter()
                .filter(|name| !embedded.contains(name))
                .cloned()
                .collect(),
        }
    }
}
