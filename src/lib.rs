//! # X.509 憑證生命週期自動化庫
//!
//! 本庫實作單一域名的完整憑證生命週期：金鑰與 CSR 生成、ACME HTTP-01
//! 挑戰驗證、憑證鏈下載與拆分、到期續約判斷、以及系統目錄的原子安裝。
//! 主要涵蓋以下模組：
//!
//! - **operation**: 生命週期引擎。以封閉的 [`operation::Operation`] 列舉
//!   在單一分派點驅動所有操作，步驟嚴格依「金鑰 → CSR → 簽發 → 拆分 → 安裝」
//!   的順序執行。
//! - **order** / **challenge** / **account**: ACME 協議狀態機，
//!   支援 Let's Encrypt 的 production 與 staging 目錄端點（互斥擇一），
//!   僅實作 HTTP-01 挑戰。
//! - **chain**: 將 CA 回傳的 PEM 串接內容拆分為葉憑證與中繼憑證。
//! - **renewal**: 以剩餘效期決定是否續約；「尚未到期」是帶資訊的結果，
//!   不是錯誤。
//! - **install**: 時間戳備份、SAN 別名硬連結與網頁伺服器重載。
//!
//! ## 設計原則
//!
//! - 組態為一次建構、不可變的 [`config::Config`]，以引用傳入各元件，
//!   沒有行程層級的可變狀態。
//! - 每個模組定義自己的 `thiserror` 錯誤列舉；引擎層的
//!   [`operation::EngineError::kind`] 提供穩定的錯誤分類，
//!   由外部 CLI 映射為結束狀態碼。
//! - 憑證欄位一律透過 OpenSSL 的結構化 API 讀取，不解析任何
//!   命令列工具的文字輸出。
//! - 同步阻塞執行，一次呼叫處理一個域名。
//!
//! ## 示例
//!
//! ```no_run
//! use certmill::{
//!     config::Config,
//!     directory::Endpoint,
//!     operation::{Engine, Operation, Outcome},
//!     storage::DiskStorage,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::builder("/srv/certmill")
//!         .endpoint(Endpoint::Staging)
//!         .reload_command(vec!["systemctl", "reload", "nginx"])
//!         .build();
//!     let storage = DiskStorage::new();
//!     let engine = Engine::new(&storage, &config);
//!
//!     match engine.run("example.com", Operation::Run { force: false })? {
//!         Outcome::Installed(report) => {
//!             println!("installed: {}", report.installed_cert.display());
//!         }
//!         Outcome::NotDue { days_left } => {
//!             println!("not due for renewal, {} days left", days_left);
//!         }
//!         _ => {}
//!     }
//!     Ok(())
//! }
//! ```
//!
//! 更多詳細 API 說明請參考各個模組的文檔。

pub mod account;
pub mod certificate;
pub mod chain;
pub mod challenge;
pub mod config;
pub mod csr;
pub mod directory;
pub mod install;
pub mod jwk;
pub mod jws;
pub mod key_store;
pub mod nonce;
pub mod operation;
pub mod order;
pub mod payload;
pub mod renewal;
pub mod storage;

/// URL-safe、無填充的 Base64 編碼，JOSE 欄位一律使用此格式。
pub(crate) fn b64_url<T: AsRef<[u8]>>(input: T) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(input)
}
