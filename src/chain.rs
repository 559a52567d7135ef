use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use crate::{
    certificate::{Certificate, CertificateError},
    config::Config,
    storage::{Storage, StorageError},
};

/// 憑證鏈拆分過程可能發生的錯誤。
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("No certificates found in chain")]
    EmptyChain,
    #[error("No leaf certificate for domain {0} found in chain")]
    MissingLeaf(String),
    #[error("Certificate #{index} in chain matches no classification rule (CN {cn:?}, issuer {issuer:?})")]
    Unclassified {
        index: usize,
        cn: Option<String>,
        issuer: Option<String>,
    },
    #[error("Failed to write certificate to {path}: {source}")]
    CertificateWrite {
        path: PathBuf,
        #[source]
        source: StorageError,
    },
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Certificate error: {0}")]
    Certificate(#[from] CertificateError),
}

type Result<T> = std::result::Result<T, ChainError>;

/// 拆分結果：葉憑證與中繼憑證的寫入路徑。
#[derive(Debug)]
pub struct SplitChain {
    pub leaf: PathBuf,
    pub intermediates: Vec<PathBuf>,
}

/// 將 CA 回傳的 PEM 串接內容拆分為單一憑證檔案。
///
/// 分類規則：CN 與域名相同者為葉憑證，命名 `<domain>.crt`；
/// 其餘憑證的簽發者文字命中 CA 標記者為中繼／交叉簽署憑證，
/// 命名 `<prefix>-NNNN.crt`，序號自 1 起以四位數遞增。
/// 兩者皆不符合時視為解析錯誤，立即失敗。
#[derive(Debug)]
pub struct ChainSplitter<'a> {
    storage: &'a dyn Storage,
    config: &'a Config,
}

impl<'a> ChainSplitter<'a> {
    pub fn new(storage: &'a dyn Storage, config: &'a Config) -> Self {
        Self { storage, config }
    }

    /// 拆分指定路徑的原始憑證鏈。
    ///
    /// 全部憑證寫入成功後刪除原始鏈檔案；任何一步失敗都保留原始檔案
    /// 以供事後檢查。對相同輸入重複呼叫會產生位元相同的輸出檔案。
    pub fn split(&self, raw_chain_path: &Path, domain: &str) -> Result<SplitChain> {
        let raw = self.storage.read_to_string(raw_chain_path)?;
        let blocks = scan_pem_blocks(&raw);
        if blocks.is_empty() {
            return Err(ChainError::EmptyChain);
        }

        let mut leaf: Option<PathBuf> = None;
        let mut intermediates = Vec::new();
        let mut sequence: u32 = 0;

        for (index, block) in blocks.iter().enumerate() {
            let cert = Certificate::from_pem(block)?;
            let cn = cert.common_name();
            let issuer = cert.issuer_common_name();

            if cn.as_deref() == Some(domain) {
                let path = self.config.cert_path(domain);
                self.write_cert(&path, block)?;
                if leaf.is_some() {
                    warn!(domain, "chain contains more than one leaf certificate");
                }
                leaf = Some(path);
            } else if self.matches_ca_marker(cn.as_deref(), issuer.as_deref()) {
                sequence += 1;
                let name = format!("{}-{:04}.crt", self.config.intermediate_prefix, sequence);
                let path = self.config.cert_dir.join(name);
                self.write_cert(&path, block)?;
                intermediates.push(path);
            } else {
                return Err(ChainError::Unclassified { index, cn, issuer });
            }
        }

        let leaf = leaf.ok_or_else(|| ChainError::MissingLeaf(domain.to_string()))?;

        // 全部寫入成功，原始鏈檔案功成身退
        self.storage.remove(raw_chain_path)?;
        info!(
            domain,
            intermediates = intermediates.len(),
            "certificate chain split"
        );

        Ok(SplitChain {
            leaf,
            intermediates,
        })
    }

    fn write_cert(&self, path: &Path, pem: &str) -> Result<()> {
        self.storage
            .write(path, pem.as_bytes())
            .map_err(|source| ChainError::CertificateWrite {
                path: path.to_path_buf(),
                source,
            })
    }

    /// 判斷憑證是否屬於 CA 的中繼／交叉簽署憑證。
    ///
    /// 簽發者或自身 CN 命中任一標記即成立；CN 為空時僅看簽發者。
    fn matches_ca_marker(&self, cn: Option<&str>, issuer: Option<&str>) -> bool {
        let hit = |text: &str| {
            self.config
                .ca_issuer_markers
                .iter()
                .any(|marker| text.contains(marker))
        };
        issuer.map(hit).unwrap_or(false)
            || cn.map(hit).unwrap_or(false)
            || cn
                .map(|text| {
                    self.config
                        .leaf_placeholder_tokens
                        .iter()
                        .any(|token| text.contains(token))
                })
                .unwrap_or(false)
    }
}

/// 掃描 PEM 字串，依出現順序擷取所有 `BEGIN CERTIFICATE` 區塊。
fn scan_pem_blocks(raw: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Option<Vec<&str>> = None;

    for line in raw.lines() {
        if line.starts_with("-----BEGIN CERTIFICATE-----") {
            current = Some(vec![line]);
        } else if line.starts_with("-----END CERTIFICATE-----") {
            if let Some(mut lines) = current.take() {
                lines.push(line);
                let mut block = lines.join("\n");
                block.push('\n');
                blocks.push(block);
            }
        } else if let Some(lines) = current.as_mut() {
            lines.push(line);
        }
    }

    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::test_support::make_cert_pem;
    use crate::storage::MemStorage;

    fn setup() -> (MemStorage, Config) {
        (MemStorage::new(), Config::builder("/srv/certmill").build())
    }

    fn write_chain(storage: &MemStorage, config: &Config, domain: &str, chain: &str) -> PathBuf {
        let path = config.chain_artifact_path(domain);
        storage.write(&path, chain.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_scan_preserves_block_order() {
        let first = make_cert_pem("example.com", "Test CA", 90, &[]);
        let second = make_cert_pem("other.example", "Test CA", 90, &[]);
        let chain = format!("{}{}", first, second);

        let blocks = scan_pem_blocks(&chain);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].trim_end(), first.trim_end());
        assert_eq!(blocks[1].trim_end(), second.trim_end());
    }

    #[test]
    fn test_split_leaf_and_cross_signed() -> Result<()> {
        let (storage, config) = setup();
        let leaf = make_cert_pem("example.com", "Let's Encrypt Authority", 90, &["example.com"]);
        let cross = make_cert_pem("", "Let's Encrypt Authority", 365, &[]);
        let raw_path = write_chain(&storage, &config, "example.com", &format!("{}{}", leaf, cross));

        let splitter = ChainSplitter::new(&storage, &config);
        let split = splitter.split(&raw_path, "example.com")?;

        assert!(split.leaf.ends_with("example.com.crt"));
        assert_eq!(split.intermediates.len(), 1);
        assert!(split.intermediates[0].ends_with("lets-encrypt-x1-cross-signed-0001.crt"));

        // 原始鏈檔案在完整成功後必須刪除
        assert!(!storage.exists(&raw_path)?);
        Ok(())
    }

    #[test]
    fn test_split_is_idempotent() -> Result<()> {
        let (storage, config) = setup();
        let leaf = make_cert_pem("example.com", "Let's Encrypt Authority", 90, &[]);
        let cross = make_cert_pem("", "Let's Encrypt Authority", 365, &[]);
        let chain = format!("{}{}", leaf, cross);

        let splitter = ChainSplitter::new(&storage, &config);

        let raw_path = write_chain(&storage, &config, "example.com", &chain);
        splitter.split(&raw_path, "example.com")?;
        let first_leaf = storage.read(&config.cert_path("example.com"))?;
        let first_cross = storage.read(
            &config
                .cert_dir
                .join("lets-encrypt-x1-cross-signed-0001.crt"),
        )?;

        let raw_path = write_chain(&storage, &config, "example.com", &chain);
        splitter.split(&raw_path, "example.com")?;

        assert_eq!(storage.read(&config.cert_path("example.com"))?, first_leaf);
        assert_eq!(
            storage.read(
                &config
                    .cert_dir
                    .join("lets-encrypt-x1-cross-signed-0001.crt")
            )?,
            first_cross
        );
        Ok(())
    }

    #[test]
    fn test_empty_chain_fails() {
        let (storage, config) = setup();
        let raw_path = write_chain(&storage, &config, "example.com", "no certificates here\n");

        let splitter = ChainSplitter::new(&storage, &config);
        match splitter.split(&raw_path, "example.com") {
            Err(ChainError::EmptyChain) => {}
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        // 失敗時原始檔案必須保留
        assert!(storage.exists(&raw_path).unwrap());
    }

    #[test]
    fn test_chain_without_leaf_fails_and_keeps_artifact() {
        let (storage, config) = setup();
        let cross = make_cert_pem("", "Let's Encrypt Authority", 365, &[]);
        let raw_path = write_chain(&storage, &config, "example.com", &cross);

        let splitter = ChainSplitter::new(&storage, &config);
        match splitter.split(&raw_path, "example.com") {
            Err(ChainError::MissingLeaf(domain)) => assert_eq!(domain, "example.com"),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        assert!(storage.exists(&raw_path).unwrap());
    }

    #[test]
    fn test_staging_placeholder_is_not_a_leaf() -> Result<()> {
        let (storage, config) = setup();
        let leaf = make_cert_pem("example.com", "Fake LE Intermediate X1", 90, &[]);
        let fake = make_cert_pem("Fake LE Intermediate X1", "Fake LE Root X1", 365, &[]);
        let raw_path = write_chain(&storage, &config, "example.com", &format!("{}{}", leaf, fake));

        let splitter = ChainSplitter::new(&storage, &config);
        let split = splitter.split(&raw_path, "example.com")?;

        assert!(split.leaf.ends_with("example.com.crt"));
        assert_eq!(split.intermediates.len(), 1);
        Ok(())
    }

    #[test]
    fn test_unrelated_certificate_is_rejected() {
        let (storage, config) = setup();
        let leaf = make_cert_pem("example.com", "Let's Encrypt Authority", 90, &[]);
        let stray = make_cert_pem("stray.example", "Unknown CA", 90, &[]);
        let raw_path = write_chain(&storage, &config, "example.com", &format!("{}{}", leaf, stray));

        let splitter = ChainSplitter::new(&storage, &config);
        match splitter.split(&raw_path, "example.com") {
            Err(ChainError::Unclassified { index: 1, .. }) => {}
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }
}
