use serde::{Deserialize, Serialize};
use std::error::Error;

use crate::b64_url;

/// 定義所有 ACME 載荷必須實作的功能。
///
/// 實作者須可序列化，並提供轉換成 JSON 字串的功能與自定義的驗證邏輯。
pub trait PayloadT: Serialize {
    /// 將載荷轉換成 JSON 格式的字串。
    ///
    /// # 錯誤
    ///
    /// 若序列化失敗，則回傳 [`serde_json::Error`]。
    fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// 驗證載荷資料是否符合預期的規範。
    fn validate(&self) -> Result<(), Box<dyn Error>>;
}

/// 查詢既有帳戶的載荷。
///
/// `onlyReturnExisting` 告知 CA 僅回傳已註冊帳戶的 URL，
/// 不建立新帳戶；帳戶註冊本身不在本庫的範圍內。
#[derive(Debug, Serialize, Deserialize)]
pub struct ExistingAccountPayload {
    #[serde(rename = "onlyReturnExisting")]
    only_return_existing: bool,
}

impl ExistingAccountPayload {
    pub fn new() -> Self {
        ExistingAccountPayload {
            only_return_existing: true,
        }
    }
}

impl Default for ExistingAccountPayload {
    fn default() -> Self {
        Self::new()
    }
}

impl PayloadT for ExistingAccountPayload {
    fn validate(&self) -> Result<(), Box<dyn Error>> {
        if !self.only_return_existing {
            return Err("onlyReturnExisting must be set".into());
        }
        Ok(())
    }
}

/// 表示一個識別項，用來描述憑證所涵蓋的主機名稱。
#[derive(Debug, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub type_: String,
    pub value: String,
}

/// 表示建立新訂單時所需的載荷資料。
///
/// 識別項由 SAN 清單展開而來，每個 DNS 名稱一項。
#[derive(Debug, Serialize, Deserialize)]
pub struct NewOrderPayload {
    pub identifiers: Vec<Identifier>,
}

impl NewOrderPayload {
    /// 給定一組 DNS 名稱，為每個名稱建立一個 `"dns"` 類型的識別項。
    pub fn new<S: AsRef<str>>(dns_names: &[S]) -> Self {
        let identifiers = dns_names
            .iter()
            .map(|name| Identifier {
                type_: "dns".to_string(),
                value: name.as_ref().to_string(),
            })
            .collect();

        NewOrderPayload { identifiers }
    }
}

impl PayloadT for NewOrderPayload {
    /// 驗證新訂單載荷資料：
    ///
    /// - 必須至少包含一個識別項。
    /// - 所有識別項的類型必須為 `"dns"` 且值不得為空。
    fn validate(&self) -> Result<(), Box<dyn Error>> {
        if self.identifiers.is_empty() {
            return Err("At least one identifier is required".into());
        }
        for identifier in &self.identifiers {
            if identifier.type_ != "dns" {
                return Err("Identifier type must be 'dns'".into());
            }
            if identifier.value.is_empty() {
                return Err("Identifier value cannot be empty".into());
            }
        }
        Ok(())
    }
}

/// 通知 CA 挑戰已就緒的載荷；協議規定為空物件。
#[derive(Debug, Serialize, Deserialize, Default)]
pub struct ChallengeReadyPayload {}

impl ChallengeReadyPayload {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PayloadT for ChallengeReadyPayload {
    fn validate(&self) -> Result<(), Box<dyn Error>> {
        Ok(())
    }
}

/// 表示最終化訂單時所需的載荷資料。
///
/// 內含 CSR 的 DER 資料，以 URL-safe Base64 編碼。
#[derive(Debug, Serialize, Deserialize)]
pub struct FinalizeOrderPayload {
    csr: String,
}

impl FinalizeOrderPayload {
    /// 將 CSR 的 DER 位元組編碼後建立載荷。
    pub fn new(csr_der: &[u8]) -> Self {
        FinalizeOrderPayload {
            csr: b64_url(csr_der),
        }
    }
}

impl PayloadT for FinalizeOrderPayload {
    fn validate(&self) -> Result<(), Box<dyn Error>> {
        if self.csr.is_empty() {
            return Err("CSR must not be empty".into());
        }
        Ok(())
    }
}
