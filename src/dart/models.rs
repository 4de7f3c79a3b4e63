// src/dart/models.rs
use serde::{Deserialize, Serialize};
use std::fmt;

/// Financial statement variant requested from DART (`fs_div`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Division {
    /// Group-wide statements.
    #[serde(rename = "CFS")]
    Consolidated,
    /// Standalone entity statements.
    #[serde(rename = "OFS")]
    Separate,
}

impl Division {
    /// Consolidated first; this is also the fallback order.
    pub const ALL: [Division; 2] = [Division::Consolidated, Division::Separate];

    /// Wire code used by the `fs_div` query parameter.
    pub fn code(&self) -> &'static str {
        match self {
            Division::Consolidated => "CFS",
            Division::Separate => "OFS",
        }
    }
}

impl fmt::Display for Division {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Unit of work and dedup key: one company, one fiscal year, one division.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FetchKey {
    pub corp_code: String,
    pub bsns_year: u16,
    pub fs_div: Division,
}

impl FetchKey {
    pub fn new(corp_code: impl Into<String>, bsns_year: u16, fs_div: Division) -> Self {
        Self { corp_code: corp_code.into(), bsns_year, fs_div }
    }
}

impl fmt::Display for FetchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.corp_code, self.bsns_year, self.fs_div)
    }
}

/// Which statement a line item belongs to (`sj_div`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatementRole {
    #[serde(rename = "BS")]
    BalanceSheet,
    #[serde(rename = "IS")]
    IncomeStatement,
}

impl StatementRole {
    pub fn code(&self) -> &'static str {
        match self {
            StatementRole::BalanceSheet => "BS",
            StatementRole::IncomeStatement => "IS",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "BS" => Some(StatementRole::BalanceSheet),
            "IS" => Some(StatementRole::IncomeStatement),
            _ => None,
        }
    }
}

/// One financial line item, with its FetchKey fields stamped on.
///
/// Field names follow the DART column names so output files line up with
/// anything else built from the same API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementRow {
    pub corp_code: String,
    pub bsns_year: u16,
    pub fs_div: Division,
    pub sj_div: StatementRole,
    pub account_nm: String,
    pub thstrm_amount: Option<i64>,
    pub frmtrm_amount: Option<i64>,
    pub bfefrmtrm_amount: Option<i64>,
    pub currency: Option<String>,
    pub rcept_no: Option<String>,
}

impl StatementRow {
    pub fn key(&self) -> FetchKey {
        FetchKey::new(self.corp_code.clone(), self.bsns_year, self.fs_div)
    }
}

/// Entry of the company registry (CORPCODE.xml).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyRecord {
    pub corp_code: String,
    pub corp_name: String,
    pub stock_code: Option<String>,
    pub listing_class: Option<String>,
    pub modify_date: Option<String>,
}

/// Envelope of `fnlttSinglAcntAll.json`.
#[derive(Debug, Deserialize)]
pub struct ApiResponse {
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub list: Vec<ApiItem>,
}

/// Raw line item as DART sends it; amounts are strings like "1,234,567".
#[derive(Debug, Default, Deserialize)]
pub struct ApiItem {
    #[serde(default)]
    pub rcept_no: Option<String>,
    #[serde(default)]
    pub sj_div: String,
    #[serde(default)]
    pub account_nm: String,
    #[serde(default)]
    pub thstrm_amount: Option<String>,
    #[serde(default)]
    pub frmtrm_amount: Option<String>,
    #[serde(default)]
    pub bfefrmtrm_amount: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
}

impl ApiItem {
    /// Converts to a stamped row. Items outside the balance sheet and income
    /// statement yield `None`.
    pub fn into_row(self, key: &FetchKey) -> Option<StatementRow> {
        let sj_div = StatementRole::from_code(&self.sj_div)?;
        Some(StatementRow {
            corp_code: key.corp_code.clone(),
            bsns_year: key.bsns_year,
            fs_div: key.fs_div,
            sj_div,
            account_nm: self.account_nm.trim().to_string(),
            thstrm_amount: self.thstrm_amount.as_deref().and_then(parse_amount),
            frmtrm_amount: self.frmtrm_amount.as_deref().and_then(parse_amount),
            bfefrmtrm_amount: self.bfefrmtrm_amount.as_deref().and_then(parse_amount),
            currency: self.currency.filter(|c| !c.trim().is_empty()),
            rcept_no: self.rcept_no.filter(|r| !r.trim().is_empty()),
        })
    }
}

/// Parses a DART amount string. Empty and "-" mean no value.
pub fn parse_amount(raw: &str) -> Option<i64> {
    let cleaned: String = raw.trim().chars().filter(|c| *c != ',').collect();
    if cleaned.is_empty() || cleaned == "-" {
        return None;
    }
    cleaned.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_amount_handles_separators_and_blanks() {
        assert_eq!(parse_amount("1,234,567"), Some(1_234_567));
        assert_eq!(parse_amount("-98,000"), Some(-98_000));
        assert_eq!(parse_amount(" 42 "), Some(42));
        assert_eq!(parse_amount(""), None);
        assert_eq!(parse_amount("-"), None);
        assert_eq!(parse_amount("n/a"), None);
    }

    #[test]
    fn into_row_stamps_key_and_drops_other_statements() {
        let key = FetchKey::new("00126380", 2021, Division::Separate);
        let item = ApiItem {
            sj_div: "BS".into(),
            account_nm: " 자산총계 ".into(),
            thstrm_amount: Some("1,000".into()),
            currency: Some("KRW".into()),
            ..Default::default()
        };
        let row = item.into_row(&key).expect("balance sheet item");
        assert_eq!(row.key(), key);
        assert_eq!(row.account_nm, "자산총계");
        assert_eq!(row.thstrm_amount, Some(1000));
        assert_eq!(row.sj_div, StatementRole::BalanceSheet);

        let cash_flow = ApiItem { sj_div: "CF".into(), ..Default::default() };
        assert!(cash_flow.into_row(&key).is_none());
    }
}
