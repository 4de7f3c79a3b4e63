// src/dart/corp_codes.rs
use crate::dart::models::CompanyRecord;
use crate::utils::error::DartError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const REGISTRY_MEMBER: &str = "CORPCODE.xml";

/// Name fragments marking banks, insurers, brokers and other financial firms.
pub const FINANCIAL_KEYWORDS: [&str; 13] = [
    "금융", "은행", "보험", "증권", "캐피탈", "투자", "자산운용", "신용", "저축", "카드", "리스", "신탁", "펀드",
];

static STOCK_CODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{6}$").expect("Failed to compile STOCK_CODE_RE"));

/// Listed (6-digit stock code) and outside the financial sector.
pub fn is_eligible(record: &CompanyRecord) -> bool {
    let listed = record
        .stock_code
        .as_deref()
        .map(|code| STOCK_CODE_RE.is_match(code.trim()))
        .unwrap_or(false);
    listed && !FINANCIAL_KEYWORDS.iter().any(|k| record.corp_name.contains(k))
}

/// Eligible records sorted by stock code, so team membership is stable
/// between runs.
pub fn eligible_sorted(records: Vec<CompanyRecord>) -> Vec<CompanyRecord> {
    let total = records.len();
    let mut eligible: Vec<CompanyRecord> = records.into_iter().filter(is_eligible).collect();
    eligible.sort_by(|a, b| a.stock_code.cmp(&b.stock_code).then_with(|| a.corp_code.cmp(&b.corp_code)));
    tracing::info!("Eligible non-financial listed firms: {} of {}", eligible.len(), total);
    eligible
}

/// Download/backoff settings for the registry endpoint.
#[derive(Debug, Clone)]
pub struct RegistryPolicy {
    pub max_attempts: u32,
    /// Doubled after each failed attempt.
    pub backoff_base: Duration,
    pub connect_timeout: Duration,
    pub timeout: Duration,
}

impl Default for RegistryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(30),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Company registry with an on-disk JSON snapshot.
pub struct CorpCodeSource {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    cache_path: PathBuf,
    policy: RegistryPolicy,
}

impl CorpCodeSource {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        cache_path: impl Into<PathBuf>,
        policy: RegistryPolicy,
    ) -> Result<Self, DartError> {
        let http = reqwest::Client::builder()
            .connect_timeout(policy.connect_timeout)
            .timeout(policy.timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            cache_path: cache_path.into(),
            policy,
        })
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    /// Returns the cached registry unless `force_refresh` is set or the cache
    /// is missing/unreadable; otherwise downloads, parses and re-caches it.
    pub async fn load(&self, force_refresh: bool) -> Result<Vec<CompanyRecord>, DartError> {
        if !force_refresh {
            match read_cache(&self.cache_path) {
                Ok(Some(records)) => {
                    tracing::info!("Loaded {} companies from cache {}", records.len(), self.cache_path.display());
                    return Ok(records);
                }
                Ok(None) => tracing::debug!("No registry cache at {}", self.cache_path.display()),
                Err(e) => tracing::warn!("Registry cache unreadable ({}), downloading again", e),
            }
        }

        tracing::info!("Downloading company registry from DART");
        let archive = self.download_archive().await?;
        let records = parse_registry_archive(&archive)?;
        tracing::info!("Parsed {} companies from registry", records.len());

        if let Err(e) = write_cache(&self.cache_path, &records) {
            tracing::warn!("Failed to save registry cache: {}", e);
        } else {
            tracing::info!("Saved registry cache to {}", self.cache_path.display());
        }
        Ok(records)
    }

    /// Deletes the snapshot at `cache_path`. Returns whether a file was removed.
    pub fn clear_cache(cache_path: &Path) -> Result<bool, DartError> {
        if cache_path.exists() {
            std::fs::remove_file(cache_path)?;
            tracing::info!("Removed registry cache {}", cache_path.display());
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn download_archive(&self) -> Result<Vec<u8>, DartError> {
        let attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.download_once().await {
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) if attempt < attempts && is_retryable_download_error(&e) => {
                    let wait = backoff_delay(self.policy.backoff_base, attempt);
                    tracing::warn!("Registry download attempt {}/{} failed: {}; retrying in {:?}", attempt, attempts, e, wait);
                    tokio::time::sleep(wait).await;
                }
                Err(e) => {
                    tracing::error!("Registry download failed after {} attempts: {}", attempt, e);
                    return Err(e);
                }
            }
        }
    }

    async fn download_once(&self) -> Result<Vec<u8>, DartError> {
        let url = format!("{}/corpCode.xml", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[("crtfc_key", self.api_key.as_str())])
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(DartError::QuotaExceeded("HTTP 429 on registry download".to_string()));
        }
        if !status.is_success() {
            return Err(DartError::Http(status));
        }

        let bytes = response.bytes().await?.to_vec();
        if !bytes.starts_with(ZIP_MAGIC) {
            let preview: String = String::from_utf8_lossy(&bytes).chars().take(120).collect();
            return Err(DartError::Archive(format!("response is not a ZIP archive: {}", preview)));
        }
        Ok(bytes)
    }
}

/// `base * 2^(attempt - 1)`, saturating instead of overflowing.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
}

fn is_retryable_download_error(error: &DartError) -> bool {
    match error {
        DartError::Network(e) => e.is_timeout() || e.is_connect() || e.is_body(),
        DartError::Archive(_) | DartError::Http(_) => true,
        _ => false,
    }
}

fn read_cache(path: &Path) -> Result<Option<Vec<CompanyRecord>>, DartError> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)?;
    let records = serde_json::from_str(&contents).map_err(|e| DartError::Parse(e.to_string()))?;
    Ok(Some(records))
}

fn write_cache(path: &Path, records: &[CompanyRecord]) -> Result<(), DartError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string(records).map_err(|e| DartError::Parse(e.to_string()))?;
    std::fs::write(path, json)?;
    Ok(())
}

/// Unpacks `CORPCODE.xml` from the registry archive and parses it.
pub fn parse_registry_archive(bytes: &[u8]) -> Result<Vec<CompanyRecord>, DartError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| DartError::Archive(e.to_string()))?;
    let mut member = archive
        .by_name(REGISTRY_MEMBER)
        .map_err(|e| DartError::Archive(format!("{}: {}", REGISTRY_MEMBER, e)))?;
    let mut xml = String::new();
    member
        .read_to_string(&mut xml)
        .map_err(|e| DartError::Archive(format!("{} is not UTF-8 text: {}", REGISTRY_MEMBER, e)))?;
    parse_registry_xml(&xml)
}

/// Parses `<result><list>...</list>...</result>` into records.
pub fn parse_registry_xml(xml: &str) -> Result<Vec<CompanyRecord>, DartError> {
    let doc = roxmltree::Document::parse(xml).map_err(|e| DartError::Parse(format!("CORPCODE.xml: {}", e)))?;

    let mut records = Vec::new();
    for list in doc.descendants().filter(|n| n.has_tag_name("list")) {
        let field = |name: &str| {
            list.children()
                .find(|c| c.has_tag_name(name))
                .and_then(|c| c.text())
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
        };

        let Some(corp_code) = field("corp_code") else {
            continue;
        };
        records.push(CompanyRecord {
            corp_code,
            corp_name: field("corp_name").unwrap_or_default(),
            stock_code: field("stock_code"),
            listing_class: field("corp_cls"),
            modify_date: field("modify_date"),
        });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SAMPLE_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<result>
    <list>
        <corp_code>00126380</corp_code>
        <corp_name>삼성전자</corp_name>
        <stock_code>005930</stock_code>
        <modify_date>20230110</modify_date>
    </list>
    <list>
        <corp_code>00434003</corp_code>
        <corp_name>다코</corp_name>
        <stock_code> </stock_code>
        <modify_date>20170630</modify_date>
    </list>
    <list>
        <corp_name>코드없음</corp_name>
    </list>
</result>"#;

    fn record(name: &str, stock_code: Option<&str>) -> CompanyRecord {
        CompanyRecord {
            corp_code: "00000001".into(),
            corp_name: name.into(),
            stock_code: stock_code.map(str::to_string),
            listing_class: None,
            modify_date: None,
        }
    }

    fn zipped(xml: &str) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file(REGISTRY_MEMBER, zip::write::FileOptions::default())
            .unwrap();
        writer.write_all(xml.as_bytes()).unwrap();
        writer.finish().unwrap().into_inner()
    }

    fn fast_policy(max_attempts: u32) -> RegistryPolicy {
        RegistryPolicy {
            max_attempts,
            backoff_base: Duration::from_millis(1),
            connect_timeout: Duration::from_secs(5),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn eligibility_requires_six_digit_code_and_non_financial_name() {
        assert!(is_eligible(&record("삼성전자", Some("005930"))));
        assert!(is_eligible(&record("현대차", Some(" 005380 "))));
        assert!(!is_eligible(&record("다코", None)));
        assert!(!is_eligible(&record("다코", Some(""))));
        assert!(!is_eligible(&record("코넥스기업", Some("12345"))));
        assert!(!is_eligible(&record("비상장", Some("A12345"))));
        assert!(!is_eligible(&record("신한은행", Some("055550"))));
        assert!(!is_eligible(&record("미래에셋증권", Some("006800"))));
        assert!(!is_eligible(&record("삼성화재해상보험", Some("000810"))));
    }

    #[test]
    fn eligible_sorted_orders_by_stock_code() {
        let mut a = record("B사", Some("200000"));
        a.corp_code = "B".into();
        let mut b = record("A사", Some("100000"));
        b.corp_code = "A".into();
        let sorted = eligible_sorted(vec![a, record("은행", Some("000001")), b]);
        let codes: Vec<_> = sorted.iter().map(|r| r.corp_code.as_str()).collect();
        assert_eq!(codes, vec!["A", "B"]);
    }

    #[test]
    fn backoff_doubles_and_saturates() {
        let base = Duration::from_secs(2);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(8));
        assert_eq!(backoff_delay(base, 40), base.saturating_mul(u32::MAX));
        assert_eq!(backoff_delay(Duration::MAX, 2), Duration::MAX);
    }

    #[test]
    fn parses_registry_xml_and_normalises_blank_codes() {
        let records = parse_registry_xml(SAMPLE_XML).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].corp_code, "00126380");
        assert_eq!(records[0].stock_code.as_deref(), Some("005930"));
        assert_eq!(records[1].stock_code, None);
    }

    #[test]
    fn rejects_archive_without_registry_member() {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer.start_file("other.xml", zip::write::FileOptions::default()).unwrap();
        writer.write_all(b"<result/>").unwrap();
        let bytes = writer.finish().unwrap().into_inner();
        assert!(matches!(parse_registry_archive(&bytes), Err(DartError::Archive(_))));
    }

    #[tokio::test]
    async fn load_downloads_then_serves_from_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/corpCode.xml"))
            .and(query_param("crtfc_key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(zipped(SAMPLE_XML)))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("nested").join("corp_codes.json");
        let source = CorpCodeSource::new(server.uri(), "test-key", &cache, fast_policy(3)).unwrap();

        let first = source.load(false).await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(cache.exists());

        let second = source.load(false).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn force_refresh_bypasses_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/corpCode.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(zipped(SAMPLE_XML)))
            .expect(2)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let source = CorpCodeSource::new(server.uri(), "k", dir.path().join("c.json"), fast_policy(1)).unwrap();
        source.load(false).await.unwrap();
        source.load(true).await.unwrap();
    }

    #[tokio::test]
    async fn corrupt_cache_is_refetched() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/corpCode.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(zipped(SAMPLE_XML)))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("c.json");
        std::fs::write(&cache, "not json").unwrap();
        let source = CorpCodeSource::new(server.uri(), "k", &cache, fast_policy(1)).unwrap();
        assert_eq!(source.load(false).await.unwrap().len(), 2);
        assert!(CorpCodeSource::clear_cache(source.cache_path()).unwrap());
        assert!(!CorpCodeSource::clear_cache(source.cache_path()).unwrap());
    }

    #[tokio::test]
    async fn malformed_body_is_retried_then_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/corpCode.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<result><status>010</status><message>등록되지 않은 키입니다.</message></result>",
            ))
            .expect(3)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let source = CorpCodeSource::new(server.uri(), "k", dir.path().join("c.json"), fast_policy(3)).unwrap();
        let err = source.load(false).await.unwrap_err();
        assert!(matches!(err, DartError::Archive(_)));
        assert!(!dir.path().join("c.json").exists());
    }
}
