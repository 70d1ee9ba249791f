//! Resolution of which monthly crawls to process. The public crawl-list
//! endpoint returns a JSON array of crawls, newest first.

use serde::Deserialize;

pub const CRAWL_LIST_URL: &str = "https://index.commoncrawl.org/collinfo.json";

#[derive(Debug, Clone, Deserialize)]
pub struct CrawlInfo {
    pub id: String,
    pub name: String,
}

pub async fn fetch_crawl_list(
    http: &reqwest::Client,
    endpoint: &str,
) -> anyhow::Result<Vec<CrawlInfo>> {
    let list: Vec<CrawlInfo> = http
        .get(endpoint)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    anyhow::ensure!(!list.is_empty(), "crawl list endpoint returned no crawls");
    Ok(list)
}

/// An explicit id list (CLI flag or env, already merged by the caller)
/// wins; otherwise take the newest `latest_n` crawls from the endpoint.
pub async fn resolve_crawl_ids(
    explicit: &[String],
    latest_n: usize,
    http: &reqwest::Client,
    endpoint: &str,
) -> anyhow::Result<Vec<String>> {
    if !explicit.is_empty() {
        return Ok(explicit.to_vec());
    }
    let list = fetch_crawl_list(http, endpoint).await?;
    let take = latest_n.max(1);
    Ok(list.into_iter().take(take).map(|c| c.id).collect())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn crawl_list_entries_tolerate_extra_fields() {
        let raw = r#"[
            {"id": "CC-MAIN-2025-05", "name": "January 2025", "cdx-api": "https://index/x"},
            {"id": "CC-MAIN-2024-51", "name": "December 2024"}
        ]"#;
        let list: Vec<CrawlInfo> = serde_json::from_str(raw).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, "CC-MAIN-2025-05");
        assert_eq!(list[1].name, "December 2024");
    }

    #[tokio::test]
    async fn explicit_ids_bypass_the_endpoint() {
        let http = reqwest::Client::new();
        let ids = resolve_crawl_ids(
            &["CC-MAIN-2025-05".to_string()],
            3,
            &http,
            "http://127.0.0.1:9/unreachable",
        )
        .await
        .unwrap();
        assert_eq!(ids, vec!["CC-MAIN-2025-05"]);
    }
}
