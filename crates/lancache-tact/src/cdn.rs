//! HTTP client for the TACT patch and CDN endpoints.
//!
//! All fetches share a 30-second timeout and a bounded retry loop with
//! exponential backoff and jitter. Only transport failures and 5xx/429
//! responses retry; 4xx responses surface immediately so a missing
//! archive can be skipped by the caller.

use std::time::Duration;

use rand::Rng;
use reqwest::Client;
use tokio::time::sleep;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 250;
const MAX_BACKOFF_MS: u64 = 10_000;
const BACKOFF_MULTIPLIER: f64 = 2.0;
const JITTER_FACTOR: f64 = 0.1;

/// Client over the version (`patch.battle.net`) and content CDNs.
#[derive(Debug, Clone)]
pub struct CdnClient {
    client: Client,
    max_retries: u32,
    /// Base URL override for the patch endpoint, used by tests.
    patch_base: Option<String>,
}

impl CdnClient {
    pub fn new() -> Result<Self> {
        let client = Client::builder().timeout(FETCH_TIMEOUT).build()?;
        Ok(Self {
            client,
            max_retries: DEFAULT_MAX_RETRIES,
            patch_base: None,
        })
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Point the patch endpoint somewhere else (tests).
    pub fn with_patch_base(mut self, base: impl Into<String>) -> Self {
        self.patch_base = Some(base.into());
        self
    }

    fn patch_url(&self, region: &str, product: &str, endpoint: &str) -> String {
        match &self.patch_base {
            Some(base) => format!("{}/{product}/{endpoint}", base.trim_end_matches('/')),
            None => format!("http://{region}.patch.battle.net:1119/{product}/{endpoint}"),
        }
    }

    /// `versions` manifest for a product.
    pub async fn fetch_versions(&self, region: &str, product: &str) -> Result<String> {
        self.get_text(&self.patch_url(region, product, "versions"))
            .await
    }

    /// `cdns` manifest for a product.
    pub async fn fetch_cdns(&self, region: &str, product: &str) -> Result<String> {
        self.get_text(&self.patch_url(region, product, "cdns")).await
    }

    /// `/{path}/config/{aa}/{bb}/{hash}`
    pub fn config_url(host: &str, path: &str, hash: &str) -> String {
        format!(
            "{}/{path}/config/{}/{}/{hash}",
            host_base(host),
            &hash[..2],
            &hash[2..4]
        )
    }

    /// `/{path}/data/{aa}/{bb}/{hash}`
    pub fn data_url(host: &str, path: &str, hash: &str) -> String {
        format!(
            "{}/{path}/data/{}/{}/{hash}",
            host_base(host),
            &hash[..2],
            &hash[2..4]
        )
    }

    /// The archive's catalogue lives beside it with an `.index` suffix.
    pub fn index_url(host: &str, path: &str, archive_hash: &str) -> String {
        format!("{}.index", Self::data_url(host, path, archive_hash))
    }

    pub async fn fetch_config(&self, host: &str, path: &str, hash: &str) -> Result<String> {
        self.get_text(&Self::config_url(host, path, hash)).await
    }

    pub async fn fetch_data(&self, host: &str, path: &str, hash: &str) -> Result<Vec<u8>> {
        self.get_bytes(&Self::data_url(host, path, hash)).await
    }

    pub async fn fetch_index(&self, host: &str, path: &str, archive_hash: &str) -> Result<Vec<u8>> {
        self.get_bytes(&Self::index_url(host, path, archive_hash))
            .await
    }

    async fn get_text(&self, url: &str) -> Result<String> {
        let response = self.execute_with_retry(url).await?;
        Ok(response.text().await?)
    }

    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.execute_with_retry(url).await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn execute_with_retry(&self, url: &str) -> Result<reqwest::Response> {
        let mut last_error: Option<Error> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = calculate_backoff(attempt - 1);
                debug!("retry {attempt} for {url} after {backoff:?}");
                sleep(backoff).await;
            }

            trace!("GET {url} (attempt {})", attempt + 1);
            match self.client.get(url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    let retryable = status.is_server_error()
                        || status == reqwest::StatusCode::TOO_MANY_REQUESTS;
                    if retryable && attempt < self.max_retries {
                        warn!("GET {url} returned {status}, will retry");
                        last_error = Some(Error::CdnStatus(status.as_u16()));
                        continue;
                    }
                    return Err(Error::CdnStatus(status.as_u16()));
                }
                Err(e) => {
                    let retryable = e.is_connect() || e.is_timeout() || e.is_request();
                    if retryable && attempt < self.max_retries {
                        warn!("GET {url} failed ({e}), will retry");
                        last_error = Some(Error::Http(e));
                    } else {
                        return Err(Error::Http(e));
                    }
                }
            }
        }

        Err(last_error.unwrap_or(Error::NoUsableHost))
    }
}

fn host_base(host: &str) -> String {
    if host.starts_with("http://") || host.starts_with("https://") {
        host.trim_end_matches('/').to_string()
    } else {
        format!("http://{host}")
    }
}

fn calculate_backoff(attempt: u32) -> Duration {
    let base = INITIAL_BACKOFF_MS as f64 * BACKOFF_MULTIPLIER.powi(attempt as i32);
    let capped = base.min(MAX_BACKOFF_MS as f64);
    let jitter_range = capped * JITTER_FACTOR;
    let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
    Duration::from_millis((capped + jitter).max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn url_shapes() {
        assert_eq!(
            CdnClient::config_url("us.cdn.blizzard.com", "tpr/wow", "abcdef0123"),
            "http://us.cdn.blizzard.com/tpr/wow/config/ab/cd/abcdef0123"
        );
        assert_eq!(
            CdnClient::data_url("http://host:8080", "tpr/wow", "deadbeef"),
            "http://host:8080/tpr/wow/data/de/ad/deadbeef"
        );
        assert_eq!(
            CdnClient::index_url("host", "tpr/wow", "deadbeef"),
            "http://host/tpr/wow/data/de/ad/deadbeef.index"
        );
    }

    #[tokio::test]
    async fn fetches_versions_from_patch_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/wow/versions"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "Region!STRING:0|BuildConfig!HEX:16|CDNConfig!HEX:16\nus|abc|def\n",
            ))
            .mount(&server)
            .await;

        let client = CdnClient::new().unwrap().with_patch_base(server.uri());
        let body = client.fetch_versions("us", "wow").await.unwrap();
        assert!(body.contains("BuildConfig"));
    }

    #[tokio::test]
    async fn retries_server_errors_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/wow/cdns"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/wow/cdns"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let client = CdnClient::new().unwrap().with_patch_base(server.uri());
        let body = client.fetch_cdns("us", "wow").await.unwrap();
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tpr/wow/data/ab/cd/abcd11.index"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = CdnClient::new().unwrap();
        let err = client
            .fetch_index(&server.uri(), "tpr/wow", "abcd11")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CdnStatus(404)));
    }
}
