use super::{HealthChecker, ProbeResult};
use crate::error::{Error, Result};
use crate::registry::ServiceRecord;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Global shared HTTP client for health checks.
///
/// One pooled client for every probe keeps file descriptor use flat no matter
/// how many services are monitored. Requests carry their own timeout.
static SHARED_HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

fn shared_client() -> &'static Client {
    SHARED_HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "falling back to default HTTP client");
                Client::new()
            })
    })
}

/// HTTP probe: healthy only on a 200 from the record's health URL.
#[derive(Clone)]
pub struct HttpChecker {
    client: Client,
}

impl HttpChecker {
    pub fn new() -> Self {
        Self {
            client: shared_client().clone(),
        }
    }

    /// Validate that a URL is well-formed and uses HTTP/HTTPS scheme.
    pub fn validate_url(url: &str) -> Result<url::Url> {
        let parsed = url::Url::parse(url)
            .map_err(|e| Error::Config(format!("Invalid health URL '{}': {}", url, e)))?;
        match parsed.scheme() {
            "http" | "https" => Ok(parsed),
            other => Err(Error::Config(format!(
                "Invalid health URL '{}': scheme must be http or https, got '{}'",
                url, other
            ))),
        }
    }

    pub async fn probe_url(&self, url: &str, timeout: Duration) -> ProbeResult {
        let started = Instant::now();
        let url = match Self::validate_url(url) {
            Ok(u) => u,
            Err(e) => return ProbeResult::failed(None, Duration::ZERO, e.to_string()),
        };

        match self.client.get(url).timeout(timeout).send().await {
            Ok(response) if response.status() == StatusCode::OK => {
                ProbeResult::healthy(200, started.elapsed())
            }
            Ok(response) => {
                let code = response.status().as_u16();
                ProbeResult::failed(Some(code), started.elapsed(), format!("HTTP {}", code))
            }
            Err(e) if e.is_timeout() => {
                ProbeResult::failed(None, started.elapsed(), format!("timed out after {:?}", timeout))
            }
            Err(e) => ProbeResult::failed(None, started.elapsed(), e.to_string()),
        }
    }
}

impl Default for HttpChecker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthChecker for HttpChecker {
    async fn probe(&self, record: &ServiceRecord, timeout: Duration) -> ProbeResult {
        self.probe_url(&record.health_url(), timeout).await
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ok_response_is_healthy() {
        let port = test_server::spawn(200, None).await;
        let record = ServiceRecord::new("api", "127.0.0.1", port);
        let result = HttpChecker::new().probe(&record, Duration::from_secs(2)).await;
        assert!(result.healthy, "{:?}", result);
        assert_eq!(result.status_code, Some(200));
    }

    #[tokio::test]
    async fn non_200_is_unhealthy() {
        let port = test_server::spawn(503, None).await;
        let record = ServiceRecord::new("api", "127.0.0.1", port);
        let result = HttpChecker::new().probe(&record, Duration::from_secs(2)).await;
        assert!(!result.healthy);
        assert_eq!(result.status_code, Some(503));
    }

    #[tokio::test]
    async fn hanging_endpoint_times_out() {
        let port = test_server::spawn(200, Some(Duration::from_secs(10))).await;
        let record = ServiceRecord::new("api", "127.0.0.1", port);
        let started = Instant::now();
        let result = HttpChecker::new()
            .probe(&record, Duration::from_millis(200))
            .await;
        assert!(!result.healthy);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn unreachable_port_is_unhealthy() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let record = ServiceRecord::new("api", "127.0.0.1", port);
        let result = HttpChecker::new().probe(&record, Duration::from_secs(1)).await;
        assert!(!result.healthy);
        assert!(result.error.is_some());
    }

    #[test]
    fn rejects_invalid_url() {
        assert!(HttpChecker::validate_url("not-a-url").is_err());
        assert!(HttpChecker::validate_url("ftp://localhost/health").is_err());
        assert!(HttpChecker::validate_url("https://localhost/health").is_ok());
    }
}
