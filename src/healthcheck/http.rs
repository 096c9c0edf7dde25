use super::{HealthChecker, ProbeReport};
use crate::error::{Error, Result};
use crate::registry::CheckType;
use async_trait::async_trait;
use reqwest::Client;
use std::sync::OnceLock;
use std::time::Duration;

/// Global shared HTTP client for health checks.
///
/// One pooled client serves every checker; individual requests carry their
/// own timeout.
static SHARED_HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

fn get_shared_client() -> &'static Client {
    SHARED_HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default HTTP client");
                Client::new()
            })
    })
}

/// HTTP-based health checker. See [`classify_status`] for how responses map.
pub struct HttpChecker {
    url: String,
    client: Client,
    timeout: Duration,
}

impl HttpChecker {
    /// Create a checker on the shared client.
    ///
    /// # Errors
    ///
    /// Returns error if URL is malformed or uses unsupported scheme.
    pub fn new(url: String, timeout: Duration) -> Result<Self> {
        Self::validate_url(&url)?;
        Ok(Self {
            url,
            client: get_shared_client().clone(),
            timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Validate that a URL is well-formed and uses HTTP/HTTPS scheme.
    fn validate_url(url: &str) -> Result<()> {
        match url::Url::parse(url) {
            Ok(parsed) => {
                let scheme = parsed.scheme();
                if scheme != "http" && scheme != "https" {
                    return Err(Error::Config(format!(
                        "Invalid healthcheck URL '{}': scheme must be http or https, got '{}'",
                        url, scheme
                    )));
                }
                Ok(())
            }
            Err(e) => Err(Error::Config(format!(
                "Invalid healthcheck URL '{}': {}",
                url, e
            ))),
        }
    }
}

#[async_trait]
impl HealthChecker for HttpChecker {
    async fn check(&self) -> Result<bool> {
        let response = self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await?;
        Ok(classify_status(response.status().as_u16(), None).success)
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn method(&self) -> CheckType {
        CheckType::Http
    }

    fn endpoint(&self) -> Option<String> {
        Some(self.url.clone())
    }

    async fn probe(&self) -> ProbeReport {
        match self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(response) => {
                let status = response.status();
                let body = if status.is_success() {
                    response.bytes().await.ok()
                } else {
                    None
                };
                let mut report = classify_status(status.as_u16(), body.as_deref());
                if !report.success {
                    report.error = Some(format!("GET {} returned {}", self.url, status));
                } else if report.degraded {
                    report.error = Some(format!("GET {} reported degraded", self.url));
                }
                report
            }
            Err(e) if e.is_timeout() => ProbeReport::failed(format!(
                "GET {} timed out after {}ms",
                self.url,
                self.timeout.as_millis()
            )),
            Err(e) => ProbeReport::failed(format!("GET {} failed: {}", self.url, e)),
        }
    }
}

/// Largest body inspected for a `status` field.
const MAX_STATUS_BODY: usize = 64 * 1024;

/// Map a final response to a probe outcome.
///
/// 2xx and 3xx pass, 4xx passes as degraded, and anything else fails. A 2xx JSON body
/// with a `status` field overrides that: `degraded`/`warning` pass as
/// degraded and `unhealthy`/`down`/`error` fail.
fn classify_status(code: u16, body: Option<&[u8]>) -> ProbeReport {
    let mut report = ProbeReport {
        success: (200..500).contains(&code),
        degraded: (400..500).contains(&code),
        status_code: Some(code),
        error: None,
    };

    let declared = body
        .filter(|b| !b.is_empty() && b.len() <= MAX_STATUS_BODY)
        .and_then(|b| serde_json::from_slice::<serde_json::Value>(b).ok())
        .and_then(|v| v.get("status").and_then(|s| s.as_str()).map(str::to_ascii_lowercase));
    match declared.as_deref() {
        Some("healthy" | "ok" | "up") => {}
        Some("degraded" | "warning") => report.degraded = true,
        Some("unhealthy" | "down" | "error") => report.success = false,
        _ => {}
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(status_line: &'static str) -> u16 {
        serve_body(status_line, "").await
    }

    async fn serve_body(status_line: &'static str, body: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = sock.read(&mut buf).await;
                let response = format!(
                    "{}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    status_line,
                    body.len(),
                    body
                );
                let _ = sock.write_all(response.as_bytes()).await;
            }
        });
        port
    }

    #[tokio::test]
    async fn test_http_checker_unreachable_port() {
        let checker = HttpChecker::new(
            "http://127.0.0.1:1/health".to_string(),
            Duration::from_secs(1),
        )
        .unwrap();
        let report = checker.probe().await;
        assert!(!report.success);
        assert!(report.error.is_some());
    }

    #[tokio::test]
    async fn test_http_checker_success_and_failure_codes() {
        let port = serve_once("HTTP/1.1 200 OK").await;
        let ok = HttpChecker::new(format!("http://127.0.0.1:{}/h", port), Duration::from_secs(2))
            .unwrap();
        let report = ok.probe().await;
        assert!(report.success);
        assert_eq!(report.status_code, Some(200));

        let port = serve_once("HTTP/1.1 503 Service Unavailable").await;
        let bad = HttpChecker::new(format!("http://127.0.0.1:{}/h", port), Duration::from_secs(2))
            .unwrap();
        let report = bad.probe().await;
        assert!(!report.success);
        assert_eq!(report.status_code, Some(503));
    }

    #[tokio::test]
    async fn test_http_checker_reads_declared_status() {
        let port = serve_body("HTTP/1.1 200 OK", r#"{"status":"degraded"}"#).await;
        let checker = HttpChecker::new(format!("http://127.0.0.1:{}/h", port), Duration::from_secs(2))
            .unwrap();
        let report = checker.probe().await;
        assert!(report.success);
        assert!(report.degraded);

        let port = serve_body("HTTP/1.1 200 OK", r#"{"status":"DOWN"}"#).await;
        let checker = HttpChecker::new(format!("http://127.0.0.1:{}/h", port), Duration::from_secs(2))
            .unwrap();
        let report = checker.probe().await;
        assert!(!report.success);
        assert!(report.error.is_some());
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(204, None), ProbeReport {
            success: true,
            degraded: false,
            status_code: Some(204),
            error: None,
        });
        let not_found = classify_status(404, None);
        assert!(not_found.success && not_found.degraded);
        assert!(!classify_status(500, None).success);
        assert!(classify_status(302, None).success);
        assert!(classify_status(200, Some(b"{\"status\":\"warning\"}")).degraded);
        assert!(!classify_status(200, Some(b"{\"status\":\"error\"}")).success);
        let plain = classify_status(200, Some(b"all good"));
        assert!(plain.success && !plain.degraded);
    }

    #[test]
    fn test_invalid_urls_rejected() {
        assert!(HttpChecker::new("ftp://x/".into(), Duration::from_secs(1)).is_err());
        assert!(HttpChecker::new("not a url".into(), Duration::from_secs(1)).is_err());
    }
}
