use std::net::IpAddr;
use std::time::Duration;

use newsloom_core::config::HttpMethod;
use newsloom_core::error::AppError;
use newsloom_core::traits::{FetchRequest, Fetcher};
use reqwest::Client;
use reqwest::header::RETRY_AFTER;
use url::Url;

/// HTTP fetcher using reqwest.
///
/// SSRF protection is **enabled** by default: requests to private or
/// reserved addresses are refused. Use
/// [`allow_private_urls`](Self::allow_private_urls) for sources that live
/// on the local network.
#[derive(Clone)]
pub struct ReqwestFetcher {
    client: Client,
    timeout: Duration,
    ssrf_protection: bool,
}

impl ReqwestFetcher {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(concat!("newsloom/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            timeout,
            ssrf_protection: true,
        })
    }

    /// Disable SSRF protection, allowing requests to private/reserved IPs.
    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }

    fn map_send_error(&self, e: reqwest::Error, limit: Duration) -> AppError {
        if e.is_timeout() {
            AppError::Timeout(limit)
        } else if e.is_connect() {
            AppError::NetworkError(format!("Connection failed: {e}"))
        } else if e.is_builder() {
            AppError::Config(format!("Invalid request: {e}"))
        } else {
            AppError::NetworkError(e.to_string())
        }
    }
}

impl Fetcher for ReqwestFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<String, AppError> {
        let mut url = Url::parse(&request.url)
            .map_err(|e| AppError::Config(format!("Invalid URL '{}': {e}", request.url)))?;
        if !request.query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(request.query.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }

        if self.ssrf_protection {
            validate_url(&url).await?;
        }

        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(url.clone()),
            HttpMethod::Post => self.client.post(url.clone()),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        let limit = request.timeout.unwrap_or(self.timeout);
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| self.map_send_error(e, limit))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            tracing::debug!(url = %url, status = status.as_u16(), "Unsuccessful response");
            return Err(AppError::from_status(status.as_u16(), url.as_str(), retry_after));
        }

        response.text().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(limit)
            } else {
                AppError::NetworkError(format!("Failed to read response body: {e}"))
            }
        })
    }
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Refuse non-http(s) schemes and hosts that resolve to private addresses.
async fn validate_url(url: &Url) -> Result<(), AppError> {
    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::Config(format!(
                "URL scheme '{scheme}' is not allowed (only http/https)"
            )));
        }
    }

    let host = url
        .host_str()
        .ok_or_else(|| AppError::Config("URL has no host".to_string()))?;
    let literal = host.trim_start_matches('[').trim_end_matches(']');

    if let Ok(ip) = literal.parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Err(AppError::Config(format!(
                "SSRF blocked: {host} is a private/reserved address"
            )));
        }
        return Ok(());
    }

    let port = url.port_or_known_default().unwrap_or(80);
    let addrs: Vec<_> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| AppError::NetworkError(format!("DNS resolution failed for {host}: {e}")))?
        .collect();

    if addrs.is_empty() {
        return Err(AppError::NetworkError(format!(
            "DNS resolution returned no addresses for {host}"
        )));
    }
    if let Some(blocked) = addrs.iter().find(|a| is_private_ip(a.ip())) {
        return Err(AppError::Config(format!(
            "SSRF blocked: {host} resolves to private/reserved IP {}",
            blocked.ip()
        )));
    }
    Ok(())
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local() // cloud metadata lives here
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64 // 100.64.0.0/10
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xFFC0) == 0xFE80
                || (v6.segments()[0] & 0xFE00) == 0xFC00
                || v6
                    .to_ipv4_mapped()
                    .is_some_and(|v4| is_private_ip(IpAddr::V4(v4)))
        }
    }
}
