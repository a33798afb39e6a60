//! Passthrough proxy for cross-origin fetches.
//!
//! When a deployment cannot reach third-party origins directly, requests
//! are rewritten to `{prefix}{percent-encoded target URL}`. Hosts listed as
//! direct are fetched without the proxy.

use url::Url;
use url::form_urlencoded::byte_serialize;

use crate::error::AppError;
use crate::traits::{FetchRequest, Fetcher};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Prefix the encoded target is appended to, e.g. `https://proxy.local/?url=`.
    pub prefix: String,
    /// Hosts that are fetched directly.
    pub direct_hosts: Vec<String>,
}

impl ProxyConfig {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            direct_hosts: Vec::new(),
        }
    }

    pub fn with_direct_host(mut self, host: impl Into<String>) -> Self {
        self.direct_hosts.push(host.into().to_ascii_lowercase());
        self
    }
}

/// A [`Fetcher`] that routes requests through an optional proxy prefix.
#[derive(Clone)]
pub struct ProxiedFetcher<F> {
    inner: F,
    proxy: Option<ProxyConfig>,
}

impl<F: Fetcher> ProxiedFetcher<F> {
    pub fn new(inner: F, proxy: Option<ProxyConfig>) -> Self {
        Self { inner, proxy }
    }

    /// Rewrite `request` for the proxy, folding its query into the target URL.
    pub fn rewrite(&self, request: &FetchRequest) -> Result<FetchRequest, AppError> {
        let Some(proxy) = &self.proxy else {
            return Ok(request.clone());
        };

        let mut target = Url::parse(&request.url)
            .map_err(|e| AppError::Config(format!("Invalid URL '{}': {e}", request.url)))?;
        let direct = target
            .host_str()
            .is_some_and(|h| proxy.direct_hosts.iter().any(|d| d.eq_ignore_ascii_case(h)));
        if direct {
            return Ok(request.clone());
        }

        if !request.query.is_empty() {
            target
                .query_pairs_mut()
                .extend_pairs(request.query.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
        let encoded: String = byte_serialize(target.as_str().as_bytes()).collect();

        Ok(FetchRequest {
            url: format!("{}{encoded}", proxy.prefix),
            query: Vec::new(),
            ..request.clone()
        })
    }
}

impl<F: Fetcher> Fetcher for ProxiedFetcher<F> {
    async fn fetch(&self, request: &FetchRequest) -> Result<String, AppError> {
        let routed = self.rewrite(request)?;
        if routed.url != request.url {
            tracing::trace!(target_url = %request.url, "Fetching through proxy");
        }
        self.inner.fetch(&routed).await
    }
}
