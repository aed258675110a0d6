//! Egress proxy discovery.
//!
//! The resolver endpoint answers a plain GET with the host name of the proxy
//! to use; the configured port is appended to form the proxy URL.

use crate::config::ProxyResolverConfig;
use crate::utils::errors::{BackupError, Result};
use std::time::Duration;
use tracing::info;

const RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ProxyResolver {
    uri: String,
    port: u16,
}

impl ProxyResolver {
    pub fn from_config(config: &ProxyResolverConfig) -> Self {
        Self {
            uri: config.uri.clone(),
            port: config.proxy_port,
        }
    }

    /// Ask the resolver for a proxy host and return `http://host:port`.
    pub async fn resolve(&self) -> Result<String> {
        let client = reqwest::Client::builder().timeout(RESOLVE_TIMEOUT).no_proxy().build()?;
        let response = client.get(&self.uri).send().await?.error_for_status()?;
        let body = response.text().await?;

        let url = proxy_url(&body, self.port)?;
        info!(resolver = %self.uri, proxy = %url, "Resolved storage proxy");
        Ok(url)
    }
}

fn proxy_url(body: &str, port: u16) -> Result<String> {
    let host = body.trim();
    if host.is_empty() || host.contains(char::is_whitespace) || host.contains('/') {
        return Err(BackupError::Configuration(format!(
            "proxy resolver returned an invalid host: {host:?}"
        )));
    }
    Ok(format!("http://{host}:{port}"))
}
