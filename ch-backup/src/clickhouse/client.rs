//! Minimal client for the ClickHouse HTTP interface.

use crate::config::ClickhouseConfig;
use crate::utils::errors::{BackupError, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct JsonResult<T> {
    data: Vec<T>,
}

#[derive(Debug, Clone)]
pub struct ClickhouseClient {
    http: reqwest::Client,
    url: String,
    user: Option<String>,
    password: Option<String>,
}

impl ClickhouseClient {
    pub fn new(config: &ClickhouseConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(config.timeout_secs));

        if let Some(ca) = &config.ca_path {
            let pem = std::fs::read(ca)?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }
        if config.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }

        Ok(Self {
            http: builder.build()?,
            url: format!("{}/", config.base_url()),
            user: config.user.clone(),
            password: config.password.clone(),
        })
    }

    /// Run a statement that returns no rows.
    pub async fn execute(&self, sql: &str) -> Result<()> {
        self.send(sql, &[]).await?;
        Ok(())
    }

    /// Run a query with `{name:Type}` placeholders bound from `params`
    /// and decode its `FORMAT JSON` rows.
    pub async fn query<T: DeserializeOwned>(&self, sql: &str, params: &[(&str, &str)]) -> Result<Vec<T>> {
        let body = self.send(&format!("{sql} FORMAT JSON"), params).await?;
        let result: JsonResult<T> = serde_json::from_str(&body)?;
        Ok(result.data)
    }

    async fn send(&self, sql: &str, params: &[(&str, &str)]) -> Result<String> {
        debug!(query = %sql, "Executing ClickHouse query");

        let query: Vec<(String, &str)> = params.iter().map(|(k, v)| (format!("param_{k}"), *v)).collect();
        let mut request = self.http.post(&self.url).query(&query).body(sql.to_string());
        if let Some(user) = &self.user {
            request = request.header("X-ClickHouse-User", user);
        }
        if let Some(password) = &self.password {
            request = request.header("X-ClickHouse-Key", password);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(BackupError::Clickhouse(format!("{status}: {}", body.trim())));
        }
        Ok(body)
    }
}
