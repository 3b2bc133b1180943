//! Best-effort enablement of the server-side change feed for a table.

use crate::error::{RealtimeError, Result};
use async_trait::async_trait;
use serde_json::json;
use url::Url;

const DEFAULT_RPC_FUNCTION: &str = "enable_realtime";

/// Asks the server to publish row changes for a table.
///
/// Calls must be idempotent; the engine caches a table once a call has
/// succeeded and never repeats it for that table.
#[async_trait]
pub trait PublicationEnabler: Send + Sync + 'static {
    async fn enable_table(&self, table: &str) -> Result<()>;
}

/// For backends where every table is already published.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEnabler;

#[async_trait]
impl PublicationEnabler for NoopEnabler {
    async fn enable_table(&self, _table: &str) -> Result<()> {
        Ok(())
    }
}

/// Calls a database RPC (`POST {base}/rest/v1/rpc/{function}`) that adds
/// the table to the realtime publication.
#[derive(Debug, Clone)]
pub struct HttpPublicationEnabler {
    client: reqwest::Client,
    base_url: Url,
    function: String,
    api_key: String,
    access_token: Option<String>,
}

impl HttpPublicationEnabler {
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: Url::parse(base_url)?,
            function: DEFAULT_RPC_FUNCTION.to_string(),
            api_key: api_key.into(),
            access_token: None,
        })
    }

    pub fn with_function(mut self, function: impl Into<String>) -> Self {
        self.function = function.into();
        self
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn endpoint(&self) -> Result<Url> {
        Ok(self
            .base_url
            .join(&format!("rest/v1/rpc/{}", self.function))?)
    }
}

#[async_trait]
impl PublicationEnabler for HttpPublicationEnabler {
    async fn enable_table(&self, table: &str) -> Result<()> {
        let bearer = self.access_token.as_deref().unwrap_or(&self.api_key);

        let response = self
            .client
            .post(self.endpoint()?)
            .header("apikey", &self.api_key)
            .bearer_auth(bearer)
            .json(&json!({ "table_name": table }))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(table, "change feed enabled");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(RealtimeError::PublicationFailed {
            table: table.to_string(),
            reason: format!("HTTP {}: {}", status, body),
        })
    }
}
