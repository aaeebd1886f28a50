use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::StatusCode;
use tracing::debug;
use url::Url;

use crate::cache::{FetchOutcome, FetchPriority, NetworkError, NetworkFetcher};
use crate::config::ApiConfig;

/// HTTP client for the config specs download endpoint
#[derive(Clone)]
pub struct HttpSpecsFetcher {
  client: reqwest::Client,
  base_url: Url,
}

impl HttpSpecsFetcher {
  pub fn new(config: &ApiConfig) -> Result<Self> {
    let base_url = Url::parse(&config.base_url)
      .map_err(|e| eyre!("Invalid API base URL {}: {}", config.base_url, e))?;

    let client = reqwest::Client::builder()
      .timeout(config.timeout())
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, base_url })
  }

  /// URL of the specs document for `sdk_key`
  pub fn endpoint(&self, sdk_key: &str) -> Result<Url, NetworkError> {
    self
      .base_url
      .join(&format!("download_config_specs/{}.json", sdk_key))
      .map_err(|e| NetworkError::Transport(format!("invalid endpoint: {}", e)))
  }
}

#[async_trait]
impl NetworkFetcher for HttpSpecsFetcher {
  async fn fetch(
    &self,
    sdk_key: &str,
    priority: Option<FetchPriority>,
  ) -> Result<FetchOutcome, NetworkError> {
    let url = self.endpoint(sdk_key)?;
    debug!(
      priority = priority.unwrap_or_default().as_str(),
      path = url.path(),
      "fetching config specs"
    );

    let response = self
      .client
      .get(url)
      .send()
      .await
      .map_err(|e| NetworkError::Transport(e.to_string()))?;

    match response.status() {
      StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED => Ok(FetchOutcome::NotModified),
      status if status.is_success() => {
        let body = response
          .text()
          .await
          .map_err(|e| NetworkError::Transport(e.to_string()))?;
        FetchOutcome::from_response_body(body)
      }
      status => Err(NetworkError::Status(status.as_u16())),
    }
  }
}
