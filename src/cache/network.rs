//! Network collaborator seen by the adapter engine.

use async_trait::async_trait;
use serde::Deserialize;

use super::traits::FetchPriority;

/// What a successful network round trip produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
  /// A new serialized payload
  Updated(String),
  /// The server says the caller's copy is still current
  NotModified,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum NetworkError {
  #[error("transport error: {0}")]
  Transport(String),
  #[error("unexpected status {0}")]
  Status(u16),
  #[error("malformed payload: {0}")]
  MalformedPayload(String),
  #[error("adapter has no network handle attached")]
  NotAttached,
}

/// Fetches serialized specs for an sdk key.
///
/// Retries and backoff are the implementor's business.
#[async_trait]
pub trait NetworkFetcher: Send + Sync {
  async fn fetch(
    &self,
    sdk_key: &str,
    priority: Option<FetchPriority>,
  ) -> Result<FetchOutcome, NetworkError>;
}

#[derive(Deserialize)]
struct UpdateMarker {
  has_updates: bool,
}

impl FetchOutcome {
  /// Interpret a 200 response body.
  ///
  /// The body must be JSON carrying a boolean `has_updates`; `false` means
  /// not-modified. The body itself becomes the payload when it has updates.
  pub fn from_response_body(body: String) -> Result<Self, NetworkError> {
    let marker: UpdateMarker = serde_json::from_str(&body)
      .map_err(|e| NetworkError::MalformedPayload(e.to_string()))?;

    if marker.has_updates {
      Ok(Self::Updated(body))
    } else {
      Ok(Self::NotModified)
    }
  }
}
