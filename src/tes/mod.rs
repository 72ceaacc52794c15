//! TES Backend Client
//!
//! The execution backend is consumed through two calls only: fetching a
//! sub-task's log document and canceling a sub-task. Submission happens
//! inside the engine wrapper process and never goes through this client.
//!
//! - [`TesClient`]: the calls the core makes
//! - [`HttpTesClient`]: GA4GH TES v1 over HTTP

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;

use crate::config::TesServerConfig;
use crate::error::BackendError;

/// Path prefix of the TES v1 API.
const TES_API_PATH: &str = "ga4gh/tes/v1/tasks";

/// Execution backend calls used by the monitor and the cancel job.
#[async_trait]
pub trait TesClient: Send + Sync {
    /// Fetches the full task document of a sub-task.
    async fn get_task(&self, id: &str, token: Option<&str>) -> Result<Value, BackendError>;

    /// Requests cancellation of a sub-task.
    ///
    /// Returns [`BackendError::AlreadyFinished`] when the backend refuses
    /// because the sub-task reached a final state.
    async fn cancel_task(&self, id: &str, token: Option<&str>) -> Result<(), BackendError>;
}

/// HTTP client for a TES v1 server.
pub struct HttpTesClient {
    client: Client,
    base_url: String,
    view: String,
}

impl HttpTesClient {
    /// Builds a client with the configured per-request timeout.
    pub fn new(config: &TesServerConfig) -> Result<Self, BackendError> {
        Self::with_timeout(&config.url, &config.status_query_params, config.timeout())
    }

    pub fn with_timeout(
        base_url: &str,
        view: &str,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            view: view.to_string(),
        })
    }

    fn task_url(&self, id: &str) -> String {
        format!("{}/{}/{}", self.base_url, TES_API_PATH, id)
    }

    fn authorize(request: RequestBuilder, token: Option<&str>) -> RequestBuilder {
        match token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl TesClient for HttpTesClient {
    async fn get_task(&self, id: &str, token: Option<&str>) -> Result<Value, BackendError> {
        let url = self.task_url(id);
        debug!("GET {} (view={})", url, self.view);

        let request = self.client.get(&url).query(&[("view", self.view.as_str())]);
        let response = Self::authorize(request, token).send().await?;

        if !response.status().is_success() {
            return Err(BackendError::Status {
                id: id.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response.json::<Value>().await?)
    }

    async fn cancel_task(&self, id: &str, token: Option<&str>) -> Result<(), BackendError> {
        let url = format!("{}:cancel", self.task_url(id));
        debug!("POST {}", url);

        let response = Self::authorize(self.client.post(&url), token).send().await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::BAD_REQUEST | StatusCode::CONFLICT => {
                Err(BackendError::AlreadyFinished(id.to_string()))
            }
            status => Err(BackendError::Status {
                id: id.to_string(),
                status: status.as_u16(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_url_normalizes_trailing_slash() {
        let client =
            HttpTesClient::with_timeout("https://tes.example.org/", "FULL", Duration::from_secs(1))
                .unwrap();
        assert_eq!(
            client.task_url("task-1"),
            "https://tes.example.org/ga4gh/tes/v1/tasks/task-1"
        );
    }

    #[test]
    fn test_new_uses_config_view() {
        let config = TesServerConfig {
            url: "http://localhost:8000".to_string(),
            timeout: 2.0,
            status_query_params: "BASIC".to_string(),
        };
        let client = HttpTesClient::new(&config).unwrap();
        assert_eq!(client.view, "BASIC");
        assert_eq!(client.base_url, "http://localhost:8000");
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_http_error() {
        let client =
            HttpTesClient::with_timeout("http://127.0.0.1:9", "FULL", Duration::from_millis(200))
                .unwrap();
        let err = client.get_task("task-1", None).await.unwrap_err();
        assert!(matches!(err, BackendError::Http(_)));
    }
}
