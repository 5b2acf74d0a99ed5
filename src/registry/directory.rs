use super::instance::{HealthStatus, ServiceInstance};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("directory API error: HTTP {status}: {message}")]
    Api { status: u16, message: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Health vocabulary of the external directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectoryHealth {
    Passing,
    Warning,
    Critical,
}

impl From<HealthStatus> for DirectoryHealth {
    fn from(status: HealthStatus) -> Self {
        match status {
            HealthStatus::Healthy => DirectoryHealth::Passing,
            HealthStatus::Degraded => DirectoryHealth::Warning,
            HealthStatus::Unhealthy | HealthStatus::Offline => DirectoryHealth::Critical,
        }
    }
}

/// Contract of the optional external service directory.
///
/// Any REST backend (or an in-memory double) can stand behind this trait;
/// the registry stays fully functional with no directory at all.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    async fn register(&self, instance: &ServiceInstance) -> Result<(), DirectoryError>;
    async fn deregister(&self, id: &str) -> Result<(), DirectoryError>;
    async fn update_health(&self, id: &str, health: DirectoryHealth) -> Result<(), DirectoryError>;
    async fn list_services(&self) -> Result<Vec<ServiceInstance>, DirectoryError>;
    async fn list_healthy(&self, name: &str) -> Result<Vec<ServiceInstance>, DirectoryError>;
}

#[derive(Debug, Serialize)]
struct HealthUpdateBody {
    status: DirectoryHealth,
}

/// REST client for the external directory service.
pub struct HttpDirectoryClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpDirectoryClient {
    pub fn new(base_url: &str) -> Result<Self, DirectoryError> {
        let mut headers = HeaderMap::new();
        headers.insert("Content-Type", HeaderValue::from_static("application/json"));
        headers.insert("Accept", HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(5))
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/services{}", self.base_url, path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, DirectoryError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(DirectoryError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl DirectoryClient for HttpDirectoryClient {
    async fn register(&self, instance: &ServiceInstance) -> Result<(), DirectoryError> {
        let url = self.url(&format!("/{}", instance.id));
        debug!(%url, "registering instance with directory");
        let response = self.client.put(&url).json(instance).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn deregister(&self, id: &str) -> Result<(), DirectoryError> {
        let url = self.url(&format!("/{}/deregister", id));
        debug!(%url, "deregistering instance from directory");
        let response = self.client.put(&url).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn update_health(&self, id: &str, health: DirectoryHealth) -> Result<(), DirectoryError> {
        let url = self.url(&format!("/{}/health", id));
        let response = self
            .client
            .put(&url)
            .json(&HealthUpdateBody { status: health })
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn list_services(&self) -> Result<Vec<ServiceInstance>, DirectoryError> {
        let url = self.url("");
        let response = self.client.get(&url).send().await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    async fn list_healthy(&self, name: &str) -> Result<Vec<ServiceInstance>, DirectoryError> {
        let url = self.url(&format!("/healthy/{}", name));
        let response = self.client.get(&url).send().await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_health_vocabulary_mapping() {
        assert_eq!(
            DirectoryHealth::from(HealthStatus::Healthy),
            DirectoryHealth::Passing
        );
        assert_eq!(
            DirectoryHealth::from(HealthStatus::Degraded),
            DirectoryHealth::Warning
        );
        assert_eq!(
            DirectoryHealth::from(HealthStatus::Unhealthy),
            DirectoryHealth::Critical
        );
        assert_eq!(
            DirectoryHealth::from(HealthStatus::Offline),
            DirectoryHealth::Critical
        );
    }

    #[tokio::test]
    async fn test_register_puts_instance() {
        let server = MockServer::start().await;
        let client = HttpDirectoryClient::new(&server.uri()).unwrap();
        let instance = ServiceInstance::new("svc-a", "localhost", 3000);

        Mock::given(method("PUT"))
            .and(path(format!("/v1/services/{}", instance.id)))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        client.register(&instance).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_health_sends_mapped_status() {
        let server = MockServer::start().await;
        let client = HttpDirectoryClient::new(&server.uri()).unwrap();

        Mock::given(method("PUT"))
            .and(path("/v1/services/abc/health"))
            .and(body_json(serde_json::json!({ "status": "warning" })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        client
            .update_health("abc", HealthStatus::Degraded.into())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_list_services_deserializes() {
        let server = MockServer::start().await;
        let client = HttpDirectoryClient::new(&server.uri()).unwrap();
        let instance = ServiceInstance::new("svc-a", "localhost", 3000);

        Mock::given(method("GET"))
            .and(path("/v1/services"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vec![instance.clone()]))
            .mount(&server)
            .await;

        let listed = client.list_services().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, instance.id);
    }

    #[tokio::test]
    async fn test_error_status_maps_to_api_error() {
        let server = MockServer::start().await;
        let client = HttpDirectoryClient::new(&server.uri()).unwrap();

        Mock::given(method("PUT"))
            .and(path("/v1/services/missing/deregister"))
            .respond_with(ResponseTemplate::new(404).set_body_string("unknown id"))
            .mount(&server)
            .await;

        match client.deregister("missing").await.unwrap_err() {
            DirectoryError::Api { status, message } => {
                assert_eq!(status, 404);
                assert_eq!(message, "unknown id");
            }
            other => panic!("expected Api error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_directory_is_network_error() {
        let client = HttpDirectoryClient::new("http://127.0.0.1:1").unwrap();
        assert!(matches!(
            client.list_services().await.unwrap_err(),
            DirectoryError::Network(_)
        ));
    }
}
