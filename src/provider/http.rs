//! HTTP implementation of the cloud provider API.
//!
//! This module provides the REST client for the provider's resource and
//! inventory endpoints. Every call is a single round-trip; classification of
//! failures into transient and terminal categories happens here, retry
//! scheduling happens in the discovery resolver and the execution engine.

use async_trait::async_trait;
use reqwest::{header, Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace};

use crate::catalog::{DiscoveryQuery, ResourceKind};
use crate::error::{ProviderError, Result, StackforgeError};

use super::api::{CloudProvider, CreatedResource, DiscoveredItem, ResourceAttrs};

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Fallback Retry-After value when the provider omits the header.
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// HTTP cloud provider client.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    /// HTTP client.
    client: Client,
    /// Provider API base URL.
    base_url: String,
    /// API token.
    api_token: String,
}

/// Resource payload for create/update requests.
#[derive(Debug, Serialize)]
struct ResourceRequest<'a> {
    kind: &'a str,
    attributes: &'a ResourceAttrs,
}

/// Resource payload in provider responses.
#[derive(Debug, Deserialize)]
struct ResourceResponse {
    id: String,
    #[serde(default)]
    attributes: ResourceAttrs,
}

/// Inventory listing response.
#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    items: Vec<DiscoveredItem>,
}

/// Unsupported-zone listing response.
#[derive(Debug, Deserialize)]
struct ZonesResponse {
    #[serde(default)]
    zones: Vec<String>,
}

impl HttpProvider {
    /// Creates a new HTTP provider client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(base_url: impl Into<String>, api_token: &str) -> Result<Self> {
        Self::with_timeout(base_url, api_token, DEFAULT_TIMEOUT_SECS)
    }

    /// Creates a client with a custom request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_timeout(
        base_url: impl Into<String>,
        api_token: &str,
        timeout_secs: u64,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ProviderError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token: api_token.to_string(),
        })
    }

    /// Executes a single request and deserializes the response body.
    async fn request<T: for<'de> Deserialize<'de>>(
        &self,
        method: Method,
        path: &str,
        body: Option<&impl Serialize>,
    ) -> Result<T> {
        let response = self.send(method, path, body).await?;

        response.json().await.map_err(|e| {
            StackforgeError::Provider(ProviderError::invalid_response(format!(
                "Failed to parse response: {e}"
            )))
        })
    }

    /// Executes a single request, discarding any response body.
    async fn request_empty(
        &self,
        method: Method,
        path: &str,
        body: Option<&impl Serialize>,
    ) -> Result<()> {
        self.send(method, path, body).await.map(|_| ())
    }

    /// Sends one request and maps error statuses onto the provider error
    /// taxonomy.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&impl Serialize>,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{path}", self.base_url);
        trace!("Provider request: {method} {url}");

        let mut request = self
            .client
            .request(method, &url)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.api_token));

        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            StackforgeError::Provider(ProviderError::network(format!("Request failed: {e}")))
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        Err(StackforgeError::Provider(
            Self::map_error_status(status, path, response).await,
        ))
    }

    /// Maps an error status code onto the provider error taxonomy.
    async fn map_error_status(
        status: StatusCode,
        path: &str,
        response: reqwest::Response,
    ) -> ProviderError {
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
            return ProviderError::RateLimited {
                retry_after_secs: retry_after,
            };
        }

        let body = response.text().await.unwrap_or_default();

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::PermissionDenied {
                message: if body.is_empty() {
                    String::from("Invalid API token")
                } else {
                    body
                },
            },
            StatusCode::NOT_FOUND => ProviderError::NotFound {
                provider_id: path.rsplit('/').next().unwrap_or(path).to_string(),
            },
            StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
                ProviderError::SchemaRejected { message: body }
            }
            StatusCode::PAYMENT_REQUIRED => ProviderError::QuotaExceeded { message: body },
            s if s.is_server_error() => {
                ProviderError::network(format!("Provider returned {s}: {body}"))
            }
            s => ProviderError::api_error(s.as_u16(), body),
        }
    }
}

#[async_trait]
impl CloudProvider for HttpProvider {
    async fn create(
        &self,
        kind: ResourceKind,
        attributes: &ResourceAttrs,
    ) -> Result<CreatedResource> {
        debug!("Creating {kind} resource");
        let request = ResourceRequest {
            kind: kind.as_str(),
            attributes,
        };
        let response: ResourceResponse = self
            .request(Method::POST, "/v1/resources", Some(&request))
            .await?;

        Ok(CreatedResource {
            provider_id: response.id,
            attributes: response.attributes,
        })
    }

    async fn read(&self, provider_id: &str) -> Result<ResourceAttrs> {
        let response: ResourceResponse = self
            .request(
                Method::GET,
                &format!("/v1/resources/{provider_id}"),
                None::<&()>,
            )
            .await?;
        Ok(response.attributes)
    }

    async fn update(
        &self,
        provider_id: &str,
        attributes: &ResourceAttrs,
    ) -> Result<CreatedResource> {
        debug!("Updating resource {provider_id}");
        let response: ResourceResponse = self
            .request(
                Method::PATCH,
                &format!("/v1/resources/{provider_id}"),
                Some(&serde_json::json!({ "attributes": attributes })),
            )
            .await?;

        Ok(CreatedResource {
            provider_id: response.id,
            attributes: response.attributes,
        })
    }

    async fn delete(&self, provider_id: &str) -> Result<()> {
        debug!("Deleting resource {provider_id}");
        self.request_empty(
            Method::DELETE,
            &format!("/v1/resources/{provider_id}"),
            None::<&()>,
        )
        .await
    }

    async fn list(&self, query: &DiscoveryQuery) -> Result<Vec<DiscoveredItem>> {
        match query {
            DiscoveryQuery::SubnetsByVpc { vpc_id } => {
                let response: ListResponse = self
                    .request(
                        Method::GET,
                        &format!("/v1/subnets?vpc_id={vpc_id}"),
                        None::<&()>,
                    )
                    .await?;
                Ok(response.items)
            }
            DiscoveryQuery::UnsupportedZones { kind } => {
                let response: ZonesResponse = self
                    .request(
                        Method::GET,
                        &format!("/v1/placement/unsupported-zones?kind={kind}"),
                        None::<&()>,
                    )
                    .await?;
                Ok(response
                    .zones
                    .into_iter()
                    .map(|zone| DiscoveredItem::new(zone.clone(), zone))
                    .collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_create_maps_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/resources"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "res-123",
                "attributes": {"arn": "arn:provider:role/res-123", "status": "active"}
            })))
            .mount(&server)
            .await;

        let provider = HttpProvider::new(server.uri(), "token").unwrap();
        let created = provider
            .create(ResourceKind::Role, &ResourceAttrs::new())
            .await
            .unwrap();

        assert_eq!(created.provider_id, "res-123");
        assert_eq!(
            created.attributes.get("arn"),
            Some(&serde_json::json!("arn:provider:role/res-123"))
        );
    }

    #[tokio::test]
    async fn test_rate_limit_maps_to_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/resources/res-9"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let provider = HttpProvider::new(server.uri(), "token").unwrap();
        let err = provider.read("res-9").await.unwrap_err();

        assert!(err.is_transient());
        assert_eq!(err.retry_delay_secs(), Some(7));
    }

    #[tokio::test]
    async fn test_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/resources/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let provider = HttpProvider::new(server.uri(), "token").unwrap();
        let err = provider.read("gone").await.unwrap_err();

        assert!(matches!(
            err,
            StackforgeError::Provider(ProviderError::NotFound { provider_id }) if provider_id == "gone"
        ));
    }

    #[tokio::test]
    async fn test_permission_denied_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1/resources/res-1"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let provider = HttpProvider::new(server.uri(), "token").unwrap();
        let err = provider.delete("res-1").await.unwrap_err();

        assert!(!err.is_transient());
        assert!(matches!(
            err,
            StackforgeError::Provider(ProviderError::PermissionDenied { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_subnets() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/subnets"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [
                    {"id": "subnet-1", "zone": "eu-west-1a"},
                    {"id": "subnet-2", "zone": "eu-west-1b"}
                ]
            })))
            .mount(&server)
            .await;

        let provider = HttpProvider::new(server.uri(), "token").unwrap();
        let items = provider
            .list(&DiscoveryQuery::SubnetsByVpc {
                vpc_id: String::from("vpc-1"),
            })
            .await
            .unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].zone.as_deref(), Some("eu-west-1a"));
    }
}
