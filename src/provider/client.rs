//! HTTP provider client.
//!
//! Talks to a Stackform control plane over a small REST surface:
//!
//! | Operation | Route                              |
//! |-----------|------------------------------------|
//! | whoami    | `GET /v1/whoami`                   |
//! | create    | `POST /v1/resources/{kind}`        |
//! | read      | `GET /v1/resources/{kind}/{id}`    |
//! | update    | `PATCH /v1/resources/{kind}/{id}`  |
//! | delete    | `DELETE /v1/resources/{kind}/{id}` |
//!
//! The client does not retry; the executor wraps each call in a
//! [`super::RetryPolicy`].

use async_trait::async_trait;
use reqwest::{header, Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::{ProviderError, Result, StackformError};

use super::traits::{Attributes, Provider, ProviderResource};

/// Default control plane endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://api.stackform.dev";

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Wait used when a 429 carries no usable `Retry-After`.
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// Header carrying the default region for resources that set none.
const REGION_HEADER: &str = "x-stackform-region";

/// HTTP-backed provider.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    /// HTTP client.
    client: Client,
    /// Base URL without trailing slash.
    endpoint: String,
    /// Bearer token.
    token: String,
    /// Default region.
    region: Option<String>,
}

#[derive(Debug, Serialize)]
struct AttributesBody<'a> {
    attributes: &'a Attributes,
}

#[derive(Debug, Deserialize)]
struct AttributesResponse {
    #[serde(default)]
    attributes: Attributes,
}

#[derive(Debug, Deserialize)]
struct WhoAmIResponse {
    account: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// How a 404 should be interpreted for a given operation.
#[derive(Debug, Clone, Copy)]
enum NotFoundMeans {
    /// The resource is gone; callers get `None`.
    Absent,
    /// A just-created resource is not visible yet.
    NotYetVisible,
    /// A delete target is gone.
    AlreadyDeleted,
    /// The route itself was rejected.
    BadRequest,
}

impl HttpProvider {
    /// Creates a new client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(endpoint: &str, token: &str) -> Result<Self> {
        Self::with_timeout(endpoint, token, DEFAULT_TIMEOUT_SECS)
    }

    /// Creates a client with a custom timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_timeout(endpoint: &str, token: &str, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(concat!("stackform/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProviderError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: token.to_string(),
            region: None,
        })
    }

    /// Sets the default region sent with every request.
    #[must_use]
    pub fn with_region(mut self, region: Option<String>) -> Self {
        self.region = region;
        self
    }

    /// Gets the endpoint this client talks to.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{path}", self.endpoint);
        trace!("{method} {url}");
        let builder = self
            .client
            .request(method, url)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.token))
            .header(header::ACCEPT, "application/json");
        match &self.region {
            Some(region) => builder.header(REGION_HEADER, region),
            None => builder,
        }
    }

    async fn send(
        &self,
        builder: RequestBuilder,
        resource: &str,
        not_found: NotFoundMeans,
    ) -> Result<Option<Response>> {
        let response = builder
            .send()
            .await
            .map_err(|e| ProviderError::network(format!("Request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(Some(response));
        }

        if status == StatusCode::NOT_FOUND {
            return match not_found {
                NotFoundMeans::Absent => Ok(None),
                NotFoundMeans::NotYetVisible => Err(ProviderError::Inconsistent {
                    resource: resource.to_string(),
                    message: String::from("resource not visible yet"),
                }
                .into()),
                NotFoundMeans::AlreadyDeleted => {
                    let (kind, id) = resource.split_once('/').unwrap_or((resource, ""));
                    Err(ProviderError::NotFound {
                        kind: kind.to_string(),
                        id: id.to_string(),
                    }
                    .into())
                }
                NotFoundMeans::BadRequest => Err(ProviderError::InvalidParameter {
                    resource: resource.to_string(),
                    message: String::from("unknown resource kind"),
                }
                .into()),
            };
        }

        Err(map_status(status, response, resource).await)
    }

    async fn parse<T: for<'de> Deserialize<'de>>(response: Response) -> Result<T> {
        response.json::<T>().await.map_err(|e| {
            StackformError::Provider(ProviderError::InvalidResponse {
                message: format!("Failed to parse response: {e}"),
            })
        })
    }
}

async fn map_status(status: StatusCode, response: Response, resource: &str) -> StackformError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
        return ProviderError::RateLimited {
            retry_after_secs: retry_after,
        }
        .into();
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body).map_or(body, |b| b.message);
    let resource = resource.to_string();

    let error = match status.as_u16() {
        401 | 403 => ProviderError::Authentication { message },
        409 => ProviderError::Conflict { resource, message },
        code if code >= 500 => ProviderError::Unavailable {
            status: code,
            message,
        },
        _ => ProviderError::InvalidParameter { resource, message },
    };
    error.into()
}

#[async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn check_auth(&self) -> Result<String> {
        let builder = self.request(Method::GET, "/v1/whoami");
        let response = self
            .send(builder, "whoami", NotFoundMeans::BadRequest)
            .await?
            .ok_or_else(|| StackformError::internal("whoami returned no response"))?;
        let body: WhoAmIResponse = Self::parse(response).await?;
        debug!("Authenticated as {}", body.account);
        Ok(body.account)
    }

    async fn read(&self, kind: &str, id: &str) -> Result<Option<Attributes>> {
        let builder = self.request(Method::GET, &format!("/v1/resources/{kind}/{id}"));
        match self
            .send(builder, &format!("{kind}/{id}"), NotFoundMeans::Absent)
            .await?
        {
            Some(response) => {
                let body: AttributesResponse = Self::parse(response).await?;
                Ok(Some(body.attributes))
            }
            None => Ok(None),
        }
    }

    async fn create(&self, kind: &str, attributes: &Attributes) -> Result<ProviderResource> {
        let builder = self
            .request(Method::POST, &format!("/v1/resources/{kind}"))
            .json(&AttributesBody { attributes });
        let response = self
            .send(builder, kind, NotFoundMeans::BadRequest)
            .await?
            .ok_or_else(|| StackformError::internal("create returned no response"))?;
        let created: ProviderResource = Self::parse(response).await?;
        debug!("Created {kind} {}", created.id);
        Ok(created)
    }

    async fn update(&self, kind: &str, id: &str, attributes: &Attributes) -> Result<Attributes> {
        let builder = self
            .request(Method::PATCH, &format!("/v1/resources/{kind}/{id}"))
            .json(&AttributesBody { attributes });
        let response = self
            .send(builder, &format!("{kind}/{id}"), NotFoundMeans::NotYetVisible)
            .await?
            .ok_or_else(|| StackformError::internal("update returned no response"))?;
        let body: AttributesResponse = Self::parse(response).await?;
        Ok(body.attributes)
    }

    async fn delete(&self, kind: &str, id: &str) -> Result<()> {
        let builder = self.request(Method::DELETE, &format!("/v1/resources/{kind}/{id}"));
        self.send(builder, &format!("{kind}/{id}"), NotFoundMeans::AlreadyDeleted)
            .await?;
        debug!("Deleted {kind} {id}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_is_normalized() {
        let provider = HttpProvider::new("http://localhost:8080/", "t").expect("client");
        assert_eq!(provider.endpoint(), "http://localhost:8080");
        assert_eq!(provider.name(), "http");
    }
}
