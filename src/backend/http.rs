//! HTTP backend
//!
//! Talks to a cart service implementing the REST contract
//! (`GET /cart`, `POST /cart/items`, `PATCH|DELETE /cart/items/{id}`,
//! `DELETE /cart`). Retries are not done here; a failed call surfaces as a
//! `BackendError` and the caller decides whether to queue it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Url};

use super::{AddItemRequest, CartBackend, CartQuery, CartResponse, SetQuantityRequest};
use crate::cart::models::ServerCart;
use crate::error::{BackendError, BackendResult};

/// Supplies the bearer credential attached to each request, if any.
///
/// How the credential is obtained or refreshed is not this crate's concern.
pub trait CredentialSource: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

/// A fixed token
pub struct StaticToken(pub String);

impl CredentialSource for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

pub struct HttpCartBackend {
    client: Client,
    base_url: Url,
    credentials: Option<Arc<dyn CredentialSource>>,
}

impl HttpCartBackend {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> BackendResult<Self> {
        let base_url = base_url.into();
        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| BackendError::InvalidUrl(format!("{base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(BackendError::InvalidUrl(base_url.to_string()));
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            credentials: None,
        })
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialSource>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Base URL extended by `segments`, each percent-encoded as one path segment
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn query(user_id: &str) -> CartQuery {
        CartQuery {
            user_id: Some(user_id.to_string()),
        }
    }

    async fn send(&self, request: RequestBuilder) -> BackendResult<ServerCart> {
        let request = match self.credentials.as_ref().and_then(|c| c.bearer_token()) {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        match serde_json::from_slice::<CartResponse>(&body) {
            Ok(envelope) => envelope.into_result(status.as_u16()),
            Err(_) if status.is_server_error() => Err(BackendError::Server {
                status: status.as_u16(),
                message: String::from_utf8_lossy(&body).into_owned(),
            }),
            Err(e) => {
                tracing::debug!(status = status.as_u16(), error = %e, "Unexpected cart response body");
                Err(BackendError::Decode(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl CartBackend for HttpCartBackend {
    async fn fetch_cart(&self, user_id: &str) -> BackendResult<ServerCart> {
        let request = self.client.get(self.url(&["cart"])).query(&Self::query(user_id));
        self.send(request).await
    }

    async fn add_item(&self, user_id: &str, product_id: &str, quantity: u32) -> BackendResult<ServerCart> {
        let request = self
            .client
            .post(self.url(&["cart", "items"]))
            .query(&Self::query(user_id))
            .json(&AddItemRequest {
                product_id: product_id.to_string(),
                quantity,
            });
        self.send(request).await
    }

    async fn set_quantity(&self, user_id: &str, item_id: &str, quantity: u32) -> BackendResult<ServerCart> {
        let request = self
            .client
            .patch(self.url(&["cart", "items", item_id]))
            .query(&Self::query(user_id))
            .json(&SetQuantityRequest { quantity });
        self.send(request).await
    }

    async fn remove_item(&self, user_id: &str, item_id: &str) -> BackendResult<ServerCart> {
        let request = self
            .client
            .delete(self.url(&["cart", "items", item_id]))
            .query(&Self::query(user_id));
        self.send(request).await
    }

    async fn clear_cart(&self, user_id: &str) -> BackendResult<ServerCart> {
        let request = self.client.delete(self.url(&["cart"])).query(&Self::query(user_id));
        self.send(request).await
    }
}
