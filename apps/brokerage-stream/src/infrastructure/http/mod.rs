//! REST Subscription Transport
//!
//! [`SubscriptionTransport`] over the brokerage REST API.
//!
//! | Operation        | Request                                                   |
//! |------------------|-----------------------------------------------------------|
//! | subscribe        | `POST {rest}/{service}/subscriptions`                     |
//! | unsubscribe      | `DELETE {rest}/{service}/subscriptions/{context}/{ref}`   |
//! | unsubscribe all  | `DELETE {rest}/{service}/subscriptions/{context}` each    |
//! | reauthorize      | `PUT {reauthorize}?contextid={context}`                   |
//!
//! Every request carries `Authorization: Bearer {token}` with the latest
//! token from the credential channel.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use url::Url;

use crate::application::ports::{
    BearerToken, SubscribeRequest, SubscribeResponse, SubscriptionTransport, TransportError,
};
use crate::domain::subscription::{ReferenceId, SubscriptionKind};

/// REST service path for a subscription kind.
#[must_use]
pub const fn service_path(kind: SubscriptionKind) -> &'static str {
    match kind {
        SubscriptionKind::Balance => "port/v1/balances",
        SubscriptionKind::Orders => "port/v1/orders",
        SubscriptionKind::Positions => "port/v1/positions",
        SubscriptionKind::ClosedPositions => "port/v1/closedpositions",
        SubscriptionKind::Price => "trade/v1/infoprices",
    }
}

/// Default reauthorize endpoint: the streaming URL over HTTP(S) with
/// `/authorize` appended.
#[must_use]
pub fn default_reauthorize_url(streaming_url: &Url) -> Url {
    let mut url = streaming_url.clone();
    let scheme = if url.scheme() == "ws" { "http" } else { "https" };
    // ws/wss -> http/https is always allowed between special schemes
    let _ = url.set_scheme(scheme);
    let path = format!("{}/authorize", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.set_query(None);
    url
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct SubscribeBody<'a> {
    context_id: &'a str,
    reference_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    replace_reference_id: Option<&'a str>,
    arguments: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SubscribeReply {
    reference_id: String,
    #[serde(default)]
    inactivity_timeout: u64,
    snapshot: Value,
}

// =============================================================================
// Transport
// =============================================================================

/// Transport settings.
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// REST base URL, e.g. `https://gateway.example.com/openapi`.
    pub rest_url: Url,
    /// Reauthorize endpoint.
    pub reauthorize_url: Url,
    /// Per-request timeout.
    pub timeout: Duration,
}

/// REST implementation of [`SubscriptionTransport`].
#[derive(Debug, Clone)]
pub struct HttpSubscriptionTransport {
    client: Client,
    rest_url: String,
    reauthorize_url: Url,
    credentials: watch::Receiver<Option<BearerToken>>,
}

impl HttpSubscriptionTransport {
    /// Create a transport that authenticates with the latest token in
    /// `credentials`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        config: &HttpTransportConfig,
        credentials: watch::Receiver<Option<BearerToken>>,
    ) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;

        Ok(Self {
            client,
            rest_url: config.rest_url.as_str().trim_end_matches('/').to_string(),
            reauthorize_url: config.reauthorize_url.clone(),
            credentials,
        })
    }

    fn endpoint(&self, kind: SubscriptionKind, rest: &str) -> String {
        format!("{}/{}/subscriptions{rest}", self.rest_url, service_path(kind))
    }

    fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder, TransportError> {
        let token = self.credentials.borrow().clone();
        let token = token.ok_or(TransportError::Unauthenticated)?;
        Ok(request.bearer_auth(token.expose()))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, TransportError> {
        let response = self
            .authorized(request)?
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(TransportError::Status {
            status: status.as_u16(),
            message: if message.is_empty() {
                status.canonical_reason().unwrap_or_default().to_string()
            } else {
                message
            },
        })
    }
}

#[async_trait]
impl SubscriptionTransport for HttpSubscriptionTransport {
    async fn subscribe(
        &self,
        request: SubscribeRequest,
    ) -> Result<SubscribeResponse, TransportError> {
        let kind = request.scope.kind();
        let body = SubscribeBody {
            context_id: &request.context_id,
            reference_id: request.reference_id.as_str(),
            replace_reference_id: request.replace_reference_id.as_ref().map(ReferenceId::as_str),
            arguments: request.scope.arguments(),
        };
        let url = self.endpoint(kind, "");
        tracing::debug!(%url, reference_id = %request.reference_id, "subscribing");

        let response = self.send(self.client.post(&url).json(&body)).await?;
        let reply: SubscribeReply = response
            .json()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))?;

        Ok(SubscribeResponse {
            reference_id: ReferenceId::new(reply.reference_id),
            inactivity_timeout: Duration::from_secs(reply.inactivity_timeout),
            snapshot: reply.snapshot,
        })
    }

    async fn unsubscribe(
        &self,
        context_id: &str,
        reference_id: &ReferenceId,
    ) -> Result<(), TransportError> {
        let kind = reference_id
            .kind()
            .ok_or_else(|| TransportError::UnroutableReference(reference_id.to_string()))?;
        let url = self.endpoint(kind, &format!("/{context_id}/{reference_id}"));
        self.send(self.client.delete(&url)).await?;
        Ok(())
    }

    async fn unsubscribe_all(&self, context_id: &str) -> Result<(), TransportError> {
        let mut first_error = None;
        for kind in SubscriptionKind::ALL {
            let url = self.endpoint(kind, &format!("/{context_id}"));
            if let Err(e) = self.send(self.client.delete(&url)).await {
                tracing::debug!(%url, error = %e, "unsubscribe-all request failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn reauthorize(
        &self,
        context_id: &str,
        token: &BearerToken,
    ) -> Result<(), TransportError> {
        let response = self
            .client
            .put(self.reauthorize_url.clone())
            .query(&[("contextid", context_id)])
            .bearer_auth(token.expose())
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(TransportError::Status {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            })
        }
    }
}
