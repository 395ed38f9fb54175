//! HTTP client for a multicast push gateway.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    DeliveryOutcome, DispatchError, DispatchReport, NotificationDispatcher, PushMessage,
    TokenDelivery,
};

#[derive(Serialize)]
struct GatewayNotification<'a> {
    title: &'a str,
    body: &'a str,
}

#[derive(Serialize)]
struct GatewayData<'a> {
    action: &'a str,
}

#[derive(Serialize)]
struct GatewayRequest<'a> {
    tokens: &'a [String],
    notification: GatewayNotification<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<GatewayData<'a>>,
}

#[derive(Deserialize)]
struct GatewayTokenResult {
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct GatewayResponse {
    responses: Vec<GatewayTokenResult>,
}

/// Posts each batch as one JSON request; the gateway answers with one result per token,
/// in request order.
pub struct HttpPushDispatcher {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpPushDispatcher {
    pub fn new(url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create push gateway HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
            api_key,
        })
    }
}

fn parse_response(tokens: &[String], body: &str) -> Result<DispatchReport, DispatchError> {
    let response: GatewayResponse =
        serde_json::from_str(body).map_err(|e| DispatchError::InvalidResponse(e.to_string()))?;
    if response.responses.len() != tokens.len() {
        return Err(DispatchError::InvalidResponse(format!(
            "expected {} results, got {}",
            tokens.len(),
            response.responses.len()
        )));
    }
    let results = tokens
        .iter()
        .zip(response.responses)
        .map(|(token, result)| TokenDelivery {
            token: token.clone(),
            outcome: if result.success {
                DeliveryOutcome::Delivered
            } else {
                DeliveryOutcome::Failed(result.error.unwrap_or_else(|| "unknown error".into()))
            },
        })
        .collect();
    Ok(DispatchReport { results })
}

#[async_trait]
impl NotificationDispatcher for HttpPushDispatcher {
    async fn send_to_tokens(
        &self,
        tokens: &[String],
        message: &PushMessage,
    ) -> Result<DispatchReport, DispatchError> {
        if tokens.is_empty() {
            return Ok(DispatchReport::default());
        }

        let request = GatewayRequest {
            tokens,
            notification: GatewayNotification {
                title: &message.title,
                body: &message.body,
            },
            data: message
                .action_tag
                .as_deref()
                .map(|action| GatewayData { action }),
        };

        let mut builder = self.client.post(&self.url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| DispatchError::Transport(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| DispatchError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(DispatchError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        debug!("Push gateway accepted batch of {} tokens", tokens.len());
        parse_response(tokens, &body)
    }
}
