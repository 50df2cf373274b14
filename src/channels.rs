//! Channel drivers and normalized ingress.
//!
//! The core never speaks platform wire formats. Outbound, a
//! [`ChannelDriver`] pushes outbox envelopes to a per-channel adapter
//! endpoint; inbound, adapters post normalized [`IngressEnvelope`]s to the
//! webhook routes with a shared-secret header.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ChannelConfig;
use crate::outbox::OutboxEnvelope;

/// Channels the control plane exposes webhook routes for.
pub const KNOWN_CHANNELS: [&str; 5] = ["slack", "discord", "telegram", "neovim", "vscode"];

/// HTTP connect timeout for the webhook driver client.
const CONNECT_TIMEOUT_SECS: u64 = 5;

/// Successful delivery acknowledgement from an adapter.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeliveryReceipt {
    /// Adapter-assigned delivery id, when one is returned.
    #[serde(default)]
    pub delivery_id: Option<String>,
}

/// Categorized delivery failure.
#[derive(Debug, thiserror::Error)]
#[error("{reason}")]
pub struct DeliveryFailure {
    /// Failure description.
    pub reason: String,
    /// Whether the outbox may retry with backoff.
    pub transient: bool,
}

impl DeliveryFailure {
    /// A retriable failure.
    pub fn transient(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            transient: true,
        }
    }

    /// A terminal failure.
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            transient: false,
        }
    }
}

/// Delivers outbox envelopes for one channel.
#[async_trait]
pub trait ChannelDriver: Send + Sync {
    /// Channel this driver serves.
    fn channel(&self) -> &str;

    /// Deliver one envelope.
    async fn deliver(&self, envelope: &OutboxEnvelope) -> Result<DeliveryReceipt, DeliveryFailure>;
}

/// Driver that POSTs envelopes to the channel adapter's delivery URL with
/// the shared-secret header.
pub struct WebhookDriver {
    channel: String,
    url: String,
    secret_header: String,
    secret: String,
    client: reqwest::Client,
}

impl WebhookDriver {
    /// Build a driver from channel config. Returns `None` when the channel
    /// has no delivery URL.
    pub fn from_config(channel: &str, config: &ChannelConfig) -> Option<Self> {
        let url = config.delivery_url.clone()?;
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .ok()?;
        Some(Self {
            channel: channel.to_owned(),
            url,
            secret_header: config.secret_header.clone(),
            secret: config.secret.clone(),
            client,
        })
    }
}

#[async_trait]
impl ChannelDriver for WebhookDriver {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn deliver(&self, envelope: &OutboxEnvelope) -> Result<DeliveryReceipt, DeliveryFailure> {
        debug!(channel = %self.channel, outbox_id = %envelope.outbox_id, "delivering envelope");
        let response = self
            .client
            .post(&self.url)
            .header(self.secret_header.as_str(), self.secret.as_str())
            .json(envelope)
            .send()
            .await
            .map_err(|e| DeliveryFailure::transient(format!("request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            let receipt = response.json::<DeliveryReceipt>().await.unwrap_or_default();
            return Ok(receipt);
        }
        let reason = format!("adapter returned {status}");
        if status.as_u16() == 429 || status.is_server_error() {
            Err(DeliveryFailure::transient(reason))
        } else {
            Err(DeliveryFailure::permanent(reason))
        }
    }
}

/// Normalized inbound command posted by a channel adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressEnvelope {
    /// Channel tenant (workspace, guild, …).
    pub channel_tenant_id: String,
    /// Conversation inside the tenant.
    pub channel_conversation_id: String,
    /// Actor that issued the command.
    pub channel_actor_id: String,
    /// Command text.
    pub text: String,
    /// Adapter-assigned idempotency key, reused on redelivery.
    #[serde(default)]
    pub request_id: Option<String>,
    /// Free-form adapter metadata.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Verification advertised for a channel route.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelVerification {
    /// Verification kind; always `shared_secret` for webhook adapters.
    pub kind: String,
    /// Header that carries the secret.
    pub secret_header: String,
}

/// Per-channel capability row for `GET /api/control-plane/channels`.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelCapability {
    /// Channel name.
    pub channel: String,
    /// Webhook ingress route.
    pub route: String,
    /// Whether config declares the channel.
    pub configured: bool,
    /// Whether the channel participates in ingress and fan-out.
    pub active: bool,
    /// Frontend family for the channel (`chat` or `editor`).
    pub frontend: String,
    /// Ingress verification description, present when configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<ChannelVerification>,
}

/// Build the capability listing from channel config.
pub fn channel_capabilities(
    channels: &std::collections::BTreeMap<String, ChannelConfig>,
) -> Vec<ChannelCapability> {
    KNOWN_CHANNELS
        .iter()
        .map(|name| {
            let config = channels.get(*name);
            ChannelCapability {
                channel: (*name).to_owned(),
                route: format!("/webhooks/{name}"),
                configured: config.is_some(),
                active: config.map(|c| c.active).unwrap_or(false),
                frontend: if matches!(*name, "neovim" | "vscode") {
                    "editor".to_owned()
                } else {
                    "chat".to_owned()
                },
                verification: config.map(|c| ChannelVerification {
                    kind: "shared_secret".to_owned(),
                    secret_header: c.secret_header.clone(),
                }),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn capabilities_cover_known_channels() {
        let mut channels = BTreeMap::new();
        channels.insert(
            "slack".to_owned(),
            ChannelConfig {
                secret: "s".to_owned(),
                secret_header: "x-mu-adapter-secret".to_owned(),
                delivery_url: None,
                active: true,
            },
        );
        let caps = channel_capabilities(&channels);
        assert_eq!(caps.len(), KNOWN_CHANNELS.len());
        let slack = caps.iter().find(|c| c.channel == "slack").expect("slack");
        assert!(slack.configured && slack.active);
        assert_eq!(slack.route, "/webhooks/slack");
        let discord = caps.iter().find(|c| c.channel == "discord").expect("discord");
        assert!(!discord.configured && !discord.active);
        let vscode = caps.iter().find(|c| c.channel == "vscode").expect("vscode");
        assert_eq!(vscode.frontend, "editor");
    }
}
