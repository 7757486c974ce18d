use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::ChannelError;
use crate::types::{ChannelCapabilities, ChannelStatus, InboundMessage, OutboundMessage};

/// Common interface implemented by every channel adapter (Slack, Discord,
/// Telegram, Matrix, Teams, WhatsApp, webhook, web-chat).
///
/// Implementations must be `Send + Sync` so they can be stored in a
/// [`ChannelDock`](crate::dock::ChannelDock) and driven from multiple Tokio
/// tasks; connection state lives behind the plugin's own interior locks.
#[async_trait]
pub trait ChannelPlugin: Send + Sync {
    /// Stable lowercase identifier, unique across registered plugins.
    fn id(&self) -> &str;

    fn display_name(&self) -> &str;

    fn capabilities(&self) -> ChannelCapabilities;

    /// Establish the connection. Must be fully connected before returning
    /// Ok; failure must return Err, never resolve half-started.
    async fn start(
        &self,
        config: &serde_json::Value,
        runtime: ChannelRuntime,
    ) -> Result<(), ChannelError>;

    /// Gracefully disconnect. Idempotent; must release ports and sockets.
    async fn stop(&self) -> Result<(), ChannelError>;

    /// Current status without blocking.
    fn status(&self) -> ChannelStatus;

    /// Deliver one outbound message to a platform conversation id.
    /// Errors when not connected.
    async fn send_message(
        &self,
        channel_id: &str,
        msg: &OutboundMessage,
    ) -> Result<(), ChannelError>;
}

/// Back-channel the dock hands each plugin at start.
///
/// The plugin owns only this sink; the dock owns the consumer on the other
/// end, so no reference cycle exists between plugin and dock.
#[derive(Clone)]
pub struct ChannelRuntime {
    channel: String,
    inbound: mpsc::Sender<InboundMessage>,
}

impl ChannelRuntime {
    pub(crate) fn new(channel: String, inbound: mpsc::Sender<InboundMessage>) -> Self {
        Self { channel, inbound }
    }

    /// Hand an inbound message to the dock. Never blocks the plugin's I/O
    /// loop: a full queue drops the message with a warning.
    pub fn on_message(&self, msg: InboundMessage) {
        if self.inbound.try_send(msg).is_err() {
            warn!(channel = %self.channel, "inbound queue full or closed, message dropped");
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}
