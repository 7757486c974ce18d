//! The dock owns plugin lifecycles and the single inbound fan-in queue.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::error::ChannelError;
use crate::plugin::{ChannelPlugin, ChannelRuntime};
use crate::types::{ChannelStatus, InboundMessage, OutboundMessage};

/// Queue depth for inbound fan-in before messages are dropped.
const INBOUND_QUEUE: usize = 256;

type InboundHandler = Arc<
    dyn Fn(InboundMessage) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync,
>;

/// Outcome of `start_all` — failures are captured, not thrown.
#[derive(Debug, Default)]
pub struct StartReport {
    pub started: Vec<String>,
    pub failed: Vec<(String, String)>,
}

pub struct ChannelDock {
    plugins: DashMap<String, Arc<dyn ChannelPlugin>>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    handler: std::sync::RwLock<Option<InboundHandler>>,
}

impl ChannelDock {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        Self {
            plugins: DashMap::new(),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            handler: std::sync::RwLock::new(None),
        }
    }

    /// Register a plugin. A plugin with the same id is replaced.
    pub fn register(&self, plugin: Arc<dyn ChannelPlugin>) {
        let id = plugin.id().to_string();
        info!(channel = %id, "registering channel plugin");
        self.plugins.insert(id, plugin);
    }

    /// Set the process-wide inbound handler. Messages that arrive before a
    /// handler is set are logged and dropped by the consumer loop.
    pub fn on_message<F, Fut>(&self, handler: F)
    where
        F: Fn(InboundMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let wrapped: InboundHandler = Arc::new(move |msg| Box::pin(handler(msg)));
        *self.handler.write().unwrap() = Some(wrapped);
    }

    /// Spawn the single consumer of the inbound queue. Call once at boot.
    pub async fn run_inbound_loop(self: &Arc<Self>) {
        let mut rx = self
            .inbound_rx
            .lock()
            .await
            .take()
            .expect("inbound loop started twice");
        let dock = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let handler = dock.handler.read().unwrap().clone();
                match handler {
                    Some(h) => h(msg).await,
                    None => {
                        warn!(channel = %msg.channel, "inbound message with no handler set, dropped")
                    }
                }
            }
        });
    }

    /// Start each configured plugin, capturing failures instead of aborting
    /// the rest.
    pub async fn start_all(
        &self,
        configs: &BTreeMap<String, serde_json::Value>,
    ) -> StartReport {
        let mut report = StartReport::default();
        for entry in self.plugins.iter() {
            let id = entry.key().clone();
            let Some(config) = configs.get(&id) else {
                continue;
            };
            let runtime = ChannelRuntime::new(id.clone(), self.inbound_tx.clone());
            match entry.value().start(config, runtime).await {
                Ok(()) => {
                    info!(channel = %id, "channel started");
                    report.started.push(id);
                }
                Err(e) => {
                    error!(channel = %id, error = %e, "channel failed to start");
                    report.failed.push((id, e.to_string()));
                }
            }
        }
        report
    }

    pub async fn start(&self, id: &str, config: &serde_json::Value) -> Result<(), ChannelError> {
        let plugin = self
            .plugins
            .get(id)
            .ok_or_else(|| ChannelError::Unknown(id.to_string()))?
            .clone();
        let runtime = ChannelRuntime::new(id.to_string(), self.inbound_tx.clone());
        plugin.start(config, runtime).await
    }

    pub async fn stop(&self, id: &str) -> Result<(), ChannelError> {
        let plugin = self
            .plugins
            .get(id)
            .ok_or_else(|| ChannelError::Unknown(id.to_string()))?
            .clone();
        plugin.stop().await
    }

    pub async fn stop_all(&self) {
        for entry in self.plugins.iter() {
            if let Err(e) = entry.value().stop().await {
                warn!(channel = %entry.key(), error = %e, "error stopping channel");
            }
        }
    }

    /// True iff at least one plugin reports connected.
    pub fn is_running(&self) -> bool {
        self.plugins.iter().any(|p| p.value().status().connected)
    }

    /// Status snapshot for every registered plugin, sorted by id.
    pub fn statuses(&self) -> Vec<(String, ChannelStatus)> {
        let mut out: Vec<(String, ChannelStatus)> = self
            .plugins
            .iter()
            .map(|p| (p.key().clone(), p.value().status()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn plugin(&self, id: &str) -> Option<Arc<dyn ChannelPlugin>> {
        self.plugins.get(id).map(|p| p.clone())
    }

    /// Route an outbound message to a named channel. The conversation id is
    /// passed through untouched — `"default"` is a dock-level convention a
    /// plugin may reject with `NotRouted`.
    pub async fn send(
        &self,
        channel: &str,
        channel_id: &str,
        msg: &OutboundMessage,
    ) -> Result<(), ChannelError> {
        let plugin = self
            .plugins
            .get(channel)
            .ok_or_else(|| ChannelError::Unknown(channel.to_string()))?
            .clone();
        plugin.send_message(channel_id, msg).await
    }
}

impl Default for ChannelDock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakePlugin {
        id: &'static str,
        connected: AtomicBool,
        fail_start: bool,
    }

    impl FakePlugin {
        fn new(id: &'static str, fail_start: bool) -> Arc<Self> {
            Arc::new(Self {
                id,
                connected: AtomicBool::new(false),
                fail_start,
            })
        }
    }

    #[async_trait]
    impl ChannelPlugin for FakePlugin {
        fn id(&self) -> &str {
            self.id
        }
        fn display_name(&self) -> &str {
            self.id
        }
        fn capabilities(&self) -> crate::types::ChannelCapabilities {
            Default::default()
        }
        async fn start(
            &self,
            _config: &serde_json::Value,
            _runtime: ChannelRuntime,
        ) -> Result<(), ChannelError> {
            if self.fail_start {
                return Err(ChannelError::Start {
                    channel: self.id.into(),
                    reason: "boom".into(),
                });
            }
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn stop(&self) -> Result<(), ChannelError> {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }
        fn status(&self) -> ChannelStatus {
            ChannelStatus {
                connected: self.connected.load(Ordering::SeqCst),
                connected_since: None,
                error: None,
            }
        }
        async fn send_message(
            &self,
            _channel_id: &str,
            _msg: &OutboundMessage,
        ) -> Result<(), ChannelError> {
            if !self.connected.load(Ordering::SeqCst) {
                return Err(ChannelError::NotConnected(self.id.into()));
            }
            Ok(())
        }
    }

    fn configs(ids: &[&str]) -> BTreeMap<String, serde_json::Value> {
        ids.iter()
            .map(|id| (id.to_string(), serde_json::json!({})))
            .collect()
    }

    #[tokio::test]
    async fn start_all_captures_failures() {
        let dock = ChannelDock::new();
        dock.register(FakePlugin::new("good", false));
        dock.register(FakePlugin::new("bad", true));

        let report = dock.start_all(&configs(&["good", "bad"])).await;
        assert_eq!(report.started, vec!["good".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "bad");
        assert!(dock.is_running());
    }

    #[tokio::test]
    async fn inbound_fan_in_reaches_handler() {
        let dock = Arc::new(ChannelDock::new());
        let (seen_tx, mut seen_rx) = mpsc::channel::<String>(4);
        dock.on_message(move |msg| {
            let tx = seen_tx.clone();
            async move {
                let _ = tx.send(msg.content).await;
            }
        });
        dock.run_inbound_loop().await;

        let runtime = ChannelRuntime::new("test".into(), dock.inbound_tx.clone());
        runtime.on_message(InboundMessage {
            channel: "test".into(),
            channel_id: "c1".into(),
            sender_id: "u1".into(),
            sender_name: None,
            content: "hello".into(),
            thread_id: None,
            timestamp: 0,
            metadata: Default::default(),
        });

        let got = tokio::time::timeout(std::time::Duration::from_secs(1), seen_rx.recv())
            .await
            .unwrap();
        assert_eq!(got.unwrap(), "hello");
    }

    #[tokio::test]
    async fn send_to_unknown_channel_errors() {
        let dock = ChannelDock::new();
        let err = dock
            .send("nope", "c1", &OutboundMessage::text("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Unknown(_)));
    }

    #[tokio::test]
    async fn send_before_start_is_not_connected() {
        let dock = ChannelDock::new();
        dock.register(FakePlugin::new("tg", false));
        let err = dock
            .send("tg", "c1", &OutboundMessage::text("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::NotConnected(_)));
    }
}
