pub mod dock;
pub mod error;
pub mod plugin;
pub mod session_key;
pub mod types;

pub use dock::{ChannelDock, StartReport};
pub use error::ChannelError;
pub use plugin::{ChannelPlugin, ChannelRuntime};
pub use session_key::derive_session_key;
pub use types::{
    ChannelCapabilities, ChannelStatus, InboundMessage, OutboundMessage,
};
