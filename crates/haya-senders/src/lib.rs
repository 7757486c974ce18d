pub mod error;
pub mod store;
pub mod types;

pub use error::{Result, SenderError};
pub use store::SenderStore;
pub use types::{ApprovedSender, PairingCode, SenderDecision};
