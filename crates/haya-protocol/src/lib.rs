pub mod frames;
pub mod methods;

pub use frames::{ErrorShape, EventFrame, RequestFrame, ResponseFrame};
