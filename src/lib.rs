pub mod archive;
pub mod batch;
pub mod cmd;
pub mod config;
mod error;
pub mod extract;
pub mod logging;
pub mod pipeline;
pub mod session;
pub mod timecode;
pub mod tools;
pub mod trim;

pub use error::{EngineError, ErrorKind, Result};
