pub mod archive;
pub mod chunk;
pub mod config;
pub mod delta;
pub mod error;
pub mod fingerprint;
pub mod manifest;
pub mod path_safety;
pub mod persist;
pub mod stage;
pub mod tool_lock;

pub use error::{Result, StageError};
