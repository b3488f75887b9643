pub mod backend;
pub mod cache;
pub mod classify;
pub mod config;
pub mod error;
pub mod gateway;
pub mod model;
pub mod orchestrator;
pub mod prompt;
pub mod ratelimit;
pub mod stats;
pub mod validate;

pub use config::Config;
pub use error::{ChatError, ChatFailure};
pub use orchestrator::{Backend, ChatService};
