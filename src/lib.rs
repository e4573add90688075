pub mod backend;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod key;
pub mod log;
pub mod queue;
pub mod resume;
pub mod sink;
pub mod status;
pub mod types;
