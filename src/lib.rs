pub mod app;
pub mod batch;
pub mod config;
pub mod error;
pub mod history;
pub mod messages;
pub mod process;
pub mod source;
pub mod ulf;

pub use config::ProcessorConfig;
pub use error::ReplayError;
pub use ulf::{replay_source, ReplayReport, UlfInterpreter};
