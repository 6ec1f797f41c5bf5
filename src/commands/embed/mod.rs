//! Background embedding job: fills placeholder vectors in the messages table
//! and keeps its full-text and vector indexes current.

mod orchestrator;
mod payload;
mod run;
mod types;

pub(crate) use run::local_inference_config;
pub use run::run;
