//! Autoreply: mail notification intake and auto-reply pipeline.

pub mod config;
pub mod error;
pub mod intake;
pub mod llm;
pub mod pipeline;
pub mod providers;
pub mod store;
pub mod worker;
