//! Notification processing pipeline.
//!
//! Every job flows through:
//! 1. `JobProcessor::process()`: mailbox and cursor resolution
//! 2. `MailProvider`: candidate enumeration and eligibility checks
//! 3. `ReplyGenerator`: reply text from `prompt::build_reply_prompt`
//! 4. `classify()` + `LabelResolver`: label the replied message
//! 5. `CursorStore::advance_cursor()`: commit
//!
//! The processor never acks or retries; it returns a `JobOutcome` or a
//! `PipelineError` and the worker settles the delivery.

pub mod classify;
pub mod labels;
pub mod processor;
pub mod prompt;
pub mod state;
pub mod types;

#[cfg(test)]
pub(crate) mod fake;

pub use classify::classify;
pub use labels::LabelResolver;
pub use processor::{Attempt, JobProcessor, ProcessorConfig};
pub use state::JobStage;
