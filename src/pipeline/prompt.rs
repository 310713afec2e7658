//! Prompt construction for reply generation.

use crate::pipeline::types::MessageEnvelope;

/// Build the reply prompt from the fetched message.
pub fn build_reply_prompt(message: &MessageEnvelope) -> String {
    let to = if message.to.is_empty() {
        "me".to_string()
    } else {
        message.to.join(", ")
    };
    let subject = if message.subject.trim().is_empty() {
        "(no subject)"
    } else {
        message.subject.trim()
    };

    format!(
        "Generate a professional response. Your response will be sent without any changes. \
         You are an assistant replying to an email from {from} to {to} with the subject \
         \"{subject}\". The email reads:\n\n{body}",
        from = message.from,
        body = message.body.trim(),
    )
}
