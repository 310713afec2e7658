//! Reply classification by substring match.
//!
//! "Not Interested" contains "Interested", so it is checked first.

use crate::pipeline::types::ClassLabel;

/// Classify a generated reply into one of the fixed labels.
pub fn classify(reply_text: &str) -> ClassLabel {
    if reply_text.contains(ClassLabel::NotInterested.name()) {
        ClassLabel::NotInterested
    } else if reply_text.contains(ClassLabel::Interested.name()) {
        ClassLabel::Interested
    } else {
        ClassLabel::MoreInformation
    }
}
