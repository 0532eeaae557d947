use clap::ValueEnum;

use crate::device::constants::{ASSIGNMENT_MAX_CHARS, ASSIGNMENT_RESPONSE_PREFIX, ASSIGNMENT_TERMINATOR, LETTER_SLOTS, PHRASE_SLOTS, TELEMETRY_PREFIX};
use crate::device::telemetry::parse_sensor_line;
use crate::device::types::{Inbound, Notice};
use crate::error::LinkError;

/// Which gesture bank an assignment targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AssignmentMode {
    /// First mode: phrase gestures.
    Phrase,
    /// Second mode: letter gestures.
    Letter,
}

impl AssignmentMode {
    fn prefix(&self) -> &'static str {
        match self {
            AssignmentMode::Phrase => "M1",
            AssignmentMode::Letter => "M2",
        }
    }

    pub fn slots(&self) -> u8 {
        match self {
            AssignmentMode::Phrase => PHRASE_SLOTS,
            AssignmentMode::Letter => LETTER_SLOTS,
        }
    }
}

/// Binds a text to one gesture slot on the glove.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    mode: AssignmentMode,
    slot: u8,
    text: String,
}

impl Assignment {
    pub fn new(mode: AssignmentMode, slot: u8, text: impl Into<String>) -> Result<Self, LinkError> {
        let text = text.into();

        if slot == 0 || slot > mode.slots() {
            return Err(LinkError::InvalidAssignment(format!("slot must be between 1 and {}", mode.slots())));
        }
        if text.is_empty() {
            return Err(LinkError::InvalidAssignment("no value to assign".to_string()));
        }
        if text.chars().count() > ASSIGNMENT_MAX_CHARS {
            return Err(LinkError::InvalidAssignment(format!("text is longer than {} characters", ASSIGNMENT_MAX_CHARS)));
        }
        if text.contains(ASSIGNMENT_TERMINATOR) {
            return Err(LinkError::InvalidAssignment(format!("text may not contain '{}'", ASSIGNMENT_TERMINATOR)));
        }

        Ok(Assignment { mode, slot, text })
    }

    /// `M1-03: Hello~`
    pub fn encode(&self) -> String {
        format!("{}-{:02}: {}{}", self.mode.prefix(), self.slot, self.text, ASSIGNMENT_TERMINATOR)
    }
}

/// Recognises the glove's reply to an assignment, e.g. `Assignment:Successful`.
pub fn parse_assignment_response(text: &str) -> Option<Notice> {
    let status = text.strip_prefix(ASSIGNMENT_RESPONSE_PREFIX)?.trim();

    Some(Notice::Assignment {
        successful: status == "Successful",
        status: status.to_string(),
    })
}

/// Splits notification payloads into telemetry and free text (classifier output from the glove).
pub fn route_notification(value: &[u8]) -> Option<Inbound> {
    let text = String::from_utf8_lossy(value);

    if text.trim().starts_with(TELEMETRY_PREFIX) {
        parse_sensor_line(&text).map(Inbound::Telemetry)
    } else {
        Some(Inbound::Text(text.into_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_both_modes_with_two_digit_slot() {
        let phrase = Assignment::new(AssignmentMode::Phrase, 3, "Good morning").unwrap();
        assert_eq!(phrase.encode(), "M1-03: Good morning~");

        let letter = Assignment::new(AssignmentMode::Letter, 12, "Q").unwrap();
        assert_eq!(letter.encode(), "M2-12: Q~");
    }

    #[test]
    fn rejects_out_of_range_slots_and_bad_text() {
        assert!(Assignment::new(AssignmentMode::Phrase, 0, "a").is_err());
        assert!(Assignment::new(AssignmentMode::Phrase, 6, "a").is_err());
        assert!(Assignment::new(AssignmentMode::Letter, 15, "a").is_ok());
        assert!(Assignment::new(AssignmentMode::Letter, 16, "a").is_err());
        assert!(Assignment::new(AssignmentMode::Letter, 1, "").is_err());
        assert!(Assignment::new(AssignmentMode::Letter, 1, "a~b").is_err());
        assert!(Assignment::new(AssignmentMode::Letter, 1, "x".repeat(71)).is_err());
        assert!(Assignment::new(AssignmentMode::Letter, 1, "x".repeat(70)).is_ok());
    }

    #[test]
    fn recognises_assignment_responses() {
        assert_eq!(
            parse_assignment_response("Assignment:Successful"),
            Some(Notice::Assignment { successful: true, status: "Successful".to_string() })
        );
        assert_eq!(
            parse_assignment_response("Assignment: Full\n"),
            Some(Notice::Assignment { successful: false, status: "Full".to_string() })
        );
        assert_eq!(parse_assignment_response("Hello"), None);
    }

    #[test]
    fn routes_telemetry_by_prefix() {
        match route_notification(b" F1:10 F2:20 X:1\n") {
            Some(Inbound::Telemetry(values)) => assert_eq!(values.flex.len(), 2),
            other => panic!("expected telemetry, got {:?}", other),
        }

        assert_eq!(route_notification(b"Thank you"), Some(Inbound::Text("Thank you".to_string())));
        // gyro-only lines are not telemetry without the flex prefix
        assert_eq!(route_notification(b"X:1 Y:2"), Some(Inbound::Text("X:1 Y:2".to_string())));
        // telemetry prefix without readable values is dropped
        assert_eq!(route_notification(b"F1:??"), None);
    }
}
