//! `SPOOL:<id>` / `FILAMENT:<id>` lines in NDEF text records.

use crate::chain::TagParser;
use spooltag_protocol::ndef::{self, TEXT_RECORD_TYPE};
use spooltag_protocol::{ReadEvent, TagIds};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default)]
pub struct NdefTextParser;

impl NdefTextParser {
    pub fn new() -> Self {
        Self
    }
}

/// Apply `SPOOL:`/`FILAMENT:` lines of one text onto `ids`.
fn scan_text(text: &str, ids: &mut TagIds) {
    for line in text.lines() {
        let parts: Vec<&str> = line.split(':').collect();
        let [key, value] = parts.as_slice() else {
            continue;
        };
        match key.trim() {
            "SPOOL" => ids.spool = Some(value.trim().to_string()),
            "FILAMENT" => ids.filament = Some(value.trim().to_string()),
            _ => {}
        }
    }
}

impl TagParser for NdefTextParser {
    fn name(&self) -> &'static str {
        "ndef_text"
    }

    fn parse(&self, event: &ReadEvent) -> TagIds {
        let mut ids = TagIds::empty();
        let Some(memory) = event.memory() else {
            return ids;
        };
        let records = match ndef::read_message(memory) {
            Ok(records) => records,
            Err(e) => {
                debug!(error = %e, "no NDEF message");
                return ids;
            }
        };

        for record in records.iter().filter(|r| r.type_name() == TEXT_RECORD_TYPE) {
            match ndef::decode_text(record.payload(memory)) {
                Ok(text) => scan_text(&text, &mut ids),
                Err(e) => debug!(error = %e, "skipping undecodable text record"),
            }
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spooltag_protocol::ndef::{encode_message, wrap_ndef_message, CapabilityContainer, OwnedRecord};

    fn card(records: &[OwnedRecord]) -> ReadEvent {
        let image = wrap_ndef_message(&CapabilityContainer::new(128), &encode_message(records)).unwrap();
        ReadEvent::new(Some(image), &[0x04, 0x0a, 0xff])
    }

    #[test]
    fn test_reads_written_pair() {
        let image = wrap_ndef_message(&CapabilityContainer::new(64), &ndef::text_record_message(23, 7)).unwrap();
        let ids = NdefTextParser.parse(&ReadEvent::new(Some(image), &[1, 2]));
        assert_eq!(ids, TagIds::new("23", "7"));
    }

    #[test]
    fn test_last_value_wins_across_records() {
        let ids = NdefTextParser.parse(&card(&[
            OwnedRecord::text("SPOOL:1\nFILAMENT:2\n", "en"),
            OwnedRecord::uri("https://example.com"),
            OwnedRecord::text("SPOOL:5\nNOTE:a:b\n", "en"),
        ]));
        assert_eq!(ids, TagIds::new("5", "2"));
    }

    #[test]
    fn test_partial_and_empty() {
        let ids = NdefTextParser.parse(&card(&[OwnedRecord::text("SPOOL:9", "en")]));
        assert_eq!(ids.spool.as_deref(), Some("9"));
        assert!(!ids.is_complete());

        assert!(NdefTextParser.parse(&ReadEvent::new(None, &[1])).is_empty());
        assert!(NdefTextParser.parse(&ReadEvent::new(Some(vec![0; 16]), &[1])).is_empty());
    }
}
