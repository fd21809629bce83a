//! Card images as produced by common writer apps.

use spooltag_protocol::ndef::{self, OwnedRecord, TEXT_RECORD_TYPE};
use spooltag_protocol::{CapabilityContainer, ProtocolError};

/// NTAG-style dump: CC, lock-control TLV, NDEF TLV holding one text record.
fn ntag_dump() -> Vec<u8> {
    let mut memory = vec![0xE1, 0x10, 0x3E, 0x00];
    memory.extend_from_slice(&[0x01, 0x03, 0xA0, 0x0C, 0x34]);
    let message = ndef::encode_message(&[OwnedRecord::text("SPOOL:7\nFILAMENT:3\n", "en")]);
    memory.extend_from_slice(&ndef::ndef_tlv_header(message.len()));
    memory.extend_from_slice(&message);
    memory.push(0xFE);
    memory.resize(0x3E * 8, 0);
    memory
}

#[test]
fn test_text_record_behind_lock_control_tlv() -> anyhow::Result<()> {
    let memory = ntag_dump();
    let records = ndef::read_message(&memory)?;
    let text = ndef::find_record(&records, TEXT_RECORD_TYPE).expect("text record");
    assert_eq!(ndef::decode_text(text.payload(&memory))?, "SPOOL:7\nFILAMENT:3\n");
    Ok(())
}

#[test]
fn test_rewrite_keeps_capability_container() -> anyhow::Result<()> {
    let mut memory = ntag_dump();
    let original_len = memory.len();
    ndef::replace_ndef_message(&mut memory, &ndef::text_record_message(42, 9))?;

    assert_eq!(memory.len(), original_len);
    assert_eq!(CapabilityContainer::parse(&memory)?.size, 0x3E * 8);

    let records = ndef::read_message(&memory)?;
    assert_eq!(records.len(), 1);
    assert_eq!(ndef::decode_text(records[0].payload(&memory))?, "SPOOL:42\nFILAMENT:9\n");
    Ok(())
}

#[test]
fn test_blank_memory_is_not_ndef() {
    let memory = vec![0u8; 64];
    assert!(matches!(
        ndef::read_message(&memory),
        Err(ProtocolError::MagicMismatch { got: 0, .. })
    ));
}
