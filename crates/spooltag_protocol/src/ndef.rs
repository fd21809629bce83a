//! Card memory framing: capability container, TLV blocks and NDEF records.
//!
//! Memory layout handled here:
//! ```text
//! [CC:4][TLV]...[TLV 0x03 = NDEF message][...][0xFE terminator]
//! ```
//!
//! Decoded records keep their payload as a byte range into the memory they
//! were decoded from, so callers can mutate the payload in place.

use crate::error::{ProtocolError, Result};
use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};
use std::ops::Range;

// ============================================================================
// Capability container
// ============================================================================

pub const CC_MAGIC: u8 = 0xE1;
pub const CC_SIZE: usize = 4;

pub const TLV_NULL: u8 = 0x00;
pub const TLV_NDEF: u8 = 0x03;
pub const TLV_TERMINATOR: u8 = 0xFE;
pub const TLV_LENGTH_ESCAPE: u8 = 0xFF;

/// Type name of NDEF well-known text records.
pub const TEXT_RECORD_TYPE: &str = "urn:nfc:wkt:T";
/// Type name of NDEF well-known URI records.
pub const URI_RECORD_TYPE: &str = "urn:nfc:wkt:U";

/// 4-byte capability container at the start of NFC Forum type 5 memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityContainer {
    /// Mapping version, upper nibble of byte 1 (0x4 = 1.0)
    pub version: u8,
    /// Access conditions, lower nibble of byte 1 (read: bits 3-2, write: bits 1-0)
    pub access: u8,
    /// Data area size in bytes (stored on the card divided by 8)
    pub size: usize,
    /// Capability flags (bit 0 = MBREAD)
    pub capabilities: u8,
}

impl CapabilityContainer {
    pub fn new(size: usize) -> Self {
        Self {
            version: 0x4,
            access: 0x0,
            size,
            capabilities: 0x01,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < CC_SIZE {
            return Err(ProtocolError::CapabilityContainerTooShort {
                expected: CC_SIZE,
                got: data.len(),
            });
        }

        let mut cursor = Cursor::new(&data[..CC_SIZE]);
        let magic = cursor.read_u8()?;
        let version_access = cursor.read_u8()?;
        let size = cursor.read_u8()? as usize * 8;
        let capabilities = cursor.read_u8()?;

        if magic != CC_MAGIC {
            return Err(ProtocolError::MagicMismatch {
                expected: CC_MAGIC,
                got: magic,
            });
        }

        Ok(Self {
            version: version_access >> 4,
            access: version_access & 0x0F,
            size,
            capabilities,
        })
    }

    pub fn encode(&self) -> Result<[u8; CC_SIZE]> {
        let mut buf = [0u8; CC_SIZE];
        let mut cursor = Cursor::new(&mut buf[..]);

        cursor.write_u8(CC_MAGIC)?;
        cursor.write_u8((self.version << 4) | (self.access & 0x0F))?;
        cursor.write_u8((self.size / 8).min(u8::MAX as usize) as u8)?;
        cursor.write_u8(self.capabilities)?;

        Ok(buf)
    }

    pub fn is_writable(&self) -> bool {
        self.access & 0x03 == 0
    }
}

// ============================================================================
// TLV blocks
// ============================================================================

/// Locate the value range of the first NDEF TLV, scanning from `start`.
pub fn find_ndef_tlv(memory: &[u8], start: usize) -> Result<Range<usize>> {
    let mut pos = start;

    loop {
        let Some(&tag) = memory.get(pos) else {
            return Err(ProtocolError::NdefTlvNotFound);
        };

        match tag {
            TLV_NULL => {
                pos += 1;
                continue;
            }
            TLV_TERMINATOR => return Err(ProtocolError::NdefTlvNotFound),
            _ => {}
        }

        let Some(&short_len) = memory.get(pos + 1) else {
            return Err(ProtocolError::TlvTruncated { offset: pos });
        };

        let (header_len, value_len) = if short_len == TLV_LENGTH_ESCAPE {
            if memory.len() < pos + 4 {
                return Err(ProtocolError::TlvTruncated { offset: pos });
            }
            (4, BigEndian::read_u16(&memory[pos + 2..pos + 4]) as usize)
        } else {
            (2, short_len as usize)
        };

        let value = pos + header_len..pos + header_len + value_len;
        if value.end > memory.len() {
            return Err(ProtocolError::TlvTruncated { offset: pos });
        }

        if tag == TLV_NDEF {
            return Ok(value);
        }

        pos = value.end;
    }
}

/// NDEF TLV header for a message of `len` bytes.
pub fn ndef_tlv_header(len: usize) -> Vec<u8> {
    if len < TLV_LENGTH_ESCAPE as usize {
        vec![TLV_NDEF, len as u8]
    } else {
        let mut header = vec![TLV_NDEF, TLV_LENGTH_ESCAPE, 0, 0];
        BigEndian::write_u16(&mut header[2..], len as u16);
        header
    }
}

/// Locate the NDEF message inside raw card memory (CC followed by TLV blocks).
pub fn locate_message(memory: &[u8]) -> Result<Range<usize>> {
    CapabilityContainer::parse(memory)?;
    find_ndef_tlv(memory, CC_SIZE)
}

/// Build CC + NDEF TLV + message + terminator.
pub fn wrap_ndef_message(cc: &CapabilityContainer, message: &[u8]) -> Result<Vec<u8>> {
    let header = ndef_tlv_header(message.len());
    let size = CC_SIZE + header.len() + message.len() + 1;
    if size > cc.size {
        return Err(ProtocolError::MessageTooLarge {
            size,
            capacity: cc.size,
        });
    }

    let mut out = Vec::with_capacity(size);
    out.extend_from_slice(&cc.encode()?);
    out.extend_from_slice(&header);
    out.extend_from_slice(message);
    out.push(TLV_TERMINATOR);
    Ok(out)
}

/// Replace the NDEF message stored in `memory`, keeping its capability container.
///
/// Bytes after the new terminator are left untouched.
pub fn replace_ndef_message(memory: &mut Vec<u8>, message: &[u8]) -> Result<()> {
    let cc = CapabilityContainer::parse(memory)?;
    let wrapped = wrap_ndef_message(&cc, message)?;
    if memory.len() < wrapped.len() {
        memory.resize(wrapped.len(), 0);
    }
    memory[..wrapped.len()].copy_from_slice(&wrapped);
    Ok(())
}

// ============================================================================
// NDEF records
// ============================================================================

const FLAG_MB: u8 = 0x80;
const FLAG_ME: u8 = 0x40;
const FLAG_CF: u8 = 0x20;
const FLAG_SR: u8 = 0x10;
const FLAG_IL: u8 = 0x08;
const TNF_MASK: u8 = 0x07;

/// Type name format of an NDEF record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tnf {
    Empty = 0,
    WellKnown = 1,
    Media = 2,
    AbsoluteUri = 3,
    External = 4,
    Unknown = 5,
    Unchanged = 6,
    Reserved = 7,
}

impl Tnf {
    pub fn from_u8(value: u8) -> Self {
        match value & TNF_MASK {
            0 => Tnf::Empty,
            1 => Tnf::WellKnown,
            2 => Tnf::Media,
            3 => Tnf::AbsoluteUri,
            4 => Tnf::External,
            5 => Tnf::Unknown,
            6 => Tnf::Unchanged,
            _ => Tnf::Reserved,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Record decoded from memory; `payload` indexes into that memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NdefRecord {
    pub tnf: Tnf,
    pub record_type: Vec<u8>,
    pub id: Vec<u8>,
    pub payload: Range<usize>,
}

impl NdefRecord {
    /// Record type as a single string, e.g. `urn:nfc:wkt:T` or a MIME type.
    pub fn type_name(&self) -> String {
        type_name(self.tnf, &self.record_type)
    }

    pub fn payload<'a>(&self, memory: &'a [u8]) -> &'a [u8] {
        &memory[self.payload.clone()]
    }
}

fn type_name(tnf: Tnf, record_type: &[u8]) -> String {
    let raw = String::from_utf8_lossy(record_type);
    match tnf {
        Tnf::Empty => String::new(),
        Tnf::WellKnown => format!("urn:nfc:wkt:{}", raw),
        Tnf::External => format!("urn:nfc:ext:{}", raw),
        Tnf::Media | Tnf::AbsoluteUri => raw.into_owned(),
        Tnf::Unknown => "unknown".to_string(),
        Tnf::Unchanged => "unchanged".to_string(),
        Tnf::Reserved => "reserved".to_string(),
    }
}

/// Decode the records of the NDEF message stored at `range` inside `memory`.
pub fn decode_message(memory: &[u8], range: Range<usize>) -> Result<Vec<NdefRecord>> {
    let base = range.start;
    let end = range.end.min(memory.len());
    if base > end {
        return Err(ProtocolError::RecordTruncated { offset: base });
    }
    let mut cursor = Cursor::new(&memory[base..end]);
    let mut records = Vec::new();

    while (cursor.position() as usize) < end - base {
        let offset = base + cursor.position() as usize;
        let truncated = move |_: std::io::Error| ProtocolError::RecordTruncated { offset };

        let header = cursor.read_u8().map_err(truncated)?;
        if header & FLAG_CF != 0 {
            return Err(ProtocolError::ChunkedRecord);
        }

        let type_len = cursor.read_u8().map_err(truncated)? as usize;
        let payload_len = if header & FLAG_SR != 0 {
            cursor.read_u8().map_err(truncated)? as usize
        } else {
            cursor.read_u32::<BigEndian>().map_err(truncated)? as usize
        };
        let id_len = if header & FLAG_IL != 0 {
            cursor.read_u8().map_err(truncated)? as usize
        } else {
            0
        };

        let mut record_type = vec![0u8; type_len];
        cursor.read_exact(&mut record_type).map_err(truncated)?;
        let mut id = vec![0u8; id_len];
        cursor.read_exact(&mut id).map_err(truncated)?;

        let payload_start = base + cursor.position() as usize;
        let payload_end = payload_start + payload_len;
        if payload_end > end {
            return Err(ProtocolError::RecordTruncated { offset });
        }
        cursor.set_position((payload_end - base) as u64);

        records.push(NdefRecord {
            tnf: Tnf::from_u8(header),
            record_type,
            id,
            payload: payload_start..payload_end,
        });

        if header & FLAG_ME != 0 {
            break;
        }
    }

    Ok(records)
}

/// Locate and decode the NDEF message in raw card memory.
pub fn read_message(memory: &[u8]) -> Result<Vec<NdefRecord>> {
    let range = locate_message(memory)?;
    decode_message(memory, range)
}

/// First record whose type name equals `type_name`.
pub fn find_record<'a>(records: &'a [NdefRecord], type_name: &str) -> Option<&'a NdefRecord> {
    records.iter().find(|r| r.type_name() == type_name)
}

/// Owned record used when building a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedRecord {
    pub tnf: Tnf,
    pub record_type: Vec<u8>,
    pub id: Vec<u8>,
    pub payload: Vec<u8>,
}

impl OwnedRecord {
    pub fn text(text: &str, language: &str) -> Self {
        let lang = &language.as_bytes()[..language.len().min(0x3F)];
        let mut payload = Vec::with_capacity(1 + lang.len() + text.len());
        payload.push(lang.len() as u8);
        payload.extend_from_slice(lang);
        payload.extend_from_slice(text.as_bytes());
        Self {
            tnf: Tnf::WellKnown,
            record_type: b"T".to_vec(),
            id: Vec::new(),
            payload,
        }
    }

    pub fn uri(uri: &str) -> Self {
        let (code, rest) = URI_PREFIXES
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, prefix)| uri.starts_with(**prefix))
            .max_by_key(|(_, prefix)| prefix.len())
            .map(|(code, prefix)| (code as u8, &uri[prefix.len()..]))
            .unwrap_or((0, uri));

        let mut payload = Vec::with_capacity(1 + rest.len());
        payload.push(code);
        payload.extend_from_slice(rest.as_bytes());
        Self {
            tnf: Tnf::WellKnown,
            record_type: b"U".to_vec(),
            id: Vec::new(),
            payload,
        }
    }

    pub fn mime(mime_type: &str, payload: Vec<u8>) -> Self {
        Self {
            tnf: Tnf::Media,
            record_type: mime_type.as_bytes().to_vec(),
            id: Vec::new(),
            payload,
        }
    }

    /// Header size this record takes when encoded.
    pub fn header_len(&self) -> usize {
        let payload_len = if self.payload.len() < 256 { 1 } else { 4 };
        let id_len = if self.id.is_empty() { 0 } else { 1 };
        2 + payload_len + id_len + self.record_type.len() + self.id.len()
    }
}

/// Encode records into an NDEF message, setting MB/ME/SR/IL flags.
pub fn encode_message(records: &[OwnedRecord]) -> Vec<u8> {
    let mut out = Vec::new();
    let last = records.len().saturating_sub(1);

    for (index, record) in records.iter().enumerate() {
        let mut header = record.tnf.as_u8();
        if index == 0 {
            header |= FLAG_MB;
        }
        if index == last {
            header |= FLAG_ME;
        }
        let short = record.payload.len() < 256;
        if short {
            header |= FLAG_SR;
        }
        if !record.id.is_empty() {
            header |= FLAG_IL;
        }

        out.push(header);
        out.push(record.record_type.len() as u8);
        if short {
            out.push(record.payload.len() as u8);
        } else {
            let mut len = [0u8; 4];
            BigEndian::write_u32(&mut len, record.payload.len() as u32);
            out.extend_from_slice(&len);
        }
        if !record.id.is_empty() {
            out.push(record.id.len() as u8);
        }
        out.extend_from_slice(&record.record_type);
        out.extend_from_slice(&record.id);
        out.extend_from_slice(&record.payload);
    }

    out
}

/// Message holding the single text record that stores a spool/filament pair.
pub fn text_record_message(spool: u64, filament: u64) -> Vec<u8> {
    encode_message(&[OwnedRecord::text(
        &format!("SPOOL:{}\nFILAMENT:{}\n", spool, filament),
        "en",
    )])
}

// ============================================================================
// Well-known payloads
// ============================================================================

/// Decode the payload of a well-known text record.
pub fn decode_text(payload: &[u8]) -> Result<String> {
    let Some(&status) = payload.first() else {
        return Err(ProtocolError::InvalidText("empty payload".to_string()));
    };

    let lang_len = (status & 0x3F) as usize;
    let text = payload
        .get(1 + lang_len..)
        .ok_or_else(|| ProtocolError::InvalidText("language code runs past payload".to_string()))?;

    if status & 0x80 != 0 {
        if text.len() % 2 != 0 {
            return Err(ProtocolError::InvalidText("odd UTF-16 length".to_string()));
        }
        let units: Vec<u16> = text.chunks_exact(2).map(BigEndian::read_u16).collect();
        String::from_utf16(&units).map_err(|e| ProtocolError::InvalidText(e.to_string()))
    } else {
        String::from_utf8(text.to_vec()).map_err(|e| ProtocolError::InvalidText(e.to_string()))
    }
}

/// URI identifier codes 0x00..=0x23.
pub const URI_PREFIXES: [&str; 36] = [
    "",
    "http://www.",
    "https://www.",
    "http://",
    "https://",
    "tel:",
    "mailto:",
    "ftp://anonymous:anonymous@",
    "ftp://ftp.",
    "ftps://",
    "sftp://",
    "smb://",
    "nfs://",
    "ftp://",
    "dav://",
    "news:",
    "telnet://",
    "imap:",
    "rtsp://",
    "urn:",
    "pop:",
    "sip:",
    "sips:",
    "tftp:",
    "btspp://",
    "btl2cap://",
    "btgoep://",
    "tcpobex://",
    "irdaobex://",
    "file://",
    "urn:epc:id:",
    "urn:epc:tag:",
    "urn:epc:pat:",
    "urn:epc:raw:",
    "urn:epc:",
    "urn:nfc:",
];

/// Decode the payload of a well-known URI record.
pub fn decode_uri(payload: &[u8]) -> String {
    let Some((&code, rest)) = payload.split_first() else {
        return String::new();
    };
    let prefix = URI_PREFIXES.get(code as usize).copied().unwrap_or("");
    format!("{}{}", prefix, String::from_utf8_lossy(rest))
}
