//! CBOR helpers for region maps.
//!
//! Decoding goes through `ciborium`; map entries are decoded one item at a
//! time so the raw byte span of every key and value is known. Encoding is
//! done here to control container framing, key order and float width.

use crate::error::{RecordError, Result};
use byteorder::{BigEndian, ReadBytesExt};
use ciborium::value::Value;
use half::f16;
use std::io::Cursor;
use std::ops::Range;

pub const MAJOR_UNSIGNED: u8 = 0;
pub const MAJOR_NEGATIVE: u8 = 1;
pub const MAJOR_BYTES: u8 = 2;
pub const MAJOR_TEXT: u8 = 3;
pub const MAJOR_ARRAY: u8 = 4;
pub const MAJOR_MAP: u8 = 5;

const MINOR_INDEFINITE: u8 = 31;
const SIMPLE_FALSE: u8 = 0xf4;
const SIMPLE_TRUE: u8 = 0xf5;
const SIMPLE_NULL: u8 = 0xf6;
const FLOAT16: u8 = 0xf9;
const FLOAT32: u8 = 0xfa;
const FLOAT64: u8 = 0xfb;
pub const CBOR_BREAK: u8 = 0xff;

/// Decimal places kept for decimal fields.
pub const DECIMAL_PRECISION: i32 = 3;
/// Largest reconstruction error accepted when narrowing a float.
pub const REQUIRED_PRECISION: f64 = 1e-3;

/// How a region map is serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeConfig {
    /// Order map entries by encoded key (length first, then bytes)
    pub canonical: bool,
    /// Frame maps and arrays with a break code instead of a length
    pub indefinite_containers: bool,
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            canonical: true,
            indefinite_containers: true,
        }
    }
}

/// The subset of CBOR data items used by field values.
#[derive(Debug, Clone, PartialEq)]
pub enum CborValue {
    Unsigned(u64),
    /// Stores `n` for the value `-1 - n`
    Negative(u64),
    Bytes(Vec<u8>),
    Text(String),
    Array(Vec<CborValue>),
    Map(Vec<(CborValue, CborValue)>),
    Bool(bool),
    Null,
    Float(f64),
}

impl CborValue {
    pub fn integer(value: i64) -> Self {
        if value >= 0 {
            CborValue::Unsigned(value as u64)
        } else {
            CborValue::Negative(!(value as u64))
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            CborValue::Unsigned(n) => i64::try_from(*n).ok(),
            CborValue::Negative(n) => i64::try_from(*n).ok().map(|n| -1 - n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CborValue::Float(f) => Some(*f),
            CborValue::Unsigned(n) => Some(*n as f64),
            CborValue::Negative(n) => Some(-1.0 - *n as f64),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CborValue::Unsigned(_) | CborValue::Negative(_) => "integer",
            CborValue::Bytes(_) => "bytes",
            CborValue::Text(_) => "text",
            CborValue::Array(_) => "array",
            CborValue::Map(_) => "map",
            CborValue::Bool(_) => "bool",
            CborValue::Null => "null",
            CborValue::Float(_) => "float",
        }
    }

    fn from_ciborium(value: Value) -> Result<Self> {
        Ok(match value {
            Value::Integer(int) => {
                let int = i128::from(int);
                if int >= 0 {
                    CborValue::Unsigned(int as u64)
                } else {
                    CborValue::Negative((-1 - int) as u64)
                }
            }
            Value::Bytes(bytes) => CborValue::Bytes(bytes),
            Value::Text(text) => CborValue::Text(text),
            Value::Float(f) => CborValue::Float(f),
            Value::Bool(b) => CborValue::Bool(b),
            Value::Null => CborValue::Null,
            Value::Tag(_, inner) => CborValue::from_ciborium(*inner)?,
            Value::Array(items) => CborValue::Array(
                items
                    .into_iter()
                    .map(CborValue::from_ciborium)
                    .collect::<Result<_>>()?,
            ),
            Value::Map(entries) => CborValue::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| Ok((CborValue::from_ciborium(k)?, CborValue::from_ciborium(v)?)))
                    .collect::<Result<_>>()?,
            ),
            other => {
                return Err(RecordError::CborDecode {
                    offset: 0,
                    message: format!("unsupported data item {:?}", other),
                })
            }
        })
    }
}

impl std::fmt::Display for CborValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CborValue::Unsigned(n) => write!(f, "{}", n),
            CborValue::Negative(n) => write!(f, "-{}", *n as u128 + 1),
            CborValue::Text(s) => write!(f, "{}", s),
            CborValue::Float(v) => write!(f, "{}", v),
            CborValue::Bool(b) => write!(f, "{}", b),
            CborValue::Null => write!(f, "null"),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Integer when exact, else the narrowest float within [`REQUIRED_PRECISION`].
///
/// A general-purpose encoder would emit 8-byte doubles for values like 0.3;
/// card space is too scarce for that.
pub fn compact_float(num: f64) -> CborValue {
    if num.is_finite() && num.fract() == 0.0 && num.abs() < 9.2e18 {
        return CborValue::integer(num as i64);
    }

    let half = f16::from_f64(num).to_f64();
    if (num - half).abs() < REQUIRED_PRECISION {
        return CborValue::Float(half);
    }

    let single = num as f32 as f64;
    if (num - single).abs() < REQUIRED_PRECISION {
        return CborValue::Float(single);
    }

    CborValue::Float(num)
}

/// Round to [`DECIMAL_PRECISION`] places, collapsing to an integer when exact.
pub fn canonical_decimal(num: f64) -> f64 {
    let scale = 10f64.powi(DECIMAL_PRECISION);
    (num * scale).round() / scale
}

// ============================================================================
// Encoding
// ============================================================================

pub struct Encoder {
    buf: Vec<u8>,
    config: EncodeConfig,
}

impl Encoder {
    pub fn new(config: EncodeConfig) -> Self {
        Self {
            buf: Vec::new(),
            config,
        }
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    /// Major type header with the shortest argument encoding.
    pub fn write_header(&mut self, major: u8, arg: u64) {
        let overlay = major << 5;
        if arg <= 23 {
            self.buf.push(overlay | arg as u8);
        } else if arg <= 0xff {
            self.buf.push(overlay | 24);
            self.buf.push(arg as u8);
        } else if arg <= 0xffff {
            self.buf.push(overlay | 25);
            self.buf.extend_from_slice(&(arg as u16).to_be_bytes());
        } else if arg <= 0xffff_ffff {
            self.buf.push(overlay | 26);
            self.buf.extend_from_slice(&(arg as u32).to_be_bytes());
        } else {
            self.buf.push(overlay | 27);
            self.buf.extend_from_slice(&arg.to_be_bytes());
        }
    }

    fn write_container_header(&mut self, major: u8, len: usize) {
        if self.config.indefinite_containers {
            self.buf.push((major << 5) | MINOR_INDEFINITE);
        } else {
            self.write_header(major, len as u64);
        }
    }

    fn write_container_end(&mut self) {
        if self.config.indefinite_containers {
            self.buf.push(CBOR_BREAK);
        }
    }

    /// Shortest float width that represents `value` exactly.
    pub fn write_float(&mut self, value: f64) {
        let half = f16::from_f64(value);
        if half.to_f64() == value || (value.is_nan() && half.is_nan()) {
            self.buf.push(FLOAT16);
            self.buf.extend_from_slice(&half.to_bits().to_be_bytes());
        } else if (value as f32) as f64 == value {
            self.buf.push(FLOAT32);
            self.buf.extend_from_slice(&(value as f32).to_be_bytes());
        } else {
            self.buf.push(FLOAT64);
            self.buf.extend_from_slice(&value.to_be_bytes());
        }
    }

    pub fn write_value(&mut self, value: &CborValue) {
        match value {
            CborValue::Unsigned(n) => self.write_header(MAJOR_UNSIGNED, *n),
            CborValue::Negative(n) => self.write_header(MAJOR_NEGATIVE, *n),
            CborValue::Bytes(bytes) => {
                self.write_header(MAJOR_BYTES, bytes.len() as u64);
                self.buf.extend_from_slice(bytes);
            }
            CborValue::Text(text) => {
                self.write_header(MAJOR_TEXT, text.len() as u64);
                self.buf.extend_from_slice(text.as_bytes());
            }
            CborValue::Array(items) => {
                self.write_container_header(MAJOR_ARRAY, items.len());
                for item in items {
                    self.write_value(item);
                }
                self.write_container_end();
            }
            CborValue::Map(entries) => {
                let raw = entries
                    .iter()
                    .map(|(k, v)| (encode(k, self.config), encode(v, self.config)))
                    .collect();
                self.write_raw_map(raw);
            }
            CborValue::Bool(false) => self.buf.push(SIMPLE_FALSE),
            CborValue::Bool(true) => self.buf.push(SIMPLE_TRUE),
            CborValue::Null => self.buf.push(SIMPLE_NULL),
            CborValue::Float(f) => self.write_float(*f),
        }
    }

    /// Map from already-encoded key/value pairs.
    pub fn write_raw_map(&mut self, mut entries: Vec<(Vec<u8>, Vec<u8>)>) {
        if self.config.canonical {
            entries.sort_by(|(a, _), (b, _)| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
        }
        self.write_container_header(MAJOR_MAP, entries.len());
        for (key, value) in entries {
            self.buf.extend_from_slice(&key);
            self.buf.extend_from_slice(&value);
        }
        self.write_container_end();
    }
}

pub fn encode(value: &CborValue, config: EncodeConfig) -> Vec<u8> {
    let mut encoder = Encoder::new(config);
    encoder.write_value(value);
    encoder.finish()
}

pub fn encode_raw_map(entries: Vec<(Vec<u8>, Vec<u8>)>, config: EncodeConfig) -> Vec<u8> {
    let mut encoder = Encoder::new(config);
    encoder.write_raw_map(entries);
    encoder.finish()
}

// ============================================================================
// Decoding
// ============================================================================

/// One decoded map entry with the raw spans it was decoded from.
#[derive(Debug, Clone, PartialEq)]
pub struct MapEntry {
    pub key: CborValue,
    pub value: CborValue,
    pub raw_key: Range<usize>,
    pub raw_value: Range<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMap {
    pub entries: Vec<MapEntry>,
    /// Bytes consumed by the map, including any break code
    pub len: usize,
}

fn read_item(cursor: &mut Cursor<&[u8]>) -> Result<(CborValue, Range<usize>)> {
    let start = cursor.position() as usize;
    let value = ciborium::de::from_reader::<Value, _>(&mut *cursor).map_err(|e| {
        RecordError::CborDecode {
            offset: start,
            message: e.to_string(),
        }
    })?;
    let end = cursor.position() as usize;
    Ok((CborValue::from_ciborium(value)?, start..end))
}

fn truncated(offset: usize) -> RecordError {
    RecordError::CborDecode {
        offset,
        message: "unexpected end of data".to_string(),
    }
}

/// Decode the CBOR map at the start of `data`; trailing bytes are ignored.
pub fn decode_map(data: &[u8]) -> Result<DecodedMap> {
    let mut cursor = Cursor::new(data);
    let initial = cursor.read_u8().map_err(|_| truncated(0))?;
    if initial >> 5 != MAJOR_MAP {
        return Err(RecordError::NotAMap);
    }

    let count = match initial & 0x1f {
        minor @ 0..=23 => Some(minor as u64),
        24 => Some(cursor.read_u8().map_err(|_| truncated(1))? as u64),
        25 => Some(cursor.read_u16::<BigEndian>().map_err(|_| truncated(1))? as u64),
        26 => Some(cursor.read_u32::<BigEndian>().map_err(|_| truncated(1))? as u64),
        27 => Some(cursor.read_u64::<BigEndian>().map_err(|_| truncated(1))?),
        MINOR_INDEFINITE => None,
        minor => {
            return Err(RecordError::CborDecode {
                offset: 0,
                message: format!("invalid map length encoding {}", minor),
            })
        }
    };

    let mut entries = Vec::new();
    let mut remaining = count;
    loop {
        match remaining {
            Some(0) => break,
            Some(ref mut n) => *n -= 1,
            None => {
                let pos = cursor.position() as usize;
                match data.get(pos) {
                    Some(&CBOR_BREAK) => {
                        cursor.set_position(pos as u64 + 1);
                        break;
                    }
                    Some(_) => {}
                    None => return Err(truncated(pos)),
                }
            }
        }

        let (key, raw_key) = read_item(&mut cursor)?;
        let (value, raw_value) = read_item(&mut cursor)?;
        entries.push(MapEntry {
            key,
            value,
            raw_key,
            raw_value,
        });
    }

    Ok(DecodedMap {
        entries,
        len: cursor.position() as usize,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_float_widths() {
        assert_eq!(compact_float(2.0), CborValue::Unsigned(2));
        assert_eq!(compact_float(-3.0), CborValue::Negative(2));

        let encoded = encode(&compact_float(0.3), EncodeConfig::default());
        assert_eq!(encoded.len(), 3);
        assert_eq!(encoded[0], FLOAT16);

        // Too large for f16 but fine as f32
        let encoded = encode(&compact_float(100000.5), EncodeConfig::default());
        assert_eq!(encoded[0], FLOAT32);

        let encoded = encode(&compact_float(123456789.123), EncodeConfig::default());
        assert_eq!(encoded[0], FLOAT64);
    }

    #[test]
    fn test_integer_headers() {
        let config = EncodeConfig::default();
        assert_eq!(encode(&CborValue::Unsigned(23), config), vec![0x17]);
        assert_eq!(encode(&CborValue::Unsigned(24), config), vec![0x18, 24]);
        assert_eq!(encode(&CborValue::Unsigned(1000), config), vec![0x19, 0x03, 0xe8]);
        assert_eq!(encode(&CborValue::integer(-1), config), vec![0x20]);
        assert_eq!(encode(&CborValue::integer(-500), config), vec![0x39, 0x01, 0xf3]);
    }

    #[test]
    fn test_map_framing() {
        let map = CborValue::Map(vec![
            (CborValue::Unsigned(10), CborValue::Bool(true)),
            (CborValue::Unsigned(2), CborValue::Null),
        ]);

        let indefinite = encode(&map, EncodeConfig::default());
        assert_eq!(indefinite, vec![0xbf, 0x02, 0xf6, 0x0a, 0xf5, 0xff]);

        let definite = encode(
            &map,
            EncodeConfig {
                canonical: false,
                indefinite_containers: false,
            },
        );
        assert_eq!(definite, vec![0xa2, 0x0a, 0xf5, 0x02, 0xf6]);
    }

    #[test]
    fn test_canonical_order_is_length_first() {
        let map = CborValue::Map(vec![
            (CborValue::Unsigned(100), CborValue::Null),
            (CborValue::Text("a".to_string()), CborValue::Null),
            (CborValue::Unsigned(1), CborValue::Null),
        ]);
        let encoded = encode(
            &map,
            EncodeConfig {
                canonical: true,
                indefinite_containers: false,
            },
        );
        assert_eq!(encoded, vec![0xa3, 0x01, 0xf6, 0x18, 0x64, 0xf6, 0x61, 0x61, 0xf6]);
    }

    #[test]
    fn test_decode_map_spans_and_padding() {
        let mut data = vec![0xbf, 0x01, 0x63, b'a', b'b', b'c', 0x02, 0x18, 0x2a, 0xff];
        data.extend_from_slice(&[0u8; 6]);

        let decoded = decode_map(&data).unwrap();
        assert_eq!(decoded.len, 10);
        assert_eq!(decoded.entries.len(), 2);
        assert_eq!(decoded.entries[0].value, CborValue::Text("abc".to_string()));
        assert_eq!(decoded.entries[0].raw_value, 2..6);
        assert_eq!(decoded.entries[1].raw_key, 6..7);
        assert_eq!(decoded.entries[1].value, CborValue::Unsigned(42));
    }

    #[test]
    fn test_decode_rejects_non_map_and_truncation() {
        assert!(matches!(decode_map(&[0x00]), Err(RecordError::NotAMap)));
        assert!(matches!(decode_map(&[]), Err(RecordError::CborDecode { .. })));
        assert!(matches!(decode_map(&[0xbf, 0x01]), Err(RecordError::CborDecode { .. })));
        assert!(matches!(decode_map(&[0xa2, 0x01, 0x02]), Err(RecordError::CborDecode { .. })));
    }

    #[test]
    fn test_canonical_decimal() {
        assert_eq!(canonical_decimal(0.30004882), 0.3);
        assert_eq!(canonical_decimal(1.2399), 1.24);
    }
}
