// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Binary IPP attribute codec (RFC 8010 §3).
//
// Knows the tag-length-value layout of attributes and nothing about
// operations.  Every attribute on the wire is:
//
// ```text
// value-tag:    1 byte
// name-length:  2 bytes (big-endian u16), 0 = additional value of the
//               previous attribute
// name:         name-length bytes
// value-length: 2 bytes (big-endian u16)
// value:        value-length bytes
// ```
//
// The reader works on whatever prefix of the stream has been buffered so far
// and answers `None` when the next field is not fully available yet.  There
// is no error recovery: a bogus length field makes the caller over- or
// under-read, so callers bound the total request size and time out stalled
// clients.

use chrono::{DateTime, Datelike, FixedOffset, Offset, TimeZone, Timelike};

// ---------------------------------------------------------------------------
// Delimiter tags (RFC 8010 §3.5.1)
// ---------------------------------------------------------------------------

/// Operation attributes group delimiter.
pub const TAG_OPERATION_ATTRIBUTES: u8 = 0x01;

/// Job attributes group delimiter.
pub const TAG_JOB_ATTRIBUTES: u8 = 0x02;

/// End-of-attributes-tag -- terminates the attribute section.
pub const TAG_END_OF_ATTRIBUTES: u8 = 0x03;

/// Printer attributes group delimiter.
pub const TAG_PRINTER_ATTRIBUTES: u8 = 0x04;

/// Unsupported attributes group delimiter.
pub const TAG_UNSUPPORTED_ATTRIBUTES: u8 = 0x05;

/// Tags below this value are delimiters, at or above it value tags.
pub const FIRST_VALUE_TAG: u8 = 0x10;

// ---------------------------------------------------------------------------
// Value tags (RFC 8010 §3.5.2)
// ---------------------------------------------------------------------------

/// Out-of-band: attribute not supported.
pub const VALUE_TAG_UNSUPPORTED: u8 = 0x10;

/// Out-of-band: value unknown.
pub const VALUE_TAG_UNKNOWN: u8 = 0x12;

/// Out-of-band: no value.
pub const VALUE_TAG_NO_VALUE: u8 = 0x13;

/// Integer value (4 bytes, signed big-endian).
pub const VALUE_TAG_INTEGER: u8 = 0x21;

/// Boolean value (1 byte: 0x00 = false, 0x01 = true).
pub const VALUE_TAG_BOOLEAN: u8 = 0x22;

/// Enum value (4 bytes, same encoding as integer).
pub const VALUE_TAG_ENUM: u8 = 0x23;

/// dateTime (11 bytes, RFC 2579 DateAndTime).
pub const VALUE_TAG_DATE_TIME: u8 = 0x31;

/// resolution (9 bytes: x, y, unit).
pub const VALUE_TAG_RESOLUTION: u8 = 0x32;

/// textWithoutLanguage (UTF-8 string).
pub const VALUE_TAG_TEXT: u8 = 0x41;

/// nameWithoutLanguage (UTF-8 string).
pub const VALUE_TAG_NAME: u8 = 0x42;

/// keyword (US-ASCII string).
pub const VALUE_TAG_KEYWORD: u8 = 0x44;

/// uri (US-ASCII string).
pub const VALUE_TAG_URI: u8 = 0x45;

/// charset (US-ASCII string, e.g. "utf-8").
pub const VALUE_TAG_CHARSET: u8 = 0x47;

/// naturalLanguage (US-ASCII string, e.g. "en-us").
pub const VALUE_TAG_NATURAL_LANGUAGE: u8 = 0x48;

/// mimeMediaType (US-ASCII string).
pub const VALUE_TAG_MIME_MEDIA_TYPE: u8 = 0x49;

/// Resolution unit: dots per inch.
pub const RESOLUTION_DOTS_PER_INCH: u8 = 3;

/// Encoded length of a dateTime value.
pub const DATE_TIME_LEN: usize = 11;

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// One attribute as it appeared on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAttribute {
    pub value_tag: u8,
    /// Empty when this is an additional value of the previous attribute.
    pub name: String,
    pub value: Vec<u8>,
}

/// Cursor over the buffered prefix of an IPP byte stream.
#[derive(Debug)]
pub struct AttributeReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> AttributeReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes buffered but not yet consumed.
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let bytes = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(bytes)
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    pub fn read_u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        self.take(4).map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a delimiter or value tag.
    pub fn read_tag(&mut self) -> Option<u8> {
        self.read_u8()
    }

    pub fn read_name_length(&mut self) -> Option<u16> {
        self.read_u16()
    }

    /// Read `len` bytes of attribute name (lossy UTF-8).
    pub fn read_name_value(&mut self, len: u16) -> Option<String> {
        self.take(len as usize)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    pub fn read_value_length(&mut self) -> Option<u16> {
        self.read_u16()
    }

    pub fn read_value_bytes(&mut self, len: u16) -> Option<&'a [u8]> {
        self.take(len as usize)
    }

    /// Read the rest of an attribute whose value tag has already been read.
    pub fn read_attribute_body(&mut self, value_tag: u8) -> Option<RawAttribute> {
        let name_len = self.read_name_length()?;
        let name = self.read_name_value(name_len)?;
        let value_len = self.read_value_length()?;
        let value = self.read_value_bytes(value_len)?.to_vec();
        Some(RawAttribute {
            value_tag,
            name,
            value,
        })
    }
}

/// Decode a 4-byte integer or enum value.
pub fn decode_i32(value: &[u8]) -> Option<i32> {
    let bytes: [u8; 4] = value.try_into().ok()?;
    Some(i32::from_be_bytes(bytes))
}

/// Decode an 11-byte dateTime value.
pub fn decode_date_time(value: &[u8]) -> Option<DateTime<FixedOffset>> {
    // Deci-seconds run 0..=9.
    if value.len() != DATE_TIME_LEN || value[7] > 9 {
        return None;
    }
    let year = i32::from(u16::from_be_bytes([value[0], value[1]]));
    let offset_secs = i32::from(value[9]) * 3600 + i32::from(value[10]) * 60;
    let offset = match value[8] {
        b'+' => FixedOffset::east_opt(offset_secs)?,
        b'-' => FixedOffset::west_opt(offset_secs)?,
        _ => return None,
    };
    let base = offset
        .with_ymd_and_hms(
            year,
            u32::from(value[2]),
            u32::from(value[3]),
            u32::from(value[4]),
            u32::from(value[5]),
            u32::from(value[6]),
        )
        .single()?;
    base.with_nanosecond(u32::from(value[7]) * 100_000_000)
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Append-only encoder for attribute groups.
///
/// Methods return `&mut Self` so related values chain naturally; pass an
/// empty `name` to add another value to the previous attribute.
#[derive(Debug, Default)]
pub struct AttributeWriter {
    buf: Vec<u8>,
}

impl AttributeWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn put_u16(&mut self, value: u16) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Start a new attribute group.
    pub fn begin_group(&mut self, delimiter: u8) -> &mut Self {
        self.put_u8(delimiter)
    }

    /// Terminate the attribute section.
    pub fn end_of_attributes(&mut self) -> &mut Self {
        self.put_u8(TAG_END_OF_ATTRIBUTES)
    }

    /// Value-tag, name-length and name; the caller writes the value part.
    fn header(&mut self, value_tag: u8, name: &str) -> &mut Self {
        let name = clamp_field(name.as_bytes());
        self.put_u8(value_tag);
        self.put_u16(name.len() as u16);
        self.buf.extend_from_slice(name);
        self
    }

    pub fn write_string(&mut self, value_tag: u8, name: &str, value: &str) -> &mut Self {
        self.write_n_bytes(value_tag, name, value.as_bytes())
    }

    /// Out-of-band attribute (unknown, no-value, ...): zero-length value.
    pub fn write_oob(&mut self, value_tag: u8, name: &str) -> &mut Self {
        self.header(value_tag, name).put_u16(0)
    }

    pub fn write_byte(&mut self, value_tag: u8, name: &str, value: u8) -> &mut Self {
        self.header(value_tag, name).put_u16(1).put_u8(value)
    }

    pub fn write_two_byte(&mut self, value_tag: u8, name: &str, value: u16) -> &mut Self {
        self.header(value_tag, name).put_u16(2).put_u16(value)
    }

    pub fn write_four_byte(&mut self, value_tag: u8, name: &str, value: u32) -> &mut Self {
        self.header(value_tag, name).put_u16(4).put_u32(value)
    }

    /// Values longer than a length field can express are cut to fit.
    pub fn write_n_bytes(&mut self, value_tag: u8, name: &str, value: &[u8]) -> &mut Self {
        let value = clamp_field(value);
        self.header(value_tag, name).put_u16(value.len() as u16);
        self.buf.extend_from_slice(value);
        self
    }

    /// RFC 2579 DateAndTime in its 11-byte form.
    pub fn write_date_time<Tz: TimeZone>(
        &mut self,
        value_tag: u8,
        name: &str,
        at: &DateTime<Tz>,
    ) -> &mut Self {
        let encoded = encode_date_time(at);
        self.write_n_bytes(value_tag, name, &encoded)
    }

    pub fn write_resolution(
        &mut self,
        value_tag: u8,
        name: &str,
        x: i32,
        y: i32,
        unit: u8,
    ) -> &mut Self {
        self.header(value_tag, name)
            .put_u16(9)
            .put_u32(x as u32)
            .put_u32(y as u32)
            .put_u8(unit)
    }
}

/// Prefix of `bytes` that fits a 16-bit length field.
fn clamp_field(bytes: &[u8]) -> &[u8] {
    &bytes[..bytes.len().min(usize::from(u16::MAX))]
}

/// Encode a timestamp as year (2), month, day, hour, minute, second,
/// deci-seconds, UTC direction, offset hours, offset minutes.
pub fn encode_date_time<Tz: TimeZone>(at: &DateTime<Tz>) -> [u8; DATE_TIME_LEN] {
    let offset_secs = at.offset().fix().local_minus_utc();
    let direction = if offset_secs < 0 { b'-' } else { b'+' };
    let offset_abs = offset_secs.unsigned_abs();
    let year = at.year().clamp(0, i32::from(u16::MAX)) as u16;
    // Leap seconds report nanoseconds >= 1e9.
    let deci = (at.nanosecond() / 100_000_000).min(9) as u8;
    let [year_hi, year_lo] = year.to_be_bytes();
    [
        year_hi,
        year_lo,
        at.month() as u8,
        at.day() as u8,
        at.hour() as u8,
        at.minute() as u8,
        at.second() as u8,
        deci,
        direction,
        (offset_abs / 3600) as u8,
        ((offset_abs % 3600) / 60) as u8,
    ]
}
