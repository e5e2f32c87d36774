//! Byte encoding of values, records and changeset framing.
//!
//! # Value format
//!
//! ```text
//! tag:u8                        ; 0 = undefined, 5 = null
//! tag:u8 i64 big-endian         ; 1 = integer
//! tag:u8 f64 bits big-endian    ; 2 = float
//! tag:u8 varint(len) bytes      ; 3 = text, 4 = blob
//! ```
//!
//! Varints are little-endian base-128: seven data bits per byte, high bit
//! set on every byte but the last, at most ten bytes. A record is a run of
//! values whose length is known from the table header.

use crate::error::{Error, Result};
use crate::value::Value;

pub const TAG_UNDEFINED: u8 = 0;
pub const TAG_INTEGER: u8 = 1;
pub const TAG_FLOAT: u8 = 2;
pub const TAG_TEXT: u8 = 3;
pub const TAG_BLOB: u8 = 4;
pub const TAG_NULL: u8 = 5;

/// Table header marker.
pub const TABLE_HEADER: u8 = b'T';

const MAX_VARINT_LEN: usize = 10;

pub fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

/// Appends one value. `None` is written as the undefined tag.
pub fn put_value(buf: &mut Vec<u8>, value: Option<&Value>) {
    match value {
        None => buf.push(TAG_UNDEFINED),
        Some(Value::Null) => buf.push(TAG_NULL),
        Some(Value::Integer(i)) => {
            buf.push(TAG_INTEGER);
            buf.extend_from_slice(&i.to_be_bytes());
        }
        Some(Value::Real(f)) => {
            buf.push(TAG_FLOAT);
            buf.extend_from_slice(&f.to_bits().to_be_bytes());
        }
        Some(Value::Text(t)) => {
            buf.push(TAG_TEXT);
            put_varint(buf, t.len() as u64);
            buf.extend_from_slice(t);
        }
        Some(Value::Blob(b)) => {
            buf.push(TAG_BLOB);
            put_varint(buf, b.len() as u64);
            buf.extend_from_slice(b);
        }
    }
}

pub fn put_record<'v, I>(buf: &mut Vec<u8>, values: I)
where
    I: IntoIterator<Item = Option<&'v Value>>,
{
    for value in values {
        put_value(buf, value);
    }
}

/// Appends a table header: marker, column count, NUL-terminated name.
pub fn put_table_header(buf: &mut Vec<u8>, table: &str, column_count: usize) {
    buf.push(TABLE_HEADER);
    put_varint(buf, column_count as u64);
    buf.extend_from_slice(table.as_bytes());
    buf.push(0);
}

/// Encodes a whole record into a fresh buffer.
pub fn encode_record<'v, I>(values: I) -> Vec<u8>
where
    I: IntoIterator<Item = Option<&'v Value>>,
{
    let mut buf = Vec::new();
    put_record(&mut buf, values);
    buf
}

/// Decodes a whole record of `count` values and requires that it consumes
/// every byte of `data`.
pub fn decode_record(data: &[u8], count: usize) -> Result<Vec<Option<Value>>> {
    let mut input = Input::new(data);
    let values = (0..count)
        .map(|_| input.value())
        .collect::<Result<Vec<_>>>()?;
    if !input.is_empty() {
        return Err(Error::corrupt(input.pos(), "trailing bytes after record"));
    }
    Ok(values)
}

/// Forward-only reader over an encoded buffer.
#[derive(Debug, Clone)]
pub struct Input<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Input<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn set_pos(&mut self, pos: usize) {
        self.pos = pos.min(self.data.len());
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn byte(&mut self) -> Result<u8> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or_else(|| Error::corrupt(self.pos, "unexpected end of input"))?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| Error::corrupt(self.pos, "length exceeds remaining bytes"))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn varint(&mut self) -> Result<u64> {
        let start = self.pos;
        let mut value: u64 = 0;
        for i in 0..MAX_VARINT_LEN {
            let byte = self
                .byte()
                .map_err(|_| Error::corrupt(start, "truncated varint"))?;
            let bits = u64::from(byte & 0x7f);
            if i == MAX_VARINT_LEN - 1 && bits > 1 {
                return Err(Error::corrupt(start, "varint overflows 64 bits"));
            }
            value |= bits << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(Error::corrupt(start, "varint longer than 10 bytes"))
    }

    fn length(&mut self) -> Result<usize> {
        let start = self.pos;
        let len = self.varint()?;
        usize::try_from(len).map_err(|_| Error::corrupt(start, "length exceeds remaining bytes"))
    }

    /// Reads one value; `None` is the undefined placeholder.
    pub fn value(&mut self) -> Result<Option<Value>> {
        let start = self.pos;
        let tag = self.byte()?;
        let value = match tag {
            TAG_UNDEFINED => return Ok(None),
            TAG_NULL => Value::Null,
            TAG_INTEGER => Value::Integer(i64::from_be_bytes(self.eight()?)),
            TAG_FLOAT => Value::Real(f64::from_bits(u64::from_be_bytes(self.eight()?))),
            TAG_TEXT => {
                let len = self.length()?;
                Value::Text(self.bytes(len)?.to_vec())
            }
            TAG_BLOB => {
                let len = self.length()?;
                Value::Blob(self.bytes(len)?.to_vec())
            }
            _ => return Err(Error::corrupt(start, "unknown value type tag")),
        };
        Ok(Some(value))
    }

    /// Skips one value without materializing it.
    pub fn skip_value(&mut self) -> Result<()> {
        let start = self.pos;
        match self.byte()? {
            TAG_UNDEFINED | TAG_NULL => Ok(()),
            TAG_INTEGER | TAG_FLOAT => self.bytes(8).map(|_| ()),
            TAG_TEXT | TAG_BLOB => {
                let len = self.length()?;
                self.bytes(len).map(|_| ())
            }
            _ => Err(Error::corrupt(start, "unknown value type tag")),
        }
    }

    /// Reads a NUL-terminated UTF-8 string.
    pub fn cstring(&mut self) -> Result<&'a str> {
        let start = self.pos;
        let rest = &self.data[self.pos.min(self.data.len())..];
        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| Error::corrupt(start, "unterminated table name"))?;
        let name = std::str::from_utf8(&rest[..nul])
            .map_err(|_| Error::corrupt(start, "table name is not valid UTF-8"))?;
        self.pos += nul + 1;
        Ok(name)
    }

    fn eight(&mut self) -> Result<[u8; 8]> {
        let mut out = [0u8; 8];
        out.copy_from_slice(self.bytes(8)?);
        Ok(out)
    }
}
