// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Minimal Thrift binary protocol reader and writer, enough for the Jaeger
//! collector payloads.

use crate::errors::DecodeError;

/// Collections larger than this are rejected before allocating.
const MAX_COLLECTION_SIZE: usize = 1 << 20;
const MAX_SKIP_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TType {
    Stop,
    Bool,
    Byte,
    Double,
    I16,
    I32,
    I64,
    String,
    Struct,
    Map,
    Set,
    List,
}

impl TType {
    fn from_byte(b: u8) -> Result<Self, DecodeError> {
        Ok(match b {
            0 => TType::Stop,
            2 => TType::Bool,
            3 => TType::Byte,
            4 => TType::Double,
            6 => TType::I16,
            8 => TType::I32,
            10 => TType::I64,
            11 => TType::String,
            12 => TType::Struct,
            13 => TType::Map,
            14 => TType::Set,
            15 => TType::List,
            other => return Err(thrift_err(format!("unknown field type {other}"))),
        })
    }

    fn to_byte(self) -> u8 {
        match self {
            TType::Stop => 0,
            TType::Bool => 2,
            TType::Byte => 3,
            TType::Double => 4,
            TType::I16 => 6,
            TType::I32 => 8,
            TType::I64 => 10,
            TType::String => 11,
            TType::Struct => 12,
            TType::Map => 13,
            TType::Set => 14,
            TType::List => 15,
        }
    }
}

fn thrift_err(msg: impl Into<String>) -> DecodeError {
    DecodeError::Thrift(msg.into())
}

pub struct BinaryReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BinaryReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        BinaryReader { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(thrift_err(format!(
                "unexpected end of payload at offset {}",
                self.pos
            )));
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_byte(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, DecodeError> {
        Ok(self.read_byte()? != 0)
    }

    pub fn read_i16(&mut self) -> Result<i16, DecodeError> {
        Ok(i16::from_be_bytes(self.take_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_be_bytes(self.take_array()?))
    }

    pub fn read_double(&mut self) -> Result<f64, DecodeError> {
        Ok(f64::from_bits(u64::from_be_bytes(self.take_array()?)))
    }

    pub fn read_binary(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_size()?;
        Ok(self.take(len)?.to_vec())
    }

    pub fn read_string(&mut self) -> Result<String, DecodeError> {
        String::from_utf8(self.read_binary()?).map_err(|e| thrift_err(e.to_string()))
    }

    fn read_size(&mut self) -> Result<usize, DecodeError> {
        let size = self.read_i32()?;
        let size = usize::try_from(size).map_err(|_| thrift_err(format!("negative size {size}")))?;
        if size > MAX_COLLECTION_SIZE || size > self.remaining() {
            return Err(thrift_err(format!("size {size} exceeds payload")));
        }
        Ok(size)
    }

    /// Returns `None` at the end of a struct.
    pub fn read_field_begin(&mut self) -> Result<Option<(TType, i16)>, DecodeError> {
        let ttype = TType::from_byte(self.read_byte()?)?;
        if ttype == TType::Stop {
            return Ok(None);
        }
        Ok(Some((ttype, self.read_i16()?)))
    }

    pub fn read_list_begin(&mut self) -> Result<(TType, usize), DecodeError> {
        let elem = TType::from_byte(self.read_byte()?)?;
        Ok((elem, self.read_size()?))
    }

    pub fn skip(&mut self, ttype: TType) -> Result<(), DecodeError> {
        self.skip_depth(ttype, 0)
    }

    fn skip_depth(&mut self, ttype: TType, depth: usize) -> Result<(), DecodeError> {
        if depth > MAX_SKIP_DEPTH {
            return Err(thrift_err("nesting too deep"));
        }
        match ttype {
            TType::Stop => {}
            TType::Bool | TType::Byte => {
                self.take(1)?;
            }
            TType::I16 => {
                self.take(2)?;
            }
            TType::I32 => {
                self.take(4)?;
            }
            TType::I64 | TType::Double => {
                self.take(8)?;
            }
            TType::String => {
                let len = self.read_size()?;
                self.take(len)?;
            }
            TType::Struct => {
                while let Some((field_type, _)) = self.read_field_begin()? {
                    self.skip_depth(field_type, depth + 1)?;
                }
            }
            TType::Map => {
                let key = TType::from_byte(self.read_byte()?)?;
                let val = TType::from_byte(self.read_byte()?)?;
                for _ in 0..self.read_size()? {
                    self.skip_depth(key, depth + 1)?;
                    self.skip_depth(val, depth + 1)?;
                }
            }
            TType::Set | TType::List => {
                let (elem, size) = self.read_list_begin()?;
                for _ in 0..size {
                    self.skip_depth(elem, depth + 1)?;
                }
            }
        }
        Ok(())
    }

    /// Reads a list whose elements are decoded by `read`.
    pub fn read_list<T>(
        &mut self,
        expected: TType,
        mut read: impl FnMut(&mut Self) -> Result<T, DecodeError>,
    ) -> Result<Vec<T>, DecodeError> {
        let (elem, size) = self.read_list_begin()?;
        if elem != expected && size > 0 {
            return Err(thrift_err(format!(
                "expected list of {expected:?}, got {elem:?}"
            )));
        }
        let mut out = Vec::with_capacity(size);
        for _ in 0..size {
            out.push(read(self)?);
        }
        Ok(out)
    }
}

#[derive(Default)]
pub struct BinaryWriter {
    buf: Vec<u8>,
}

impl BinaryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_field_begin(&mut self, ttype: TType, id: i16) {
        self.buf.push(ttype.to_byte());
        self.buf.extend_from_slice(&id.to_be_bytes());
    }

    pub fn write_field_stop(&mut self) {
        self.buf.push(TType::Stop.to_byte());
    }

    pub fn write_list_begin(&mut self, elem: TType, size: usize) {
        self.buf.push(elem.to_byte());
        self.write_i32(size as i32);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_double(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_bits().to_be_bytes());
    }

    pub fn write_binary(&mut self, v: &[u8]) {
        self.write_i32(v.len() as i32);
        self.buf.extend_from_slice(v);
    }

    pub fn write_string(&mut self, v: &str) {
        self.write_binary(v.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitives() {
        let mut w = BinaryWriter::new();
        w.write_i32(-7);
        w.write_i64(1 << 40);
        w.write_double(2.5);
        w.write_bool(true);
        w.write_string("héllo");

        let bytes = w.into_bytes();
        let mut r = BinaryReader::new(&bytes);
        assert_eq!(r.read_i32().unwrap(), -7);
        assert_eq!(r.read_i64().unwrap(), 1 << 40);
        assert_eq!(r.read_double().unwrap(), 2.5);
        assert!(r.read_bool().unwrap());
        assert_eq!(r.read_string().unwrap(), "héllo");
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_skip_unknown_fields() {
        let mut w = BinaryWriter::new();
        w.write_field_begin(TType::List, 9);
        w.write_list_begin(TType::String, 2);
        w.write_string("a");
        w.write_string("b");
        w.write_field_begin(TType::Struct, 10);
        w.write_field_begin(TType::I64, 1);
        w.write_i64(3);
        w.write_field_stop();
        w.write_field_begin(TType::I32, 11);
        w.write_i32(42);
        w.write_field_stop();

        let bytes = w.into_bytes();
        let mut r = BinaryReader::new(&bytes);
        let mut seen = None;
        while let Some((ttype, id)) = r.read_field_begin().unwrap() {
            if id == 11 {
                seen = Some(r.read_i32().unwrap());
            } else {
                r.skip(ttype).unwrap();
            }
        }
        assert_eq!(seen, Some(42));
    }

    #[test]
    fn test_truncated_payload() {
        let mut w = BinaryWriter::new();
        w.write_string("truncated");
        let bytes = w.into_bytes();
        let mut r = BinaryReader::new(&bytes[..6]);
        assert!(matches!(r.read_string(), Err(DecodeError::Thrift(_))));
    }

    #[test]
    fn test_oversized_list_rejected() {
        let mut w = BinaryWriter::new();
        w.write_list_begin(TType::I64, 1_000_000);
        let bytes = w.into_bytes();
        let mut r = BinaryReader::new(&bytes);
        assert!(r.read_list(TType::I64, |r| r.read_i64()).is_err());
    }

    #[test]
    fn test_unknown_type_byte() {
        let mut r = BinaryReader::new(&[99, 0, 1]);
        assert!(r.read_field_begin().is_err());
    }
}
