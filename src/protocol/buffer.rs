//! Framed packet buffer.
//!
//! A [`PacketBuffer`] is either being built (length placeholder first, then
//! payload fields, then [`finalize`]) or being read (payload bytes with a
//! cursor). Storage comes from the buffer pool and is returned on drop.
//!
//! Field encodings:
//! - fixed-width integers and floats are big-endian
//! - var-uints are LEB128: 7 data bits per byte, high bit continues
//! - optional text and optional byte strings are var-uint `len + 1` with `0`
//!   meaning null; required readers reject null
//! - tagged values are a 1-byte tag then the natural encoding
//!
//! [`finalize`]: PacketBuffer::finalize

use super::pool;
use super::value::{tag, TaggedValue};
use super::{ClusterOperation, Operation, Status, FRAME_HEADER_SIZE};
use crate::core::error::{StrataError, StrataResult};
use bytes::{BufMut, BytesMut};
use std::collections::HashMap;

/// Longest valid LEB128 encoding of a u64.
const MAX_VAR_UINT_BYTES: usize = 10;

/// A pooled, framed packet buffer.
pub struct PacketBuffer {
    buf: BytesMut,
    read_pos: usize,
}

impl PacketBuffer {
    /// Start a client request frame.
    pub fn request(op: Operation, request_id: u32) -> Self {
        let mut packet = Self::with_header();
        packet.write_u8(op as u8);
        packet.write_u32(request_id);
        packet
    }

    /// Start a client response frame.
    pub fn response(op: Operation, request_id: u32, status: Status) -> Self {
        Self::response_raw(op as u8, request_id, status)
    }

    /// Start a response frame echoing a raw operation byte.
    ///
    /// Used when the request's operation code did not decode.
    pub fn response_raw(op: u8, request_id: u32, status: Status) -> Self {
        let mut packet = Self::with_header();
        packet.write_u8(op);
        packet.write_u32(request_id);
        packet.write_u8(status as u8);
        packet
    }

    /// Start a cluster request frame.
    pub fn cluster_request(op: ClusterOperation, request_id: u32) -> Self {
        let mut packet = Self::with_header();
        packet.write_u8(op as u8);
        packet.write_u32(request_id);
        packet
    }

    /// Start a cluster response frame.
    pub fn cluster_response(op: ClusterOperation, request_id: u32, status: Status) -> Self {
        let mut packet = Self::with_header();
        packet.write_u8(op as u8);
        packet.write_u32(request_id);
        packet.write_u8(status as u8);
        packet
    }

    /// Wrap a received payload (length prefix already stripped) for reading.
    pub fn from_payload(payload: BytesMut) -> Self {
        Self {
            buf: payload,
            read_pos: 0,
        }
    }

    /// Copy a finalized frame into fresh pooled storage.
    ///
    /// Fan-out paths build a message once and hand each recipient its own
    /// copy, so every in-flight frame still releases through the pool.
    pub fn copy_of(template: &PacketBuffer) -> Self {
        let mut buf = pool::acquire();
        buf.put_slice(template.frame());
        Self { buf, read_pos: 0 }
    }

    fn with_header() -> Self {
        let mut buf = pool::acquire();
        buf.put_bytes(0, FRAME_HEADER_SIZE);
        Self { buf, read_pos: 0 }
    }

    /// Patch the length prefix. Must be called on built frames before
    /// [`frame`] is transmitted.
    ///
    /// [`frame`]: PacketBuffer::frame
    pub fn finalize(&mut self) {
        let payload_len = (self.buf.len() - FRAME_HEADER_SIZE) as u32;
        self.buf[..FRAME_HEADER_SIZE].copy_from_slice(&payload_len.to_be_bytes());
    }

    /// The whole frame, length prefix included.
    pub fn frame(&self) -> &[u8] {
        &self.buf
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.read_pos
    }

    fn take(&mut self, n: usize) -> StrataResult<&[u8]> {
        if self.remaining() < n {
            return Err(StrataError::malformed(format!(
                "truncated field: need {n} bytes, have {}",
                self.remaining()
            )));
        }
        let slice = &self.buf[self.read_pos..self.read_pos + n];
        self.read_pos += n;
        Ok(slice)
    }

    // ------------------------------------------------------------------
    // Fixed-width primitives
    // ------------------------------------------------------------------

    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn read_u8(&mut self) -> StrataResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    pub fn read_bool(&mut self) -> StrataResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    pub fn read_u32(&mut self) -> StrataResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.put_i32(value);
    }

    pub fn read_i32(&mut self) -> StrataResult<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.put_u64(value);
    }

    pub fn read_u64(&mut self) -> StrataResult<u64> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(raw))
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.put_i64(value);
    }

    pub fn read_i64(&mut self) -> StrataResult<i64> {
        Ok(self.read_u64()? as i64)
    }

    pub fn write_f32(&mut self, value: f32) {
        self.buf.put_f32(value);
    }

    pub fn read_f32(&mut self) -> StrataResult<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn write_f64(&mut self, value: f64) {
        self.buf.put_f64(value);
    }

    pub fn read_f64(&mut self) -> StrataResult<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    // ------------------------------------------------------------------
    // Var-uints
    // ------------------------------------------------------------------

    pub fn write_var_uint(&mut self, mut value: u64) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.buf.put_u8(byte);
                return;
            }
            self.buf.put_u8(byte | 0x80);
        }
    }

    pub fn read_var_uint(&mut self) -> StrataResult<u64> {
        let mut value = 0u64;
        for i in 0..MAX_VAR_UINT_BYTES {
            let byte = self.read_u8()?;
            value |= u64::from(byte & 0x7f) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(StrataError::malformed("var-uint longer than 10 bytes"))
    }

    // ------------------------------------------------------------------
    // Strings and byte strings
    // ------------------------------------------------------------------

    /// Write optional text: var-uint `len + 1`, `0` meaning null.
    pub fn write_opt_string(&mut self, value: Option<&str>) {
        match value {
            None => self.write_var_uint(0),
            Some(text) => {
                self.write_var_uint(text.len() as u64 + 1);
                self.buf.put_slice(text.as_bytes());
            }
        }
    }

    /// Write required text.
    pub fn write_string(&mut self, value: &str) {
        self.write_opt_string(Some(value));
    }

    pub fn read_opt_string(&mut self) -> StrataResult<Option<String>> {
        let marker = self.read_var_uint()?;
        if marker == 0 {
            return Ok(None);
        }
        let len = (marker - 1) as usize;
        let bytes = self.take(len)?;
        let text = std::str::from_utf8(bytes)
            .map_err(|_| StrataError::malformed("string field is not valid UTF-8"))?;
        Ok(Some(text.to_string()))
    }

    /// Read required text; null is a framing violation.
    pub fn read_string(&mut self) -> StrataResult<String> {
        self.read_opt_string()?
            .ok_or_else(|| StrataError::malformed("unexpected null string field"))
    }

    /// Write an optional byte string with the same `len + 1` convention.
    pub fn write_opt_bytes(&mut self, value: Option<&[u8]>) {
        match value {
            None => self.write_var_uint(0),
            Some(bytes) => {
                self.write_var_uint(bytes.len() as u64 + 1);
                self.buf.put_slice(bytes);
            }
        }
    }

    pub fn read_opt_bytes(&mut self) -> StrataResult<Option<Vec<u8>>> {
        let marker = self.read_var_uint()?;
        if marker == 0 {
            return Ok(None);
        }
        let len = (marker - 1) as usize;
        Ok(Some(self.take(len)?.to_vec()))
    }

    // ------------------------------------------------------------------
    // Tagged values
    // ------------------------------------------------------------------

    pub fn write_tagged(&mut self, value: &TaggedValue) {
        self.write_u8(value.tag());
        match value {
            TaggedValue::Null => {}
            TaggedValue::Int(v) => self.write_i64(*v),
            TaggedValue::Float32(v) => self.write_f32(*v),
            TaggedValue::Float64(v) => self.write_f64(*v),
            TaggedValue::Bool(v) => self.write_bool(*v),
            TaggedValue::String(v) => {
                self.write_var_uint(v.len() as u64);
                self.buf.put_slice(v.as_bytes());
            }
            TaggedValue::Bytes(v) => {
                self.write_var_uint(v.len() as u64);
                self.buf.put_slice(v);
            }
        }
    }

    pub fn read_tagged(&mut self) -> StrataResult<TaggedValue> {
        let tag_byte = self.read_u8()?;
        match tag_byte {
            tag::NULL => Ok(TaggedValue::Null),
            tag::INT => Ok(TaggedValue::Int(self.read_i64()?)),
            tag::FLOAT32 => Ok(TaggedValue::Float32(self.read_f32()?)),
            tag::FLOAT64 => Ok(TaggedValue::Float64(self.read_f64()?)),
            tag::BOOL => Ok(TaggedValue::Bool(self.read_bool()?)),
            tag::STRING => {
                let len = self.read_var_uint()? as usize;
                let bytes = self.take(len)?;
                let text = std::str::from_utf8(bytes)
                    .map_err(|_| StrataError::malformed("tagged string is not valid UTF-8"))?;
                Ok(TaggedValue::String(text.to_string()))
            }
            tag::BYTES => {
                let len = self.read_var_uint()? as usize;
                Ok(TaggedValue::Bytes(self.take(len)?.to_vec()))
            }
            other => Err(StrataError::malformed(format!(
                "unknown tagged value tag: {other}"
            ))),
        }
    }

    /// Write a sub-key → tagged value mapping: var-uint count, then pairs.
    pub fn write_tagged_map(&mut self, map: &HashMap<String, TaggedValue>) {
        self.write_var_uint(map.len() as u64);
        for (sub_key, value) in map {
            self.write_string(sub_key);
            self.write_tagged(value);
        }
    }

    pub fn read_tagged_map(&mut self) -> StrataResult<HashMap<String, TaggedValue>> {
        let count = self.read_var_uint()? as usize;
        let mut map = HashMap::with_capacity(count.min(1024));
        for _ in 0..count {
            let sub_key = self.read_string()?;
            map.insert(sub_key, self.read_tagged()?);
        }
        Ok(map)
    }
}

impl Drop for PacketBuffer {
    fn drop(&mut self) {
        pool::release(std::mem::take(&mut self.buf));
    }
}

impl std::fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("len", &self.buf.len())
            .field("read_pos", &self.read_pos)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader_of(build: impl FnOnce(&mut PacketBuffer)) -> PacketBuffer {
        let mut packet = PacketBuffer::from_payload(BytesMut::new());
        build(&mut packet);
        packet
    }

    #[test]
    fn test_var_uint_round_trip() {
        for value in [0u64, 1, 127, 128, 300, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            let mut packet = reader_of(|p| p.write_var_uint(value));
            assert_eq!(packet.read_var_uint().unwrap(), value, "value {value}");
            assert_eq!(packet.remaining(), 0);
        }
    }

    #[test]
    fn test_var_uint_single_byte_boundary() {
        let mut packet = reader_of(|p| p.write_var_uint(127));
        assert_eq!(packet.frame().len(), 1);
        assert_eq!(packet.read_var_uint().unwrap(), 127);

        let mut packet = reader_of(|p| p.write_var_uint(128));
        assert_eq!(packet.frame().len(), 2);
        assert_eq!(packet.read_var_uint().unwrap(), 128);
    }

    #[test]
    fn test_string_null_convention() {
        let mut packet = reader_of(|p| {
            p.write_opt_string(None);
            p.write_opt_string(Some(""));
            p.write_opt_string(Some("héllo"));
        });
        assert_eq!(packet.read_opt_string().unwrap(), None);
        assert_eq!(packet.read_opt_string().unwrap(), Some(String::new()));
        assert_eq!(packet.read_opt_string().unwrap(), Some("héllo".to_string()));
    }

    #[test]
    fn test_required_string_rejects_null() {
        let mut packet = reader_of(|p| p.write_opt_string(None));
        assert!(packet.read_string().is_err());
    }

    #[test]
    fn test_opt_bytes_round_trip() {
        let mut packet = reader_of(|p| {
            p.write_opt_bytes(None);
            p.write_opt_bytes(Some(&[1, 2, 3, 4]));
            p.write_opt_bytes(Some(&[]));
        });
        assert_eq!(packet.read_opt_bytes().unwrap(), None);
        assert_eq!(packet.read_opt_bytes().unwrap(), Some(vec![1, 2, 3, 4]));
        assert_eq!(packet.read_opt_bytes().unwrap(), Some(Vec::new()));
    }

    #[test]
    fn test_tagged_value_round_trips() {
        let values = [
            TaggedValue::Null,
            TaggedValue::Int(-42),
            TaggedValue::Float32(2.4),
            TaggedValue::Float64(-0.125),
            TaggedValue::Bool(true),
            TaggedValue::String("value".to_string()),
            TaggedValue::Bytes(vec![1, 2, 3, 4]),
        ];
        let mut packet = reader_of(|p| {
            for value in &values {
                p.write_tagged(value);
            }
        });
        for expected in &values {
            assert_eq!(&packet.read_tagged().unwrap(), expected);
        }
    }

    #[test]
    fn test_truncated_read_fails() {
        let mut packet = reader_of(|p| p.write_u8(7));
        assert!(packet.read_u32().is_err());
    }

    #[test]
    fn test_finalize_patches_length() {
        let mut packet = PacketBuffer::request(Operation::GetString, 9);
        packet.write_string("key");
        packet.finalize();

        let frame = packet.frame();
        let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(declared, frame.len() - FRAME_HEADER_SIZE);
        // op byte, then big-endian request id
        assert_eq!(frame[4], Operation::GetString as u8);
        assert_eq!(&frame[5..9], &9u32.to_be_bytes());
    }

    #[test]
    fn test_response_status_position() {
        let mut packet = PacketBuffer::response(Operation::SetString, 3, Status::Error);
        packet.write_string("boom");
        packet.finalize();

        let frame = packet.frame();
        assert_eq!(frame[9], Status::Error as u8);
    }

    #[test]
    fn test_tagged_map_round_trip() {
        let mut map = HashMap::new();
        map.insert("one".to_string(), TaggedValue::Float32(2.4));
        map.insert("two".to_string(), TaggedValue::Bool(false));
        let mut packet = reader_of(|p| p.write_tagged_map(&map));
        assert_eq!(packet.read_tagged_map().unwrap(), map);
    }
}
