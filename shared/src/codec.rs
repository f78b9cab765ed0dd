//! Low level wire encoding.
//!
//! Counts, ids and lengths are LEB128 varints, signed tile coordinates use
//! zig-zag varints, world coordinates are ×512 fixed point. Fixed-width
//! integers are little-endian.

use crate::error::DecodeError;
use crate::math::Vector2f;
use std::f32::consts::TAU;

pub const FIXED_POINT_SCALE: f32 = 512.0;

pub fn to_fixed(value: f32) -> i32 {
    (value * FIXED_POINT_SCALE) as i32
}

pub fn from_fixed(value: i32) -> f32 {
    value as f32 / FIXED_POINT_SCALE
}

pub fn to_fixed_i16(value: f32) -> i16 {
    (value * FIXED_POINT_SCALE) as i16
}

pub fn from_fixed_i16(value: i16) -> f32 {
    value as f32 / FIXED_POINT_SCALE
}

/// Maps an angle in radians onto `0..=255`.
pub fn rotation_to_byte(radians: f32) -> u8 {
    (radians.rem_euclid(TAU) * 255.0 / TAU) as u8
}

pub fn byte_to_rotation(value: u8) -> f32 {
    value as f32 * TAU / 255.0
}

fn zigzag_encode(value: i32) -> u32 {
    ((value << 1) ^ (value >> 31)) as u32
}

fn zigzag_decode(value: u32) -> i32 {
    ((value >> 1) as i32) ^ -((value & 1) as i32)
}

/// Growable output buffer for packet payloads.
#[derive(Debug, Default, Clone)]
pub struct PacketWriter {
    buf: Vec<u8>,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(value as u8);
    }

    pub fn write_i16(&mut self, value: i16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_f32(&mut self, value: f32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_var_u64(&mut self, mut value: u64) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.buf.push(byte);
                return;
            }
            self.buf.push(byte | 0x80);
        }
    }

    pub fn write_var_u32(&mut self, value: u32) {
        self.write_var_u64(value as u64);
    }

    pub fn write_var_i32(&mut self, value: i32) {
        self.write_var_u32(zigzag_encode(value));
    }

    /// Position as two ×512 fixed-point `i32`.
    pub fn write_position(&mut self, pos: Vector2f) {
        self.write_i32(to_fixed(pos.x));
        self.write_i32(to_fixed(pos.y));
    }

    /// Speed as two ×512 fixed-point `i16`.
    pub fn write_speed(&mut self, speed: Vector2f) {
        self.write_i16(to_fixed_i16(speed.x));
        self.write_i16(to_fixed_i16(speed.y));
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Varint length followed by the raw bytes.
    pub fn write_len_prefixed(&mut self, bytes: &[u8]) {
        self.write_var_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_str(&mut self, value: &str) {
        self.write_len_prefixed(value.as_bytes());
    }
}

/// Bounds-checked cursor over a received payload.
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if len > self.remaining() {
            return Err(DecodeError::UnexpectedEnd);
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, DecodeError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_i16(&mut self) -> Result<i16, DecodeError> {
        Ok(i16::from_le_bytes(self.take_array()?))
    }

    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.take_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32, DecodeError> {
        Ok(f32::from_le_bytes(self.take_array()?))
    }

    pub fn read_var_u64(&mut self) -> Result<u64, DecodeError> {
        let mut result = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift == 63 && byte > 1 {
                return Err(DecodeError::VarintOverflow(64));
            }
            result |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
            if shift > 63 {
                return Err(DecodeError::VarintOverflow(64));
            }
        }
    }

    pub fn read_var_u32(&mut self) -> Result<u32, DecodeError> {
        let value = self.read_var_u64()?;
        u32::try_from(value).map_err(|_| DecodeError::VarintOverflow(32))
    }

    pub fn read_var_i32(&mut self) -> Result<i32, DecodeError> {
        Ok(zigzag_decode(self.read_var_u32()?))
    }

    pub fn read_position(&mut self) -> Result<Vector2f, DecodeError> {
        let x = from_fixed(self.read_i32()?);
        let y = from_fixed(self.read_i32()?);
        Ok(Vector2f::new(x, y))
    }

    pub fn read_speed(&mut self) -> Result<Vector2f, DecodeError> {
        let x = from_fixed_i16(self.read_i16()?);
        let y = from_fixed_i16(self.read_i16()?);
        Ok(Vector2f::new(x, y))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        self.take(len)
    }

    /// Reads a varint length and the bytes it announces. The length is
    /// checked against `[min, max]` and against the remaining buffer before
    /// anything is consumed past the prefix.
    pub fn read_len_prefixed(&mut self, min: usize, max: usize) -> Result<&'a [u8], DecodeError> {
        let len = self.read_var_u32()? as usize;
        if len < min || len > max {
            return Err(DecodeError::LengthOutOfRange { len, min, max });
        }
        if len > self.remaining() {
            return Err(DecodeError::UnexpectedEnd);
        }
        self.take(len)
    }

    pub fn read_string(&mut self, min: usize, max: usize) -> Result<String, DecodeError> {
        let bytes = self.read_len_prefixed(min, max)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidUtf8)
    }

    /// Everything not consumed yet.
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos..];
        self.pos = self.data.len();
        slice
    }
}
