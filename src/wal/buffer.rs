//! Position-tracked cursors over the big-endian byte buffers pgoutput uses
//! for both directions of the replication stream.

use crate::errors::{StreamerError, StreamerResult};

#[derive(Debug)]
pub struct BufferReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> BufferReader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer, position: 0 }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    pub fn has_bytes(&self, count: usize) -> bool {
        self.remaining() >= count
    }

    pub fn read_char(&mut self) -> StreamerResult<char> {
        if !self.has_bytes(1) {
            return Err(StreamerError::protocol("not enough bytes for message type"));
        }
        let value = self.buffer[self.position] as char;
        self.position += 1;
        Ok(value)
    }

    pub fn read_u8(&mut self) -> StreamerResult<u8> {
        if !self.has_bytes(1) {
            return Err(StreamerError::protocol("not enough bytes for u8"));
        }
        let value = self.buffer[self.position];
        self.position += 1;
        Ok(value)
    }

    pub fn read_i8(&mut self) -> StreamerResult<i8> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_i16(&mut self) -> StreamerResult<i16> {
        self.read_array::<2>().map(i16::from_be_bytes)
    }

    pub fn read_u32(&mut self) -> StreamerResult<u32> {
        self.read_array::<4>().map(u32::from_be_bytes)
    }

    pub fn read_i32(&mut self) -> StreamerResult<i32> {
        self.read_array::<4>().map(i32::from_be_bytes)
    }

    pub fn read_u64(&mut self) -> StreamerResult<u64> {
        self.read_array::<8>().map(u64::from_be_bytes)
    }

    pub fn read_i64(&mut self) -> StreamerResult<i64> {
        self.read_array::<8>().map(i64::from_be_bytes)
    }

    fn read_array<const N: usize>(&mut self) -> StreamerResult<[u8; N]> {
        if !self.has_bytes(N) {
            return Err(StreamerError::protocol(format!("not enough bytes: need {N}")));
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buffer[self.position..self.position + N]);
        self.position += N;
        Ok(out)
    }

    pub fn read_null_terminated_string(&mut self) -> StreamerResult<String> {
        let start = self.position;
        while self.position < self.buffer.len() && self.buffer[self.position] != 0 {
            self.position += 1;
        }
        if self.position >= self.buffer.len() {
            return Err(StreamerError::protocol("string not null-terminated"));
        }
        let value = String::from_utf8_lossy(&self.buffer[start..self.position]).into_owned();
        self.position += 1;
        Ok(value)
    }

    pub fn read_bytes(&mut self, count: usize) -> StreamerResult<Vec<u8>> {
        if !self.has_bytes(count) {
            return Err(StreamerError::protocol("not enough bytes for raw read"));
        }
        let bytes = self.buffer[self.position..self.position + count].to_vec();
        self.position += count;
        Ok(bytes)
    }
}

#[derive(Debug)]
pub struct BufferWriter {
    buffer: Vec<u8>,
}

impl BufferWriter {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn write_char(&mut self, value: char) {
        self.buffer.push(value as u8);
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

impl Default for BufferWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_big_endian_integers() {
        let mut reader = BufferReader::new(&[0, 0, 0, 42]);
        assert_eq!(reader.read_u32().unwrap(), 42);
    }

    #[test]
    fn reports_truncation() {
        let mut reader = BufferReader::new(&[0, 0]);
        assert!(reader.read_u32().is_err());
    }

    #[test]
    fn null_terminated_string_round_trip() {
        let mut writer = BufferWriter::new();
        writer.write_bytes(b"hello\0");
        let mut reader = BufferReader::new(&writer.into_bytes());
        assert_eq!(reader.read_null_terminated_string().unwrap(), "hello");
    }
}
