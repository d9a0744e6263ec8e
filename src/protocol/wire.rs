//! RFB-TV wire message container.
//!
//! Handles the big-endian, length-prefixed framing shared by all RFB-TV
//! messages: sequential typed writers, symmetric readers behind a single
//! cursor, and an underflow latch that lets parsers run to completion and
//! check for truncation once.

use std::collections::BTreeMap;

/// Ordered byte container with sequential typed readers and writers.
///
/// Readers never panic on short input; they latch the underflow flag and
/// return a neutral value instead. The flag is cleared by `clear`, `rewind`
/// or `discard_bytes_read`.
#[derive(Debug, Default, Clone)]
pub struct WireBuffer {
    data: Vec<u8>,
    bytes_read: usize,
    underflow: bool,
}

impl WireBuffer {
    pub fn new() -> Self {
        WireBuffer::default()
    }

    /// Drop all contents and reset the cursor and underflow latch.
    pub fn clear(&mut self) {
        self.data.clear();
        self.bytes_read = 0;
        self.underflow = false;
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_read(&self) -> usize {
        self.bytes_read
    }

    /// Rewind the read cursor to the start of the buffer.
    pub fn rewind(&mut self) {
        self.bytes_read = 0;
        self.underflow = false;
    }

    /// Drop the prefix already consumed so the remainder can be reparsed
    /// after more bytes arrive.
    pub fn discard_bytes_read(&mut self) {
        self.data.drain(..self.bytes_read);
        self.bytes_read = 0;
        self.underflow = false;
    }

    pub fn has_underflow(&self) -> bool {
        self.underflow
    }

    //
    // Writers. These never fail.
    //

    pub fn write_u8(&mut self, v: u8) {
        self.data.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_raw(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
    }

    /// Binary data preceded by a 32-bit length field.
    pub fn write_blob(&mut self, data: &[u8]) {
        self.write_u32(data.len() as u32);
        self.write_raw(data);
    }

    /// String preceded by a 16-bit length field.
    pub fn write_string(&mut self, s: &str) {
        self.write_u16(s.len() as u16);
        self.write_raw(s.as_bytes());
    }

    /// Two consecutive strings.
    pub fn write_key_value_pair(&mut self, key: &str, value: &str) {
        self.write_string(key);
        self.write_string(value);
    }

    /// 8-bit pair count followed by the pairs.
    pub fn write_key_value_pairs(&mut self, pairs: &BTreeMap<String, String>) {
        self.write_u8(pairs.len() as u8);
        for (key, value) in pairs {
            self.write_string(key);
            self.write_string(value);
        }
    }

    //
    // Readers. On insufficient bytes they latch the underflow flag and
    // return a neutral value.
    //

    fn take(&mut self, n: usize) -> Option<&[u8]> {
        if self.underflow || self.bytes_read + n > self.data.len() {
            self.underflow = true;
            return None;
        }
        let slice = &self.data[self.bytes_read..self.bytes_read + n];
        self.bytes_read += n;
        Some(slice)
    }

    pub fn read_u8(&mut self) -> u8 {
        match self.take(1) {
            Some(bytes) => bytes[0],
            None => 0,
        }
    }

    pub fn read_u16(&mut self) -> u16 {
        match self.take(2) {
            Some(bytes) => u16::from_be_bytes([bytes[0], bytes[1]]),
            None => 0,
        }
    }

    pub fn read_u32(&mut self) -> u32 {
        match self.take(4) {
            Some(bytes) => u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            None => 0,
        }
    }

    pub fn read_u64(&mut self) -> u64 {
        match self.take(8) {
            Some(bytes) => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(bytes);
                u64::from_be_bytes(buf)
            }
            None => 0,
        }
    }

    pub fn read_raw(&mut self, n: usize) -> Vec<u8> {
        match self.take(n) {
            Some(bytes) => bytes.to_vec(),
            None => Vec::new(),
        }
    }

    pub fn read_raw_as_string(&mut self, n: usize) -> String {
        match self.take(n) {
            Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            None => String::new(),
        }
    }

    pub fn read_blob(&mut self) -> Vec<u8> {
        let length = self.read_u32() as usize;
        self.read_raw(length)
    }

    pub fn read_string(&mut self) -> String {
        let length = self.read_u16() as usize;
        self.read_raw_as_string(length)
    }

    pub fn read_key_value_pairs(&mut self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();

        let nr_pairs = self.read_u8();
        if self.underflow {
            return map;
        }

        for _ in 0..nr_pairs {
            let key = self.read_string();
            if self.underflow {
                break;
            }
            let value = self.read_string();
            if self.underflow {
                break;
            }
            map.insert(key, value);
        }

        map
    }

    /// Unchecked indexed access, used only to patch length fields.
    pub fn patch_u8(&mut self, index: usize, value: u8) {
        self.data[index] = value;
    }
}
