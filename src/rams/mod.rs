//! RAMS: the delta-encoded transport stream sub-protocol.
//!
//! A byte stream interleaves plain TS packets (sync 0x47, 188 bytes) with
//! RAMS packets (two sync bytes, 16-bit length, payload). TS passes
//! through unchanged; RAMS packets go to the interpreter, which
//! reconstructs TS from referenced units and emits it on a scheduled
//! clock.

pub mod clock;
pub mod header;
pub mod interpreter;
pub mod output;
pub mod unit;

pub use interpreter::RamsInterpreter;
pub use unit::{ChunkAllocator, HeapChunkAllocator};

use crate::drm::SharedStreamDecrypt;
use crate::ts::{PacketSinkWithMetaData, StreamMetaData, TS_PACKET_SIZE, TS_SYNC_BYTE};

const RAMS_SYNC_BYTE1: u8 = 0x52;
const RAMS_SYNC_BYTE2: u8 = 0x9A;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SplitterState {
    Ts,
    Rams,
    OutOfSync,
}

/// Splits the ingress byte stream into TS and RAMS packets.
pub struct Rams {
    packet_byte_count: usize,
    rams_packet_length: usize,
    state: SplitterState,
    interpreter: RamsInterpreter,
}

impl Rams {
    pub fn new(allocator: Box<dyn ChunkAllocator>) -> Self {
        Rams {
            packet_byte_count: 0,
            rams_packet_length: 0,
            state: SplitterState::OutOfSync,
            interpreter: RamsInterpreter::new(allocator),
        }
    }

    pub fn reset(&mut self) {
        self.packet_byte_count = 0;
        self.rams_packet_length = 0;
        self.state = SplitterState::OutOfSync;
        self.interpreter.reset();
    }

    pub fn register_stream_decrypt_engine(
        &mut self,
        engine: Option<SharedStreamDecrypt>,
        out: &mut dyn PacketSinkWithMetaData,
    ) {
        self.interpreter.set_stream_decrypt_engine(engine, out);
    }

    pub fn register_chunk_allocator(&mut self, allocator: Box<dyn ChunkAllocator>) {
        self.interpreter.register_chunk_allocator(allocator);
    }

    /// Advance the real-time clock (milliseconds, wrapping). Must be
    /// continuous; called regularly by the pipeline tick and immediately
    /// before each `put`.
    pub fn set_current_time(&mut self, time_ms: u16, out: &mut dyn PacketSinkWithMetaData) {
        self.interpreter.set_current_time(time_ms, out);
    }

    /// Split stream data into TS and RAMS packets; may contain any number
    /// of packets or fragments.
    pub fn put(&mut self, mut data: &[u8], out: &mut dyn PacketSinkWithMetaData) {
        while !data.is_empty() {
            match self.state {
                SplitterState::OutOfSync => {
                    match data
                        .iter()
                        .position(|&b| b == TS_SYNC_BYTE || b == RAMS_SYNC_BYTE1)
                    {
                        Some(n) => {
                            data = &data[n..];
                            self.packet_byte_count = 0;
                            if data[0] == TS_SYNC_BYTE {
                                self.state = SplitterState::Ts;
                                // Signal TS once instead of per packet
                                out.set_meta_data(&StreamMetaData::clear_ts());
                            } else {
                                self.state = SplitterState::Rams;
                                self.rams_packet_length = 0;
                            }
                        }
                        None => return,
                    }
                }

                SplitterState::Ts => {
                    let mut consumed = 0;
                    loop {
                        if self.packet_byte_count == 0 {
                            if consumed >= data.len() {
                                break;
                            }
                            if data[consumed] != TS_SYNC_BYTE {
                                // Possibly the start of a RAMS packet
                                self.state = SplitterState::OutOfSync;
                                break;
                            }
                        }
                        let want = TS_PACKET_SIZE - self.packet_byte_count;
                        let n = want.min(data.len() - consumed);
                        consumed += n;
                        self.packet_byte_count += n;
                        if self.packet_byte_count == TS_PACKET_SIZE {
                            self.packet_byte_count = 0;
                        }
                        if consumed == data.len() {
                            break;
                        }
                    }
                    if consumed > 0 {
                        out.put(&data[..consumed]);
                    }
                    data = &data[consumed..];
                }

                SplitterState::Rams => {
                    let start_flag = self.packet_byte_count == 0;
                    let mut consumed = 0;
                    let mut lost_sync = false;

                    while self.packet_byte_count < 4 && consumed < data.len() {
                        let byte = data[consumed];
                        match self.packet_byte_count {
                            0 => {
                                if byte != RAMS_SYNC_BYTE1 {
                                    lost_sync = true;
                                    break;
                                }
                                self.rams_packet_length = 0;
                            }
                            1 => {
                                if byte != RAMS_SYNC_BYTE2 {
                                    lost_sync = true;
                                    break;
                                }
                            }
                            2 => self.rams_packet_length = (byte as usize) << 8,
                            _ => self.rams_packet_length += byte as usize,
                        }
                        self.packet_byte_count += 1;
                        consumed += 1;
                    }

                    if lost_sync {
                        self.state = SplitterState::OutOfSync;
                        self.packet_byte_count = 0;
                        data = &data[consumed..];
                        continue;
                    }

                    if self.packet_byte_count >= 4 {
                        let total = 4 + self.rams_packet_length;
                        let want = total - self.packet_byte_count;
                        let n = want.min(data.len() - consumed);
                        consumed += n;
                        self.packet_byte_count += n;
                    }

                    let end_flag =
                        self.packet_byte_count >= 4 && self.packet_byte_count == 4 + self.rams_packet_length;

                    if consumed > 0 {
                        self.interpreter
                            .parse(&data[..consumed], start_flag, end_flag, out);
                    }
                    if end_flag {
                        self.packet_byte_count = 0;
                        self.rams_packet_length = 0;
                    }
                    data = &data[consumed..];
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts::PacketSink;

    #[derive(Default)]
    struct CaptureSink {
        data: Vec<u8>,
        metas: Vec<StreamMetaData>,
    }

    impl PacketSink for CaptureSink {
        fn put(&mut self, data: &[u8]) {
            self.data.extend_from_slice(data);
        }
    }

    impl PacketSinkWithMetaData for CaptureSink {
        fn set_meta_data(&mut self, meta: &StreamMetaData) {
            self.metas.push(*meta);
        }
    }

    fn rams() -> Rams {
        Rams::new(Box::new(HeapChunkAllocator::new(256)))
    }

    fn ts_packet(fill: u8) -> Vec<u8> {
        let mut packet = vec![fill; TS_PACKET_SIZE];
        packet[0] = TS_SYNC_BYTE;
        packet
    }

    /// Empty RAMS packet (header only, no commands, no payload).
    fn empty_rams_packet(clock: u16) -> Vec<u8> {
        vec![
            RAMS_SYNC_BYTE1,
            RAMS_SYNC_BYTE2,
            0x00,
            0x08, // packet length: 12-byte header minus the 4 prefix bytes
            0x00,
            0x00,
            0x05, // header extension 5 -> header length 12
            0x00, // payload_unit_offset
            (clock >> 8) as u8,
            clock as u8,
            0x00, // payload id/type
            0x00, // no commands
        ]
    }

    #[test]
    fn ts_packets_pass_through() {
        let mut splitter = rams();
        let mut out = CaptureSink::default();
        let a = ts_packet(0x11);
        let b = ts_packet(0x22);
        let mut stream = a.clone();
        stream.extend_from_slice(&b);

        splitter.put(&stream, &mut out);
        assert_eq!(out.data.len(), 2 * TS_PACKET_SIZE);
        assert_eq!(out.metas, vec![StreamMetaData::clear_ts()]);
    }

    #[test]
    fn rams_packet_between_ts_packets() {
        let mut splitter = rams();
        let mut out = CaptureSink::default();

        let mut stream = ts_packet(0x11);
        stream.extend_from_slice(&empty_rams_packet(7));
        stream.extend_from_slice(&ts_packet(0x22));

        splitter.put(&stream, &mut out);
        // Both TS packets pass; the RAMS packet is consumed silently
        assert_eq!(out.data.len(), 2 * TS_PACKET_SIZE);
    }

    #[test]
    fn garbage_is_skipped_until_sync() {
        let mut splitter = rams();
        let mut out = CaptureSink::default();

        let mut stream = vec![0x00, 0x01, 0x02];
        stream.extend_from_slice(&ts_packet(0x33));
        splitter.put(&stream, &mut out);
        assert_eq!(out.data.len(), TS_PACKET_SIZE);
    }

    #[test]
    fn fragmented_delivery_reassembles() {
        let mut splitter = rams();
        let mut out = CaptureSink::default();

        let mut stream = ts_packet(0x44);
        stream.extend_from_slice(&empty_rams_packet(3));
        stream.extend_from_slice(&ts_packet(0x55));

        for chunk in stream.chunks(7) {
            splitter.put(chunk, &mut out);
        }
        assert_eq!(out.data.len(), 2 * TS_PACKET_SIZE);
    }
}
