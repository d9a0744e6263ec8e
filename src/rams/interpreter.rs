//! RAMS command interpreter.
//!
//! Decodes the delta-encoded TS superset: payload routed into indexed
//! units by LABEL commands, DELETE recycling, KEY_INFO handover to the
//! stream-decrypt engine, OUTPUT scheduling against the RAMS clock and
//! RESET semantics that depend on the command's position in the list.

use super::clock::RamsClock;
use super::header::{Command, RamsHeader, RamsHeaderPool};
use super::output::{OutputAction, PatchAction, RamsOutput};
use super::unit::{ChunkAllocator, RamsUnitStore};
use crate::drm::SharedStreamDecrypt;
use crate::ts::{PacketSinkWithMetaData, StreamMetaData, TS_PACKET_SIZE};
use crate::utils::bits::BitReader;

use log::{error, warn};

use std::collections::VecDeque;

pub const COMMAND_RESET: u8 = 0;
pub const COMMAND_LABEL: u8 = 1;
pub const COMMAND_DELETE: u8 = 2;
pub const COMMAND_KEY_INFO: u8 = 3;
pub const COMMAND_OUTPUT: u8 = 4;

const PAYLOAD_TYPE_RA_ECB_TS: u8 = 1;
const MAX_NUM_PACKET_HANDLERS: usize = 16;

const PATCH_ACTION_TO_BYTE_COUNT: [usize; 8] = [0, 1, 2, 3, 4, 6, 8, 16];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    ParsingHeader,
    ParsingPayload,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandlerState {
    Initial,
    ProcessingCommands,
    Finished,
}

#[derive(Debug, Clone, Copy)]
struct Label {
    unit_id: u16,
    byte_count: u32,
}

/// Per-payload-id command processor; keeps label routing state across
/// payload fragments of one packet.
struct RamsPacketHandler {
    state: HandlerState,
    labels: Vec<Label>,
    label_index: usize,
}

impl RamsPacketHandler {
    fn new() -> Self {
        RamsPacketHandler {
            state: HandlerState::Initial,
            labels: Vec::new(),
            label_index: 0,
        }
    }

    /// `payload` may be the whole payload or a fragment of it.
    #[allow(clippy::too_many_arguments)]
    fn process_payload(
        &mut self,
        header: &mut RamsHeader,
        payload: &[u8],
        end: bool,
        meta_data: StreamMetaData,
        store: &mut RamsUnitStore,
        output: &mut RamsOutput,
        out: &mut dyn PacketSinkWithMetaData,
    ) {
        // No LABEL command: the payload passes through unmodified
        if !header.has_label_command() && !payload.is_empty() {
            out.set_meta_data(&meta_data);
            out.put(payload);
        }

        if self.state != HandlerState::Finished {
            self.process(header, payload, end, store, output, out);
        }

        if end {
            self.labels.clear();
            self.label_index = 0;
            self.state = HandlerState::Initial;
        }
    }

    fn process(
        &mut self,
        header: &mut RamsHeader,
        mut payload: &[u8],
        end: bool,
        store: &mut RamsUnitStore,
        output: &mut RamsOutput,
        out: &mut dyn PacketSinkWithMetaData,
    ) {
        if self.state == HandlerState::Initial {
            header.first_command();
            self.state = HandlerState::ProcessingCommands;
        }

        let mut label_seen = false;
        while let Some(command) = header.next_command() {
            match command.code {
                // Handled by the interpreter
                COMMAND_RESET | COMMAND_KEY_INFO => {}

                COMMAND_LABEL => {
                    if label_seen {
                        error!("Multiple LABEL commands in same RAMS packet, ignoring");
                        continue;
                    }
                    label_seen = true;

                    if self.labels.is_empty() {
                        let offset = header.payload_unit_offset();
                        self.parse_label_data(offset, header.command_data(&command));
                        self.label_index = 0;
                    }

                    // A single zero-count label routes the whole payload
                    if self.labels.len() == 1 && self.labels[0].byte_count == 0 {
                        if !payload.is_empty() {
                            store.add_bytes(self.labels[0].unit_id as usize, payload);
                            payload = &[];
                        }
                        if !end {
                            // More payload is needed to finish this command
                            header.revert_command(&command);
                            return;
                        }
                        continue;
                    }

                    while self.label_index < self.labels.len() && !payload.is_empty() {
                        let label = &mut self.labels[self.label_index];
                        let n = (label.byte_count as usize).min(payload.len());
                        store.add_bytes(label.unit_id as usize, &payload[..n]);
                        payload = &payload[n..];
                        label.byte_count -= n as u32;
                        if label.byte_count == 0 {
                            self.label_index += 1;
                        }
                    }

                    if self.label_index < self.labels.len() && !end {
                        header.revert_command(&command);
                        return;
                    }
                }

                COMMAND_DELETE => {
                    let data = header.command_data(&command);
                    // 12-bit unit ids, two per three bytes
                    let num_ids = data.len() * 2 / 3;
                    let mut bits = BitReader::new(data);
                    for _ in 0..num_ids {
                        let unit_id = bits.read(12) as usize;
                        store.delete_unit(unit_id);
                    }
                }

                COMMAND_OUTPUT => {
                    Self::process_output_command(header, &command, store, output, out);
                }

                other => {
                    error!("Unrecognized RAMS command (code={})", other);
                }
            }
        }

        self.state = HandlerState::Finished;
    }

    fn process_output_command(
        header: &RamsHeader,
        command: &Command,
        store: &mut RamsUnitStore,
        output: &mut RamsOutput,
        out: &mut dyn PacketSinkWithMetaData,
    ) {
        let data = header.command_data(command);
        let mut scheduled_time = header.clock_reference();
        let mut index = 0;

        while index < data.len() {
            if index + 2 > data.len() {
                error!("RAMS OUTPUT command underflow");
                break;
            }

            let patch_flag = data[index] & 0x80 != 0;
            let clock_delta_flag = data[index] & 0x40 != 0;
            let unit_id = (((data[index] & 0x0F) as u16) << 8) | data[index + 1] as u16;
            index += 2;

            if clock_delta_flag {
                if index + 2 > data.len() {
                    error!("RAMS OUTPUT command underflow");
                    break;
                }
                scheduled_time = scheduled_time
                    .wrapping_add(((data[index] as u16) << 8) | data[index + 1] as u16);
                index += 2;
            }

            let mut patches = Vec::new();
            if patch_flag {
                if index + 1 > data.len() {
                    error!("RAMS OUTPUT command underflow");
                    break;
                }
                let patch_length = data[index] as usize;
                index += 1;
                let patch_end = index + patch_length;
                if patch_end > data.len() {
                    error!("RAMS OUTPUT command underflow");
                    break;
                }

                let mut patch_byte_index: u32 = 0;
                while index < patch_end {
                    if index + 2 > patch_end {
                        error!("RAMS OUTPUT patch command underflow");
                        break;
                    }
                    let action = data[index + 1] & 0x0F;
                    patch_byte_index += ((data[index] as u32) << 4)
                        | (((data[index + 1] & 0xF0) as u32) >> 4);
                    let byte_count = match PATCH_ACTION_TO_BYTE_COUNT.get(action as usize) {
                        Some(&n) => n,
                        None => {
                            error!("Action value out of range (action={})", action);
                            0
                        }
                    };
                    index += 2;
                    if index + byte_count > patch_end {
                        error!("RAMS OUTPUT patch command underflow");
                        break;
                    }
                    patches.push(PatchAction {
                        offset: patch_byte_index,
                        patch: data[index..index + byte_count].to_vec(),
                    });
                    index += byte_count;
                }
                index = patch_end;
            }

            let action = OutputAction {
                unit_id,
                clock: scheduled_time,
                patches,
                meta_data: StreamMetaData::clear_ts_with_id(header.payload_id()),
            };

            // An output scheduled NOW is emitted immediately; it might be
            // deleted right after if it were queued
            if scheduled_time == header.clock_reference() {
                RamsOutput::output_unit(&action, store, out);
            } else {
                output.add_output_action(action);
            }
        }
    }

    /// Each 2-byte entry: 4-bit packet count, 12-bit unit id. Consecutive
    /// identical ids merge; the first label is reduced by the payload
    /// unit offset.
    fn parse_label_data(&mut self, payload_unit_offset: u8, data: &[u8]) {
        let num_ids = data.len() / 2;
        for n in 0..num_ids {
            let count = (data[n * 2] & 0xF0) >> 4;
            let unit_id = (((data[n * 2] & 0x0F) as u16) << 8) | data[n * 2 + 1] as u16;
            let byte_count = count as u32 * TS_PACKET_SIZE as u32;

            match self.labels.last_mut() {
                Some(last) if last.unit_id == unit_id => last.byte_count += byte_count,
                _ => self.labels.push(Label {
                    unit_id,
                    byte_count,
                }),
            }
        }

        if payload_unit_offset > 0 {
            if let Some(first) = self.labels.first_mut() {
                if first.byte_count >= payload_unit_offset as u32 {
                    first.byte_count -= payload_unit_offset as u32;
                }
            }
        }
    }
}

/// Main RAMS command interpreter; owns the unit store, clock, header pool
/// and scheduled output.
pub struct RamsInterpreter {
    is_key_info_set: bool,
    parser_state: ParserState,
    current_header: Option<usize>,
    decryption_list: VecDeque<usize>,
    decrypt_engine: Option<SharedStreamDecrypt>,
    handlers: Vec<Option<RamsPacketHandler>>,

    store: RamsUnitStore,
    pool: RamsHeaderPool,
    output: RamsOutput,
    clock: RamsClock,
}

impl RamsInterpreter {
    pub fn new(allocator: Box<dyn ChunkAllocator>) -> Self {
        let mut handlers = Vec::with_capacity(MAX_NUM_PACKET_HANDLERS);
        handlers.resize_with(MAX_NUM_PACKET_HANDLERS, || None);
        RamsInterpreter {
            is_key_info_set: false,
            parser_state: ParserState::ParsingHeader,
            current_header: None,
            decryption_list: VecDeque::new(),
            decrypt_engine: None,
            handlers,
            store: RamsUnitStore::new(allocator),
            pool: RamsHeaderPool::default(),
            output: RamsOutput::new(),
            clock: RamsClock::new(),
        }
    }

    pub fn reset(&mut self) {
        while let Some(id) = self.decryption_list.pop_front() {
            self.pool.release(id);
        }
        self.is_key_info_set = false;
        self.reset_current_parsing_state();
        self.store.reset();
        self.output.reset();
        self.clock.reset();
    }

    pub fn register_chunk_allocator(&mut self, allocator: Box<dyn ChunkAllocator>) {
        self.store.register_chunk_allocator(allocator);
    }

    pub fn set_stream_decrypt_engine(
        &mut self,
        engine: Option<SharedStreamDecrypt>,
        out: &mut dyn PacketSinkWithMetaData,
    ) {
        match (&engine, &self.decrypt_engine) {
            (Some(new), Some(old)) if std::sync::Arc::ptr_eq(new, old) => return,
            (None, None) => return,
            _ => {}
        }
        self.cleanup_stream_decryption(out);
        self.decrypt_engine = engine;
    }

    /// Advance the real-time clock; drains any due scheduled output.
    pub fn set_current_time(&mut self, time_ms: u16, out: &mut dyn PacketSinkWithMetaData) {
        let current = self.clock.set_current_time(time_ms);
        self.output
            .output_all_units_until(current, &mut self.store, out);
    }

    fn reset_current_parsing_state(&mut self) {
        if let Some(id) = self.current_header.take() {
            self.pool.release(id);
        }
        self.parser_state = ParserState::ParsingHeader;
    }

    /// Parse (a fragment of) one RAMS packet. `data` never spans two
    /// packets; `start` marks the first fragment, `end` the last.
    pub fn parse(
        &mut self,
        mut data: &[u8],
        start: bool,
        end: bool,
        out: &mut dyn PacketSinkWithMetaData,
    ) {
        if start {
            self.reset_current_parsing_state();
            self.current_header = Some(self.pool.acquire());
        }

        let header_id = match self.current_header {
            Some(id) => id,
            None => return, // Fragment without a preceding start
        };

        if self.parser_state == ParserState::ParsingHeader
            && self.pool.get_mut(header_id).add_bytes(&mut data)
        {
            self.parser_state = ParserState::ParsingPayload;
            self.process_header_commands(header_id);

            // Synchronize the clock; this also drains scheduled output
            let clock_reference = self.pool.get(header_id).clock_reference();
            let current = self.clock.synchronize(clock_reference);
            self.output
                .output_all_units_until(current, &mut self.store, out);

            let header = self.pool.get(header_id);
            let payload_id = header.payload_id() as usize;
            if self.handlers[payload_id].is_none() {
                self.handlers[payload_id] = Some(RamsPacketHandler::new());
            }

            // Encrypted packets join the pending decryption list
            if header.payload_type() == PAYLOAD_TYPE_RA_ECB_TS
                && header.payload_length() > 0
                && self.is_key_info_set
            {
                self.pool.add_ref(header_id);
                self.decryption_list.push_back(header_id);
            }
        }

        if self.parser_state == ParserState::ParsingPayload {
            if end {
                self.pool.get_mut(header_id).set_end_flag();
            }

            let header = self.pool.get(header_id);
            if header.payload_type() == PAYLOAD_TYPE_RA_ECB_TS {
                if !data.is_empty() && header.payload_length() > 0 && self.is_key_info_set {
                    self.pool
                        .get_mut(header_id)
                        .add_received_bytes(data.len() as u32);

                    // A set key implies a registered engine
                    if let Some(engine) = self.decrypt_engine.clone() {
                        let accepted = engine.lock().stream_data(data);
                        if !accepted {
                            error!("Decryption failed (size={})", data.len());
                            // Out of sync with the decryptor: drop everything
                            // pending rather than mismatch headers and data
                            self.cleanup_stream_decryption(out);
                        } else {
                            let decrypted = engine.lock().take_decrypted();
                            if !decrypted.is_empty() {
                                self.put_decrypted(&decrypted, out);
                            }
                        }
                    }
                }
            } else {
                let payload_id = self.pool.get(header_id).payload_id() as usize;
                let mut handler = self.handlers[payload_id]
                    .take()
                    .unwrap_or_else(RamsPacketHandler::new);
                handler.process_payload(
                    self.pool.get_mut(header_id),
                    data,
                    end,
                    StreamMetaData::clear_ts_with_id(payload_id as u8),
                    &mut self.store,
                    &mut self.output,
                    out,
                );
                self.handlers[payload_id] = Some(handler);
            }
        }

        if end {
            if self.pool.get(header_id).has_reset_as_last_command() {
                // RESET as the last command resets after the packet, so
                // the next packet's clock becomes an initial clock
                self.clock.reset();
                self.store.reset();
                self.output.reset();
            }
            self.parser_state = ParserState::Complete;
        }
    }

    fn process_header_commands(&mut self, header_id: usize) {
        let mut is_first_command = true;
        let mut is_reset_as_last = false;

        // Collect OUTPUT pre-scan info without holding the header borrow
        self.pool.get_mut(header_id).first_command();
        loop {
            let command = match self.pool.get_mut(header_id).next_command() {
                Some(command) => command,
                None => break,
            };
            // Any command after a RESET means that RESET was not last
            let was_reset = command.code == COMMAND_RESET;

            match command.code {
                COMMAND_KEY_INFO => {
                    let header = self.pool.get(header_id);
                    let data = header.command_data(&command);
                    if data.len() != 32 {
                        warn!("Illegal KEY_INFO command length: {}", data.len());
                    } else if let Some(engine) = &self.decrypt_engine {
                        let mut key_id = [0u8; 16];
                        let mut iv = [0u8; 16];
                        key_id.copy_from_slice(&data[..16]);
                        iv.copy_from_slice(&data[16..]);
                        let mut engine = engine.lock();
                        engine.set_key_identifier(&key_id);
                        engine.set_initialization_vector(&iv);
                        // Marks both valid KEY_INFO and a successful handover
                        self.is_key_info_set = true;
                    }
                }

                COMMAND_LABEL => {
                    self.pool.get_mut(header_id).set_label_command();
                }

                COMMAND_RESET => {
                    if is_first_command {
                        // RESET first: reset immediately so the current
                        // clock reference becomes an initial clock
                        self.clock.reset();
                        self.store.reset();
                        self.output.reset();
                    }
                }

                COMMAND_OUTPUT => {
                    // The first OUTPUT entry replaces all resident actions
                    // scheduled at its time or later
                    let header = self.pool.get(header_id);
                    let data = header.command_data(&command);
                    if data.len() >= 2 {
                        let mut scheduled_time = header.clock_reference();
                        let clock_delta_flag = data[0] & 0x40 != 0;
                        if clock_delta_flag {
                            if data.len() < 4 {
                                error!("RAMS OUTPUT command underflow");
                                continue;
                            }
                            scheduled_time = scheduled_time
                                .wrapping_add(((data[2] as u16) << 8) | data[3] as u16);
                        }
                        self.output.delete_succeeding_actions(scheduled_time);
                    }
                }

                _ => {}
            }

            is_reset_as_last = was_reset;
            is_first_command = false;
        }

        if is_reset_as_last {
            self.pool.get_mut(header_id).set_reset_as_last_command();
        }
    }

    /// Back-path for decrypted bytes: match them to pending headers in
    /// arrival order and hand them to the packet handlers.
    fn put_decrypted(&mut self, mut data: &[u8], out: &mut dyn PacketSinkWithMetaData) {
        while !data.is_empty() {
            let header_id = match self.decryption_list.front() {
                Some(&id) => id,
                None => break,
            };
            let (outstanding, payload_id) = {
                let header = self.pool.get(header_id);
                (
                    header.received_bytes() - header.decrypted_bytes(),
                    header.payload_id() as usize,
                )
            };

            let n = (outstanding as usize).min(data.len());
            self.pool.get_mut(header_id).add_decrypted_bytes(n as u32);
            let end = self.pool.get(header_id).is_complete();

            let mut handler = self.handlers[payload_id]
                .take()
                .unwrap_or_else(RamsPacketHandler::new);
            handler.process_payload(
                self.pool.get_mut(header_id),
                &data[..n],
                end,
                StreamMetaData::clear_ts_with_id(payload_id as u8),
                &mut self.store,
                &mut self.output,
                out,
            );
            self.handlers[payload_id] = Some(handler);

            data = &data[n..];

            if end {
                self.decryption_list.pop_front();
                self.pool.release(header_id);
            } else if n == 0 {
                error!(
                    "Unexpected decrypted data received: {} bytes left over",
                    data.len()
                );
                break;
            }
        }
    }

    /// A decrypt failure (or engine change) invalidates the key info and
    /// all pending encrypted packets wholesale.
    fn cleanup_stream_decryption(&mut self, out: &mut dyn PacketSinkWithMetaData) {
        self.is_key_info_set = false;

        while let Some(header_id) = self.decryption_list.pop_front() {
            if self.pool.get(header_id).is_complete() {
                let payload_id = self.pool.get(header_id).payload_id() as usize;
                let mut handler = self.handlers[payload_id]
                    .take()
                    .unwrap_or_else(RamsPacketHandler::new);
                handler.process_payload(
                    self.pool.get_mut(header_id),
                    &[],
                    true,
                    StreamMetaData::default(),
                    &mut self.store,
                    &mut self.output,
                    out,
                );
                self.handlers[payload_id] = Some(handler);
            }
            self.pool.release(header_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rams::unit::HeapChunkAllocator;
    use crate::ts::PacketSink;

    #[derive(Default)]
    struct CaptureSink {
        data: Vec<u8>,
    }

    impl PacketSink for CaptureSink {
        fn put(&mut self, data: &[u8]) {
            self.data.extend_from_slice(data);
        }
    }

    impl PacketSinkWithMetaData for CaptureSink {
        fn set_meta_data(&mut self, _meta: &StreamMetaData) {}
    }

    fn interpreter() -> RamsInterpreter {
        RamsInterpreter::new(Box::new(HeapChunkAllocator::new(256)))
    }

    /// Complete RAMS packet with the given commands and payload.
    fn rams_packet(
        payload_id: u8,
        payload_type: u8,
        clock: u16,
        payload_unit_offset: u8,
        commands: &[(u8, Vec<u8>)],
        payload: &[u8],
    ) -> Vec<u8> {
        let commands_len: usize = commands.iter().map(|(_, d)| 2 + d.len()).sum();
        let header_len = 12 + commands_len;
        let extension = header_len - 7;

        let mut buf = Vec::new();
        buf.push(0x52);
        buf.push(0x9A);
        let packet_length = (header_len + payload.len() - 4) as u16;
        buf.push((packet_length >> 8) as u8);
        buf.push(packet_length as u8);
        buf.push(0);
        buf.push((extension >> 8) as u8 & 0x03);
        buf.push(extension as u8);
        buf.push(payload_unit_offset);
        buf.push((clock >> 8) as u8);
        buf.push(clock as u8);
        buf.push((payload_id << 4) | (payload_type & 0x0F));
        buf.push(commands.len() as u8);
        for (code, data) in commands {
            buf.push(*code);
            buf.push(data.len() as u8);
            buf.extend_from_slice(data);
        }
        buf.extend_from_slice(payload);
        buf
    }

    fn label_entry(count: u8, unit_id: u16) -> Vec<u8> {
        vec![(count << 4) | ((unit_id >> 8) as u8 & 0x0F), unit_id as u8]
    }

    #[test]
    fn payload_without_labels_passes_through() {
        let mut rams = interpreter();
        let mut out = CaptureSink::default();
        let payload = [0x47u8; 188];
        let packet = rams_packet(0, 0, 0, 0, &[], &payload);
        rams.parse(&packet, true, true, &mut out);
        assert_eq!(out.data, payload);
    }

    #[test]
    fn label_routes_payload_into_unit_and_output_emits_it() {
        let mut rams = interpreter();
        let mut out = CaptureSink::default();

        // One TS packet's worth of payload into unit 5
        let payload = vec![0xAB; TS_PACKET_SIZE];
        let packet = rams_packet(
            0,
            0,
            100,
            0,
            &[(COMMAND_LABEL, label_entry(1, 5))],
            &payload,
        );
        rams.parse(&packet, true, true, &mut out);
        assert!(out.data.is_empty()); // Routed, not passed through

        // OUTPUT the unit immediately (scheduled time == packet clock)
        let output_cmd = vec![0x00 | ((5 >> 8) as u8 & 0x0F), 5u8];
        let packet = rams_packet(0, 0, 100, 0, &[(COMMAND_OUTPUT, output_cmd)], &[]);
        rams.parse(&packet, true, true, &mut out);
        assert_eq!(out.data, payload);
    }

    #[test]
    fn scheduled_output_waits_for_clock_advance() {
        let mut rams = interpreter();
        let mut out = CaptureSink::default();

        let payload = vec![0xCD; TS_PACKET_SIZE];
        let packet = rams_packet(
            0,
            0,
            100,
            0,
            &[(COMMAND_LABEL, label_entry(1, 9))],
            &payload,
        );
        rams.parse(&packet, true, true, &mut out);

        // Schedule unit 9 at clock + 50
        let output_cmd = vec![0x40 | ((9u16 >> 8) as u8 & 0x0F), 9u8, 0x00, 50];
        let packet = rams_packet(0, 0, 100, 0, &[(COMMAND_OUTPUT, output_cmd)], &[]);
        rams.parse(&packet, true, true, &mut out);
        assert!(out.data.is_empty());

        // Advance the local clock past the scheduled time; account for the
        // 1-in-512 slowdown by overshooting
        rams.set_current_time(0, &mut out);
        rams.set_current_time(60, &mut out);
        assert_eq!(out.data, payload);
    }

    #[test]
    fn delete_recycles_units() {
        let mut rams = interpreter();
        let mut out = CaptureSink::default();

        let payload = vec![1u8; TS_PACKET_SIZE];
        let packet = rams_packet(0, 0, 0, 0, &[(COMMAND_LABEL, label_entry(1, 2))], &payload);
        rams.parse(&packet, true, true, &mut out);

        // DELETE unit 2 (12-bit ids packed two per three bytes)
        let delete_cmd = vec![0x00, 0x20, 0x00]; // ids 2 and 0
        let packet = rams_packet(0, 0, 0, 0, &[(COMMAND_DELETE, delete_cmd)], &[]);
        rams.parse(&packet, true, true, &mut out);

        // OUTPUT of the deleted unit yields nothing
        let output_cmd = vec![0x00, 0x02];
        let packet = rams_packet(0, 0, 0, 0, &[(COMMAND_OUTPUT, output_cmd)], &[]);
        rams.parse(&packet, true, true, &mut out);
        assert!(out.data.is_empty());
    }

    #[test]
    fn reset_as_first_command_takes_effect_immediately() {
        let mut rams = interpreter();
        let mut out = CaptureSink::default();

        let payload = vec![7u8; TS_PACKET_SIZE];
        let packet = rams_packet(0, 0, 0, 0, &[(COMMAND_LABEL, label_entry(1, 1))], &payload);
        rams.parse(&packet, true, true, &mut out);

        // RESET first: the unit store is cleared before this packet's
        // OUTPUT runs, so nothing is emitted
        let output_cmd = vec![0x00, 0x01];
        let packet = rams_packet(
            0,
            0,
            500,
            0,
            &[(COMMAND_RESET, vec![]), (COMMAND_OUTPUT, output_cmd)],
            &[],
        );
        rams.parse(&packet, true, true, &mut out);
        assert!(out.data.is_empty());
    }

    #[test]
    fn reset_as_last_command_takes_effect_after_packet() {
        let mut rams = interpreter();
        let mut out = CaptureSink::default();

        let payload = vec![9u8; TS_PACKET_SIZE];
        let packet = rams_packet(0, 0, 0, 0, &[(COMMAND_LABEL, label_entry(1, 1))], &payload);
        rams.parse(&packet, true, true, &mut out);

        // OUTPUT then RESET: the emission happens, then state clears
        let output_cmd = vec![0x00, 0x01];
        let packet = rams_packet(
            0,
            0,
            0,
            0,
            &[(COMMAND_OUTPUT, output_cmd), (COMMAND_RESET, vec![])],
            &[],
        );
        rams.parse(&packet, true, true, &mut out);
        assert_eq!(out.data, payload);

        // After the reset the unit is gone
        out.data.clear();
        let output_cmd = vec![0x00, 0x01];
        let packet = rams_packet(0, 0, 0, 0, &[(COMMAND_OUTPUT, output_cmd)], &[]);
        rams.parse(&packet, true, true, &mut out);
        assert!(out.data.is_empty());
    }

    #[test]
    fn fragmented_packet_delivery() {
        let mut rams = interpreter();
        let mut out = CaptureSink::default();

        let payload = vec![0x5A; TS_PACKET_SIZE];
        let packet = rams_packet(0, 0, 0, 0, &[(COMMAND_LABEL, label_entry(1, 3))], &payload);

        let mid = packet.len() / 2;
        rams.parse(&packet[..mid], true, false, &mut out);
        rams.parse(&packet[mid..], false, true, &mut out);

        let output_cmd = vec![0x00, 0x03];
        let packet = rams_packet(0, 0, 0, 0, &[(COMMAND_OUTPUT, output_cmd)], &[]);
        rams.parse(&packet, true, true, &mut out);
        assert_eq!(out.data, payload);
    }

    #[test]
    fn label_merging_and_unit_offset() {
        let mut handler = RamsPacketHandler::new();
        let mut data = label_entry(2, 4);
        data.extend_from_slice(&label_entry(1, 4));
        data.extend_from_slice(&label_entry(1, 6));
        handler.parse_label_data(10, &data);

        assert_eq!(handler.labels.len(), 2);
        assert_eq!(handler.labels[0].unit_id, 4);
        // 3 packets merged, minus the 10-byte unit offset
        assert_eq!(handler.labels[0].byte_count, 3 * 188 - 10);
        assert_eq!(handler.labels[1].unit_id, 6);
        assert_eq!(handler.labels[1].byte_count, 188);
    }

    #[test]
    fn output_with_patch_modifies_unit() {
        let mut rams = interpreter();
        let mut out = CaptureSink::default();

        let payload = vec![0u8; TS_PACKET_SIZE];
        let packet = rams_packet(0, 0, 0, 0, &[(COMMAND_LABEL, label_entry(1, 8))], &payload);
        rams.parse(&packet, true, true, &mut out);

        // OUTPUT with one 2-byte patch at offset 4 (action 2)
        // patch entries: delta-high, delta-low|action, patch bytes
        let output_cmd = vec![
            0x80, 0x08, // patch flag, unit 8
            4,    // patch list length
            0x00, 0x42, // offset delta 4, action 2 (2 bytes)
            0xDE, 0xAD,
        ];
        let packet = rams_packet(0, 0, 0, 0, &[(COMMAND_OUTPUT, output_cmd)], &[]);
        rams.parse(&packet, true, true, &mut out);

        assert_eq!(out.data.len(), TS_PACKET_SIZE);
        assert_eq!(&out.data[4..6], &[0xDE, 0xAD]);
    }
}
