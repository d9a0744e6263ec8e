//! Transport stream demultiplexer.
//!
//! Scoped to what the underrun pipeline needs: PAT/PMT discovery,
//! elementary stream selection by preferred language, PES reassembly into
//! per-stream sinks, PCR extraction and a decrypt hook for scrambled
//! payloads.

use super::{StreamType, TimeStamp, PAT_PID, TS_PACKET_SIZE, TS_SYNC_BYTE};
use crate::utils::bits::BitReader;

use log::{debug, warn};

/// Receiver of demultiplexed elementary stream data.
pub trait DataSink {
    /// A (possibly new) stream was selected for this sink.
    fn new_stream(&mut self, stream_type: StreamType, language: &str);
    /// A PES header started a new frame.
    fn pes_header(&mut self, pts: TimeStamp, dts: TimeStamp, pes_payload_length: u32);
    /// Frame payload bytes, in order.
    fn parse(&mut self, data: &[u8]);
    /// The stream restarted; discard partial state.
    fn reset(&mut self);
}

/// Receiver of stream-level timing events.
pub trait TsEventSink {
    fn pcr_received(&mut self, pcr_90khz: u64, has_discontinuity: bool);
}

/// Decryptor for scrambled PES payloads (CENC-TS). Returns false when the
/// payload could not be descrambled; such payload is dropped.
pub trait CaDecryptor: Send {
    fn decrypt(&mut self, data: &mut [u8], scrambling_control: u8) -> bool;
}

const ISO_639_LANGUAGE_DESCRIPTOR: u8 = 10;

#[derive(Debug, Clone)]
struct StreamInfo {
    stream_type: StreamType,
    pid: u16,
    language: String,
}

#[derive(Debug, Default)]
struct SectionBuffer {
    data: Vec<u8>,
    expected: usize,
}

/// Which sink a selected PID feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SinkKind {
    Video,
    Audio,
}

#[derive(Debug, Default)]
struct PesState {
    /// Collected PES header bytes until the full header is known.
    header: Vec<u8>,
    in_payload: bool,
}

/// Transport stream demultiplexer feeding two elementary stream sinks.
pub struct TsDemux {
    packet_buffer: Vec<u8>,
    preferred_language: String,

    pmt_pid: Option<u16>,
    pcr_pid: Option<u16>,
    pat_section: SectionBuffer,
    pmt_section: SectionBuffer,
    pmt_version: Option<u8>,

    streams: Vec<StreamInfo>,
    video_pid: Option<u16>,
    audio_pid: Option<u16>,
    video_pes: PesState,
    audio_pes: PesState,

    decryptor: Option<Box<dyn CaDecryptor>>,
}

impl Default for TsDemux {
    fn default() -> Self {
        TsDemux {
            packet_buffer: Vec::with_capacity(TS_PACKET_SIZE),
            preferred_language: String::new(),
            pmt_pid: None,
            pcr_pid: None,
            pat_section: SectionBuffer::default(),
            pmt_section: SectionBuffer::default(),
            pmt_version: None,
            streams: Vec::new(),
            video_pid: None,
            audio_pid: None,
            video_pes: PesState::default(),
            audio_pes: PesState::default(),
            decryptor: None,
        }
    }
}

impl TsDemux {
    pub fn new() -> Self {
        TsDemux::default()
    }

    pub fn set_preferred_language(&mut self, language: &str) {
        self.preferred_language = language.to_string();
    }

    pub fn set_ca_decryptor(&mut self, decryptor: Option<Box<dyn CaDecryptor>>) {
        self.decryptor = decryptor;
    }

    pub fn reset(&mut self) {
        let decryptor = self.decryptor.take();
        let preferred_language = std::mem::take(&mut self.preferred_language);
        *self = TsDemux::default();
        self.decryptor = decryptor;
        self.preferred_language = preferred_language;
    }

    /// Feed raw bytes; packets may arrive fragmented across calls.
    pub fn put(
        &mut self,
        mut data: &[u8],
        video_sink: &mut dyn DataSink,
        audio_sink: &mut dyn DataSink,
        event_sink: &mut dyn TsEventSink,
    ) {
        while !data.is_empty() {
            if self.packet_buffer.is_empty() {
                // Resynchronize on the TS sync byte
                match data.iter().position(|&b| b == TS_SYNC_BYTE) {
                    Some(0) => {}
                    Some(n) => {
                        warn!("Skipping {} bytes to TS sync", n);
                        data = &data[n..];
                    }
                    None => return,
                }
            }

            let needed = TS_PACKET_SIZE - self.packet_buffer.len();
            let take = needed.min(data.len());
            self.packet_buffer.extend_from_slice(&data[..take]);
            data = &data[take..];

            if self.packet_buffer.len() == TS_PACKET_SIZE {
                let packet = std::mem::replace(
                    &mut self.packet_buffer,
                    Vec::with_capacity(TS_PACKET_SIZE),
                );
                self.parse_ts_packet(&packet, video_sink, audio_sink, event_sink);
            }
        }
    }

    fn parse_ts_packet(
        &mut self,
        packet: &[u8],
        video_sink: &mut dyn DataSink,
        audio_sink: &mut dyn DataSink,
        event_sink: &mut dyn TsEventSink,
    ) {
        if packet[0] != TS_SYNC_BYTE {
            warn!("Lost TS sync");
            return;
        }

        let transport_error = packet[1] & 0x80 != 0;
        if transport_error {
            return;
        }
        let payload_unit_start = packet[1] & 0x40 != 0;
        let pid = ((packet[1] as u16 & 0x1F) << 8) | packet[2] as u16;
        let scrambling_control = (packet[3] >> 6) & 0x3;
        let has_adaptation = packet[3] & 0x20 != 0;
        let has_payload = packet[3] & 0x10 != 0;

        let mut offset = 4;
        let mut discontinuity = false;
        if has_adaptation {
            let af_length = packet[4] as usize;
            if af_length > 0 && offset + 1 + af_length <= TS_PACKET_SIZE {
                let flags = packet[5];
                discontinuity = flags & 0x80 != 0;
                if flags & 0x10 != 0 && af_length >= 7 {
                    // program_clock_reference_base (33) + reserved (6) + extension (9)
                    let base = ((packet[6] as u64) << 25)
                        | ((packet[7] as u64) << 17)
                        | ((packet[8] as u64) << 9)
                        | ((packet[9] as u64) << 1)
                        | ((packet[10] as u64) >> 7);
                    if Some(pid) == self.pcr_pid || self.pcr_pid.is_none() {
                        event_sink.pcr_received(base, discontinuity);
                    }
                }
            }
            offset += 1 + af_length;
        }

        if !has_payload || offset >= TS_PACKET_SIZE {
            return;
        }

        let mut payload = packet[offset..].to_vec();

        if pid == PAT_PID {
            if let Some(section) = collect_section(&mut self.pat_section, &payload, payload_unit_start) {
                self.parse_pat(&section);
            }
            return;
        }
        if Some(pid) == self.pmt_pid {
            if let Some(section) = collect_section(&mut self.pmt_section, &payload, payload_unit_start) {
                self.parse_pmt(&section, video_sink, audio_sink);
            }
            return;
        }

        let kind = if Some(pid) == self.video_pid {
            SinkKind::Video
        } else if Some(pid) == self.audio_pid {
            SinkKind::Audio
        } else {
            return;
        };

        if scrambling_control != 0 {
            match &mut self.decryptor {
                Some(decryptor) => {
                    if !decryptor.decrypt(&mut payload, scrambling_control) {
                        warn!("Dropping payload that failed to descramble");
                        return;
                    }
                }
                None => {
                    warn!("Scrambled payload without a decrypt engine, dropping");
                    return;
                }
            }
        }

        let (pes, sink): (&mut PesState, &mut dyn DataSink) = match kind {
            SinkKind::Video => (&mut self.video_pes, video_sink),
            SinkKind::Audio => (&mut self.audio_pes, audio_sink),
        };
        parse_pes(pes, &payload, payload_unit_start, sink);
    }

    fn parse_pat(&mut self, section: &[u8]) {
        // table_id, section_syntax+length, tsid, version/cn, section numbers
        if section.len() < 12 || section[0] != 0x00 {
            return;
        }
        // First program's PMT PID; program number 0 entries are NIT
        let mut index = 8;
        while index + 4 <= section.len() - 4 {
            let program_number = ((section[index] as u16) << 8) | section[index + 1] as u16;
            let pid = ((section[index + 2] as u16 & 0x1F) << 8) | section[index + 3] as u16;
            if program_number != 0 {
                if self.pmt_pid != Some(pid) {
                    debug!("PAT: program {} at PMT PID {:#x}", program_number, pid);
                    self.pmt_pid = Some(pid);
                    self.pmt_section = SectionBuffer::default();
                    self.pmt_version = None;
                }
                return;
            }
            index += 4;
        }
    }

    fn parse_pmt(
        &mut self,
        section: &[u8],
        video_sink: &mut dyn DataSink,
        audio_sink: &mut dyn DataSink,
    ) {
        if section.len() < 16 || section[0] != 0x02 {
            return;
        }
        let version = (section[5] >> 1) & 0x1F;
        if self.pmt_version == Some(version) {
            return; // Same table version, nothing changed
        }
        self.pmt_version = Some(version);

        let section_length = (((section[1] as usize) & 0x0F) << 8) | section[2] as usize;
        let end = (3 + section_length).min(section.len()).saturating_sub(4); // Strip CRC
        self.pcr_pid = Some(((section[8] as u16 & 0x1F) << 8) | section[9] as u16);
        let program_info_length = (((section[10] as usize) & 0x0F) << 8) | section[11] as usize;

        self.streams.clear();
        let mut index = 12 + program_info_length;
        while index + 5 <= end {
            let stream_type = StreamType::from_pmt(section[index]);
            let pid = ((section[index + 1] as u16 & 0x1F) << 8) | section[index + 2] as u16;
            let es_info_length = (((section[index + 3] as usize) & 0x0F) << 8) | section[index + 4] as usize;
            let descriptors = &section[index + 5..(index + 5 + es_info_length).min(end)];
            let language = parse_language_descriptor(descriptors);
            index += 5 + es_info_length;

            if stream_type != StreamType::Unknown {
                self.streams.push(StreamInfo {
                    stream_type,
                    pid,
                    language,
                });
            }
        }

        self.select_elementary_streams(video_sink, audio_sink);
    }

    /// First video stream; audio prefers the configured language, falling
    /// back to the first audio stream.
    fn select_elementary_streams(
        &mut self,
        video_sink: &mut dyn DataSink,
        audio_sink: &mut dyn DataSink,
    ) {
        let video = self.streams.iter().find(|s| s.stream_type.is_video());
        let audio = self
            .streams
            .iter()
            .find(|s| s.stream_type.is_audio() && s.language == self.preferred_language)
            .or_else(|| self.streams.iter().find(|s| s.stream_type.is_audio()));

        if let Some(video) = video {
            if self.video_pid != Some(video.pid) {
                debug!("Selected video PID {:#x} ({:?})", video.pid, video.stream_type);
                self.video_pid = Some(video.pid);
                self.video_pes = PesState::default();
            }
            video_sink.new_stream(video.stream_type, &video.language);
        }
        if let Some(audio) = audio {
            if self.audio_pid != Some(audio.pid) {
                debug!(
                    "Selected audio PID {:#x} ({:?}, lang {:?})",
                    audio.pid, audio.stream_type, audio.language
                );
                self.audio_pid = Some(audio.pid);
                self.audio_pes = PesState::default();
            }
            audio_sink.new_stream(audio.stream_type, &audio.language);
        }
    }
}

fn parse_language_descriptor(mut descriptors: &[u8]) -> String {
    while descriptors.len() >= 2 {
        let tag = descriptors[0];
        let length = descriptors[1] as usize;
        let body = &descriptors[2..(2 + length).min(descriptors.len())];
        if tag == ISO_639_LANGUAGE_DESCRIPTOR && body.len() >= 3 {
            return String::from_utf8_lossy(&body[..3]).into_owned();
        }
        descriptors = &descriptors[(2 + length).min(descriptors.len())..];
    }
    String::new()
}

/// Accumulate PSI section bytes; returns the complete section when done.
fn collect_section(
    buffer: &mut SectionBuffer,
    payload: &[u8],
    payload_unit_start: bool,
) -> Option<Vec<u8>> {
    if payload_unit_start {
        let pointer = *payload.first()? as usize;
        let start = 1 + pointer;
        if start >= payload.len() {
            return None;
        }
        buffer.data.clear();
        buffer.data.extend_from_slice(&payload[start..]);
    } else if !buffer.data.is_empty() {
        buffer.data.extend_from_slice(payload);
    } else {
        return None;
    }

    if buffer.data.len() >= 3 {
        let section_length = (((buffer.data[1] as usize) & 0x0F) << 8) | buffer.data[2] as usize;
        buffer.expected = 3 + section_length;
        if buffer.data.len() >= buffer.expected {
            let section = buffer.data[..buffer.expected].to_vec();
            buffer.data.clear();
            return Some(section);
        }
    }
    None
}

/// Incrementally parse PES packets, emitting headers and payload to the sink.
fn parse_pes(state: &mut PesState, payload: &[u8], payload_unit_start: bool, sink: &mut dyn DataSink) {
    if payload_unit_start {
        state.header.clear();
        state.in_payload = false;
    }

    if !state.in_payload {
        // Collect until the complete PES header is available:
        // 6 fixed bytes + 3 flag/length bytes + header data
        state.header.extend_from_slice(payload);
        if state.header.len() < 9 {
            return;
        }
        if state.header[0] != 0 || state.header[1] != 0 || state.header[2] != 1 {
            warn!("Bad PES start code");
            state.header.clear();
            return;
        }
        let header_data_length = state.header[8] as usize;
        let total_header = 9 + header_data_length;
        if state.header.len() < total_header {
            return;
        }

        let pes_packet_length = ((state.header[4] as u32) << 8) | state.header[5] as u32;
        let flags = state.header[7];
        let mut bits = BitReader::new(&state.header[9..total_header]);
        let mut pts = TimeStamp::invalid();
        let mut dts = TimeStamp::invalid();
        if flags & 0x80 != 0 {
            pts = TimeStamp::from_90khz(read_pes_timestamp(&mut bits));
            if flags & 0x40 != 0 {
                dts = TimeStamp::from_90khz(read_pes_timestamp(&mut bits));
            }
        }

        // Payload length excludes the optional header extension
        let payload_length = pes_packet_length.saturating_sub(3 + header_data_length as u32);
        sink.pes_header(pts, dts, payload_length);

        let leftover = state.header.split_off(total_header);
        state.header.clear();
        state.in_payload = true;
        if !leftover.is_empty() {
            sink.parse(&leftover);
        }
        return;
    }

    if !payload.is_empty() {
        sink.parse(payload);
    }
}

/// 33-bit timestamp in the 5-byte PES marker encoding.
fn read_pes_timestamp(bits: &mut BitReader) -> u64 {
    bits.skip(4); // '0010'/'0011'/'0001' marker
    let high = bits.read(3) as u64;
    bits.skip(1); // marker_bit
    let mid = bits.read(15) as u64;
    bits.skip(1);
    let low = bits.read(15) as u64;
    bits.skip(1);
    (high << 30) | (mid << 15) | low
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts::crc32_13818;

    #[derive(Default)]
    struct RecordingSink {
        streams: Vec<(StreamType, String)>,
        headers: Vec<(TimeStamp, TimeStamp, u32)>,
        data: Vec<u8>,
    }

    impl DataSink for RecordingSink {
        fn new_stream(&mut self, stream_type: StreamType, language: &str) {
            self.streams.push((stream_type, language.to_string()));
        }
        fn pes_header(&mut self, pts: TimeStamp, dts: TimeStamp, len: u32) {
            self.headers.push((pts, dts, len));
        }
        fn parse(&mut self, data: &[u8]) {
            self.data.extend_from_slice(data);
        }
        fn reset(&mut self) {
            self.data.clear();
        }
    }

    #[derive(Default)]
    struct RecordingEvents {
        pcrs: Vec<(u64, bool)>,
    }

    impl TsEventSink for RecordingEvents {
        fn pcr_received(&mut self, pcr: u64, discontinuity: bool) {
            self.pcrs.push((pcr, discontinuity));
        }
    }

    fn psi_packet(pid: u16, section: &[u8]) -> Vec<u8> {
        let mut packet = vec![0u8; TS_PACKET_SIZE];
        packet[0] = TS_SYNC_BYTE;
        packet[1] = 0x40 | ((pid >> 8) as u8 & 0x1F);
        packet[2] = pid as u8;
        packet[3] = 0x10; // payload only
        packet[4] = 0; // pointer_field
        packet[5..5 + section.len()].copy_from_slice(section);
        for byte in packet.iter_mut().skip(5 + section.len()) {
            *byte = 0xFF;
        }
        packet
    }

    fn section_with_crc(mut body: Vec<u8>) -> Vec<u8> {
        // Fix up section_length to cover the rest of the body + CRC
        let length = body.len() - 3 + 4;
        body[1] = 0xB0 | ((length >> 8) as u8 & 0x0F);
        body[2] = length as u8;
        let crc = crc32_13818(&body);
        body.extend_from_slice(&crc.to_be_bytes());
        body
    }

    fn pat_section(pmt_pid: u16) -> Vec<u8> {
        section_with_crc(vec![
            0x00, 0, 0, // table id + length (patched)
            0x00, 0x01, // transport_stream_id
            0xC1, 0x00, 0x00, // version/current, section numbers
            0x00, 0x01, // program_number 1
            0xE0 | (pmt_pid >> 8) as u8, pmt_pid as u8,
        ])
    }

    fn pmt_section(pcr_pid: u16, streams: &[(u8, u16, Option<&str>)]) -> Vec<u8> {
        let mut body = vec![
            0x02, 0, 0, // table id + length (patched)
            0x00, 0x01, // program_number
            0xC1, 0x00, 0x00, // version/current, section numbers
            0xE0 | (pcr_pid >> 8) as u8,
            pcr_pid as u8,
            0xF0, 0x00, // program_info_length
        ];
        for &(stream_type, pid, language) in streams {
            body.push(stream_type);
            body.push(0xE0 | (pid >> 8) as u8);
            body.push(pid as u8);
            match language {
                Some(lang) => {
                    body.push(0xF0);
                    body.push(5);
                    body.push(ISO_639_LANGUAGE_DESCRIPTOR);
                    body.push(4);
                    body.extend_from_slice(lang.as_bytes());
                    body.push(0); // audio_type
                }
                None => {
                    body.push(0xF0);
                    body.push(0);
                }
            }
        }
        section_with_crc(body)
    }

    fn pes_packet(pid: u16, pts_ticks: u64, payload: &[u8]) -> Vec<u8> {
        let mut packet = vec![0u8; TS_PACKET_SIZE];
        packet[0] = TS_SYNC_BYTE;
        packet[1] = 0x40 | ((pid >> 8) as u8 & 0x1F);
        packet[2] = pid as u8;

        let mut pes = vec![0x00, 0x00, 0x01, 0xC0];
        let header_data_len = 5u8;
        let pes_len = 3 + header_data_len as usize + payload.len();
        pes.push((pes_len >> 8) as u8);
        pes.push(pes_len as u8);
        pes.push(0x80);
        pes.push(0x80); // PTS only
        pes.push(header_data_len);
        pes.push(0x21 | (((pts_ticks >> 30) as u8 & 0x7) << 1));
        pes.push((pts_ticks >> 22) as u8);
        pes.push(0x01 | ((pts_ticks >> 14) as u8 & 0xFE));
        pes.push((pts_ticks >> 7) as u8);
        pes.push(0x01 | ((pts_ticks << 1) as u8));
        pes.extend_from_slice(payload);

        // Stuff via adaptation field so the packet is exactly 188 bytes
        let stuffing = TS_PACKET_SIZE - 4 - pes.len();
        if stuffing > 0 {
            packet[3] = 0x30;
            packet[4] = (stuffing - 1) as u8;
            if stuffing > 1 {
                packet[5] = 0x00;
                for byte in packet.iter_mut().take(4 + stuffing).skip(6) {
                    *byte = 0xFF;
                }
            }
        } else {
            packet[3] = 0x10;
        }
        packet[4 + stuffing..].copy_from_slice(&pes);
        packet
    }

    #[test]
    fn pat_pmt_stream_selection_prefers_language() {
        let mut demux = TsDemux::new();
        demux.set_preferred_language("dut");
        let mut video = RecordingSink::default();
        let mut audio = RecordingSink::default();
        let mut events = RecordingEvents::default();

        let pat = psi_packet(PAT_PID, &pat_section(0x100));
        let pmt = psi_packet(
            0x100,
            &pmt_section(
                0x101,
                &[
                    (0x1B, 0x101, None),
                    (0x0F, 0x102, Some("eng")),
                    (0x0F, 0x103, Some("dut")),
                ],
            ),
        );

        demux.put(&pat, &mut video, &mut audio, &mut events);
        demux.put(&pmt, &mut video, &mut audio, &mut events);

        assert_eq!(video.streams, vec![(StreamType::H264Video, String::new())]);
        assert_eq!(audio.streams, vec![(StreamType::AacAudio, "dut".to_string())]);
        assert_eq!(demux.audio_pid, Some(0x103));
    }

    #[test]
    fn pes_header_and_payload_reach_sink() {
        let mut demux = TsDemux::new();
        let mut video = RecordingSink::default();
        let mut audio = RecordingSink::default();
        let mut events = RecordingEvents::default();

        let pat = psi_packet(PAT_PID, &pat_section(0x100));
        let pmt = psi_packet(0x100, &pmt_section(0x101, &[(0x0F, 0x102, None)]));
        demux.put(&pat, &mut video, &mut audio, &mut events);
        demux.put(&pmt, &mut video, &mut audio, &mut events);

        let payload = [0xABu8; 32];
        let pes = pes_packet(0x102, 123456, &payload);
        demux.put(&pes, &mut video, &mut audio, &mut events);

        assert_eq!(audio.headers.len(), 1);
        let (pts, dts, len) = audio.headers[0];
        assert_eq!(pts.as_90khz(), 123456);
        assert!(!dts.is_valid());
        assert_eq!(len, 32);
        assert_eq!(audio.data, payload);
    }

    #[test]
    fn split_delivery_reassembles_packets() {
        let mut demux = TsDemux::new();
        let mut video = RecordingSink::default();
        let mut audio = RecordingSink::default();
        let mut events = RecordingEvents::default();

        let pat = psi_packet(PAT_PID, &pat_section(0x100));
        let pmt = psi_packet(0x100, &pmt_section(0x101, &[(0x0F, 0x102, None)]));
        let pes = pes_packet(0x102, 90000, &[1, 2, 3, 4]);

        let mut all = Vec::new();
        all.extend_from_slice(&pat);
        all.extend_from_slice(&pmt);
        all.extend_from_slice(&pes);

        // Deliver in awkward chunk sizes
        for chunk in all.chunks(61) {
            demux.put(chunk, &mut video, &mut audio, &mut events);
        }
        assert_eq!(audio.headers.len(), 1);
        assert_eq!(audio.data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn pcr_is_reported() {
        let mut demux = TsDemux::new();
        let mut video = RecordingSink::default();
        let mut audio = RecordingSink::default();
        let mut events = RecordingEvents::default();

        let mut packet = vec![0u8; TS_PACKET_SIZE];
        packet[0] = TS_SYNC_BYTE;
        packet[1] = 0x00;
        packet[2] = 0x42;
        packet[3] = 0x20; // adaptation only
        packet[4] = 183;
        packet[5] = 0x10; // PCR flag
        let pcr: u64 = 2_700_000;
        packet[6] = (pcr >> 25) as u8;
        packet[7] = (pcr >> 17) as u8;
        packet[8] = (pcr >> 9) as u8;
        packet[9] = (pcr >> 1) as u8;
        packet[10] = ((pcr & 1) as u8) << 7 | 0x7E;
        for byte in packet.iter_mut().skip(12) {
            *byte = 0xFF;
        }

        demux.put(&packet, &mut video, &mut audio, &mut events);
        assert_eq!(events.pcrs, vec![(2_700_000, false)]);
    }
}
