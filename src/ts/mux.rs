//! Transport stream multiplexer.
//!
//! Re-emits the mitigated elementary streams as a fresh TS: synthesized
//! PAT/PMT with Annex-A CRCs, paced PCR packets on a dedicated PID and PES
//! packetization driven by per-stream data sources.

use super::{crc32_13818, PacketSink, StreamType, TimeStamp, PAT_PID, TS_PACKET_SIZE, TS_SYNC_BYTE};

/// Pull interface the mux drains one packet at a time.
///
/// `bytes_available` is always called first; only when it returns non-zero
/// are `is_new_frame`, `data` and `read_bytes` used, which allows the
/// source to materialize frames (or synthesize filler) lazily.
pub trait DataSource {
    fn stream_type(&self) -> StreamType;
    /// At a frame boundary, the (pts, dts) to put in the PES header.
    fn is_new_frame(&mut self) -> Option<(TimeStamp, TimeStamp)>;
    fn bytes_available(&mut self, pcr: TimeStamp) -> usize;
    fn data(&self) -> &[u8];
    fn read_bytes(&mut self, n: usize);
}

pub const MUX_PSI: u32 = 1 << 0;
pub const MUX_PCR: u32 = 1 << 1;
pub const MUX_DATA: u32 = 1 << 2;
pub const MUX_FORCE_PCR: u32 = 1 << 3;
pub const MUX_ALL: u32 = MUX_PSI | MUX_PCR | MUX_DATA;

const PMT_PID: u16 = 0x0100;
const VIDEO_PID: u16 = 0x0101;
const AUDIO_PID: u16 = 0x0102;
const PCR_PID: u16 = 0x0103;

const PES_VIDEO_STREAM_ID: u8 = 0xE0;
const PES_AUDIO_STREAM_ID: u8 = 0xC0;

const PSI_PERIOD: u64 = 100; // ms
const PCR_PERIOD: u64 = 40; // ms

#[derive(Debug)]
struct StreamOut {
    pid: u16,
    stream_id: u8,
    cc: u8,
}

impl StreamOut {
    fn new(pid: u16, stream_id: u8) -> Self {
        StreamOut { pid, stream_id, cc: 0 }
    }

    fn next_cc(&mut self) -> u8 {
        let cc = self.cc;
        self.cc = (self.cc + 1) & 0x0F;
        cc
    }
}

/// Transport stream multiplexer with synthesized program tables.
pub struct TsMux {
    pat: StreamOut,
    pmt: StreamOut,
    video: StreamOut,
    audio: StreamOut,
    transport_stream_id: u16,
    program_number: u16,
    pmt_version: u8,
    announced_types: (StreamType, StreamType),
    pcr_of_last_psi: TimeStamp,
    pcr_of_last_pcr: TimeStamp,
}

impl Default for TsMux {
    fn default() -> Self {
        TsMux {
            pat: StreamOut::new(PAT_PID, 0),
            pmt: StreamOut::new(PMT_PID, 0),
            video: StreamOut::new(VIDEO_PID, PES_VIDEO_STREAM_ID),
            audio: StreamOut::new(AUDIO_PID, PES_AUDIO_STREAM_ID),
            transport_stream_id: 1,
            program_number: 1,
            pmt_version: 0,
            announced_types: (StreamType::Unknown, StreamType::Unknown),
            pcr_of_last_psi: TimeStamp::invalid(),
            pcr_of_last_pcr: TimeStamp::invalid(),
        }
    }
}

impl TsMux {
    pub fn new() -> Self {
        TsMux::default()
    }

    pub fn reset(&mut self) {
        *self = TsMux::default();
    }

    /// Emit up to `max_packets` TS packets for the given PCR. Returns the
    /// number of packets written to `out`.
    pub fn mux_packets(
        &mut self,
        pcr: TimeStamp,
        flags: u32,
        max_packets: usize,
        video_source: Option<&mut dyn DataSource>,
        audio_source: Option<&mut dyn DataSource>,
        out: &mut dyn PacketSink,
    ) -> usize {
        let mut sent = 0;

        let video_type = video_source.as_ref().map(|s| s.stream_type());
        let audio_type = audio_source.as_ref().map(|s| s.stream_type());

        if flags & MUX_PSI != 0 && sent < max_packets && self.psi_due(pcr) {
            let current = (
                video_type.unwrap_or(StreamType::Unknown),
                audio_type.unwrap_or(StreamType::Unknown),
            );
            if current != self.announced_types && self.announced_types != (StreamType::Unknown, StreamType::Unknown) {
                self.pmt_version = (self.pmt_version + 1) & 0x1F;
            }
            self.announced_types = current;

            sent += self.put_pat(out);
            sent += self.put_pmt(current.0, current.1, out);
            self.pcr_of_last_psi = pcr;
        }

        let force_pcr = flags & MUX_FORCE_PCR != 0;
        if (force_pcr || (flags & MUX_PCR != 0 && self.pcr_due(pcr))) && sent < max_packets {
            self.put_pcr_packet(pcr, out);
            self.pcr_of_last_pcr = pcr;
            sent += 1;
        }

        if flags & MUX_DATA != 0 {
            // Audio first: it is low-bandwidth and latency-critical
            if let Some(source) = audio_source {
                sent += self.drain_source(SourceKind::Audio, source, pcr, max_packets.saturating_sub(sent), out);
            }
            if let Some(source) = video_source {
                sent += self.drain_source(SourceKind::Video, source, pcr, max_packets.saturating_sub(sent), out);
            }
        }

        sent
    }

    fn psi_due(&self, pcr: TimeStamp) -> bool {
        !self.pcr_of_last_psi.is_valid()
            || pcr.diff(&self.pcr_of_last_psi) >= (PSI_PERIOD * 90) as i64
    }

    fn pcr_due(&self, pcr: TimeStamp) -> bool {
        !self.pcr_of_last_pcr.is_valid()
            || pcr.diff(&self.pcr_of_last_pcr) >= (PCR_PERIOD * 90) as i64
    }

    fn drain_source(
        &mut self,
        kind: SourceKind,
        source: &mut dyn DataSource,
        pcr: TimeStamp,
        budget: usize,
        out: &mut dyn PacketSink,
    ) -> usize {
        let mut sent = 0;
        while sent < budget && source.bytes_available(pcr) > 0 {
            self.put_data_packet(kind, source, out);
            sent += 1;
        }
        sent
    }

    fn put_data_packet(&mut self, kind: SourceKind, source: &mut dyn DataSource, out: &mut dyn PacketSink) {
        let stream = match kind {
            SourceKind::Video => &mut self.video,
            SourceKind::Audio => &mut self.audio,
        };

        let new_frame = source.is_new_frame();
        let mut pes_header = Vec::new();
        if let Some((pts, dts)) = new_frame {
            pes_header = build_pes_header(stream.stream_id, pts, dts, source.data().len());
        }

        let capacity = TS_PACKET_SIZE - 4 - pes_header.len();
        let available = source.data().len();
        let payload_len = available.min(capacity);
        let stuffing = capacity - payload_len;

        let mut packet = Vec::with_capacity(TS_PACKET_SIZE);
        packet.push(TS_SYNC_BYTE);
        let pusi = if new_frame.is_some() { 0x40 } else { 0x00 };
        packet.push(pusi | ((stream.pid >> 8) as u8 & 0x1F));
        packet.push(stream.pid as u8);
        let afc = if stuffing > 0 { 0x30 } else { 0x10 };
        packet.push(afc | stream.next_cc());

        if stuffing > 0 {
            packet.push((stuffing - 1) as u8);
            if stuffing > 1 {
                packet.push(0x00);
                packet.resize(packet.len() + stuffing - 2, 0xFF);
            }
        }

        packet.extend_from_slice(&pes_header);
        packet.extend_from_slice(&source.data()[..payload_len]);
        source.read_bytes(payload_len);

        debug_assert_eq!(packet.len(), TS_PACKET_SIZE);
        out.put(&packet);
    }

    /// Adaptation-only packet carrying the PCR; no payload, so the
    /// continuity counter does not advance.
    fn put_pcr_packet(&mut self, pcr: TimeStamp, out: &mut dyn PacketSink) {
        let mut packet = Vec::with_capacity(TS_PACKET_SIZE);
        packet.push(TS_SYNC_BYTE);
        packet.push((PCR_PID >> 8) as u8 & 0x1F);
        packet.push(PCR_PID as u8);
        packet.push(0x20); // Adaptation field only
        packet.push(183);
        packet.push(0x10); // PCR flag
        let base = pcr.as_90khz();
        packet.push((base >> 25) as u8);
        packet.push((base >> 17) as u8);
        packet.push((base >> 9) as u8);
        packet.push((base >> 1) as u8);
        packet.push((((base & 1) as u8) << 7) | 0x7E); // ext high bits reserved
        packet.push(0); // PCR extension low byte
        packet.resize(TS_PACKET_SIZE, 0xFF);
        out.put(&packet);
    }

    fn put_pat(&mut self, out: &mut dyn PacketSink) -> usize {
        let mut body = vec![
            0x00, // table_id
            0xB0,
            0x00, // section_length patched below
            (self.transport_stream_id >> 8) as u8,
            self.transport_stream_id as u8,
            0xC1,
            0x00,
            0x00,
            (self.program_number >> 8) as u8,
            self.program_number as u8,
            0xE0 | (PMT_PID >> 8) as u8,
            PMT_PID as u8,
        ];
        finish_section(&mut body);
        let cc = self.pat.next_cc();
        out.put(&psi_packet(PAT_PID, cc, &body));
        1
    }

    fn put_pmt(&mut self, video_type: StreamType, audio_type: StreamType, out: &mut dyn PacketSink) -> usize {
        let mut body = vec![
            0x02, // table_id
            0xB0,
            0x00, // section_length patched below
            (self.program_number >> 8) as u8,
            self.program_number as u8,
            0xC1 | (self.pmt_version << 1),
            0x00,
            0x00,
            0xE0 | (PCR_PID >> 8) as u8,
            PCR_PID as u8,
            0xF0,
            0x00, // program_info_length
        ];
        if video_type != StreamType::Unknown {
            body.push(video_type.to_pmt());
            body.push(0xE0 | (VIDEO_PID >> 8) as u8);
            body.push(VIDEO_PID as u8);
            body.push(0xF0);
            body.push(0x00);
        }
        if audio_type != StreamType::Unknown {
            body.push(audio_type.to_pmt());
            body.push(0xE0 | (AUDIO_PID >> 8) as u8);
            body.push(AUDIO_PID as u8);
            body.push(0xF0);
            body.push(0x00);
        }
        finish_section(&mut body);
        let cc = self.pmt.next_cc();
        out.put(&psi_packet(PMT_PID, cc, &body));
        1
    }
}

#[derive(Debug, Clone, Copy)]
enum SourceKind {
    Video,
    Audio,
}

/// Patch the section length and append the CRC.
fn finish_section(body: &mut Vec<u8>) {
    let length = body.len() - 3 + 4;
    body[1] = 0xB0 | ((length >> 8) as u8 & 0x0F);
    body[2] = length as u8;
    let crc = crc32_13818(body);
    body.extend_from_slice(&crc.to_be_bytes());
}

fn psi_packet(pid: u16, cc: u8, section: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(TS_PACKET_SIZE);
    packet.push(TS_SYNC_BYTE);
    packet.push(0x40 | (pid >> 8) as u8 & 0x1F);
    packet.push(pid as u8);
    packet.push(0x10 | cc);
    packet.push(0x00); // pointer_field
    packet.extend_from_slice(section);
    packet.resize(TS_PACKET_SIZE, 0xFF);
    packet
}

fn build_pes_header(stream_id: u8, pts: TimeStamp, dts: TimeStamp, frame_length: usize) -> Vec<u8> {
    let has_pts = pts.is_valid();
    let has_dts = dts.is_valid();
    let header_data_len: u8 = match (has_pts, has_dts) {
        (true, true) => 10,
        (true, false) => 5,
        _ => 0,
    };

    let mut header = vec![0x00, 0x00, 0x01, stream_id];
    let pes_len = 3 + header_data_len as usize + frame_length;
    let wire_len = if pes_len > u16::MAX as usize { 0 } else { pes_len as u16 };
    header.push((wire_len >> 8) as u8);
    header.push(wire_len as u8);
    header.push(0x80);
    header.push(match (has_pts, has_dts) {
        (true, true) => 0xC0,
        (true, false) => 0x80,
        _ => 0x00,
    });
    header.push(header_data_len);

    if has_pts {
        let prefix = if has_dts { 0x3 } else { 0x2 };
        write_pes_timestamp(&mut header, prefix, pts.as_90khz());
        if has_dts {
            write_pes_timestamp(&mut header, 0x1, dts.as_90khz());
        }
    }
    header
}

fn write_pes_timestamp(out: &mut Vec<u8>, prefix: u8, ticks: u64) {
    out.push((prefix << 4) | (((ticks >> 30) as u8 & 0x7) << 1) | 1);
    out.push((ticks >> 22) as u8);
    out.push((((ticks >> 14) as u8) & 0xFE) | 1);
    out.push((ticks >> 7) as u8);
    out.push(((ticks << 1) as u8) | 1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts::demux::{DataSink, TsDemux, TsEventSink};

    /// Single-frame source for driving the mux in tests.
    struct FrameSource {
        stream_type: StreamType,
        pts: TimeStamp,
        data: Vec<u8>,
        read: usize,
        header_pending: bool,
    }

    impl FrameSource {
        fn new(stream_type: StreamType, pts: TimeStamp, data: Vec<u8>) -> Self {
            FrameSource {
                stream_type,
                pts,
                data,
                read: 0,
                header_pending: true,
            }
        }
    }

    impl DataSource for FrameSource {
        fn stream_type(&self) -> StreamType {
            self.stream_type
        }
        fn is_new_frame(&mut self) -> Option<(TimeStamp, TimeStamp)> {
            if self.header_pending && self.read == 0 {
                self.header_pending = false;
                Some((self.pts, TimeStamp::invalid()))
            } else {
                None
            }
        }
        fn bytes_available(&mut self, _pcr: TimeStamp) -> usize {
            self.data.len() - self.read
        }
        fn data(&self) -> &[u8] {
            &self.data[self.read..]
        }
        fn read_bytes(&mut self, n: usize) {
            self.read += n;
        }
    }

    #[derive(Default)]
    struct Captured {
        headers: Vec<(TimeStamp, TimeStamp, u32)>,
        data: Vec<u8>,
        streams: Vec<StreamType>,
    }

    impl DataSink for Captured {
        fn new_stream(&mut self, stream_type: StreamType, _language: &str) {
            self.streams.push(stream_type);
        }
        fn pes_header(&mut self, pts: TimeStamp, dts: TimeStamp, len: u32) {
            self.headers.push((pts, dts, len));
        }
        fn parse(&mut self, data: &[u8]) {
            self.data.extend_from_slice(data);
        }
        fn reset(&mut self) {}
    }

    #[derive(Default)]
    struct Pcrs(Vec<u64>);

    impl TsEventSink for Pcrs {
        fn pcr_received(&mut self, pcr: u64, _discontinuity: bool) {
            self.0.push(pcr);
        }
    }

    #[test]
    fn output_packets_are_188_bytes() {
        let mut mux = TsMux::new();
        let mut source = FrameSource::new(
            StreamType::AacAudio,
            TimeStamp::from_90khz(90000),
            vec![0x55; 400],
        );
        let mut out = Vec::new();
        let sent = mux.mux_packets(
            TimeStamp::from_90khz(90000),
            MUX_ALL,
            usize::MAX,
            None,
            Some(&mut source),
            &mut out,
        );
        assert!(sent >= 3); // PAT + PMT + PCR + data
        assert_eq!(out.len() % TS_PACKET_SIZE, 0);
        assert_eq!(out.len() / TS_PACKET_SIZE, sent);
    }

    #[test]
    fn demux_recovers_muxed_frame() {
        let mut mux = TsMux::new();
        let payload: Vec<u8> = (0..500).map(|i| i as u8).collect();
        let mut source = FrameSource::new(
            StreamType::AacAudio,
            TimeStamp::from_90khz(123000),
            payload.clone(),
        );
        let mut ts = Vec::new();
        mux.mux_packets(
            TimeStamp::from_90khz(123000),
            MUX_ALL,
            usize::MAX,
            None,
            Some(&mut source),
            &mut ts,
        );

        let mut demux = TsDemux::new();
        let mut video = Captured::default();
        let mut audio = Captured::default();
        let mut pcrs = Pcrs::default();
        demux.put(&ts, &mut video, &mut audio, &mut pcrs);

        assert_eq!(audio.streams, vec![StreamType::AacAudio]);
        assert_eq!(audio.headers.len(), 1);
        assert_eq!(audio.headers[0].0.as_90khz(), 123000);
        assert_eq!(audio.headers[0].2 as usize, payload.len());
        assert_eq!(audio.data, payload);
        assert_eq!(pcrs.0, vec![123000]);
    }

    #[test]
    fn psi_respects_period() {
        let mut mux = TsMux::new();
        let mut out = Vec::new();
        let t0 = TimeStamp::from_millis(0);

        let sent = mux.mux_packets(t0, MUX_PSI, usize::MAX, None, None, &mut out);
        assert_eq!(sent, 2); // PAT + PMT

        // 50 ms later: not due yet
        let sent = mux.mux_packets(TimeStamp::from_millis(50), MUX_PSI, usize::MAX, None, None, &mut out);
        assert_eq!(sent, 0);

        // 100 ms later: due again
        let sent = mux.mux_packets(TimeStamp::from_millis(100), MUX_PSI, usize::MAX, None, None, &mut out);
        assert_eq!(sent, 2);
    }

    #[test]
    fn forced_pcr_always_emits() {
        let mut mux = TsMux::new();
        let mut out = Vec::new();
        let t = TimeStamp::from_millis(5);
        assert_eq!(mux.mux_packets(t, MUX_FORCE_PCR, 1, None, None, &mut out), 1);
        assert_eq!(mux.mux_packets(t, MUX_FORCE_PCR, 1, None, None, &mut out), 1);
    }
}
