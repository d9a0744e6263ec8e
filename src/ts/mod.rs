//! MPEG-2 Transport Stream plumbing shared by the RAMS interpreter and the
//! underrun mitigator: 90 kHz timestamps, stream types, packet constants
//! and the PSI CRC.

pub mod demux;
pub mod mux;

pub use demux::TsDemux;
pub use mux::TsMux;

use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

pub const TS_PACKET_SIZE: usize = 188;
pub const TS_SYNC_BYTE: u8 = 0x47;

pub const PAT_PID: u16 = 0x0000;
pub const NULL_PACKET_PID: u16 = 0x1FFF;

/// ISO/IEC 13818-1 Table 2-34 stream type assignments (the subset we carry).
pub const PMT_STREAM_TYPE_MPEG1_AUDIO: u8 = 0x03;
pub const PMT_STREAM_TYPE_MPEG2_AUDIO: u8 = 0x04;
pub const PMT_STREAM_TYPE_AAC_AUDIO: u8 = 0x0F;
pub const PMT_STREAM_TYPE_MPEG2_VIDEO: u8 = 0x02;
pub const PMT_STREAM_TYPE_H264_VIDEO: u8 = 0x1B;
pub const PMT_STREAM_TYPE_AC3_AUDIO: u8 = 0x81;

/// Elementary stream kind selected from the PMT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamType {
    #[default]
    Unknown,
    Mpeg1Audio,
    Mpeg2Audio,
    AacAudio,
    Ac3Audio,
    Mpeg2Video,
    H264Video,
}

impl StreamType {
    pub fn from_pmt(stream_type: u8) -> Self {
        match stream_type {
            PMT_STREAM_TYPE_MPEG1_AUDIO => StreamType::Mpeg1Audio,
            PMT_STREAM_TYPE_MPEG2_AUDIO => StreamType::Mpeg2Audio,
            PMT_STREAM_TYPE_AAC_AUDIO => StreamType::AacAudio,
            PMT_STREAM_TYPE_AC3_AUDIO => StreamType::Ac3Audio,
            PMT_STREAM_TYPE_MPEG2_VIDEO => StreamType::Mpeg2Video,
            PMT_STREAM_TYPE_H264_VIDEO => StreamType::H264Video,
            _ => StreamType::Unknown,
        }
    }

    pub fn to_pmt(self) -> u8 {
        match self {
            StreamType::Mpeg1Audio => PMT_STREAM_TYPE_MPEG1_AUDIO,
            StreamType::Mpeg2Audio => PMT_STREAM_TYPE_MPEG2_AUDIO,
            StreamType::AacAudio => PMT_STREAM_TYPE_AAC_AUDIO,
            StreamType::Ac3Audio => PMT_STREAM_TYPE_AC3_AUDIO,
            StreamType::Mpeg2Video => PMT_STREAM_TYPE_MPEG2_VIDEO,
            StreamType::H264Video => PMT_STREAM_TYPE_H264_VIDEO,
            StreamType::Unknown => 0,
        }
    }

    pub fn is_audio(self) -> bool {
        matches!(
            self,
            StreamType::Mpeg1Audio
                | StreamType::Mpeg2Audio
                | StreamType::AacAudio
                | StreamType::Ac3Audio
        )
    }

    pub fn is_video(self) -> bool {
        matches!(self, StreamType::Mpeg2Video | StreamType::H264Video)
    }
}

const TICKS_MASK: u64 = (1 << 33) - 1;
const TICKS_HALF_RANGE: u64 = 1 << 32;

/// Optional 33-bit 90 kHz timestamp with wrap-aware ordering and
/// arithmetic. Used both as a point in stream time (PCR/PTS/DTS) and as a
/// duration; negative deltas are represented by wrap-around.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeStamp {
    ticks: u64,
    valid: bool,
}

impl TimeStamp {
    pub fn invalid() -> Self {
        TimeStamp::default()
    }

    pub fn zero() -> Self {
        TimeStamp {
            ticks: 0,
            valid: true,
        }
    }

    pub fn from_90khz(ticks: u64) -> Self {
        TimeStamp {
            ticks: ticks & TICKS_MASK,
            valid: true,
        }
    }

    pub fn from_millis(ms: u64) -> Self {
        TimeStamp::from_90khz(ms.wrapping_mul(90))
    }

    /// Signed tick count; negative values wrap.
    pub fn from_ticks_delta(delta: i64) -> Self {
        TimeStamp::from_90khz(delta as u64)
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn invalidate(&mut self) {
        self.valid = false;
        self.ticks = 0;
    }

    pub fn as_90khz(&self) -> u64 {
        self.ticks
    }

    /// Signed interpretation, for values known to be (small) deltas.
    pub fn as_ticks_delta(&self) -> i64 {
        if self.ticks >= TICKS_HALF_RANGE {
            self.ticks as i64 - (TICKS_MASK as i64 + 1)
        } else {
            self.ticks as i64
        }
    }

    pub fn as_millis(&self) -> i64 {
        self.as_ticks_delta() / 90
    }

    /// Wrap-aware signed distance `self - other` in ticks. Both must be
    /// valid and within half the clock range of each other.
    pub fn diff(&self, other: &TimeStamp) -> i64 {
        let d = self.ticks.wrapping_sub(other.ticks) & TICKS_MASK;
        if d >= TICKS_HALF_RANGE {
            d as i64 - (TICKS_MASK as i64 + 1)
        } else {
            d as i64
        }
    }
}

impl PartialEq for TimeStamp {
    fn eq(&self, other: &Self) -> bool {
        self.valid == other.valid && (!self.valid || self.ticks == other.ticks)
    }
}

impl Eq for TimeStamp {}

impl PartialOrd for TimeStamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        if !self.valid || !other.valid {
            return None;
        }
        Some(self.diff(other).cmp(&0))
    }
}

impl Add for TimeStamp {
    type Output = TimeStamp;

    fn add(self, rhs: TimeStamp) -> TimeStamp {
        TimeStamp {
            ticks: self.ticks.wrapping_add(rhs.ticks) & TICKS_MASK,
            valid: self.valid && rhs.valid,
        }
    }
}

impl AddAssign for TimeStamp {
    fn add_assign(&mut self, rhs: TimeStamp) {
        *self = *self + rhs;
    }
}

impl Sub for TimeStamp {
    type Output = TimeStamp;

    fn sub(self, rhs: TimeStamp) -> TimeStamp {
        TimeStamp {
            ticks: self.ticks.wrapping_sub(rhs.ticks) & TICKS_MASK,
            valid: self.valid && rhs.valid,
        }
    }
}

impl SubAssign for TimeStamp {
    fn sub_assign(&mut self, rhs: TimeStamp) {
        *self = *self - rhs;
    }
}

impl fmt::Display for TimeStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.valid {
            write!(f, "{}", self.ticks)
        } else {
            write!(f, "<invalid>")
        }
    }
}

/// ISO 13818-1 Annex A CRC-32 as used by PSI sections.
pub fn crc32_13818(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            if crc & 0x8000_0000 != 0 {
                crc = (crc << 1) ^ 0x04C1_1DB7;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Sink for raw TS packet bytes.
pub trait PacketSink {
    fn put(&mut self, data: &[u8]);
}

impl PacketSink for Vec<u8> {
    fn put(&mut self, data: &[u8]) {
        self.extend_from_slice(data);
    }
}

/// Stream metadata forwarded alongside packet output: whether the bytes
/// are clear TS and which RAMS payload id produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamMetaData {
    pub is_clear_ts: bool,
    pub payload_id: Option<u8>,
}

impl StreamMetaData {
    pub fn clear_ts() -> Self {
        StreamMetaData {
            is_clear_ts: true,
            payload_id: None,
        }
    }

    pub fn clear_ts_with_id(payload_id: u8) -> Self {
        StreamMetaData {
            is_clear_ts: true,
            payload_id: Some(payload_id),
        }
    }

    /// The histogram id string for stall reports: "TS" for a plain
    /// transport stream, "RAMSnn" for RAMS payloads.
    pub fn stall_id(&self) -> String {
        match self.payload_id {
            Some(id) => format!("RAMS{:02}", id),
            None => "TS".to_string(),
        }
    }
}

/// Sink that also accepts metadata updates applying to subsequent puts.
pub trait PacketSinkWithMetaData: PacketSink {
    fn set_meta_data(&mut self, meta: &StreamMetaData);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_wraps_at_33_bits() {
        let near_wrap = TimeStamp::from_90khz(TICKS_MASK - 10);
        let after = near_wrap + TimeStamp::from_90khz(20);
        assert_eq!(after.as_90khz(), 9);
        assert!(after > near_wrap);
        assert_eq!(after.diff(&near_wrap), 20);
    }

    #[test]
    fn timestamp_ordering_is_wrap_aware() {
        let a = TimeStamp::from_90khz(100);
        let b = TimeStamp::from_90khz(200);
        assert!(a < b);
        assert!(b > a);
        assert_eq!(b.diff(&a), 100);
        assert_eq!(a.diff(&b), -100);
    }

    #[test]
    fn invalid_timestamps_do_not_compare() {
        let valid = TimeStamp::zero();
        let invalid = TimeStamp::invalid();
        assert!(valid.partial_cmp(&invalid).is_none());
        assert!(!(invalid < valid));
        assert!(!(invalid > valid));
    }

    #[test]
    fn negative_delta_round_trip() {
        let delta = TimeStamp::from_ticks_delta(-900);
        assert_eq!(delta.as_ticks_delta(), -900);
        assert_eq!(delta.as_millis(), -10);

        let pts = TimeStamp::from_90khz(1800);
        assert_eq!((pts + delta).as_90khz(), 900);
    }

    #[test]
    fn millisecond_conversion() {
        assert_eq!(TimeStamp::from_millis(10).as_90khz(), 900);
        assert_eq!(TimeStamp::from_millis(10).as_millis(), 10);
    }

    #[test]
    fn crc_matches_known_vector() {
        // CRC of an empty buffer is the init value
        assert_eq!(crc32_13818(&[]), 0xFFFF_FFFF);
        // Self-consistency: appending the CRC must be stable
        let data = [0x00u8, 0xB0, 0x0D, 0x00, 0x01, 0xC1, 0x00, 0x00];
        let crc = crc32_13818(&data);
        let mut with_crc = data.to_vec();
        with_crc.extend_from_slice(&crc.to_be_bytes());
        // A section including its CRC sums to zero remainder
        assert_eq!(crc32_13818(&with_crc), 0);
    }

    #[test]
    fn stream_type_mapping() {
        assert_eq!(StreamType::from_pmt(0x0F), StreamType::AacAudio);
        assert_eq!(StreamType::from_pmt(0x1B), StreamType::H264Video);
        assert_eq!(StreamType::from_pmt(0x81), StreamType::Ac3Audio);
        assert!(StreamType::AacAudio.is_audio());
        assert!(StreamType::H264Video.is_video());
        assert_eq!(StreamType::AacAudio.to_pmt(), 0x0F);
    }

    #[test]
    fn stall_id_formatting() {
        assert_eq!(StreamMetaData::clear_ts().stall_id(), "TS");
        assert_eq!(StreamMetaData::clear_ts_with_id(3).stall_id(), "RAMS03");
    }
}
