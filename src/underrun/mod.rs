//! Underrun mitigation pipeline.
//!
//! Keeps the outbound transport stream continuous across ingress stalls:
//! demultiplexes the incoming TS, runs each elementary stream through a
//! correction algorithm that can synthesize codec-valid filler frames, and
//! remultiplexes against an egress clock derived from the highest accepted
//! ingress PCR.

pub mod algorithm;
pub mod audio;
pub mod filler;
pub mod frame;
pub mod stream_buffer;
pub mod video;

pub use algorithm::{StreamFeed, UnderrunAlgorithmParams};
pub use frame::Frame;

use algorithm::{Passthrough, PtsFiddler};
use audio::AudioFillerFrameInserter;
use video::VideoFillerFrameInserter;

use crate::ts::demux::{TsDemux, TsEventSink};
use crate::ts::mux::{TsMux, MUX_ALL, MUX_FORCE_PCR, MUX_PCR};
use crate::ts::{PacketSink, PacketSinkWithMetaData, StreamMetaData, StreamType, TimeStamp};

use log::{info, warn};

// Like the RAMS clock, the egress clock runs 1/512 slow so it cannot
// overtake the ingress PCR in normal operation.
const CLOCK_SLOWDOWN_FRACTION: u16 = 512;

/// 10 ms in 90 kHz ticks: the largest logical PCR step the mux emits.
const PCR_STEP: i64 = 900;

/// Correction strategy per stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrectionMode {
    Off,
    AdjustPts,
    InsertFillerFrames,
}

/// Which elementary stream a setting applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStream {
    Audio,
    Video,
}

/// One stall detection, tagged with the stream id it occurred on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StallReport {
    pub id: String,
    pub is_audio: bool,
    pub duration: TimeStamp,
}

#[derive(Default)]
struct PcrCollector {
    events: Vec<(u64, bool)>,
}

impl TsEventSink for PcrCollector {
    fn pcr_received(&mut self, pcr_90khz: u64, has_discontinuity: bool) {
        self.events.push((pcr_90khz, has_discontinuity));
    }
}

/// The dual-stream underrun mitigator.
pub struct UnderrunMitigator {
    demux: TsDemux,
    mux: TsMux,
    video: StreamFeed,
    audio: StreamFeed,

    // Egress clock management
    is_time_set: bool,
    last_time: u16,
    clock_slowdown_remainder: u16,
    current_clock: TimeStamp,
    time_of_last_sent_output: TimeStamp,
    pcr_resync_threshold: u64,
    ingress_pcr_offset: i64,

    ingress_stream_time: TimeStamp,
    meta_data: StreamMetaData,
    stall_reports: Vec<StallReport>,
}

impl Default for UnderrunMitigator {
    fn default() -> Self {
        let mut mitigator = UnderrunMitigator {
            demux: TsDemux::new(),
            mux: TsMux::new(),
            video: StreamFeed::new(
                false,
                UnderrunAlgorithmParams::default(),
                Box::new(VideoFillerFrameInserter::new()),
            ),
            audio: StreamFeed::new(
                true,
                UnderrunAlgorithmParams::default(),
                Box::new(AudioFillerFrameInserter::new()),
            ),
            is_time_set: false,
            last_time: 0,
            clock_slowdown_remainder: 0,
            current_clock: TimeStamp::invalid(),
            time_of_last_sent_output: TimeStamp::invalid(),
            pcr_resync_threshold: 0,
            ingress_pcr_offset: 0,
            ingress_stream_time: TimeStamp::invalid(),
            meta_data: StreamMetaData::clear_ts(),
            stall_reports: Vec::new(),
        };
        mitigator.reinitialize();
        mitigator
    }
}

impl UnderrunMitigator {
    pub fn new() -> Self {
        UnderrunMitigator::default()
    }

    /// Restore correction modes and all tuning parameters to defaults,
    /// then reset the dynamic state.
    pub fn reinitialize(&mut self) {
        self.set_correction_mode(PipelineStream::Audio, CorrectionMode::InsertFillerFrames);
        self.set_correction_mode(PipelineStream::Video, CorrectionMode::InsertFillerFrames);
        self.reset();

        self.video.params = UnderrunAlgorithmParams {
            clock_granularity_and_jitter: TimeStamp::from_millis(12),
            min_frame_distance: TimeStamp::from_millis(15),
            min_delay: TimeStamp::from_millis(0),
            default_filler_frame_duration: TimeStamp::from_millis(45),
            delay: TimeStamp::from_millis(5),
            repeated_frame_count: 0,
        };
        self.audio.params = UnderrunAlgorithmParams {
            clock_granularity_and_jitter: TimeStamp::from_millis(12),
            min_frame_distance: TimeStamp::from_millis(5),
            min_delay: TimeStamp::from_millis(0),
            default_filler_frame_duration: TimeStamp::from_millis(1000), // Unused
            delay: TimeStamp::from_millis(15),
            repeated_frame_count: 1,
        };
    }

    pub fn reset(&mut self) {
        self.demux.reset();
        self.video.clear();
        self.audio.clear();
        self.mux.reset();

        self.is_time_set = false;
        self.last_time = 0;
        self.clock_slowdown_remainder = 0;
        self.current_clock.invalidate();
        self.time_of_last_sent_output.invalidate();
        self.ingress_pcr_offset = 0;

        self.ingress_stream_time.invalidate();
        self.stall_reports.clear();
    }

    pub fn set_correction_mode(&mut self, stream: PipelineStream, mode: CorrectionMode) {
        let feed = match stream {
            PipelineStream::Audio => &mut self.audio,
            PipelineStream::Video => &mut self.video,
        };
        match (stream, mode) {
            (_, CorrectionMode::Off) => feed.set_algorithm(Box::new(Passthrough)),
            (_, CorrectionMode::AdjustPts) => feed.set_algorithm(Box::<PtsFiddler>::default()),
            (PipelineStream::Audio, CorrectionMode::InsertFillerFrames) => {
                feed.set_algorithm(Box::new(AudioFillerFrameInserter::new()))
            }
            (PipelineStream::Video, CorrectionMode::InsertFillerFrames) => {
                feed.set_algorithm(Box::new(VideoFillerFrameInserter::new()))
            }
        }
    }

    pub fn set_preferred_language(&mut self, language: &str) {
        self.demux.set_preferred_language(language);
    }

    /// Apply one named tuning parameter from underrun_mitigation_control.
    pub fn set_parameter(&mut self, key: &str, value: &str) -> bool {
        fn millis(value: &str) -> Option<TimeStamp> {
            value.parse::<u64>().ok().map(TimeStamp::from_millis)
        }

        let handled = match key {
            "correction_mode" => {
                let mode = match value {
                    "off" => Some(CorrectionMode::Off),
                    "adjust_pts" => Some(CorrectionMode::AdjustPts),
                    "insert_filler_frames" => Some(CorrectionMode::InsertFillerFrames),
                    _ => None,
                };
                match mode {
                    Some(mode) => {
                        self.set_correction_mode(PipelineStream::Audio, mode);
                        self.set_correction_mode(PipelineStream::Video, mode);
                        true
                    }
                    None => false,
                }
            }
            "audio_delay" => millis(value).map(|t| self.audio.params.delay = t).is_some(),
            "video_delay" => millis(value).map(|t| self.video.params.delay = t).is_some(),
            "audio_min_delay" => millis(value).map(|t| self.audio.params.min_delay = t).is_some(),
            "video_min_delay" => millis(value).map(|t| self.video.params.min_delay = t).is_some(),
            "audio_min_frame_distance" => millis(value)
                .map(|t| self.audio.params.min_frame_distance = t)
                .is_some(),
            "video_min_frame_distance" => millis(value)
                .map(|t| self.video.params.min_frame_distance = t)
                .is_some(),
            "audio_jitter" => millis(value)
                .map(|t| self.audio.params.clock_granularity_and_jitter = t)
                .is_some(),
            "video_jitter" => millis(value)
                .map(|t| self.video.params.clock_granularity_and_jitter = t)
                .is_some(),
            "video_filler_duration" => millis(value)
                .map(|t| self.video.params.default_filler_frame_duration = t)
                .is_some(),
            "audio_repeated_frame_count" => match value.parse::<u32>() {
                Ok(n) => {
                    self.audio.params.repeated_frame_count = n;
                    true
                }
                Err(_) => false,
            },
            "pcr_resync_threshold" => match millis(value) {
                Some(t) => {
                    self.pcr_resync_threshold = t.as_90khz();
                    true
                }
                None => false,
            },
            _ => false,
        };

        if !handled {
            warn!("Unknown underrun mitigation parameter {}={}", key, value);
        }
        handled
    }

    /// Ingress stream time (last ingress PCR), for status reporting.
    pub fn current_stream_time(&self) -> TimeStamp {
        self.ingress_stream_time
    }

    /// The larger of the two per-stream accumulated stall durations.
    pub fn stalled_duration(&self) -> TimeStamp {
        let audio = self.audio.stalled_duration();
        let video = self.video.stalled_duration();
        if audio > video {
            audio
        } else {
            video
        }
    }

    /// Filler recovery is handled internally; no compositor correction.
    pub fn pcr_delay(&self) -> TimeStamp {
        TimeStamp::invalid()
    }

    /// Drain pending stall reports.
    pub fn take_stall_reports(&mut self) -> Vec<StallReport> {
        std::mem::take(&mut self.stall_reports)
    }

    /// Feed ingress TS bytes.
    pub fn put(&mut self, data: &[u8]) {
        let mut pcrs = PcrCollector::default();
        self.demux
            .put(data, &mut self.video.buffer, &mut self.audio.buffer, &mut pcrs);
        for (pcr, discontinuity) in pcrs.events {
            self.pcr_received(pcr, discontinuity);
        }
    }

    pub fn set_meta_data(&mut self, meta: &StreamMetaData) {
        self.meta_data = *meta;
    }

    fn pcr_received(&mut self, pcr_90khz: u64, mut has_discontinuity: bool) {
        let mut synchronize = true;
        if self.is_time_set && self.current_clock.is_valid() {
            let corrected = TimeStamp::from_90khz((pcr_90khz as i64 + self.ingress_pcr_offset) as u64);
            let lead = corrected.diff(&self.current_clock);
            if lead < 0 {
                let lag = (-lead) as u64;
                if self.pcr_resync_threshold != 0 && lag >= self.pcr_resync_threshold {
                    info!("Resyncing large PCR delta: {}", lag);
                    // An unsignaled time jump is treated like a signaled one
                    has_discontinuity = true;
                }
                synchronize = false;
            }

            if has_discontinuity {
                // Rebase so the egress PCR appears continuous, and realign
                // all later ingress PTS/DTS values by the same amount
                self.ingress_pcr_offset -= lead;
                info!("Resyncing PCR discontinuity: {}", lead);
                let delta = TimeStamp::from_ticks_delta(-lead);
                self.audio.buffer.add_pts_correction_delta(delta);
                self.video.buffer.add_pts_correction_delta(delta);
                synchronize = false; // The clock does not change either way
            }
        }

        if synchronize {
            self.current_clock =
                TimeStamp::from_90khz((pcr_90khz as i64 + self.ingress_pcr_offset) as u64);
        }

        self.ingress_stream_time = TimeStamp::from_90khz(pcr_90khz);
    }

    /// Advance the real-time clock and emit any egress packets that are
    /// due. Call every 10 ms.
    pub fn set_current_time(&mut self, time_ms: u16, out: &mut dyn PacketSink) {
        if !self.is_time_set {
            self.last_time = time_ms;
            self.is_time_set = true;
            return;
        }

        let mut delta = time_ms.wrapping_sub(self.last_time);
        if delta > 100 {
            warn!("Clock tick delta={}ms", delta);
        }
        self.last_time = time_ms;

        if !self.current_clock.is_valid() {
            // We can't generate data without a clock
            return;
        }

        self.clock_slowdown_remainder += delta;
        delta -= self.clock_slowdown_remainder / CLOCK_SLOWDOWN_FRACTION;
        self.clock_slowdown_remainder %= CLOCK_SLOWDOWN_FRACTION;

        if delta == 0 {
            return;
        }

        self.current_clock += TimeStamp::from_millis(delta as u64);
        self.generate_output(out);
        self.collect_stalls();
    }

    fn generate_output(&mut self, out: &mut dyn PacketSink) {
        // Bound logical PCR steps to 10 ms so stream timing stays correct
        // even across big jumps of the mitigator clock
        if self.time_of_last_sent_output.is_valid() {
            while self.current_clock.diff(&self.time_of_last_sent_output) > PCR_STEP {
                self.time_of_last_sent_output += TimeStamp::from_90khz(PCR_STEP as u64);
                self.mux.mux_packets(
                    self.time_of_last_sent_output,
                    MUX_PCR,
                    1,
                    None,
                    None,
                    out,
                );
            }
        }

        // Send all data first, then the PCR, so every frame sent is
        // formally on time
        let video = has_stream(&self.video).then_some(&mut self.video as &mut dyn crate::ts::mux::DataSource);
        let audio = has_stream(&self.audio).then_some(&mut self.audio as &mut dyn crate::ts::mux::DataSource);
        let sent = self.mux.mux_packets(
            self.current_clock,
            MUX_ALL & !MUX_PCR,
            usize::MAX,
            video,
            audio,
            out,
        );
        if sent > 0 {
            self.time_of_last_sent_output = self.current_clock;
            self.mux
                .mux_packets(self.current_clock, MUX_FORCE_PCR, 1, None, None, out);
        }
    }

    fn collect_stalls(&mut self) {
        let id = self.meta_data.stall_id();
        for event in self.audio.take_stall_events() {
            self.stall_reports.push(StallReport {
                id: id.clone(),
                is_audio: event.is_audio,
                duration: event.duration,
            });
        }
        for event in self.video.take_stall_events() {
            self.stall_reports.push(StallReport {
                id: id.clone(),
                is_audio: event.is_audio,
                duration: event.duration,
            });
        }
    }
}

fn has_stream(feed: &StreamFeed) -> bool {
    feed.buffer.stream_type() != StreamType::Unknown
}

impl PacketSink for UnderrunMitigator {
    fn put(&mut self, data: &[u8]) {
        UnderrunMitigator::put(self, data);
    }
}

impl PacketSinkWithMetaData for UnderrunMitigator {
    fn set_meta_data(&mut self, meta: &StreamMetaData) {
        UnderrunMitigator::set_meta_data(self, meta);
    }
}
