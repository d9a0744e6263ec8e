//! Client report accumulators and their transmission policy.
//!
//! The session owns one accumulator per report stream (playback, latency,
//! log), each wrapped by a [`ReportManager`] that decides *when* a report
//! goes out: triggered on update, periodically, or as a one-shot. The
//! managers hold no report data; serialization lives in the codec.

use crate::protocol::messages::LogLevel;

use std::collections::BTreeMap;
use std::time::Instant;

/// Stalled-duration histogram bin lower edges in milliseconds; the last
/// bin is open-ended.
const STALL_BIN_EDGES: [u32; 10] = [1, 20, 40, 79, 157, 313, 626, 1251, 2501, 5001];

/// Fixed-bin histogram of stall durations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Histogram {
    bins: [u32; STALL_BIN_EDGES.len()],
}

impl Histogram {
    pub fn accumulate(&mut self, value_ms: u32) {
        let index = STALL_BIN_EDGES
            .iter()
            .take_while(|&&edge| edge <= value_ms)
            .count()
            .saturating_sub(1);
        self.bins[index] += 1;
    }

    pub fn bins(&self) -> &[u32] {
        &self.bins
    }

    fn format_into(&self, out: &mut String, name: &str) {
        out.push_str(",\"");
        out.push_str(name);
        out.push_str("\":[");
        for (i, bin) in self.bins.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&bin.to_string());
        }
        out.push(']');
    }
}

/// Coarse player state as reported to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Starting,
    Playing,
    Stalled,
    Stopped,
}

impl PlaybackState {
    pub fn as_str(self) -> &'static str {
        match self {
            PlaybackState::Starting => "starting",
            PlaybackState::Playing => "playing",
            PlaybackState::Stalled => "stalled",
            PlaybackState::Stopped => "stopped",
        }
    }
}

/// Playback report accumulator. All fields are optional; unset fields are
/// omitted from the serialized report.
#[derive(Debug, Default)]
pub struct PlaybackReport {
    pub playback_state: Option<PlaybackState>,
    pub stalled_duration_ms: Option<u32>,
    pub current_pts: Option<u64>,
    pub pcr_delay: Option<u32>,
    pub bandwidth: Option<u32>,
    histograms: BTreeMap<String, (Option<Histogram>, Option<Histogram>)>,
}

impl PlaybackReport {
    pub fn new() -> Self {
        PlaybackReport::default()
    }

    pub fn reset(&mut self) {
        *self = PlaybackReport::default();
    }

    /// Accumulate one stall sample into the audio or video histogram of
    /// the given stream id, creating the histogram on first use.
    pub fn add_stalled_duration_sample(&mut self, id: &str, is_audio: bool, duration_ms: u32) {
        let entry = self.histograms.entry(id.to_string()).or_default();
        let histogram = if is_audio { &mut entry.0 } else { &mut entry.1 };
        histogram
            .get_or_insert_with(Histogram::default)
            .accumulate(duration_ms);
    }

    pub fn histogram(&self, id: &str, is_audio: bool) -> Option<&Histogram> {
        let entry = self.histograms.get(id)?;
        if is_audio {
            entry.0.as_ref()
        } else {
            entry.1.as_ref()
        }
    }

    /// Histograms as the `[{"id":…,"A":[…],"V":[…]},…]` field text, or
    /// empty when no samples were collected.
    pub fn format_histograms(&self) -> String {
        if self.histograms.is_empty() {
            return String::new();
        }
        let mut out = String::from("[");
        for (i, (id, (audio, video))) in self.histograms.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str("{\"id\":\"");
            out.push_str(id);
            out.push('"');
            if let Some(h) = audio {
                h.format_into(&mut out, "A");
            }
            if let Some(h) = video {
                h.format_into(&mut out, "V");
            }
            out.push('}');
        }
        out.push(']');
        out
    }
}

/// Latency measurement subtype labels on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencySubtype {
    SessionStartToStream,
    SessionStartToFirstPaint,
    SessionStartToComplete,
    KeyToDisplay,
    SessionStartBegin,
    SessionStartStream,
    SessionStartFirstPaintDisplay,
    SessionStartCompleteDisplay,
    KeySent,
    KeyDisplay,
}

impl LatencySubtype {
    pub fn as_str(self) -> &'static str {
        match self {
            LatencySubtype::SessionStartToStream => "session_start_to_stream",
            LatencySubtype::SessionStartToFirstPaint => "session_start_to_firstpaint",
            LatencySubtype::SessionStartToComplete => "session_start_to_complete",
            LatencySubtype::KeyToDisplay => "key_to_display",
            LatencySubtype::SessionStartBegin => "session_start_begin",
            LatencySubtype::SessionStartStream => "session_start_stream",
            LatencySubtype::SessionStartFirstPaintDisplay => "session_start_firstpaint_display",
            LatencySubtype::SessionStartCompleteDisplay => "session_start_complete_display",
            LatencySubtype::KeySent => "key_sent",
            LatencySubtype::KeyDisplay => "key_display",
        }
    }
}

/// One latency measurement entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatencyEntry {
    pub subtype: LatencySubtype,
    pub label: String,
    pub data: u64,
}

/// Measurement mode flags.
pub const MEASUREMENT_MODE_DURATION: u32 = 1 << 0;
pub const MEASUREMENT_MODE_EVENT: u32 = 1 << 1;

/// Latency report accumulator: parallel columns, reset after emission.
#[derive(Debug, Default)]
pub struct LatencyReport {
    measurement_mode: u32,
    entries: Vec<LatencyEntry>,
}

impl LatencyReport {
    pub fn new() -> Self {
        LatencyReport::default()
    }

    pub fn set_measurement_mode(&mut self, mode: u32) {
        self.measurement_mode = mode;
    }

    pub fn measurement_mode(&self) -> u32 {
        self.measurement_mode
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn add_entry(&mut self, subtype: LatencySubtype, label: &str, data: u64) {
        self.entries.push(LatencyEntry {
            subtype,
            label: label.to_string(),
            data,
        });
    }

    pub fn entries(&self) -> &[LatencyEntry] {
        &self.entries
    }
}

/// RFB-TV strings cannot exceed a u16 length.
const MAX_LOG_SIZE: usize = 65535;

const DEFAULT_MIN_LEVEL: LogLevel = LogLevel::Warning;

/// Log report accumulator: bounded text plus the maximum severity seen.
#[derive(Debug)]
pub struct LogReport {
    min_level: LogLevel,
    current_max_level: LogLevel,
    text: String,
}

impl Default for LogReport {
    fn default() -> Self {
        LogReport {
            min_level: DEFAULT_MIN_LEVEL,
            current_max_level: LogLevel::Debug,
            text: String::new(),
        }
    }
}

impl LogReport {
    pub fn new() -> Self {
        LogReport::default()
    }

    /// Logs below this level are not added.
    pub fn set_min_level(&mut self, level: LogLevel) {
        self.min_level = level;
        if self.text.is_empty() {
            self.current_max_level = level;
        }
    }

    pub fn reset(&mut self) {
        self.current_max_level = self.min_level;
        self.text.clear();
    }

    pub fn add_log(&mut self, level: LogLevel, text: &str) {
        // Level ordering is inverted: a numerically lower level is more severe
        if level > self.min_level {
            return;
        }

        if self.text.is_empty() || level < self.current_max_level {
            self.current_max_level = level;
        }

        if self.text.len() + text.len() > MAX_LOG_SIZE {
            let excess = self.text.len() + text.len() - MAX_LOG_SIZE;
            let mut cut = excess.min(self.text.len());
            while cut < self.text.len() && !self.text.is_char_boundary(cut) {
                cut += 1;
            }
            self.text = self.text.split_off(cut);
        }
        self.text.push_str(text);
    }

    /// Highest severity accumulated since the last reset.
    pub fn max_level(&self) -> LogLevel {
        self.current_max_level
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Scheduling policy around one report accumulator.
///
/// Triggered and periodic modes coexist; the caller transmits when a method
/// says so and then records the emission with [`ReportManager::mark_transmitted`].
#[derive(Debug, Default)]
pub struct ReportManager {
    triggered_enabled: bool,
    interval_ms: u32,
    last_triggered: Option<Instant>,
}

impl ReportManager {
    pub fn new() -> Self {
        ReportManager::default()
    }

    /// Enable triggered reporting. Returns true when triggered sending was
    /// just enabled, in which case a report must go out immediately.
    pub fn enable_triggered_reports(&mut self) -> bool {
        let newly_enabled = !self.triggered_enabled;
        self.triggered_enabled = true;
        newly_enabled
    }

    /// An interval of 0 disables periodic reporting.
    pub fn enable_periodic_reports(&mut self, interval_ms: u32) {
        self.interval_ms = interval_ms;
    }

    pub fn disable_reports(&mut self) {
        self.triggered_enabled = false;
        self.interval_ms = 0;
    }

    pub fn is_enabled(&self) -> bool {
        self.triggered_enabled || self.interval_ms > 0
    }

    /// The report content changed; transmit now?
    pub fn report_updated(&self) -> bool {
        self.triggered_enabled
    }

    /// Polling tick (100 ms granularity); transmit now?
    pub fn timer_tick(&self, now: Instant) -> bool {
        if self.interval_ms == 0 {
            return false;
        }
        match self.last_triggered {
            Some(last) => now.duration_since(last).as_millis() >= self.interval_ms as u128,
            None => true,
        }
    }

    /// Record an emission; every sent report counts for the periodic timer
    /// regardless of what triggered it.
    pub fn mark_transmitted(&mut self, now: Instant) {
        self.last_triggered = Some(now);
    }
}
