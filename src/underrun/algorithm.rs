//! Per-stream underrun algorithms and the frame feed that adapts them to
//! the multiplexer.

use super::frame::Frame;
use super::stream_buffer::StreamBuffer;
use crate::ts::mux::DataSource;
use crate::ts::{StreamType, TimeStamp};

use log::info;

/// Tuning parameters for one stream's underrun handling.
#[derive(Debug, Clone)]
pub struct UnderrunAlgorithmParams {
    /// Clock granularity plus internal processing jitter.
    pub clock_granularity_and_jitter: TimeStamp,
    /// Minimum spacing enforced between successive frames.
    pub min_frame_distance: TimeStamp,
    /// Decoder headroom: frames must be complete this far before their time.
    pub min_delay: TimeStamp,
    /// Spacing of synthesized video filler frames.
    pub default_filler_frame_duration: TimeStamp,
    /// Fixed delay added to every egress timestamp.
    pub delay: TimeStamp,
    /// How often the last real audio frame is repeated before switching to
    /// true silence frames.
    pub repeated_frame_count: u32,
}

impl Default for UnderrunAlgorithmParams {
    fn default() -> Self {
        UnderrunAlgorithmParams {
            clock_granularity_and_jitter: TimeStamp::zero(),
            min_frame_distance: TimeStamp::zero(),
            min_delay: TimeStamp::zero(),
            default_filler_frame_duration: TimeStamp::zero(),
            delay: TimeStamp::zero(),
            repeated_frame_count: 0,
        }
    }
}

/// What the algorithm sees each time the mux asks for data.
pub struct AlgoContext<'a> {
    pub source: &'a mut StreamBuffer,
    pub params: &'a UnderrunAlgorithmParams,
    /// Total delay observations; the feed turns deltas into stall reports.
    pub delays: &'a mut Vec<TimeStamp>,
}

/// One correction strategy: produce (and possibly modify or synthesize)
/// the next egress frame for the given PCR.
pub trait UnderrunAlgorithm: Send {
    fn next_frame(&mut self, ctx: &mut AlgoContext, pcr: TimeStamp) -> Option<Frame>;
    fn clear(&mut self);
}

/// No correction: frames pass through untouched.
#[derive(Default)]
pub struct Passthrough;

impl UnderrunAlgorithm for Passthrough {
    fn next_frame(&mut self, ctx: &mut AlgoContext, _pcr: TimeStamp) -> Option<Frame> {
        ctx.source.frame_if_available()
    }

    fn clear(&mut self) {}
}

/// Delay late frames instead of synthesizing: pushes DTS forward to keep
/// every frame decodable, at the cost of latency.
#[derive(Default)]
pub struct PtsFiddler {
    last_dts: TimeStamp,
}

impl UnderrunAlgorithm for PtsFiddler {
    fn next_frame(&mut self, ctx: &mut AlgoContext, pcr: TimeStamp) -> Option<Frame> {
        let mut frame = ctx.source.frame_if_available()?;

        let mut dts = if frame.dts.is_valid() { frame.dts } else { frame.pts };
        dts += ctx.params.delay;
        let original = dts;

        let earliest = pcr + ctx.params.min_delay;
        if dts < earliest {
            dts = earliest;
        }
        if self.last_dts.is_valid() {
            let spaced = self.last_dts + ctx.params.min_frame_distance;
            if dts < spaced {
                dts = spaced;
            }
        }

        if dts != original {
            let diff = dts - original;
            info!(
                "Adjusting DTS by {} ticks, PCR={}, size={}",
                diff.as_ticks_delta(),
                pcr,
                frame.data.len()
            );
            ctx.delays.push(diff);
        }

        if frame.dts.is_valid() {
            frame.pts += dts - frame.dts;
            frame.dts = dts;
        } else {
            frame.pts = dts;
        }
        self.last_dts = dts;

        Some(frame)
    }

    fn clear(&mut self) {
        self.last_dts.invalidate();
    }
}

/// One stall period detected by a feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StallEvent {
    pub is_audio: bool,
    pub duration: TimeStamp,
}

/// Owns one stream's buffer, parameters and algorithm, adapts the result
/// to the mux's [`DataSource`] pull interface, and tracks stalls.
pub struct StreamFeed {
    is_audio: bool,
    pub buffer: StreamBuffer,
    pub params: UnderrunAlgorithmParams,
    algorithm: Box<dyn UnderrunAlgorithm>,

    current_frame: Option<Frame>,
    n_read: usize,
    header_pending: bool,

    previous_delay: TimeStamp,
    accumulated_stalled_duration: TimeStamp,
    stall_events: Vec<StallEvent>,
    delays: Vec<TimeStamp>,
}

impl StreamFeed {
    pub fn new(is_audio: bool, params: UnderrunAlgorithmParams, algorithm: Box<dyn UnderrunAlgorithm>) -> Self {
        StreamFeed {
            is_audio,
            buffer: StreamBuffer::new(),
            params,
            algorithm,
            current_frame: None,
            n_read: 0,
            header_pending: false,
            previous_delay: TimeStamp::zero(),
            accumulated_stalled_duration: TimeStamp::zero(),
            stall_events: Vec::new(),
            delays: Vec::new(),
        }
    }

    pub fn set_algorithm(&mut self, algorithm: Box<dyn UnderrunAlgorithm>) {
        self.algorithm = algorithm;
    }

    /// Discard all frame state; used on stream (re)start.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.algorithm.clear();
        self.current_frame = None;
        self.n_read = 0;
        self.header_pending = false;
        self.previous_delay = TimeStamp::zero();
        self.accumulated_stalled_duration = TimeStamp::zero();
        self.stall_events.clear();
        self.delays.clear();
    }

    /// Total stalled time accumulated over all stall periods.
    pub fn stalled_duration(&self) -> TimeStamp {
        self.accumulated_stalled_duration
    }

    /// Drain pending stall reports.
    pub fn take_stall_events(&mut self) -> Vec<StallEvent> {
        std::mem::take(&mut self.stall_events)
    }

    /// Convert delay observations into stall periods. A growing delay is a
    /// stall; a shrinking one is latency recovery and goes unreported.
    fn process_delays(&mut self) {
        for delay in self.delays.drain(..) {
            if delay <= TimeStamp::zero() {
                continue;
            }
            let stall = delay - self.previous_delay;
            self.previous_delay = delay;
            if stall <= TimeStamp::zero() {
                continue;
            }
            self.accumulated_stalled_duration += stall;
            self.stall_events.push(StallEvent {
                is_audio: self.is_audio,
                duration: stall,
            });
        }
    }
}

impl DataSource for StreamFeed {
    fn stream_type(&self) -> StreamType {
        self.buffer.stream_type()
    }

    fn is_new_frame(&mut self) -> Option<(TimeStamp, TimeStamp)> {
        let frame = self.current_frame.as_ref()?;
        if self.header_pending && self.n_read == 0 {
            self.header_pending = false;
            Some((frame.pts, frame.dts))
        } else {
            None
        }
    }

    fn bytes_available(&mut self, pcr: TimeStamp) -> usize {
        // First call of each mux iteration: materialize the next frame if
        // none is pending, possibly synthesizing filler
        if self.current_frame.is_none() {
            let mut ctx = AlgoContext {
                source: &mut self.buffer,
                params: &self.params,
                delays: &mut self.delays,
            };
            if let Some(frame) = self.algorithm.next_frame(&mut ctx, pcr) {
                self.current_frame = Some(frame);
                self.n_read = 0;
                self.header_pending = true;
            }
            self.process_delays();
        }

        match &self.current_frame {
            Some(frame) => frame.data.len() - self.n_read,
            None => 0,
        }
    }

    fn data(&self) -> &[u8] {
        match &self.current_frame {
            Some(frame) => &frame.data[self.n_read..],
            None => &[],
        }
    }

    fn read_bytes(&mut self, n: usize) {
        if let Some(frame) = &self.current_frame {
            self.n_read += n;
            if self.n_read >= frame.data.len() {
                self.current_frame = None;
                self.n_read = 0;
                self.header_pending = false;
            }
        }
    }
}
