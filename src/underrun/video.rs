//! Video filler frame insertion.
//!
//! Video frames cannot be dropped (they build on each other), but their
//! timing is elastic: latency is recovered by compressing the distance
//! between frames, and stalls are bridged with codec-valid skip pictures
//! inserted at the default filler spacing.

use super::algorithm::{AlgoContext, UnderrunAlgorithm};
use super::filler::{video_creator_for, FillerFrameCreator};
use super::frame::Frame;
use crate::ts::TimeStamp;

use log::{info, warn};

#[derive(Default)]
pub struct VideoFillerFrameInserter {
    last_dts: TimeStamp,
    delay: TimeStamp,
    creator: Option<Box<dyn FillerFrameCreator>>,
}

impl VideoFillerFrameInserter {
    pub fn new() -> Self {
        VideoFillerFrameInserter {
            delay: TimeStamp::zero(),
            ..VideoFillerFrameInserter::default()
        }
    }

    fn process_new_frame(&mut self, ctx: &mut AlgoContext, frame: &mut Frame) {
        let stream_type = ctx.source.stream_type();
        let stale = match &self.creator {
            Some(creator) => creator.stream_type() != stream_type,
            None => true,
        };
        if stale {
            self.creator = video_creator_for(stream_type);
        }

        if let Some(creator) = &mut self.creator {
            creator.process_incoming_frame(frame);
        }
    }
}

impl UnderrunAlgorithm for VideoFillerFrameInserter {
    fn next_frame(&mut self, ctx: &mut AlgoContext, pcr: TimeStamp) -> Option<Frame> {
        match ctx.source.frame_if_available() {
            Some(mut frame) => {
                let dts = if frame.dts.is_valid() { frame.dts } else { frame.pts };
                if !dts.is_valid() {
                    warn!("Cannot process frame with invalid PTS");
                    return Some(frame);
                }

                // Learn the stream so a matching filler can be created
                self.process_new_frame(ctx, &mut frame);

                // Check whether there's an underrun already
                let mut egress_dts = dts + self.delay + ctx.params.delay;
                if egress_dts < pcr + ctx.params.min_delay {
                    // Normally only seen at start-up, before fillers exist
                    let lag = pcr + ctx.params.min_delay - egress_dts;
                    self.delay += lag;
                    egress_dts += lag;
                    info!(
                        "Regular video frame has underrun of {}ms, adapting PTS, delay={}ms",
                        lag.as_millis(),
                        self.delay.as_millis()
                    );
                }

                // Recover latency by speeding up playback
                if self.delay > TimeStamp::zero() && self.last_dts.is_valid() {
                    let duration = dts - self.last_dts; // Expected frame duration
                    let comfortable = pcr
                        + ctx.params.min_delay
                        + ctx.params.clock_granularity_and_jitter
                        + duration;
                    if egress_dts >= comfortable {
                        let correction = if duration > ctx.params.min_frame_distance {
                            duration - ctx.params.min_frame_distance
                        } else {
                            TimeStamp::zero()
                        };
                        if self.delay >= correction {
                            self.delay -= correction;
                        } else {
                            self.delay = TimeStamp::zero();
                        }
                        info!(
                            "Recovering latency by speeding-up playback, delay={}ms",
                            self.delay.as_millis()
                        );
                    }
                }

                self.last_dts = dts;

                // Transform to egress PTS/DTS
                frame.pts += self.delay + ctx.params.delay;
                if frame.dts.is_valid() {
                    frame.dts += self.delay + ctx.params.delay;
                }

                if self.delay > TimeStamp::zero() {
                    ctx.delays.push(self.delay);
                }

                Some(frame)
            }

            None => {
                // The last frame is extended by the filler spacing
                if !self.last_dts.is_valid() {
                    return None;
                }

                let next_pts = self.last_dts
                    + ctx.params.default_filler_frame_duration
                    + self.delay
                    + ctx.params.delay;
                if next_pts >= pcr + ctx.params.min_delay + ctx.params.clock_granularity_and_jitter
                {
                    return None;
                }

                let mut frame = match &mut self.creator {
                    Some(creator) => creator.create()?,
                    None => return None,
                };
                debug_assert!(!frame.data.is_empty());
                self.delay += ctx.params.default_filler_frame_duration;
                frame.pts = next_pts;
                info!(
                    "Inserting filler frame after {}ms, delay={}ms",
                    ctx.params.default_filler_frame_duration.as_millis(),
                    self.delay.as_millis()
                );
                Some(frame)
            }
        }
    }

    fn clear(&mut self) {
        *self = VideoFillerFrameInserter::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::underrun::algorithm::UnderrunAlgorithmParams;
    use crate::underrun::stream_buffer::StreamBuffer;
    use crate::ts::demux::DataSink;
    use crate::ts::StreamType;
    use crate::utils::bits::BitWriter;

    /// An MPEG-2 frame with sequence + picture header.
    fn push_mpeg2_frame(buffer: &mut StreamBuffer, dts_ticks: u64) {
        let mut out = BitWriter::new();
        out.write(0x000001B3, 32);
        out.write(176, 12);
        out.write(144, 12);
        out.write(1, 4);
        out.write(3, 4);
        out.align();
        out.write(0x00000100, 32);
        out.write(0, 10);
        out.write(1, 3);
        out.write(0xFFFF, 16);
        out.align();
        out.write(0x000001B7, 32);
        let data = out.into_bytes();

        buffer.new_stream(StreamType::Mpeg2Video, "");
        buffer.pes_header(
            TimeStamp::from_90khz(dts_ticks),
            TimeStamp::from_90khz(dts_ticks),
            data.len() as u32,
        );
        buffer.parse(&data);
    }

    fn params() -> UnderrunAlgorithmParams {
        UnderrunAlgorithmParams {
            clock_granularity_and_jitter: TimeStamp::from_millis(12),
            min_frame_distance: TimeStamp::from_millis(15),
            min_delay: TimeStamp::zero(),
            default_filler_frame_duration: TimeStamp::from_millis(45),
            delay: TimeStamp::from_millis(5),
            repeated_frame_count: 0,
        }
    }

    #[test]
    fn skip_picture_bridges_a_stall() {
        let mut inserter = VideoFillerFrameInserter::new();
        let mut buffer = StreamBuffer::new();
        let params = params();
        let mut delays = Vec::new();

        // Two frames 40 ms apart, then the stream stops
        push_mpeg2_frame(&mut buffer, 0);
        push_mpeg2_frame(&mut buffer, 3600);
        for _ in 0..2 {
            let mut ctx = AlgoContext {
                source: &mut buffer,
                params: &params,
                delays: &mut delays,
            };
            assert!(inserter.next_frame(&mut ctx, TimeStamp::zero()).is_some());
        }

        // Not yet due
        let mut ctx = AlgoContext {
            source: &mut buffer,
            params: &params,
            delays: &mut delays,
        };
        assert!(inserter
            .next_frame(&mut ctx, TimeStamp::from_millis(60))
            .is_none());

        // Past last_dts + filler duration + delay + jitter: filler appears
        let mut ctx = AlgoContext {
            source: &mut buffer,
            params: &params,
            delays: &mut delays,
        };
        let filler = inserter
            .next_frame(&mut ctx, TimeStamp::from_millis(120))
            .expect("filler frame");
        // last dts 40 ms + 45 ms filler spacing + 5 ms base delay
        assert_eq!(filler.pts.as_millis(), 90);
        assert_eq!(inserter.delay.as_millis(), 45);
        // The synthesized picture is a P-picture
        assert_eq!(&filler.data[..4], &[0, 0, 1, 0]);
    }

    #[test]
    fn delay_shrinks_when_frames_run_early() {
        let mut inserter = VideoFillerFrameInserter::new();
        let mut buffer = StreamBuffer::new();
        let params = params();
        let mut delays = Vec::new();

        push_mpeg2_frame(&mut buffer, 0);
        let mut ctx = AlgoContext {
            source: &mut buffer,
            params: &params,
            delays: &mut delays,
        };
        inserter.next_frame(&mut ctx, TimeStamp::zero());

        // Force some accumulated delay
        inserter.delay = TimeStamp::from_millis(100);

        // A frame 40 ms after the previous one, comfortably early
        push_mpeg2_frame(&mut buffer, 3600);
        let mut ctx = AlgoContext {
            source: &mut buffer,
            params: &params,
            delays: &mut delays,
        };
        let frame = inserter.next_frame(&mut ctx, TimeStamp::zero()).unwrap();

        // Recovered duration - min_frame_distance = 25 ms
        assert_eq!(inserter.delay.as_millis(), 75);
        assert_eq!(frame.dts.as_millis(), 40 + 75 + 5);
    }
}
