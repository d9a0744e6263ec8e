//! Audio filler frame insertion.
//!
//! Audio frames must stay back-to-back: each filler's PTS continues
//! exactly where the previous frame ended, and latency is recovered by
//! dropping whole frames. The most recent real frame is repeated a
//! configurable number of times before switching to true silence frames.

use super::algorithm::{AlgoContext, UnderrunAlgorithm};
use super::filler::{audio_creator_for, FillerFrameCreator};
use super::frame::Frame;
use crate::ts::TimeStamp;

use log::{info, warn};

#[derive(Default)]
pub struct AudioFillerFrameInserter {
    last_audio_frame: Frame,
    repeat_count: u32,
    delay: TimeStamp,
    creator: Option<Box<dyn FillerFrameCreator>>,
}

impl AudioFillerFrameInserter {
    pub fn new() -> Self {
        AudioFillerFrameInserter {
            delay: TimeStamp::zero(),
            ..AudioFillerFrameInserter::default()
        }
    }

    fn process_new_frame(&mut self, ctx: &mut AlgoContext, frame: &mut Frame) {
        self.repeat_count = 0;

        let stream_type = ctx.source.stream_type();
        let stale = match &self.creator {
            Some(creator) => creator.stream_type() != stream_type,
            None => true,
        };
        if stale {
            info!("Creating new audio filler frame creator");
            self.creator = audio_creator_for(stream_type);
        }

        if let Some(creator) = &mut self.creator {
            creator.process_incoming_frame(frame);
        }
    }

    fn generate_filler_frame(&mut self, params_repeat_count: u32) -> Frame {
        self.repeat_count += 1;
        if self.repeat_count > params_repeat_count {
            if let Some(creator) = &mut self.creator {
                if let Some(frame) = creator.create() {
                    return frame;
                }
            }
        }
        self.last_audio_frame.clone()
    }
}

impl UnderrunAlgorithm for AudioFillerFrameInserter {
    fn next_frame(&mut self, ctx: &mut AlgoContext, pcr: TimeStamp) -> Option<Frame> {
        loop {
            match ctx.source.frame_if_available() {
                Some(mut frame) => {
                    if !frame.pts.is_valid() {
                        warn!("Cannot process frame with invalid PTS");
                        return Some(frame);
                    }

                    // Learn the stream and compute the frame duration
                    self.process_new_frame(ctx, &mut frame);

                    // Keep the last ingress PTS and duration for fillers
                    self.last_audio_frame = frame.clone();

                    // Transform to egress PTS
                    frame.pts += self.delay + ctx.params.delay;

                    if frame.pts < pcr + ctx.params.min_delay {
                        // Underrun while a frame is present; normally only
                        // seen at start-up before fillers can be made
                        let lag = pcr + ctx.params.min_delay - frame.pts;
                        self.delay += lag;
                        frame.pts += lag;
                        info!(
                            "Regular audio frame has underrun of {}ms, adapting PTS, delay={}ms",
                            lag.as_millis(),
                            self.delay.as_millis()
                        );
                    }

                    // Recover latency by skipping a frame when we run early
                    if self.delay > TimeStamp::zero() && frame.duration.is_valid() {
                        let comfortable = pcr
                            + ctx.params.min_delay
                            + ctx.params.clock_granularity_and_jitter
                            + frame.duration;
                        if frame.pts >= comfortable && self.delay >= frame.duration {
                            self.delay -= frame.duration;
                            info!(
                                "Recovering latency by skipping a frame, length={}ms, delay={}ms",
                                frame.duration.as_millis(),
                                self.delay.as_millis()
                            );
                            continue; // Retry with the next frame
                        }
                    }

                    if self.delay > TimeStamp::zero() {
                        ctx.delays.push(self.delay);
                    }

                    return Some(frame);
                }

                None => {
                    // No frame; synthesize one if the stream would starve
                    if !self.last_audio_frame.pts.is_valid()
                        || !self.last_audio_frame.duration.is_valid()
                    {
                        return None;
                    }

                    let next_pts = self.last_audio_frame.pts
                        + self.last_audio_frame.duration
                        + self.delay
                        + ctx.params.delay;
                    if next_pts
                        >= pcr + ctx.params.min_delay + ctx.params.clock_granularity_and_jitter
                    {
                        return None;
                    }

                    let mut frame = self.generate_filler_frame(ctx.params.repeated_frame_count);
                    if frame.data.is_empty() {
                        return None;
                    }
                    debug_assert!(frame.duration.is_valid());
                    self.delay += frame.duration;
                    frame.pts = next_pts;
                    info!(
                        "Inserting filler frame, length={}ms, delay={}ms",
                        frame.duration.as_millis(),
                        self.delay.as_millis()
                    );
                    return Some(frame);
                }
            }
        }
    }

    fn clear(&mut self) {
        *self = AudioFillerFrameInserter::new();
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

    /// A real ADTS frame (48 kHz stereo) delivered through the buffer.
    fn push_aac_frame(buffer: &mut StreamBuffer, pts_ticks: u64) {
        let mut out = BitWriter::new();
        out.write(0xFFF, 12);
        out.write(1, 1);
        out.write(0, 2);
        out.write(1, 1);
        out.write(1, 2);
        out.write(3, 4); // 48 kHz
        out.write(0, 1);
        out.write(2, 3); // stereo
        out.write(0, 2);
        out.write(0, 2);
        out.write(7 + 16, 13);
        out.write(0x7FF, 11);
        out.write(0, 2);
        let mut data = out.into_bytes();
        data.extend_from_slice(&[0u8; 16]);

        buffer.new_stream(StreamType::AacAudio, "");
        buffer.pes_header(
            TimeStamp::from_90khz(pts_ticks),
            TimeStamp::invalid(),
            data.len() as u32,
        );
        buffer.parse(&data);
    }

    fn params() -> UnderrunAlgorithmParams {
        UnderrunAlgorithmParams {
            clock_granularity_and_jitter: TimeStamp::from_millis(12),
            min_frame_distance: TimeStamp::from_millis(5),
            min_delay: TimeStamp::zero(),
            default_filler_frame_duration: TimeStamp::from_millis(1000),
            delay: TimeStamp::from_millis(15),
            repeated_frame_count: 1,
        }
    }

    #[test]
    fn filler_appears_when_stream_stalls() {
        let mut inserter = AudioFillerFrameInserter::new();
        let mut buffer = StreamBuffer::new();
        let params = params();
        let mut delays = Vec::new();

        // Three real frames 1920 ticks apart, then nothing
        for i in 0..3u64 {
            push_aac_frame(&mut buffer, i * 1920);
        }

        let mut pcr = TimeStamp::zero();
        for _ in 0..3 {
            let mut ctx = AlgoContext {
                source: &mut buffer,
                params: &params,
                delays: &mut delays,
            };
            assert!(inserter.next_frame(&mut ctx, pcr).is_some());
        }

        // PCR advances past the end of the last frame
        pcr = TimeStamp::from_90khz(3 * 1920 + 900);
        let mut ctx = AlgoContext {
            source: &mut buffer,
            params: &params,
            delays: &mut delays,
        };
        let filler = inserter.next_frame(&mut ctx, pcr).expect("filler frame");

        // First filler is a repeat of the last real frame, placed
        // immediately after it (plus the configured base delay)
        assert_eq!(filler.pts.as_90khz(), 2 * 1920 + 1920 + 15 * 90);
        assert!(filler.duration.as_90khz() > 0);
        assert_eq!(inserter.delay.as_90khz(), filler.duration.as_90khz());

        // The second filler is a true silence frame (repeat budget of 1
        // exhausted): 13 bytes of header + 2-channel silence payload
        let pcr = TimeStamp::from_90khz(3 * 1920 + 1920 + 900);
        let mut ctx = AlgoContext {
            source: &mut buffer,
            params: &params,
            delays: &mut delays,
        };
        let silence = inserter.next_frame(&mut ctx, pcr).expect("silence frame");
        assert_eq!(silence.data.len(), 13);
    }

    #[test]
    fn no_filler_while_on_time() {
        let mut inserter = AudioFillerFrameInserter::new();
        let mut buffer = StreamBuffer::new();
        let params = params();
        let mut delays = Vec::new();

        push_aac_frame(&mut buffer, 90000);
        let mut ctx = AlgoContext {
            source: &mut buffer,
            params: &params,
            delays: &mut delays,
        };
        assert!(inserter.next_frame(&mut ctx, TimeStamp::zero()).is_some());

        // Next frame would only be due far in the future
        let mut ctx = AlgoContext {
            source: &mut buffer,
            params: &params,
            delays: &mut delays,
        };
        assert!(inserter.next_frame(&mut ctx, TimeStamp::zero()).is_none());
    }

    #[test]
    fn late_real_frame_absorbs_lag_into_delay() {
        let mut inserter = AudioFillerFrameInserter::new();
        let mut buffer = StreamBuffer::new();
        let mut params = params();
        params.delay = TimeStamp::zero();
        let mut delays = Vec::new();

        push_aac_frame(&mut buffer, 0);
        let pcr = TimeStamp::from_millis(100);
        let mut ctx = AlgoContext {
            source: &mut buffer,
            params: &params,
            delays: &mut delays,
        };
        let frame = inserter.next_frame(&mut ctx, pcr).unwrap();
        assert_eq!(frame.pts.as_millis(), 100);
        assert_eq!(inserter.delay.as_millis(), 100);
        assert_eq!(delays.len(), 1);
    }
}
