//! PES frame reassembly buffer between the demux and the underrun
//! algorithms.

use super::frame::Frame;
use crate::ts::demux::DataSink;
use crate::ts::{StreamType, TimeStamp};

use log::{info, warn};

use std::collections::VecDeque;

/// Collects PES payload into complete frames tagged with corrected
/// PTS/DTS values.
#[derive(Default)]
pub struct StreamBuffer {
    stream_type: StreamType,
    language: String,
    completed_frames: VecDeque<Frame>,
    current_frame: Option<Frame>,
    expected_payload_length: u32,
    pts_correction_delta: TimeStamp,
}

impl StreamBuffer {
    pub fn new() -> Self {
        StreamBuffer {
            pts_correction_delta: TimeStamp::zero(),
            ..StreamBuffer::default()
        }
    }

    pub fn clear(&mut self) {
        *self = StreamBuffer::new();
    }

    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    /// Pop the oldest complete frame, if any.
    pub fn frame_if_available(&mut self) -> Option<Frame> {
        self.completed_frames.pop_front()
    }

    /// Add a PTS/DTS correction applied to frames entering from now on.
    /// Corrections accumulate: they are relative time jumps of the
    /// ingress stream.
    pub fn add_pts_correction_delta(&mut self, delta: TimeStamp) {
        self.pts_correction_delta += delta;
    }

    fn finish_current_frame(&mut self) {
        if let Some(frame) = self.current_frame.take() {
            self.completed_frames.push_back(frame);
        }
        self.expected_payload_length = 0;
    }
}

impl DataSink for StreamBuffer {
    fn new_stream(&mut self, stream_type: StreamType, language: &str) {
        self.stream_type = stream_type;
        self.language = language.to_string();

        if self.current_frame.is_some() {
            info!("Unexpectedly needed to close frame in stream switch");
            self.finish_current_frame();
        }
    }

    fn pes_header(&mut self, mut pts: TimeStamp, mut dts: TimeStamp, pes_payload_length: u32) {
        if let Some(frame) = &self.current_frame {
            info!(
                "Unexpectedly needed to close frame of size {} (PES payload length is {}), this will add latency",
                frame.data.len(),
                self.expected_payload_length
            );
            self.finish_current_frame();
        }

        if pts.is_valid() {
            pts += self.pts_correction_delta;
        }
        if dts.is_valid() {
            dts += self.pts_correction_delta;
        }

        let mut frame = Frame::new(pts, dts);
        frame.data.reserve(pes_payload_length as usize);
        self.current_frame = Some(frame);
        self.expected_payload_length = pes_payload_length;
    }

    fn parse(&mut self, data: &[u8]) {
        match &mut self.current_frame {
            Some(frame) => {
                frame.data.extend_from_slice(data);
                if self.expected_payload_length > 0
                    && frame.data.len() as u32 >= self.expected_payload_length
                {
                    if frame.data.len() as u32 != self.expected_payload_length {
                        warn!(
                            "Frame size/PES payload length mismatch: {} vs {}",
                            frame.data.len(),
                            self.expected_payload_length
                        );
                    }
                    self.finish_current_frame();
                }
            }
            None => warn!("Unexpected stray data after having closed a frame"),
        }
    }

    fn reset(&mut self) {
        self.clear();
    }
}
