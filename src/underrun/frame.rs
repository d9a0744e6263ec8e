//! A single reassembled audio or video frame.

use crate::ts::TimeStamp;

/// One elementary stream frame with its timing.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    pub data: Vec<u8>,
    pub pts: TimeStamp,
    pub dts: TimeStamp,
    pub duration: TimeStamp,
}

impl Frame {
    pub fn new(pts: TimeStamp, dts: TimeStamp) -> Self {
        Frame {
            data: Vec::new(),
            pts,
            dts,
            duration: TimeStamp::invalid(),
        }
    }
}
