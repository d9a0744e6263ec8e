//! Codec-specific filler frame creators.
//!
//! Each creator learns the stream parameters from real frames passing by
//! and keeps a matching silence/skip template ready for when the stream
//! stalls.

pub mod aac;
pub mod ac3;
pub mod h264;
pub mod mpeg2_video;
pub mod mpeg_audio;

pub use aac::AacFillerFrameCreator;
pub use ac3::Ac3FillerFrameCreator;
pub use h264::H264VideoFillerFrameCreator;
pub use mpeg2_video::Mpeg2VideoFillerFrameCreator;
pub use mpeg_audio::MpegAudioFillerFrameCreator;

use super::frame::Frame;
use crate::ts::StreamType;

/// A stateful filler frame source for one codec.
pub trait FillerFrameCreator: Send {
    fn stream_type(&self) -> StreamType;

    /// Learn stream parameters from a real frame; also computes and sets
    /// the frame's duration where the codec allows it.
    fn process_incoming_frame(&mut self, frame: &mut Frame);

    /// Produce a filler frame, or None when no template exists yet.
    fn create(&mut self) -> Option<Frame>;
}

/// Instantiate the creator for an audio stream type.
pub fn audio_creator_for(stream_type: StreamType) -> Option<Box<dyn FillerFrameCreator>> {
    match stream_type {
        StreamType::AacAudio => Some(Box::new(AacFillerFrameCreator::default())),
        StreamType::Ac3Audio => Some(Box::new(Ac3FillerFrameCreator::default())),
        StreamType::Mpeg1Audio | StreamType::Mpeg2Audio => {
            Some(Box::new(MpegAudioFillerFrameCreator::new(stream_type)))
        }
        _ => None,
    }
}

/// Instantiate the creator for a video stream type.
pub fn video_creator_for(stream_type: StreamType) -> Option<Box<dyn FillerFrameCreator>> {
    match stream_type {
        StreamType::Mpeg2Video => Some(Box::new(Mpeg2VideoFillerFrameCreator::default())),
        StreamType::H264Video => Some(Box::new(H264VideoFillerFrameCreator::default())),
        _ => None,
    }
}
