//! MPEG-1/2 audio (layer I/II) silence frame creator.

use super::FillerFrameCreator;
use crate::ts::{StreamType, TimeStamp};
use crate::underrun::frame::Frame;
use crate::utils::bits::{BitReader, BitWriter};

use log::{info, warn};

const MPEG_AUDIO_HEADER_SIZE: usize = 4;

// MPEG audio layers are strangely coded
const LAYER1: u32 = 3;
const LAYER2: u32 = 2;

const SAMPLING_FREQUENCY_TABLE: [u32; 3] = [44100, 48000, 32000];

const LAYER1_BITRATE_TABLE: [u32; 15] = [
    0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448,
];

const LAYER2_BITRATE_TABLE: [u32; 15] = [
    0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384,
];

/// Learns the frame header from the stream and renders an all-zero frame.
///
/// A zeroed layer I/II frame decodes as silence: all allocation bins read
/// zero so no sample data is coded and the rest counts as ancillary data.
pub struct MpegAudioFillerFrameCreator {
    stream_type: StreamType,
    silent_frame: Frame,
}

impl MpegAudioFillerFrameCreator {
    pub fn new(stream_type: StreamType) -> Self {
        MpegAudioFillerFrameCreator {
            stream_type,
            silent_frame: Frame::default(),
        }
    }
}

impl FillerFrameCreator for MpegAudioFillerFrameCreator {
    fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    fn process_incoming_frame(&mut self, frame: &mut Frame) {
        let data = &frame.data;
        if data.len() < MPEG_AUDIO_HEADER_SIZE {
            return;
        }

        let mut bits = BitReader::new(data);
        let syncword = bits.read(12);
        let id = bits.read(1);
        let layer = bits.read(2);
        let protection_bit = bits.read(1);
        let bitrate_index = bits.read(4);
        let sampling_frequency_index = bits.read(2);
        let padding_bit = bits.read(1);
        let private_bit = bits.read(1);
        let mode = bits.read(2);
        let mode_extension = bits.read(2);
        let copyright = bits.read(1);
        let original_copy = bits.read(1);
        let emphasis = bits.read(2);

        if syncword != 0xFFF || layer == 0 || bitrate_index == 15 {
            warn!(
                "Unrecognized or unexpected MPEG audio header: sync={:#X}, id={}, layer={}, bitrate={}",
                syncword, id, layer, bitrate_index
            );
            return;
        }
        if sampling_frequency_index as usize >= SAMPLING_FREQUENCY_TABLE.len() {
            warn!("MPEG audio illegal sampling frequency");
            return;
        }
        if protection_bit != 1 {
            warn!("MPEG audio CRC not supported");
            return;
        }
        if bitrate_index == 0 {
            warn!("MPEG free bitrate not supported");
            return;
        }
        if layer != LAYER1 && layer != LAYER2 {
            warn!("MPEG audio layer {} not supported", 4 - layer);
            return;
        }

        let frame_size = if layer == LAYER1 { 384 } else { 1152 };
        let bitrate = if layer == LAYER1 {
            LAYER1_BITRATE_TABLE[bitrate_index as usize]
        } else {
            LAYER2_BITRATE_TABLE[bitrate_index as usize]
        };
        let sampling_frequency = SAMPLING_FREQUENCY_TABLE[sampling_frequency_index as usize];

        let frame_length = (frame_size * bitrate * 125 / sampling_frequency + padding_bit) as usize;
        if frame_length != data.len() {
            warn!(
                "MPEG audio unexpected frame size, received {}, expected {}",
                data.len(),
                frame_length
            );
            return;
        }

        let duration_ticks = 90000u64 * frame_size as u64 / sampling_frequency as u64;
        frame.duration = TimeStamp::from_90khz(duration_ticks);

        // Essential header parts unchanged: keep the current template
        if self.silent_frame.data.len() >= MPEG_AUDIO_HEADER_SIZE
            && data[1] == self.silent_frame.data[1]
            && (data[2] & 0xFC) == (self.silent_frame.data[2] & 0xFC)
            && (data[3] & 0xF0) == (self.silent_frame.data[3] & 0xF0)
        {
            return;
        }

        info!(
            "New MPEG audio frame read: layer {}, sf={}Hz, bitrate={}, duration={}",
            4 - layer,
            sampling_frequency,
            bitrate,
            duration_ticks
        );

        let mut out = BitWriter::new();
        out.write(0xFFF, 12);
        out.write(id, 1);
        out.write(layer, 2);
        out.write(protection_bit, 1);
        out.write(bitrate_index, 4);
        out.write(sampling_frequency_index, 2);
        out.write(0, 1); // Filler frames are never padded
        out.write(private_bit, 1);
        out.write(mode, 2);
        out.write(mode_extension, 2);
        out.write(copyright, 1);
        out.write(original_copy, 1);
        out.write(emphasis, 2);

        self.silent_frame.data = out.into_bytes();
        self.silent_frame
            .data
            .resize(frame_length - padding_bit as usize, 0);
        self.silent_frame.duration = TimeStamp::from_90khz(duration_ticks);

        info!(
            "New MPEG silence frame is {} bytes",
            self.silent_frame.data.len()
        );
    }

    fn create(&mut self) -> Option<Frame> {
        if self.silent_frame.data.is_empty() {
            return None;
        }
        Some(self.silent_frame.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer2_frame() -> Frame {
        // Layer II, 48 kHz, 192 kbit/s, stereo: frame length 576 bytes
        let mut out = BitWriter::new();
        out.write(0xFFF, 12);
        out.write(1, 1); // id
        out.write(LAYER2, 2);
        out.write(1, 1); // protection_bit
        out.write(10, 4); // bitrate_index -> 192
        out.write(1, 2); // 48 kHz
        out.write(0, 1); // padding
        out.write(0, 1);
        out.write(0, 2); // stereo
        out.write(0, 2);
        out.write(0, 1);
        out.write(1, 1);
        out.write(0, 2);

        let mut frame = Frame::default();
        frame.data = out.into_bytes();
        frame.data.resize(1152 * 192 * 125 / 48000, 0x77);
        frame
    }

    #[test]
    fn silence_frame_matches_stream_parameters() {
        let mut creator = MpegAudioFillerFrameCreator::new(StreamType::Mpeg2Audio);
        let mut frame = layer2_frame();
        creator.process_incoming_frame(&mut frame);

        // 1152 samples at 48 kHz = 2160 ticks
        assert_eq!(frame.duration.as_90khz(), 2160);

        let filler = creator.create().unwrap();
        assert_eq!(filler.data.len(), frame.data.len());
        // Header matches, audio data is zeroed
        assert_eq!(&filler.data[..3], &frame.data[..3]);
        assert!(filler.data[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn wrong_size_frame_is_ignored() {
        let mut creator = MpegAudioFillerFrameCreator::new(StreamType::Mpeg2Audio);
        let mut frame = layer2_frame();
        frame.data.truncate(100);
        creator.process_incoming_frame(&mut frame);
        assert!(creator.create().is_none());
    }
}
