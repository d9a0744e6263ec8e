//! AAC (ADTS) silence frame creator.

use super::FillerFrameCreator;
use crate::ts::{StreamType, TimeStamp};
use crate::underrun::frame::Frame;
use crate::utils::bits::{BitReader, BitWriter};

use log::{info, warn};

const ADTS_HEADER_SIZE: usize = 7;

const AAC_SAMPLING_FREQUENCY_TABLE: [u32; 12] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000,
];

// Indexed by channel_configuration - 1; first byte is the payload size.
// Packets are SCE, CPE, LFE and TERM element sequences coding silence,
// independent of the sampling frequency.
const AAC_SILENCE_DATA: [[u8; 25]; 7] = [
    // 1ch
    [
        4, 0x01, 0x18, 0x20, 0x07, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    ],
    // 2ch
    [
        6, 0x21, 0x10, 0x04, 0x60, 0x8C, 0x1C, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        0,
    ],
    // 3ch
    [
        10, 0x01, 0x18, 0x20, 0x01, 0x08, 0x80, 0x23, 0x04, 0x60, 0xE0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        0, 0, 0, 0, 0,
    ],
    // 4ch
    [
        13, 0x01, 0x18, 0x20, 0x01, 0x08, 0x80, 0x23, 0x04, 0x60, 0x03, 0x18, 0x20, 0x07, 0, 0, 0,
        0, 0, 0, 0, 0, 0, 0, 0,
    ],
    // 5ch
    [
        15, 0x01, 0x18, 0x20, 0x01, 0x08, 0x80, 0x23, 0x04, 0x60, 0x23, 0x10, 0x04, 0x60, 0x8C,
        0x1C, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    ],
    // 6ch
    [
        19, 0x01, 0x18, 0x20, 0x01, 0x08, 0x80, 0x23, 0x04, 0x60, 0x23, 0x10, 0x04, 0x60, 0x8C,
        0x0C, 0x23, 0x00, 0x00, 0xE0, 0, 0, 0, 0, 0,
    ],
    // 8ch (7ch is not assignable)
    [
        24, 0x01, 0x18, 0x20, 0x01, 0x08, 0x80, 0x23, 0x04, 0x60, 0x23, 0x10, 0x04, 0x60, 0x8C,
        0x04, 0xA2, 0x00, 0x8C, 0x11, 0x81, 0x84, 0x60, 0x00, 0x1C,
    ],
];

/// Learns the ADTS parameters from the stream and renders a matching
/// one-block silence frame.
#[derive(Default)]
pub struct AacFillerFrameCreator {
    silent_frame: Frame,
}

impl FillerFrameCreator for AacFillerFrameCreator {
    fn stream_type(&self) -> StreamType {
        StreamType::AacAudio
    }

    fn process_incoming_frame(&mut self, frame: &mut Frame) {
        let data = &frame.data;
        if data.len() < ADTS_HEADER_SIZE {
            return;
        }

        let mut bits = BitReader::new(data);
        let syncword = bits.read(12);
        let id = bits.read(1);
        let layer = bits.read(2);
        let protection_absent = bits.read(1);
        let profile = bits.read(2);
        let sampling_frequency_index = bits.read(4);
        let private_bit = bits.read(1);
        let channel_configuration = bits.read(3);
        let original_copy = bits.read(1);
        let home = bits.read(1);
        // Skip copyright bits (2), frame_length (13), buffer fullness (11)
        bits.skip(26);
        let raw_data_blocks = bits.read(2) + 1;

        if syncword != 0xFFF || layer != 0 {
            warn!(
                "Unrecognized or unexpected AAC header: sync={:#X}, id={}, layer={}",
                syncword, id, layer
            );
            return;
        }
        if protection_absent != 1 {
            warn!("AAC CRC not supported");
            return;
        }
        if sampling_frequency_index as usize >= AAC_SAMPLING_FREQUENCY_TABLE.len() {
            warn!("AAC unsupported sampling frequency");
            return;
        }
        if channel_configuration == 0 || channel_configuration == 7 {
            warn!("AAC channel configuration {} is not supported", channel_configuration);
            return;
        }

        let sampling_frequency = AAC_SAMPLING_FREQUENCY_TABLE[sampling_frequency_index as usize];

        // 1024 samples per raw data block
        let duration_ticks = 90000u64 * 1024 * raw_data_blocks as u64 / sampling_frequency as u64;
        frame.duration = TimeStamp::from_90khz(duration_ticks);

        // Stream parameters unchanged if the fixed header bytes match
        if self.silent_frame.data.len() >= ADTS_HEADER_SIZE
            && data[1] == self.silent_frame.data[1]
            && data[2] == self.silent_frame.data[2]
            && (data[3] & 0xF0) == (self.silent_frame.data[3] & 0xF0)
        {
            return;
        }

        info!(
            "New AAC frame read: sf={}Hz, channels={}",
            sampling_frequency, channel_configuration
        );

        let table_index = if channel_configuration == 8 {
            6
        } else {
            channel_configuration as usize - 1
        };
        let byte_count = AAC_SILENCE_DATA[table_index][0] as usize;
        let payload = &AAC_SILENCE_DATA[table_index][1..1 + byte_count];

        let mut out = BitWriter::new();
        out.write(0xFFF, 12); // syncword
        out.write(id, 1);
        out.write(layer, 2);
        out.write(protection_absent, 1);
        out.write(profile, 2);
        out.write(sampling_frequency_index, 4);
        out.write(private_bit, 1);
        out.write(channel_configuration, 3);
        out.write(original_copy, 1);
        out.write(home, 1);
        out.write(0, 1); // copyright_id_bit
        out.write(0, 1); // copyright_id_start
        out.write((byte_count + ADTS_HEADER_SIZE) as u32, 13); // frame_length
        out.write(0x7FF, 11); // adts_buffer_fullness
        out.write(0, 2); // number_of_raw_data_blocks_in_frame

        self.silent_frame.data = out.into_bytes();
        self.silent_frame.data.extend_from_slice(payload);
        // The silence frame carries a single raw data block
        self.silent_frame.duration =
            TimeStamp::from_90khz(duration_ticks / raw_data_blocks as u64);

        info!("New AAC silence frame is {} bytes", self.silent_frame.data.len());
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

    /// ADTS header for the given parameters with an empty payload.
    pub(crate) fn adts_frame(sampling_frequency_index: u32, channel_configuration: u32) -> Frame {
        let mut out = BitWriter::new();
        out.write(0xFFF, 12);
        out.write(1, 1); // id
        out.write(0, 2); // layer
        out.write(1, 1); // protection_absent
        out.write(1, 2); // profile (AAC LC)
        out.write(sampling_frequency_index, 4);
        out.write(0, 1);
        out.write(channel_configuration, 3);
        out.write(0, 1);
        out.write(0, 1);
        out.write(0, 2); // copyright bits
        out.write(7 + 16, 13); // frame_length
        out.write(0x7FF, 11);
        out.write(0, 2); // one raw data block

        let mut frame = Frame::default();
        frame.data = out.into_bytes();
        frame.data.extend_from_slice(&[0u8; 16]);
        frame
    }

    #[test]
    fn computes_duration_and_template() {
        let mut creator = AacFillerFrameCreator::default();
        let mut frame = adts_frame(3, 2); // 48 kHz stereo
        creator.process_incoming_frame(&mut frame);

        // 1024 samples at 48 kHz = 1920 ticks
        assert_eq!(frame.duration.as_90khz(), 1920);

        let filler = creator.create().unwrap();
        assert_eq!(filler.duration.as_90khz(), 1920);
        // 2-channel silence payload is 6 bytes
        assert_eq!(filler.data.len(), 7 + 6);

        // frame_length field covers header + silence payload
        let mut bits = BitReader::new(&filler.data);
        bits.skip(30);
        assert_eq!(bits.read(13) as usize, 7 + 6);

        // Same sampling frequency index and channel configuration
        let mut bits = BitReader::new(&filler.data);
        bits.skip(18);
        assert_eq!(bits.read(4), 3);
        bits.skip(1);
        assert_eq!(bits.read(3), 2);
    }

    #[test]
    fn no_template_before_first_frame() {
        let mut creator = AacFillerFrameCreator::default();
        assert!(creator.create().is_none());
    }

    #[test]
    fn template_rebuilt_on_parameter_change() {
        let mut creator = AacFillerFrameCreator::default();
        let mut frame = adts_frame(3, 2);
        creator.process_incoming_frame(&mut frame);
        let stereo = creator.create().unwrap();

        let mut frame = adts_frame(3, 1); // Mono now
        creator.process_incoming_frame(&mut frame);
        let mono = creator.create().unwrap();

        assert_ne!(stereo.data.len(), mono.data.len());
        assert_eq!(mono.data.len(), 7 + 4);
    }
}
