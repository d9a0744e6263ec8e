//! MPEG-2 video filler frame creator.
//!
//! Synthesizes a P-picture consisting entirely of skipped macroblocks:
//! picture header + coding extension followed by one slice per macroblock
//! row. The temporal reference is patched to stay in sequence with the
//! real stream.

use super::FillerFrameCreator;
use crate::ts::StreamType;
use crate::underrun::frame::Frame;
use crate::utils::bits::{BitReader, BitWriter};

use log::{debug, error};

const SEQUENCE_HEADER_CODE: u8 = 0xB3;
const PICTURE_START_CODE: u8 = 0x00;
const GROUP_START_CODE: u8 = 0xB8;

/// Macroblock address increment VLC table (ISO 13818-2 table B.1).
const ADDR_INC_TABLE: [(u16, u16); 33] = [
    (0x01, 1),
    (0x03, 3),
    (0x02, 3),
    (0x03, 4),
    (0x02, 4),
    (0x03, 5),
    (0x02, 5),
    (0x07, 7),
    (0x06, 7),
    (0x0B, 8),
    (0x0A, 8),
    (0x09, 8),
    (0x08, 8),
    (0x07, 8),
    (0x06, 8),
    (0x17, 10),
    (0x16, 10),
    (0x15, 10),
    (0x14, 10),
    (0x13, 10),
    (0x12, 10),
    (0x23, 11),
    (0x22, 11),
    (0x21, 11),
    (0x20, 11),
    (0x1F, 11),
    (0x1E, 11),
    (0x1D, 11),
    (0x1C, 11),
    (0x1B, 11),
    (0x1A, 11),
    (0x19, 11),
    (0x18, 11),
];

/// Iterate `(offset, size, start_code)` over the start-code-delimited
/// chunks of an MPEG-2 bitstream.
fn for_each_start_code(data: &[u8], mut f: impl FnMut(usize, usize, u8)) {
    if data.len() < 4 {
        return;
    }
    let mut previous: Option<usize> = None;
    let mut i = 0;
    while i + 4 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            if let Some(start) = previous {
                f(start, i - start, data[start + 3]);
            }
            previous = Some(i);
            i += 3;
        } else {
            i += 1;
        }
    }
    if let Some(start) = previous {
        f(start, data.len() - start, data[start + 3]);
    }
}

#[derive(Default)]
pub struct Mpeg2VideoFillerFrameCreator {
    has_sequence_header: bool,
    has_picture_header: bool,
    next_temporal_reference: u16,
    horizontal_size: u32,
    vertical_size: u32,
}

impl Mpeg2VideoFillerFrameCreator {
    fn parse_sequence_header(&mut self, data: &[u8]) {
        let mut bits = BitReader::new(data);
        bits.skip(32); // Start code
        self.horizontal_size = bits.read(12);
        self.vertical_size = bits.read(12);
        debug!(
            "MPEG2 sequence header: {}x{}",
            self.horizontal_size, self.vertical_size
        );
    }

    /// Rewrite temporal_reference in a picture header to the running
    /// counter, then advance the counter.
    fn patch_temporal_reference(&mut self, data: &mut [u8]) {
        data[4] = (self.next_temporal_reference >> 2) as u8;
        data[5] = (data[5] & 0x3F) | (((self.next_temporal_reference << 6) & 0xC0) as u8);
        self.next_temporal_reference = (self.next_temporal_reference + 1) & 0x3FF;
    }

    fn encode_filler_picture_header(out: &mut BitWriter) {
        out.align();

        // picture_header(), P-picture
        out.write(0x00000100, 32);
        out.write(0, 10); // Real temporal reference is patched in later
        out.write(2, 3); // picture_coding_type P
        out.write(0xFFFF, 16); // vbv_delay
        out.write(0, 1); // full_pel_forward_vector
        out.write(7, 3); // forward_f_code
        out.write(0, 1); // extra_bit_picture
        out.align();

        // picture_coding_extension()
        out.write(0x000001B5, 32);
        out.write(8, 4); // Picture coding extension id
        out.write(0x55, 8); // f_codes
        out.write(0xFF, 8);
        out.write(2, 2); // intra_dc_precision 10 bit
        out.write(3, 2); // picture_structure: frame
        out.write(0, 1); // top_field_first
        out.write(1, 1); // frame_pred_frame_dct
        out.write(0, 1); // concealment_motion_vectors
        out.write(0, 1); // q_scale_type
        out.write(0, 1); // intra_vlc_format
        out.write(0, 1); // alternate_scan
        out.write(0, 1); // repeat_first_field
        out.write(1, 1); // chroma_420_type
        out.write(1, 1); // progressive_frame
        out.write(0, 1); // composite_display_flag
        out.align();
    }

    /// One slice of skipped macroblocks for row `mb_y`.
    fn encode_filler_slice(out: &mut BitWriter, mb_y: u32, mb_width: u32) {
        out.write(0, 8);
        out.write(0, 8);
        out.write(1, 8);
        out.write((mb_y + 1) & 0xFF, 8); // Slice vertical position

        out.write(2, 5); // quantiser_scale_code
        out.write(0, 1); // extra_bit_slice
        out.write(1, 1); // First macroblock_address_increment
        out.write(1, 3); // macroblock_type: P MC, not coded
        out.write(1, 1); // motion x
        out.write(1, 1); // motion y

        if mb_width > 1 {
            let mut address_increment = mb_width as i32 - 2;
            while address_increment >= 33 {
                out.write(8, 11); // macroblock_escape
                address_increment -= 33;
            }
            let (code, len) = ADDR_INC_TABLE[address_increment as usize];
            out.write(code as u32, len as u32);
            out.write(1, 3); // P MC, not coded
            out.write(1, 1); // motion x
            out.write(1, 1); // motion y
        }
        out.align();
    }
}

impl FillerFrameCreator for Mpeg2VideoFillerFrameCreator {
    fn stream_type(&self) -> StreamType {
        StreamType::Mpeg2Video
    }

    fn process_incoming_frame(&mut self, frame: &mut Frame) {
        debug!("Processing MPEG2 frame");

        // Two passes: scan first, then patch, to keep the borrow simple
        let mut sequence_headers = Vec::new();
        let mut picture_headers = Vec::new();
        let mut group_headers = 0;
        for_each_start_code(&frame.data, |offset, size, code| match code {
            SEQUENCE_HEADER_CODE => sequence_headers.push((offset, size)),
            PICTURE_START_CODE => picture_headers.push((offset, size)),
            GROUP_START_CODE => group_headers += 1,
            _ => {}
        });

        if group_headers > 0 {
            self.next_temporal_reference = 0;
        }
        for (offset, size) in sequence_headers {
            self.parse_sequence_header(&frame.data[offset..offset + size]);
            self.has_sequence_header = true;
        }
        for (offset, size) in picture_headers {
            if size < 6 {
                error!("Invalid picture header");
                continue;
            }
            let slice = &mut frame.data[offset..offset + size];
            self.patch_temporal_reference(slice);
            self.has_picture_header = true;
        }
    }

    fn create(&mut self) -> Option<Frame> {
        if !self.has_sequence_header || !self.has_picture_header {
            debug!("No valid MPEG2 sequence/picture header received yet, can't generate video filler frame");
            return None;
        }

        let mut out = BitWriter::new();
        Self::encode_filler_picture_header(&mut out);
        for y in 0..(self.vertical_size >> 4) {
            Self::encode_filler_slice(&mut out, y, self.horizontal_size >> 4);
        }

        let mut data = out.into_bytes();
        self.patch_temporal_reference(&mut data);

        let mut frame = Frame::default();
        frame.data = data;
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sequence_and_picture_frame(width: u32, height: u32) -> Frame {
        let mut out = BitWriter::new();
        // Sequence header
        out.write(0x000001B3, 32);
        out.write(width, 12);
        out.write(height, 12);
        out.write(1, 4); // aspect ratio
        out.write(3, 4); // frame rate
        out.align();
        // Picture header (I-picture, temporal reference 5)
        out.write(0x00000100, 32);
        out.write(5, 10);
        out.write(1, 3);
        out.write(0xFFFF, 16);
        out.align();
        // Trailing sequence end code so the last chunk is delimited
        out.write(0x000001B7, 32);

        let mut frame = Frame::default();
        frame.data = out.into_bytes();
        frame
    }

    #[test]
    fn patches_temporal_reference_of_real_frames() {
        let mut creator = Mpeg2VideoFillerFrameCreator::default();
        let mut frame = sequence_and_picture_frame(704, 576);
        creator.process_incoming_frame(&mut frame);

        // The picture header's temporal reference was rewritten to 0
        let picture_offset = frame
            .data
            .windows(4)
            .position(|w| w == [0, 0, 1, 0])
            .unwrap();
        let tr = ((frame.data[picture_offset + 4] as u16) << 2)
            | ((frame.data[picture_offset + 5] as u16 & 0xC0) >> 6);
        assert_eq!(tr, 0);
    }

    #[test]
    fn filler_has_one_slice_per_mb_row() {
        let mut creator = Mpeg2VideoFillerFrameCreator::default();
        let mut frame = sequence_and_picture_frame(704, 576);
        creator.process_incoming_frame(&mut frame);

        let filler = creator.create().unwrap();
        assert!(!filler.data.is_empty());

        // Count slice start codes (0x00 00 01 01..0xAF)
        let mut slices = 0;
        for window in filler.data.windows(4) {
            if window[0] == 0 && window[1] == 0 && window[2] == 1 && (1..=0xAF).contains(&window[3])
            {
                slices += 1;
            }
        }
        assert_eq!(slices, 576 / 16);

        // It is a P-picture
        let picture_offset = filler
            .data
            .windows(4)
            .position(|w| w == [0, 0, 1, 0])
            .unwrap();
        let coding_type = (filler.data[picture_offset + 5] >> 3) & 0x7;
        assert_eq!(coding_type, 2);
    }

    #[test]
    fn no_filler_without_headers() {
        let mut creator = Mpeg2VideoFillerFrameCreator::default();
        assert!(creator.create().is_none());
    }
}
