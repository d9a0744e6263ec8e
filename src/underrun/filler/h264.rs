//! H.264 video filler frame creator.
//!
//! Caches the stream's SPS, PPS and last slice header, and synthesizes a
//! CAVLC P-slice that skips every macroblock (`mb_skip_run` equal to the
//! picture size), preceded by an access unit delimiter.

use super::FillerFrameCreator;
use crate::ts::StreamType;
use crate::underrun::frame::Frame;
use crate::utils::bits::{BitReader, BitWriter};

use log::{debug, error};

const NAL_UNIT_TYPE_SLICE: u8 = 1;
const NAL_UNIT_TYPE_IDR: u8 = 5;
const NAL_UNIT_TYPE_SPS: u8 = 7;
const NAL_UNIT_TYPE_PPS: u8 = 8;
const NAL_UNIT_TYPE_AUD: u8 = 9;

const NAL_REF_IDC_HIGH: u8 = 3;

const SLICE_TYPE_P: u32 = 0;

#[derive(Debug, Default, Clone)]
struct SequenceParameterSet {
    is_valid: bool,
    log2_max_frame_num_minus4: u32,
    pic_order_cnt_type: u32,
    log2_max_pic_order_cnt_lsb_minus4: u32,
    delta_pic_order_always_zero_flag: bool,
    pic_width_in_mbs_minus1: u32,
    pic_height_in_map_units_minus1: u32,
    frame_mbs_only_flag: bool,
}

#[derive(Debug, Default, Clone)]
struct PictureParameterSet {
    is_valid: bool,
    pic_parameter_set_id: u32,
    entropy_coding_mode_flag: bool,
    pic_order_present_flag: bool,
    weighted_pred_flag: bool,
    deblocking_filter_control_present_flag: bool,
}

#[derive(Debug, Default, Clone)]
struct SliceHeader {
    is_valid: bool,
    frame_num: u32,
    pic_order_cnt_lsb: u32,
    delta_pic_order_cnt: [i32; 2],
}

#[derive(Default)]
pub struct H264VideoFillerFrameCreator {
    sps: SequenceParameterSet,
    pps: PictureParameterSet,
    slice_header: SliceHeader,
}

/// Length of the NAL unit starting at `data`, including its start code.
fn annex_b_nal_length(data: &[u8]) -> usize {
    // Find the next start code after the current one
    let mut i = 3;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            // A preceding zero belongs to a four-byte start code
            return if data[i - 1] == 0 { i - 1 } else { i };
        }
        i += 1;
    }
    data.len()
}

/// Strip the start code and emulation prevention bytes; returns the RBSP.
fn annex_b_unescape(nal: &[u8]) -> Option<(u8, u8, Vec<u8>)> {
    let start = if nal.starts_with(&[0, 0, 0, 1]) {
        4
    } else if nal.starts_with(&[0, 0, 1]) {
        3
    } else {
        return None;
    };
    if start >= nal.len() {
        return None;
    }

    let header = nal[start];
    let ref_idc = (header >> 5) & 0x3;
    let unit_type = header & 0x1F;

    let mut rbsp = Vec::with_capacity(nal.len() - start - 1);
    let mut zeros = 0;
    for &byte in &nal[start + 1..] {
        if zeros >= 2 && byte == 0x03 {
            zeros = 0;
            continue; // Emulation prevention byte
        }
        if byte == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }
        rbsp.push(byte);
    }
    Some((ref_idc, unit_type, rbsp))
}

/// Wrap an RBSP into a NAL unit with start code, header byte and
/// emulation prevention.
fn annex_b_escape(start_code_len: usize, ref_idc: u8, unit_type: u8, rbsp: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rbsp.len() + 8);
    out.resize(start_code_len - 1, 0);
    out.push(1);
    out.push((ref_idc << 5) | (unit_type & 0x1F));

    let mut zeros = 0;
    for &byte in rbsp {
        if zeros >= 2 && byte <= 3 {
            out.push(0x03);
            zeros = 0;
        }
        if byte == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }
        out.push(byte);
    }
    out
}

impl H264VideoFillerFrameCreator {
    fn parse_sps(&mut self, rbsp: &[u8]) {
        self.sps = SequenceParameterSet::default();
        self.pps.is_valid = false;

        let mut bits = BitReader::new(rbsp);
        let profile_idc = bits.read(8);
        bits.skip(16); // constraint flags, reserved, level_idc
        bits.ue(); // seq_parameter_set_id

        if matches!(profile_idc, 100 | 110 | 122 | 144) {
            if bits.ue() != 1 {
                error!("Unsupported chroma_format_idc");
                return;
            }
            bits.ue(); // bit_depth_luma_minus8
            bits.ue(); // bit_depth_chroma_minus8
            bits.skip(1); // qpprime_y_zero_transform_bypass_flag
            if bits.read(1) != 0 {
                error!("Unsupported seq_scaling_matrix_present_flag");
                return;
            }
        }

        self.sps.log2_max_frame_num_minus4 = bits.ue();
        self.sps.pic_order_cnt_type = bits.ue();
        match self.sps.pic_order_cnt_type {
            0 => {
                self.sps.log2_max_pic_order_cnt_lsb_minus4 = bits.ue();
            }
            1 => {
                self.sps.delta_pic_order_always_zero_flag = bits.read(1) != 0;
                bits.se(); // offset_for_non_ref_pic
                bits.se(); // offset_for_top_to_bottom_field
                let cycles = bits.ue();
                for _ in 0..cycles.min(256) {
                    bits.se();
                }
            }
            _ => {}
        }
        bits.ue(); // num_ref_frames
        bits.skip(1); // gaps_in_frame_num_value_allowed_flag
        self.sps.pic_width_in_mbs_minus1 = bits.ue();
        self.sps.pic_height_in_map_units_minus1 = bits.ue();
        self.sps.frame_mbs_only_flag = bits.read(1) != 0;

        if bits.overflowed() {
            error!("Truncated SPS");
            return;
        }
        if !self.sps.frame_mbs_only_flag {
            error!("Interlaced H.264 streams are not supported for filler frames");
            return;
        }

        debug!(
            "H264 SPS: {}x{} MBs",
            self.sps.pic_width_in_mbs_minus1 + 1,
            self.sps.pic_height_in_map_units_minus1 + 1
        );
        self.sps.is_valid = true;
    }

    fn parse_pps(&mut self, rbsp: &[u8]) {
        self.pps = PictureParameterSet::default();

        let mut bits = BitReader::new(rbsp);
        self.pps.pic_parameter_set_id = bits.ue();
        bits.ue(); // seq_parameter_set_id
        self.pps.entropy_coding_mode_flag = bits.read(1) != 0;
        self.pps.pic_order_present_flag = bits.read(1) != 0;
        if bits.ue() != 0 {
            error!("Slice groups are not supported");
            return;
        }
        bits.ue(); // num_ref_idx_l0_active_minus1
        bits.ue(); // num_ref_idx_l1_active_minus1
        self.pps.weighted_pred_flag = bits.read(1) != 0;
        bits.skip(2); // weighted_bipred_idc
        bits.se(); // pic_init_qp_minus26
        bits.se(); // pic_init_qs_minus26
        bits.se(); // chroma_qp_index_offset
        self.pps.deblocking_filter_control_present_flag = bits.read(1) != 0;

        if bits.overflowed() {
            error!("Truncated PPS");
            return;
        }
        self.pps.is_valid = true;
    }

    fn parse_slice_header(&mut self, rbsp: &[u8], unit_type: u8) {
        let mut header = SliceHeader::default();

        let mut bits = BitReader::new(rbsp);
        bits.ue(); // first_mb_in_slice
        bits.ue(); // slice_type
        bits.ue(); // pic_parameter_set_id
        header.frame_num = bits.read(self.sps.log2_max_frame_num_minus4 + 4);
        if unit_type == NAL_UNIT_TYPE_IDR {
            bits.ue(); // idr_pic_id
        }
        if self.sps.pic_order_cnt_type == 0 {
            header.pic_order_cnt_lsb =
                bits.read(self.sps.log2_max_pic_order_cnt_lsb_minus4 + 4);
            if self.pps.pic_order_present_flag {
                header.delta_pic_order_cnt[0] = bits.se();
            }
        } else if self.sps.pic_order_cnt_type == 1 && !self.sps.delta_pic_order_always_zero_flag {
            header.delta_pic_order_cnt[0] = bits.se();
            if self.pps.pic_order_present_flag {
                header.delta_pic_order_cnt[1] = bits.se();
            }
        }

        if bits.overflowed() {
            return;
        }
        header.is_valid = true;
        self.slice_header = header;
    }

    fn process_nal_unit(&mut self, nal: &[u8]) {
        let (_, unit_type, rbsp) = match annex_b_unescape(nal) {
            Some(parsed) => parsed,
            None => {
                error!("Invalid nal unit with no data bytes");
                return;
            }
        };

        match unit_type {
            NAL_UNIT_TYPE_SPS => self.parse_sps(&rbsp),
            NAL_UNIT_TYPE_PPS => self.parse_pps(&rbsp),
            NAL_UNIT_TYPE_SLICE | NAL_UNIT_TYPE_IDR => {
                if self.sps.is_valid && self.pps.is_valid {
                    self.parse_slice_header(&rbsp, unit_type);
                }
            }
            _ => {}
        }
    }

    fn encode_empty_p_slice(&self) -> Option<Frame> {
        if self.pps.entropy_coding_mode_flag {
            error!("CABAC not supported, can't generate a video filler frame");
            return None;
        }
        if !self.slice_header.is_valid {
            error!("A valid slice not received yet, can't generate a video filler frame");
            return None;
        }

        let mut out = BitWriter::new();
        out.ue(0); // first_mb_in_slice
        out.ue(SLICE_TYPE_P);
        out.ue(self.pps.pic_parameter_set_id);
        out.write(
            self.slice_header.frame_num,
            self.sps.log2_max_frame_num_minus4 + 4,
        );
        if self.sps.pic_order_cnt_type == 0 {
            out.write(
                self.slice_header.pic_order_cnt_lsb,
                self.sps.log2_max_pic_order_cnt_lsb_minus4 + 4,
            );
            if self.pps.pic_order_present_flag {
                out.se(self.slice_header.delta_pic_order_cnt[0]);
            }
        } else if self.sps.pic_order_cnt_type == 1 && !self.sps.delta_pic_order_always_zero_flag {
            out.se(self.slice_header.delta_pic_order_cnt[0]);
            if self.pps.pic_order_present_flag {
                out.se(self.slice_header.delta_pic_order_cnt[1]);
            }
        }

        // One reference frame
        out.write(1, 1); // num_ref_idx_active_override_flag
        out.ue(0); // num_ref_idx_l0_active_minus1
        out.write(0, 1); // ref_pic_list_reordering_flag_l0
        if self.pps.weighted_pred_flag {
            out.ue(0); // luma_log2_weight_denom
            out.ue(0); // chroma_log2_weight_denom
            out.write(0, 1); // luma_weight_l0_flag
            out.write(0, 1); // chroma_weight_l0_flag
        }
        out.write(0, 1); // adaptive_ref_pic_marking_mode_flag
        out.se(0); // slice_qp_delta
        if self.pps.deblocking_filter_control_present_flag {
            out.ue(1); // disable_deblocking_filter_idc
        }

        // Slice data: skip every macroblock
        let pic_width_in_mbs = self.sps.pic_width_in_mbs_minus1 + 1;
        let pic_height_in_mbs = self.sps.pic_height_in_map_units_minus1 + 1;
        let pic_size_in_mbs = pic_width_in_mbs * pic_height_in_mbs;
        debug!("Generating H264 filler frame using CAVLC");
        out.ue(pic_size_in_mbs); // mb_skip_run
        out.write(1, 1); // rbsp_stop_one_bit
        out.align();

        let aud_nal = [0x00, 0x00, 0x00, 0x01, NAL_UNIT_TYPE_AUD, 0x30]; // P frame
        let slice_nal = annex_b_escape(3, NAL_REF_IDC_HIGH, NAL_UNIT_TYPE_SLICE, out.as_slice());

        let mut frame = Frame::default();
        frame.data.reserve(aud_nal.len() + slice_nal.len());
        frame.data.extend_from_slice(&aud_nal);
        frame.data.extend_from_slice(&slice_nal);
        Some(frame)
    }
}

impl FillerFrameCreator for H264VideoFillerFrameCreator {
    fn stream_type(&self) -> StreamType {
        StreamType::H264Video
    }

    fn process_incoming_frame(&mut self, frame: &mut Frame) {
        let mut data: &[u8] = &frame.data;
        debug!("Processing H264 frame");

        while data.len() >= 4 {
            let nal_length = annex_b_nal_length(data);
            if nal_length == 0 {
                error!("Invalid nal unit (nal unit length = 0)");
                break;
            }
            self.process_nal_unit(&data[..nal_length]);
            data = &data[nal_length..];
        }
    }

    fn create(&mut self) -> Option<Frame> {
        if !self.sps.is_valid || !self.pps.is_valid {
            error!("No sps and/or pps, can't generate a valid video filler frame");
            return None;
        }
        self.encode_empty_p_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sps_nal() -> Vec<u8> {
        let mut out = BitWriter::new();
        out.write(66, 8); // profile baseline
        out.write(0, 16);
        out.ue(0); // sps id
        out.ue(0); // log2_max_frame_num_minus4
        out.ue(0); // pic_order_cnt_type 0
        out.ue(0); // log2_max_pic_order_cnt_lsb_minus4
        out.ue(1); // num_ref_frames
        out.write(0, 1); // gaps
        out.ue(43); // pic_width_in_mbs_minus1 (704 px)
        out.ue(35); // pic_height_in_map_units_minus1 (576 px)
        out.write(1, 1); // frame_mbs_only_flag
        out.write(1, 1); // rbsp stop
        out.align();
        annex_b_escape(4, 1, NAL_UNIT_TYPE_SPS, out.as_slice())
    }

    fn pps_nal() -> Vec<u8> {
        let mut out = BitWriter::new();
        out.ue(0); // pps id
        out.ue(0); // sps id
        out.write(0, 1); // CAVLC
        out.write(0, 1); // pic_order_present_flag
        out.ue(0); // num_slice_groups_minus1
        out.ue(0);
        out.ue(0);
        out.write(0, 1); // weighted_pred_flag
        out.write(0, 2);
        out.se(0);
        out.se(0);
        out.se(0);
        out.write(0, 1); // deblocking_filter_control_present_flag
        out.write(1, 1);
        out.align();
        annex_b_escape(4, 1, NAL_UNIT_TYPE_PPS, out.as_slice())
    }

    fn idr_nal() -> Vec<u8> {
        let mut out = BitWriter::new();
        out.ue(0); // first_mb_in_slice
        out.ue(7); // slice_type I (all)
        out.ue(0); // pps id
        out.write(3, 4); // frame_num
        out.ue(0); // idr_pic_id
        out.write(9, 4); // pic_order_cnt_lsb
        out.write(1, 1);
        out.align();
        annex_b_escape(4, 3, NAL_UNIT_TYPE_IDR, out.as_slice())
    }

    fn feed_stream(creator: &mut H264VideoFillerFrameCreator) {
        let mut frame = Frame::default();
        frame.data.extend_from_slice(&sps_nal());
        frame.data.extend_from_slice(&pps_nal());
        frame.data.extend_from_slice(&idr_nal());
        creator.process_incoming_frame(&mut frame);
    }

    #[test]
    fn caches_parameter_sets_and_slice_header() {
        let mut creator = H264VideoFillerFrameCreator::default();
        feed_stream(&mut creator);

        assert!(creator.sps.is_valid);
        assert!(creator.pps.is_valid);
        assert!(creator.slice_header.is_valid);
        assert_eq!(creator.sps.pic_width_in_mbs_minus1, 43);
        assert_eq!(creator.slice_header.frame_num, 3);
        assert_eq!(creator.slice_header.pic_order_cnt_lsb, 9);
    }

    #[test]
    fn filler_encodes_full_skip_run() {
        let mut creator = H264VideoFillerFrameCreator::default();
        feed_stream(&mut creator);

        let filler = creator.create().unwrap();
        // AUD first
        assert_eq!(&filler.data[..6], &[0, 0, 0, 1, NAL_UNIT_TYPE_AUD, 0x30]);
        // Then the P slice
        assert_eq!(&filler.data[6..9], &[0, 0, 1]);
        assert_eq!(filler.data[9], (NAL_REF_IDC_HIGH << 5) | NAL_UNIT_TYPE_SLICE);

        // Decode the slice header back and verify the skip run
        let (_, unit_type, rbsp) = annex_b_unescape(&filler.data[6..]).unwrap();
        assert_eq!(unit_type, NAL_UNIT_TYPE_SLICE);
        let mut bits = BitReader::new(&rbsp);
        assert_eq!(bits.ue(), 0); // first_mb_in_slice
        assert_eq!(bits.ue(), SLICE_TYPE_P);
        assert_eq!(bits.ue(), 0); // pps id
        assert_eq!(bits.read(4), 3); // frame_num from the cached slice
        assert_eq!(bits.read(4), 9); // pic_order_cnt_lsb
        assert_eq!(bits.read(1), 1); // num_ref_idx_active_override_flag
        assert_eq!(bits.ue(), 0);
        assert_eq!(bits.read(1), 0); // reordering
        assert_eq!(bits.read(1), 0); // adaptive marking
        assert_eq!(bits.se(), 0); // slice_qp_delta
        assert_eq!(bits.ue(), 44 * 36); // mb_skip_run = picture size
    }

    #[test]
    fn no_filler_without_parameter_sets() {
        let mut creator = H264VideoFillerFrameCreator::default();
        assert!(creator.create().is_none());
    }
}
