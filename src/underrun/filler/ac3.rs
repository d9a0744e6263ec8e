//! AC-3 silence frame creator.
//!
//! Rebuilds a full syncinfo/BSI/first-audio-block silence frame matching
//! the stream's coding parameters, including both frame CRCs.

use super::FillerFrameCreator;
use crate::ts::{StreamType, TimeStamp};
use crate::underrun::frame::Frame;
use crate::utils::bits::{BitReader, BitWriter};

use log::{info, warn};

const MIN_AC3_FRAME_SIZE: usize = 64;
const SAMPLES_PER_FRAME: u32 = 6 * 256;

const SAMPLING_FREQUENCY_TABLE: [u32; 3] = [48000, 44100, 32000];

// Nominal bitrate in kbps; index is frmsizecod >> 1
const BITRATE_TABLE: [u32; 19] = [
    32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 448, 512, 576, 640,
];

// Channel count per acmod
const CHANNELS_TABLE: [u8; 8] = [2, 1, 2, 3, 3, 4, 4, 5];

/// CRC-16 with polynomial 0x8005 and zero init, front to back.
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x8005;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// The inverse CRC walk, back to front over a region whose leading two
/// bytes are the zeroed checksum slot: yields the value that makes the
/// forward CRC of the region zero once stored in that slot.
fn reverse_crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data.iter().rev() {
        // Undo the eight forward shift steps
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = ((crc ^ 0x8005) >> 1) | 0x8000;
            } else {
                crc >>= 1;
            }
        }
        crc ^= (byte as u16) << 8;
    }
    crc
}

#[derive(Default)]
pub struct Ac3FillerFrameCreator {
    sample_rate_code: u32,
    frame_size_code: u32,
    audio_coding_mode: u32,
    lfe_present: u32,
    silent_frame: Frame,
}

impl FillerFrameCreator for Ac3FillerFrameCreator {
    fn stream_type(&self) -> StreamType {
        StreamType::Ac3Audio
    }

    fn process_incoming_frame(&mut self, frame: &mut Frame) {
        let data = &frame.data;
        if data.len() < MIN_AC3_FRAME_SIZE {
            warn!("Frame too small for AC-3: size={}", data.len());
            return;
        }

        let mut bits = BitReader::new(data);
        let syncword = bits.read(16);
        bits.skip(16); // crc1
        let fscod = bits.read(2);
        let frmsizecod = bits.read(6);

        let bsid = bits.read(5);
        let bsmod = bits.read(3);
        let acmod = bits.read(3);
        let mut cmixlev = 0;
        if (acmod & 0x1) != 0 && acmod != 0x1 {
            cmixlev = bits.read(2);
        }
        let mut surmixlev = 0;
        if acmod & 0x4 != 0 {
            surmixlev = bits.read(2);
        }
        if acmod == 0x2 {
            bits.skip(2); // dsurmod
        }
        let lfeon = bits.read(1);
        let dialnorm = bits.read(5);

        if syncword != 0x0B77
            || fscod as usize >= SAMPLING_FREQUENCY_TABLE.len()
            || (frmsizecod >> 1) as usize >= BITRATE_TABLE.len()
            || bsid > 8
        {
            warn!(
                "Unrecognized or unexpected AC-3 header: sync={:#X}, fscod={}, frmsizecod={}",
                syncword, fscod, frmsizecod
            );
            return;
        }

        let sampling_frequency = SAMPLING_FREQUENCY_TABLE[fscod as usize];
        let mut frame_size_in_words =
            BITRATE_TABLE[(frmsizecod >> 1) as usize] * (SAMPLES_PER_FRAME * 1000 / 16) / sampling_frequency;
        if fscod == 1 && frmsizecod & 1 != 0 {
            frame_size_in_words += 1;
        }
        let frame_size = 2 * frame_size_in_words as usize;
        if data.len() != frame_size {
            warn!(
                "Frame size mismatch for AC-3: actual={}, expected={}",
                data.len(),
                frame_size
            );
            return;
        }

        let duration_ticks = 90000u64 * SAMPLES_PER_FRAME as u64 / sampling_frequency as u64;
        frame.duration = TimeStamp::from_90khz(duration_ticks);

        // Essential parameters unchanged: keep the current template
        if self.silent_frame.data.len() >= MIN_AC3_FRAME_SIZE
            && fscod == self.sample_rate_code
            && acmod == self.audio_coding_mode
            && lfeon == self.lfe_present
            && (frmsizecod & !1) == (self.frame_size_code & !1)
        {
            return;
        }

        self.sample_rate_code = fscod;
        self.audio_coding_mode = acmod;
        self.frame_size_code = frmsizecod;
        self.lfe_present = lfeon;

        let nfchans = CHANNELS_TABLE[acmod as usize] as usize;

        info!(
            "New AC-3 frame read: sf={}Hz, nChannels={}, bitrate={}, size={}, acmod={}, lfeon={}",
            sampling_frequency,
            nfchans,
            BITRATE_TABLE[(frmsizecod >> 1) as usize],
            frame_size,
            acmod,
            lfeon
        );

        let mut out = BitWriter::new();

        // syncinfo
        out.write(syncword, 16);
        out.write(0, 16); // crc1 computed later
        out.write(fscod, 2);
        out.write(frmsizecod, 6);

        // bsi
        out.write(bsid, 5);
        out.write(bsmod, 3);
        out.write(acmod, 3);
        if (acmod & 0x1) != 0 && acmod != 0x1 {
            out.write(cmixlev, 2);
        }
        if acmod & 0x4 != 0 {
            out.write(surmixlev, 2);
        }
        if acmod == 0x2 {
            out.write(0, 2); // dsurmod
        }
        out.write(lfeon, 1);
        out.write(dialnorm, 5);
        out.write(0, 1); // compre
        out.write(0, 1); // langcode
        out.write(0, 1); // audprodie
        if acmod == 0 {
            // Dual mono carries these a second time
            out.write(dialnorm, 5);
            out.write(0, 1);
            out.write(0, 1);
            out.write(0, 1);
        }
        out.write(0, 1); // copyrightb
        out.write(1, 1); // origbs
        out.write(0, 1); // timecod1e
        out.write(0, 1); // timecod2e
        out.write(0, 1); // addbsie

        // Start of the first audio block
        for _ in 0..nfchans {
            out.write(0, 1); // blksw
        }
        for _ in 0..nfchans {
            out.write(0, 1); // dithflag
        }
        let n = if acmod == 0 { 2 } else { 1 };
        for _ in 0..n {
            out.write(0, 1); // dynrnge
        }
        // The first block must carry a coupling strategy
        out.write(1, 1); // cplstre
        out.write(0, 1); // cplinu
        if acmod == 2 {
            out.write(1, 1); // rematstr
            for _ in 0..4 {
                out.write(0, 1); // rematflg
            }
        }
        for _ in 0..nfchans {
            out.write(1, 2); // chexpstr
        }
        if lfeon != 0 {
            out.write(1, 1); // lfeexpstr
        }
        for _ in 0..nfchans {
            out.write(0, 6); // chbwcod
        }
        // Exponents coding flat silence
        let exps: [u32; 26] = [
            15, 124, 117, 62, 62, 62, 62, 62, 62, 62, 62, 62, 62, 62, 62, 62, 62, 62, 62, 62, 62,
            62, 62, 62, 62, 62,
        ];
        for _ in 0..nfchans {
            let group_size = 3; // chexpstr D15
            let nchgrps = (73 + group_size - 4) / group_size;
            out.write(exps[0], 4);
            for &exp in exps.iter().take(nchgrps + 1).skip(1) {
                out.write(exp, 7);
            }
            out.write(0, 2); // gainrng
        }
        if lfeon != 0 {
            out.write(exps[0], 4);
            for &exp in exps.iter().take(3).skip(1) {
                out.write(exp, 7);
            }
        }
        // Bit allocation parametric info
        out.write(1, 1); // baie
        out.write(0, 2); // sdcycod
        out.write(0, 2); // fdcycod
        out.write(0, 2); // sgaincod
        out.write(0, 2); // dbpbcod
        out.write(0, 3); // floorcod
        // SNR offsets
        out.write(1, 1); // snroffste
        out.write(0, 6); // csnroffst
        for _ in 0..nfchans {
            out.write(0, 4); // fsnroffst
            out.write(0, 3); // fgaincod
        }
        if lfeon != 0 {
            out.write(0, 4);
            out.write(0, 3);
        }
        out.write(0, 1); // deltbaie
        out.write(0, 1); // skiple
        out.align();

        // All remaining fields stay zero: coefficients of block 0 read as
        // zero and the later blocks have all enable flags off
        let mut silent = out.into_bytes();
        silent.resize(frame_size, 0);

        // crc1 covers the first 5/8 of the frame, including its own slot
        let framesize_5_8 = ((frame_size >> 2) + (frame_size >> 4)) << 1;
        let crc1 = reverse_crc16(&silent[2..framesize_5_8]);
        silent[2] = (crc1 >> 8) as u8;
        silent[3] = crc1 as u8;

        // Clear auxdatae/crcrsv, then crc2 over everything after crc1
        let len = silent.len();
        silent[len - 3] &= 0xFC;
        let crc2 = crc16(&silent[2..len - 2]);
        silent[len - 2] = (crc2 >> 8) as u8;
        silent[len - 1] = crc2 as u8;

        self.silent_frame.data = silent;
        self.silent_frame.duration = frame.duration;

        info!("New AC-3 silence frame is {} bytes", self.silent_frame.data.len());
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

    fn ac3_frame(fscod: u32, frmsizecod: u32, acmod: u32) -> Frame {
        let sampling_frequency = SAMPLING_FREQUENCY_TABLE[fscod as usize];
        let words = BITRATE_TABLE[(frmsizecod >> 1) as usize] * (SAMPLES_PER_FRAME * 1000 / 16)
            / sampling_frequency;

        let mut out = BitWriter::new();
        out.write(0x0B77, 16);
        out.write(0, 16); // crc1 (not checked on ingest)
        out.write(fscod, 2);
        out.write(frmsizecod, 6);
        out.write(8, 5); // bsid
        out.write(0, 3); // bsmod
        out.write(acmod, 3);
        if acmod == 2 {
            out.write(0, 2); // dsurmod
        }
        out.write(0, 1); // lfeon
        out.write(31, 5); // dialnorm
        out.align();

        let mut frame = Frame::default();
        frame.data = out.into_bytes();
        frame.data.resize(2 * words as usize, 0x11);
        frame
    }

    #[test]
    fn duration_and_template_size() {
        let mut creator = Ac3FillerFrameCreator::default();
        let mut frame = ac3_frame(0, 2 << 1, 2); // 48 kHz, 48 kbps, stereo
        creator.process_incoming_frame(&mut frame);

        // 1536 samples at 48 kHz = 2880 ticks (32 ms)
        assert_eq!(frame.duration.as_90khz(), 2880);

        let filler = creator.create().unwrap();
        assert_eq!(filler.data.len(), frame.data.len());
        assert_eq!(filler.duration.as_90khz(), 2880);
        // Header parameters survive
        assert_eq!(filler.data[0], 0x0B);
        assert_eq!(filler.data[1], 0x77);
        assert_eq!(filler.data[4], frame.data[4]); // fscod + frmsizecod

        // Both CRC regions must check out to zero remainder
        let frame_size = filler.data.len();
        let framesize_5_8 = ((frame_size >> 2) + (frame_size >> 4)) << 1;
        assert_eq!(crc16(&filler.data[2..framesize_5_8]), 0);
        assert_eq!(crc16(&filler.data[2..]), 0);
    }

    #[test]
    fn too_small_frame_is_rejected() {
        let mut creator = Ac3FillerFrameCreator::default();
        let mut frame = Frame::default();
        frame.data = vec![0; 32];
        creator.process_incoming_frame(&mut frame);
        assert!(creator.create().is_none());
    }
}
