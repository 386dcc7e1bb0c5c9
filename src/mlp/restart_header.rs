//! Restart headers carrying decoder reset parameters.
//!
//! ## Restart Sync Words
//!
//! The 14-bit restart sync word is constrained by the substream index:
//!
//! - substream 0: 0x31EA
//! - substream 1: 0x31EA or 0x31EB
//! - substream 2: 0x31EB
//! - substream 3: 0x31EC
//!
//! The header closes with an 8-bit CRC over every bit since the sync word,
//! computed with polynomial 0x1D across the non-byte-aligned span.

use anyhow::{Result, bail};
use log::warn;

use crate::mlp::{MlpWarningFlags, max_substream_channels};
use crate::utils::bitstream_io::BsIoSliceReader;
use crate::utils::crc::{CRC_MLP_RESTART_HEADER_ALG, Crc8};
use crate::utils::errors::MlpRestartHeaderError;

static CRC_RESTART_HEADER: Crc8 = Crc8::new(&CRC_MLP_RESTART_HEADER_ALG);

const RESTART_SYNC_RANGES: [(u16, u16); 4] = [
    (0x31EA, 0x31EA),
    (0x31EA, 0x31EB),
    (0x31EB, 0x31EB),
    (0x31EC, 0x31EC),
];

/// Decoder initialization parameters of one substream.
#[derive(Clone, Copy, Debug, Default)]
pub struct RestartHeader {
    pub restart_sync_word: u16,
    pub output_timing: u16,
    pub min_chan: u8,
    pub max_chan: u8,
    pub max_matrix_chan: u8,
    pub dither_shift: u8,
    pub dither_seed: u32,
    pub max_shift: i8,
    pub max_lsbs: u8,
    pub max_bits: u8,
    pub error_protect: bool,
    pub lossless_check: u8,
    pub ch_assign: [u8; 16],
    pub restart_header_crc: u8,
}

impl RestartHeader {
    /// Noise channels come from the seeded generator rather than coded data
    /// when the sync word has a cleared LSB (0x31EA).
    pub fn noise_type(&self) -> bool {
        self.restart_sync_word & 0x1 != 0
    }

    pub fn read(
        reader: &mut BsIoSliceReader,
        ss_idx: usize,
        warnings: &mut MlpWarningFlags,
    ) -> Result<Self> {
        let start_pos = reader.position()?;

        let mut rh = Self {
            restart_sync_word: reader.get_n(14)?,
            output_timing: reader.get_n(16)?,
            min_chan: reader.get_n(4)?,
            max_chan: reader.get_n(4)?,
            max_matrix_chan: reader.get_n(4)?,
            dither_shift: reader.get_n(4)?,
            dither_seed: reader.get_n(23)?,
            max_shift: reader.get_s(4)?,
            max_lsbs: reader.get_n(5)?,
            ..Default::default()
        };

        if !(0x31EA..=0x31EC).contains(&rh.restart_sync_word) {
            bail!(MlpRestartHeaderError::UnknownSyncWord(rh.restart_sync_word));
        }

        let (lo, hi) = RESTART_SYNC_RANGES[ss_idx & 3];
        if rh.restart_sync_word < lo || hi < rh.restart_sync_word {
            bail!(MlpRestartHeaderError::SyncWordForbiddenForSubstream {
                sync_word: rh.restart_sync_word,
                substream: ss_idx,
            });
        }

        if rh.max_chan <= rh.min_chan {
            bail!(MlpRestartHeaderError::ChannelRangeEmpty {
                min_chan: rh.min_chan,
                max_chan: rh.max_chan,
            });
        }

        let max_channels = max_substream_channels(ss_idx);
        if rh.max_chan as u32 + 1 > max_channels {
            bail!(MlpRestartHeaderError::TooManyChannels {
                substream: ss_idx,
                count: rh.max_chan as u32 + 1,
                max: max_channels,
            });
        }

        if rh.max_matrix_chan as u32 + 1 > max_channels {
            bail!(MlpRestartHeaderError::TooManyMatrixChannels(
                rh.max_matrix_chan
            ));
        }

        if rh.max_shift < 0 || rh.max_shift > 24 {
            bail!(MlpRestartHeaderError::MaxShiftOutOfRange(rh.max_shift));
        }

        if rh.max_lsbs > 24 {
            bail!(MlpRestartHeaderError::MaxLsbsTooLarge(rh.max_lsbs));
        }

        let max_bits: u8 = reader.get_n(5)?;
        let max_bits_repeat: u8 = reader.get_n(5)?;

        if max_bits != max_bits_repeat {
            bail!(MlpRestartHeaderError::MaxBitsMismatch {
                first: max_bits,
                second: max_bits_repeat,
            });
        }

        if max_bits > 24 {
            bail!(MlpRestartHeaderError::MaxBitsTooLarge(max_bits));
        }

        rh.max_bits = max_bits;
        rh.error_protect = reader.get()?;
        rh.lossless_check = reader.get_n(8)?;

        let reserved: u16 = reader.get_n(16)?;
        if reserved != 0 && !warnings.restart_reserved_non_zero {
            warn!("Non-zero reserved field in restart header ({reserved:#06X})");
            warnings.restart_reserved_non_zero = true;
        }

        for i in 0..=rh.max_matrix_chan as usize {
            let ch_assign: u8 = reader.get_n(6)?;

            if ch_assign > rh.max_matrix_chan {
                bail!(MlpRestartHeaderError::ChannelAssignTooHigh {
                    index: i,
                    value: ch_assign,
                    max: rh.max_matrix_chan,
                });
            }

            rh.ch_assign[i] = ch_assign;
        }

        let len = reader.position()? - start_pos;

        rh.restart_header_crc = reader.get_n(8)?;

        let crc = reader.crc8_check(&CRC_RESTART_HEADER, start_pos, len)?;

        if crc != rh.restart_header_crc {
            bail!(MlpRestartHeaderError::CrcMismatch {
                calculated: crc,
                read: rh.restart_header_crc,
            });
        }

        Ok(rh)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::utils::bitstream_io::BsIoVecWriter;

    pub(crate) fn write_restart_header(w: &mut BsIoVecWriter, output_timing: u16) {
        w.put_n(14, 0x31EAu16).unwrap();
        w.put_n(16, output_timing).unwrap();
        w.put_n(4, 0u8).unwrap(); // min_chan
        w.put_n(4, 1u8).unwrap(); // max_chan
        w.put_n(4, 1u8).unwrap(); // max_matrix_chan
        w.put_n(4, 0u8).unwrap(); // dither_shift
        w.put_n(23, 0u32).unwrap(); // dither_seed
        w.put_n(4, 0u8).unwrap(); // max_shift
        w.put_n(5, 24u8).unwrap(); // max_lsbs
        w.put_n(5, 16u8).unwrap(); // max_bits
        w.put_n(5, 16u8).unwrap(); // max_bits repeated
        w.put(false).unwrap(); // error_protect
        w.put_n(8, 0u8).unwrap(); // lossless_check
        w.put_n(16, 0u16).unwrap(); // reserved
        w.put_n(6, 0u8).unwrap(); // ch_assign[0]
        w.put_n(6, 1u8).unwrap(); // ch_assign[1]
    }

    #[test]
    fn crc_mismatch_is_detected() {
        let mut w = BsIoVecWriter::default();
        write_restart_header(&mut w, 0);
        w.byte_align().unwrap();
        let body = w.finish().unwrap();

        let mut probe_reader = BsIoSliceReader::from_slice(&body);
        let len = 14 + 16 + 4 * 3 + 4 + 23 + 4 + 5 * 3 + 1 + 8 + 16 + 6 * 2;
        let crc = probe_reader.crc8_check(&CRC_RESTART_HEADER, 0, len).unwrap();

        let mut w = BsIoVecWriter::default();
        write_restart_header(&mut w, 0);
        w.put_n(8, crc ^ 0x55).unwrap(); // corrupted CRC
        w.byte_align().unwrap();
        let data = w.finish().unwrap();

        let mut reader = BsIoSliceReader::from_slice(&data);
        assert!(RestartHeader::read(&mut reader, 0, &mut MlpWarningFlags::default()).is_err());
    }

    #[test]
    fn valid_header_parses_with_correct_crc() -> Result<()> {
        let mut w = BsIoVecWriter::default();
        write_restart_header(&mut w, 0x1234);
        w.byte_align().unwrap();
        let body = w.finish().unwrap();

        // Derive the expected CRC with the same routine the parser uses.
        let mut probe_reader = BsIoSliceReader::from_slice(&body);
        let len = 14 + 16 + 4 * 3 + 4 + 23 + 4 + 5 * 3 + 1 + 8 + 16 + 6 * 2;
        let crc = probe_reader.crc8_check(&CRC_RESTART_HEADER, 0, len)?;

        let mut w = BsIoVecWriter::default();
        write_restart_header(&mut w, 0x1234);
        w.put_n(8, crc).unwrap();
        w.byte_align().unwrap();
        let data = w.finish().unwrap();

        let mut reader = BsIoSliceReader::from_slice(&data);
        let rh = RestartHeader::read(&mut reader, 0, &mut MlpWarningFlags::default())?;
        assert_eq!(rh.restart_sync_word, 0x31EA);
        assert_eq!(rh.output_timing, 0x1234);
        assert_eq!(rh.max_chan, 1);
        assert_eq!(rh.max_bits, 16);
        assert!(!rh.noise_type());
        Ok(())
    }

    #[test]
    fn sync_word_constrained_by_substream() {
        let mut w = BsIoVecWriter::default();
        w.put_n(14, 0x31ECu16).unwrap();
        w.put_n(16, 0u16).unwrap();
        w.put_n(4, 0u8).unwrap();
        w.put_n(4, 1u8).unwrap();
        w.put_n(4, 1u8).unwrap();
        w.put_n(4, 0u8).unwrap();
        w.put_n(23, 0u32).unwrap();
        w.put_n(4, 0u8).unwrap();
        w.put_n(5, 0u8).unwrap();
        w.put_n(5, 16u8).unwrap();
        w.put_n(5, 16u8).unwrap();
        w.put(false).unwrap();
        w.put_n(8, 0u8).unwrap();
        w.put_n(16, 0u16).unwrap();
        w.put_n(6, 0u8).unwrap();
        w.put_n(6, 0u8).unwrap();
        w.put_n(8, 0u8).unwrap();
        w.byte_align().unwrap();
        let data = w.finish().unwrap();

        let mut reader = BsIoSliceReader::from_slice(&data);
        // 0x31EC is reserved for substream 3.
        assert!(RestartHeader::read(&mut reader, 0, &mut MlpWarningFlags::default()).is_err());
    }
}
