//! Substream directory and substream segments.
//!
//! The directory follows the access unit sync and locates up to four
//! substream segments through 12-bit end pointers in 16-bit words. Each
//! segment is a run of blocks closed by a `last_block_in_segment` bit, an
//! optional stream terminator and an optional parity/CRC pair.

use anyhow::{Result, bail};

use crate::mlp::block::read_block;
use crate::mlp::{MlpWarningFlags, SubstreamState};
use crate::utils::bitstream_io::BsIoSliceReader;
use crate::utils::crc::{CRC_MLP_SUBSTREAM_ALG, Crc8};
use crate::utils::errors::MlpSubstreamError;

static CRC_SUBSTREAM: Crc8 = Crc8::new(&CRC_MLP_SUBSTREAM_ALG);

/// Terminator A constant closing the final access unit of a stream.
pub const TERMINATOR_A: u32 = 0x3FFF4;

/// Terminator B constant, present when no zero-sample count is signaled.
pub const TERMINATOR_B: u16 = 0x1234;

/// One directory entry locating a substream segment.
#[derive(Clone, Copy, Debug, Default)]
pub struct SubstreamDirectoryEntry {
    pub extra_substream_word: bool,
    pub restart_nonexistent: bool,
    pub crc_present: bool,
    pub substream_end_ptr: u16,
    pub drc_gain_update: i16,
    pub drc_time_update: u8,
    /// Segment size in 16-bit words, derived from consecutive end pointers.
    pub substream_size: u16,
}

impl SubstreamDirectoryEntry {
    /// Reads one entry, returning it together with the XOR of its 16-bit
    /// words for the access unit nibble parity check.
    pub fn read(reader: &mut BsIoSliceReader) -> Result<(Self, u16)> {
        let word: u16 = reader.get_n(16)?;
        let mut parity = word;

        let mut entry = Self {
            extra_substream_word: word & 0x8000 != 0,
            restart_nonexistent: word & 0x4000 != 0,
            crc_present: word & 0x2000 != 0,
            substream_end_ptr: word & 0xFFF,
            ..Default::default()
        };

        if entry.extra_substream_word {
            let drc_word: u16 = reader.get_n(16)?;
            parity ^= drc_word;

            entry.drc_gain_update = (((drc_word >> 7) << 7) as i16) >> 7;
            entry.drc_time_update = ((drc_word >> 4) & 0x7) as u8;
        }

        Ok((entry, parity))
    }
}

/// Reads one substream segment of `entry.substream_size` 16-bit words.
pub fn read_substream_segment(
    reader: &mut BsIoSliceReader,
    ss: &mut SubstreamState,
    entry: &SubstreamDirectoryEntry,
    ss_idx: usize,
    samples_per_au: usize,
    warnings: &mut MlpWarningFlags,
) -> Result<()> {
    let start_pos = reader.position()?;
    let segment_bits = (entry.substream_size as u64) << 4;
    let expected_end = start_pos + segment_bits;

    // Per access unit: matrix parameters and per-channel filters may each
    // change at most once.
    ss.matrix_changes = 0;
    for cp in &mut ss.channel_params {
        cp.fir_changes = 0;
        cp.iir_changes = 0;
    }

    loop {
        read_block(reader, ss, ss_idx, samples_per_au, warnings)?;

        // last_block_in_segment
        if reader.get()? {
            break;
        }

        if reader.position()? >= expected_end {
            bail!(MlpSubstreamError::SegmentOverrun { substream: ss_idx });
        }
    }

    reader.align_16bit()?;

    if reader.position()? > expected_end {
        bail!(MlpSubstreamError::SegmentOverrun { substream: ss_idx });
    }

    let mut terminator_space = 32;
    if entry.crc_present {
        terminator_space += 16;
    }

    if expected_end - reader.position()? >= terminator_space {
        let terminator_a: u32 = reader.get_n(18)?;
        if terminator_a != TERMINATOR_A {
            bail!(MlpSubstreamError::InvalidTerminatorA(terminator_a));
        }

        // zero_samples_indicated
        if reader.get()? {
            let _zero_samples: u16 = reader.get_n(13)?;
        } else {
            let terminator_b: u16 = reader.get_n(13)?;
            if terminator_b != TERMINATOR_B {
                bail!(MlpSubstreamError::InvalidTerminatorB(terminator_b));
            }
        }

        ss.terminator_reached = true;
    } else {
        ss.terminator_reached = false;
    }

    let seg_data_bits = reader.position()? - start_pos;

    if entry.crc_present {
        let parity = reader.parity_check(start_pos, seg_data_bits)? ^ 0xA9;

        let substream_parity: u8 = reader.get_n(8)?;
        if parity != substream_parity {
            bail!(MlpSubstreamError::ParityMismatch {
                substream: ss_idx,
                calculated: parity,
                read: substream_parity,
            });
        }

        let crc = reader.crc8_check(&CRC_SUBSTREAM, start_pos, seg_data_bits)?;

        let substream_crc: u8 = reader.get_n(8)?;
        if crc != substream_crc {
            bail!(MlpSubstreamError::CrcMismatch {
                substream: ss_idx,
                calculated: crc,
                read: substream_crc,
            });
        }
    }

    if reader.position()? != expected_end {
        bail!(MlpSubstreamError::SegmentSizeMismatch {
            substream: ss_idx,
            parsed: reader.position()? - start_pos,
            expected: segment_bits,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::bitstream_io::BsIoVecWriter;

    #[test]
    fn directory_entry_unpacks_flags() -> Result<()> {
        let mut w = BsIoVecWriter::default();
        w.put(true)?; // extra_substream_word
        w.put(false)?; // restart_nonexistent
        w.put(true)?; // crc_present
        w.put(false)?; // reserved
        w.put_n(12, 0x234u16)?;
        w.put_n(9, 0x1F0u16)?; // drc_gain_update (negative)
        w.put_n(3, 0x5u8)?; // drc_time_update
        w.put_n(4, 0u8)?; // reserved
        let data = w.finish()?;

        let mut reader = BsIoSliceReader::from_slice(&data);
        let (entry, parity) = SubstreamDirectoryEntry::read(&mut reader)?;
        assert!(entry.extra_substream_word);
        assert!(!entry.restart_nonexistent);
        assert!(entry.crc_present);
        assert_eq!(entry.substream_end_ptr, 0x234);
        assert_eq!(entry.drc_time_update, 5);
        assert!(entry.drc_gain_update < 0);
        assert_eq!(parity, 0xA234 ^ 0xF850);
        Ok(())
    }
}
