//! Audio blocks: selective header updates and entropy-coded sample data.
//!
//! A block optionally re-states decoding parameters gated by the
//! `block_header_content` mask, then carries per-sample data: bypassed
//! matrix LSBs, a Huffman-coded MSB per channel and a fixed-width LSB
//! residual. Sample values are not reconstructed here; the data is walked
//! bit-exactly so the access unit geometry and CRCs can be validated.

use anyhow::{Result, bail};

use crate::mlp::{MlpWarningFlags, SubstreamState};
use crate::mlp::filter::{FilterParams, FilterType, MLP_FIR_IIR_TOTAL_MAX_ORDER};
use crate::mlp::matrix::MatrixParameters;
use crate::mlp::restart_header::RestartHeader;
use crate::utils::bitstream_io::BsIoSliceReader;
use crate::utils::errors::{MlpBlockError, MlpFilterError};

pub const BHC_BLOCK_HEADER_CONTENT: u8 = 0x80;
pub const BHC_HUFFMAN_OFFSET: u8 = 0x40;
pub const BHC_IIR_FILTER_PARAMETERS: u8 = 0x20;
pub const BHC_FIR_FILTER_PARAMETERS: u8 = 0x10;
pub const BHC_QUANT_STEP_SIZE: u8 = 0x08;
pub const BHC_OUTPUT_SHIFT: u8 = 0x04;
pub const BHC_MATRIX_PARAMETERS: u8 = 0x02;
pub const BHC_BLOCK_SIZE: u8 = 0x01;

/// Default `block_header_content`: every section may appear.
pub const BHC_DEFAULT: u8 = 0xFF;

const HUFFMAN_LONGEST_CODE_SIZE: u32 = 9;

struct HuffmanEntry {
    mask: u16,
    code: u16,
    size: u32,
    value: i32,
}

struct HuffmanBook {
    entries: &'static [HuffmanEntry],
    /// Number of decodable entries when only `i` input bits remain.
    book_size: [usize; HUFFMAN_LONGEST_CODE_SIZE as usize + 1],
}

macro_rules! huffman_entries {
    ($(($mask:expr, $code:expr, $size:expr, $value:expr)),+ $(,)?) => {
        &[$(HuffmanEntry { mask: $mask, code: $code, size: $size, value: $value }),+]
    };
}

static HUFFMAN_BOOKS: [HuffmanBook; 3] = [
    // Codebook 1, symbols -7..=+10.
    HuffmanBook {
        entries: huffman_entries![
            (0x1C0, 0x040, 3, -1),
            (0x1C0, 0x140, 3, 0),
            (0x1C0, 0x100, 3, 1),
            (0x1C0, 0x180, 3, 2),
            (0x1C0, 0x1C0, 3, 3),
            (0x1C0, 0x0C0, 3, 4),
            (0x1E0, 0x020, 4, -2),
            (0x1E0, 0x0A0, 4, 5),
            (0x1F0, 0x010, 5, -3),
            (0x1F0, 0x090, 5, 6),
            (0x1F8, 0x008, 6, -4),
            (0x1F8, 0x088, 6, 7),
            (0x1FC, 0x004, 7, -5),
            (0x1FC, 0x084, 7, 8),
            (0x1FE, 0x002, 8, -6),
            (0x1FE, 0x082, 8, 9),
            (0x1FF, 0x001, 9, -7),
            (0x1FF, 0x081, 9, 10),
        ],
        book_size: [0, 0, 0, 6, 8, 10, 12, 14, 16, 18],
    },
    // Codebook 2, symbols -7..=+8.
    HuffmanBook {
        entries: huffman_entries![
            (0x180, 0x100, 2, 0),
            (0x180, 0x180, 2, 1),
            (0x1C0, 0x040, 3, -1),
            (0x1C0, 0x0C0, 3, 2),
            (0x1E0, 0x020, 4, -2),
            (0x1E0, 0x0A0, 4, 3),
            (0x1F0, 0x010, 5, -3),
            (0x1F0, 0x090, 5, 4),
            (0x1F8, 0x008, 6, -4),
            (0x1F8, 0x088, 6, 5),
            (0x1FC, 0x004, 7, -5),
            (0x1FC, 0x084, 7, 6),
            (0x1FE, 0x002, 8, -6),
            (0x1FE, 0x082, 8, 7),
            (0x1FF, 0x001, 9, -7),
            (0x1FF, 0x081, 9, 8),
        ],
        book_size: [0, 0, 2, 4, 6, 8, 10, 12, 14, 16],
    },
    // Codebook 3, symbols -7..=+7.
    HuffmanBook {
        entries: huffman_entries![
            (0x100, 0x100, 1, 0),
            (0x1C0, 0x040, 3, -1),
            (0x1C0, 0x0C0, 3, 1),
            (0x1E0, 0x020, 4, -2),
            (0x1E0, 0x0A0, 4, 2),
            (0x1F0, 0x010, 5, -3),
            (0x1F0, 0x090, 5, 3),
            (0x1F8, 0x008, 6, -4),
            (0x1F8, 0x088, 6, 4),
            (0x1FC, 0x004, 7, -5),
            (0x1FC, 0x084, 7, 5),
            (0x1FE, 0x002, 8, -6),
            (0x1FE, 0x082, 8, 6),
            (0x1FF, 0x001, 9, -7),
            (0x1FF, 0x081, 9, 7),
        ],
        book_size: [0, 1, 1, 3, 5, 7, 9, 11, 13, 15],
    },
];

/// Decodes one entropy-coded MSB from the given codebook (1..=3).
fn read_huffman_code(reader: &mut BsIoSliceReader, codebook: u8) -> Result<i32> {
    let book = &HUFFMAN_BOOKS[codebook as usize - 1];

    let mut max_code_size = reader.available()? as u32;
    if max_code_size == 0 {
        bail!(MlpBlockError::HuffmanDecodeFailure { input: 0 });
    }
    max_code_size = max_code_size.min(HUFFMAN_LONGEST_CODE_SIZE);

    let lut_size = book.book_size[max_code_size as usize];
    let input = reader.peek_n::<u16>(max_code_size)? << (HUFFMAN_LONGEST_CODE_SIZE - max_code_size);

    for entry in &book.entries[..lut_size] {
        if input & entry.mask == entry.code {
            reader.skip_n(entry.size)?;
            return Ok(entry.value);
        }
    }

    bail!(MlpBlockError::HuffmanDecodeFailure { input })
}

/// Per-channel entropy and filter parameters from the block header.
#[derive(Clone, Copy, Debug)]
pub struct ChannelParams {
    pub fir: FilterParams,
    pub iir: FilterParams,
    pub fir_changes: u8,
    pub iir_changes: u8,
    pub huffman_offset: i16,
    pub codebook: u8,
    pub num_huffman_lsbs: u8,
}

impl Default for ChannelParams {
    fn default() -> Self {
        Self {
            fir: FilterParams::default(),
            iir: FilterParams::default(),
            fir_changes: 0,
            iir_changes: 0,
            huffman_offset: 0,
            codebook: 0,
            num_huffman_lsbs: 24,
        }
    }
}

impl ChannelParams {
    fn read(
        reader: &mut BsIoSliceReader,
        ss: &mut SubstreamState,
        ch: usize,
    ) -> Result<()> {
        let block_header_content = ss.block_header_content;

        if block_header_content & BHC_FIR_FILTER_PARAMETERS != 0 {
            // fir_filter_parameters_present
            if reader.get()? {
                let cp = &mut ss.channel_params[ch];
                cp.fir_changes += 1;
                if cp.fir_changes > 1 {
                    bail!(MlpBlockError::FilterParametersRepeated {
                        filter: "FIR",
                        channel: ch,
                    });
                }
                cp.fir = FilterParams::read(reader, FilterType::Fir)?;
            }
        }

        if block_header_content & BHC_IIR_FILTER_PARAMETERS != 0 {
            // iir_filter_parameters_present
            if reader.get()? {
                let cp = &mut ss.channel_params[ch];
                cp.iir_changes += 1;
                if cp.iir_changes > 1 {
                    bail!(MlpBlockError::FilterParametersRepeated {
                        filter: "IIR",
                        channel: ch,
                    });
                }
                cp.iir = FilterParams::read(reader, FilterType::Iir)?;
            }
        }

        let cp = &mut ss.channel_params[ch];

        if cp.fir.order + cp.iir.order > MLP_FIR_IIR_TOTAL_MAX_ORDER {
            bail!(MlpFilterError::TotalOrderTooHigh {
                fir: cp.fir.order,
                iir: cp.iir.order,
            });
        }

        if cp.fir.order > 0 && cp.iir.order > 0 && cp.fir.shift != cp.iir.shift {
            bail!(MlpFilterError::ShiftMismatch {
                fir: cp.fir.shift,
                iir: cp.iir.shift,
            });
        }

        if block_header_content & BHC_HUFFMAN_OFFSET != 0 {
            // huffman_offset_present
            if reader.get()? {
                cp.huffman_offset = reader.get_s(15)?;
            }
        }

        cp.codebook = reader.get_n(2)?;
        cp.num_huffman_lsbs = reader.get_n(5)?;

        if cp.num_huffman_lsbs > 24 {
            bail!(MlpBlockError::HuffmanLsbsTooLarge(cp.num_huffman_lsbs));
        }

        Ok(())
    }
}

fn read_block_header(
    reader: &mut BsIoSliceReader,
    ss: &mut SubstreamState,
    samples_per_au: usize,
) -> Result<()> {
    if ss.block_header_content & BHC_BLOCK_HEADER_CONTENT != 0 {
        // block_header_content_exists
        if reader.get()? {
            ss.block_header_content = reader.get_n(8)?;
        }
    }

    if ss.block_header_content & BHC_BLOCK_SIZE != 0 {
        // block_size_present
        if reader.get()? {
            let block_size: u16 = reader.get_n(9)?;
            if block_size as usize > samples_per_au {
                bail!(MlpBlockError::BlockSizeTooLarge(block_size));
            }
            ss.block_size = block_size;
        }
    }

    if ss.block_header_content & BHC_MATRIX_PARAMETERS != 0 {
        // matrix_parameters_present
        if reader.get()? {
            ss.matrix_changes += 1;
            if ss.matrix_changes > 1 {
                bail!(MlpBlockError::MatrixParametersRepeated);
            }
            ss.matrix_params = MatrixParameters::read(reader, &ss.restart_header)?;
        }
    }

    if ss.block_header_content & BHC_OUTPUT_SHIFT != 0 {
        // output_shift_present
        if reader.get()? {
            for _ch in 0..=ss.restart_header.max_matrix_chan as usize {
                let output_shift: i8 = reader.get_s(4)?;
                if output_shift < 0 || output_shift > 23 {
                    bail!(MlpBlockError::OutputShiftOutOfRange(output_shift));
                }
            }
        }
    }

    if ss.block_header_content & BHC_QUANT_STEP_SIZE != 0 {
        // quant_step_size_present
        if reader.get()? {
            for ch in 0..=ss.restart_header.max_matrix_chan as usize {
                ss.quant_step_size[ch] = reader.get_n(4)?;
            }
        }
    }

    for ch in ss.restart_header.min_chan as usize..=ss.restart_header.max_chan as usize {
        // channel_parameters_present
        if reader.get()? {
            ChannelParams::read(reader, ss, ch)?;
        }
    }

    Ok(())
}

fn read_block_data(reader: &mut BsIoSliceReader, ss: &SubstreamState) -> Result<()> {
    let min_chan = ss.restart_header.min_chan as usize;
    let max_chan = ss.restart_header.max_chan as usize;
    let num_matrices = ss.matrix_params.num_primitive_matrices as usize;

    for _sample in 0..ss.block_size {
        for mat in 0..num_matrices {
            if ss.matrix_params.matrices[mat].lsb_bypass_exists {
                // lsb_bypass
                reader.skip_n(1)?;
            }
        }

        for ch in min_chan..=max_chan {
            let cp = &ss.channel_params[ch];

            if cp.num_huffman_lsbs < ss.quant_step_size[ch] {
                bail!(MlpBlockError::QuantStepTooLarge {
                    channel: ch,
                    step: ss.quant_step_size[ch],
                    lsbs: cp.num_huffman_lsbs,
                });
            }
            let num_lsb_bits = (cp.num_huffman_lsbs - ss.quant_step_size[ch]) as u32;

            if cp.codebook > 0 {
                read_huffman_code(reader, cp.codebook)?;
            }

            if num_lsb_bits > 0 {
                reader.skip_n(num_lsb_bits)?;
            }
        }
    }

    Ok(())
}

/// Reads one audio block, updating the substream parameter state.
pub fn read_block(
    reader: &mut BsIoSliceReader,
    ss: &mut SubstreamState,
    ss_idx: usize,
    samples_per_au: usize,
    warnings: &mut MlpWarningFlags,
) -> Result<()> {
    // block_header_exists
    if reader.get()? {
        // restart_header_exists
        if reader.get()? {
            let rh = RestartHeader::read(reader, ss_idx, warnings)?;

            if ss.restart_seen && rh.output_timing != ss.cur_output_timing {
                bail!(crate::utils::errors::MlpRestartHeaderError::OutputTimingMismatch {
                    read: rh.output_timing,
                    expected: ss.cur_output_timing,
                });
            }

            ss.apply_restart_header(rh);
        }

        if !ss.restart_seen {
            bail!(MlpBlockError::MissingRestartHeader);
        }

        read_block_header(reader, ss, samples_per_au)?;
    }

    if !ss.restart_seen {
        bail!(MlpBlockError::MissingRestartHeader);
    }

    if ss.restart_header.error_protect {
        // block_data_bits pointer, parsed but not verified
        reader.skip_n(16)?;
    }

    read_block_data(reader, ss)?;

    if ss.restart_header.error_protect {
        // block_header_CRC, parsed but not verified
        reader.skip_n(8)?;
    }

    ss.cur_output_timing = ss.cur_output_timing.wrapping_add(ss.block_size);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::bitstream_io::BsIoVecWriter;

    #[test]
    fn huffman_book_3_decodes_shortest_code() -> Result<()> {
        // Codebook 3: a leading 1 bit decodes to 0.
        let data = [0b1000_0000];
        let mut reader = BsIoSliceReader::from_slice(&data);
        assert_eq!(read_huffman_code(&mut reader, 3)?, 0);
        assert_eq!(reader.position()?, 1);
        Ok(())
    }

    #[test]
    fn huffman_book_1_decodes_longest_codes() -> Result<()> {
        let mut w = BsIoVecWriter::default();
        w.put_n(9, 0x001u16)?; // -7
        w.put_n(9, 0x081u16)?; // +10
        w.put_n(6, 0u8)?;
        let data = w.finish()?;

        let mut reader = BsIoSliceReader::from_slice(&data);
        assert_eq!(read_huffman_code(&mut reader, 1)?, -7);
        assert_eq!(read_huffman_code(&mut reader, 1)?, 10);
        Ok(())
    }

    #[test]
    fn truncated_input_limits_the_codebook() {
        // Only 2 bits remain: book 1 has no codes shorter than 3 bits.
        let data = [0b0100_0000];
        let mut reader = BsIoSliceReader::from_slice(&data);
        reader.skip_n(6).unwrap();
        assert!(read_huffman_code(&mut reader, 1).is_err());
    }
}
