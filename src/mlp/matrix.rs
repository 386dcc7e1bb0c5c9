//! Primitive matrix parameters for multi-channel decoding.
//!
//! Matrix parameters may appear at most once per access unit and substream.
//! Substreams using the 0x31EA restart sync carry two extra noise channels
//! in the coefficient loop and a per-matrix noise shift.

use anyhow::{Result, bail};

use crate::mlp::restart_header::RestartHeader;
use crate::utils::bitstream_io::BsIoSliceReader;
use crate::utils::errors::MlpMatrixError;

pub const MLP_MAX_NB_MATRICES: usize = 8;

/// One primitive matrix configuration.
#[derive(Clone, Copy, Debug, Default)]
pub struct Matrix {
    pub output_chan: u8,
    pub num_frac_bits: u8,
    pub lsb_bypass_exists: bool,
    pub noise_shift: u8,
}

/// Full matrix parameter set of one substream.
#[derive(Clone, Copy, Debug, Default)]
pub struct MatrixParameters {
    pub num_primitive_matrices: u8,
    pub matrices: [Matrix; MLP_MAX_NB_MATRICES],
}

impl MatrixParameters {
    pub fn read(reader: &mut BsIoSliceReader, restart_header: &RestartHeader) -> Result<Self> {
        let noise_type = restart_header.noise_type();

        let mut mp = Self {
            num_primitive_matrices: reader.get_n(4)?,
            ..Default::default()
        };

        if mp.num_primitive_matrices as usize > MLP_MAX_NB_MATRICES {
            bail!(MlpMatrixError::TooManyMatrices(mp.num_primitive_matrices));
        }

        for mat in 0..mp.num_primitive_matrices as usize {
            let matrix = &mut mp.matrices[mat];

            matrix.output_chan = reader.get_n(4)?;
            matrix.num_frac_bits = reader.get_n(4)?;
            matrix.lsb_bypass_exists = reader.get()?;

            let mut max_nb_channels = restart_header.max_chan;
            if !noise_type {
                max_nb_channels += 2;
            }

            for _ch in 0..=max_nb_channels {
                // matrix_coeff_present
                if reader.get()? {
                    // coeff_value
                    reader.skip_n(2 + matrix.num_frac_bits as u32)?;
                }
            }

            if !noise_type {
                matrix.noise_shift = reader.get_n(4)?;
            }
        }

        Ok(mp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::bitstream_io::BsIoVecWriter;

    #[test]
    fn matrix_with_noise_channels() -> Result<()> {
        let restart_header = RestartHeader {
            restart_sync_word: 0x31EA,
            min_chan: 0,
            max_chan: 1,
            max_matrix_chan: 1,
            ..Default::default()
        };

        let mut w = BsIoVecWriter::default();
        w.put_n(4, 1u8).unwrap(); // one matrix
        w.put_n(4, 0u8).unwrap(); // output channel
        w.put_n(4, 2u8).unwrap(); // num_frac_bits
        w.put(true).unwrap(); // lsb_bypass_exists
        // max_chan + 2 noise channels => 4 coefficient slots
        for present in [true, false, true, false] {
            w.put(present).unwrap();
            if present {
                w.put_n(4, 0u8).unwrap(); // 2 + num_frac_bits
            }
        }
        w.put_n(4, 3u8).unwrap(); // matrix_noise_shift
        w.byte_align().unwrap();
        let data = w.finish().unwrap();

        let mut reader = BsIoSliceReader::from_slice(&data);
        let mp = MatrixParameters::read(&mut reader, &restart_header)?;
        assert_eq!(mp.num_primitive_matrices, 1);
        assert!(mp.matrices[0].lsb_bypass_exists);
        assert_eq!(mp.matrices[0].noise_shift, 3);
        Ok(())
    }
}
