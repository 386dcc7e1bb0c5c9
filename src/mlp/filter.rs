//! Prediction filter parameters.
//!
//! Each coded channel may carry FIR and IIR filter parameters, each at most
//! once per access unit. The FIR filter is stateless; when both filters are
//! present their prediction shifts must agree and their orders sum to at
//! most 8.

use anyhow::{Result, bail};

use crate::utils::bitstream_io::BsIoSliceReader;
use crate::utils::errors::MlpFilterError;

pub const MLP_FIR_MAX_ORDER: u8 = 8;
pub const MLP_IIR_MAX_ORDER: u8 = 4;
pub const MLP_FIR_IIR_TOTAL_MAX_ORDER: u8 = 8;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FilterType {
    Fir,
    Iir,
}

impl FilterType {
    pub fn name(self) -> &'static str {
        match self {
            FilterType::Fir => "FIR",
            FilterType::Iir => "IIR",
        }
    }

    fn max_order(self) -> u8 {
        match self {
            FilterType::Fir => MLP_FIR_MAX_ORDER,
            FilterType::Iir => MLP_IIR_MAX_ORDER,
        }
    }
}

/// Parameters of one prediction filter.
#[derive(Clone, Copy, Debug, Default)]
pub struct FilterParams {
    pub order: u8,
    pub shift: u8,
    pub coeff_bits: u8,
    pub coeff_shift: u8,
}

impl FilterParams {
    pub fn read(
        reader: &mut BsIoSliceReader,
        filter_type: FilterType,
    ) -> Result<Self> {
        let mut fp = Self {
            order: reader.get_n(4)?,
            ..Default::default()
        };

        if fp.order > filter_type.max_order() {
            bail!(MlpFilterError::OrderTooHigh {
                filter: filter_type.name(),
                order: fp.order,
                max: filter_type.max_order(),
            });
        }

        if fp.order > 0 {
            fp.shift = reader.get_n(4)?;
            fp.coeff_bits = reader.get_n(5)?;

            if fp.coeff_bits < 1 || fp.coeff_bits > 16 {
                bail!(MlpFilterError::InvalidCoeffBits(fp.coeff_bits));
            }

            fp.coeff_shift = reader.get_n(3)?;

            if fp.coeff_bits + fp.coeff_shift > 16 {
                bail!(MlpFilterError::TotalCoeffBitsTooLarge(
                    fp.coeff_bits + fp.coeff_shift
                ));
            }

            for _ in 0..fp.order {
                reader.skip_n(fp.coeff_bits as u32)?;
            }

            // state_present
            if reader.get()? {
                if filter_type == FilterType::Fir {
                    bail!(MlpFilterError::FirStateForbidden);
                }

                let state_bits = reader.get_n::<u8>(4)?;
                let state_shift = reader.get_n::<u8>(4)?;

                if state_bits + state_shift > 24 {
                    bail!(MlpFilterError::TotalStateBitsTooLarge(
                        state_bits + state_shift
                    ));
                }

                if state_bits > 0 {
                    for _ in 0..fp.order {
                        reader.skip_n(state_bits as u32)?;
                    }
                }
            }
        }

        Ok(fp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::bitstream_io::BsIoVecWriter;

    fn filter_bits(order: u8, shift: u8, coeff_bits: u8) -> Vec<u8> {
        let mut w = BsIoVecWriter::default();
        w.put_n(4, order).unwrap();
        w.put_n(4, shift).unwrap();
        w.put_n(5, coeff_bits).unwrap();
        w.put_n(3, 0u8).unwrap();
        for _ in 0..order {
            w.put_n(coeff_bits as u32, 0u16).unwrap();
        }
        w.put(false).unwrap(); // state_present
        w.byte_align().unwrap();
        w.finish().unwrap()
    }

    #[test]
    fn fir_filter_round_trip() -> Result<()> {
        let data = filter_bits(4, 2, 12);
        let mut reader = BsIoSliceReader::from_slice(&data);
        let fp = FilterParams::read(&mut reader, FilterType::Fir)?;
        assert_eq!(fp.order, 4);
        assert_eq!(fp.shift, 2);
        assert_eq!(fp.coeff_bits, 12);
        Ok(())
    }

    #[test]
    fn iir_order_above_four_is_rejected() {
        let data = filter_bits(5, 0, 8);
        let mut reader = BsIoSliceReader::from_slice(&data);
        assert!(FilterParams::read(&mut reader, FilterType::Iir).is_err());
    }

    #[test]
    fn fir_state_is_rejected() {
        let mut w = BsIoVecWriter::default();
        w.put_n(4, 1u8).unwrap();
        w.put_n(4, 0u8).unwrap();
        w.put_n(5, 8u8).unwrap();
        w.put_n(3, 0u8).unwrap();
        w.put_n(8, 0u8).unwrap(); // one coefficient
        w.put(true).unwrap(); // state_present
        w.put_n(4, 0u8).unwrap();
        w.put_n(4, 0u8).unwrap();
        w.byte_align().unwrap();
        let data = w.finish().unwrap();

        let mut reader = BsIoSliceReader::from_slice(&data);
        assert!(FilterParams::read(&mut reader, FilterType::Fir).is_err());
    }
}
