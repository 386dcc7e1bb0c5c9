//! Channel meaning blocks of the major sync.
//!
//! The fixed 64-bit `channel_meaning()` block carries dialogue
//! normalization, mix levels and source formats for the 2/6/8-channel
//! presentations. An optional extension block may follow; its only
//! recognized form is the 16-channel meaning used by object audio (Dolby
//! Atmos), and only the dynamic-objects-only variant is supported.

use anyhow::{Result, bail};

use crate::utils::bitstream_io::BsIoSliceReader;
use crate::utils::errors::MlpSyncError;

/// 16-channel presentation meaning, the Atmos carrier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SixteenChMeaning {
    pub dialogue_norm: u8,
    pub mix_level: u8,
    pub channel_count: u8,
    pub dyn_object_only: bool,
    pub lfe_present: bool,
}

/// Content of the `extra_channel_meaning_data()` block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExtraChannelMeaning {
    #[default]
    Unknown,
    SixteenCh(SixteenChMeaning),
}

/// The fixed channel meaning block plus the optional extension.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelMeaning {
    pub two_ch_control_enabled: bool,
    pub six_ch_control_enabled: bool,
    pub eight_ch_control_enabled: bool,
    pub drc_start_up_gain: i8,
    pub two_ch_dialogue_norm: u8,
    pub two_ch_mix_level: u8,
    pub six_ch_dialogue_norm: u8,
    pub six_ch_mix_level: u8,
    pub six_ch_source_format: u8,
    pub eight_ch_dialogue_norm: u8,
    pub eight_ch_mix_level: u8,
    pub eight_ch_source_format: u8,
    pub extra_channel_meaning_present: bool,
    pub extra_channel_meaning_length: u8,
    pub extra: ExtraChannelMeaning,
}

impl ChannelMeaning {
    pub fn read(
        reader: &mut BsIoSliceReader,
        sixteen_ch_presentation_present: bool,
    ) -> Result<Self> {
        let mut cm = Self::default();

        reader.skip_n(6)?; // reserved
        cm.two_ch_control_enabled = reader.get()?;
        cm.six_ch_control_enabled = reader.get()?;
        cm.eight_ch_control_enabled = reader.get()?;
        reader.skip_n(1)?; // reserved
        cm.drc_start_up_gain = reader.get_s(7)?;
        cm.two_ch_dialogue_norm = reader.get_n(6)?;
        cm.two_ch_mix_level = reader.get_n(6)?;
        cm.six_ch_dialogue_norm = reader.get_n(5)?;
        cm.six_ch_mix_level = reader.get_n(6)?;
        cm.six_ch_source_format = reader.get_n(5)?;
        cm.eight_ch_dialogue_norm = reader.get_n(5)?;
        cm.eight_ch_mix_level = reader.get_n(6)?;
        cm.eight_ch_source_format = reader.get_n(6)?;
        reader.skip_n(1)?; // reserved
        cm.extra_channel_meaning_present = reader.get()?;

        if cm.extra_channel_meaning_present {
            cm.extra_channel_meaning_length = reader.get_n(4)?;

            let length = ((cm.extra_channel_meaning_length as u32 + 1) << 4) - 4;
            let start = reader.position()?;

            if sixteen_ch_presentation_present {
                let mut meaning = SixteenChMeaning {
                    dialogue_norm: reader.get_n(5)?,
                    mix_level: reader.get_n(6)?,
                    channel_count: reader.get_n(5)?,
                    dyn_object_only: reader.get()?,
                    ..Default::default()
                };

                if meaning.dyn_object_only {
                    meaning.lfe_present = reader.get()?;
                } else {
                    bail!(MlpSyncError::MultiContentMeaningNotImplemented);
                }

                cm.extra = ExtraChannelMeaning::SixteenCh(meaning);
            }

            let used = (reader.position()? - start) as u32;
            if used > length {
                bail!(MlpSyncError::ExtraChannelMeaningOverflow {
                    used,
                    available: length,
                });
            }

            // reserved
            reader.skip_n(length - used)?;

            // padding to the next 16-bit word
            reader.align_16bit()?;
        }

        Ok(cm)
    }

    pub fn atmos_present(&self) -> bool {
        matches!(self.extra, ExtraChannelMeaning::SixteenCh(_))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::utils::bitstream_io::BsIoVecWriter;

    pub(crate) fn write_channel_meaning(w: &mut BsIoVecWriter, with_16ch: bool) {
        w.put_n(6, 0u8).unwrap(); // reserved
        w.put(false).unwrap(); // 2ch_control_enabled
        w.put(false).unwrap(); // 6ch_control_enabled
        w.put(false).unwrap(); // 8ch_control_enabled
        w.put(false).unwrap(); // reserved
        w.put_n(7, 0u8).unwrap(); // drc_start_up_gain
        w.put_n(6, 24u8).unwrap(); // 2ch_dialogue_norm
        w.put_n(6, 0u8).unwrap(); // 2ch_mix_level
        w.put_n(5, 24u8).unwrap(); // 6ch_dialogue_norm
        w.put_n(6, 0u8).unwrap(); // 6ch_mix_level
        w.put_n(5, 0u8).unwrap(); // 6ch_source_format
        w.put_n(5, 24u8).unwrap(); // 8ch_dialogue_norm
        w.put_n(6, 0u8).unwrap(); // 8ch_mix_level
        w.put_n(6, 0u8).unwrap(); // 8ch_source_format
        w.put(false).unwrap(); // reserved
        w.put(with_16ch).unwrap(); // extra_channel_meaning_present

        if with_16ch {
            w.put_n(4, 1u8).unwrap(); // extra_channel_meaning_length
            w.put_n(5, 24u8).unwrap(); // 16ch_dialogue_norm
            w.put_n(6, 0u8).unwrap(); // 16ch_mix_level
            w.put_n(5, 15u8).unwrap(); // 16ch_channel_count
            w.put(true).unwrap(); // dyn_object_only
            w.put(true).unwrap(); // lfe_present
            // reserved: (1+1)*16-4 = 28 bits declared, 18 used
            w.put_n(10, 0u16).unwrap();
            // word alignment: 4 + 28 = 32 bits, already on a word boundary
        }
    }

    #[test]
    fn plain_meaning_parses() -> Result<()> {
        let mut w = BsIoVecWriter::default();
        write_channel_meaning(&mut w, false);
        let data = w.finish().unwrap();

        let mut reader = BsIoSliceReader::from_slice(&data);
        let cm = ChannelMeaning::read(&mut reader, false)?;
        assert_eq!(cm.two_ch_dialogue_norm, 24);
        assert!(!cm.extra_channel_meaning_present);
        assert!(!cm.atmos_present());
        assert_eq!(reader.position()?, 64);
        Ok(())
    }

    #[test]
    fn sixteen_ch_meaning_parses() -> Result<()> {
        let mut w = BsIoVecWriter::default();
        write_channel_meaning(&mut w, true);
        let data = w.finish().unwrap();

        let mut reader = BsIoSliceReader::from_slice(&data);
        let cm = ChannelMeaning::read(&mut reader, true)?;
        assert!(cm.extra_channel_meaning_present);
        assert!(cm.atmos_present());
        match cm.extra {
            ExtraChannelMeaning::SixteenCh(m) => {
                assert!(m.dyn_object_only);
                assert!(m.lfe_present);
                assert_eq!(m.channel_count, 15);
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    #[test]
    fn multi_content_form_is_not_implemented() {
        let mut w = BsIoVecWriter::default();
        write_channel_meaning(&mut w, false);
        let mut data = w.finish().unwrap();

        // Patch the last two bits: extra present with dyn_object_only clear.
        data[7] |= 0x01; // extra_channel_meaning_present
        data.extend_from_slice(&[0x10, 0x00, 0x00, 0x00]); // length + fields

        let mut reader = BsIoSliceReader::from_slice(&data);
        assert!(ChannelMeaning::read(&mut reader, true).is_err());
    }
}
