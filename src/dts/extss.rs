//! DTS Extension Substream header parsing and BDAV checks.
//!
//! The header is decoded into [`ExtSSHeader`], retaining everything needed
//! for a byte-exact rewrite after PBR smoothing: variable-width size fields,
//! per-asset descriptors, backward compatible Core pointers and reserved
//! fields up to a 16-byte retention cap. The header body is protected by a
//! conventional CRC-16 starting after the user-defined bits.

use anyhow::{Result, bail};
use log::{info, warn};

use crate::dts::asset::AssetDescriptor;
use crate::utils::bitstream_io::BsIoSliceReader;
use crate::utils::crc::{CRC_DCA_EXT_SS_ALG, Crc16Norm};
use crate::utils::errors::DtsExtSSError;

pub(crate) static CRC_EXT_SS: Crc16Norm = Crc16Norm::new(&CRC_DCA_EXT_SS_ALG);

/// DCA Extension Substream sync word.
pub const SYNCWORD_SUBSTREAM: u32 = 0x64582025;

/// Extension substream index of a primary stream.
pub const EXT_SS_INDEX_PRIMARY: u8 = 0x0;

/// Extension substream index of a secondary stream.
pub const EXT_SS_INDEX_SECONDARY: u8 = 0x2;

pub const MAX_AUDIO_ASSETS: usize = 8;

/// Reserved fields are carried through a rewrite only up to this many bytes.
pub const MAX_RESERVED_FIELD_SIZE: usize = 16;

/// One-shot warning flags of the Extension Substream.
#[derive(Debug, Default)]
pub struct ExtSSWarningFlags {
    pub user_defined_bits: bool,
    pub mix_metadata: bool,
    pub non_complete_asset_type: bool,
    pub stereo_downmix: bool,
    pub reserved_field_dropped: bool,
}

/// Reserved bits retained verbatim for faithful rewrites.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReservedField {
    /// Whole bytes in the reserved field.
    pub length: u32,
    /// Trailing alignment bits (0..8).
    pub padding_bits: u8,
    /// Contents, `length + 1` bytes (data plus padding bits), only when the
    /// field fits the retention cap.
    pub data: Option<Vec<u8>>,
}

impl ReservedField {
    pub fn read(reader: &mut BsIoSliceReader, remaining_bits: u64) -> Result<Self> {
        let mut field = Self {
            length: (remaining_bits / 8) as u32,
            padding_bits: (remaining_bits & 0x7) as u8,
            data: None,
        };

        if remaining_bits as usize <= 8 * MAX_RESERVED_FIELD_SIZE {
            let mut data = vec![0u8; field.length as usize + 1];
            for byte in data.iter_mut().take(field.length as usize) {
                *byte = reader.get_n(8)?;
            }
            if field.padding_bits > 0 {
                data[field.length as usize] = reader.get_n(field.padding_bits as u32)?;
            }
            field.data = Some(data);
        } else {
            reader.skip_n(remaining_bits as u32)?;
        }

        Ok(field)
    }

    /// Bits contributed to a rewritten header.
    pub fn rewrite_bits(&self) -> u64 {
        match &self.data {
            Some(_) => self.length as u64 * 8 + self.padding_bits as u64,
            None => 0,
        }
    }
}

/// Mix metadata of the header static fields.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MixMetadata {
    pub adjustment_level: u8,
    /// Width of each output channel mask field, in bits.
    pub mask_field_width: u8,
    pub output_channel_masks: Vec<u16>,
}

impl MixMetadata {
    pub fn read(reader: &mut BsIoSliceReader) -> Result<Self> {
        let adjustment_level: u8 = reader.get_n(2)?;

        if adjustment_level == 0x3 {
            bail!(DtsExtSSError::ReservedMixAdjustmentLevel);
        }

        let mask_field_width = (reader.get_n::<u8>(2)? + 1) << 2;
        let nb_configs = reader.get_n::<u8>(2)? as usize + 1;

        let mut mm = Self {
            adjustment_level,
            mask_field_width,
            output_channel_masks: Vec::with_capacity(nb_configs),
        };

        for _ in 0..nb_configs {
            mm.output_channel_masks
                .push(reader.get_n(mask_field_width as u32)?);
        }

        Ok(mm)
    }

    pub fn nb_output_channels(&self, config: usize) -> u32 {
        self.output_channel_masks
            .get(config)
            .map(|mask| mask.count_ones())
            .unwrap_or(0)
    }
}

/// Static fields of the Extension Substream header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StaticFields {
    pub reference_clock_code: u8,
    pub frame_duration_code: u8,
    pub timestamp: Option<u64>,
    pub nb_audio_presentations: u8,
    pub nb_audio_assets: u8,
    /// Active Extension Substream mask per presentation.
    pub active_ext_ss_mask: Vec<u8>,
    /// Active asset mask per (presentation, substream) with an active bit.
    pub active_asset_mask: Vec<Vec<u8>>,
    pub mix_metadata: Option<MixMetadata>,
}

impl StaticFields {
    /// Reference clock frequency in Hz.
    pub fn reference_clock(&self) -> u32 {
        match self.reference_clock_code {
            0x0 => 32_000,
            0x1 => 44_100,
            0x2 => 48_000,
            _ => 0,
        }
    }

    /// Frame duration in reference clock samples.
    pub fn frame_duration(&self) -> u32 {
        (self.frame_duration_code as u32 + 1) * 512
    }

    pub fn read(reader: &mut BsIoSliceReader, ext_ss_index: u8) -> Result<Self> {
        let mut sf = Self {
            reference_clock_code: reader.get_n(2)?,
            frame_duration_code: reader.get_n(3)?,
            ..Default::default()
        };

        // bTimeStampFlag
        if reader.get()? {
            let value: u64 = reader.get_n::<u32>(32)? as u64;
            let lsb: u64 = reader.get_n::<u8>(4)? as u64;
            sf.timestamp = Some((value << 4) | lsb);
        }

        sf.nb_audio_presentations = reader.get_n::<u8>(3)? + 1;
        sf.nb_audio_assets = reader.get_n::<u8>(3)? + 1;

        let nb_substreams = ext_ss_index as u32 + 1;

        for _ in 0..sf.nb_audio_presentations {
            sf.active_ext_ss_mask
                .push(reader.get_n(nb_substreams)?);
        }

        for pres in 0..sf.nb_audio_presentations as usize {
            let mut masks = Vec::with_capacity(nb_substreams as usize);
            for ss in 0..nb_substreams {
                let mask = if (sf.active_ext_ss_mask[pres] >> ss) & 0x1 != 0 {
                    reader.get_n(8)?
                } else {
                    0
                };
                masks.push(mask);
            }
            sf.active_asset_mask.push(masks);
        }

        // bMixMetadataEnbl
        if reader.get()? {
            sf.mix_metadata = Some(MixMetadata::read(reader)?);
        }

        Ok(sf)
    }

    fn check_compliance(
        &self,
        secondary: bool,
        warnings: &mut ExtSSWarningFlags,
    ) -> Result<()> {
        if self.reference_clock() != 48_000 {
            bail!(DtsExtSSError::BadReferenceClock(self.reference_clock_code));
        }

        if self.nb_audio_presentations != 1 {
            bail!(DtsExtSSError::TooManyAudioPresentations(
                self.nb_audio_presentations
            ));
        }

        if self.nb_audio_assets != 1 {
            bail!(DtsExtSSError::TooManyAudioAssets(self.nb_audio_assets));
        }

        let expected_mask = if secondary { 0x5 } else { 0x1 };
        if self.active_ext_ss_mask[0] != expected_mask {
            bail!(DtsExtSSError::BadActiveExtSSMask {
                read: self.active_ext_ss_mask[0],
                expected: expected_mask,
            });
        }

        if self.mix_metadata.is_some() && !warnings.mix_metadata {
            info!("Presence of mixing metadata in the Extension Substream");
            warnings.mix_metadata = true;
        }

        Ok(())
    }
}

/// Complete Extension Substream header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtSSHeader {
    pub user_defined_bits: u8,
    pub ext_ss_index: u8,
    pub long_header_size: bool,
    /// Header size in bytes.
    pub header_size: u32,
    /// Whole Extension Substream frame size in bytes.
    pub frame_size: u32,
    pub static_fields: Option<StaticFields>,
    /// Encoded asset payload sizes in bytes.
    pub asset_sizes: Vec<u32>,
    pub assets: Vec<AssetDescriptor>,
    /// Backward compatible Core location per asset.
    pub bc_core: Vec<Option<(u8, u8)>>,
    pub reserved: ReservedField,
    pub crc: u16,
}

impl ExtSSHeader {
    pub fn nb_audio_assets(&self) -> usize {
        self.static_fields
            .as_ref()
            .map(|sf| sf.nb_audio_assets as usize)
            .unwrap_or(1)
    }

    pub fn read(reader: &mut BsIoSliceReader) -> Result<Self> {
        let start = reader.position()?;

        let sync: u32 = reader.get_n(32)?;
        if sync != SYNCWORD_SUBSTREAM {
            bail!(DtsExtSSError::BadSyncWord(sync));
        }

        let mut hdr = Self {
            user_defined_bits: reader.get_n(8)?,
            ..Default::default()
        };

        let crc_start = reader.position()?;

        hdr.ext_ss_index = reader.get_n(2)?;
        hdr.long_header_size = reader.get()?;

        let header_size_bits = if hdr.long_header_size { 12 } else { 8 };
        let frame_size_bits = if hdr.long_header_size { 20 } else { 16 };

        hdr.header_size = reader.get_n::<u32>(header_size_bits)? + 1;
        hdr.frame_size = reader.get_n::<u32>(frame_size_bits)? + 1;

        // bStaticFieldsPresent
        let (nb_assets, static_fields_present) = if reader.get()? {
            let sf = StaticFields::read(reader, hdr.ext_ss_index)?;
            let nb_assets = sf.nb_audio_assets as usize;
            hdr.static_fields = Some(sf);
            (nb_assets, true)
        } else {
            (1, false)
        };

        for _ in 0..nb_assets {
            hdr.asset_sizes
                .push(reader.get_n::<u32>(frame_size_bits)? + 1);
        }

        for _ in 0..nb_assets {
            hdr.assets.push(AssetDescriptor::read(
                reader,
                if static_fields_present {
                    hdr.static_fields.as_ref()
                } else {
                    None
                },
                frame_size_bits,
            )?);
        }

        let mut bc_core_present = [false; MAX_AUDIO_ASSETS];
        for present in bc_core_present.iter_mut().take(nb_assets) {
            *present = reader.get()?;
        }

        for present in bc_core_present.iter().take(nb_assets) {
            let pointer = if *present {
                Some((reader.get_n(2)?, reader.get_n(3)?))
            } else {
                None
            };
            hdr.bc_core.push(pointer);
        }

        // Reserved and byte alignment up to the CRC field.
        let end = start + (hdr.header_size as u64) * 8;
        let position = reader.position()?;
        if end < position + 16 {
            bail!(DtsExtSSError::HeaderOverrun);
        }
        let remaining = end - position - 16;

        hdr.reserved = ReservedField::read(reader, remaining)?;

        let crc_len = reader.position()? - crc_start;
        let crc = reader.crc16_norm_check(&CRC_EXT_SS, crc_start, crc_len)?;

        hdr.crc = reader.get_n(16)?;

        if hdr.crc != crc {
            bail!(DtsExtSSError::CrcMismatch {
                calculated: crc,
                read: hdr.crc,
            });
        }

        Ok(hdr)
    }

    pub fn check_compliance(
        &self,
        secondary: bool,
        warnings: &mut ExtSSWarningFlags,
    ) -> Result<()> {
        if self.user_defined_bits != 0 && !warnings.user_defined_bits {
            info!("Presence of a user-data byte in the Extension Substream");
            warnings.user_defined_bits = true;
        }

        let expected_index = if secondary {
            EXT_SS_INDEX_SECONDARY
        } else {
            EXT_SS_INDEX_PRIMARY
        };
        if (self.ext_ss_index != EXT_SS_INDEX_PRIMARY
            && self.ext_ss_index != EXT_SS_INDEX_SECONDARY)
            || self.ext_ss_index != expected_index
        {
            bail!(DtsExtSSError::BadExtSSIndex(self.ext_ss_index));
        }

        let Some(static_fields) = &self.static_fields else {
            bail!(DtsExtSSError::MissingStaticFields);
        };

        static_fields.check_compliance(secondary, warnings)?;

        for asset in &self.assets {
            asset.check_compliance(secondary, warnings)?;
        }

        if secondary {
            if self.bc_core[0].is_some() {
                bail!(DtsExtSSError::SecondaryBcCorePresent);
            }
        } else {
            match self.bc_core[0] {
                None => bail!(DtsExtSSError::MissingBcCore),
                Some((0, 0)) => {}
                Some((ext_ss_index, asset_index)) => {
                    bail!(DtsExtSSError::BadBcCoreLocation {
                        ext_ss_index,
                        asset_index,
                    })
                }
            }
        }

        if self.reserved.data.is_none()
            && self.reserved.length > 0
            && !warnings.reserved_field_dropped
        {
            warn!(
                "Extension Substream reserved field of {} bytes exceeds the retention cap",
                self.reserved.length
            );
            warnings.reserved_field_dropped = true;
        }

        Ok(())
    }
}
