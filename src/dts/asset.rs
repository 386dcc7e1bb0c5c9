//! Extension Substream audio asset descriptors.
//!
//! Each asset descriptor is a self-sized block of three sections: static
//! metadata (type, language, PCM properties, speaker feeds and remapping),
//! dynamic metadata (DRC, dialogue normalization, mixing) and decoder
//! navigation data (coding mode and per-component sizes, including the XLL
//! sync descriptor driving PBR smoothing).

use anyhow::{Result, bail};
use log::{info, warn};

use crate::dts::extss::{ExtSSWarningFlags, ReservedField, StaticFields};
use crate::utils::bitstream_io::BsIoSliceReader;
use crate::utils::errors::DtsExtSSError;

pub const MAX_CHANNELS: u8 = 25;
pub const MAX_INFO_TEXT_LEN: u32 = 1024;

/// Coding component bits of `nuCoreExtensionMask`.
pub const COD_COMP_EXTSUB_CORE: u16 = 1 << 4;
pub const COD_COMP_EXTSUB_XBR: u16 = 1 << 5;
pub const COD_COMP_EXTSUB_XXCH: u16 = 1 << 6;
pub const COD_COMP_EXTSUB_X96: u16 = 1 << 7;
pub const COD_COMP_EXTSUB_LBR: u16 = 1 << 8;
pub const COD_COMP_EXTSUB_XLL: u16 = 1 << 9;
pub const COD_COMP_RESERVED_1: u16 = 1 << 10;
pub const COD_COMP_RESERVED_2: u16 = 1 << 11;

/// Asset data coding modes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(u8)]
pub enum CodingMode {
    #[default]
    HdComponents = 0x0,
    HdLosslessWithoutCore = 0x1,
    HdLowBitrate = 0x2,
    Auxiliary = 0x3,
}

impl From<u8> for CodingMode {
    fn from(value: u8) -> Self {
        match value & 0x3 {
            0x0 => CodingMode::HdComponents,
            0x1 => CodingMode::HdLosslessWithoutCore,
            0x2 => CodingMode::HdLowBitrate,
            _ => CodingMode::Auxiliary,
        }
    }
}

/// Source sample rate in Hz for `nuMaxSampleRate` codes.
pub fn sample_rate_value(code: u8) -> u32 {
    const RATES: [u32; 16] = [
        8_000, 16_000, 32_000, 64_000, 128_000, 22_050, 44_100, 88_200, 176_400, 352_800, 12_000,
        24_000, 48_000, 96_000, 192_000, 384_000,
    ];
    RATES[(code & 0xF) as usize]
}

/// A speaker remapping set of the asset static fields.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemapSet {
    pub std_layout_mask: u16,
    pub nb_ch_required: u8,
    pub dec_ch_masks: Vec<u32>,
    pub coeff_codes: Vec<Vec<u8>>,
}

/// Static metadata section of an asset descriptor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AssetStaticFields {
    pub asset_type: Option<u8>,
    pub language: Option<[u8; 3]>,
    pub info_text: Option<Vec<u8>>,
    pub bit_depth: u8,
    pub max_sample_rate_code: u8,
    pub nb_channels: u8,
    pub direct_speakers_feed: bool,
    pub embedded_stereo_downmix: bool,
    pub embedded_6ch_downmix: bool,
    /// Speaker activity mask and its field width code.
    pub speakers_mask: Option<(u8, u16)>,
    pub remap_sets: Vec<RemapSet>,
    pub representation_type: u8,
}

impl AssetStaticFields {
    pub fn max_sample_rate(&self) -> u32 {
        sample_rate_value(self.max_sample_rate_code)
    }

    fn read(reader: &mut BsIoSliceReader) -> Result<Self> {
        let mut sf = Self::default();

        // bAssetTypeDescrPresent
        if reader.get()? {
            sf.asset_type = Some(reader.get_n(4)?);
        }

        // bLanguageDescrPresent
        if reader.get()? {
            let mut language = [0u8; 3];
            for byte in &mut language {
                *byte = reader.get_n(8)?;
            }
            sf.language = Some(language);
        }

        // bInfoTextPresent
        if reader.get()? {
            let length = reader.get_n::<u32>(10)? + 1;
            if length > MAX_INFO_TEXT_LEN {
                bail!(DtsExtSSError::InfoTextTooLong(length));
            }

            let mut text = vec![0u8; length as usize];
            for byte in &mut text {
                *byte = reader.get_n(8)?;
            }
            sf.info_text = Some(text);
        }

        sf.bit_depth = reader.get_n::<u8>(5)? + 1;
        sf.max_sample_rate_code = reader.get_n(4)?;
        sf.nb_channels = reader.get_n::<u8>(8)? + 1;

        if sf.nb_channels > MAX_CHANNELS {
            bail!(DtsExtSSError::TooManyChannels {
                channels: sf.nb_channels,
                rate: sf.max_sample_rate(),
            });
        }

        sf.direct_speakers_feed = reader.get()?;

        if sf.direct_speakers_feed {
            if sf.nb_channels > 2 {
                sf.embedded_stereo_downmix = reader.get()?;
            }
            if sf.nb_channels > 6 {
                sf.embedded_6ch_downmix = reader.get()?;
            }

            let mut mask_width = 0u32;

            // bSpkrMaskEnabled
            if reader.get()? {
                let width_code: u8 = reader.get_n(2)?;
                mask_width = ((width_code as u32) + 1) << 2;
                let mask: u16 = reader.get_n(mask_width)?;
                sf.speakers_mask = Some((width_code, mask));
            }

            let nb_remap_sets = reader.get_n::<u8>(3)? as usize;

            if mask_width == 0 && nb_remap_sets > 0 {
                bail!(DtsExtSSError::RemapWithoutSpeakerMask);
            }

            let mut layout_masks = Vec::with_capacity(nb_remap_sets);
            for _ in 0..nb_remap_sets {
                layout_masks.push(reader.get_n::<u16>(mask_width)?);
            }

            for layout_mask in layout_masks {
                let nb_ch_required = reader.get_n::<u8>(5)? + 1;

                let nb_channels_in_set = layout_mask.count_ones() as usize;
                let mut set = RemapSet {
                    std_layout_mask: layout_mask,
                    nb_ch_required,
                    ..Default::default()
                };

                for _ in 0..nb_channels_in_set {
                    let dec_ch_mask: u32 = reader.get_n(nb_ch_required as u32)?;
                    let mut codes = Vec::with_capacity(dec_ch_mask.count_ones() as usize);
                    for _ in 0..dec_ch_mask.count_ones() {
                        codes.push(reader.get_n(5)?);
                    }
                    set.dec_ch_masks.push(dec_ch_mask);
                    set.coeff_codes.push(codes);
                }

                sf.remap_sets.push(set);
            }
        } else {
            sf.representation_type = reader.get_n(3)?;
        }

        Ok(sf)
    }
}

/// Dynamic metadata section (DRC, dialogue normalization, mixing).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AssetDynamicMetadata {
    pub drc_code: Option<u8>,
    pub dialnorm_code: Option<u8>,
    pub drc_2ch_code: Option<u8>,
    pub mix_metadata_present: bool,
}

impl AssetDynamicMetadata {
    fn read(
        reader: &mut BsIoSliceReader,
        asset_static_fields: &AssetStaticFields,
        static_fields: Option<&StaticFields>,
    ) -> Result<Self> {
        let mut dm = Self::default();

        // bDRCCoefPresent
        if reader.get()? {
            dm.drc_code = Some(reader.get_n(8)?);
        }

        // bDialNormPresent
        if reader.get()? {
            dm.dialnorm_code = Some(reader.get_n(5)?);
        }

        if dm.drc_code.is_some() && asset_static_fields.embedded_stereo_downmix {
            dm.drc_2ch_code = Some(reader.get_n(8)?);
        }

        let mix_metadata_enabled = static_fields
            .and_then(|sf| sf.mix_metadata.as_ref())
            .is_some();

        if mix_metadata_enabled {
            dm.mix_metadata_present = reader.get()?;
        }

        if dm.mix_metadata_present {
            let mix = static_fields
                .and_then(|sf| sf.mix_metadata.as_ref())
                .expect("mix metadata enabled");

            // bExternalMixFlag, nuPostMixGainAdjCode
            reader.skip_n(1 + 6)?;

            let mixer_drc_control: u8 = reader.get_n(2)?;
            if mixer_drc_control < 3 {
                reader.skip_n(3)?; // nuLimit4EmbeddedDRC
            } else {
                reader.skip_n(8)?; // nuCustomDRCCode
            }

            // bEnblPerChMainAudioScale
            let per_channel_scale = reader.get()?;
            for config in 0..mix.output_channel_masks.len() {
                if per_channel_scale {
                    for _ in 0..mix.nb_output_channels(config) {
                        reader.skip_n(6)?;
                    }
                } else {
                    reader.skip_n(6)?;
                }
            }

            // Embedded downmixes: the complete mix first.
            let mut nb_ch_per_downmix = vec![asset_static_fields.nb_channels as u32];
            if asset_static_fields.embedded_6ch_downmix {
                nb_ch_per_downmix.push(6);
            }
            if asset_static_fields.embedded_stereo_downmix {
                nb_ch_per_downmix.push(2);
            }

            for config in 0..mix.output_channel_masks.len() {
                for nb_ch in &nb_ch_per_downmix {
                    for _ in 0..*nb_ch {
                        let map_mask: u16 =
                            reader.get_n(mix.nb_output_channels(config))?;
                        for _ in 0..map_mask.count_ones() {
                            reader.skip_n(6)?;
                        }
                    }
                }
            }
        }

        Ok(dm)
    }
}

/// XLL coding component parameters of the decoder navigation data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct XllComponent {
    /// Component size in bytes.
    pub size: u32,
    pub sync_word_present: bool,
    /// PBR smoothing buffer size in KiB (already scaled by 16).
    pub peak_br_buf_size_kib: u32,
    pub initial_decoding_delay: u32,
    /// Offset of the XLL sync word inside the asset, in bytes.
    pub sync_offset: u32,
    pub stream_id: u8,
}

/// Sized component with an optional sync distance descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncedComponent {
    pub size: u32,
    pub sync_word_present: bool,
    pub sync_distance_code: u8,
}

/// Auxiliary coding parameters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AuxiliaryCoding {
    pub size: u32,
    pub codec_id: u8,
    pub sync_word_present: bool,
    pub sync_distance_code: u8,
}

/// Decoder navigation data section of an asset descriptor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AssetDecNavData {
    pub coding_mode: CodingMode,
    pub coding_components_mask: u16,

    pub core: Option<SyncedComponent>,
    pub xbr_size: Option<u32>,
    pub xxch_size: Option<u32>,
    pub x96_size: Option<u32>,
    pub lbr: Option<SyncedComponent>,
    pub xll: Option<XllComponent>,
    pub reserved_1: Option<u16>,
    pub reserved_2: Option<u16>,
    pub auxiliary: Option<AuxiliaryCoding>,

    /// `bOnetoOneMixingFlag` and the associated scale codes, present when
    /// the stream mixes direct speaker feeds without asset mix metadata.
    pub one_to_one_mixing: Option<bool>,
    pub per_channel_scale: bool,
    pub scale_codes: Vec<Vec<u8>>,

    pub decode_in_secondary: bool,
    pub extra_data_present: bool,
    pub drc_rev2_version: Option<u8>,
}

impl AssetDecNavData {
    fn read_xll(
        reader: &mut BsIoSliceReader,
        frame_size_bits: u32,
    ) -> Result<XllComponent> {
        let mut xll = XllComponent {
            size: reader.get_n::<u32>(frame_size_bits)? + 1,
            sync_word_present: reader.get()?,
            ..Default::default()
        };

        if xll.sync_word_present {
            xll.peak_br_buf_size_kib = reader.get_n::<u32>(4)? << 4;

            let delay_bits = reader.get_n::<u32>(5)? + 1;
            xll.initial_decoding_delay = reader.get_n(delay_bits)?;

            xll.sync_offset = reader.get_n(frame_size_bits)?;
        }

        Ok(xll)
    }

    fn read_synced(reader: &mut BsIoSliceReader, size_bits: u32) -> Result<SyncedComponent> {
        let mut component = SyncedComponent {
            size: reader.get_n::<u32>(size_bits)? + 1,
            sync_word_present: reader.get()?,
            ..Default::default()
        };

        if component.sync_word_present {
            component.sync_distance_code = reader.get_n(2)?;
        }

        Ok(component)
    }

    fn read(
        reader: &mut BsIoSliceReader,
        asset_static_fields: &AssetStaticFields,
        dynamic: &AssetDynamicMetadata,
        static_fields: Option<&StaticFields>,
        frame_size_bits: u32,
        descriptor_end_bits: u64,
    ) -> Result<Self> {
        let mut nav = Self {
            coding_mode: CodingMode::from(reader.get_n::<u8>(2)?),
            ..Default::default()
        };

        match nav.coding_mode {
            CodingMode::HdComponents => {
                nav.coding_components_mask = reader.get_n(12)?;

                if nav.coding_components_mask & COD_COMP_EXTSUB_CORE != 0 {
                    nav.core = Some(Self::read_synced(reader, 14)?);
                }
                if nav.coding_components_mask & COD_COMP_EXTSUB_XBR != 0 {
                    nav.xbr_size = Some(reader.get_n::<u32>(14)? + 1);
                }
                if nav.coding_components_mask & COD_COMP_EXTSUB_XXCH != 0 {
                    nav.xxch_size = Some(reader.get_n::<u32>(14)? + 1);
                }
                if nav.coding_components_mask & COD_COMP_EXTSUB_X96 != 0 {
                    nav.x96_size = Some(reader.get_n::<u32>(12)? + 1);
                }
                if nav.coding_components_mask & COD_COMP_EXTSUB_LBR != 0 {
                    nav.lbr = Some(Self::read_synced(reader, 14)?);
                }
                if nav.coding_components_mask & COD_COMP_EXTSUB_XLL != 0 {
                    nav.xll = Some(Self::read_xll(reader, frame_size_bits)?);
                }
                if nav.coding_components_mask & COD_COMP_RESERVED_1 != 0 {
                    nav.reserved_1 = Some(reader.get_n(16)?);
                }
                if nav.coding_components_mask & COD_COMP_RESERVED_2 != 0 {
                    nav.reserved_2 = Some(reader.get_n(16)?);
                }
            }
            CodingMode::HdLosslessWithoutCore => {
                nav.coding_components_mask = COD_COMP_EXTSUB_XLL;
                nav.xll = Some(Self::read_xll(reader, frame_size_bits)?);
            }
            CodingMode::HdLowBitrate => {
                nav.coding_components_mask = COD_COMP_EXTSUB_LBR;
                nav.lbr = Some(Self::read_synced(reader, 14)?);
            }
            CodingMode::Auxiliary => {
                let mut aux = AuxiliaryCoding {
                    size: reader.get_n::<u32>(14)? + 1,
                    codec_id: reader.get_n(8)?,
                    sync_word_present: reader.get()?,
                    ..Default::default()
                };
                if aux.sync_word_present {
                    aux.sync_distance_code = reader.get_n(2)?;
                }
                nav.auxiliary = Some(aux);
            }
        }

        if nav.coding_components_mask & COD_COMP_EXTSUB_XLL != 0 {
            if let Some(xll) = &mut nav.xll {
                xll.stream_id = reader.get_n(3)?;
            }
        }

        let mix_metadata_enabled = static_fields
            .and_then(|sf| sf.mix_metadata.as_ref())
            .is_some();

        if asset_static_fields.direct_speakers_feed
            && mix_metadata_enabled
            && !dynamic.mix_metadata_present
        {
            nav.one_to_one_mixing = Some(reader.get()?);
        }

        if nav.one_to_one_mixing == Some(true) {
            let mix = static_fields
                .and_then(|sf| sf.mix_metadata.as_ref())
                .expect("mix metadata enabled");

            nav.per_channel_scale = reader.get()?;

            for config in 0..mix.output_channel_masks.len() {
                let nb_codes = if nav.per_channel_scale {
                    mix.nb_output_channels(config)
                } else {
                    1
                };

                let mut codes = Vec::with_capacity(nb_codes as usize);
                for _ in 0..nb_codes {
                    codes.push(reader.get_n(6)?);
                }
                nav.scale_codes.push(codes);
            }
        }

        nav.decode_in_secondary = reader.get()?;

        nav.extra_data_present = reader.position()? < descriptor_end_bits;

        if nav.extra_data_present {
            // bDRCMetadataRev2Present
            if reader.get()? {
                let version: u8 = reader.get_n(4)?;
                nav.drc_rev2_version = Some(version);

                if version == 1 {
                    let frame_duration = static_fields
                        .map(|sf| sf.frame_duration())
                        .unwrap_or(512);
                    // One DRC coefficient byte per 256-sample sub-frame.
                    reader.skip_n((frame_duration / 256) * 8)?;
                }
            }
        }

        Ok(nav)
    }
}

/// One complete audio asset descriptor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AssetDescriptor {
    /// Descriptor length in bytes.
    pub descriptor_length: u32,
    pub asset_index: u8,
    pub static_fields: Option<AssetStaticFields>,
    pub dynamic: AssetDynamicMetadata,
    pub dec_nav: AssetDecNavData,
    pub reserved: ReservedField,
}

impl AssetDescriptor {
    pub fn read(
        reader: &mut BsIoSliceReader,
        static_fields: Option<&StaticFields>,
        frame_size_bits: u32,
    ) -> Result<Self> {
        let start = reader.position()?;

        let mut asset = Self {
            descriptor_length: reader.get_n::<u32>(9)? + 1,
            asset_index: reader.get_n(3)?,
            ..Default::default()
        };

        let end = start + (asset.descriptor_length as u64) * 8;

        if static_fields.is_some() {
            asset.static_fields = Some(AssetStaticFields::read(reader)?);
        }

        let asset_static = asset.static_fields.clone().unwrap_or_default();

        asset.dynamic = AssetDynamicMetadata::read(reader, &asset_static, static_fields)?;

        asset.dec_nav = AssetDecNavData::read(
            reader,
            &asset_static,
            &asset.dynamic,
            static_fields,
            frame_size_bits,
            end,
        )?;

        let position = reader.position()?;
        if position > end {
            bail!(DtsExtSSError::AssetDescriptorOverrun);
        }

        asset.reserved = ReservedField::read(reader, end - position)?;

        Ok(asset)
    }

    pub fn check_compliance(
        &self,
        secondary: bool,
        warnings: &mut ExtSSWarningFlags,
    ) -> Result<()> {
        if let Some(sf) = &self.static_fields {
            if let Some(asset_type) = sf.asset_type {
                if asset_type != 0xE && !warnings.non_complete_asset_type {
                    info!("Asset type {} is not a complete presentation", asset_type);
                    warnings.non_complete_asset_type = true;
                }
            }

            if sf.bit_depth != 16 && sf.bit_depth != 24 {
                bail!(DtsExtSSError::BadBitDepth(sf.bit_depth));
            }

            let rate = sf.max_sample_rate();
            if secondary && rate != 48_000 {
                bail!(DtsExtSSError::SecondaryNot48kHz(rate));
            }
            if !matches!(rate, 48_000 | 96_000 | 192_000) {
                bail!(DtsExtSSError::BadSampleRate(rate));
            }

            let channel_limit = if secondary || rate == 192_000 { 6 } else { 8 };
            if sf.nb_channels > channel_limit {
                bail!(DtsExtSSError::TooManyChannels {
                    channels: sf.nb_channels,
                    rate,
                });
            }
            if sf.nb_channels > 6 && rate > 96_000 {
                bail!(DtsExtSSError::TooManyChannels {
                    channels: sf.nb_channels,
                    rate,
                });
            }

            if let Some((_, mask)) = sf.speakers_mask {
                let mask_channels = speaker_mask_nb_channels(mask);
                if mask_channels != sf.nb_channels {
                    bail!(DtsExtSSError::SpeakerMaskChannelMismatch {
                        mask_channels,
                        channels: sf.nb_channels,
                    });
                }
            }

            if sf.embedded_stereo_downmix && !warnings.stereo_downmix {
                info!("Asset embeds a stereo downmix");
                warnings.stereo_downmix = true;
            }

            if !sf.direct_speakers_feed && secondary {
                warn!("Secondary asset without direct speaker feeds");
            }
        }

        match (secondary, self.dec_nav.coding_mode) {
            (true, CodingMode::HdLowBitrate) => {}
            (true, _) => bail!(DtsExtSSError::SecondaryCodingMode),
            (false, CodingMode::HdComponents) => {
                if self.dec_nav.coding_components_mask & COD_COMP_EXTSUB_CORE != 0 {
                    bail!(DtsExtSSError::CoreInExtSSForbidden);
                }
            }
            (false, _) => bail!(DtsExtSSError::PrimaryCodingMode),
        }

        Ok(())
    }
}

/// Channel count named by a speaker activity mask: each mask bit names a
/// speaker pair or a single speaker.
pub fn speaker_mask_nb_channels(mask: u16) -> u8 {
    const GROUP_SIZES: [u8; 16] = [1, 2, 2, 1, 1, 2, 2, 1, 1, 2, 2, 2, 1, 2, 1, 2];

    GROUP_SIZES
        .iter()
        .enumerate()
        .map(|(i, n)| n * (((mask >> i) & 1) as u8))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speaker_mask_counts_pairs() {
        // C + L/R + Ls/Rs + LFE = 6 channels.
        assert_eq!(speaker_mask_nb_channels(0x000F), 6);
        // C alone.
        assert_eq!(speaker_mask_nb_channels(0x0001), 1);
    }

    #[test]
    fn coding_mode_from_code() {
        assert_eq!(CodingMode::from(0), CodingMode::HdComponents);
        assert_eq!(CodingMode::from(2), CodingMode::HdLowBitrate);
        assert_eq!(CodingMode::from(3), CodingMode::Auxiliary);
    }
}
