//! Byte-exact Extension Substream header synthesis.
//!
//! Used on the second pass after PBR smoothing changed the XLL asset sizes
//! and sync descriptors. The header size is computed first by walking the
//! same structure as the parser and summing field widths, then every field
//! is mirror-written with the same alignment rules. The CRC-16 is computed
//! over the produced bytes and appended last.
//!
//! Only the configurations BDAV permits for a rewrite are supported: mix
//! metadata and non-component coding modes fail instead of being silently
//! dropped.

use anyhow::{Result, bail};

use crate::dts::asset::{
    AssetDecNavData, AssetDescriptor, AssetDynamicMetadata, AssetStaticFields, CodingMode,
    COD_COMP_EXTSUB_CORE, COD_COMP_EXTSUB_LBR, COD_COMP_EXTSUB_X96, COD_COMP_EXTSUB_XBR,
    COD_COMP_EXTSUB_XLL, COD_COMP_EXTSUB_XXCH, COD_COMP_RESERVED_1, COD_COMP_RESERVED_2,
};
use crate::dts::extss::{CRC_EXT_SS, ExtSSHeader, ReservedField, StaticFields, SYNCWORD_SUBSTREAM};
use crate::utils::bitstream_io::BsIoVecWriter;
use crate::utils::errors::DtsPatcherError;

/// Bits required to represent a decoding delay value (the
/// `nuBitsInitDecDly` width).
fn init_dec_delay_bits(delay: u32) -> u32 {
    (32 - delay.leading_zeros()).max(1)
}

fn put_checked(
    w: &mut BsIoVecWriter,
    bits: u32,
    value: u64,
    field: &'static str,
) -> Result<()> {
    if bits < 64 && value >> bits != 0 {
        bail!(DtsPatcherError::FieldOverflow {
            field,
            value,
            width: bits,
        });
    }
    w.put_n(bits, value)?;
    Ok(())
}

fn static_fields_bits(sf: &StaticFields, ext_ss_index: u8) -> Result<u64> {
    if sf.mix_metadata.is_some() {
        bail!(DtsPatcherError::MixMetadataNotImplemented);
    }

    // Reference clock, frame duration, timestamp flag, presentation and
    // asset counts, mix metadata flag.
    let mut bits: u64 = 13;

    if sf.timestamp.is_some() {
        bits += 36;
    }

    bits += (ext_ss_index as u64 + 1) * sf.nb_audio_presentations as u64;

    for pres in 0..sf.nb_audio_presentations as usize {
        for ss in 0..=ext_ss_index as usize {
            if (sf.active_ext_ss_mask[pres] >> ss) & 0x1 != 0 {
                bits += 8;
            }
        }
    }

    Ok(bits)
}

fn build_static_fields(
    w: &mut BsIoVecWriter,
    sf: &StaticFields,
    ext_ss_index: u8,
) -> Result<()> {
    if sf.mix_metadata.is_some() {
        bail!(DtsPatcherError::MixMetadataNotImplemented);
    }

    w.put_n(2, sf.reference_clock_code)?;
    w.put_n(3, sf.frame_duration_code)?;

    w.put(sf.timestamp.is_some())?;
    if let Some(timestamp) = sf.timestamp {
        put_checked(w, 32, timestamp >> 4, "nuTimeStamp")?;
        w.put_n(4, (timestamp & 0xF) as u8)?;
    }

    put_checked(w, 3, sf.nb_audio_presentations as u64 - 1, "nuNumAudioPresnt")?;
    put_checked(w, 3, sf.nb_audio_assets as u64 - 1, "nuNumAssets")?;

    for pres in 0..sf.nb_audio_presentations as usize {
        w.put_n(ext_ss_index as u32 + 1, sf.active_ext_ss_mask[pres])?;
    }

    for pres in 0..sf.nb_audio_presentations as usize {
        for ss in 0..=ext_ss_index as usize {
            if (sf.active_ext_ss_mask[pres] >> ss) & 0x1 != 0 {
                w.put_n(8, sf.active_asset_mask[pres][ss])?;
            }
        }
    }

    w.put(false)?; // bMixMetadataEnbl

    Ok(())
}

fn asset_static_fields_bits(sf: &AssetStaticFields) -> u64 {
    // Presence flags, PCM properties, channel count, speaker feed flag.
    let mut bits: u64 = 21;

    if sf.asset_type.is_some() {
        bits += 4;
    }
    if sf.language.is_some() {
        bits += 24;
    }
    if let Some(text) = &sf.info_text {
        bits += 10 + 8 * text.len() as u64;
    }

    if sf.direct_speakers_feed {
        if sf.nb_channels > 2 {
            bits += 1;
        }
        if sf.nb_channels > 6 {
            bits += 1;
        }

        // Speaker mask enable and remap set count.
        bits += 4;

        let mut mask_width = 0u64;
        if let Some((width_code, _)) = sf.speakers_mask {
            mask_width = ((width_code as u64) + 1) << 2;
            bits += 2 + mask_width;
        }

        bits += mask_width * sf.remap_sets.len() as u64;

        for set in &sf.remap_sets {
            bits += 5;
            for (mask, codes) in set.dec_ch_masks.iter().zip(&set.coeff_codes) {
                bits += set.nb_ch_required as u64;
                debug_assert_eq!(mask.count_ones() as usize, codes.len());
                bits += 5 * codes.len() as u64;
            }
        }
    } else {
        bits += 3;
    }

    bits
}

fn build_asset_static_fields(w: &mut BsIoVecWriter, sf: &AssetStaticFields) -> Result<()> {
    w.put(sf.asset_type.is_some())?;
    if let Some(asset_type) = sf.asset_type {
        w.put_n(4, asset_type)?;
    }

    w.put(sf.language.is_some())?;
    if let Some(language) = &sf.language {
        for byte in language {
            w.put_n(8, *byte)?;
        }
    }

    w.put(sf.info_text.is_some())?;
    if let Some(text) = &sf.info_text {
        put_checked(w, 10, text.len() as u64 - 1, "nuInfoTextByteSize")?;
        for byte in text {
            w.put_n(8, *byte)?;
        }
    }

    put_checked(w, 5, sf.bit_depth as u64 - 1, "nuBitResolution")?;
    w.put_n(4, sf.max_sample_rate_code)?;
    put_checked(w, 8, sf.nb_channels as u64 - 1, "nuTotalNumChs")?;
    w.put(sf.direct_speakers_feed)?;

    if sf.direct_speakers_feed {
        if sf.nb_channels > 2 {
            w.put(sf.embedded_stereo_downmix)?;
        }
        if sf.nb_channels > 6 {
            w.put(sf.embedded_6ch_downmix)?;
        }

        w.put(sf.speakers_mask.is_some())?;

        let mut mask_width = 0u32;
        if let Some((width_code, mask)) = sf.speakers_mask {
            mask_width = ((width_code as u32) + 1) << 2;
            w.put_n(2, width_code)?;
            w.put_n(mask_width, mask)?;
        }

        put_checked(w, 3, sf.remap_sets.len() as u64, "nuNumSpkrRemapSets")?;

        for set in &sf.remap_sets {
            w.put_n(mask_width, set.std_layout_mask)?;
        }

        for set in &sf.remap_sets {
            put_checked(w, 5, set.nb_ch_required as u64 - 1, "nuNumDecCh4Remap")?;

            for (mask, codes) in set.dec_ch_masks.iter().zip(&set.coeff_codes) {
                w.put_n(set.nb_ch_required as u32, *mask)?;
                for code in codes {
                    w.put_n(5, *code)?;
                }
            }
        }
    } else {
        w.put_n(3, sf.representation_type)?;
    }

    Ok(())
}

fn dynamic_metadata_bits(
    dm: &AssetDynamicMetadata,
    sf: &AssetStaticFields,
    mix_metadata_enabled: bool,
) -> Result<u64> {
    if dm.mix_metadata_present {
        bail!(DtsPatcherError::MixMetadataNotImplemented);
    }

    let mut bits: u64 = 2;

    if dm.drc_code.is_some() {
        bits += 8;
    }
    if dm.dialnorm_code.is_some() {
        bits += 5;
    }
    if dm.drc_code.is_some() && sf.embedded_stereo_downmix {
        bits += 8;
    }
    if mix_metadata_enabled {
        bits += 1;
    }

    Ok(bits)
}

fn build_dynamic_metadata(
    w: &mut BsIoVecWriter,
    dm: &AssetDynamicMetadata,
    sf: &AssetStaticFields,
    mix_metadata_enabled: bool,
) -> Result<()> {
    if dm.mix_metadata_present {
        bail!(DtsPatcherError::MixMetadataNotImplemented);
    }

    w.put(dm.drc_code.is_some())?;
    if let Some(code) = dm.drc_code {
        w.put_n(8, code)?;
    }

    w.put(dm.dialnorm_code.is_some())?;
    if let Some(code) = dm.dialnorm_code {
        w.put_n(5, code)?;
    }

    if dm.drc_code.is_some() && sf.embedded_stereo_downmix {
        w.put_n(8, dm.drc_2ch_code.unwrap_or(0))?;
    }

    if mix_metadata_enabled {
        w.put(false)?; // bMixMetadataPresent
    }

    Ok(())
}

fn dec_nav_data_bits(nav: &AssetDecNavData, frame_size_bits: u32) -> Result<u64> {
    if nav.coding_mode != CodingMode::HdComponents {
        bail!(DtsPatcherError::CodingModeNotImplemented(
            nav.coding_mode as u8
        ));
    }

    // Coding mode and bDecodeAssetInSecondaryDecoder.
    let mut bits: u64 = 3;

    bits += 12;

    if nav.coding_components_mask & COD_COMP_EXTSUB_CORE != 0 {
        let core = nav.core.as_ref().expect("core component");
        bits += 15;
        if core.sync_word_present {
            bits += 2;
        }
    }
    if nav.coding_components_mask & COD_COMP_EXTSUB_XBR != 0 {
        bits += 14;
    }
    if nav.coding_components_mask & COD_COMP_EXTSUB_XXCH != 0 {
        bits += 14;
    }
    if nav.coding_components_mask & COD_COMP_EXTSUB_X96 != 0 {
        bits += 12;
    }
    if nav.coding_components_mask & COD_COMP_EXTSUB_LBR != 0 {
        let lbr = nav.lbr.as_ref().expect("LBR component");
        bits += 15;
        if lbr.sync_word_present {
            bits += 2;
        }
    }
    if nav.coding_components_mask & COD_COMP_EXTSUB_XLL != 0 {
        let xll = nav.xll.as_ref().expect("XLL component");
        bits += frame_size_bits as u64 + 1;
        if xll.sync_word_present {
            bits += 9
                + init_dec_delay_bits(xll.initial_decoding_delay) as u64
                + frame_size_bits as u64;
        }
        // nuDTSHDStreamID
        bits += 3;
    }
    if nav.coding_components_mask & COD_COMP_RESERVED_1 != 0 {
        bits += 16;
    }
    if nav.coding_components_mask & COD_COMP_RESERVED_2 != 0 {
        bits += 16;
    }

    if let Some(one_to_one) = nav.one_to_one_mixing {
        bits += 1;
        if one_to_one {
            bits += 1;
            for codes in &nav.scale_codes {
                bits += 6 * codes.len() as u64;
            }
        }
    }

    if nav.extra_data_present {
        bits += 1;
        if let Some(version) = nav.drc_rev2_version {
            if version == 1 {
                bail!(DtsPatcherError::DrcRev2NotImplemented);
            }
            bits += 4;
        }
    }

    Ok(bits)
}

fn build_dec_nav_data(
    w: &mut BsIoVecWriter,
    nav: &AssetDecNavData,
    frame_size_bits: u32,
) -> Result<()> {
    w.put_n(2, nav.coding_mode as u8)?;
    w.put_n(12, nav.coding_components_mask)?;

    if nav.coding_components_mask & COD_COMP_EXTSUB_CORE != 0 {
        let core = nav.core.as_ref().expect("core component");
        put_checked(w, 14, core.size as u64 - 1, "nuExSSCoreFsize")?;
        w.put(core.sync_word_present)?;
        if core.sync_word_present {
            w.put_n(2, core.sync_distance_code)?;
        }
    }

    if nav.coding_components_mask & COD_COMP_EXTSUB_XBR != 0 {
        put_checked(
            w,
            14,
            nav.xbr_size.expect("XBR size") as u64 - 1,
            "nuExSSXBRFsize",
        )?;
    }

    if nav.coding_components_mask & COD_COMP_EXTSUB_XXCH != 0 {
        put_checked(
            w,
            14,
            nav.xxch_size.expect("XXCH size") as u64 - 1,
            "nuExSSXXCHFsize",
        )?;
    }

    if nav.coding_components_mask & COD_COMP_EXTSUB_X96 != 0 {
        put_checked(
            w,
            12,
            nav.x96_size.expect("X96 size") as u64 - 1,
            "nuExSSX96Fsize",
        )?;
    }

    if nav.coding_components_mask & COD_COMP_EXTSUB_LBR != 0 {
        let lbr = nav.lbr.as_ref().expect("LBR component");
        put_checked(w, 14, lbr.size as u64 - 1, "nuExSSLBRFsize")?;
        w.put(lbr.sync_word_present)?;
        if lbr.sync_word_present {
            w.put_n(2, lbr.sync_distance_code)?;
        }
    }

    if nav.coding_components_mask & COD_COMP_EXTSUB_XLL != 0 {
        let xll = nav.xll.as_ref().expect("XLL component");
        put_checked(
            w,
            frame_size_bits,
            xll.size as u64 - 1,
            "nuExSSXLLFsize",
        )?;
        w.put(xll.sync_word_present)?;

        if xll.sync_word_present {
            put_checked(
                w,
                4,
                (xll.peak_br_buf_size_kib >> 4) as u64,
                "nuPeakBRCntrlBuffSzkB",
            )?;

            let delay_bits = init_dec_delay_bits(xll.initial_decoding_delay);
            w.put_n(5, delay_bits - 1)?;
            w.put_n(delay_bits, xll.initial_decoding_delay)?;

            put_checked(
                w,
                frame_size_bits,
                xll.sync_offset as u64,
                "nuExSSXLLSyncOffset",
            )?;
        }
    }

    if nav.coding_components_mask & COD_COMP_RESERVED_1 != 0 {
        w.put_n(16, nav.reserved_1.unwrap_or(0))?;
    }
    if nav.coding_components_mask & COD_COMP_RESERVED_2 != 0 {
        w.put_n(16, nav.reserved_2.unwrap_or(0))?;
    }

    if nav.coding_components_mask & COD_COMP_EXTSUB_XLL != 0 {
        let xll = nav.xll.as_ref().expect("XLL component");
        w.put_n(3, xll.stream_id)?;
    }

    if let Some(one_to_one) = nav.one_to_one_mixing {
        w.put(one_to_one)?;

        if one_to_one {
            w.put(nav.per_channel_scale)?;
            for codes in &nav.scale_codes {
                for code in codes {
                    w.put_n(6, *code)?;
                }
            }
        }
    }

    w.put(nav.decode_in_secondary)?;

    if nav.extra_data_present {
        w.put(nav.drc_rev2_version.is_some())?;
        if let Some(version) = nav.drc_rev2_version {
            if version == 1 {
                bail!(DtsPatcherError::DrcRev2NotImplemented);
            }
            w.put_n(4, version)?;
        }
    }

    Ok(())
}

fn build_reserved(w: &mut BsIoVecWriter, reserved: &ReservedField) -> Result<()> {
    if let Some(data) = &reserved.data {
        for byte in data.iter().take(reserved.length as usize) {
            w.put_n(8, *byte)?;
        }
        if reserved.padding_bits > 0 {
            w.put_n(
                reserved.padding_bits as u32,
                data[reserved.length as usize],
            )?;
        }
    }
    Ok(())
}

/// Asset descriptor size in bytes, alignment padding included.
fn asset_descriptor_size(
    asset: &AssetDescriptor,
    mix_metadata_enabled: bool,
    frame_size_bits: u32,
) -> Result<u64> {
    // nuAssetDescriptFsize and nuAssetIndex.
    let mut bits: u64 = 12;

    if let Some(sf) = &asset.static_fields {
        bits += asset_static_fields_bits(sf);
    }

    let asset_static = asset.static_fields.clone().unwrap_or_default();

    bits += dynamic_metadata_bits(&asset.dynamic, &asset_static, mix_metadata_enabled)?;
    bits += dec_nav_data_bits(&asset.dec_nav, frame_size_bits)?;
    bits += asset.reserved.rewrite_bits();

    Ok(bits.div_ceil(8))
}

fn build_asset_descriptor(
    w: &mut BsIoVecWriter,
    asset: &AssetDescriptor,
    static_fields: Option<&StaticFields>,
    frame_size_bits: u32,
    descriptor_size: u64,
) -> Result<()> {
    let start = w.position();

    put_checked(w, 9, descriptor_size - 1, "nuAssetDescriptFsize")?;
    w.put_n(3, asset.asset_index)?;

    if let Some(sf) = &asset.static_fields {
        build_asset_static_fields(w, sf)?;
    }

    let asset_static = asset.static_fields.clone().unwrap_or_default();
    let mix_metadata_enabled = static_fields
        .map(|sf| sf.mix_metadata.is_some())
        .unwrap_or(false);

    build_dynamic_metadata(w, &asset.dynamic, &asset_static, mix_metadata_enabled)?;
    build_dec_nav_data(w, &asset.dec_nav, frame_size_bits)?;
    build_reserved(w, &asset.reserved)?;

    // Pad to the declared descriptor boundary.
    let end = start + descriptor_size * 8;
    while w.position() < end {
        w.put(false)?;
    }

    if w.position() != end {
        bail!(DtsPatcherError::SizeMismatch {
            computed: descriptor_size,
            written: (w.position() - start).div_ceil(8),
        });
    }

    Ok(())
}

/// Extension Substream header size in bytes for the given parameters.
pub fn compute_header_size(header: &ExtSSHeader) -> Result<u64> {
    let header_size_bits: u64 = if header.long_header_size { 12 } else { 8 };
    let frame_size_bits: u32 = if header.long_header_size { 20 } else { 16 };

    // Sync word, user bits, index, size type flag, static fields flag and
    // the final CRC.
    let mut bits: u64 = 60 + header_size_bits + frame_size_bits as u64;

    if let Some(sf) = &header.static_fields {
        bits += static_fields_bits(sf, header.ext_ss_index)?;
    }

    let mix_metadata_enabled = header
        .static_fields
        .as_ref()
        .map(|sf| sf.mix_metadata.is_some())
        .unwrap_or(false);

    for asset in &header.assets {
        let descriptor_size = asset_descriptor_size(asset, mix_metadata_enabled, frame_size_bits)?;
        bits += frame_size_bits as u64 + descriptor_size * 8 + 1;
    }

    for bc_core in &header.bc_core {
        if bc_core.is_some() {
            bits += 5;
        }
    }

    bits += header.reserved.rewrite_bits();

    Ok(bits.div_ceil(8))
}

/// Builds the byte-exact Extension Substream header.
pub fn build_ext_ss_header(header: &ExtSSHeader) -> Result<Vec<u8>> {
    let header_size_bits: u32 = if header.long_header_size { 12 } else { 8 };
    let frame_size_bits: u32 = if header.long_header_size { 20 } else { 16 };

    let mix_metadata_enabled = header
        .static_fields
        .as_ref()
        .map(|sf| sf.mix_metadata.is_some())
        .unwrap_or(false);

    let mut descriptor_sizes = Vec::with_capacity(header.assets.len());
    for asset in &header.assets {
        descriptor_sizes.push(asset_descriptor_size(
            asset,
            mix_metadata_enabled,
            frame_size_bits,
        )?);
    }

    let header_size = compute_header_size(header)?;
    let frame_size: u64 =
        header_size + header.asset_sizes.iter().map(|s| *s as u64).sum::<u64>();

    let mut w = BsIoVecWriter::default();

    w.put_n(32, SYNCWORD_SUBSTREAM)?;
    w.put_n(8, header.user_defined_bits)?;
    w.put_n(2, header.ext_ss_index)?;
    w.put(header.long_header_size)?;

    put_checked(&mut w, header_size_bits, header_size - 1, "nuExtSSHeaderSize")?;
    put_checked(&mut w, frame_size_bits, frame_size - 1, "nuExtSSFsize")?;

    w.put(header.static_fields.is_some())?;
    if let Some(sf) = &header.static_fields {
        build_static_fields(&mut w, sf, header.ext_ss_index)?;
    }

    for size in &header.asset_sizes {
        put_checked(&mut w, frame_size_bits, *size as u64 - 1, "nuAssetFsize")?;
    }

    for (asset, descriptor_size) in header.assets.iter().zip(&descriptor_sizes) {
        build_asset_descriptor(
            &mut w,
            asset,
            header.static_fields.as_ref(),
            frame_size_bits,
            *descriptor_size,
        )?;
    }

    for bc_core in &header.bc_core {
        w.put(bc_core.is_some())?;
    }

    for bc_core in header.bc_core.iter().flatten() {
        w.put_n(2, bc_core.0)?;
        w.put_n(3, bc_core.1)?;
    }

    build_reserved(&mut w, &header.reserved)?;

    w.byte_align()?;

    let mut bytes = w.finish()?;

    if bytes.len() as u64 + 2 != header_size {
        bail!(DtsPatcherError::SizeMismatch {
            computed: header_size,
            written: bytes.len() as u64 + 2,
        });
    }

    let crc = CRC_EXT_SS.checksum(&bytes[5..]);
    bytes.extend_from_slice(&crc.to_be_bytes());

    Ok(bytes)
}

/// Applies the PBR-planned XLL parameters to the header ahead of a rewrite.
pub fn update_xll_parameters(
    header: &mut ExtSSHeader,
    asset_id: usize,
    sync_word_present: bool,
    decoding_delay: u32,
    sync_offset: u32,
    pbr_buffer_size_kib: u32,
    asset_size: u32,
) -> Result<()> {
    header.long_header_size = true;
    header.asset_sizes[asset_id] = asset_size;

    let Some(xll) = &mut header.assets[asset_id].dec_nav.xll else {
        bail!(DtsPatcherError::FieldOverflow {
            field: "nuExSSXLLFsize",
            value: 0,
            width: 0,
        });
    };

    xll.size = asset_size;
    xll.sync_word_present = sync_word_present;
    xll.initial_decoding_delay = decoding_delay;
    xll.sync_offset = sync_offset;
    xll.peak_br_buf_size_kib = pbr_buffer_size_kib;

    // The header and frame sizes are recomputed by the builder.
    let header_size = compute_header_size(header)?;
    header.header_size = header_size as u32;
    header.frame_size =
        header_size as u32 + header.asset_sizes.iter().sum::<u32>();

    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dts::asset::XllComponent;
    use crate::dts::extss::ExtSSWarningFlags;
    use crate::utils::bitstream_io::BsIoSliceReader;

    /// A minimal primary-profile header carrying one XLL asset.
    pub(crate) fn build_test_header(asset_size: u32) -> ExtSSHeader {
        let mut header = ExtSSHeader {
            user_defined_bits: 0,
            ext_ss_index: 0,
            long_header_size: true,
            static_fields: Some(StaticFields {
                reference_clock_code: 0x2,
                frame_duration_code: 0,
                timestamp: None,
                nb_audio_presentations: 1,
                nb_audio_assets: 1,
                active_ext_ss_mask: vec![0x1],
                active_asset_mask: vec![vec![0x1]],
                mix_metadata: None,
            }),
            asset_sizes: vec![asset_size],
            bc_core: vec![Some((0, 0))],
            ..Default::default()
        };

        let mut asset = AssetDescriptor {
            asset_index: 0,
            static_fields: Some(AssetStaticFields {
                bit_depth: 24,
                max_sample_rate_code: 0xC, // 48 kHz
                nb_channels: 6,
                direct_speakers_feed: true,
                speakers_mask: Some((0x0, 0x000F)),
                ..Default::default()
            }),
            ..Default::default()
        };
        asset.dec_nav.coding_mode = CodingMode::HdComponents;
        asset.dec_nav.coding_components_mask = COD_COMP_EXTSUB_XLL;
        asset.dec_nav.xll = Some(XllComponent {
            size: asset_size,
            sync_word_present: true,
            peak_br_buf_size_kib: 240,
            initial_decoding_delay: 1,
            sync_offset: 0,
            stream_id: 0,
        });
        header.assets.push(asset);

        let header_size = compute_header_size(&header).unwrap() as u32;
        header.header_size = header_size;
        header.frame_size = header_size + asset_size;

        header
    }

    #[test]
    fn rewrite_round_trips_through_the_parser() -> Result<()> {
        let header = build_test_header(10_000);
        let bytes = build_ext_ss_header(&header)?;

        assert_eq!(bytes.len() as u32, header.header_size);

        let mut reader = BsIoSliceReader::from_slice(&bytes);
        let reparsed = ExtSSHeader::read(&mut reader)?;

        // Identical modulo derived lengths, CRC and alignment-born reserved
        // fields.
        assert_eq!(reparsed.ext_ss_index, header.ext_ss_index);
        assert_eq!(reparsed.header_size, header.header_size);
        assert_eq!(reparsed.frame_size, header.frame_size);
        assert_eq!(reparsed.static_fields, header.static_fields);
        assert_eq!(reparsed.asset_sizes, header.asset_sizes);
        assert_eq!(reparsed.bc_core, header.bc_core);
        assert_eq!(
            reparsed.assets[0].static_fields,
            header.assets[0].static_fields
        );
        assert_eq!(reparsed.assets[0].dynamic, header.assets[0].dynamic);

        // Descriptor padding reads back as an empty extra-data section.
        let mut expected_nav = header.assets[0].dec_nav.clone();
        expected_nav.extra_data_present = reparsed.assets[0].dec_nav.extra_data_present;
        assert_eq!(reparsed.assets[0].dec_nav, expected_nav);

        let mut warnings = ExtSSWarningFlags::default();
        reparsed.check_compliance(false, &mut warnings)?;
        Ok(())
    }

    #[test]
    fn planned_parameters_are_applied() -> Result<()> {
        let mut header = build_test_header(10_000);
        update_xll_parameters(&mut header, 0, true, 2, 123, 240, 8_000)?;

        assert_eq!(header.asset_sizes[0], 8_000);
        let xll = header.assets[0].dec_nav.xll.unwrap();
        assert_eq!(xll.sync_offset, 123);
        assert_eq!(xll.initial_decoding_delay, 2);

        let bytes = build_ext_ss_header(&header)?;
        let mut reader = BsIoSliceReader::from_slice(&bytes);
        let reparsed = ExtSSHeader::read(&mut reader)?;
        assert_eq!(reparsed.assets[0].dec_nav.xll.unwrap().sync_offset, 123);
        Ok(())
    }

    #[test]
    fn mix_metadata_rewrite_is_not_implemented() {
        let mut header = build_test_header(1_000);
        header.static_fields.as_mut().unwrap().mix_metadata =
            Some(crate::dts::extss::MixMetadata::default());

        assert!(build_ext_ss_header(&header).is_err());
    }
}
