//! Minor and major sync of TrueHD access units.
//!
//! Every access unit starts with a 4-byte minor sync (check nibble, length
//! in 16-bit words, input timing). Access units additionally carrying the
//! 0xF8726FBA format sync restate the full stream configuration in the
//! major sync info, protected by a 16-bit CRC. The DVD-Audio MLP variant
//! (0xF8726FBB) is rejected.

use anyhow::{Result, anyhow, bail};
use log::warn;

use crate::mlp::MlpWarningFlags;
use crate::mlp::channel::ChannelMeaning;
use crate::utils::bitstream_io::BsIoSliceReader;
use crate::utils::crc::{CRC_MLP_MAJOR_SYNC_ALG, Crc16};
use crate::utils::errors::MlpSyncError;

static CRC_MAJOR_SYNC: Crc16 = Crc16::new(&CRC_MLP_MAJOR_SYNC_ALG);

/// TrueHD format sync word.
pub const FORMAT_SYNC_TRUE_HD: u32 = 0xF872_6FBA;

/// DVD-Audio MLP format sync word, not supported.
pub const FORMAT_SYNC_MLP: u32 = 0xF872_6FBB;

/// 24-bit prefix shared by both format sync words.
pub const FORMAT_SYNC_PREFIX: u32 = 0xF8_72_6F;

/// Major sync signature constant.
pub const MAJOR_SYNC_SIGNATURE: u16 = 0xB752;

/// Scaled peak data rate ceiling for BDAV TrueHD streams, in bps.
pub const MAX_PEAK_DATA_RATE_BPS: u64 = 24_500_000;

/// 4-byte access unit prefix present on every access unit.
#[derive(Clone, Copy, Debug, Default)]
pub struct MinorSync {
    pub check_nibble: u8,
    /// Access unit length in 16-bit words, minor sync included.
    pub access_unit_length: u16,
    pub input_timing: u16,
}

impl MinorSync {
    /// Unpacks the minor sync from the first four bytes of an access unit.
    /// Returns the header and the XOR of its four bytes (folded into the
    /// access unit nibble parity check).
    pub fn from_bytes(bytes: [u8; 4]) -> Result<(Self, u8)> {
        let ms = Self {
            check_nibble: bytes[0] >> 4,
            access_unit_length: (((bytes[0] & 0xF) as u16) << 8) | bytes[1] as u16,
            input_timing: ((bytes[2] as u16) << 8) | bytes[3] as u16,
        };

        if ms.access_unit_length < 2 {
            bail!(MlpSyncError::AccessUnitTooShort(ms.access_unit_length));
        }

        let parity = bytes.iter().fold(0u8, |acc, b| acc ^ b);
        Ok((ms, parity))
    }
}

/// `format_info` decoded under knowledge of the major sync flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FormatInfo {
    pub audio_sampling_frequency: u8,
    pub six_ch_multichannel_type: bool,
    pub eight_ch_multichannel_type: bool,
    pub two_ch_presentation_modifier: u8,
    pub six_ch_presentation_modifier: u8,
    pub six_ch_channel_assignment: u8,
    pub eight_ch_presentation_modifier: u8,
    pub eight_ch_channel_assignment: u16,
}

const SIX_CH_GROUP_SIZES: [u32; 5] = [2, 1, 1, 2, 2];
const EIGHT_CH_GROUP_SIZES: [u32; 13] = [2, 1, 1, 2, 2, 2, 2, 1, 1, 2, 2, 1, 1];

impl FormatInfo {
    fn unpack(value: u32) -> Self {
        Self {
            audio_sampling_frequency: ((value >> 28) & 0xF) as u8,
            six_ch_multichannel_type: (value >> 27) & 0x1 != 0,
            eight_ch_multichannel_type: (value >> 26) & 0x1 != 0,
            two_ch_presentation_modifier: ((value >> 22) & 0x3) as u8,
            six_ch_presentation_modifier: ((value >> 20) & 0x3) as u8,
            six_ch_channel_assignment: ((value >> 15) & 0x1F) as u8,
            eight_ch_presentation_modifier: ((value >> 13) & 0x3) as u8,
            eight_ch_channel_assignment: (value & 0x1FFF) as u16,
        }
    }

    pub fn sampling_frequency(&self) -> Result<u32> {
        match self.audio_sampling_frequency {
            code @ 0..=2 => Ok(48_000 << code),
            code @ 8..=10 => Ok(44_100 << (code - 8)),
            code => bail!(MlpSyncError::ReservedSamplingFrequency(code)),
        }
    }

    pub fn six_ch_channel_count(&self) -> u32 {
        SIX_CH_GROUP_SIZES
            .iter()
            .enumerate()
            .map(|(i, n)| n * ((self.six_ch_channel_assignment as u32 >> i) & 1))
            .sum()
    }

    pub fn eight_ch_channel_count(&self, alternate_syntax: bool) -> u32 {
        let groups = if alternate_syntax {
            // Alternate syntax drops the upper assignment bits, keeping 4
            // payload bits plus the Tsl/Tsr flag.
            &EIGHT_CH_GROUP_SIZES[..5]
        } else {
            &EIGHT_CH_GROUP_SIZES[..]
        };

        groups
            .iter()
            .enumerate()
            .map(|(i, n)| n * ((self.eight_ch_channel_assignment as u32 >> i) & 1))
            .sum()
    }
}

/// `substream_info` bits of the major sync.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubstreamInfo {
    pub value: u8,
    pub six_ch_presentation: u8,
    pub eight_ch_presentation: u8,
    pub sixteen_ch_presentation_present: bool,
}

impl SubstreamInfo {
    fn unpack(value: u8) -> Self {
        Self {
            value,
            six_ch_presentation: (value >> 2) & 0x3,
            eight_ch_presentation: (value >> 4) & 0x7,
            sixteen_ch_presentation_present: value >> 7 != 0,
        }
    }
}

/// Complete major sync information.
#[derive(Clone, Debug, Default)]
pub struct MajorSyncInfo {
    pub format_sync: u32,
    pub format_info: FormatInfo,
    pub signature: u16,
    pub flags: u16,
    pub variable_bitrate: bool,
    pub peak_data_rate: u16,
    pub substreams: usize,
    pub extended_substream_info: u8,
    pub substream_info: SubstreamInfo,
    pub channel_meaning: ChannelMeaning,
    pub major_sync_info_crc: u16,
}

impl MajorSyncInfo {
    /// Constant FIFO buffer delay flag (bit 15 of `flags`).
    pub fn constant_fifo_delay(&self) -> bool {
        self.flags & 0x8000 != 0
    }

    /// Alternate 8-ch channel assignment syntax flag (bit 11 of `flags`).
    pub fn alternate_eight_ch_syntax(&self) -> bool {
        self.flags & 0x0800 != 0
    }

    pub fn sampling_frequency(&self) -> Result<u32> {
        self.format_info.sampling_frequency()
    }

    /// Peak data rate scaled to bps (`raw * Fs / 16`).
    pub fn peak_data_rate_bps(&self) -> Result<u64> {
        Ok(self.peak_data_rate as u64 * self.sampling_frequency()? as u64 / 16)
    }

    pub fn read(
        reader: &mut BsIoSliceReader,
        warnings: &mut MlpWarningFlags,
    ) -> Result<Self> {
        let start_pos = reader.position()?;

        let mut ms = Self {
            format_sync: reader.get_n(32)?,
            ..Default::default()
        };

        match ms.format_sync {
            FORMAT_SYNC_TRUE_HD => {}
            FORMAT_SYNC_MLP => bail!(MlpSyncError::DvdAudioFormatSync),
            sync => bail!(MlpSyncError::InvalidFormatSync(sync)),
        }

        // Unpacked below, once the flags are known.
        let format_info_value: u32 = reader.get_n(32)?;

        ms.signature = reader.get_n(16)?;

        if ms.signature != MAJOR_SYNC_SIGNATURE {
            bail!(MlpSyncError::InvalidSignature(ms.signature));
        }

        ms.flags = reader.get_n(16)?;
        ms.format_info = FormatInfo::unpack(format_info_value);

        reader.skip_n(16)?; // reserved

        ms.variable_bitrate = reader.get()?;
        ms.peak_data_rate = reader.get_n(15)?;
        ms.substreams = reader.get_n::<u8>(4)? as usize;

        reader.skip_n(2)?; // reserved
        ms.extended_substream_info = reader.get_n(2)?;

        let substream_info_value: u8 = reader.get_n(8)?;
        ms.substream_info = SubstreamInfo::unpack(substream_info_value);

        ms.channel_meaning = ChannelMeaning::read(
            reader,
            ms.substream_info.sixteen_ch_presentation_present,
        )?;

        let len = reader.position()? - start_pos;

        ms.major_sync_info_crc = reader.get_n(16)?;

        let crc = reader.crc16_check(&CRC_MAJOR_SYNC, start_pos, len)?;

        if crc != ms.major_sync_info_crc {
            bail!(MlpSyncError::MajorSyncCrcMismatch {
                calculated: crc,
                read: ms.major_sync_info_crc,
            });
        }

        ms.check_compliance(warnings)?;

        Ok(ms)
    }

    fn check_compliance(&self, warnings: &mut MlpWarningFlags) -> Result<()> {
        let fs = self.sampling_frequency()?;

        if self.format_info.six_ch_multichannel_type {
            bail!(MlpSyncError::ReservedMultichannelType { presentation: 6 });
        }
        if self.format_info.eight_ch_multichannel_type {
            bail!(MlpSyncError::ReservedMultichannelType { presentation: 8 });
        }

        let six_ch = self.format_info.six_ch_channel_count();
        if six_ch > 6 {
            bail!(MlpSyncError::TooManyPresentationChannels {
                presentation: 6,
                count: six_ch,
                max: 6,
            });
        }

        let eight_ch = self
            .format_info
            .eight_ch_channel_count(self.alternate_eight_ch_syntax());
        if eight_ch > 8 {
            bail!(MlpSyncError::TooManyPresentationChannels {
                presentation: 8,
                count: eight_ch,
                max: 8,
            });
        }

        if eight_ch == 0 && !warnings.missing_eight_ch_mask {
            warn!("Missing 8-ch presentation channel assignment mask");
            warnings.missing_eight_ch_mask = true;
        }

        let peak_bps = self.peak_data_rate as u64 * fs as u64 / 16;
        if peak_bps > MAX_PEAK_DATA_RATE_BPS {
            bail!(MlpSyncError::PeakDataRateTooHigh(peak_bps));
        }

        Ok(())
    }

    /// Major sync parameters must not change across the stream.
    pub fn check_constant(&self, reference: &Self) -> Result<()> {
        let field = if self.format_info != reference.format_info {
            Some("format_info")
        } else if self.flags != reference.flags {
            Some("flags")
        } else if self.variable_bitrate != reference.variable_bitrate {
            Some("variable_bitrate")
        } else if self.peak_data_rate != reference.peak_data_rate {
            Some("peak_data_rate")
        } else if self.substreams != reference.substreams {
            Some("substreams")
        } else if self.extended_substream_info != reference.extended_substream_info {
            Some("extended_substream_info")
        } else if self.substream_info != reference.substream_info {
            Some("substream_info")
        } else if self.channel_meaning != reference.channel_meaning {
            Some("channel_meaning")
        } else {
            None
        };

        match field {
            Some(field) => Err(anyhow!(MlpSyncError::NonCompliantChange { field })),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minor_sync_unpacks_fields() -> Result<()> {
        let (ms, parity) = MinorSync::from_bytes([0xA1, 0x40, 0x12, 0x34])?;
        assert_eq!(ms.check_nibble, 0xA);
        assert_eq!(ms.access_unit_length, 0x140);
        assert_eq!(ms.input_timing, 0x1234);
        assert_eq!(parity, 0xA1 ^ 0x40 ^ 0x12 ^ 0x34);
        Ok(())
    }

    #[test]
    fn short_access_unit_is_rejected() {
        assert!(MinorSync::from_bytes([0x00, 0x01, 0x00, 0x00]).is_err());
    }

    #[test]
    fn format_info_channel_counts() {
        // L/R + C + LFE + Ls/Rs = 6 channels.
        let fi = FormatInfo {
            six_ch_channel_assignment: 0b01111,
            eight_ch_channel_assignment: 0b0000000001111,
            ..Default::default()
        };
        assert_eq!(fi.six_ch_channel_count(), 6);
        assert_eq!(fi.eight_ch_channel_count(false), 6);
    }

    #[test]
    fn alternate_syntax_masks_high_groups() {
        let fi = FormatInfo {
            eight_ch_channel_assignment: 0b1111111111111,
            ..Default::default()
        };
        assert_eq!(fi.eight_ch_channel_count(false), 20);
        assert_eq!(fi.eight_ch_channel_count(true), 8);
    }

    #[test]
    fn reserved_sampling_frequency_fails() {
        let fi = FormatInfo {
            audio_sampling_frequency: 0x4,
            ..Default::default()
        };
        assert!(fi.sampling_frequency().is_err());
    }
}
