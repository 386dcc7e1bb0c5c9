//! Dolby TrueHD (MLP) access unit parsing.
//!
//! Access units are parsed one at a time from a caller-provided buffer
//! spanning exactly `access_unit_length` 16-bit words. The context keeps the
//! cross-unit state required by the constancy and timing rules: the last
//! major sync, per-substream restart parameters and the running output
//! sample counters.

pub mod block;
pub mod channel;
pub mod filter;
pub mod matrix;
pub mod restart_header;
pub mod substream;
pub mod sync;

use anyhow::{Result, bail};

use crate::mlp::block::{BHC_DEFAULT, ChannelParams};
use crate::mlp::matrix::MatrixParameters;
use crate::mlp::restart_header::RestartHeader;
use crate::mlp::substream::{SubstreamDirectoryEntry, read_substream_segment};
use crate::mlp::sync::{FORMAT_SYNC_PREFIX, MajorSyncInfo, MinorSync};
use crate::utils::bitstream_io::BsIoSliceReader;
use crate::utils::errors::{MlpSubstreamError, MlpSyncError};

pub const MLP_MAX_NB_SUBSTREAMS: usize = 4;
pub const MLP_MAX_NB_CHANNELS: usize = 16;

/// Base number of samples per access unit at 44.1/48 kHz.
pub const BASE_SAMPLES_PER_AU: usize = 40;

/// Maximum number of coded channels per substream index.
pub fn max_substream_channels(ss_idx: usize) -> u32 {
    [2, 6, 8, 16][ss_idx & 3]
}

/// One-shot warning flags of a TrueHD stream.
#[derive(Debug, Default)]
pub struct MlpWarningFlags {
    pub missing_eight_ch_mask: bool,
    pub restart_reserved_non_zero: bool,
}

/// Per-substream parameter state surviving across blocks and access units.
#[derive(Clone, Copy, Debug, Default)]
pub struct SubstreamState {
    pub restart_seen: bool,
    pub restart_header: RestartHeader,
    pub cur_output_timing: u16,
    pub block_header_content: u8,
    pub block_size: u16,
    pub matrix_params: MatrixParameters,
    pub matrix_changes: u8,
    pub quant_step_size: [u8; MLP_MAX_NB_CHANNELS],
    pub channel_params: [ChannelParams; MLP_MAX_NB_CHANNELS],
    pub terminator_reached: bool,
}

impl SubstreamState {
    /// Resets the decoding parameters to their restart defaults.
    pub fn apply_restart_header(&mut self, rh: RestartHeader) {
        self.restart_header = rh;
        self.restart_seen = true;
        self.cur_output_timing = rh.output_timing;
        self.block_header_content = BHC_DEFAULT;
        self.block_size = 8;
        self.matrix_params = MatrixParameters::default();
        self.quant_step_size = [0; MLP_MAX_NB_CHANNELS];
        self.channel_params = [ChannelParams::default(); MLP_MAX_NB_CHANNELS];
    }

    /// Mask of coded channels claimed by this substream.
    pub fn coded_channel_mask(&self) -> u32 {
        if !self.restart_seen {
            return 0;
        }

        let rh = &self.restart_header;
        ((1u32 << (1 + rh.max_chan - rh.min_chan)) - 1) << rh.min_chan
    }
}

/// Stream summary derived from the major sync and restart headers.
#[derive(Clone, Copy, Debug, Default)]
pub struct MlpInformations {
    pub sampling_frequency: u32,
    pub nb_channels: u32,
    pub peak_data_rate_bps: u64,
    pub atmos: bool,
    pub binaural: bool,
    pub mono: bool,
    pub matrix_surround: bool,
    pub observed_bit_depth: u8,
}

/// Summary of one parsed access unit.
#[derive(Clone, Copy, Debug)]
pub struct MlpAccessUnit {
    pub minor_sync: MinorSync,
    pub major_sync: bool,
    pub samples_per_au: usize,
}

/// Cross-unit TrueHD parsing state.
#[derive(Debug, Default)]
pub struct MlpParsingContext {
    pub major_sync: Option<MajorSyncInfo>,
    substreams: [SubstreamState; MLP_MAX_NB_SUBSTREAMS],
    pub info: MlpInformations,
    pub nb_frames: u32,
    pub terminator_reached: bool,
    warnings: MlpWarningFlags,
}

impl MlpParsingContext {
    /// Samples spanned by one access unit at the current sampling
    /// frequency.
    pub fn samples_per_au(&self) -> usize {
        self.info.sampling_frequency as usize / 44_100 * BASE_SAMPLES_PER_AU
    }

    fn update_info(&mut self, ms: &MajorSyncInfo) -> Result<()> {
        let fi = &ms.format_info;

        let eight_ch = fi.eight_ch_channel_count(ms.alternate_eight_ch_syntax());
        let six_ch = fi.six_ch_channel_count();

        self.info.sampling_frequency = ms.sampling_frequency()?;
        self.info.nb_channels = if eight_ch > 0 { eight_ch } else { six_ch };
        self.info.peak_data_rate_bps = ms.peak_data_rate_bps()?;
        self.info.atmos = ms.substream_info.sixteen_ch_presentation_present
            && ms.channel_meaning.atmos_present();

        for modifier in [
            fi.two_ch_presentation_modifier,
            fi.six_ch_presentation_modifier,
            fi.eight_ch_presentation_modifier,
        ] {
            match modifier {
                0x1 => self.info.matrix_surround = true,
                0x2 => self.info.binaural = true,
                0x3 => self.info.mono = true,
                _ => {}
            }
        }

        Ok(())
    }

    /// Parses one complete access unit. `au` must span exactly
    /// `access_unit_length` 16-bit words, minor sync included.
    pub fn parse_access_unit(&mut self, au: &[u8]) -> Result<MlpAccessUnit> {
        if au.len() < 4 {
            bail!(MlpSyncError::AccessUnitTooShort((au.len() / 2) as u16));
        }

        let (minor_sync, minor_parity) =
            MinorSync::from_bytes([au[0], au[1], au[2], au[3]])?;

        let data = &au[4..];
        let reader = &mut BsIoSliceReader::from_slice(data);

        let major_sync = data.len() >= 4
            && reader.peek_n::<u32>(32)? >> 8 == FORMAT_SYNC_PREFIX;

        if self.nb_frames == 0 && !major_sync {
            bail!(MlpSyncError::MissingMajorSync);
        }

        if major_sync {
            let ms = MajorSyncInfo::read(reader, &mut self.warnings)?;

            if ms.substreams > MLP_MAX_NB_SUBSTREAMS {
                bail!(MlpSyncError::TooManySubstreams(ms.substreams));
            }

            if let Some(reference) = &self.major_sync {
                ms.check_constant(reference)?;
            }

            self.update_info(&ms)?;
            self.major_sync = Some(ms);
        }

        let Some(major) = self.major_sync.clone() else {
            bail!(MlpSyncError::MissingMajorSync);
        };

        // Substream directory.
        let mut directory = [SubstreamDirectoryEntry::default(); MLP_MAX_NB_SUBSTREAMS];
        let mut directory_parity = 0u16;
        for entry in directory.iter_mut().take(major.substreams) {
            let (read_entry, parity) = SubstreamDirectoryEntry::read(reader)?;
            *entry = read_entry;
            directory_parity ^= parity;
        }

        let parity = minor_parity
            ^ (directory_parity >> 8) as u8
            ^ (directory_parity & 0xFF) as u8;
        if ((parity >> 4) ^ parity) & 0xF != 0xF {
            bail!(MlpSubstreamError::NibbleParity(
                ((parity >> 4) ^ parity) & 0xF
            ));
        }

        // End pointers are relative to the end of the access unit header.
        let header_words = 2 + (reader.position()? >> 4) as u16;
        if minor_sync.access_unit_length < header_words {
            bail!(MlpSubstreamError::HeaderTooLong {
                total: header_words,
                max: minor_sync.access_unit_length,
            });
        }
        let unit_end = minor_sync.access_unit_length - header_words;

        let mut previous_end_ptr = 0u16;
        for (i, entry) in directory.iter_mut().enumerate().take(major.substreams) {
            if entry.restart_nonexistent == major_sync {
                bail!(MlpSubstreamError::InvalidRestartNonexistent {
                    expected: !major_sync,
                    suffix: if major_sync { "" } else { "out" },
                });
            }

            if entry.substream_end_ptr <= previous_end_ptr {
                bail!(MlpSubstreamError::EndPtrNotMonotonic {
                    substream: i,
                    read: entry.substream_end_ptr,
                    previous: previous_end_ptr,
                });
            }

            if entry.substream_end_ptr > unit_end {
                bail!(MlpSubstreamError::EndPtrOutOfUnit {
                    substream: i,
                    read: entry.substream_end_ptr,
                    max: unit_end,
                });
            }

            entry.substream_size = entry.substream_end_ptr - previous_end_ptr;
            previous_end_ptr = entry.substream_end_ptr;
        }

        // Substream segments.
        let samples_per_au = self.samples_per_au();
        let mut terminator_signaled = false;
        let mut coded_channel_mask = 0u32;

        for (i, entry) in directory.iter().enumerate().take(major.substreams) {
            let (ss_mask, max_bits, terminator_reached) = {
                let ss = &mut self.substreams[i];
                read_substream_segment(
                    reader,
                    ss,
                    entry,
                    i,
                    samples_per_au,
                    &mut self.warnings,
                )?;
                (
                    ss.coded_channel_mask(),
                    ss.restart_header.max_bits,
                    ss.terminator_reached,
                )
            };

            if coded_channel_mask & ss_mask != 0 {
                bail!(MlpSubstreamError::OverlappingCodedChannels(i));
            }
            coded_channel_mask |= ss_mask;

            self.info.observed_bit_depth = self.info.observed_bit_depth.max(max_bits);

            if i > 0 && terminator_signaled != terminator_reached {
                bail!(MlpSubstreamError::TerminatorMismatch(i));
            }
            terminator_signaled |= terminator_reached;
        }

        self.terminator_reached = terminator_signaled;

        // EXTRA_DATA trailer.
        if reader.available()? >= 16 {
            read_extra_data(reader)?;
        }

        self.nb_frames += 1;

        Ok(MlpAccessUnit {
            minor_sync,
            major_sync,
            samples_per_au,
        })
    }
}

/// Reads the optional EXTRA_DATA trailer closing an access unit.
fn read_extra_data(reader: &mut BsIoSliceReader) -> Result<()> {
    use crate::utils::errors::MlpExtraDataError;

    let length_word: u16 = reader.get_n(16)?;

    let mut nibble = length_word ^ (length_word >> 8);
    nibble ^= nibble >> 4;
    if nibble & 0xF != 0xF {
        bail!(MlpExtraDataError::LengthParityFailed(length_word));
    }

    let length = length_word & 0xFFF;
    let data_bits = ((length as u64) << 4).saturating_sub(8);

    if data_bits + 8 > reader.available()? {
        bail!(MlpExtraDataError::TooLong {
            length,
            remaining: reader.available()?,
        });
    }

    let data_start = reader.position()?;
    let parity = 0xA9 ^ reader.parity_check(data_start, data_bits)?;
    reader.skip_n(data_bits as u32)?;

    let extra_data_parity: u8 = reader.get_n(8)?;
    if parity != extra_data_parity {
        bail!(MlpExtraDataError::ParityMismatch {
            calculated: parity,
            read: extra_data_parity,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::bitstream_io::BsIoVecWriter;
    use crate::utils::crc::{
        CRC_MLP_MAJOR_SYNC_ALG, CRC_MLP_RESTART_HEADER_ALG, Crc8, Crc16,
    };

    /// Builds the major sync info bytes (valid CRC included) for a 48 kHz
    /// stereo stream with one substream.
    fn build_major_sync() -> Vec<u8> {
        let mut w = BsIoVecWriter::default();
        w.put_n(32, sync::FORMAT_SYNC_TRUE_HD).unwrap();

        // format_info: fs 48 kHz, 2ch/6ch/8ch standard assignments.
        let mut format_info = 0u32;
        format_info |= 0b01111 << 15; // 6ch: L/R + C + LFE + Ls/Rs
        format_info |= 0b0000000000001; // 8ch: L/R
        w.put_n(32, format_info).unwrap();

        w.put_n(16, sync::MAJOR_SYNC_SIGNATURE).unwrap();
        w.put_n(16, 0u16).unwrap(); // flags
        w.put_n(16, 0u16).unwrap(); // reserved
        w.put(false).unwrap(); // variable_bitrate
        w.put_n(15, 0x1000u16).unwrap(); // peak_data_rate
        w.put_n(4, 1u8).unwrap(); // substreams
        w.put_n(2, 0u8).unwrap(); // reserved
        w.put_n(2, 0u8).unwrap(); // extended_substream_info
        w.put_n(8, 0x04u8).unwrap(); // substream_info: 6ch presentation

        channel::tests::write_channel_meaning(&mut w, false);

        let body = w.finish().unwrap();

        let crc_alg = Crc16::new(&CRC_MLP_MAJOR_SYNC_ALG);
        let crc = crc_alg.update(0, &body);

        let mut out = body;
        out.extend_from_slice(&crc.to_be_bytes());
        out
    }

    /// Builds one substream segment (valid restart header CRC) and returns
    /// its bytes.
    fn build_segment() -> Vec<u8> {
        let build = |crc: u8| -> Vec<u8> {
            let mut w = BsIoVecWriter::default();
            w.put(true).unwrap(); // block_header_exists
            w.put(true).unwrap(); // restart_header_exists
            restart_header::tests::write_restart_header(&mut w, 0);
            w.put_n(8, crc).unwrap();

            // block_header with every optional section absent.
            w.put(false).unwrap(); // block_header_content_exists
            w.put(false).unwrap(); // block_size_present
            w.put(false).unwrap(); // matrix_parameters_present
            w.put(false).unwrap(); // output_shift_present
            w.put(false).unwrap(); // quant_step_size_present
            w.put(false).unwrap(); // channel_parameters_present[0]
            w.put(false).unwrap(); // channel_parameters_present[1]

            // block_data: 8 samples, channels 0..=1, 24 LSB bits each.
            for _ in 0..8 {
                w.put_n(24, 0u32).unwrap();
                w.put_n(24, 0u32).unwrap();
            }

            w.put(true).unwrap(); // last_block_in_segment

            // 16-bit alignment padding.
            while w.position() % 16 != 0 {
                w.put(false).unwrap();
            }
            w.finish().unwrap()
        };

        // First pass with a placeholder CRC to learn the header bits, then
        // compute the real checksum over the non-aligned span.
        let draft = build(0);
        let mut probe = BsIoSliceReader::from_slice(&draft);
        let crc_alg = Crc8::new(&CRC_MLP_RESTART_HEADER_ALG);
        let restart_bits = 14 + 16 + 4 + 4 + 4 + 4 + 23 + 4 + 5 + 5 + 5 + 1 + 8 + 16 + 12;
        let crc = probe.crc8_check(&crc_alg, 2, restart_bits).unwrap();

        build(crc)
    }

    /// Assembles a complete access unit with a valid nibble check.
    fn build_access_unit() -> Vec<u8> {
        let major_sync = build_major_sync();
        let segment = build_segment();
        let segment_words = (segment.len() / 2) as u16;

        // Directory: one entry, restart present, no CRC.
        let directory_word: u16 = segment_words; // all flags clear

        let data_words = (major_sync.len() as u16) / 2 + 1 + segment_words;
        let access_unit_length = 2 + data_words;

        let mut minor = [
            (access_unit_length >> 8) as u8,
            (access_unit_length & 0xFF) as u8,
            0x00,
            0x00,
        ];

        let mut parity = minor.iter().fold(0u8, |acc, b| acc ^ b);
        parity ^= (directory_word >> 8) as u8 ^ (directory_word & 0xFF) as u8;
        let folded = ((parity >> 4) ^ parity) & 0xF;
        minor[0] |= (folded ^ 0xF) << 4;

        let mut au = minor.to_vec();
        au.extend_from_slice(&major_sync);
        au.extend_from_slice(&directory_word.to_be_bytes());
        au.extend_from_slice(&segment);
        au
    }

    #[test]
    fn full_access_unit_parses() -> Result<()> {
        let au = build_access_unit();
        let mut ctx = MlpParsingContext::default();

        let parsed = ctx.parse_access_unit(&au)?;
        assert!(parsed.major_sync);
        assert_eq!(parsed.samples_per_au, 40);
        assert_eq!(ctx.info.sampling_frequency, 48_000);
        assert_eq!(ctx.info.nb_channels, 2);
        assert_eq!(ctx.info.observed_bit_depth, 16);
        assert!(!ctx.info.atmos);
        Ok(())
    }

    #[test]
    fn first_access_unit_requires_major_sync() {
        // A minor-sync-only access unit as the first unit of the stream.
        let au = [0x00u8, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        let mut ctx = MlpParsingContext::default();

        let err = ctx.parse_access_unit(&au).unwrap_err();
        assert!(err.to_string().contains("major sync"));
    }

    #[test]
    fn corrupted_major_sync_crc_is_fatal() {
        let mut au = build_access_unit();
        // Flip a bit inside the channel meaning block.
        au[24] ^= 0x10;

        let mut ctx = MlpParsingContext::default();
        assert!(ctx.parse_access_unit(&au).is_err());
    }

    #[test]
    fn nibble_parity_failure_is_detected() {
        let mut au = build_access_unit();
        au[0] ^= 0x10; // corrupt the check nibble

        let mut ctx = MlpParsingContext::default();
        assert!(ctx.parse_access_unit(&au).is_err());
    }
}
