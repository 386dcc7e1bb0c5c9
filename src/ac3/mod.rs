//! AC-3 and Enhanced AC-3 parsing, and the AC-3 family driver.
//!
//! The driver walks an elementary stream of AC-3 sync frames optionally
//! interleaved with TrueHD access units (the Blu-ray TrueHD carriage: AC-3
//! core frames as base frames, MLP access units as extension frames).
//! Dependent E-AC-3 substream frames are appended to the access unit of the
//! preceding independent frame.

pub mod bsi;
pub mod sync_info;

use std::io::Write;

use anyhow::{Result, bail};
use log::debug;

use crate::ac3::bsi::{
    ACMOD_DUAL_MONO, Ac3BitStreamInfo, Ac3WarningFlags, Eac3BitStreamInfo,
};
use crate::ac3::sync_info::{AC3_SYNCWORD, Ac3SyncInfo};
use crate::frame::{AuCellKind, AuFrame};
use crate::mlp::MlpParsingContext;
use crate::script::{
    AudioFormat, BitDepthCode, SampleRateCode, ScriptWriter, StreamCodingType,
    StreamProperties,
};
use crate::utils::bitstream_io::BsIoSliceReader;
use crate::utils::errors::{Ac3Error, DriverError};

/// 90 kHz * 300 = 27 MHz system clock.
pub const SYSTEM_CLOCK_HZ: u64 = 27_000_000;

/// Samples per AC-3 sync frame.
pub const AC3_SAMPLES_PER_FRAME: u64 = 1536;

/// BDAV combined TrueHD stream bitrate ceiling, bps.
pub const BDAV_TRUE_HD_MAX_BITRATE: u32 = 18_000_000;

/// Driver options for the AC-3 family.
#[derive(Clone, Copy, Debug, Default)]
pub struct Ac3Options {
    /// The stream is a secondary audio track.
    pub secondary: bool,
    /// Discard this many leading access units while keeping file positions.
    pub skip_first_frames: u32,
}

/// Streaming state of the AC-3 family driver.
pub struct Ac3Context<'a, W: Write> {
    input: &'a [u8],
    pos: usize,
    script: &'a mut ScriptWriter<W>,
    src_file: u8,
    options: Ac3Options,

    cur_au: AuFrame,
    au_open: bool,
    au_pts: u64,

    ac3: Option<(Ac3SyncInfo, Ac3BitStreamInfo)>,
    eac3: Option<Eac3BitStreamInfo>,
    mlp: MlpParsingContext,
    mlp_present: bool,
    warnings: Ac3WarningFlags,

    nb_frames: u32,
    base_samples: u64,
    base_sample_rate: u32,
    ext_samples: u64,
    skip_counter: u32,
}

impl<'a, W: Write> Ac3Context<'a, W> {
    pub fn new(
        input: &'a [u8],
        script: &'a mut ScriptWriter<W>,
        options: Ac3Options,
    ) -> Self {
        let src_file = script.add_source_file("es");
        Self {
            input,
            pos: 0,
            script,
            src_file,
            options,
            cur_au: AuFrame::default(),
            au_open: false,
            au_pts: 0,
            ac3: None,
            eac3: None,
            mlp: MlpParsingContext::default(),
            mlp_present: false,
            warnings: Ac3WarningFlags::default(),
            nb_frames: 0,
            base_samples: 0,
            base_sample_rate: 48_000,
            ext_samples: 0,
            skip_counter: options.skip_first_frames,
        }
    }

    /// Frames seen so far, TrueHD access units included.
    pub fn nb_frames(&self) -> u32 {
        self.nb_frames
    }

    fn base_pts(&self) -> u64 {
        self.base_samples * SYSTEM_CLOCK_HZ / self.base_sample_rate as u64
    }

    fn ext_pts(&self) -> u64 {
        let rate = self.mlp.info.sampling_frequency.max(48_000) as u64;
        self.ext_samples * SYSTEM_CLOCK_HZ / rate
    }

    fn flush_au(&mut self) -> Result<()> {
        if self.au_open {
            self.cur_au
                .finalize(self.script, self.src_file, self.au_pts)?;
            self.au_open = false;
        }
        Ok(())
    }

    /// Processes the whole input, emitting one PES record per access unit.
    pub fn process(mut self) -> Result<()> {
        while self.input.len() - self.pos >= 2 {
            let sync = u16::from_be_bytes([self.input[self.pos], self.input[self.pos + 1]]);

            if sync == AC3_SYNCWORD {
                self.parse_ac3_family_frame()?;
            } else {
                self.parse_mlp_access_unit()?;
            }

            self.nb_frames += 1;
        }

        self.flush_au()?;
        self.set_script_properties()
    }

    /// The `bsid` field sits at bit offset 40 in both BSI syntaxes.
    fn peek_bsid(&self) -> Result<u8> {
        let mut reader = BsIoSliceReader::from_slice(&self.input[self.pos..]);
        reader.skip_n(40)?;
        Ok(reader.get_n(5)?)
    }

    fn parse_ac3_family_frame(&mut self) -> Result<()> {
        let start = self.pos;
        let bsid = self.peek_bsid()?;

        let mut reader = BsIoSliceReader::from_slice(&self.input[start..]);

        let (frame_size, dependent) = if bsid <= 8 {
            let sync_info = Ac3SyncInfo::read(&mut reader)?;
            let bsi = Ac3BitStreamInfo::read(&mut reader, &mut self.warnings)?;

            if let Some((reference_sync, reference)) = &self.ac3 {
                if sync_info.fscod != reference_sync.fscod {
                    bail!(Ac3Error::NonCompliantChange { field: "fscod" });
                }
                if sync_info.frmsizecod != reference_sync.frmsizecod {
                    bail!(Ac3Error::NonCompliantChange { field: "frmsizecod" });
                }
                bsi.check_constant(reference)?;
            } else {
                sync_info.check_bdav_compliance()?;
                bsi.check_bdav_compliance()?;
            }

            self.base_sample_rate = sync_info.sample_rate;
            let frame_size = sync_info.frame_size;
            self.ac3 = Some((sync_info, bsi));
            (frame_size, false)
        } else if bsid == 16 {
            reader.skip_n(16)?; // syncword
            let bsi = Eac3BitStreamInfo::read(&mut reader, &mut self.warnings)?;

            if let Some(reference) = &self.eac3 {
                bsi.check_constant(reference)?;
            } else {
                bsi.check_bdav_compliance(self.options.secondary)?;
            }

            self.base_sample_rate = 48_000;
            let dependent = bsi.strmtyp == 0x1;
            let frame_size = bsi.frame_size;
            self.eac3 = Some(bsi);
            (frame_size, dependent)
        } else {
            bail!(Ac3Error::UnsupportedBsid(bsid));
        };

        if start + frame_size as usize > self.input.len() {
            bail!(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "truncated AC-3 sync frame",
            ));
        }

        self.pos = start + frame_size as usize;

        if self.skip_counter > 0 {
            self.skip_counter -= 1;
            self.cur_au.discard_all();
            self.au_open = false;
            return Ok(());
        }

        if !dependent {
            self.flush_au()?;
            self.au_pts = self.base_pts();
            self.au_open = true;

            self.base_samples += if bsid == 16 {
                self.eac3
                    .as_ref()
                    .map(|bsi| bsi.nb_blocks as u64 * 256)
                    .unwrap_or(AC3_SAMPLES_PER_FRAME)
            } else {
                AC3_SAMPLES_PER_FRAME
            };
        }

        self.cur_au.begin_cell(AuCellKind::CoreSS)?;
        self.cur_au.set_source_range(start as u64, frame_size)?;
        self.cur_au.commit_cell()?;

        Ok(())
    }

    fn parse_mlp_access_unit(&mut self) -> Result<()> {
        let start = self.pos;

        if self.input.len() - start < 4 {
            bail!(crate::utils::errors::MlpSyncError::AccessUnitTooShort(
                ((self.input.len() - start) / 2) as u16
            ));
        }

        let words = (((self.input[start] & 0xF) as usize) << 8) | self.input[start + 1] as usize;
        let au_size = words * 2;

        if words < 2 || start + au_size > self.input.len() {
            bail!(crate::utils::errors::MlpSyncError::AccessUnitTooShort(
                words as u16
            ));
        }

        let au = &self.input[start..start + au_size];
        let parsed = self.mlp.parse_access_unit(au)?;
        self.mlp_present = true;
        self.pos = start + au_size;

        if self.skip_counter > 0 {
            self.skip_counter -= 1;
            return Ok(());
        }

        self.flush_au()?;

        debug!(
            "TrueHD access unit {} ({} words, major sync: {})",
            self.mlp.nb_frames, words, parsed.major_sync
        );

        self.au_pts = self.ext_pts();
        self.au_open = true;
        self.ext_samples += parsed.samples_per_au as u64;

        self.cur_au.begin_cell(AuCellKind::ExtSSHeader)?;
        self.cur_au.set_source_range(start as u64, au_size as u32)?;
        self.cur_au.commit_cell()?;
        self.flush_au()?;

        Ok(())
    }

    fn set_script_properties(&mut self) -> Result<()> {
        let properties = if self.mlp_present {
            let info = &self.mlp.info;
            StreamProperties {
                coding_type: StreamCodingType::TrueHd,
                audio_format: match info.nb_channels {
                    0 | 1 => AudioFormat::Mono,
                    2 => AudioFormat::Stereo,
                    _ => AudioFormat::MultiChannel,
                },
                sample_rate: SampleRateCode::from_rate(info.sampling_frequency),
                bit_depth: BitDepthCode::from_depth(info.observed_bit_depth as u32),
                channel_mask: 0,
                bitrate: BDAV_TRUE_HD_MAX_BITRATE,
                last_pts: self.ext_pts().max(self.base_pts()),
            }
        } else if let Some(bsi) = &self.eac3 {
            StreamProperties {
                coding_type: StreamCodingType::Eac3Secondary,
                audio_format: audio_format_for_acmod(bsi.acmod),
                sample_rate: SampleRateCode::Hz48000,
                bit_depth: BitDepthCode::Bits16,
                channel_mask: bsi.chanmap.unwrap_or(0),
                bitrate: bsi.frame_size * 8 * 48_000 / (bsi.nb_blocks * 256),
                last_pts: self.base_pts(),
            }
        } else if let Some((sync_info, bsi)) = &self.ac3 {
            StreamProperties {
                coding_type: StreamCodingType::Ac3,
                audio_format: audio_format_for_acmod(bsi.acmod),
                sample_rate: SampleRateCode::from_rate(sync_info.sample_rate),
                bit_depth: BitDepthCode::Bits16,
                channel_mask: 0,
                bitrate: sync_info.bitrate * 1000,
                last_pts: self.base_pts(),
            }
        } else {
            bail!(DriverError::EmptyStream);
        };

        self.script.set_properties(properties);
        Ok(())
    }
}

fn audio_format_for_acmod(acmod: u8) -> AudioFormat {
    match acmod {
        ACMOD_DUAL_MONO => AudioFormat::DualMono,
        0x1 => AudioFormat::Mono,
        0x2 => AudioFormat::Stereo,
        _ => AudioFormat::MultiChannel,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::bitstream_io::BsIoVecWriter;

    /// A 768-byte 192 kbps 48 kHz stereo AC-3 frame.
    fn build_ac3_frame(acmod: u8) -> Vec<u8> {
        let mut frame = vec![0x0B, 0x77, 0x00, 0x00, 0x14];

        let mut w = BsIoVecWriter::default();
        bsi::tests::write_ac3_bsi(&mut w, acmod);
        frame.extend_from_slice(&w.finish().unwrap());

        frame.resize(768, 0);
        frame
    }

    #[test]
    fn single_frame_emits_one_copy_record() -> Result<()> {
        let frame = build_ac3_frame(0x2);

        let mut script = ScriptWriter::new(Vec::new());
        let ctx = Ac3Context::new(&frame, &mut script, Ac3Options::default());
        ctx.process()?;

        assert_eq!(script.nb_records(), 1);
        let bytes = script.finish()?;
        // CopySource command: length field closes the record.
        assert!(!bytes.is_empty());
        Ok(())
    }

    #[test]
    fn acmod_change_aborts_the_pass() -> Result<()> {
        let mut stream = build_ac3_frame(0x2);
        stream.extend_from_slice(&build_ac3_frame(0x7));

        let mut script = ScriptWriter::new(Vec::new());
        let ctx = Ac3Context::new(&stream, &mut script, Ac3Options::default());
        let err = ctx.process().unwrap_err();
        assert!(err.to_string().contains("acmod"));
        Ok(())
    }

    #[test]
    fn dual_mono_is_rejected() {
        let frame = build_ac3_frame(0x0);

        let mut script = ScriptWriter::new(Vec::new());
        let ctx = Ac3Context::new(&frame, &mut script, Ac3Options::default());
        assert!(ctx.process().is_err());
    }

    #[test]
    fn skipped_leading_frames_are_discarded() -> Result<()> {
        let mut stream = build_ac3_frame(0x2);
        stream.extend_from_slice(&build_ac3_frame(0x2));

        let mut script = ScriptWriter::new(Vec::new());
        let options = Ac3Options {
            skip_first_frames: 1,
            ..Default::default()
        };
        let ctx = Ac3Context::new(&stream, &mut script, options);
        ctx.process()?;

        assert_eq!(script.nb_records(), 1);
        Ok(())
    }
}
