//! DTS parsing driver: Core and Extension Substream dispatch, access unit
//! assembly, PTS bookkeeping and the two-pass PBR smoothing loop.
//!
//! The first pass validates the stream and records per-frame XLL sizes;
//! when PBR processing is requested a second pass re-slices the XLL payload
//! to the planned sizes, rewriting Extension Substream headers and emitting
//! replacement cells. Single-pass runs copy every access unit through
//! unchanged.

pub mod asset;
pub mod core;
pub mod dtshd;
pub mod extss;
pub mod patcher;
pub mod pbr;
pub mod xll;

use std::io::Write;

use anyhow::{Result, bail};
use log::debug;

use crate::dts::asset::{COD_COMP_EXTSUB_LBR, COD_COMP_EXTSUB_XBR, COD_COMP_EXTSUB_XLL};
use crate::dts::core::{CoreFrameHeader, CoreWarningFlags, SYNCWORD_CORE};
use crate::dts::dtshd::DtshdFileHandler;
use crate::dts::extss::{ExtSSHeader, ExtSSWarningFlags, SYNCWORD_SUBSTREAM};
use crate::dts::pbr::PbrFile;
use crate::dts::xll::{XllFrameContext, XllFrameSourcePosition};
use crate::frame::{AuCellKind, AuContentType, AuFrame, CellReplacement};
use crate::script::{
    AudioFormat, BitDepthCode, SampleRateCode, ScriptWriter, StreamCodingType, StreamProperties,
};
use crate::utils::bitstream_io::BsIoSliceReader;
use crate::utils::errors::{DriverError, DtsExtSSError};

/// 27 MHz system clock.
pub const SYSTEM_CLOCK_HZ: u64 = 27_000_000;

const MAX_EXT_SS_INDEXES: usize = 4;

/// Parsing mode of the input DTS stream.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ParsingMode {
    /// Single pass, no additional processing.
    #[default]
    SinglePass,
    /// First of two passes: check the stream, record PBR statistics.
    TwoPassFirst,
    /// Second pass: build the processed output from the recorded plan.
    TwoPassSecond,
}

impl ParsingMode {
    /// Whether this pass writes script records.
    fn generates_script(self) -> bool {
        matches!(self, ParsingMode::SinglePass | ParsingMode::TwoPassSecond)
    }
}

/// Driver options for a DTS stream.
#[derive(Debug, Default)]
pub struct DtsOptions {
    /// The stream is a secondary audio track.
    pub secondary: bool,
    /// Drop every extension substream, keeping only the Core.
    pub skip_extension_substreams: bool,
    /// Parsed `.dtspbr` statistics enabling two-pass PBR smoothing.
    pub pbr_stats: Option<PbrFile>,
}

#[derive(Debug, Default)]
struct ExtSSContent {
    xll: bool,
    xbr: bool,
    lbr: bool,
    parsed: bool,
    nb_channels: u8,
    sample_rate: u32,
    bit_depth: u8,
}

/// Streaming state of the DTS driver.
pub struct DtsContext<'a, W: Write> {
    input: &'a [u8],
    stream_start: usize,
    stream_end: usize,
    pos: usize,
    script: &'a mut ScriptWriter<W>,
    src_file: u8,
    options: DtsOptions,
    mode: ParsingMode,

    dtshd: Option<DtshdFileHandler>,

    core: Option<CoreFrameHeader>,
    core_warnings: CoreWarningFlags,
    nb_core_frames: u32,

    ext_ss: [Option<Box<ExtSSHeader>>; MAX_EXT_SS_INDEXES],
    ext_ss_warnings: ExtSSWarningFlags,
    nb_ext_frames: u32,
    content: ExtSSContent,

    xll: XllFrameContext,

    cur_au: AuFrame,

    core_samples: u64,
    ext_samples: u64,
    skip_counter: u32,
    skip_current_period: bool,
}

impl<'a, W: Write> DtsContext<'a, W> {
    pub fn new(
        input: &'a [u8],
        script: &'a mut ScriptWriter<W>,
        options: DtsOptions,
    ) -> Result<Self> {
        let src_file = script.add_source_file("es");

        let (dtshd, stream_start, stream_end) = if dtshd::is_dtshd_file(input) {
            let mut handler = DtshdFileHandler::parse(input)?;
            let (start, end) = handler
                .stream_data
                .ok_or(crate::utils::errors::DtshdError::EmptyStreamData)?;

            if let Some(header) = handler.header {
                debug!(
                    "DTS-HD container: Core substream {}, Extension Substream {}, \
                     navigation table {}, PBR smoothing performed {}",
                    header.core_present(),
                    header.ext_ss_present(),
                    header.navigation_table_present(),
                    header.pbrs_performed(),
                );

                if header.ext_ss_present()
                    && !header.pbrs_performed()
                    && options.pbr_stats.is_none()
                {
                    handler.warn_missing_pbr_stats();
                }
            }

            (Some(handler), start, end)
        } else {
            (None, 0, input.len())
        };

        let mode = if options.pbr_stats.is_some() {
            ParsingMode::TwoPassFirst
        } else {
            ParsingMode::SinglePass
        };

        Ok(Self {
            input,
            stream_start,
            stream_end,
            pos: stream_start,
            script,
            src_file,
            options,
            mode,
            dtshd,
            core: None,
            core_warnings: CoreWarningFlags::default(),
            nb_core_frames: 0,
            ext_ss: Default::default(),
            ext_ss_warnings: ExtSSWarningFlags::default(),
            nb_ext_frames: 0,
            content: ExtSSContent::default(),
            xll: XllFrameContext::default(),
            cur_au: AuFrame::default(),
            core_samples: 0,
            ext_samples: 0,
            skip_counter: 0,
            skip_current_period: false,
        })
    }

    pub fn parsing_mode(&self) -> ParsingMode {
        self.mode
    }

    pub fn nb_core_frames(&self) -> u32 {
        self.nb_core_frames
    }

    pub fn nb_ext_frames(&self) -> u32 {
        self.nb_ext_frames
    }

    pub fn xll_peak_buffer_usage(&self) -> u32 {
        self.xll.peak_buffer_usage()
    }

    fn fast_second_pass(&self) -> bool {
        self.mode == ParsingMode::TwoPassSecond
    }

    fn init_pass(&mut self) -> Result<()> {
        self.pos = self.stream_start;
        self.core = None;
        self.nb_core_frames = 0;
        self.ext_ss = Default::default();
        self.nb_ext_frames = 0;
        self.cur_au.discard_all();
        self.core_samples = 0;
        self.ext_samples = 0;
        self.skip_current_period = false;
        self.skip_counter = self
            .dtshd
            .as_ref()
            .map(|handler| handler.initial_delay_frames())
            .unwrap_or(0);
        Ok(())
    }

    /// Runs every required pass over the input and closes the stream
    /// properties.
    pub fn process(mut self) -> Result<()> {
        loop {
            self.init_pass()?;

            if self.fast_second_pass() {
                if !self.content.xll {
                    bail!(DriverError::PbrWithoutXll);
                }

                // Compute the smoothing plan from the first-pass records.
                if let Some(handler) = &self.dtshd {
                    self.xll.smoothing.max_buffer_size =
                        handler.pbr_smoothing_buf_size_kib()? << 10;
                }
                self.xll
                    .smoothing
                    .compute(self.options.pbr_stats.as_ref())?;
            }

            self.parse_pass()?;

            match self.mode {
                ParsingMode::TwoPassFirst => {
                    self.mode = ParsingMode::TwoPassSecond;
                }
                _ => break,
            }
        }

        self.set_script_properties()
    }

    fn parse_pass(&mut self) -> Result<()> {
        while self.pos < self.stream_end {
            if self.stream_end - self.pos < 4 {
                bail!(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "truncated DTS frame sync word",
                ));
            }

            let sync = u32::from_be_bytes(
                self.input[self.pos..self.pos + 4].try_into().unwrap(),
            );

            match sync {
                SYNCWORD_CORE => self.decode_core()?,
                SYNCWORD_SUBSTREAM => self.decode_ext_ss()?,
                sync => bail!(DriverError::UnknownSyncWord(sync)),
            }

            self.complete_frame()?;
        }

        Ok(())
    }

    fn decode_core(&mut self) -> Result<()> {
        let start = self.pos;

        let mut reader = BsIoSliceReader::from_slice(&self.input[start..self.stream_end]);
        let header = CoreFrameHeader::read(&mut reader)?;
        header.payload_size()?;

        let frame_length = header.frame_length as usize;
        if start + frame_length > self.stream_end {
            bail!(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "truncated Core substream frame",
            ));
        }

        self.pos = start + frame_length;

        // Delay trimming: discard whole periods while counting positions.
        self.skip_current_period = self.skip_counter > 0;
        if self.skip_current_period {
            self.skip_counter -= 1;
            return Ok(());
        }

        if let Some(reference) = &self.core {
            if !self.fast_second_pass() {
                header.check_constant(reference)?;
            }
        } else {
            header.check_compliance(self.options.secondary, &mut self.core_warnings)?;
        }

        self.core = Some(header);
        self.nb_core_frames += 1;

        self.cur_au.begin_cell(AuCellKind::CoreSS)?;
        self.cur_au
            .set_source_range(start as u64, frame_length as u32)?;
        self.cur_au.commit_cell()?;

        Ok(())
    }

    fn decode_ext_ss(&mut self) -> Result<()> {
        let start = self.pos;
        let ignore = self.options.skip_extension_substreams || self.skip_current_period;

        let mut reader = BsIoSliceReader::from_slice(&self.input[start..self.stream_end]);
        let header = ExtSSHeader::read(&mut reader)?;

        let frame_size = header.frame_size as usize;
        if start + frame_size > self.stream_end {
            bail!(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "truncated Extension Substream frame",
            ));
        }

        let mut asset_trace: Option<XllFrameSourcePosition> = None;

        if !ignore {
            header.check_compliance(self.options.secondary, &mut self.ext_ss_warnings)?;

            self.cur_au.begin_cell(AuCellKind::ExtSSHeader)?;
            self.cur_au
                .set_source_range(start as u64, header.header_size)?;

            if self.fast_second_pass() && self.content.xll {
                let (patched, trace) = self.patch_ext_ss_header(&header)?;
                self.cur_au
                    .replace_with(CellReplacement::ExtSSHeader(Box::new(patched)))?;
                asset_trace = Some(trace);
            }

            self.cur_au.commit_cell()?;
        }

        // Extension substream assets.
        let nb_assets = header.nb_audio_assets();
        let mut asset_start = start + header.header_size as usize;

        for asset_id in 0..nb_assets {
            let asset_size = header.asset_sizes[asset_id] as usize;
            let descriptor = &header.assets[asset_id];

            if asset_start + asset_size > self.stream_end {
                bail!(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "truncated Extension Substream asset",
                ));
            }

            if !ignore {
                if !self.content.parsed {
                    if let Some(sf) = &descriptor.static_fields {
                        self.content.nb_channels = sf.nb_channels;
                        self.content.sample_rate = sf.max_sample_rate();
                        self.content.bit_depth = sf.bit_depth;
                        self.content.parsed = true;
                    }
                }

                let mask = descriptor.dec_nav.coding_components_mask;
                if mask & COD_COMP_EXTSUB_XLL != 0 {
                    if asset_id != 0 {
                        bail!(DtsExtSSError::XllAssetNotFirst);
                    }
                    self.content.xll = true;
                }
                if mask & COD_COMP_EXTSUB_XBR != 0 {
                    self.content.xbr = true;
                }
                if mask & COD_COMP_EXTSUB_LBR != 0 {
                    self.content.lbr = true;
                }

                self.cur_au.begin_cell(AuCellKind::ExtSSAsset)?;
                self.cur_au
                    .set_source_range(asset_start as u64, asset_size as u32)?;

                if let Some(trace) = &asset_trace {
                    // Replace only when the PBR plan moved the payload.
                    let identity = trace.indexes().len() == 1
                        && trace.indexes()[0].offset == asset_start as i64
                        && trace.indexes()[0].length == asset_size as u32;

                    if !identity {
                        self.cur_au
                            .replace_with(CellReplacement::ExtSSAsset(*trace))?;
                    }
                }

                if !self.fast_second_pass() {
                    if let Some(xll_params) = descriptor.dec_nav.xll {
                        self.xll.init_from_asset(&xll_params)?;

                        let payload = &self.input[asset_start..asset_start + asset_size];
                        self.xll
                            .parse_xll_frame(payload, asset_start as i64, &xll_params)?;

                        if self.mode == ParsingMode::TwoPassFirst {
                            let timestamp_ms = self.ext_samples * 1000 / 48_000;
                            self.xll.smoothing.save_frame_size(
                                self.nb_ext_frames as usize,
                                timestamp_ms,
                                xll_params.size,
                            )?;
                        }
                    }
                }

                self.cur_au.commit_cell()?;
            }

            asset_start += asset_size;
        }

        if !ignore {
            if !self.fast_second_pass() && asset_start - start != frame_size {
                bail!(DtsExtSSError::FrameSizeMismatch {
                    parsed: (asset_start - start) as u64,
                    expected: frame_size as u64,
                });
            }

            let index = (header.ext_ss_index & 0x3) as usize;
            self.ext_ss[index] = Some(Box::new(header));
            self.nb_ext_frames += 1;
        }

        self.pos = start + frame_size;

        Ok(())
    }

    /// Builds the rewritten header and the re-sliced asset trace for the
    /// current Extension Substream frame of the second pass.
    fn patch_ext_ss_header(
        &mut self,
        header: &ExtSSHeader,
    ) -> Result<(ExtSSHeader, XllFrameSourcePosition)> {
        const XLL_ASSET_ID: usize = 0;

        let target_size = self.xll.smoothing.target_size(self.nb_ext_frames as usize)?;

        let pbr_buf_kib = self
            .dtshd
            .as_ref()
            .ok_or(crate::utils::errors::DtshdError::MissingExtMetadata)?
            .pbr_smoothing_buf_size_kib()?;

        let (trace, sync_index, decoding_delay) = self.xll.slice_pbr_frame(target_size)?;

        let (sync_present, sync_offset) = match sync_index {
            Some(index) => (
                true,
                trace.relative_offset(trace.indexes()[index].offset)?,
            ),
            None => (false, 0),
        };

        debug!(
            "PBR frame {}: {} bytes, sync at {:?}, delay {}",
            self.nb_ext_frames, target_size, sync_index, decoding_delay
        );

        let mut patched = header.clone();
        patcher::update_xll_parameters(
            &mut patched,
            XLL_ASSET_ID,
            sync_present,
            decoding_delay,
            sync_offset,
            pbr_buf_kib,
            target_size,
        )?;

        Ok((patched, trace))
    }

    /// Computes the PTS of the completed access unit and hands it to the
    /// script, or records statistics on the first pass.
    fn complete_frame(&mut self) -> Result<()> {
        let pts = match self.cur_au.content_type() {
            AuContentType::Empty => {
                self.cur_au.discard_all();
                return Ok(());
            }
            AuContentType::CoreSS => {
                let header = self.core.as_ref().expect("core header");
                let pts = self.core_samples * SYSTEM_CLOCK_HZ / header.sample_rate as u64;
                self.core_samples += header.blocks_per_channel as u64
                    * header.samples_per_block as u64;
                pts
            }
            AuContentType::ExtSS => {
                let frame_duration = self
                    .ext_ss
                    .iter()
                    .flatten()
                    .next()
                    .and_then(|hdr| hdr.static_fields.as_ref())
                    .map(|sf| sf.frame_duration() as u64)
                    .unwrap_or(512);
                let pts = self.ext_samples * SYSTEM_CLOCK_HZ / 48_000;
                self.ext_samples += frame_duration;
                pts
            }
        };

        if self.mode.generates_script() {
            self.cur_au.finalize(self.script, self.src_file, pts)?;
        } else {
            self.cur_au.discard_all();
        }

        Ok(())
    }

    fn set_script_properties(&mut self) -> Result<()> {
        let ext_present = self.nb_ext_frames > 0 || self.content.parsed;
        let core_present = self.core.is_some();

        let (coding_type, bitrate) = if ext_present && self.content.xll {
            (StreamCodingType::DtsHdMa, 24_500_000)
        } else if ext_present && self.content.xbr {
            (StreamCodingType::DtsHdHr, 24_500_000)
        } else if ext_present && self.content.lbr {
            (StreamCodingType::DtsExpress, 256_000)
        } else if core_present {
            (StreamCodingType::Dts, 2_000_000)
        } else {
            bail!(DriverError::EmptyStream);
        };

        let properties = if let Some(core) = &self.core {
            StreamProperties {
                coding_type,
                audio_format: match core.amode {
                    0x0 => AudioFormat::Mono,
                    0x1 => AudioFormat::DualMono,
                    0x2..=0x4 => AudioFormat::Stereo,
                    _ => AudioFormat::MultiChannel,
                },
                sample_rate: SampleRateCode::from_rate(core.sample_rate),
                bit_depth: BitDepthCode::from_depth(core.bit_depth),
                channel_mask: self
                    .dtshd
                    .as_ref()
                    .and_then(|handler| handler.core_metadata)
                    .map(|meta| meta.channel_mask)
                    .unwrap_or(0),
                bitrate,
                last_pts: self.core_samples * SYSTEM_CLOCK_HZ / core.sample_rate as u64,
            }
        } else {
            if !self.content.parsed {
                bail!(DriverError::MissingProperties);
            }

            StreamProperties {
                coding_type,
                audio_format: match self.content.nb_channels {
                    0 | 1 => AudioFormat::Mono,
                    2 => AudioFormat::Stereo,
                    _ => AudioFormat::MultiChannel,
                },
                sample_rate: SampleRateCode::from_rate(self.content.sample_rate),
                bit_depth: BitDepthCode::from_depth(self.content.bit_depth as u32),
                channel_mask: 0,
                bitrate,
                last_pts: self.ext_samples * SYSTEM_CLOCK_HZ / 48_000,
            }
        };

        self.script.set_properties(properties);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dts::core::tests::build_core_frame_header;
    use crate::dts::patcher::tests::build_test_header;
    use crate::dts::xll::tests::build_xll_frame;

    fn build_core_frame() -> Vec<u8> {
        let mut frame = build_core_frame_header();
        frame.resize(2013, 0);
        frame
    }

    /// One complete ExtSS frame wrapping one XLL frame of `size` bytes.
    fn build_ext_ss_frame(size: u32, delay: u32) -> Vec<u8> {
        let mut header = build_test_header(size);
        if let Some(xll) = &mut header.assets[0].dec_nav.xll {
            xll.initial_decoding_delay = delay;
        }
        let header_size = patcher::compute_header_size(&header).unwrap() as u32;
        header.header_size = header_size;
        header.frame_size = header_size + size;

        let mut frame = patcher::build_ext_ss_header(&header).unwrap();
        frame.extend_from_slice(&build_xll_frame(size));
        frame
    }

    #[test]
    fn core_single_frame_emits_one_record() -> Result<()> {
        let stream = build_core_frame();

        let mut script = ScriptWriter::new(Vec::new());
        let ctx = DtsContext::new(&stream, &mut script, DtsOptions::default())?;
        ctx.process()?;

        assert_eq!(script.nb_records(), 1);
        Ok(())
    }

    #[test]
    fn ext_ss_single_pass_is_copied_through() -> Result<()> {
        let stream = build_ext_ss_frame(10_000, 0);

        let mut script = ScriptWriter::new(Vec::new());
        let mut ctx = DtsContext::new(&stream, &mut script, DtsOptions::default())?;
        ctx.parse_pass()?;
        assert_eq!(ctx.xll_peak_buffer_usage(), 10_000);
        assert_eq!(ctx.nb_core_frames(), 0);
        assert_eq!(ctx.nb_ext_frames(), 1);
        ctx.set_script_properties()?;
        drop(ctx);

        assert_eq!(script.nb_records(), 1);
        Ok(())
    }

    #[test]
    fn ext_ss_index_one_is_rejected() -> Result<()> {
        let mut header = build_test_header(1_000);
        header.ext_ss_index = 1;

        let bytes = patcher::build_ext_ss_header(&header)?;
        let mut reader = BsIoSliceReader::from_slice(&bytes);
        let parsed = ExtSSHeader::read(&mut reader)?;

        let mut warnings = ExtSSWarningFlags::default();
        assert!(parsed.check_compliance(false, &mut warnings).is_err());
        Ok(())
    }

    #[test]
    fn two_pass_smoothing_rewrites_headers() -> Result<()> {
        let mut stream = Vec::new();
        for (size, delay) in [(10_000, 0), (80_000, 0), (60_000, 0)] {
            stream.extend_from_slice(&build_ext_ss_frame(size, delay));
        }
        let container = dtshd::tests::build_container(&stream, 128);

        let pbr_stats = PbrFile::parse("24\n00:00:00:00,50000\n")?;

        let mut script = ScriptWriter::new(Vec::new());
        let options = DtsOptions {
            pbr_stats: Some(pbr_stats),
            ..Default::default()
        };
        let ctx = DtsContext::new(&container, &mut script, options)?;
        ctx.process()?;

        // Three PES records with rewritten headers and re-sliced assets.
        assert_eq!(script.nb_records(), 3);

        let bytes = script.finish()?;
        assert!(!bytes.is_empty());
        Ok(())
    }
}
