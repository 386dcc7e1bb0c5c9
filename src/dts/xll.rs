//! DTS XLL coding component assembly and the PBR smoothing buffer.
//!
//! XLL coding components are accumulated into the peak bit-rate smoothing
//! buffer. A *PBR frame* is the byte run between two advertised XLL sync
//! offsets; it carries one or more *lossless frames*, each self-sized by its
//! common header. Source file positions are traced through every reslicing
//! so the second pass can emit byte-range copy commands reproducing the
//! reshaped stream without touching audio payload.

use std::collections::VecDeque;

use anyhow::{Result, bail};

use crate::dts::asset::XllComponent;
use crate::dts::extss::CRC_EXT_SS;
use crate::dts::pbr::PbrSmoothingStats;
use crate::utils::bitstream_io::BsIoSliceReader;
use crate::utils::errors::DtsXllError;

/// DTS XLL sync word.
pub const SYNCWORD_XLL: u32 = 0x41A29547;

/// PBR smoothing buffer hard capacity: 240 KiB.
pub const MAX_PBR_BUFFER_SIZE: u32 = 240 << 10;

/// Maximal number of source ranges a frame may be scattered across.
pub const MAX_SOURCE_OFFSETS: usize = 8;

pub const MAX_CHANNEL_SETS: u8 = 3;
pub const MAX_SEGMENTS: u32 = 1024;
pub const MAX_SAMPLES: u32 = 65536;

/// One `(source offset, length)` range.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SourceOffset {
    pub offset: i64,
    pub length: u32,
}

/// Ordered source file position trace of one XLL frame (at most
/// [`MAX_SOURCE_OFFSETS`] ranges, sorted by offset).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct XllFrameSourcePosition {
    ranges: [SourceOffset; MAX_SOURCE_OFFSETS],
    len: usize,
}

impl XllFrameSourcePosition {
    pub fn indexes(&self) -> &[SourceOffset] {
        &self.ranges[..self.len]
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn total_size(&self) -> u64 {
        self.indexes().iter().map(|r| r.length as u64).sum()
    }

    /// Appends a range, failing when the trace is already full.
    pub fn add(&mut self, offset: i64, length: u32) -> Result<()> {
        if self.len >= MAX_SOURCE_OFFSETS {
            bail!(DtsXllError::TooFragmented);
        }

        self.ranges[self.len] = SourceOffset { offset, length };
        self.len += 1;
        Ok(())
    }

    /// Moves up to `amount` bytes from the front of `self` into `dst`,
    /// returning the amount that could not be collected.
    pub fn collect(&mut self, amount: u32, dst: &mut Self) -> Result<u32> {
        let mut remaining = amount;
        let mut consumed = 0;

        for i in 0..self.len {
            if remaining == 0 {
                break;
            }

            let range = &mut self.ranges[i];
            let taken = remaining.min(range.length);

            dst.add(range.offset, taken)?;

            range.offset += taken as i64;
            range.length -= taken;
            remaining -= taken;

            if range.length == 0 {
                consumed += 1;
            }
        }

        self.ranges.copy_within(consumed..self.len, 0);
        self.len -= consumed;

        Ok(remaining)
    }

    /// Logical position of an absolute source offset within the
    /// concatenated trace.
    pub fn relative_offset(&self, absolute: i64) -> Result<u32> {
        let mut logical = 0u32;

        for range in self.indexes() {
            let end = range.offset + range.length as i64;
            if range.offset <= absolute && absolute < end {
                return Ok(logical + (absolute - range.offset) as u32);
            }
            logical += range.length;
        }

        bail!(DtsXllError::OffsetOutsideFrame(absolute))
    }
}

/// A PBR-smoothed frame pending decode in the smoothing buffer.
#[derive(Clone, Copy, Debug, Default)]
pub struct PbrFrame {
    pub number: u32,
    pub size: u32,
    pub position: XllFrameSourcePosition,
    /// Decoding delay in frames; data accumulates while positive.
    pub delay: u32,
}

#[derive(Clone, Copy, Debug, Default)]
struct DecodedFrame {
    number: u32,
    position: XllFrameSourcePosition,
    unpack_started: bool,
}

/// Decoded XLL common header.
#[derive(Clone, Copy, Debug, Default)]
pub struct XllCommonHeader {
    pub version: u8,
    pub header_size: u32,
    pub frame_size: u32,
    pub nb_channel_sets: u8,
    pub nb_segments: u32,
    pub nb_samples_per_segment: u32,
    pub segment_size_field_bits: u8,
    pub band_crc_presence: u8,
    pub scalable_lsbs: bool,
    pub channel_mask_field_bits: u8,
    pub fixed_lsb_width: u8,
    pub header_crc: u16,
}

impl XllCommonHeader {
    fn read(reader: &mut BsIoSliceReader) -> Result<Self> {
        let start = reader.position()?;

        let sync: u32 = reader.get_n(32)?;
        if sync != SYNCWORD_XLL {
            bail!(DtsXllError::BadSyncWord(sync));
        }

        let version_code: u8 = reader.get_n(4)?;
        if version_code > 1 {
            bail!(DtsXllError::UnsupportedVersion(version_code + 1));
        }

        let mut hdr = Self {
            version: version_code + 1,
            header_size: reader.get_n::<u32>(8)? + 1,
            ..Default::default()
        };

        let frame_size_bits = reader.get_n::<u32>(5)? + 1;
        hdr.frame_size = reader.get_n::<u32>(frame_size_bits)? + 1;

        if hdr.frame_size > MAX_PBR_BUFFER_SIZE {
            bail!(DtsXllError::FrameSizeTooLarge(hdr.frame_size));
        }

        hdr.nb_channel_sets = reader.get_n::<u8>(4)? + 1;
        if hdr.nb_channel_sets > MAX_CHANNEL_SETS {
            bail!(DtsXllError::TooManyChannelSets(hdr.nb_channel_sets));
        }

        hdr.nb_segments = 1 << reader.get_n::<u32>(4)?;
        hdr.nb_samples_per_segment = 1 << reader.get_n::<u32>(4)?;

        if hdr.nb_segments > MAX_SEGMENTS
            || hdr.nb_samples_per_segment > 512
            || hdr.nb_segments * hdr.nb_samples_per_segment > MAX_SAMPLES
        {
            bail!(DtsXllError::BadSegmentGeometry {
                segments: hdr.nb_segments,
                samples: hdr.nb_samples_per_segment,
            });
        }

        hdr.segment_size_field_bits = reader.get_n::<u8>(5)? + 1;
        hdr.band_crc_presence = reader.get_n(2)?;
        hdr.scalable_lsbs = reader.get()?;
        hdr.channel_mask_field_bits = reader.get_n::<u8>(5)? + 1;

        if hdr.scalable_lsbs {
            hdr.fixed_lsb_width = reader.get_n(4)?;
        }

        // Reserved field and alignment up to the declared header size, CRC
        // excluded.
        reader.byte_align()?;
        let consumed_bytes = ((reader.position()? - start) / 8) as u32;
        if hdr.header_size < consumed_bytes + 2 {
            bail!(DtsXllError::HeaderOverrun);
        }

        let reserved_bytes = hdr.header_size - 2 - consumed_bytes;
        for _ in 0..reserved_bytes {
            reader.skip_n(8)?;
        }

        let crc_len = reader.position()? - start - 32;
        let crc = reader.crc16_norm_check(&CRC_EXT_SS, start + 32, crc_len)?;

        hdr.header_crc = reader.get_n(16)?;

        if hdr.header_crc != crc {
            bail!(DtsXllError::CrcMismatch {
                calculated: crc,
                read: hdr.header_crc,
            });
        }

        Ok(hdr)
    }
}

/// First channel set sub-header (remaining sets are located but not
/// decoded in detail).
#[derive(Clone, Copy, Debug, Default)]
pub struct XllChannelSetSubHeader {
    pub sub_header_size: u32,
    pub nb_channels: u8,
    pub residual_coding_type: u32,
}

impl XllChannelSetSubHeader {
    fn read(reader: &mut BsIoSliceReader) -> Result<Self> {
        let mut hdr = Self {
            sub_header_size: reader.get_n::<u32>(10)? + 1,
            nb_channels: reader.get_n::<u8>(4)? + 1,
            ..Default::default()
        };

        hdr.residual_coding_type = reader.get_n(hdr.nb_channels as u32)?;

        reader.byte_align()?;
        Ok(hdr)
    }
}

/// The XLL assembler: smoothing buffer, pending and decoded frame FIFOs,
/// and the PBR smoothing statistics.
#[derive(Debug, Default)]
pub struct XllFrameContext {
    pbr_buffer: Vec<u8>,
    /// Active buffer limit from the asset parameters, bytes.
    pbr_buf_size: u32,
    pbr_buf_peak: u32,

    pending_frames: VecDeque<PbrFrame>,
    nb_parsed_pbr_frames: u32,

    decoded_frames: VecDeque<DecodedFrame>,
    nb_decoded_frames: u32,
    nb_sliced_frames: u32,

    pub smoothing: PbrSmoothingStats,
}

impl XllFrameContext {
    /// Maximal buffer fill observed across the stream.
    pub fn peak_buffer_usage(&self) -> u32 {
        self.pbr_buf_peak
    }

    pub fn active_buffer_size(&self) -> u32 {
        self.pbr_buf_size
    }

    /// Updates the active PBR buffer limit from asset parameters.
    pub fn init_from_asset(&mut self, xll: &XllComponent) -> Result<()> {
        if xll.sync_word_present {
            let size = xll.peak_br_buf_size_kib << 10;

            if size > MAX_PBR_BUFFER_SIZE {
                bail!(DtsXllError::FrameSizeTooLarge(size));
            }

            self.pbr_buf_size = self.pbr_buf_size.max(size);
        }

        Ok(())
    }

    /// Ingests one XLL coding component and decodes the frame that became
    /// ready.
    ///
    /// `payload` holds the asset bytes, `payload_offset` their absolute
    /// position in the source file.
    pub fn parse_xll_frame(
        &mut self,
        payload: &[u8],
        payload_offset: i64,
        xll: &XllComponent,
    ) -> Result<()> {
        // Asset boundaries tick the decode delay of every pending frame.
        for frame in &mut self.pending_frames {
            frame.delay = frame.delay.saturating_sub(1);
        }

        let component_size = xll.size;
        if (component_size as usize) > payload.len() {
            bail!(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "XLL component extends past the asset payload",
            ));
        }
        if (component_size as usize) < payload.len() {
            bail!(DtsXllError::TrailingAssetData);
        }

        self.pbr_buffer
            .extend_from_slice(&payload[..component_size as usize]);
        self.pbr_buf_peak = self.pbr_buf_peak.max(self.pbr_buffer.len() as u32);

        if xll.sync_word_present {
            if component_size <= xll.sync_offset {
                bail!(DtsXllError::SyncOffsetOutOfAsset {
                    offset: xll.sync_offset,
                    asset_size: component_size,
                });
            }

            // The prefix before the sync completes the previous frame.
            if let Some(last) = self.pending_frames.back_mut() {
                last.size += xll.sync_offset;
                last.position.add(payload_offset, xll.sync_offset)?;
            } else if xll.sync_offset > 0 {
                bail!(DtsXllError::LeadingGarbage(xll.sync_offset));
            }

            let mut frame = PbrFrame {
                number: self.nb_parsed_pbr_frames,
                size: component_size - xll.sync_offset,
                delay: xll.initial_decoding_delay,
                ..Default::default()
            };
            frame
                .position
                .add(payload_offset + xll.sync_offset as i64, frame.size)?;

            self.nb_parsed_pbr_frames += 1;
            self.pending_frames.push_back(frame);
        } else if let Some(last) = self.pending_frames.back_mut() {
            last.size += component_size;
            last.position.add(payload_offset, component_size)?;
        }

        let Some(head) = self.pending_frames.front() else {
            bail!(DtsXllError::PbrBufferUnderflow);
        };

        if head.delay > 0 {
            bail!(DtsXllError::PbrBufferUnderflow);
        }

        let decoded_size = self.decode_ready_frame()?;

        let head = self.pending_frames.front_mut().expect("head frame");
        if head.size <= decoded_size {
            self.pending_frames.pop_front();
        } else {
            // A further nested lossless frame remains at the head.
            head.size -= decoded_size;
            head.delay = 0;
            head.number = self.nb_parsed_pbr_frames;
            self.nb_parsed_pbr_frames += 1;
        }

        let used = self.pbr_buffer.len() as u32;
        if self.pbr_buf_size != 0 && used > self.pbr_buf_size {
            bail!(DtsXllError::PbrBufferOverflow {
                capacity: self.pbr_buf_size,
                used,
            });
        }

        Ok(())
    }

    /// Decodes the lossless frame at the head of the buffer, registering
    /// its source position trace. Returns the decoded byte count.
    fn decode_ready_frame(&mut self) -> Result<u32> {
        let mut reader = BsIoSliceReader::from_slice(&self.pbr_buffer);

        let common_header = XllCommonHeader::read(&mut reader)?;
        XllChannelSetSubHeader::read(&mut reader)?;

        let frame_size = common_header.frame_size;
        if frame_size as usize > self.pbr_buffer.len() {
            bail!(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "XLL frame extends past the smoothing buffer",
            ));
        }

        let head = self.pending_frames.front_mut().expect("head frame");

        let mut position = XllFrameSourcePosition::default();
        let missing = head.position.collect(frame_size, &mut position)?;
        if missing != 0 {
            bail!(DtsXllError::SliceTooLarge);
        }

        self.decoded_frames.push_back(DecodedFrame {
            number: self.nb_decoded_frames,
            position,
            unpack_started: false,
        });
        self.nb_decoded_frames += 1;

        self.pbr_buffer.drain(..frame_size as usize);

        Ok(frame_size)
    }

    /// Builds a PBR frame of `requested_size` bytes by slicing decoded
    /// frames in order.
    ///
    /// Returns the assembled source position trace, the trace index of the
    /// first range starting a decoded frame (the new sync offset target)
    /// and the initial decoding delay of that frame.
    pub fn slice_pbr_frame(
        &mut self,
        requested_size: u32,
    ) -> Result<(XllFrameSourcePosition, Option<usize>, u32)> {
        let mut position = XllFrameSourcePosition::default();
        let mut sync_index = None;
        let mut decoding_delay = 0;

        let mut remaining = requested_size;
        while remaining > 0 {
            let Some(decoded) = self.decoded_frames.front_mut() else {
                bail!(DtsXllError::SliceTooLarge);
            };

            if !decoded.unpack_started && sync_index.is_none() {
                sync_index = Some(position.indexes().len());
                decoding_delay = decoded.number - self.nb_sliced_frames;
            }

            remaining = decoded.position.collect(remaining, &mut position)?;

            if decoded.position.is_empty() {
                self.decoded_frames.pop_front();
            } else {
                debug_assert_eq!(remaining, 0);
                decoded.unpack_started = true;
            }
        }

        self.nb_sliced_frames += 1;

        Ok((position, sync_index, decoding_delay))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::utils::bitstream_io::BsIoVecWriter;

    /// Builds a valid XLL frame of exactly `size` bytes.
    pub(crate) fn build_xll_frame(size: u32) -> Vec<u8> {
        let build = |crc: u16| -> Vec<u8> {
            let mut w = BsIoVecWriter::default();
            w.put_n(32, SYNCWORD_XLL).unwrap();
            w.put_n(4, 0u8).unwrap(); // version
            w.put_n(8, 13u8).unwrap(); // header size - 1 (14 bytes)
            w.put_n(5, 19u8).unwrap(); // frame size field width - 1 (20 bits)
            w.put_n(20, size - 1).unwrap();
            w.put_n(4, 0u8).unwrap(); // one channel set
            w.put_n(4, 4u8).unwrap(); // 16 segments
            w.put_n(4, 7u8).unwrap(); // 128 samples per segment
            w.put_n(5, 9u8).unwrap(); // segment size field bits
            w.put_n(2, 0u8).unwrap(); // band CRC presence
            w.put(false).unwrap(); // scalable LSBs
            w.put_n(5, 4u8).unwrap(); // channel mask field bits
            // Reserved bits to reach header_size - 2 bytes, then align.
            while w.position() < (14 - 2) * 8 {
                w.put(false).unwrap();
            }
            w.put_n(16, crc).unwrap();
            let mut bytes = w.finish().unwrap();

            // Channel set sub-header.
            let mut w = BsIoVecWriter::default();
            w.put_n(10, 7u16).unwrap(); // sub-header size
            w.put_n(4, 1u8).unwrap(); // two channels
            w.put_n(2, 0u8).unwrap(); // residual coding type
            w.byte_align().unwrap();
            bytes.extend_from_slice(&w.finish().unwrap());

            bytes.resize(size as usize, 0);
            bytes
        };

        let draft = build(0);
        let crc = CRC_EXT_SS.checksum(&draft[4..12]);
        build(crc)
    }

    #[test]
    fn trace_collect_and_relative_offset() -> Result<()> {
        let mut src = XllFrameSourcePosition::default();
        src.add(0x1000, 100)?;
        src.add(0x2000, 50)?;

        let mut dst = XllFrameSourcePosition::default();
        let missing = src.collect(120, &mut dst)?;
        assert_eq!(missing, 0);
        assert_eq!(dst.total_size(), 120);
        assert_eq!(dst.indexes().len(), 2);
        assert_eq!(src.total_size(), 30);
        assert_eq!(src.indexes()[0].offset, 0x2014);

        assert_eq!(dst.relative_offset(0x1000)?, 0);
        assert_eq!(dst.relative_offset(0x2005)?, 105);
        assert!(dst.relative_offset(0x3000).is_err());
        Ok(())
    }

    #[test]
    fn trace_overflow_is_rejected() {
        let mut trace = XllFrameSourcePosition::default();
        for i in 0..MAX_SOURCE_OFFSETS {
            trace.add(i as i64 * 0x100, 16).unwrap();
        }
        assert!(trace.add(0x10000, 16).is_err());
    }

    #[test]
    fn single_pass_frame_assembly() -> Result<()> {
        let frame = build_xll_frame(10_000);

        let xll = XllComponent {
            size: 10_000,
            sync_word_present: true,
            peak_br_buf_size_kib: 240,
            initial_decoding_delay: 0,
            sync_offset: 0,
            ..Default::default()
        };

        let mut ctx = XllFrameContext::default();
        ctx.init_from_asset(&xll)?;
        ctx.parse_xll_frame(&frame, 0x400, &xll)?;

        assert_eq!(ctx.peak_buffer_usage(), 10_000);
        assert_eq!(ctx.nb_decoded_frames, 1);

        // The decoded frame traces back to the asset payload.
        let (position, sync_index, delay) = ctx.slice_pbr_frame(10_000)?;
        assert_eq!(position.total_size(), 10_000);
        assert_eq!(position.indexes()[0].offset, 0x400);
        assert_eq!(sync_index, Some(0));
        assert_eq!(delay, 0);
        Ok(())
    }

    #[test]
    fn out_of_asset_sync_offset_is_rejected() {
        let frame = build_xll_frame(1_000);

        let xll = XllComponent {
            size: 1_000,
            sync_word_present: true,
            sync_offset: 1_000,
            ..Default::default()
        };

        let mut ctx = XllFrameContext::default();
        assert!(ctx.parse_xll_frame(&frame, 0, &xll).is_err());
    }
}
