//! DCA Core substream frame header parsing and BDAV checks.
//!
//! Only the header is decoded; the payload is located and copied through.
//! Parameters that shape the decoded output must stay constant across the
//! stream.

use anyhow::{Result, anyhow, bail};
use log::warn;

use crate::utils::bitstream_io::BsIoSliceReader;
use crate::utils::errors::DtsCoreError;

/// DCA Core substream sync word.
pub const SYNCWORD_CORE: u32 = 0x7FFE8001;

/// Maximal supported encoder software revision.
pub const MAX_SYNTAX_VERNUM: u8 = 0x7;

const AMODE_NB_CHANNELS: [u32; 16] = [1, 2, 2, 2, 2, 3, 3, 4, 4, 5, 6, 6, 6, 7, 8, 8];

/// Channel count of a Core channel arrangement code, user-defined modes
/// excluded.
pub fn amode_nb_channels(amode: u8) -> u32 {
    AMODE_NB_CHANNELS.get(amode as usize).copied().unwrap_or(0)
}

fn sample_rate(sfreq: u8) -> u32 {
    match sfreq {
        0x1 => 8_000,
        0x2 => 16_000,
        0x3 => 32_000,
        0x6 => 11_025,
        0x7 => 22_050,
        0x8 => 44_100,
        0xB => 12_000,
        0xC => 24_000,
        0xD => 48_000,
        _ => 0,
    }
}

/// Transmission bitrate in kbps, 0 for reserved codes, 1 for open rate.
fn bitrate(rate: u8) -> u32 {
    const RATES: [u32; 25] = [
        32, 56, 64, 96, 112, 128, 192, 224, 256, 320, 384, 448, 512, 576, 640, 768, 960, 1024,
        1152, 1280, 1344, 1408, 1411, 1472, 1536,
    ];

    match rate {
        0x00..=0x18 => RATES[rate as usize],
        0x1D => 1,
        _ => 0,
    }
}

fn pcm_resolution(pcmr: u8) -> (u32, bool) {
    // Bit depth and ES flag pairs.
    match pcmr {
        0x0 => (16, false),
        0x1 => (16, true),
        0x2 => (20, false),
        0x3 => (20, true),
        0x5 => (24, false),
        0x6 => (24, true),
        _ => (0, false),
    }
}

/// One-shot warning flags of the Core substream.
#[derive(Debug, Default)]
pub struct CoreWarningFlags {
    pub deprecated_crc: bool,
    pub hdcd_encoding: bool,
}

/// Decoded Core sync frame header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CoreFrameHeader {
    pub termination_frame: bool,
    /// SHORT + 1.
    pub samples_per_block: u8,
    pub crc_present: bool,
    pub crc_value: u16,
    /// NBLKS + 1.
    pub blocks_per_channel: u8,
    /// FSIZE + 1, bytes.
    pub frame_length: u16,
    pub amode: u8,
    pub sfreq: u8,
    pub rate: u8,
    pub aux_data: bool,
    pub hdcd: bool,
    pub ext_audio_id: u8,
    pub ext_audio: bool,
    pub lfe: u8,
    pub pcmr: u8,
    pub vernum: u8,
    pub dialnorm_code: u8,

    pub nb_channels: u32,
    pub sample_rate: u32,
    pub bitrate_kbps: u32,
    pub bit_depth: u32,
    pub is_es: bool,
    /// Header size in bytes, sync word included.
    pub header_size: u32,
}

impl CoreFrameHeader {
    pub fn read(reader: &mut BsIoSliceReader) -> Result<Self> {
        let start = reader.position()?;

        let sync: u32 = reader.get_n(32)?;
        if sync != SYNCWORD_CORE {
            bail!(DtsCoreError::BadSyncWord(sync));
        }

        // FTYPE: 1 = normal frame, 0 = termination frame.
        let mut hdr = Self {
            termination_frame: !reader.get()?,
            samples_per_block: reader.get_n::<u8>(5)? + 1,
            crc_present: reader.get()?,
            blocks_per_channel: reader.get_n::<u8>(7)? + 1,
            frame_length: reader.get_n::<u16>(14)? + 1,
            amode: reader.get_n(6)?,
            sfreq: reader.get_n(4)?,
            rate: reader.get_n(5)?,
            ..Default::default()
        };

        // FixedBit
        if reader.get()? {
            bail!(DtsCoreError::ReservedRate(hdr.rate));
        }

        reader.skip_n(2)?; // DYNF, TIMEF
        hdr.aux_data = reader.get()?;
        hdr.hdcd = reader.get()?;
        hdr.ext_audio_id = reader.get_n(3)?;
        hdr.ext_audio = reader.get()?;
        reader.skip_n(1)?; // ASPF
        hdr.lfe = reader.get_n(2)?;
        reader.skip_n(1)?; // HFLAG

        if hdr.crc_present {
            hdr.crc_value = reader.get_n(16)?;
        }

        reader.skip_n(1)?; // FILTS
        hdr.vernum = reader.get_n(4)?;

        if hdr.vernum > MAX_SYNTAX_VERNUM {
            bail!(DtsCoreError::UnsupportedVernum(hdr.vernum));
        }

        reader.skip_n(2)?; // CHIST
        hdr.pcmr = reader.get_n(3)?;
        reader.skip_n(2)?; // SUMF, SUMS

        if hdr.vernum == 0x6 || hdr.vernum == 0x7 {
            hdr.dialnorm_code = reader.get_n(4)?;
        } else {
            reader.skip_n(4)?;
        }

        reader.byte_align()?;

        hdr.nb_channels = amode_nb_channels(hdr.amode) + (hdr.lfe != 0) as u32;
        hdr.sample_rate = sample_rate(hdr.sfreq);
        hdr.bitrate_kbps = bitrate(hdr.rate);
        let (bit_depth, is_es) = pcm_resolution(hdr.pcmr);
        hdr.bit_depth = bit_depth;
        hdr.is_es = is_es;
        hdr.header_size = ((reader.position()? - start) / 8) as u32;

        Ok(hdr)
    }

    /// Payload length after the header, in bytes.
    pub fn payload_size(&self) -> Result<u32> {
        let payload = self.frame_length as i64 - self.header_size as i64;
        if payload < 0 {
            bail!(DtsCoreError::NegativePayloadSize(payload));
        }
        Ok(payload as u32)
    }

    pub fn check_compliance(
        &self,
        secondary: bool,
        warnings: &mut CoreWarningFlags,
    ) -> Result<()> {
        if !self.termination_frame && self.samples_per_block != 32 {
            bail!(DtsCoreError::ShortNormalFrame(self.samples_per_block));
        }

        if self.crc_present && !warnings.deprecated_crc {
            warn!("Presence of the deprecated DCA CRC field");
            warnings.deprecated_crc = true;
        }

        if self.blocks_per_channel < 6 {
            bail!(DtsCoreError::NblksRange(self.blocks_per_channel - 1));
        }

        if !self.termination_frame
            && (self.blocks_per_channel & 0x7 != 0
                || self.blocks_per_channel & (self.blocks_per_channel - 1) != 0)
        {
            bail!(DtsCoreError::NblksNormalFrame(self.blocks_per_channel));
        }

        if self.frame_length < 96 {
            bail!(DtsCoreError::FsizeRange(self.frame_length - 1));
        }

        if self.sample_rate == 0 {
            bail!(DtsCoreError::ReservedSfreq(self.sfreq));
        }

        if self.sample_rate != 48_000 {
            bail!(DtsCoreError::SampleRateNot48kHz(self.sample_rate));
        }

        match self.bitrate_kbps {
            0 => bail!(DtsCoreError::ReservedRate(self.rate)),
            1 => bail!(DtsCoreError::OpenRateForbidden),
            _ => {}
        }

        if secondary && self.amode == 0x0 {
            bail!(DtsCoreError::DualMonoForbidden);
        }

        if self.hdcd && !warnings.hdcd_encoding {
            warn!("Usage of HDCD encoding");
            warnings.hdcd_encoding = true;
        }

        Ok(())
    }

    /// Parameters that must not change between frames.
    pub fn check_constant(&self, reference: &Self) -> Result<()> {
        let field = if self.amode != reference.amode {
            Some("AMODE")
        } else if self.sfreq != reference.sfreq {
            Some("SFREQ")
        } else if self.pcmr != reference.pcmr {
            Some("PCMR")
        } else if self.rate != reference.rate {
            Some("RATE")
        } else if self.lfe != reference.lfe {
            Some("LFF")
        } else if self.ext_audio != reference.ext_audio
            || self.ext_audio_id != reference.ext_audio_id
        {
            Some("EXT_AUDIO")
        } else if self.vernum != reference.vernum {
            Some("VERNUM")
        } else {
            None
        };

        match field {
            Some(field) => Err(anyhow!(DtsCoreError::NonCompliantChange { field })),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::utils::bitstream_io::BsIoVecWriter;

    /// 5.1 48 kHz 1509.75 kbps termination frame, FSIZE 2012.
    pub(crate) fn build_core_frame_header() -> Vec<u8> {
        build_core_frame_header_with_fsize(2012)
    }

    pub(crate) fn build_core_frame_header_with_fsize(fsize: u16) -> Vec<u8> {
        let mut w = BsIoVecWriter::default();
        w.put_n(32, SYNCWORD_CORE).unwrap();
        w.put(false).unwrap(); // FTYPE: termination
        w.put_n(5, 31u8).unwrap(); // SHORT
        w.put(false).unwrap(); // CPF
        w.put_n(7, 15u8).unwrap(); // NBLKS
        w.put_n(14, fsize).unwrap(); // FSIZE
        w.put_n(6, 9u8).unwrap(); // AMODE: C L R Ls Rs
        w.put_n(4, 0xDu8).unwrap(); // SFREQ: 48 kHz
        w.put_n(5, 0x18u8).unwrap(); // RATE: 1536 kbps class
        w.put(false).unwrap(); // FixedBit
        w.put(false).unwrap(); // DYNF
        w.put(false).unwrap(); // TIMEF
        w.put(false).unwrap(); // AUXF
        w.put(false).unwrap(); // HDCD
        w.put_n(3, 0u8).unwrap(); // EXT_AUDIO_ID
        w.put(false).unwrap(); // EXT_AUDIO
        w.put(false).unwrap(); // ASPF
        w.put_n(2, 1u8).unwrap(); // LFF
        w.put(false).unwrap(); // HFLAG
        w.put(false).unwrap(); // FILTS
        w.put_n(4, 0x7u8).unwrap(); // VERNUM
        w.put_n(2, 0u8).unwrap(); // CHIST
        w.put_n(3, 0x5u8).unwrap(); // PCMR: 24 bits
        w.put(false).unwrap(); // SUMF
        w.put(false).unwrap(); // SUMS
        w.put_n(4, 0u8).unwrap(); // DIALNORM
        w.byte_align().unwrap();
        w.finish().unwrap()
    }

    #[test]
    fn termination_frame_header_parses() -> Result<()> {
        let data = build_core_frame_header();
        let mut reader = BsIoSliceReader::from_slice(&data);

        let hdr = CoreFrameHeader::read(&mut reader)?;
        assert_eq!(hdr.samples_per_block, 32);
        assert_eq!(hdr.blocks_per_channel, 16);
        assert_eq!(hdr.frame_length, 2013);
        assert_eq!(hdr.nb_channels, 6);
        assert_eq!(hdr.sample_rate, 48_000);
        assert_eq!(hdr.bit_depth, 24);

        let mut warnings = CoreWarningFlags::default();
        hdr.check_compliance(false, &mut warnings)?;
        Ok(())
    }

    #[test]
    fn small_fsize_is_rejected() {
        // FSIZE field 94 decodes to a 95-byte frame, below the minimum.
        let data = build_core_frame_header_with_fsize(94);

        let mut reader = BsIoSliceReader::from_slice(&data);
        let hdr = CoreFrameHeader::read(&mut reader).unwrap();
        let mut warnings = CoreWarningFlags::default();
        assert!(hdr.check_compliance(false, &mut warnings).is_err());
    }

    #[test]
    fn amode_change_is_rejected() -> Result<()> {
        let data = build_core_frame_header();
        let mut reader = BsIoSliceReader::from_slice(&data);
        let first = CoreFrameHeader::read(&mut reader)?;

        let mut second = first;
        second.amode = 0x7;
        assert!(second.check_constant(&first).is_err());
        Ok(())
    }
}
