//! AC-3 synchronization information.
//!
//! The sync frame opens with the 0x0B77 sync word, the CRC1 word covering
//! the first 5/8 of the frame, the sample rate code and the frame size code
//! giving both nominal bitrate and frame size.

use anyhow::{Result, bail};

use crate::utils::bitstream_io::BsIoSliceReader;
use crate::utils::errors::Ac3Error;

/// AC-3 family sync word.
pub const AC3_SYNCWORD: u16 = 0x0B77;

/// Minimal allowed AC-3 nominal bitrate under BDAV, in kbps.
pub const BDAV_AC3_MINIMAL_BITRATE: u32 = 96;

/// Nominal bitrates in kbps, indexed by `frmsizecod >> 1`.
const FRMSIZECOD_BITRATES: [u32; 19] = [
    32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 448, 512, 576, 640,
];

/// Nominal bitrate in kbps for a frame size code, zero for reserved codes.
pub fn nominal_bitrate(frmsizecod: u8) -> u32 {
    FRMSIZECOD_BITRATES
        .get((frmsizecod >> 1) as usize)
        .copied()
        .unwrap_or(0)
}

/// Frame size in 16-bit words for a frame size / sample rate code pair.
pub fn frame_size_words(frmsizecod: u8, fscod: u8) -> u32 {
    let bitrate = nominal_bitrate(frmsizecod);
    match fscod {
        0x0 => bitrate * 2,                                       // 48 kHz
        0x1 => bitrate * 320 / 147 + (frmsizecod & 1) as u32,     // 44.1 kHz
        _ => bitrate * 3,                                         // 32 kHz
    }
}

/// Decoded `syncinfo()` of one AC-3 sync frame.
#[derive(Clone, Copy, Debug, Default)]
pub struct Ac3SyncInfo {
    pub crc1: u16,
    pub fscod: u8,
    pub frmsizecod: u8,

    pub sample_rate: u32,
    pub bitrate: u32,
    /// Frame size in bytes.
    pub frame_size: u32,
}

impl Ac3SyncInfo {
    pub fn read(reader: &mut BsIoSliceReader) -> Result<Self> {
        let syncword: u16 = reader.get_n(16)?;
        if syncword != AC3_SYNCWORD {
            bail!(Ac3Error::BadSyncWord(syncword));
        }

        let mut si = Self {
            crc1: reader.get_n(16)?,
            fscod: reader.get_n(2)?,
            frmsizecod: reader.get_n(6)?,
            ..Default::default()
        };

        si.sample_rate = match si.fscod {
            0x0 => 48_000,
            0x1 => 44_100,
            0x2 => 32_000,
            code => bail!(Ac3Error::ReservedFscod(code)),
        };

        si.bitrate = nominal_bitrate(si.frmsizecod);
        if si.bitrate == 0 {
            bail!(Ac3Error::ReservedFrmsizecod(si.frmsizecod));
        }

        si.frame_size = frame_size_words(si.frmsizecod, si.fscod) * 2;

        Ok(si)
    }

    pub fn check_bdav_compliance(&self) -> Result<()> {
        if self.fscod != 0x0 {
            bail!(Ac3Error::SampleRateNot48kHz {
                fscod: self.fscod,
                fscod2: 0,
            });
        }

        if self.bitrate < BDAV_AC3_MINIMAL_BITRATE {
            bail!(Ac3Error::NonCompliantChange {
                field: "bitrate below the BDAV minimum",
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_for_common_bitrates() {
        // 192 kbps at 48 kHz: 384 words, 768 bytes.
        assert_eq!(nominal_bitrate(0x14), 192);
        assert_eq!(frame_size_words(0x14, 0x0), 384);

        // 640 kbps at 48 kHz: 1280 words.
        assert_eq!(nominal_bitrate(0x24), 640);
        assert_eq!(frame_size_words(0x24, 0x0), 1280);

        // 44.1 kHz frames gain one padding word on odd codes.
        assert_eq!(
            frame_size_words(0x15, 0x1),
            frame_size_words(0x14, 0x1) + 1
        );
    }

    #[test]
    fn reserved_frmsizecod_is_rejected() {
        let data = [0x0B, 0x77, 0x00, 0x00, 0x26];
        let mut reader = BsIoSliceReader::from_slice(&data);
        // fscod 0, frmsizecod 0x26 (reserved).
        assert!(Ac3SyncInfo::read(&mut reader).is_err());
    }

    #[test]
    fn bad_sync_word_is_rejected() {
        let data = [0x0B, 0x78, 0x00, 0x00, 0x28];
        let mut reader = BsIoSliceReader::from_slice(&data);
        assert!(Ac3SyncInfo::read(&mut reader).is_err());
    }
}
