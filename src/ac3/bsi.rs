//! AC-3 and E-AC-3 bit stream information.
//!
//! Legacy AC-3 (`bsid <= 8`) and Enhanced AC-3 (`bsid == 16`) use distinct
//! BSI syntaxes sharing the additional-BSI tail, whose only recognized
//! content is the EC3 type A extension carrying the Atmos object complexity
//! index.

use anyhow::{Result, anyhow, bail};
use log::{info, warn};

use crate::utils::bitstream_io::BsIoSliceReader;
use crate::utils::errors::Ac3Error;

/// Acmod 0x0: 1+1 duplicated mono.
pub const ACMOD_DUAL_MONO: u8 = 0x0;

/// Acmod 0x2: 2/0 stereo.
pub const ACMOD_STEREO: u8 = 0x2;

const ACMOD_NB_CHANNELS: [u32; 8] = [2, 1, 2, 3, 3, 4, 4, 5];

/// Full-bandwidth channel count for an audio coding mode, LFE included.
pub fn nb_channels(acmod: u8, lfeon: bool) -> u32 {
    ACMOD_NB_CHANNELS[(acmod & 0x7) as usize] + lfeon as u32
}

fn three_front_channels(acmod: u8) -> bool {
    acmod & 0x1 != 0 && acmod > ACMOD_STEREO
}

fn surround_present(acmod: u8) -> bool {
    acmod >= 0x4
}

/// Channel counts of the 16 `chanmap` groups, MSB first.
const CHANMAP_GROUP_SIZES: [u32; 16] = [1, 1, 1, 1, 1, 2, 2, 1, 1, 2, 2, 2, 1, 2, 1, 1];

fn chanmap_nb_channels(chanmap: u16) -> u32 {
    CHANMAP_GROUP_SIZES
        .iter()
        .enumerate()
        .map(|(i, n)| n * ((chanmap as u32 >> (15 - i)) & 1))
        .sum()
}

/// Additional BSI content classification.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Addbsi {
    #[default]
    Unknown,
    /// EC3 extension type A: Atmos object complexity index.
    Ec3ExtensionTypeA { complexity_index: u8 },
}

impl Addbsi {
    pub fn read(reader: &mut BsIoSliceReader) -> Result<Self> {
        let addbsil: u8 = reader.get_n(6)?;

        if addbsil > 63 {
            bail!(Ac3Error::AddbsilRange(addbsil));
        }

        if addbsil == 1 {
            // Possible EC3 extension: [v7 reserved][b1 flag][u8 complexity].
            let content: u16 = reader.get_n(16)?;

            if content >> 8 == 0x1 {
                return Ok(Addbsi::Ec3ExtensionTypeA {
                    complexity_index: (content & 0xFF) as u8,
                });
            }

            return Ok(Addbsi::Unknown);
        }

        // Unknown extension data.
        reader.skip_n(((addbsil as u32) + 1) << 3)?;
        Ok(Addbsi::Unknown)
    }
}

/// One-shot warning flags of an AC-3 family stream.
#[derive(Debug, Default)]
pub struct Ac3WarningFlags {
    pub deprecated_langcod: bool,
    pub reserved_bsmod: bool,
    pub reserved_dsurmod: bool,
    pub atmos_noted: bool,
}

/// Decoded legacy AC-3 `bsi()`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Ac3BitStreamInfo {
    pub bsid: u8,
    pub bsmod: u8,
    pub acmod: u8,
    pub dsurmod: u8,
    pub lfeon: bool,
    pub dialnorm: u8,
    pub addbsi: Addbsi,

    pub nb_channels: u32,
}

impl Ac3BitStreamInfo {
    pub fn read(
        reader: &mut BsIoSliceReader,
        warnings: &mut Ac3WarningFlags,
    ) -> Result<Self> {
        let mut bsi = Self {
            bsid: reader.get_n(5)?,
            ..Default::default()
        };

        if bsi.bsid > 8 {
            bail!(Ac3Error::UnsupportedBsid(bsi.bsid));
        }

        bsi.bsmod = reader.get_n(3)?;
        bsi.acmod = reader.get_n(3)?;

        if three_front_channels(bsi.acmod) {
            reader.skip_n(2)?; // cmixlev
        }

        if surround_present(bsi.acmod) {
            reader.skip_n(2)?; // surmixlev
        }

        if bsi.acmod == ACMOD_STEREO {
            bsi.dsurmod = reader.get_n(2)?;
            if bsi.dsurmod == 0x3 && !warnings.reserved_dsurmod {
                warn!("Reserved dsurmod value in use, interpreted as not indicated");
                warnings.reserved_dsurmod = true;
            }
        }

        bsi.lfeon = reader.get()?;
        bsi.nb_channels = nb_channels(bsi.acmod, bsi.lfeon);
        bsi.dialnorm = reader.get_n(5)?;

        // compre
        if reader.get()? {
            reader.skip_n(8)?; // compr
        }

        // langcode
        if reader.get()? {
            reader.skip_n(8)?; // langcod
            if !warnings.deprecated_langcod {
                warn!("Deprecated langcod field in use");
                warnings.deprecated_langcod = true;
            }
        }

        // audprodie
        if reader.get()? {
            reader.skip_n(7)?; // mixlevel, roomtyp
        }

        if bsi.acmod == ACMOD_DUAL_MONO {
            Self::read_dual_mono(reader)?;
        }

        reader.skip_n(2)?; // copyrightb, origbs

        if bsi.bsid == 0x6 {
            // Alternate bit stream syntax.
            // xbsi1e
            if reader.get()? {
                reader.skip_n(14)?; // dmixmod + Lt/Rt + Lo/Ro mix levels
            }
            // xbsi2e
            if reader.get()? {
                reader.skip_n(14)?; // dsurexmod, dheadphonmod, adconvtyp...
            }
        } else {
            // timecod1e
            if reader.get()? {
                reader.skip_n(16)?;
            }
            // timecod2e
            if reader.get()? {
                reader.skip_n(16)?;
            }
        }

        // addbsie
        if reader.get()? {
            bsi.addbsi = Addbsi::read(reader)?;
        }

        reader.byte_align()?;

        Ok(bsi)
    }

    fn read_dual_mono(reader: &mut BsIoSliceReader) -> Result<()> {
        reader.skip_n(5)?; // dialnorm2
        if reader.get()? {
            reader.skip_n(8)?; // compr2
        }
        if reader.get()? {
            reader.skip_n(8)?; // langcod2
        }
        if reader.get()? {
            reader.skip_n(7)?; // mixlevel2, roomtyp2
        }
        Ok(())
    }

    pub fn check_bdav_compliance(&self) -> Result<()> {
        if self.acmod == ACMOD_DUAL_MONO {
            bail!(Ac3Error::DualMonoForbidden);
        }
        Ok(())
    }

    /// Frame parameters that must stay constant across the stream.
    pub fn check_constant(&self, reference: &Self) -> Result<()> {
        let field = if self.bsid != reference.bsid {
            Some("bsid")
        } else if self.bsmod != reference.bsmod {
            Some("bsmod")
        } else if self.acmod != reference.acmod {
            Some("acmod")
        } else if self.lfeon != reference.lfeon {
            Some("lfeon")
        } else {
            None
        };

        match field {
            Some(field) => Err(anyhow!(Ac3Error::NonCompliantChange { field })),
            None => Ok(()),
        }
    }
}

/// Decoded E-AC-3 `bsi()` (`bsid == 16`).
#[derive(Clone, Copy, Debug, Default)]
pub struct Eac3BitStreamInfo {
    pub strmtyp: u8,
    pub substreamid: u8,
    pub frmsiz: u16,
    pub fscod: u8,
    pub fscod2: u8,
    pub numblkscod: u8,
    pub acmod: u8,
    pub lfeon: bool,
    pub bsid: u8,
    pub dialnorm: u8,
    pub chanmap: Option<u16>,
    pub bsmod: u8,
    pub addbsi: Addbsi,

    pub nb_blocks: u32,
    pub nb_channels: u32,
    /// Frame size in bytes.
    pub frame_size: u32,
}

impl Eac3BitStreamInfo {
    pub fn read(
        reader: &mut BsIoSliceReader,
        warnings: &mut Ac3WarningFlags,
    ) -> Result<Self> {
        let mut bsi = Self {
            strmtyp: reader.get_n(2)?,
            substreamid: reader.get_n(3)?,
            frmsiz: reader.get_n(11)?,
            fscod: reader.get_n(2)?,
            ..Default::default()
        };

        if bsi.strmtyp == 0x3 {
            bail!(Ac3Error::ReservedStrmtyp);
        }

        if bsi.substreamid != 0 {
            bail!(Ac3Error::NonZeroSubstreamId(bsi.substreamid));
        }

        bsi.frame_size = ((bsi.frmsiz as u32) + 1) * 2;

        if bsi.fscod == 0x3 {
            bsi.fscod2 = reader.get_n(2)?;
            bsi.numblkscod = 0x3;
        } else {
            bsi.fscod2 = 0x3;
            bsi.numblkscod = reader.get_n(2)?;
        }

        bsi.nb_blocks = match bsi.numblkscod {
            0x0 => 1,
            0x1 => 2,
            0x2 => 3,
            _ => 6,
        };

        bsi.acmod = reader.get_n(3)?;
        bsi.lfeon = reader.get()?;
        bsi.nb_channels = nb_channels(bsi.acmod, bsi.lfeon);
        bsi.bsid = reader.get_n(5)?;

        if bsi.bsid <= 10 || bsi.bsid > 16 {
            bail!(Ac3Error::UnsupportedBsid(bsi.bsid));
        }

        bsi.dialnorm = reader.get_n(5)?;

        // compre
        if reader.get()? {
            reader.skip_n(8)?; // compr
        }

        if bsi.acmod == ACMOD_DUAL_MONO {
            reader.skip_n(5)?; // dialnorm2
            if reader.get()? {
                reader.skip_n(8)?; // compr2
            }
        }

        if bsi.strmtyp == 0x1 {
            // chanmape
            if reader.get()? {
                let chanmap: u16 = reader.get_n(16)?;

                let from_map = chanmap_nb_channels(chanmap);
                if from_map != bsi.nb_channels {
                    bail!(Ac3Error::InconsistentChannelMap {
                        from_map,
                        from_acmod: bsi.nb_channels,
                    });
                }

                bsi.chanmap = Some(chanmap);
            }
        }

        // mixmdate
        if reader.get()? {
            bsi.skip_mixing_metadata(reader)?;
        }

        // infomdate
        if reader.get()? {
            bsi.read_informational_metadata(reader, warnings)?;
        }

        if bsi.strmtyp == 0x0 && bsi.numblkscod != 0x3 {
            reader.skip_n(1)?; // convsync
        }

        if bsi.strmtyp == 0x2 {
            let blkid = if bsi.numblkscod == 0x3 {
                true
            } else {
                reader.get()?
            };

            if blkid {
                reader.skip_n(6)?; // frmsizecod
            }
        }

        // addbsie
        if reader.get()? {
            bsi.addbsi = Addbsi::read(reader)?;
        }

        if let Addbsi::Ec3ExtensionTypeA { complexity_index } = bsi.addbsi {
            if !warnings.atmos_noted {
                info!(
                    "EC3 extension type A present (Dolby Atmos, \
                     object complexity index {complexity_index})"
                );
                warnings.atmos_noted = true;
            }
        }

        reader.byte_align()?;

        Ok(bsi)
    }

    fn skip_mixing_metadata(&self, reader: &mut BsIoSliceReader) -> Result<()> {
        if self.acmod > 0x2 {
            reader.skip_n(2)?; // dmixmod
        }

        if self.acmod & 0x1 != 0 && self.acmod > 0x2 {
            reader.skip_n(6)?; // ltrtcmixlev, lorocmixlev
        }

        if self.acmod & 0x4 != 0 {
            reader.skip_n(6)?; // ltrtsurmixlev, lorosurmixlev
        }

        if self.lfeon {
            // lfemixlevcode
            if reader.get()? {
                reader.skip_n(5)?; // lfemixlevcod
            }
        }

        if self.strmtyp == 0x0 {
            // pgmscle
            if reader.get()? {
                reader.skip_n(6)?;
            }

            if self.acmod == ACMOD_DUAL_MONO {
                // pgmscl2e
                if reader.get()? {
                    reader.skip_n(6)?;
                }
            }

            // extpgmscle
            if reader.get()? {
                reader.skip_n(6)?;
            }

            let mixdef: u8 = reader.get_n(2)?;
            match mixdef {
                0x1 => reader.skip_n(5)?,
                0x2 => reader.skip_n(12)?,
                0x3 => {
                    let mixdeflen: u32 = reader.get_n(5)?;
                    reader.skip_n((mixdeflen + 2) << 3)?;
                }
                _ => {}
            }

            if self.acmod < 0x2 {
                // paninfoe
                if reader.get()? {
                    reader.skip_n(14)?; // panmean, paninfo
                }

                if self.acmod == ACMOD_DUAL_MONO {
                    // paninfo2e
                    if reader.get()? {
                        reader.skip_n(14)?;
                    }
                }
            }

            // frmmixcfginfoe
            if reader.get()? {
                if self.numblkscod == 0x0 {
                    reader.skip_n(5)?;
                } else {
                    for _ in 0..self.nb_blocks {
                        // blkmixcfginfoe
                        if reader.get()? {
                            reader.skip_n(5)?;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn read_informational_metadata(
        &mut self,
        reader: &mut BsIoSliceReader,
        warnings: &mut Ac3WarningFlags,
    ) -> Result<()> {
        self.bsmod = reader.get_n(3)?;

        if self.bsmod > 0x2 && !warnings.reserved_bsmod {
            info!("Uncommon bsmod value {} in use", self.bsmod);
            warnings.reserved_bsmod = true;
        }

        reader.skip_n(2)?; // copyrightb, origbs

        if self.acmod == ACMOD_STEREO {
            reader.skip_n(4)?; // dsurmod, dheadphonmod
        }

        if self.acmod >= 0x6 {
            reader.skip_n(2)?; // dsurexmod
        }

        // audprodie
        if reader.get()? {
            reader.skip_n(8)?; // mixlevel, roomtyp, adconvtyp
        }

        if self.acmod == ACMOD_DUAL_MONO {
            // audprodi2e
            if reader.get()? {
                reader.skip_n(8)?;
            }
        }

        if self.fscod < 0x3 {
            reader.skip_n(1)?; // sourcefscod
        }

        Ok(())
    }

    pub fn check_bdav_compliance(&self, secondary: bool) -> Result<()> {
        if self.acmod == ACMOD_DUAL_MONO {
            bail!(Ac3Error::DualMonoForbidden);
        }

        if self.fscod != 0x0 {
            bail!(Ac3Error::SampleRateNot48kHz {
                fscod: self.fscod,
                fscod2: self.fscod2,
            });
        }

        if secondary && self.strmtyp != 0x0 {
            bail!(Ac3Error::SecondaryNotIndependent(self.strmtyp));
        }

        Ok(())
    }

    /// Frame parameters that must stay constant across the stream.
    pub fn check_constant(&self, reference: &Self) -> Result<()> {
        let field = if self.strmtyp != reference.strmtyp {
            Some("strmtyp")
        } else if self.bsid != reference.bsid {
            Some("bsid")
        } else if self.fscod != reference.fscod {
            Some("fscod")
        } else if self.frmsiz != reference.frmsiz {
            Some("frmsiz")
        } else if self.acmod != reference.acmod {
            Some("acmod")
        } else if self.lfeon != reference.lfeon {
            Some("lfeon")
        } else if self.chanmap != reference.chanmap {
            Some("chanmap")
        } else if self.bsmod != reference.bsmod {
            Some("bsmod")
        } else {
            None
        };

        match field {
            Some(field) => Err(anyhow!(Ac3Error::NonCompliantChange { field })),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::utils::bitstream_io::BsIoVecWriter;

    pub(crate) fn write_ac3_bsi(w: &mut BsIoVecWriter, acmod: u8) {
        w.put_n(5, 8u8).unwrap(); // bsid
        w.put_n(3, 0u8).unwrap(); // bsmod
        w.put_n(3, acmod).unwrap();
        if acmod & 0x1 != 0 && acmod > 0x2 {
            w.put_n(2, 0u8).unwrap(); // cmixlev
        }
        if acmod >= 0x4 {
            w.put_n(2, 0u8).unwrap(); // surmixlev
        }
        if acmod == ACMOD_STEREO {
            w.put_n(2, 0u8).unwrap(); // dsurmod
        }
        w.put(false).unwrap(); // lfeon
        w.put_n(5, 31u8).unwrap(); // dialnorm
        w.put(false).unwrap(); // compre
        w.put(false).unwrap(); // langcode
        w.put(false).unwrap(); // audprodie
        w.put(false).unwrap(); // copyrightb
        w.put(true).unwrap(); // origbs
        w.put(false).unwrap(); // timecod1e
        w.put(false).unwrap(); // timecod2e
        w.put(false).unwrap(); // addbsie
        w.byte_align().unwrap();
    }

    #[test]
    fn stereo_bsi_parses() -> Result<()> {
        let mut w = BsIoVecWriter::default();
        write_ac3_bsi(&mut w, ACMOD_STEREO);
        let data = w.finish().unwrap();

        let mut warnings = Ac3WarningFlags::default();
        let mut reader = BsIoSliceReader::from_slice(&data);
        let bsi = Ac3BitStreamInfo::read(&mut reader, &mut warnings)?;
        assert_eq!(bsi.acmod, ACMOD_STEREO);
        assert_eq!(bsi.nb_channels, 2);
        assert_eq!(bsi.dialnorm, 31);
        bsi.check_bdav_compliance()?;
        Ok(())
    }

    #[test]
    fn acmod_change_is_non_compliant() -> Result<()> {
        let mut w = BsIoVecWriter::default();
        write_ac3_bsi(&mut w, ACMOD_STEREO);
        let stereo = w.finish().unwrap();

        let mut w = BsIoVecWriter::default();
        write_ac3_bsi(&mut w, 0x7);
        let five_one = w.finish().unwrap();

        let mut warnings = Ac3WarningFlags::default();
        let mut reader = BsIoSliceReader::from_slice(&stereo);
        let first = Ac3BitStreamInfo::read(&mut reader, &mut warnings)?;
        let mut reader = BsIoSliceReader::from_slice(&five_one);
        let second = Ac3BitStreamInfo::read(&mut reader, &mut warnings)?;

        assert!(second.check_constant(&first).is_err());
        Ok(())
    }

    #[test]
    fn chanmap_channel_counts() {
        // L + C + R + Ls + Rs = 5 channels.
        assert_eq!(chanmap_nb_channels(0xF800), 5);
        // LFE alone.
        assert_eq!(chanmap_nb_channels(0x0001), 1);
    }

    #[test]
    fn ec3_type_a_addbsi_is_recognized() -> Result<()> {
        let mut w = BsIoVecWriter::default();
        w.put_n(6, 1u8)?; // addbsil
        w.put_n(8, 0x01u8)?; // reserved + flag_ec3_extension_type_a
        w.put_n(8, 12u8)?; // complexity_index_type_a
        w.put_n(2, 0u8)?;
        let data = w.finish().unwrap();

        let mut reader = BsIoSliceReader::from_slice(&data);
        let addbsi = Addbsi::read(&mut reader)?;
        assert_eq!(
            addbsi,
            Addbsi::Ec3ExtensionTypeA {
                complexity_index: 12
            }
        );
        Ok(())
    }
}
