//! Bitstream I/O utilities for audio parsing.
//!
//! Provides MSB-first big-endian bitstream reading over borrowed byte
//! buffers, range-scoped CRC validation, and a bit-level writer used to
//! synthesize byte-exact headers.

use std::io;
use std::io::SeekFrom;

use bitstream_io::{
    BigEndian, BitRead, BitReader, BitWrite, BitWriter, SignedInteger, UnsignedInteger,
};

use crate::utils::crc::{Crc8, Crc16, Crc16Norm, crc8, crc16};

const STACK_BUF_SIZE: usize = 256;

#[derive(Debug)]
pub struct BitstreamIoReader<R: io::Read + io::Seek> {
    bs: BitReader<R, BigEndian>,
    len: u64,
}

pub type BsIoSliceReader<'a> = BitstreamIoReader<io::Cursor<&'a [u8]>>;

impl<R> BitstreamIoReader<R>
where
    R: io::Read + io::Seek,
{
    pub fn new(read: R, len_bytes: u64) -> Self {
        Self {
            bs: BitReader::new(read),
            len: len_bytes << 3,
        }
    }

    #[inline(always)]
    pub fn get(&mut self) -> io::Result<bool> {
        self.bs.read_bit()
    }

    #[inline(always)]
    pub fn get_n<I: UnsignedInteger>(&mut self, n: u32) -> io::Result<I> {
        if n <= 32 {
            match self.bs.read_unsigned_var(n) {
                Ok(val) => Ok(val),
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "get_n({}): out of bounds bits at {}",
                        n,
                        self.bs.position_in_bits().unwrap_or(0)
                    ),
                )),
                Err(e) => Err(e),
            }
        } else {
            self.available().and_then(|avail| {
                if n as u64 > avail {
                    Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!(
                            "get_n({}): out of bounds bits at {}",
                            n,
                            self.bs.position_in_bits().unwrap_or(0)
                        ),
                    ))
                } else {
                    self.bs.read_unsigned_var(n)
                }
            })
        }
    }

    #[inline(always)]
    pub fn get_s<S: SignedInteger>(&mut self, n: u32) -> io::Result<S> {
        match self.bs.read_signed_var(n) {
            Ok(val) => Ok(val),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "get_s({}): out of bounds bits at {}",
                    n,
                    self.bs.position_in_bits().unwrap_or(0)
                ),
            )),
            Err(e) => Err(e),
        }
    }

    /// Reads the next `n` bits without advancing the stream position.
    #[inline(always)]
    pub fn peek_n<I: UnsignedInteger>(&mut self, n: u32) -> io::Result<I> {
        let position = self.position()?;
        let value = self.get_n(n)?;
        self.bs.seek_bits(SeekFrom::Start(position))?;
        Ok(value)
    }

    pub fn get_bytes(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.bs.read_bytes(buf)
    }

    #[inline(always)]
    pub fn seek(&mut self, offset: i64) -> io::Result<u64> {
        if (offset < 0 && self.position()? as i64 + offset >= 0)
            || (offset >= 0 && self.available()? as i64 >= offset)
        {
            return self.bs.seek_bits(SeekFrom::Current(offset));
        }

        Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!(
                "seek({}): out of bounds bits at {}",
                offset,
                self.position()?
            ),
        ))
    }

    /// XOR of the whole bytes in `[start, start + len)` bits.
    pub fn parity_check(&mut self, start: u64, len: u64) -> io::Result<u8> {
        let position = self.position()?;

        self.bs.seek_bits(SeekFrom::Start(start))?;

        let bytes_len = (len >> 3) as usize;

        let parity = if bytes_len <= STACK_BUF_SIZE {
            let mut stack_buf = [0u8; STACK_BUF_SIZE];
            let buf = &mut stack_buf[..bytes_len];
            self.bs.read_bytes(buf)?;
            buf.iter().fold(0, |acc, x| acc ^ x)
        } else {
            let mut heap_buf = vec![0; bytes_len];
            self.bs.read_bytes(&mut heap_buf)?;
            heap_buf.iter().fold(0, |acc, x| acc ^ x)
        };

        self.bs.seek_bits(SeekFrom::Start(position))?;

        Ok(parity)
    }

    #[inline(always)]
    pub fn crc8_check(&mut self, crc: &Crc8, start: u64, len: u64) -> io::Result<u8> {
        let position = self.position()?;

        if start + len > self.len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "crc8_check: out of bounds bits",
            ));
        }

        self.bs.seek_bits(SeekFrom::Start(start))?;

        let mut checksum = crc.init;

        let prefix_len = start & 7;
        let suffix_len = (len - prefix_len) & 7;
        let middle_len = (len - prefix_len - suffix_len) as usize;

        if prefix_len != 0 {
            let prefix: u8 = self.bs.read_var(prefix_len as u32)?;
            checksum = crc8(crc.poly, checksum, prefix_len as usize) ^ prefix;
        }

        let bytes_len = middle_len >> 3;
        if bytes_len <= STACK_BUF_SIZE {
            let mut stack_buf = [0u8; STACK_BUF_SIZE];
            let buf = &mut stack_buf[..bytes_len];
            self.bs.read_bytes(buf)?;
            checksum = crc.update(checksum, buf);
        } else {
            let mut heap_buf = vec![0; bytes_len];
            self.bs.read_bytes(&mut heap_buf)?;
            checksum = crc.update(checksum, &heap_buf);
        };

        if suffix_len != 0 {
            let suffix: u8 = self.bs.read_var(suffix_len as u32)?;
            checksum = crc8(crc.poly, checksum, suffix_len as usize) ^ suffix;
        }

        self.bs.seek_bits(SeekFrom::Start(position))?;

        Ok(checksum)
    }

    #[inline(always)]
    pub fn crc16_check(&mut self, crc: &Crc16, start: u64, len: u64) -> io::Result<u16> {
        let position = self.position()?;

        if start + len > self.len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "crc16_check: out of bounds bits",
            ));
        }

        self.bs.seek_bits(SeekFrom::Start(start))?;

        let mut checksum = crc.init;

        let prefix_len = start & 7;
        let suffix_len = (len - prefix_len) & 7;
        let middle_len = (len - prefix_len - suffix_len) as usize;

        if prefix_len != 0 {
            let prefix: u16 = self.bs.read_var(prefix_len as u32)?;
            checksum = crc16(crc.poly, checksum, prefix_len as usize) ^ prefix;
        }

        let bytes_len = middle_len >> 3;
        if bytes_len <= STACK_BUF_SIZE {
            let mut stack_buf = [0u8; STACK_BUF_SIZE];
            let buf = &mut stack_buf[..bytes_len];
            self.bs.read_bytes(buf)?;
            checksum = crc.update(checksum, buf);
        } else {
            let mut heap_buf = vec![0; bytes_len];
            self.bs.read_bytes(&mut heap_buf)?;
            checksum = crc.update(checksum, &heap_buf);
        };

        if suffix_len != 0 {
            let suffix: u16 = self.bs.read_var(suffix_len as u32)?;
            checksum = crc16(crc.poly, checksum, suffix_len as usize) ^ suffix;
        }

        self.bs.seek_bits(SeekFrom::Start(position))?;

        Ok(checksum)
    }

    /// Conventional MSB-first CRC-16 over a byte-aligned bit range, as used
    /// by the DTS Extension Substream and XLL header checksums.
    pub fn crc16_norm_check(&mut self, crc: &Crc16Norm, start: u64, len: u64) -> io::Result<u16> {
        debug_assert_eq!(start & 7, 0);
        debug_assert_eq!(len & 7, 0);

        let position = self.position()?;

        if start + len > self.len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "crc16_norm_check: out of bounds bits",
            ));
        }

        self.bs.seek_bits(SeekFrom::Start(start))?;

        let mut checksum = crc.init;

        let mut remaining = (len >> 3) as usize;
        let mut stack_buf = [0u8; STACK_BUF_SIZE];
        while remaining > 0 {
            let chunk = remaining.min(STACK_BUF_SIZE);
            let buf = &mut stack_buf[..chunk];
            self.bs.read_bytes(buf)?;
            checksum = crc.update(checksum, buf);
            remaining -= chunk;
        }

        self.bs.seek_bits(SeekFrom::Start(position))?;

        Ok(checksum)
    }

    #[inline(always)]
    pub fn byte_align(&mut self) -> io::Result<()> {
        self.bs.byte_align();
        Ok(())
    }

    #[inline(always)]
    pub fn align_16bit(&mut self) -> io::Result<()> {
        self.bs.byte_align();

        let position = self.bs.position_in_bits()?;
        if position & 15 > 0 {
            self.skip_n(8)?;
        }

        Ok(())
    }

    #[inline(always)]
    pub fn available(&mut self) -> io::Result<u64> {
        self.bs.position_in_bits().map(|pos| self.len - pos)
    }

    #[inline(always)]
    pub fn skip_n(&mut self, n: u32) -> io::Result<()> {
        if n <= 64 {
            self.bs.skip(n)
        } else {
            self.available().and_then(|avail| {
                if n as u64 > avail {
                    Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "skip_n: out of bounds bits",
                    ))
                } else {
                    self.bs.skip(n)
                }
            })
        }
    }

    #[inline(always)]
    pub fn position(&mut self) -> io::Result<u64> {
        self.bs.position_in_bits()
    }
}

impl<'a> BsIoSliceReader<'a> {
    pub fn from_slice(buf: &'a [u8]) -> Self {
        let len = buf.len() as u64;
        let read = io::Cursor::new(buf);

        Self::new(read, len)
    }
}

impl Default for BsIoSliceReader<'_> {
    fn default() -> Self {
        Self::from_slice(&[])
    }
}

/// MSB-first bit writer accumulating into an owned byte vector.
///
/// Counterpart of [`BsIoSliceReader`] used to rebuild Extension Substream
/// headers byte-exactly after PBR smoothing.
pub struct BsIoVecWriter {
    bw: BitWriter<Vec<u8>, BigEndian>,
    bits: u64,
}

impl std::fmt::Debug for BsIoVecWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BsIoVecWriter")
            .field("bits", &self.bits)
            .finish()
    }
}

impl Default for BsIoVecWriter {
    fn default() -> Self {
        Self {
            bw: BitWriter::new(Vec::new()),
            bits: 0,
        }
    }
}

impl BsIoVecWriter {
    #[inline(always)]
    pub fn put(&mut self, bit: bool) -> io::Result<()> {
        self.bw.write_bit(bit)?;
        self.bits += 1;
        Ok(())
    }

    #[inline(always)]
    pub fn put_n<I: UnsignedInteger>(&mut self, n: u32, value: I) -> io::Result<()> {
        self.bw.write_unsigned_var(n, value)?;
        self.bits += n as u64;
        Ok(())
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.bw.write_bytes(bytes)?;
        self.bits += (bytes.len() as u64) << 3;
        Ok(())
    }

    pub fn byte_align(&mut self) -> io::Result<()> {
        while self.bits & 7 != 0 {
            self.put(false)?;
        }
        Ok(())
    }

    /// Bits written so far.
    #[inline(always)]
    pub fn position(&self) -> u64 {
        self.bits
    }

    /// Finishes writing and returns the accumulated bytes. The stream must
    /// be byte-aligned.
    pub fn finish(mut self) -> io::Result<Vec<u8>> {
        if self.bits & 7 != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "finish: bitstream is not byte-aligned",
            ));
        }
        self.bw.byte_align()?;
        Ok(self.bw.into_writer())
    }
}

#[test]
fn read_basic_fields() -> anyhow::Result<()> {
    let data = [0b1010_1100, 0xFF, 0x00, 0x12];
    let mut reader = BsIoSliceReader::from_slice(&data);

    assert!(reader.get()?);
    assert!(!reader.get()?);
    assert_eq!(reader.get_n::<u8>(3)?, 0b101);
    assert_eq!(reader.peek_n::<u8>(3)?, 0b100);
    assert_eq!(reader.get_n::<u8>(3)?, 0b100);
    assert_eq!(reader.position()?, 8);
    assert_eq!(reader.get_n::<u32>(24)?, 0xFF0012);
    assert!(reader.get_n::<u8>(1).is_err());

    Ok(())
}

#[test]
fn align_16bit_skips_to_word_boundary() -> anyhow::Result<()> {
    let data = [0xAA, 0xBB, 0xCC, 0xDD];
    let mut reader = BsIoSliceReader::from_slice(&data);

    reader.skip_n(3)?;
    reader.align_16bit()?;
    assert_eq!(reader.position()?, 16);

    reader.skip_n(1)?;
    reader.align_16bit()?;
    assert_eq!(reader.position()?, 32);

    Ok(())
}

#[test]
fn writer_round_trip() -> anyhow::Result<()> {
    let mut writer = BsIoVecWriter::default();
    writer.put_n(4, 0xAu8)?;
    writer.put(true)?;
    writer.put_n(11, 0x5A5u16)?;
    writer.put_bytes(&[0xDE, 0xAD])?;
    assert_eq!(writer.position(), 48);

    let bytes = writer.finish()?;
    let mut reader = BsIoSliceReader::from_slice(&bytes);
    assert_eq!(reader.get_n::<u8>(4)?, 0xA);
    assert!(reader.get()?);
    assert_eq!(reader.get_n::<u16>(11)?, 0x5A5);
    assert_eq!(reader.get_n::<u16>(16)?, 0xDEAD);

    Ok(())
}
