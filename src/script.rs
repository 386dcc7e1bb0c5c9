//! Remux script records consumed by the downstream PES/TS muxer.
//!
//! The script is a flat binary file: an 8-byte magic, one stream header
//! record describing the audio properties, a table of reusable data blocks,
//! one PES record per access unit and a final end-of-stream marker. PES
//! records carry the 27 MHz presentation timestamp and the command sequence
//! reconstructing the PES payload from source byte ranges and synthesized
//! bytes.
//!
//! Records are buffered until [`ScriptWriter::finish`] because the stream
//! properties (codec, channel layout, final timestamp) are only known once
//! the whole elementary stream has been parsed.

use std::io;
use std::io::Write;

/// Script file magic, first 8 bytes of the output.
pub const SCRIPT_MAGIC: &[u8; 8] = b"BDAMXSCR";

/// End-of-stream marker byte closing the script.
pub const SCRIPT_END_MARKER: u8 = 0xFF;

const RECORD_PES: u8 = 0x01;

const CMD_COPY_SOURCE: u8 = 0x01;
const CMD_WRITE_LITERAL: u8 = 0x02;
const CMD_INSERT_DATA_BLOCK: u8 = 0x03;
const CMD_PADDING_FILL: u8 = 0x04;
const CMD_BYTE_ORDER_SWAP: u8 = 0x05;

/// Stream coding type written in the script stream header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum StreamCodingType {
    Ac3 = 0x01,
    TrueHd = 0x02,
    Eac3Secondary = 0x03,
    Dts = 0x04,
    DtsHdHr = 0x05,
    DtsHdMa = 0x06,
    DtsExpress = 0x07,
}

/// Audio channel layout class carried in the stream header.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(u8)]
pub enum AudioFormat {
    Mono = 0x01,
    DualMono = 0x02,
    #[default]
    Stereo = 0x03,
    MultiChannel = 0x06,
}

/// Sample rate class carried in the stream header.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(u8)]
pub enum SampleRateCode {
    #[default]
    Hz48000 = 0x01,
    Hz96000 = 0x04,
    Hz192000 = 0x05,
}

impl SampleRateCode {
    pub fn from_rate(rate: u32) -> Self {
        match rate {
            48000 => Self::Hz48000,
            96000 => Self::Hz96000,
            _ => Self::Hz192000,
        }
    }
}

/// Bit depth class carried in the stream header.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(u8)]
pub enum BitDepthCode {
    #[default]
    Bits16 = 0x01,
    Bits20 = 0x02,
    Bits24 = 0x03,
}

impl BitDepthCode {
    pub fn from_depth(depth: u32) -> Self {
        match depth {
            0..=16 => Self::Bits16,
            17..=20 => Self::Bits20,
            _ => Self::Bits24,
        }
    }
}

/// Audio properties written in the stream header record.
#[derive(Clone, Copy, Debug)]
pub struct StreamProperties {
    pub coding_type: StreamCodingType,
    pub audio_format: AudioFormat,
    pub sample_rate: SampleRateCode,
    pub bit_depth: BitDepthCode,
    pub channel_mask: u16,
    pub bitrate: u32,
    pub last_pts: u64,
}

/// How synthesized or block data is combined with the payload at its
/// destination offset.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum InsertMode {
    /// Overwrites the destination bytes.
    Erase = 0x00,
    /// Shifts following bytes to make room.
    Insert = 0x01,
}

/// One payload construction command inside a PES record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PesCommand {
    CopySource {
        dst_offset: u32,
        src_file: u8,
        src_offset: u64,
        length: u32,
    },
    WriteLiteral {
        dst_offset: u32,
        bytes: Vec<u8>,
    },
    InsertDataBlock {
        dst_offset: u32,
        mode: InsertMode,
        block_id: u8,
    },
    PaddingFill {
        dst_offset: u32,
        mode: InsertMode,
        length: u32,
        byte_value: u8,
    },
    ByteOrderSwap {
        word_size: u8,
        dst_offset: u32,
        length: u32,
    },
}

fn push_u16(dst: &mut Vec<u8>, value: u16) {
    dst.extend_from_slice(&value.to_be_bytes());
}

fn push_u32(dst: &mut Vec<u8>, value: u32) {
    dst.extend_from_slice(&value.to_be_bytes());
}

fn push_u64(dst: &mut Vec<u8>, value: u64) {
    dst.extend_from_slice(&value.to_be_bytes());
}

impl PesCommand {
    fn serialize(&self, dst: &mut Vec<u8>) {
        match self {
            PesCommand::CopySource {
                dst_offset,
                src_file,
                src_offset,
                length,
            } => {
                dst.push(CMD_COPY_SOURCE);
                push_u32(dst, *dst_offset);
                dst.push(*src_file);
                push_u64(dst, *src_offset);
                push_u32(dst, *length);
            }
            PesCommand::WriteLiteral { dst_offset, bytes } => {
                dst.push(CMD_WRITE_LITERAL);
                push_u32(dst, *dst_offset);
                push_u32(dst, bytes.len() as u32);
                dst.extend_from_slice(bytes);
            }
            PesCommand::InsertDataBlock {
                dst_offset,
                mode,
                block_id,
            } => {
                dst.push(CMD_INSERT_DATA_BLOCK);
                push_u32(dst, *dst_offset);
                dst.push(*mode as u8);
                dst.push(*block_id);
            }
            PesCommand::PaddingFill {
                dst_offset,
                mode,
                length,
                byte_value,
            } => {
                dst.push(CMD_PADDING_FILL);
                push_u32(dst, *dst_offset);
                dst.push(*mode as u8);
                push_u32(dst, *length);
                dst.push(*byte_value);
            }
            PesCommand::ByteOrderSwap {
                word_size,
                dst_offset,
                length,
            } => {
                dst.push(CMD_BYTE_ORDER_SWAP);
                dst.push(*word_size);
                push_u32(dst, *dst_offset);
                push_u32(dst, *length);
            }
        }
    }
}

/// A PES record under construction, one per access unit.
#[derive(Debug, Default)]
pub struct PesRecord {
    pub pts: u64,
    pub extension_frame: bool,
    pub commands: Vec<PesCommand>,
}

/// Builds the script in memory and flushes it to the sink on completion.
#[derive(Debug)]
pub struct ScriptWriter<W: Write> {
    sink: W,
    source_files: Vec<String>,
    data_blocks: Vec<Vec<u8>>,
    records: Vec<u8>,
    nb_records: u32,
    properties: Option<StreamProperties>,
    current: Option<PesRecord>,
}

impl<W: Write> ScriptWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink,
            source_files: Vec::new(),
            data_blocks: Vec::new(),
            records: Vec::new(),
            nb_records: 0,
            properties: None,
            current: None,
        }
    }

    /// Registers a source file, returning its index for
    /// [`PesCommand::CopySource`].
    pub fn add_source_file(&mut self, path: &str) -> u8 {
        self.source_files.push(path.to_owned());
        (self.source_files.len() - 1) as u8
    }

    /// Registers a reusable data block (recurring fixed header bytes),
    /// returning its id for [`PesCommand::InsertDataBlock`].
    pub fn add_data_block(&mut self, bytes: &[u8]) -> u8 {
        self.data_blocks.push(bytes.to_vec());
        (self.data_blocks.len() - 1) as u8
    }

    pub fn set_properties(&mut self, properties: StreamProperties) {
        self.properties = Some(properties);
    }

    /// Opens the PES record of one access unit.
    pub fn begin_pes(&mut self, pts: u64, extension_frame: bool) {
        debug_assert!(self.current.is_none());
        self.current = Some(PesRecord {
            pts,
            extension_frame,
            commands: Vec::new(),
        });
    }

    pub fn push_command(&mut self, command: PesCommand) {
        if let Some(record) = &mut self.current {
            record.commands.push(command);
        }
    }

    /// Closes and serializes the current PES record.
    pub fn end_pes(&mut self) {
        let Some(record) = self.current.take() else {
            return;
        };

        self.records.push(RECORD_PES);
        push_u64(&mut self.records, record.pts);
        self.records.push(record.extension_frame as u8);
        push_u16(&mut self.records, record.commands.len() as u16);
        for command in &record.commands {
            command.serialize(&mut self.records);
        }
        self.nb_records += 1;
    }

    pub fn nb_records(&self) -> u32 {
        self.nb_records
    }

    /// Writes magic, stream header, data-block table, buffered PES records
    /// and the end marker to the sink.
    pub fn finish(mut self) -> io::Result<W> {
        let Some(properties) = self.properties else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "finish: stream properties never set",
            ));
        };

        let mut header = Vec::with_capacity(64);
        header.extend_from_slice(SCRIPT_MAGIC);
        header.push(properties.coding_type as u8);
        header.push(properties.audio_format as u8);
        header.push(properties.sample_rate as u8);
        header.push(properties.bit_depth as u8);
        push_u16(&mut header, properties.channel_mask);
        push_u32(&mut header, properties.bitrate);
        push_u64(&mut header, properties.last_pts);

        header.push(self.source_files.len() as u8);
        for path in &self.source_files {
            push_u16(&mut header, path.len() as u16);
            header.extend_from_slice(path.as_bytes());
        }

        header.push(self.data_blocks.len() as u8);
        for block in &self.data_blocks {
            push_u16(&mut header, block.len() as u16);
            header.extend_from_slice(block);
        }

        push_u32(&mut header, self.nb_records);

        self.sink.write_all(&header)?;
        self.sink.write_all(&self.records)?;
        self.sink.write_all(&[SCRIPT_END_MARKER])?;
        self.sink.flush()?;

        Ok(self.sink)
    }
}

#[test]
fn pes_records_serialize_in_order() -> anyhow::Result<()> {
    let mut writer = ScriptWriter::new(Vec::new());
    let src = writer.add_source_file("stream.ac3");

    writer.begin_pes(0, false);
    writer.push_command(PesCommand::CopySource {
        dst_offset: 0,
        src_file: src,
        src_offset: 0,
        length: 768,
    });
    writer.end_pes();

    writer.begin_pes(86400, false);
    writer.push_command(PesCommand::WriteLiteral {
        dst_offset: 0,
        bytes: vec![0xAB; 4],
    });
    writer.end_pes();

    writer.set_properties(StreamProperties {
        coding_type: StreamCodingType::Ac3,
        audio_format: AudioFormat::Stereo,
        sample_rate: SampleRateCode::Hz48000,
        bit_depth: BitDepthCode::Bits16,
        channel_mask: 0x0003,
        bitrate: 192_000,
        last_pts: 172_800,
    });

    assert_eq!(writer.nb_records(), 2);

    let bytes = writer.finish()?;
    assert_eq!(&bytes[..8], SCRIPT_MAGIC);
    assert_eq!(*bytes.last().unwrap(), SCRIPT_END_MARKER);

    // Fixed-size stream header, one source file entry, no data blocks,
    // record count, then the first PES record with PTS zero.
    let records_start = 8 + 18 + 1 + (2 + "stream.ac3".len()) + 1 + 4;
    assert_eq!(bytes[records_start], RECORD_PES);
    assert_eq!(
        &bytes[records_start + 1..records_start + 9],
        &0u64.to_be_bytes()
    );

    Ok(())
}

#[test]
fn finish_without_properties_fails() {
    let writer = ScriptWriter::new(Vec::new());
    assert!(writer.finish().is_err());
}
