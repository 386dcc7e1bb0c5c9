//! DTS-HD container file chunk reader.
//!
//! Chunks are identified by an 8-byte ASCII magic followed by a 64-bit
//! big-endian byte length, DWORD-aligned. The reader collects the metadata
//! the driver needs (PBR smoothing buffer size, initial codec delay) and
//! locates the `STRMDATA` chunk holding the raw elementary stream. Unknown
//! chunks are skipped by their declared length; each recognized chunk may
//! appear at most once.

use anyhow::{Result, bail};
use log::{debug, warn};

use crate::utils::errors::DtshdError;

pub const CHUNK_DTSHDHDR: u64 = 0x4454534844484452; // "DTSHDHDR"
pub const CHUNK_FILEINFO: u64 = 0x46494C45494E464F; // "FILEINFO"
pub const CHUNK_CORESSMD: u64 = 0x434F524553534D44; // "CORESSMD"
pub const CHUNK_EXTSS_MD: u64 = 0x45585453535F4D44; // "EXTSS_MD"
pub const CHUNK_AUPR_HDR: u64 = 0x415550522D484452; // "AUPR-HDR"
pub const CHUNK_AUPRINFO: u64 = 0x41555052494E464F; // "AUPRINFO"
pub const CHUNK_NAVI_TBL: u64 = 0x4E4156492D54424C; // "NAVI-TBL"
pub const CHUNK_STRMDATA: u64 = 0x5354524D44415441; // "STRMDATA"
pub const CHUNK_TIMECODE: u64 = 0x54494D45434F4445; // "TIMECODE"
pub const CHUNK_BUILDVER: u64 = 0x4255494C44564552; // "BUILDVER"
pub const CHUNK_BLACKOUT: u64 = 0x424C41434B4F5554; // "BLACKOUT"
pub const CHUNK_BRANCHPT: u64 = 0x4252414E43485054; // "BRANCHPT"

/// Stream metadata flag bits of the `DTSHDHDR` chunk.
pub const BSM_IS_VBR: u16 = 1 << 0;
pub const BSM_PBRS_PERFORMED: u16 = 1 << 1;
pub const BSM_NAVI_EMBEDDED: u16 = 1 << 2;
pub const BSM_CORE_PRESENT: u16 = 1 << 3;
pub const BSM_EXTSS_PRESENT: u16 = 1 << 4;

/// `DTSHDHDR` file header chunk.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileHeaderChunk {
    pub version: u32,
    pub ref_clock_code: u8,
    pub timestamp: u32,
    pub tc_frame_rate: u8,
    pub stream_metadata: u16,
    pub nb_audio_presentations: u8,
    pub nb_ext_substreams: u8,
}

impl FileHeaderChunk {
    pub fn is_vbr(&self) -> bool {
        self.stream_metadata & BSM_IS_VBR != 0
    }

    pub fn pbrs_performed(&self) -> bool {
        self.stream_metadata & BSM_PBRS_PERFORMED != 0
    }

    pub fn navigation_table_present(&self) -> bool {
        self.stream_metadata & BSM_NAVI_EMBEDDED != 0
    }

    pub fn core_present(&self) -> bool {
        self.stream_metadata & BSM_CORE_PRESENT != 0
    }

    pub fn ext_ss_present(&self) -> bool {
        self.stream_metadata & BSM_EXTSS_PRESENT != 0
    }
}

/// `CORESSMD` Core substream metadata chunk.
#[derive(Clone, Copy, Debug, Default)]
pub struct CoreMetadataChunk {
    pub max_sample_rate: u32,
    pub bitrate_kbps: u16,
    pub channel_mask: u16,
    pub frame_payload_bytes: u32,
}

/// `EXTSS_MD` Extension Substream metadata chunk.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExtMetadataChunk {
    pub avg_bitrate_kbps: u32,
    /// VBR only: peak bitrate.
    pub peak_bitrate_kbps: u32,
    /// VBR only: PBR smoothing buffer size in KiB.
    pub pbr_smoothing_buf_size_kib: u16,
    /// CBR only: fixed frame payload size.
    pub frame_payload_bytes: u32,
}

/// `AUPR-HDR` audio presentation metadata chunk.
#[derive(Clone, Copy, Debug, Default)]
pub struct AudioPresMetadataChunk {
    pub presentation_index: u8,
    pub flags: u16,
    pub max_sample_rate: u32,
    pub nb_frames: u32,
    pub samples_per_frame: u16,
    /// 40-bit count of original audio samples at the maximum rate.
    pub nb_samples_orig_audio: u64,
    pub channel_mask: u16,
    /// Encoder delay in samples at the maximum rate.
    pub codec_delay_samples: u16,
}

/// Decoded DTS-HD container metadata and stream data location.
#[derive(Debug, Default)]
pub struct DtshdFileHandler {
    pub header: Option<FileHeaderChunk>,
    pub core_metadata: Option<CoreMetadataChunk>,
    pub ext_metadata: Option<ExtMetadataChunk>,
    pub audio_pres: Option<AudioPresMetadataChunk>,
    /// Byte range of the elementary stream inside the container.
    pub stream_data: Option<(usize, usize)>,
    warned_missing_pbr_stats: bool,
}

/// Returns true when the buffer starts with a DTS-HD container magic.
pub fn is_dtshd_file(data: &[u8]) -> bool {
    data.len() >= 8 && read_u64(data, 0) == CHUNK_DTSHDHDR
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    u64::from_be_bytes(data[offset..offset + 8].try_into().unwrap())
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes(data[offset..offset + 4].try_into().unwrap())
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes(data[offset..offset + 2].try_into().unwrap())
}

fn read_u24(data: &[u8], offset: usize) -> u32 {
    ((data[offset] as u32) << 16) | ((data[offset + 1] as u32) << 8) | data[offset + 2] as u32
}

fn read_u40(data: &[u8], offset: usize) -> u64 {
    ((read_u32(data, offset) as u64) << 8) | data[offset + 4] as u64
}

impl DtshdFileHandler {
    /// Number of leading audio frames to discard for delay trimming.
    pub fn initial_delay_frames(&self) -> u32 {
        self.audio_pres
            .filter(|pres| pres.samples_per_frame > 0)
            .map(|pres| (pres.codec_delay_samples / pres.samples_per_frame) as u32)
            .unwrap_or(0)
    }

    /// PBR smoothing buffer size from the container metadata, in KiB.
    pub fn pbr_smoothing_buf_size_kib(&self) -> Result<u32> {
        match &self.ext_metadata {
            Some(meta) => Ok(meta.pbr_smoothing_buf_size_kib as u32),
            None => bail!(DtshdError::MissingExtMetadata),
        }
    }

    /// Parses every metadata chunk, returning the handler once the stream
    /// data range is known.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut handler = Self::default();
        let mut offset = 0usize;
        let mut seen_chunks: Vec<u64> = Vec::new();

        while offset + 16 <= data.len() {
            let chunk_id = read_u64(data, offset);
            let chunk_size = read_u64(data, offset + 8) as usize;
            let payload_start = offset + 16;

            if handler.header.is_none() && chunk_id != CHUNK_DTSHDHDR {
                bail!(DtshdError::HeaderNotFirst);
            }

            if chunk_id != CHUNK_STRMDATA && payload_start + chunk_size > data.len() {
                bail!(DtshdError::ChunkOverrun);
            }

            match chunk_id {
                CHUNK_DTSHDHDR => {
                    if handler.header.is_some() {
                        bail!(DtshdError::DuplicateChunk("DTSHDHDR"));
                    }
                    handler.header = Some(Self::parse_header(
                        &data[payload_start..payload_start + chunk_size],
                        chunk_size as u64,
                    )?);
                }
                CHUNK_CORESSMD => {
                    if handler.core_metadata.is_some() {
                        bail!(DtshdError::DuplicateChunk("CORESSMD"));
                    }
                    if chunk_size < 11 || chunk_size & 0x3 != 0 {
                        bail!(DtshdError::BadChunkSize {
                            chunk: "CORESSMD",
                            size: chunk_size as u64,
                        });
                    }
                    handler.core_metadata = Some(CoreMetadataChunk {
                        max_sample_rate: read_u24(data, payload_start),
                        bitrate_kbps: read_u16(data, payload_start + 3),
                        channel_mask: read_u16(data, payload_start + 5),
                        frame_payload_bytes: read_u32(data, payload_start + 7),
                    });
                }
                CHUNK_EXTSS_MD => {
                    if handler.ext_metadata.is_some() {
                        bail!(DtshdError::DuplicateChunk("EXTSS_MD"));
                    }
                    let is_vbr = handler
                        .header
                        .map(|hdr| hdr.is_vbr())
                        .unwrap_or(false);
                    let min_size = if is_vbr { 8 } else { 7 };
                    if chunk_size < min_size || chunk_size & 0x3 != 0 {
                        bail!(DtshdError::BadChunkSize {
                            chunk: "EXTSS_MD",
                            size: chunk_size as u64,
                        });
                    }

                    let mut meta = ExtMetadataChunk {
                        avg_bitrate_kbps: read_u24(data, payload_start),
                        ..Default::default()
                    };
                    if is_vbr {
                        meta.peak_bitrate_kbps = read_u24(data, payload_start + 3);
                        meta.pbr_smoothing_buf_size_kib = read_u16(data, payload_start + 6);
                    } else {
                        meta.frame_payload_bytes = read_u32(data, payload_start + 3);
                    }
                    handler.ext_metadata = Some(meta);
                }
                CHUNK_AUPR_HDR => {
                    if handler.audio_pres.is_some() {
                        bail!(DtshdError::DuplicateChunk("AUPR-HDR"));
                    }
                    if chunk_size < 21 {
                        bail!(DtshdError::BadChunkSize {
                            chunk: "AUPR-HDR",
                            size: chunk_size as u64,
                        });
                    }
                    handler.audio_pres = Some(AudioPresMetadataChunk {
                        presentation_index: data[payload_start],
                        flags: read_u16(data, payload_start + 1),
                        max_sample_rate: read_u24(data, payload_start + 3),
                        nb_frames: read_u32(data, payload_start + 6),
                        samples_per_frame: read_u16(data, payload_start + 10),
                        nb_samples_orig_audio: read_u40(data, payload_start + 12),
                        channel_mask: read_u16(data, payload_start + 17),
                        codec_delay_samples: read_u16(data, payload_start + 19),
                    });
                }
                CHUNK_STRMDATA => {
                    if handler.stream_data.is_some() {
                        bail!(DtshdError::DuplicateChunk("STRMDATA"));
                    }
                    if chunk_size == 0 {
                        bail!(DtshdError::EmptyStreamData);
                    }
                    if payload_start + chunk_size > data.len() {
                        bail!(DtshdError::ChunkOverrun);
                    }
                    handler.stream_data = Some((payload_start, payload_start + chunk_size));
                }
                CHUNK_FILEINFO | CHUNK_AUPRINFO | CHUNK_NAVI_TBL | CHUNK_TIMECODE
                | CHUNK_BUILDVER | CHUNK_BLACKOUT | CHUNK_BRANCHPT => {
                    if seen_chunks.contains(&chunk_id) {
                        bail!(DtshdError::DuplicateChunk("metadata"));
                    }
                    seen_chunks.push(chunk_id);
                    debug!("Skipping DTS-HD metadata chunk {chunk_id:#018X}");
                }
                _ => {
                    debug!("Skipping unknown DTS-HD chunk {chunk_id:#018X}");
                }
            }

            // Chunks are DWORD-aligned.
            offset = payload_start + chunk_size.div_ceil(4) * 4;
        }

        if handler.header.is_none() {
            bail!(DtshdError::HeaderNotFirst);
        }

        Ok(handler)
    }

    fn parse_header(payload: &[u8], declared_size: u64) -> Result<FileHeaderChunk> {
        if payload.len() < 14 || declared_size & 0x3 != 0 {
            bail!(DtshdError::BadChunkSize {
                chunk: "DTSHDHDR",
                size: declared_size,
            });
        }

        let version = read_u32(payload, 0);
        if version != 0 {
            bail!(DtshdError::UnsupportedVersion(version));
        }

        // 40-bit time code: 2-bit reference clock code, 6 reserved bits,
        // 32-bit timestamp.
        let ref_clock_code = payload[4] >> 6;
        let timestamp = read_u32(payload, 5);

        Ok(FileHeaderChunk {
            version,
            ref_clock_code,
            timestamp,
            tc_frame_rate: payload[9],
            stream_metadata: read_u16(payload, 10),
            nb_audio_presentations: payload[12],
            nb_ext_substreams: payload[13],
        })
    }

    /// Warns once when the container requests PBR smoothing but no
    /// statistics file was supplied.
    pub fn warn_missing_pbr_stats(&mut self) {
        if !self.warned_missing_pbr_stats {
            warn!(
                "Missing .dtspbr statistics file, unable to perform the PBR \
                 smoothing requested by the input file"
            );
            self.warned_missing_pbr_stats = true;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn push_chunk(out: &mut Vec<u8>, id: u64, payload: &[u8]) {
        out.extend_from_slice(&id.to_be_bytes());
        out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        out.extend_from_slice(payload);
        while out.len() % 4 != 0 {
            out.push(0);
        }
    }

    pub(crate) fn build_container(stream: &[u8], pbr_buf_kib: u16) -> Vec<u8> {
        let mut out = Vec::new();

        let mut header = vec![0u8; 16];
        // version 0, ref clock 48 kHz (code 2 in the top bits of byte 4).
        header[4] = 0x80;
        header[10] = 0x00;
        header[11] = (BSM_IS_VBR | BSM_EXTSS_PRESENT) as u8;
        header[12] = 1; // one presentation
        header[13] = 0; // one extension substream
        push_chunk(&mut out, CHUNK_DTSHDHDR, &header);

        let mut ext_md = vec![0u8; 8];
        ext_md[0..3].copy_from_slice(&[0x00, 0x0F, 0x00]); // avg bitrate
        ext_md[3..6].copy_from_slice(&[0x00, 0x17, 0x70]); // peak bitrate
        ext_md[6..8].copy_from_slice(&pbr_buf_kib.to_be_bytes());
        push_chunk(&mut out, CHUNK_EXTSS_MD, &ext_md);

        push_chunk(&mut out, CHUNK_STRMDATA, stream);

        out
    }

    #[test]
    fn container_round_trip() -> Result<()> {
        let stream = [0xAAu8; 32];
        let data = build_container(&stream, 100);

        assert!(is_dtshd_file(&data));

        let handler = DtshdFileHandler::parse(&data)?;
        assert!(handler.header.unwrap().is_vbr());
        assert_eq!(handler.pbr_smoothing_buf_size_kib()?, 100);

        let (start, end) = handler.stream_data.unwrap();
        assert_eq!(&data[start..end], &stream);
        Ok(())
    }

    #[test]
    fn header_must_come_first() {
        let mut out = Vec::new();
        push_chunk(&mut out, CHUNK_FILEINFO, &[0u8; 8]);
        assert!(DtshdFileHandler::parse(&out).is_err());
    }

    #[test]
    fn duplicate_chunks_are_rejected() {
        let stream = [0u8; 4];
        let mut data = build_container(&stream, 10);
        let extra = build_container(&stream, 10);
        // Append a second EXTSS_MD chunk.
        data.extend_from_slice(&extra[32..56]);
        assert!(DtshdFileHandler::parse(&data).is_err());
    }
}
