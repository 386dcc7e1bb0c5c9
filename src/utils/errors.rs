//! Error types for parsing, compliance checking and script generation.
//!
//! Bit-level truncation surfaces as `std::io::Error` with
//! `ErrorKind::UnexpectedEof` from the bit reader; everything else is one of
//! the typed errors below. Compliance errors are violations of BDAV
//! application constraints rather than bitstream syntax.

#[derive(thiserror::Error, Debug)]
pub enum Ac3Error {
    #[error("Unexpected sync word {0:#06X}, expect 0x0B77")]
    BadSyncWord(u16),

    #[error("Reserved sample rate code in use (fscod == {0:#X})")]
    ReservedFscod(u8),

    #[error("Reserved frame size code in use (frmsizecod == {0:#04X})")]
    ReservedFrmsizecod(u8),

    #[error("Unexpected or unsupported bit stream identifier (bsid == {0})")]
    UnsupportedBsid(u8),

    #[error("Reserved stream type in use (strmtyp == 0x3)")]
    ReservedStrmtyp,

    #[error("Unexpected non-zero substream identifier (substreamid == {0})")]
    NonZeroSubstreamId(u8),

    #[error("BDAV specifications disallow dual-mono audio coding mode (acmod == 0x0)")]
    DualMonoForbidden,

    #[error("BDAV specifications allow only 48 kHz sampling (fscod == {fscod:#X}, fscod2 == {fscod2:#X})")]
    SampleRateNot48kHz { fscod: u8, fscod2: u8 },

    #[error("BDAV specifications require an independent substream for secondary audio (strmtyp == {0})")]
    SecondaryNotIndependent(u8),

    #[error("Additional BSI length out of range (addbsil == {0})")]
    AddbsilRange(u8),

    #[error(
        "Dependent substream channel map gives {from_map} channels, acmod/lfeon give {from_acmod}"
    )]
    InconsistentChannelMap { from_map: u32, from_acmod: u32 },

    #[error("Stream parameter '{field}' changed between sync frames")]
    NonCompliantChange { field: &'static str },
}

#[derive(thiserror::Error, Debug)]
pub enum MlpSyncError {
    #[error("DVD Audio MLP format sync word in use (format_sync == 0xF8726FBB)")]
    DvdAudioFormatSync,

    #[error("Invalid format_sync, read {0:#010X}")]
    InvalidFormatSync(u32),

    #[error("Access unit length is too short ({0} words)")]
    AccessUnitTooShort(u16),

    #[error("Missing major sync in first access unit")]
    MissingMajorSync,

    #[error("Invalid signature in major_sync_info, read {0:#06X}, expected 0xB752")]
    InvalidSignature(u16),

    #[error("Reserved audio_sampling_frequency code {0:#X}")]
    ReservedSamplingFrequency(u8),

    #[error("Reserved {presentation}ch multichannel type code")]
    ReservedMultichannelType { presentation: u8 },

    #[error("{presentation}ch presentation declares {count} channels, exceeding {max}")]
    TooManyPresentationChannels { presentation: u8, count: u32, max: u32 },

    #[error("Scaled peak data rate {0} bps exceeds the 24.5 Mbps BDAV ceiling")]
    PeakDataRateTooHigh(u64),

    #[error("16ch channel meaning with multiple content types is not implemented")]
    MultiContentMeaningNotImplemented,

    #[error("Major sync declares {0} substreams, at most 4 are supported")]
    TooManySubstreams(usize),

    #[error("Extra channel meaning data uses {used} bits, only {available} declared")]
    ExtraChannelMeaningOverflow { used: u32, available: u32 },

    #[error("Invalid major_sync_info CRC, calculated {calculated:#06X}, read {read:#06X}")]
    MajorSyncCrcMismatch { calculated: u16, read: u16 },

    #[error("Major sync parameter '{field}' changed between access units")]
    NonCompliantChange { field: &'static str },
}

#[derive(thiserror::Error, Debug)]
pub enum MlpSubstreamError {
    #[error("mlp_sync failed the nibble parity check, calculated {0:#X}")]
    NibbleParity(u8),

    #[error("restart_nonexistent must be {expected} in an access unit with{suffix} major sync")]
    InvalidRestartNonexistent { expected: bool, suffix: &'static str },

    #[error("Substream {substream} end pointer {read:#05X} is not after the previous one {previous:#05X}")]
    EndPtrNotMonotonic {
        substream: usize,
        read: u16,
        previous: u16,
    },

    #[error("Substream {substream} end pointer {read:#05X} exceeds the access unit length ({max:#05X} words)")]
    EndPtrOutOfUnit {
        substream: usize,
        read: u16,
        max: u16,
    },

    #[error("Access unit header is longer than access_unit_length ({total} > {max} words)")]
    HeaderTooLong { total: u16, max: u16 },

    #[error("Invalid terminator A, expect 0x3FFF4, got {0:#07X}")]
    InvalidTerminatorA(u32),

    #[error("Invalid terminator B, expect 0x1234, got {0:#06X}")]
    InvalidTerminatorB(u16),

    #[error("End-of-stream signaling mismatch between substreams (substream {0})")]
    TerminatorMismatch(usize),

    #[error("Substream {substream} blocks exceed the directory size")]
    SegmentOverrun { substream: usize },

    #[error("Unexpected substream {substream} segment size, parsed {parsed} bits, expected {expected}")]
    SegmentSizeMismatch {
        substream: usize,
        parsed: u64,
        expected: u64,
    },

    #[error(
        "Parity check failed on substream {substream} segment, calculated {calculated:#04X}, read {read:#04X}"
    )]
    ParityMismatch {
        substream: usize,
        calculated: u8,
        read: u8,
    },

    #[error(
        "CRC failed on substream {substream} segment, calculated {calculated:#04X}, read {read:#04X}"
    )]
    CrcMismatch {
        substream: usize,
        calculated: u8,
        read: u8,
    },

    #[error("Substream {0} coded channel range overlaps a previous substream")]
    OverlappingCodedChannels(usize),
}

#[derive(thiserror::Error, Debug)]
pub enum MlpRestartHeaderError {
    #[error("Unknown restart_sync_word value {0:#06X}")]
    UnknownSyncWord(u16),

    #[error("Unexpected restart_sync_word {sync_word:#06X} for substream {substream}")]
    SyncWordForbiddenForSubstream { sync_word: u16, substream: usize },

    #[error("output_timing {read} does not match the running sample counter {expected}")]
    OutputTimingMismatch { read: u16, expected: u16 },

    #[error("max_chan {max_chan} must be greater than min_chan {min_chan}")]
    ChannelRangeEmpty { min_chan: u8, max_chan: u8 },

    #[error("Substream {substream} carries {count} channels, exceeding {max}")]
    TooManyChannels {
        substream: usize,
        count: u32,
        max: u32,
    },

    #[error("max_matrix_chan {0} exceeds the matrix channel limit")]
    TooManyMatrixChannels(u8),

    #[error("max_shift {0} out of [0, 24]")]
    MaxShiftOutOfRange(i8),

    #[error("max_lsbs {0} exceeds 24 bits")]
    MaxLsbsTooLarge(u8),

    #[error("Second occurrence of max_bits does not match first ({first} != {second})")]
    MaxBitsMismatch { first: u8, second: u8 },

    #[error("max_bits {0} exceeds 24 bits")]
    MaxBitsTooLarge(u8),

    #[error("ch_assign[{index}] == {value} exceeds max_matrix_chan {max}")]
    ChannelAssignTooHigh { index: usize, value: u8, max: u8 },

    #[error("Invalid restart_header CRC, calculated {calculated:#04X}, read {read:#04X}")]
    CrcMismatch { calculated: u8, read: u8 },
}

#[derive(thiserror::Error, Debug)]
pub enum MlpBlockError {
    #[error("block_size {0} exceeds the access unit sample count")]
    BlockSizeTooLarge(u16),

    #[error("Missing restart header before the first block of the substream")]
    MissingRestartHeader,

    #[error("Matrix parameters present more than once in an access unit")]
    MatrixParametersRepeated,

    #[error("{filter} filter parameters present more than once in an access unit for channel {channel}")]
    FilterParametersRepeated {
        filter: &'static str,
        channel: usize,
    },

    #[error("num_huffman_lsbs {0} exceeds 24 bits")]
    HuffmanLsbsTooLarge(u8),

    #[error("quant_step_size {step} exceeds num_huffman_lsbs {lsbs} for channel {channel}")]
    QuantStepTooLarge { channel: usize, step: u8, lsbs: u8 },

    #[error("output_shift {0} out of [0, 23]")]
    OutputShiftOutOfRange(i8),

    #[error("Unable to decode a Huffman code word in block data (input {input:#05X})")]
    HuffmanDecodeFailure { input: u16 },
}

#[derive(thiserror::Error, Debug)]
pub enum MlpFilterError {
    #[error("{filter} filter order {order} exceeds {max}")]
    OrderTooHigh {
        filter: &'static str,
        order: u8,
        max: u8,
    },

    #[error("coeff_bits must be between 1 and 16, got {0}")]
    InvalidCoeffBits(u8),

    #[error("coeff_bits + coeff_shift must be <= 16, got {0}")]
    TotalCoeffBitsTooLarge(u8),

    #[error("FIR filter must not carry state values")]
    FirStateForbidden,

    #[error("state_bits + state_shift must be <= 24, got {0}")]
    TotalStateBitsTooLarge(u8),

    #[error("FIR and IIR filter order sum exceeds 8 ({fir} + {iir})")]
    TotalOrderTooHigh { fir: u8, iir: u8 },

    #[error("FIR and IIR filter shifts disagree ({fir} != {iir})")]
    ShiftMismatch { fir: u8, iir: u8 },
}

#[derive(thiserror::Error, Debug)]
pub enum MlpMatrixError {
    #[error("num_primitive_matrices {0} exceeds the matrix limit")]
    TooManyMatrices(u8),
}

#[derive(thiserror::Error, Debug)]
pub enum MlpExtraDataError {
    #[error("EXTRA_DATA length nibble check failed ({0:#06X})")]
    LengthParityFailed(u16),

    #[error("EXTRA_DATA length {length} words exceeds the remaining access unit bits ({remaining})")]
    TooLong { length: u16, remaining: u64 },

    #[error("Invalid EXTRA_DATA parity, calculated {calculated:#04X}, read {read:#04X}")]
    ParityMismatch { calculated: u8, read: u8 },
}

#[derive(thiserror::Error, Debug)]
pub enum DtsCoreError {
    #[error("Unexpected non-DCA Core sync word ({0:#010X})")]
    BadSyncWord(u32),

    #[error("Invalid NBLKS field range ({0} < 5)")]
    NblksRange(u8),

    #[error("Invalid NBLKS {0} for a normal frame (expect 8, 16, 32, 64 or 128 blocks)")]
    NblksNormalFrame(u8),

    #[error("Invalid SHORT {0} for a normal frame (expect 32 samples per block)")]
    ShortNormalFrame(u8),

    #[error("Invalid Core frame size range (FSIZE {0} < 95)")]
    FsizeRange(u16),

    #[error("Negative Core substream payload size ({0} bytes)")]
    NegativePayloadSize(i64),

    #[error("Reserved value in use (SFREQ == {0:#X})")]
    ReservedSfreq(u8),

    #[error("BDAV specifications allow only 48 kHz Core sampling (found {0} Hz)")]
    SampleRateNot48kHz(u32),

    #[error("Reserved value in use (RATE == {0:#04X})")]
    ReservedRate(u8),

    #[error("BDAV specifications disallow the open bit-rate mode of DCA Core")]
    OpenRateForbidden,

    #[error("BDAV specifications disallow dual-mono Core audio for a secondary stream")]
    DualMonoForbidden,

    #[error("Incompatible DCA encoder software revision (VERNUM == {0:#X})")]
    UnsupportedVernum(u8),

    #[error("Core frame parameter '{field}' changed between frames")]
    NonCompliantChange { field: &'static str },
}

#[derive(thiserror::Error, Debug)]
pub enum DtsExtSSError {
    #[error("Unexpected non-DCA Extension Substream sync word ({0:#010X})")]
    BadSyncWord(u32),

    #[error("Unexpected Extension Substream index {0} (expect 0 for primary, 2 for secondary)")]
    BadExtSSIndex(u8),

    #[error("Expect presence of static fields in the Extension Substream header")]
    MissingStaticFields,

    #[error("Reference clock {0:#X} is not a 48 kHz multiple")]
    BadReferenceClock(u8),

    #[error("Unexpected number of audio presentations ({0}), BDAV allows 1")]
    TooManyAudioPresentations(u8),

    #[error("Unexpected number of audio assets ({0}), BDAV allows 1")]
    TooManyAudioAssets(u8),

    #[error("Unexpected active Extension Substream mask {read:#04X}, expect {expected:#04X}")]
    BadActiveExtSSMask { read: u8, expected: u8 },

    #[error("Reserved mix metadata adjustment level (0x3)")]
    ReservedMixAdjustmentLevel,

    #[error("Asset info text exceeds 1024 bytes ({0})")]
    InfoTextTooLong(u32),

    #[error("Unexpected asset PCM bit depth {0} (BDAV allows 16 or 24 bits)")]
    BadBitDepth(u8),

    #[error("Reserved asset sample rate code {0:#X}")]
    ReservedSampleRate(u8),

    #[error("Unexpected asset sample rate {0} Hz (BDAV allows 48, 96 or 192 kHz)")]
    BadSampleRate(u32),

    #[error("Secondary asset sample rate {0} Hz (BDAV allows only 48 kHz)")]
    SecondaryNot48kHz(u32),

    #[error("Asset carries {channels} channels at {rate} Hz, exceeding the BDAV limit")]
    TooManyChannels { channels: u8, rate: u32 },

    #[error("Speaker activity mask names {mask_channels} channels, asset declares {channels}")]
    SpeakerMaskChannelMismatch { mask_channels: u8, channels: u8 },

    #[error("Speaker remap sets present without a speaker activity mask")]
    RemapWithoutSpeakerMask,

    #[error("Unexpected secondary-stream coding mode, BDAV requires DTS-HD low bit-rate")]
    SecondaryCodingMode,

    #[error("Unexpected primary-stream coding mode, BDAV requires DTS-HD components with a separate Core")]
    PrimaryCodingMode,

    #[error("Primary asset must not embed the Core inside the Extension Substream")]
    CoreInExtSSForbidden,

    #[error("XLL component only supported in the first audio asset")]
    XllAssetNotFirst,

    #[error("Unexpected presence of a backward compatible Core for a secondary stream")]
    SecondaryBcCorePresent,

    #[error("Missing backward compatible Core reference in the Extension Substream header")]
    MissingBcCore,

    #[error("Backward compatible Core must point to Extension Substream 0, asset 0 (read {ext_ss_index}/{asset_index})")]
    BadBcCoreLocation { ext_ss_index: u8, asset_index: u8 },

    #[error("Unexpected Extension Substream asset descriptor length")]
    AssetDescriptorOverrun,

    #[error("Unexpected Extension Substream header length")]
    HeaderOverrun,

    #[error("Unexpected Extension Substream frame length (parsed {parsed} bytes, expected {expected})")]
    FrameSizeMismatch { parsed: u64, expected: u64 },

    #[error("Invalid Extension Substream header CRC, calculated {calculated:#06X}, read {read:#06X}")]
    CrcMismatch { calculated: u16, read: u16 },
}

#[derive(thiserror::Error, Debug)]
pub enum DtsXllError {
    #[error("Unexpected DTS XLL sync word ({0:#010X})")]
    BadSyncWord(u32),

    #[error("Unsupported DTS XLL stream syntax version {0}")]
    UnsupportedVersion(u8),

    #[error("XLL frame size {0} exceeds the 240 KiB PBR buffer capacity")]
    FrameSizeTooLarge(u32),

    #[error("PBR smoothing buffer overflow ({capacity} < {used} bytes)")]
    PbrBufferOverflow { capacity: u32, used: u32 },

    #[error("PBR buffering underflow, no frame ready to decode")]
    PbrBufferUnderflow,

    #[error("Out-of-asset XLL sync word offset ({offset} >= {asset_size} bytes)")]
    SyncOffsetOutOfAsset { offset: u32, asset_size: u32 },

    #[error("Garbage out-of-sync XLL audio data of {0} bytes at stream start")]
    LeadingGarbage(u32),

    #[error("Unexpected data in asset after the end of the XLL component")]
    TrailingAssetData,

    #[error("Too many channel sets in the XLL frame ({0})")]
    TooManyChannelSets(u8),

    #[error("Too many channels in an XLL channel set ({0})")]
    TooManyChannels(u8),

    #[error("XLL segment geometry exceeds limits ({segments} segments of {samples} samples)")]
    BadSegmentGeometry { segments: u32, samples: u32 },

    #[error("Unexpected XLL common header size")]
    HeaderOverrun,

    #[error("Invalid XLL header CRC, calculated {calculated:#06X}, read {read:#06X}")]
    CrcMismatch { calculated: u16, read: u16 },

    #[error("Source positions are too fragmented for an XLL frame")]
    TooFragmented,

    #[error("Requested slice is larger than the amount of decoded XLL data")]
    SliceTooLarge,

    #[error("Absolute offset {0:#X} falls outside the frame's source ranges")]
    OffsetOutsideFrame(i64),
}

#[derive(thiserror::Error, Debug)]
pub enum DtsPbrError {
    #[error("Expect a frame-rate value on the first line of the statistics file")]
    MissingFrameRate,

    #[error("Malformed statistics entry at line {0}, expect \"HH:MM:SS:FF,size\"")]
    MalformedEntry(usize),

    #[error("First statistics entry timestamp must be zero")]
    NonZeroFirstTimestamp,

    #[error("Statistics entry at line {0} is not after the previous one")]
    NonMonotonicTimestamp(usize),

    #[error("Unknown audio frame index {index} ({count} frames registered)")]
    UnknownFrameIndex { index: usize, count: usize },

    #[error("PBR smoothing is infeasible, {0} bytes cannot be placed")]
    SmoothingInfeasible(u32),
}

#[derive(thiserror::Error, Debug)]
pub enum DtsPatcherError {
    #[error("Value {value:#X} does not fit the {width}-bit field '{field}'")]
    FieldOverflow {
        field: &'static str,
        value: u64,
        width: u32,
    },

    #[error("Rebuilding mix metadata is not implemented")]
    MixMetadataNotImplemented,

    #[error("Rebuilding headers with coding mode {0} is not implemented")]
    CodingModeNotImplemented(u8),

    #[error("Rebuilding Rev2 DRC metadata is not implemented")]
    DrcRev2NotImplemented,

    #[error("Rebuilt header size mismatch (computed {computed} bytes, wrote {written})")]
    SizeMismatch { computed: u64, written: u64 },
}

#[derive(thiserror::Error, Debug)]
pub enum DtshdError {
    #[error("Expect DTSHDHDR to be the first chunk of a DTS-HD file")]
    HeaderNotFirst,

    #[error("Unsupported DTS-HD file header version ({0})")]
    UnsupportedVersion(u32),

    #[error("Invalid DTS-HD chunk size ({size:#X} bytes for {chunk})")]
    BadChunkSize { chunk: &'static str, size: u64 },

    #[error("Duplicated DTS-HD chunk {0}")]
    DuplicateChunk(&'static str),

    #[error("Empty STRMDATA chunk")]
    EmptyStreamData,

    #[error("DTS-HD chunk is longer than its declared size")]
    ChunkOverrun,

    #[error("Missing PBR smoothing buffer size, no EXTSS_MD chunk in the DTS-HD header")]
    MissingExtMetadata,
}

#[derive(thiserror::Error, Debug)]
pub enum FrameError {
    #[error("Attempt to double initialize an access unit cell")]
    CellAlreadyOpen,

    #[error("Access unit cell never initialized")]
    NoCellOpen,

    #[error("Replacement parameters already defined for the current cell")]
    ReplacementAlreadySet,

    #[error("Incomplete access unit cell at finalization")]
    IncompleteCell,

    #[error("Unexpected access unit content")]
    UnexpectedContent,
}

#[derive(thiserror::Error, Debug)]
pub enum DriverError {
    #[error("Unknown sync word {0:#010X}")]
    UnknownSyncWord(u32),

    #[error("Unexpected empty input stream")]
    EmptyStream,

    #[error("PBR smoothing is only available for DTS XLL streams")]
    PbrWithoutXll,

    #[error("Missing mandatory static fields, unable to define audio properties")]
    MissingProperties,
}
