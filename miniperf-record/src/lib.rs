//! Codec for the binary record stream produced by `perf_event_open` ring
//! buffers, and for the `PERFILE2` record file container that stores it.
//!
//! This crate has no OS dependencies; it only turns bytes into records and
//! back. All multi-byte fields are host-endian in memory buffers (they come
//! straight from the kernel); a record file embeds its endianness in the
//! magic value, and the reader handles both.

mod error;
mod event_attr;
mod file_format;
mod reader;
mod record;
mod writer;

pub use error::{Error, ReadError};
pub use event_attr::{
    AttrFlags, EventAttr, ReadFormat, SampleFormat, EVENT_TYPE_HARDWARE, EVENT_TYPE_HW_CACHE,
    EVENT_TYPE_RAW, EVENT_TYPE_SOFTWARE, EVENT_TYPE_TRACEPOINT, EVENT_TYPE_USER_SPACE_SAMPLER,
};
pub use file_format::{
    feature, dso_type, FeatureSet, FileAttr, FileFeature, FileHeader, FileSymbol, SectionDesc,
    PERF_MAGIC,
};
pub use reader::RecordFileReader;
pub use record::{
    BranchEntry, BuildIdRecord, CommRecord, DsoRecord, EventIdRecord, KernelSymbolRecord,
    LostRecord, Mmap2Record, MmapRecord, ReadValues, Record, RecordHeader, SampleId, SampleRecord,
    SymbolRecord, TaskRecord, TracingDataRecord, UnknownRecord, CPUMODE_MASK, MISC_KERNEL,
    MISC_USER, RECORD_HEADER_SIZE,
};
pub use writer::RecordFileWriter;

/// Byte order of a record file, decided by its magic value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    LittleEndian,
    BigEndian,
}

impl Endianness {
    #[cfg(target_endian = "little")]
    pub const NATIVE: Endianness = Endianness::LittleEndian;
    #[cfg(target_endian = "big")]
    pub const NATIVE: Endianness = Endianness::BigEndian;
}
