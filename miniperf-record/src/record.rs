use byteorder::{ByteOrder, WriteBytesExt};

use crate::error::ReadError;
use crate::event_attr::{EventAttr, ReadFormat, SampleFormat};

pub const RECORD_HEADER_SIZE: usize = 8;

pub const PERF_RECORD_MMAP: u32 = 1;
pub const PERF_RECORD_LOST: u32 = 2;
pub const PERF_RECORD_COMM: u32 = 3;
pub const PERF_RECORD_EXIT: u32 = 4;
pub const PERF_RECORD_FORK: u32 = 7;
pub const PERF_RECORD_SAMPLE: u32 = 9;
pub const PERF_RECORD_MMAP2: u32 = 10;
pub const PERF_RECORD_TRACING_DATA: u32 = 66;
pub const PERF_RECORD_BUILD_ID: u32 = 67;

// Private record types emitted by the profiler itself, outside the range the
// kernel will ever use.
const USER_RECORD_TYPE_START: u32 = 32768;
pub const RECORD_KERNEL_SYMBOL: u32 = USER_RECORD_TYPE_START + 1;
pub const RECORD_DSO: u32 = USER_RECORD_TYPE_START + 2;
pub const RECORD_SYMBOL: u32 = USER_RECORD_TYPE_START + 3;
pub const RECORD_EVENT_ID: u32 = USER_RECORD_TYPE_START + 6;

pub const CPUMODE_MASK: u16 = 0x7;
pub const MISC_KERNEL: u16 = 1;
pub const MISC_USER: u16 = 2;

/// The fixed header that starts every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub record_type: u32,
    pub misc: u16,
    pub size: u16,
}

impl RecordHeader {
    pub fn parse<T: ByteOrder>(data: &[u8]) -> Result<Self, ReadError> {
        if data.len() < RECORD_HEADER_SIZE {
            return Err(ReadError::RecordHeader);
        }
        let header = RecordHeader {
            record_type: T::read_u32(&data[0..4]),
            misc: T::read_u16(&data[4..6]),
            size: T::read_u16(&data[6..8]),
        };
        if (header.size as usize) < RECORD_HEADER_SIZE {
            return Err(ReadError::InvalidRecordSize);
        }
        Ok(header)
    }

    fn encode<T: ByteOrder>(&self, buf: &mut Vec<u8>) {
        let mut hdr = [0u8; RECORD_HEADER_SIZE];
        T::write_u32(&mut hdr[0..4], self.record_type);
        T::write_u16(&mut hdr[4..6], self.misc);
        T::write_u16(&mut hdr[6..8], self.size);
        buf.extend_from_slice(&hdr);
    }
}

/// Bounds-checked reader over one record's bytes.
struct RecordCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> RecordCursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        RecordCursor { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], ReadError> {
        if self.remaining() < len {
            return Err(ReadError::FieldOutOfBounds);
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn read_u32<T: ByteOrder>(&mut self) -> Result<u32, ReadError> {
        Ok(T::read_u32(self.bytes(4)?))
    }

    fn read_u64<T: ByteOrder>(&mut self) -> Result<u64, ReadError> {
        Ok(T::read_u64(self.bytes(8)?))
    }

    /// Read a NUL-terminated string whose storage (including padding) runs to
    /// the end of this cursor's data.
    fn read_string_to_end(&mut self) -> Result<String, ReadError> {
        let rest = self.bytes(self.remaining())?;
        let nul = memchr::memchr(0, rest).ok_or(ReadError::UnterminatedString)?;
        Ok(String::from_utf8_lossy(&rest[..nul]).into_owned())
    }

    /// Read a NUL-terminated string padded out to a multiple of `align`.
    fn read_string_padded(&mut self, align: usize) -> Result<String, ReadError> {
        let start = self.pos;
        let rest = &self.data[self.pos..];
        let nul = memchr::memchr(0, rest).ok_or(ReadError::UnterminatedString)?;
        let s = String::from_utf8_lossy(&rest[..nul]).into_owned();
        let consumed = align_up(nul + 1, align);
        if start + consumed > self.data.len() {
            return Err(ReadError::FieldOutOfBounds);
        }
        self.pos = start + consumed;
        Ok(s)
    }
}

fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) / align * align
}

fn write_string_padded<T: ByteOrder>(buf: &mut Vec<u8>, s: &str, align: usize) {
    let storage = align_up(s.len() + 1, align);
    buf.extend_from_slice(s.as_bytes());
    buf.resize(buf.len() + (storage - s.len()), 0);
}

fn padded_string_len(s: &str, align: usize) -> usize {
    align_up(s.len() + 1, align)
}

/// Trailing tuple of sample fields carried by non-sample records when the
/// attr has `sample_id_all` set. Field presence is governed by the attr's
/// selector mask; absent fields stay zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleId {
    pub pid: u32,
    pub tid: u32,
    pub time: u64,
    pub id: u64,
    pub stream_id: u64,
    pub cpu: u32,
    pub res: u32,
}

impl SampleId {
    /// Encoded size for the given attr, zero when `sample_id_all` is unset.
    pub fn size_for(attr: &EventAttr) -> usize {
        if !attr.sample_id_all() {
            return 0;
        }
        let st = attr.sample_type;
        let mut size = 0;
        for flag in [
            SampleFormat::TID,
            SampleFormat::TIME,
            SampleFormat::ID,
            SampleFormat::STREAM_ID,
            SampleFormat::CPU,
            SampleFormat::IDENTIFIER,
        ] {
            if st.contains(flag) {
                size += 8;
            }
        }
        size
    }

    fn parse<T: ByteOrder>(cursor: &mut RecordCursor, attr: &EventAttr) -> Result<Self, ReadError> {
        let mut sample_id = SampleId::default();
        if !attr.sample_id_all() {
            return Ok(sample_id);
        }
        let st = attr.sample_type;
        if st.contains(SampleFormat::TID) {
            sample_id.pid = cursor.read_u32::<T>()?;
            sample_id.tid = cursor.read_u32::<T>()?;
        }
        if st.contains(SampleFormat::TIME) {
            sample_id.time = cursor.read_u64::<T>()?;
        }
        if st.contains(SampleFormat::ID) {
            sample_id.id = cursor.read_u64::<T>()?;
        }
        if st.contains(SampleFormat::STREAM_ID) {
            sample_id.stream_id = cursor.read_u64::<T>()?;
        }
        if st.contains(SampleFormat::CPU) {
            sample_id.cpu = cursor.read_u32::<T>()?;
            sample_id.res = cursor.read_u32::<T>()?;
        }
        if st.contains(SampleFormat::IDENTIFIER) {
            sample_id.id = cursor.read_u64::<T>()?;
        }
        Ok(sample_id)
    }

    fn encode<T: ByteOrder>(&self, buf: &mut Vec<u8>, attr: &EventAttr) {
        if !attr.sample_id_all() {
            return;
        }
        let st = attr.sample_type;
        if st.contains(SampleFormat::TID) {
            buf.write_u32::<T>(self.pid).unwrap();
            buf.write_u32::<T>(self.tid).unwrap();
        }
        if st.contains(SampleFormat::TIME) {
            buf.write_u64::<T>(self.time).unwrap();
        }
        if st.contains(SampleFormat::ID) {
            buf.write_u64::<T>(self.id).unwrap();
        }
        if st.contains(SampleFormat::STREAM_ID) {
            buf.write_u64::<T>(self.stream_id).unwrap();
        }
        if st.contains(SampleFormat::CPU) {
            buf.write_u32::<T>(self.cpu).unwrap();
            buf.write_u32::<T>(self.res).unwrap();
        }
        if st.contains(SampleFormat::IDENTIFIER) {
            buf.write_u64::<T>(self.id).unwrap();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MmapRecord {
    pub misc: u16,
    pub pid: u32,
    pub tid: u32,
    pub addr: u64,
    pub len: u64,
    pub pgoff: u64,
    pub filename: String,
    pub sample_id: SampleId,
}

impl MmapRecord {
    pub fn in_kernel(&self) -> bool {
        self.misc & CPUMODE_MASK == MISC_KERNEL
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Mmap2Record {
    pub misc: u16,
    pub pid: u32,
    pub tid: u32,
    pub addr: u64,
    pub len: u64,
    pub pgoff: u64,
    pub maj: u32,
    pub min: u32,
    pub ino: u64,
    pub ino_generation: u64,
    pub prot: u32,
    pub flags: u32,
    pub filename: String,
    pub sample_id: SampleId,
}

impl Mmap2Record {
    pub fn in_kernel(&self) -> bool {
        self.misc & CPUMODE_MASK == MISC_KERNEL
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommRecord {
    pub misc: u16,
    pub pid: u32,
    pub tid: u32,
    pub comm: String,
    pub sample_id: SampleId,
}

/// Shared by fork and exit records, which have identical layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskRecord {
    pub pid: u32,
    pub ppid: u32,
    pub tid: u32,
    pub ptid: u32,
    pub time: u64,
    pub sample_id: SampleId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LostRecord {
    pub id: u64,
    pub lost: u64,
    pub sample_id: SampleId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadValues {
    pub value: u64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BranchEntry {
    pub from: u64,
    pub to: u64,
    pub flags: u64,
}

/// A sample. Which fields are meaningful is governed by the attr's selector
/// mask; the rest stay at their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SampleRecord {
    pub misc: u16,
    pub id: u64,
    pub ip: u64,
    pub pid: u32,
    pub tid: u32,
    pub time: u64,
    pub addr: u64,
    pub stream_id: u64,
    pub cpu: u32,
    pub res: u32,
    pub period: u64,
    pub read: ReadValues,
    pub callchain: Vec<u64>,
    pub raw: Vec<u8>,
    pub branch_stack: Vec<BranchEntry>,
    pub regs_abi: u64,
    pub regs: Vec<u64>,
    pub stack: Vec<u8>,
    pub stack_dyn_size: u64,
}

impl SampleRecord {
    pub fn in_kernel(&self) -> bool {
        self.misc & CPUMODE_MASK == MISC_KERNEL
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BuildIdRecord {
    pub misc: u16,
    pub pid: i32,
    pub build_id: Vec<u8>,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KernelSymbolRecord {
    pub kallsyms: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DsoRecord {
    pub dso_type: u64,
    pub dso_id: u64,
    pub min_vaddr: u64,
    pub dso_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SymbolRecord {
    pub dso_id: u64,
    pub addr: u64,
    pub len: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TracingDataRecord {
    pub data: Vec<u8>,
}

/// Maps each event file id opened after a CPU came online to the index of
/// its attr, so the consumer can correlate late files with events.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventIdRecord {
    /// Pairs of (attr index, event file id).
    pub ids: Vec<(u64, u64)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownRecord {
    pub record_type: u32,
    pub misc: u16,
    pub payload: Vec<u8>,
}

/// One decoded record. A new record type is a new variant plus codec cases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Mmap(MmapRecord),
    Mmap2(Mmap2Record),
    Comm(CommRecord),
    Fork(TaskRecord),
    Exit(TaskRecord),
    Lost(LostRecord),
    Sample(SampleRecord),
    BuildId(BuildIdRecord),
    KernelSymbol(KernelSymbolRecord),
    Dso(DsoRecord),
    Symbol(SymbolRecord),
    TracingData(TracingDataRecord),
    EventId(EventIdRecord),
    Unknown(UnknownRecord),
}

impl Record {
    pub fn record_type(&self) -> u32 {
        match self {
            Record::Mmap(_) => PERF_RECORD_MMAP,
            Record::Mmap2(_) => PERF_RECORD_MMAP2,
            Record::Comm(_) => PERF_RECORD_COMM,
            Record::Fork(_) => PERF_RECORD_FORK,
            Record::Exit(_) => PERF_RECORD_EXIT,
            Record::Lost(_) => PERF_RECORD_LOST,
            Record::Sample(_) => PERF_RECORD_SAMPLE,
            Record::BuildId(_) => PERF_RECORD_BUILD_ID,
            Record::KernelSymbol(_) => RECORD_KERNEL_SYMBOL,
            Record::Dso(_) => RECORD_DSO,
            Record::Symbol(_) => RECORD_SYMBOL,
            Record::TracingData(_) => PERF_RECORD_TRACING_DATA,
            Record::EventId(_) => RECORD_EVENT_ID,
            Record::Unknown(r) => r.record_type,
        }
    }

    pub fn is_sample(&self) -> bool {
        matches!(self, Record::Sample(_))
    }

    /// The time this record was produced: the sample's own time field, or
    /// the `sample_id` trailer of a kernel record, or 0.
    pub fn timestamp(&self) -> u64 {
        match self {
            Record::Sample(r) => r.time,
            Record::Mmap(r) => r.sample_id.time,
            Record::Mmap2(r) => r.sample_id.time,
            Record::Comm(r) => r.sample_id.time,
            Record::Fork(r) | Record::Exit(r) => r.sample_id.time,
            Record::Lost(r) => r.sample_id.time,
            _ => 0,
        }
    }

    /// Decode one record from `data`, which must hold exactly
    /// `header.size` bytes. Unknown types are not an error.
    pub fn parse<T: ByteOrder>(data: &[u8], attr: &EventAttr) -> Result<Record, ReadError> {
        let header = RecordHeader::parse::<T>(data)?;
        if header.size as usize != data.len() {
            return Err(ReadError::InvalidRecordSize);
        }
        let sid_size = match header.record_type {
            PERF_RECORD_MMAP | PERF_RECORD_MMAP2 | PERF_RECORD_COMM | PERF_RECORD_FORK
            | PERF_RECORD_EXIT | PERF_RECORD_LOST => SampleId::size_for(attr),
            _ => 0,
        };
        let body_end = data
            .len()
            .checked_sub(sid_size)
            .ok_or(ReadError::FieldOutOfBounds)?;
        if body_end < RECORD_HEADER_SIZE {
            return Err(ReadError::FieldOutOfBounds);
        }
        let mut cursor = RecordCursor::new(&data[RECORD_HEADER_SIZE..body_end]);
        let mut sid_cursor = RecordCursor::new(&data[body_end..]);

        let record = match header.record_type {
            PERF_RECORD_MMAP => {
                let pid = cursor.read_u32::<T>()?;
                let tid = cursor.read_u32::<T>()?;
                let addr = cursor.read_u64::<T>()?;
                let len = cursor.read_u64::<T>()?;
                let pgoff = cursor.read_u64::<T>()?;
                let filename = cursor.read_string_to_end()?;
                Record::Mmap(MmapRecord {
                    misc: header.misc,
                    pid,
                    tid,
                    addr,
                    len,
                    pgoff,
                    filename,
                    sample_id: SampleId::parse::<T>(&mut sid_cursor, attr)?,
                })
            }
            PERF_RECORD_MMAP2 => {
                let pid = cursor.read_u32::<T>()?;
                let tid = cursor.read_u32::<T>()?;
                let addr = cursor.read_u64::<T>()?;
                let len = cursor.read_u64::<T>()?;
                let pgoff = cursor.read_u64::<T>()?;
                let maj = cursor.read_u32::<T>()?;
                let min = cursor.read_u32::<T>()?;
                let ino = cursor.read_u64::<T>()?;
                let ino_generation = cursor.read_u64::<T>()?;
                let prot = cursor.read_u32::<T>()?;
                let flags = cursor.read_u32::<T>()?;
                let filename = cursor.read_string_to_end()?;
                Record::Mmap2(Mmap2Record {
                    misc: header.misc,
                    pid,
                    tid,
                    addr,
                    len,
                    pgoff,
                    maj,
                    min,
                    ino,
                    ino_generation,
                    prot,
                    flags,
                    filename,
                    sample_id: SampleId::parse::<T>(&mut sid_cursor, attr)?,
                })
            }
            PERF_RECORD_COMM => {
                let pid = cursor.read_u32::<T>()?;
                let tid = cursor.read_u32::<T>()?;
                let comm = cursor.read_string_to_end()?;
                Record::Comm(CommRecord {
                    misc: header.misc,
                    pid,
                    tid,
                    comm,
                    sample_id: SampleId::parse::<T>(&mut sid_cursor, attr)?,
                })
            }
            PERF_RECORD_FORK | PERF_RECORD_EXIT => {
                let task = TaskRecord {
                    pid: cursor.read_u32::<T>()?,
                    ppid: cursor.read_u32::<T>()?,
                    tid: cursor.read_u32::<T>()?,
                    ptid: cursor.read_u32::<T>()?,
                    time: cursor.read_u64::<T>()?,
                    sample_id: SampleId::parse::<T>(&mut sid_cursor, attr)?,
                };
                if header.record_type == PERF_RECORD_FORK {
                    Record::Fork(task)
                } else {
                    Record::Exit(task)
                }
            }
            PERF_RECORD_LOST => Record::Lost(LostRecord {
                id: cursor.read_u64::<T>()?,
                lost: cursor.read_u64::<T>()?,
                sample_id: SampleId::parse::<T>(&mut sid_cursor, attr)?,
            }),
            PERF_RECORD_SAMPLE => Record::Sample(Self::parse_sample::<T>(
                header.misc,
                &mut cursor,
                attr,
            )?),
            PERF_RECORD_BUILD_ID => {
                let pid = cursor.read_u32::<T>()? as i32;
                // The build id occupies 20 bytes, stored padded to 24.
                let build_id = cursor.bytes(20)?.to_vec();
                cursor.bytes(4)?;
                let filename = cursor.read_string_to_end()?;
                Record::BuildId(BuildIdRecord {
                    misc: header.misc,
                    pid,
                    build_id,
                    filename,
                })
            }
            RECORD_KERNEL_SYMBOL => {
                let size = cursor.read_u32::<T>()? as usize;
                let blob = cursor.bytes(size)?;
                Record::KernelSymbol(KernelSymbolRecord {
                    kallsyms: String::from_utf8_lossy(blob).into_owned(),
                })
            }
            RECORD_DSO => Record::Dso(DsoRecord {
                dso_type: cursor.read_u64::<T>()?,
                dso_id: cursor.read_u64::<T>()?,
                min_vaddr: cursor.read_u64::<T>()?,
                dso_name: cursor.read_string_padded(8)?,
            }),
            RECORD_SYMBOL => Record::Symbol(SymbolRecord {
                dso_id: cursor.read_u64::<T>()?,
                addr: cursor.read_u64::<T>()?,
                len: cursor.read_u64::<T>()?,
                name: cursor.read_string_padded(8)?,
            }),
            PERF_RECORD_TRACING_DATA => {
                let size = cursor.read_u32::<T>()? as usize;
                Record::TracingData(TracingDataRecord {
                    data: cursor.bytes(size)?.to_vec(),
                })
            }
            RECORD_EVENT_ID => {
                let count = cursor.read_u64::<T>()? as usize;
                if count > cursor.remaining() / 16 {
                    return Err(ReadError::FieldOutOfBounds);
                }
                let mut ids = Vec::with_capacity(count);
                for _ in 0..count {
                    let attr_id = cursor.read_u64::<T>()?;
                    let event_id = cursor.read_u64::<T>()?;
                    ids.push((attr_id, event_id));
                }
                Record::EventId(EventIdRecord { ids })
            }
            _ => Record::Unknown(UnknownRecord {
                record_type: header.record_type,
                misc: header.misc,
                payload: data[RECORD_HEADER_SIZE..].to_vec(),
            }),
        };
        Ok(record)
    }

    fn parse_sample<T: ByteOrder>(
        misc: u16,
        cursor: &mut RecordCursor,
        attr: &EventAttr,
    ) -> Result<SampleRecord, ReadError> {
        let st = attr.sample_type;
        let mut sample = SampleRecord {
            misc,
            ..Default::default()
        };
        if st.contains(SampleFormat::IDENTIFIER) {
            sample.id = cursor.read_u64::<T>()?;
        }
        if st.contains(SampleFormat::IP) {
            sample.ip = cursor.read_u64::<T>()?;
        }
        if st.contains(SampleFormat::TID) {
            sample.pid = cursor.read_u32::<T>()?;
            sample.tid = cursor.read_u32::<T>()?;
        }
        if st.contains(SampleFormat::TIME) {
            sample.time = cursor.read_u64::<T>()?;
        }
        if st.contains(SampleFormat::ADDR) {
            sample.addr = cursor.read_u64::<T>()?;
        }
        if st.contains(SampleFormat::ID) {
            sample.id = cursor.read_u64::<T>()?;
        }
        if st.contains(SampleFormat::STREAM_ID) {
            sample.stream_id = cursor.read_u64::<T>()?;
        }
        if st.contains(SampleFormat::CPU) {
            sample.cpu = cursor.read_u32::<T>()?;
            sample.res = cursor.read_u32::<T>()?;
        }
        if st.contains(SampleFormat::PERIOD) {
            sample.period = cursor.read_u64::<T>()?;
        }
        if st.contains(SampleFormat::READ) {
            if attr.read_format.contains(ReadFormat::GROUP) {
                return Err(ReadError::GroupReadFormat);
            }
            sample.read.value = cursor.read_u64::<T>()?;
            if attr.read_format.contains(ReadFormat::TOTAL_TIME_ENABLED) {
                sample.read.time_enabled = cursor.read_u64::<T>()?;
            }
            if attr.read_format.contains(ReadFormat::TOTAL_TIME_RUNNING) {
                sample.read.time_running = cursor.read_u64::<T>()?;
            }
            if attr.read_format.contains(ReadFormat::ID) {
                sample.read.id = cursor.read_u64::<T>()?;
            }
        }
        if st.contains(SampleFormat::CALLCHAIN) {
            let nr = cursor.read_u64::<T>()? as usize;
            if nr > cursor.remaining() / 8 {
                return Err(ReadError::FieldOutOfBounds);
            }
            let mut chain = Vec::with_capacity(nr);
            for _ in 0..nr {
                chain.push(cursor.read_u64::<T>()?);
            }
            sample.callchain = chain;
        }
        if st.contains(SampleFormat::RAW) {
            let size = cursor.read_u32::<T>()? as usize;
            sample.raw = cursor.bytes(size)?.to_vec();
        }
        if st.contains(SampleFormat::BRANCH_STACK) {
            let nr = cursor.read_u64::<T>()? as usize;
            if nr > cursor.remaining() / 24 {
                return Err(ReadError::FieldOutOfBounds);
            }
            let mut entries = Vec::with_capacity(nr);
            for _ in 0..nr {
                entries.push(BranchEntry {
                    from: cursor.read_u64::<T>()?,
                    to: cursor.read_u64::<T>()?,
                    flags: cursor.read_u64::<T>()?,
                });
            }
            sample.branch_stack = entries;
        }
        if st.contains(SampleFormat::REGS_USER) {
            sample.regs_abi = cursor.read_u64::<T>()?;
            if sample.regs_abi != 0 {
                let count = attr.user_regs_count();
                let mut regs = Vec::with_capacity(count);
                for _ in 0..count {
                    regs.push(cursor.read_u64::<T>()?);
                }
                sample.regs = regs;
            }
        }
        if st.contains(SampleFormat::STACK_USER) {
            let len = cursor.read_u64::<T>()? as usize;
            sample.stack = cursor.bytes(len)?.to_vec();
            if len != 0 {
                sample.stack_dyn_size = cursor.read_u64::<T>()?;
            }
        }
        Ok(sample)
    }

    /// Encode this record; the result's length equals the size written in
    /// its header.
    pub fn encode<T: ByteOrder>(&self, attr: &EventAttr) -> Vec<u8> {
        let mut payload = Vec::new();
        let mut misc = 0u16;
        match self {
            Record::Mmap(r) => {
                misc = r.misc;
                payload.write_u32::<T>(r.pid).unwrap();
                payload.write_u32::<T>(r.tid).unwrap();
                payload.write_u64::<T>(r.addr).unwrap();
                payload.write_u64::<T>(r.len).unwrap();
                payload.write_u64::<T>(r.pgoff).unwrap();
                write_string_padded::<T>(&mut payload, &r.filename, 8);
                r.sample_id.encode::<T>(&mut payload, attr);
            }
            Record::Mmap2(r) => {
                misc = r.misc;
                payload.write_u32::<T>(r.pid).unwrap();
                payload.write_u32::<T>(r.tid).unwrap();
                payload.write_u64::<T>(r.addr).unwrap();
                payload.write_u64::<T>(r.len).unwrap();
                payload.write_u64::<T>(r.pgoff).unwrap();
                payload.write_u32::<T>(r.maj).unwrap();
                payload.write_u32::<T>(r.min).unwrap();
                payload.write_u64::<T>(r.ino).unwrap();
                payload.write_u64::<T>(r.ino_generation).unwrap();
                payload.write_u32::<T>(r.prot).unwrap();
                payload.write_u32::<T>(r.flags).unwrap();
                write_string_padded::<T>(&mut payload, &r.filename, 8);
                r.sample_id.encode::<T>(&mut payload, attr);
            }
            Record::Comm(r) => {
                misc = r.misc;
                payload.write_u32::<T>(r.pid).unwrap();
                payload.write_u32::<T>(r.tid).unwrap();
                write_string_padded::<T>(&mut payload, &r.comm, 8);
                r.sample_id.encode::<T>(&mut payload, attr);
            }
            Record::Fork(r) | Record::Exit(r) => {
                payload.write_u32::<T>(r.pid).unwrap();
                payload.write_u32::<T>(r.ppid).unwrap();
                payload.write_u32::<T>(r.tid).unwrap();
                payload.write_u32::<T>(r.ptid).unwrap();
                payload.write_u64::<T>(r.time).unwrap();
                r.sample_id.encode::<T>(&mut payload, attr);
            }
            Record::Lost(r) => {
                payload.write_u64::<T>(r.id).unwrap();
                payload.write_u64::<T>(r.lost).unwrap();
                r.sample_id.encode::<T>(&mut payload, attr);
            }
            Record::Sample(r) => {
                misc = r.misc;
                Self::encode_sample::<T>(r, &mut payload, attr);
            }
            Record::BuildId(r) => {
                misc = r.misc;
                payload.write_u32::<T>(r.pid as u32).unwrap();
                let mut id = [0u8; 24];
                let n = r.build_id.len().min(20);
                id[..n].copy_from_slice(&r.build_id[..n]);
                payload.extend_from_slice(&id);
                write_string_padded::<T>(&mut payload, &r.filename, 64);
            }
            Record::KernelSymbol(r) => {
                payload.write_u32::<T>(r.kallsyms.len() as u32).unwrap();
                payload.extend_from_slice(r.kallsyms.as_bytes());
                let total = align_up(4 + r.kallsyms.len(), 8);
                payload.resize(total, 0);
            }
            Record::Dso(r) => {
                payload.write_u64::<T>(r.dso_type).unwrap();
                payload.write_u64::<T>(r.dso_id).unwrap();
                payload.write_u64::<T>(r.min_vaddr).unwrap();
                write_string_padded::<T>(&mut payload, &r.dso_name, 8);
            }
            Record::Symbol(r) => {
                payload.write_u64::<T>(r.dso_id).unwrap();
                payload.write_u64::<T>(r.addr).unwrap();
                payload.write_u64::<T>(r.len).unwrap();
                write_string_padded::<T>(&mut payload, &r.name, 8);
            }
            Record::TracingData(r) => {
                payload.write_u32::<T>(r.data.len() as u32).unwrap();
                payload.extend_from_slice(&r.data);
                let total = align_up(4 + r.data.len(), 64);
                payload.resize(total, 0);
            }
            Record::EventId(r) => {
                payload.write_u64::<T>(r.ids.len() as u64).unwrap();
                for &(attr_id, event_id) in &r.ids {
                    payload.write_u64::<T>(attr_id).unwrap();
                    payload.write_u64::<T>(event_id).unwrap();
                }
            }
            Record::Unknown(r) => {
                misc = r.misc;
                payload.extend_from_slice(&r.payload);
            }
        }

        // The header size field is 16 bits; oversized payloads (a kallsyms
        // dump, a large tracing blob) must be split into multiple records by
        // the producer.
        debug_assert!(RECORD_HEADER_SIZE + payload.len() <= u16::MAX as usize);
        let header = RecordHeader {
            record_type: self.record_type(),
            misc,
            size: (RECORD_HEADER_SIZE + payload.len()) as u16,
        };
        let mut buf = Vec::with_capacity(header.size as usize);
        header.encode::<T>(&mut buf);
        buf.extend_from_slice(&payload);
        buf
    }

    fn encode_sample<T: ByteOrder>(r: &SampleRecord, buf: &mut Vec<u8>, attr: &EventAttr) {
        let st = attr.sample_type;
        if st.contains(SampleFormat::IDENTIFIER) {
            buf.write_u64::<T>(r.id).unwrap();
        }
        if st.contains(SampleFormat::IP) {
            buf.write_u64::<T>(r.ip).unwrap();
        }
        if st.contains(SampleFormat::TID) {
            buf.write_u32::<T>(r.pid).unwrap();
            buf.write_u32::<T>(r.tid).unwrap();
        }
        if st.contains(SampleFormat::TIME) {
            buf.write_u64::<T>(r.time).unwrap();
        }
        if st.contains(SampleFormat::ADDR) {
            buf.write_u64::<T>(r.addr).unwrap();
        }
        if st.contains(SampleFormat::ID) {
            buf.write_u64::<T>(r.id).unwrap();
        }
        if st.contains(SampleFormat::STREAM_ID) {
            buf.write_u64::<T>(r.stream_id).unwrap();
        }
        if st.contains(SampleFormat::CPU) {
            buf.write_u32::<T>(r.cpu).unwrap();
            buf.write_u32::<T>(r.res).unwrap();
        }
        if st.contains(SampleFormat::PERIOD) {
            buf.write_u64::<T>(r.period).unwrap();
        }
        if st.contains(SampleFormat::READ) {
            buf.write_u64::<T>(r.read.value).unwrap();
            if attr.read_format.contains(ReadFormat::TOTAL_TIME_ENABLED) {
                buf.write_u64::<T>(r.read.time_enabled).unwrap();
            }
            if attr.read_format.contains(ReadFormat::TOTAL_TIME_RUNNING) {
                buf.write_u64::<T>(r.read.time_running).unwrap();
            }
            if attr.read_format.contains(ReadFormat::ID) {
                buf.write_u64::<T>(r.read.id).unwrap();
            }
        }
        if st.contains(SampleFormat::CALLCHAIN) {
            buf.write_u64::<T>(r.callchain.len() as u64).unwrap();
            for ip in &r.callchain {
                buf.write_u64::<T>(*ip).unwrap();
            }
        }
        if st.contains(SampleFormat::RAW) {
            buf.write_u32::<T>(r.raw.len() as u32).unwrap();
            buf.extend_from_slice(&r.raw);
        }
        if st.contains(SampleFormat::BRANCH_STACK) {
            buf.write_u64::<T>(r.branch_stack.len() as u64).unwrap();
            for entry in &r.branch_stack {
                buf.write_u64::<T>(entry.from).unwrap();
                buf.write_u64::<T>(entry.to).unwrap();
                buf.write_u64::<T>(entry.flags).unwrap();
            }
        }
        if st.contains(SampleFormat::REGS_USER) {
            buf.write_u64::<T>(r.regs_abi).unwrap();
            if r.regs_abi != 0 {
                for reg in &r.regs {
                    buf.write_u64::<T>(*reg).unwrap();
                }
            }
        }
        if st.contains(SampleFormat::STACK_USER) {
            buf.write_u64::<T>(r.stack.len() as u64).unwrap();
            buf.extend_from_slice(&r.stack);
            if !r.stack.is_empty() {
                buf.write_u64::<T>(r.stack_dyn_size).unwrap();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_attr::AttrFlags;
    use byteorder::NativeEndian;

    fn attr_with(sample_type: SampleFormat, sample_id_all: bool) -> EventAttr {
        let mut attr = EventAttr {
            sample_type,
            ..Default::default()
        };
        if sample_id_all {
            attr.flags |= AttrFlags::SAMPLE_ID_ALL;
        }
        attr
    }

    fn roundtrip(record: &Record, attr: &EventAttr) -> Record {
        let bytes = record.encode::<NativeEndian>(attr);
        let header = RecordHeader::parse::<NativeEndian>(&bytes).unwrap();
        assert_eq!(header.size as usize, bytes.len());
        Record::parse::<NativeEndian>(&bytes, attr).unwrap()
    }

    #[test]
    fn sample_roundtrip() {
        let attr = attr_with(
            SampleFormat::IP
                | SampleFormat::TID
                | SampleFormat::TIME
                | SampleFormat::PERIOD
                | SampleFormat::CALLCHAIN,
            true,
        );
        let record = Record::Sample(SampleRecord {
            ip: 0xdeadbeef,
            pid: 42,
            tid: 43,
            time: 1_000_000,
            period: 7,
            callchain: vec![0xA, 0xB, 0xC],
            ..Default::default()
        });
        assert_eq!(roundtrip(&record, &attr), record);
    }

    #[test]
    fn mmap_roundtrip_with_sample_id() {
        let attr = attr_with(SampleFormat::TID | SampleFormat::TIME | SampleFormat::ID, true);
        let record = Record::Mmap(MmapRecord {
            misc: MISC_USER,
            pid: 100,
            tid: 101,
            addr: 0x7f00_0000,
            len: 0x2000,
            pgoff: 0x1000,
            filename: "/system/lib64/libc.so".into(),
            sample_id: SampleId {
                pid: 100,
                tid: 101,
                time: 555,
                id: 9,
                ..Default::default()
            },
        });
        let bytes = record.encode::<NativeEndian>(&attr);
        // The filename storage is NUL-padded to 8 bytes.
        assert_eq!(bytes.len() % 8, 0);
        assert_eq!(roundtrip(&record, &attr), record);
        let decoded = roundtrip(&record, &attr);
        assert_eq!(decoded.timestamp(), 555);
        assert!(!decoded.is_sample());
    }

    #[test]
    fn fork_and_comm_roundtrip() {
        let attr = attr_with(SampleFormat::TIME, true);
        let fork = Record::Fork(TaskRecord {
            pid: 10,
            ppid: 1,
            tid: 10,
            ptid: 1,
            time: 42,
            sample_id: SampleId {
                time: 43,
                ..Default::default()
            },
        });
        assert_eq!(roundtrip(&fork, &attr), fork);
        assert_eq!(fork.timestamp(), 43);

        let comm = Record::Comm(CommRecord {
            misc: 0,
            pid: 10,
            tid: 10,
            comm: "worker".into(),
            sample_id: SampleId {
                time: 44,
                ..Default::default()
            },
        });
        assert_eq!(roundtrip(&comm, &attr), comm);
    }

    #[test]
    fn build_id_filename_pads_to_64() {
        let attr = EventAttr::default();
        let record = Record::BuildId(BuildIdRecord {
            misc: MISC_USER,
            pid: -1,
            build_id: vec![0xab; 20],
            filename: "/vendor/lib/egl/libGLES.so".into(),
        });
        let bytes = record.encode::<NativeEndian>(&attr);
        // header + pid + padded build id, then the 64-aligned name storage.
        assert_eq!((bytes.len() - 8 - 4 - 24) % 64, 0);
        assert_eq!(roundtrip(&record, &attr), record);
    }

    #[test]
    fn private_record_roundtrips() {
        let attr = EventAttr::default();
        let records = [
            Record::KernelSymbol(KernelSymbolRecord {
                kallsyms: "ffffffc000080000 T _text\n".into(),
            }),
            Record::Dso(DsoRecord {
                dso_type: 2,
                dso_id: 1,
                min_vaddr: 0x400,
                dso_name: "/system/bin/app_process64".into(),
            }),
            Record::Symbol(SymbolRecord {
                dso_id: 1,
                addr: 0x500,
                len: 0x20,
                name: "android::main".into(),
            }),
            Record::EventId(EventIdRecord {
                ids: vec![(0, 77), (1, 78)],
            }),
            Record::TracingData(TracingDataRecord {
                data: b"format blob".to_vec(),
            }),
        ];
        for record in &records {
            assert_eq!(&roundtrip(record, &attr), record);
            assert_eq!(record.timestamp(), 0);
        }
    }

    #[test]
    fn unknown_type_is_not_an_error() {
        let attr = EventAttr::default();
        let mut bytes = Vec::new();
        RecordHeader {
            record_type: 0x4242,
            misc: 3,
            size: 16,
        }
        .encode::<NativeEndian>(&mut bytes);
        bytes.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        match Record::parse::<NativeEndian>(&bytes, &attr).unwrap() {
            Record::Unknown(r) => {
                assert_eq!(r.record_type, 0x4242);
                assert_eq!(r.payload, vec![1, 2, 3, 4, 5, 6, 7, 8]);
            }
            other => panic!("expected unknown record, got {other:?}"),
        }
    }

    #[test]
    fn framing_errors() {
        let attr = attr_with(SampleFormat::CALLCHAIN, false);
        // Header smaller than itself.
        let mut bytes = Vec::new();
        RecordHeader {
            record_type: PERF_RECORD_SAMPLE,
            misc: 0,
            size: 16,
        }
        .encode::<NativeEndian>(&mut bytes);
        bytes[6] = 4; // size = 4 < header size
        bytes[7] = 0;
        assert_eq!(
            RecordHeader::parse::<NativeEndian>(&bytes).unwrap_err(),
            ReadError::InvalidRecordSize
        );

        // Callchain length field pointing past the end of the record.
        let mut bytes = Vec::new();
        RecordHeader {
            record_type: PERF_RECORD_SAMPLE,
            misc: 0,
            size: 16,
        }
        .encode::<NativeEndian>(&mut bytes);
        bytes.write_u64::<NativeEndian>(1000).unwrap();
        assert_eq!(
            Record::parse::<NativeEndian>(&bytes, &attr).unwrap_err(),
            ReadError::FieldOutOfBounds
        );
    }

    #[test]
    fn regs_and_stack_roundtrip() {
        let mut attr = attr_with(
            SampleFormat::REGS_USER | SampleFormat::STACK_USER,
            false,
        );
        attr.sample_regs_user = 0b1011; // 3 registers
        let record = Record::Sample(SampleRecord {
            regs_abi: 2,
            regs: vec![0x1000, 0x2000, 0x3000],
            stack: vec![0u8; 64],
            stack_dyn_size: 48,
            ..Default::default()
        });
        assert_eq!(roundtrip(&record, &attr), record);

        // Zero-length stack omits dyn_size entirely.
        let record = Record::Sample(SampleRecord {
            regs_abi: 0,
            ..Default::default()
        });
        assert_eq!(roundtrip(&record, &attr), record);
    }
}
