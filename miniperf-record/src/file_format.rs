use std::collections::HashMap;
use std::io::{Read, Write};

use byteorder::{ByteOrder, ReadBytesExt, WriteBytesExt};

use crate::error::ReadError;
use crate::event_attr::EventAttr;

/// The file structure of a record file:
///     file_header
///     attr section
///     data section
///     feature section
///
/// The feature section starts with a section descriptor array, one element
/// per feature bit set in the header, followed by the feature payloads.
pub const PERF_MAGIC: &[u8; 8] = b"PERFILE2";

/// Feature ids. Ids below 128 match what `perf` itself writes; ids from 128
/// up are private to this profiler family.
pub mod feature {
    pub const TRACING_DATA: u8 = 1;
    pub const BUILD_ID: u8 = 2;
    pub const HOSTNAME: u8 = 3;
    pub const OSRELEASE: u8 = 4;
    pub const VERSION: u8 = 5;
    pub const ARCH: u8 = 6;
    pub const NRCPUS: u8 = 7;
    pub const CPUDESC: u8 = 8;
    pub const CPUID: u8 = 9;
    pub const TOTAL_MEM: u8 = 10;
    pub const CMDLINE: u8 = 11;
    pub const EVENT_DESC: u8 = 12;
    pub const CPU_TOPOLOGY: u8 = 13;
    pub const NUMA_TOPOLOGY: u8 = 14;
    pub const BRANCH_STACK: u8 = 15;
    pub const PMU_MAPPINGS: u8 = 16;
    pub const GROUP_DESC: u8 = 17;
    pub const AUXTRACE: u8 = 18;

    pub const FILE: u8 = 128;
    pub const META_INFO: u8 = 129;
    pub const DEBUG_UNWIND: u8 = 130;
    pub const DEBUG_UNWIND_FILE: u8 = 131;
    pub const FILE2: u8 = 132;
    pub const ETM_BRANCH_LIST: u8 = 133;
    pub const INIT_MAP: u8 = 134;

    pub const MAX_NUM: usize = 256;
}

/// Values of the `file_type` field in a [`FileFeature`] entry.
pub mod dso_type {
    pub const DSO_KERNEL: u32 = 0;
    pub const DSO_KERNEL_MODULE: u32 = 1;
    pub const DSO_ELF_FILE: u32 = 2;
    pub const DSO_DEX_FILE: u32 = 3;
    pub const DSO_SYMBOL_MAP_FILE: u32 = 4;
    pub const DSO_UNKNOWN_FILE: u32 = 5;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectionDesc {
    pub offset: u64,
    pub size: u64,
}

impl SectionDesc {
    pub fn parse<R: Read, T: ByteOrder>(mut reader: R) -> Result<Self, ReadError> {
        let offset = reader.read_u64::<T>().map_err(|_| ReadError::FileHeader)?;
        let size = reader.read_u64::<T>().map_err(|_| ReadError::FileHeader)?;
        Ok(SectionDesc { offset, size })
    }

    pub fn encode<W: Write, T: ByteOrder>(&self, mut w: W) -> std::io::Result<()> {
        w.write_u64::<T>(self.offset)?;
        w.write_u64::<T>(self.size)?;
        Ok(())
    }
}

/// Bitset over the 256 possible feature ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureSet(pub [u8; feature::MAX_NUM / 8]);

impl Default for FeatureSet {
    fn default() -> Self {
        FeatureSet([0; feature::MAX_NUM / 8])
    }
}

impl FeatureSet {
    pub fn insert(&mut self, feature: u8) {
        self.0[feature as usize / 8] |= 1 << (feature % 8);
    }

    pub fn contains(&self, feature: u8) -> bool {
        self.0[feature as usize / 8] & (1 << (feature % 8)) != 0
    }

    /// Iterate set feature ids in ascending order, which is also the order
    /// of their descriptors in the feature section.
    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (0..feature::MAX_NUM as u16).filter_map(|id| {
            let id = id as u8;
            self.contains(id).then_some(id)
        })
    }

    pub fn len(&self) -> usize {
        self.0.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub const FILE_HEADER_SIZE: u64 = 8 + 8 + 8 + 16 * 3 + 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub header_size: u64,
    pub attr_size: u64,
    pub attrs: SectionDesc,
    pub data: SectionDesc,
    pub event_types: SectionDesc,
    pub features: FeatureSet,
}

impl FileHeader {
    pub fn parse<R: Read, T: ByteOrder>(mut reader: R) -> Result<Self, ReadError> {
        let header_size = reader.read_u64::<T>().map_err(|_| ReadError::FileHeader)?;
        let attr_size = reader.read_u64::<T>().map_err(|_| ReadError::FileHeader)?;
        let attrs = SectionDesc::parse::<_, T>(&mut reader)?;
        let data = SectionDesc::parse::<_, T>(&mut reader)?;
        let event_types = SectionDesc::parse::<_, T>(&mut reader)?;
        let mut features = FeatureSet::default();
        reader
            .read_exact(&mut features.0)
            .map_err(|_| ReadError::FileHeader)?;
        Ok(FileHeader {
            header_size,
            attr_size,
            attrs,
            data,
            event_types,
            features,
        })
    }

    pub fn encode<W: Write, T: ByteOrder>(&self, mut w: W) -> std::io::Result<()> {
        w.write_all(PERF_MAGIC)?;
        w.write_u64::<T>(self.header_size)?;
        w.write_u64::<T>(self.attr_size)?;
        self.attrs.encode::<_, T>(&mut w)?;
        self.data.encode::<_, T>(&mut w)?;
        self.event_types.encode::<_, T>(&mut w)?;
        w.write_all(&self.features.0)?;
        Ok(())
    }
}

/// One entry of the attr section: the attr plus the section holding its
/// event ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttr {
    pub attr: EventAttr,
    pub ids: Vec<u64>,
}

/// One symbol of a [`FileFeature`] symbol table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSymbol {
    pub vaddr: u64,
    pub len: u32,
    pub name: String,
}

/// One entry of the FILE feature section: a symbol table captured for a DSO
/// that was hit during recording, so the report side can symbolize without
/// access to the original binaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFeature {
    pub path: String,
    pub file_type: u32,
    pub min_vaddr: u64,
    pub symbols: Vec<FileSymbol>,
    /// Only when `file_type == DSO_ELF_FILE`.
    pub file_offset_of_min_vaddr: Option<u64>,
    /// Only when `file_type == DSO_KERNEL_MODULE`.
    pub memory_offset_of_min_vaddr: Option<u64>,
    /// Only when `file_type == DSO_DEX_FILE`.
    pub dex_file_offsets: Vec<u64>,
}

impl FileFeature {
    /// Parse one size-prefixed entry, returning it and the bytes consumed.
    pub fn parse<T: ByteOrder>(data: &[u8]) -> Result<(Self, usize), ReadError> {
        if data.len() < 4 {
            return Err(ReadError::Feature);
        }
        let size = T::read_u32(&data[..4]) as usize;
        let body = data.get(4..4 + size).ok_or(ReadError::Feature)?;
        let nul = memchr::memchr(0, body).ok_or(ReadError::Feature)?;
        let path = String::from_utf8_lossy(&body[..nul]).into_owned();
        let mut pos = nul + 1;

        let read_u32 = |pos: &mut usize| -> Result<u32, ReadError> {
            let v = body.get(*pos..*pos + 4).ok_or(ReadError::Feature)?;
            *pos += 4;
            Ok(T::read_u32(v))
        };
        let read_u64 = |pos: &mut usize| -> Result<u64, ReadError> {
            let v = body.get(*pos..*pos + 8).ok_or(ReadError::Feature)?;
            *pos += 8;
            Ok(T::read_u64(v))
        };

        let file_type = read_u32(&mut pos)?;
        let min_vaddr = read_u64(&mut pos)?;
        let symbol_count = read_u32(&mut pos)? as usize;
        if symbol_count > size {
            return Err(ReadError::Feature);
        }
        let mut symbols = Vec::with_capacity(symbol_count);
        for _ in 0..symbol_count {
            let vaddr = read_u64(&mut pos)?;
            let len = read_u32(&mut pos)?;
            let rest = body.get(pos..).ok_or(ReadError::Feature)?;
            let nul = memchr::memchr(0, rest).ok_or(ReadError::Feature)?;
            let name = String::from_utf8_lossy(&rest[..nul]).into_owned();
            pos += nul + 1;
            symbols.push(FileSymbol { vaddr, len, name });
        }

        let mut entry = FileFeature {
            path,
            file_type,
            min_vaddr,
            symbols,
            file_offset_of_min_vaddr: None,
            memory_offset_of_min_vaddr: None,
            dex_file_offsets: Vec::new(),
        };
        match file_type {
            dso_type::DSO_ELF_FILE => {
                entry.file_offset_of_min_vaddr = Some(read_u64(&mut pos)?);
            }
            dso_type::DSO_KERNEL_MODULE => {
                entry.memory_offset_of_min_vaddr = Some(read_u64(&mut pos)?);
            }
            dso_type::DSO_DEX_FILE => {
                let count = read_u32(&mut pos)? as usize;
                if count > size {
                    return Err(ReadError::Feature);
                }
                for _ in 0..count {
                    entry.dex_file_offsets.push(read_u64(&mut pos)?);
                }
            }
            _ => {}
        }
        Ok((entry, 4 + size))
    }

    pub fn encode<T: ByteOrder>(&self, buf: &mut Vec<u8>) {
        let start = buf.len();
        buf.write_u32::<T>(0).unwrap(); // patched below
        buf.extend_from_slice(self.path.as_bytes());
        buf.push(0);
        buf.write_u32::<T>(self.file_type).unwrap();
        buf.write_u64::<T>(self.min_vaddr).unwrap();
        buf.write_u32::<T>(self.symbols.len() as u32).unwrap();
        for symbol in &self.symbols {
            buf.write_u64::<T>(symbol.vaddr).unwrap();
            buf.write_u32::<T>(symbol.len).unwrap();
            buf.extend_from_slice(symbol.name.as_bytes());
            buf.push(0);
        }
        match self.file_type {
            dso_type::DSO_ELF_FILE => {
                buf.write_u64::<T>(self.file_offset_of_min_vaddr.unwrap_or(0))
                    .unwrap();
            }
            dso_type::DSO_KERNEL_MODULE => {
                buf.write_u64::<T>(self.memory_offset_of_min_vaddr.unwrap_or(0))
                    .unwrap();
            }
            dso_type::DSO_DEX_FILE => {
                buf.write_u32::<T>(self.dex_file_offsets.len() as u32)
                    .unwrap();
                for offset in &self.dex_file_offsets {
                    buf.write_u64::<T>(*offset).unwrap();
                }
            }
            _ => {}
        }
        let size = (buf.len() - start - 4) as u32;
        T::write_u32(&mut buf[start..start + 4], size);
    }
}

/// Parse a META_INFO payload: NUL-terminated key/value pairs.
pub fn parse_meta_info(bytes: &[u8]) -> HashMap<String, String> {
    let mut iter = bytes.split(|c| *c == 0);
    let mut map = HashMap::new();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        if key.is_empty() {
            break;
        }
        map.insert(
            String::from_utf8_lossy(key).into_owned(),
            String::from_utf8_lossy(value).into_owned(),
        );
    }
    map
}

pub fn encode_meta_info(pairs: &[(String, String)]) -> Vec<u8> {
    let mut buf = Vec::new();
    for (key, value) in pairs {
        buf.extend_from_slice(key.as_bytes());
        buf.push(0);
        buf.extend_from_slice(value.as_bytes());
        buf.push(0);
    }
    buf
}

/// Parse a perf-style header string: u32 length, then that many bytes of
/// NUL-padded text.
pub fn parse_header_string<T: ByteOrder>(data: &[u8]) -> Result<String, ReadError> {
    if data.len() < 4 {
        return Err(ReadError::Feature);
    }
    let len = T::read_u32(&data[..4]) as usize;
    let bytes = data.get(4..4 + len).ok_or(ReadError::Feature)?;
    let actual = memchr::memchr(0, bytes).unwrap_or(bytes.len());
    Ok(String::from_utf8_lossy(&bytes[..actual]).into_owned())
}

pub fn encode_header_string<T: ByteOrder>(s: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + s.len() + 1);
    buf.write_u32::<T>(s.len() as u32 + 1).unwrap();
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::NativeEndian;

    #[test]
    fn feature_set_tracks_bits() {
        let mut set = FeatureSet::default();
        set.insert(feature::BUILD_ID);
        set.insert(feature::META_INFO);
        set.insert(feature::FILE);
        assert!(set.contains(feature::BUILD_ID));
        assert!(!set.contains(feature::CMDLINE));
        assert_eq!(set.len(), 3);
        let ids: Vec<u8> = set.iter().collect();
        assert_eq!(ids, vec![feature::BUILD_ID, feature::FILE, feature::META_INFO]);
    }

    #[test]
    fn file_header_roundtrip() {
        let mut features = FeatureSet::default();
        features.insert(feature::META_INFO);
        let header = FileHeader {
            header_size: FILE_HEADER_SIZE,
            attr_size: 96 + 16,
            attrs: SectionDesc {
                offset: FILE_HEADER_SIZE,
                size: 112,
            },
            data: SectionDesc {
                offset: FILE_HEADER_SIZE + 112,
                size: 4096,
            },
            event_types: SectionDesc::default(),
            features,
        };
        let mut buf = Vec::new();
        header.encode::<_, NativeEndian>(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, FILE_HEADER_SIZE);
        // Skip the magic; parse starts after it.
        let parsed = FileHeader::parse::<_, NativeEndian>(&buf[8..]).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn file_feature_roundtrip() {
        let entry = FileFeature {
            path: "/system/lib64/libart.so".into(),
            file_type: dso_type::DSO_ELF_FILE,
            min_vaddr: 0x4000,
            symbols: vec![
                FileSymbol {
                    vaddr: 0x5000,
                    len: 0x100,
                    name: "art::Runtime::Init".into(),
                },
                FileSymbol {
                    vaddr: 0x5100,
                    len: 0x40,
                    name: "art::Runtime::Start".into(),
                },
            ],
            file_offset_of_min_vaddr: Some(0x3000),
            memory_offset_of_min_vaddr: None,
            dex_file_offsets: Vec::new(),
        };
        let mut buf = Vec::new();
        entry.encode::<NativeEndian>(&mut buf);
        let (parsed, consumed) = FileFeature::parse::<NativeEndian>(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(parsed, entry);
    }

    #[test]
    fn meta_info_roundtrip() {
        let pairs = vec![
            ("clockid".to_string(), "monotonic".to_string()),
            ("event_type_info".to_string(), "cpu-cycles,0,0".to_string()),
        ];
        let bytes = encode_meta_info(&pairs);
        let map = parse_meta_info(&bytes);
        assert_eq!(map.get("clockid").map(String::as_str), Some("monotonic"));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn header_string_roundtrip() {
        let buf = encode_header_string::<NativeEndian>("aarch64");
        assert_eq!(
            parse_header_string::<NativeEndian>(&buf).unwrap(),
            "aarch64"
        );
    }
}
