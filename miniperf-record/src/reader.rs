use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::error::{Error, ReadError};
use crate::event_attr::EventAttr;
use crate::file_format::{
    feature, parse_header_string, parse_meta_info, FileAttr, FileFeature, FileHeader, SectionDesc,
    PERF_MAGIC,
};
use crate::record::{BuildIdRecord, Record, RecordHeader, RECORD_HEADER_SIZE};
use crate::Endianness;

/// Reads a record file: header, attrs, the record stream, and feature
/// sections. Feature payloads are loaded eagerly at open time; records are
/// streamed with [`RecordFileReader::read_record`].
#[derive(Debug)]
pub struct RecordFileReader<R: Read + Seek> {
    reader: R,
    endian: Endianness,
    header: FileHeader,
    attrs: Vec<FileAttr>,
    event_id_to_attr_index: HashMap<u64, usize>,
    feature_sections: Vec<(u8, Vec<u8>)>,
    read_offset: u64,
}

impl<R: Read + Seek> RecordFileReader<R> {
    pub fn parse_file(mut reader: R) -> Result<Self, Error> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic == PERF_MAGIC {
            Self::parse_file_impl::<LittleEndian>(reader, Endianness::LittleEndian)
        } else if magic.iter().rev().eq(PERF_MAGIC.iter()) {
            Self::parse_file_impl::<BigEndian>(reader, Endianness::BigEndian)
        } else {
            Err(Error::UnrecognizedMagicValue(magic))
        }
    }

    fn parse_file_impl<T: ByteOrder>(mut reader: R, endian: Endianness) -> Result<Self, Error> {
        let header = FileHeader::parse::<_, T>(&mut reader)?;

        // Attr section: an array of (attr, ids section desc) entries with a
        // stride declared in the header.
        if header.attr_size == 0 || header.attrs.size % header.attr_size != 0 {
            return Err(Error::MisalignedAttrSection);
        }
        let attr_count = (header.attrs.size / header.attr_size) as usize;
        if attr_count == 0 {
            return Err(Error::MisalignedAttrSection);
        }
        reader.seek(SeekFrom::Start(header.attrs.offset))?;
        let mut entry = vec![0u8; header.attr_size as usize];
        let mut raw_attrs = Vec::with_capacity(attr_count);
        for _ in 0..attr_count {
            reader.read_exact(&mut entry)?;
            let (attr, _) = EventAttr::parse::<_, T>(&entry[..]).map_err(Error::Read)?;
            let ids = SectionDesc::parse::<_, T>(&entry[entry.len() - 16..])?;
            raw_attrs.push((attr, ids));
        }

        let mut attrs = Vec::with_capacity(attr_count);
        let mut event_id_to_attr_index = HashMap::new();
        for (index, (attr, ids_section)) in raw_attrs.into_iter().enumerate() {
            let id_count = (ids_section.size / 8) as usize;
            let mut ids = Vec::with_capacity(id_count);
            if id_count > 0 {
                reader.seek(SeekFrom::Start(ids_section.offset))?;
                let mut buf = vec![0u8; ids_section.size as usize];
                reader.read_exact(&mut buf)?;
                for chunk in buf.chunks_exact(8) {
                    let id = T::read_u64(chunk);
                    ids.push(id);
                    event_id_to_attr_index.insert(id, index);
                }
            }
            attrs.push(FileAttr { attr, ids });
        }

        // Feature section: descriptor array right after the data section,
        // one entry per set feature bit, in ascending id order.
        let mut feature_sections = Vec::new();
        let mut desc_offset = header.data.offset + header.data.size;
        for feature_id in header.features.iter().collect::<Vec<_>>() {
            reader.seek(SeekFrom::Start(desc_offset))?;
            let mut desc_buf = [0u8; 16];
            reader.read_exact(&mut desc_buf)?;
            let desc = SectionDesc::parse::<_, T>(&desc_buf[..])?;
            desc_offset += 16;

            let size = usize::try_from(desc.size).map_err(|_| Error::SectionSizeTooBig)?;
            let mut payload = vec![0u8; size];
            reader.seek(SeekFrom::Start(desc.offset))?;
            reader
                .read_exact(&mut payload)
                .map_err(|_| Error::BadFeatureSection(feature_id))?;
            feature_sections.push((feature_id, payload));
        }

        Ok(RecordFileReader {
            reader,
            endian,
            header,
            attrs,
            event_id_to_attr_index,
            feature_sections,
            read_offset: 0,
        })
    }

    pub fn endian(&self) -> Endianness {
        self.endian
    }

    pub fn attrs(&self) -> &[FileAttr] {
        &self.attrs
    }

    /// Attr index responsible for an event id, when ids were recorded.
    pub fn attr_index_for_id(&self, id: u64) -> Option<usize> {
        self.event_id_to_attr_index.get(&id).copied()
    }

    /// Read the next record from the data section, or `None` at the end.
    ///
    /// All attrs in a file share a unified sample layout, so decoding uses
    /// the first attr.
    pub fn read_record(&mut self) -> Result<Option<Record>, Error> {
        match self.endian {
            Endianness::LittleEndian => self.read_record_impl::<LittleEndian>(),
            Endianness::BigEndian => self.read_record_impl::<BigEndian>(),
        }
    }

    fn read_record_impl<T: ByteOrder>(&mut self) -> Result<Option<Record>, Error> {
        if self.read_offset + RECORD_HEADER_SIZE as u64 > self.header.data.size {
            return Ok(None);
        }
        self.reader
            .seek(SeekFrom::Start(self.header.data.offset + self.read_offset))?;
        let mut buf = vec![0u8; RECORD_HEADER_SIZE];
        self.reader.read_exact(&mut buf)?;
        let header = RecordHeader::parse::<T>(&buf)?;
        if self.read_offset + header.size as u64 > self.header.data.size {
            return Err(Error::Read(ReadError::InvalidRecordSize));
        }
        buf.resize(header.size as usize, 0);
        self.reader.read_exact(&mut buf[RECORD_HEADER_SIZE..])?;
        self.read_offset += header.size as u64;
        let attr = &self.attrs[0].attr;
        Ok(Some(Record::parse::<T>(&buf, attr)?))
    }

    pub fn feature_data(&self, feature_id: u8) -> Option<&[u8]> {
        self.feature_sections
            .iter()
            .find(|(id, _)| *id == feature_id)
            .map(|(_, data)| data.as_slice())
    }

    pub fn meta_info(&self) -> HashMap<String, String> {
        self.feature_data(feature::META_INFO)
            .map(parse_meta_info)
            .unwrap_or_default()
    }

    /// Entries of the BUILD_ID feature: a concatenation of build-id records.
    pub fn build_ids(&self) -> Result<Vec<BuildIdRecord>, Error> {
        let data = match self.feature_data(feature::BUILD_ID) {
            Some(data) => data,
            None => return Ok(Vec::new()),
        };
        match self.endian {
            Endianness::LittleEndian => Self::parse_build_ids::<LittleEndian>(data),
            Endianness::BigEndian => Self::parse_build_ids::<BigEndian>(data),
        }
    }

    fn parse_build_ids<T: ByteOrder>(mut data: &[u8]) -> Result<Vec<BuildIdRecord>, Error> {
        let attr = EventAttr::default();
        let mut entries = Vec::new();
        while data.len() >= RECORD_HEADER_SIZE {
            let header = RecordHeader::parse::<T>(data)?;
            let size = header.size as usize;
            if size > data.len() {
                return Err(Error::Read(ReadError::InvalidRecordSize));
            }
            if let Record::BuildId(record) = Record::parse::<T>(&data[..size], &attr)? {
                entries.push(record);
            }
            data = &data[size..];
        }
        Ok(entries)
    }

    /// Entries of the FILE feature: symbol tables captured at record time.
    pub fn file_features(&self) -> Result<Vec<FileFeature>, Error> {
        let mut data = match self.feature_data(feature::FILE) {
            Some(data) => data,
            None => return Ok(Vec::new()),
        };
        let mut entries = Vec::new();
        while !data.is_empty() {
            let (entry, consumed) = match self.endian {
                Endianness::LittleEndian => FileFeature::parse::<LittleEndian>(data)?,
                Endianness::BigEndian => FileFeature::parse::<BigEndian>(data)?,
            };
            entries.push(entry);
            data = &data[consumed..];
        }
        Ok(entries)
    }

    /// A perf-style string feature (ARCH, OSRELEASE, VERSION...).
    pub fn string_feature(&self, feature_id: u8) -> Option<String> {
        let data = self.feature_data(feature_id)?;
        match self.endian {
            Endianness::LittleEndian => parse_header_string::<LittleEndian>(data).ok(),
            Endianness::BigEndian => parse_header_string::<BigEndian>(data).ok(),
        }
    }
}
