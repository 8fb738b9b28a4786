use std::io::{Seek, SeekFrom, Write};

use byteorder::{NativeEndian, WriteBytesExt};

use crate::error::Error;
use crate::event_attr::{EventAttr, ATTR_SIZE_VER3};
use crate::file_format::{
    encode_header_string, encode_meta_info, FeatureSet, FileAttr, FileFeature, FileHeader,
    SectionDesc, FILE_HEADER_SIZE,
};
use crate::record::{BuildIdRecord, Record};

/// Writes a record file in native byte order.
///
/// Call order: [`RecordFileWriter::new`], [`write_attrs`], any number of
/// [`write_record`], the `*_feature` methods, then [`finish`], which seeks
/// back and writes the real header.
///
/// [`write_attrs`]: RecordFileWriter::write_attrs
/// [`write_record`]: RecordFileWriter::write_record
/// [`finish`]: RecordFileWriter::finish
pub struct RecordFileWriter<W: Write + Seek> {
    writer: W,
    attr: EventAttr,
    attr_section: SectionDesc,
    data_section: SectionDesc,
    features: FeatureSet,
    pending_features: Vec<(u8, Vec<u8>)>,
    record_count: u64,
}

impl<W: Write + Seek> RecordFileWriter<W> {
    pub fn new(mut writer: W) -> Result<Self, Error> {
        // Header placeholder; the real one lands here in finish().
        writer.write_all(&[0u8; FILE_HEADER_SIZE as usize])?;
        Ok(RecordFileWriter {
            writer,
            attr: EventAttr::default(),
            attr_section: SectionDesc::default(),
            data_section: SectionDesc::default(),
            features: FeatureSet::default(),
            pending_features: Vec::new(),
            record_count: 0,
        })
    }

    /// Write the id arrays and the attr section. Must be called exactly once,
    /// before the first record.
    pub fn write_attrs(&mut self, attrs: &[FileAttr]) -> Result<(), Error> {
        // Ids first; each attr entry refers back to its slice of them.
        let mut id_sections = Vec::with_capacity(attrs.len());
        for file_attr in attrs {
            let offset = self.writer.stream_position()?;
            for id in &file_attr.ids {
                self.writer.write_u64::<NativeEndian>(*id)?;
            }
            id_sections.push(SectionDesc {
                offset,
                size: file_attr.ids.len() as u64 * 8,
            });
        }

        self.attr_section.offset = self.writer.stream_position()?;
        for (file_attr, ids) in attrs.iter().zip(&id_sections) {
            file_attr.attr.encode::<_, NativeEndian>(&mut self.writer)?;
            ids.encode::<_, NativeEndian>(&mut self.writer)?;
        }
        self.attr_section.size = self.writer.stream_position()? - self.attr_section.offset;

        // All attrs share a unified sample layout; remember one for record
        // encoding.
        if let Some(first) = attrs.first() {
            self.attr = first.attr.clone();
        }
        self.data_section.offset = self.attr_section.offset + self.attr_section.size;
        Ok(())
    }

    pub fn write_record(&mut self, record: &Record) -> Result<(), Error> {
        let bytes = record.encode::<NativeEndian>(&self.attr);
        self.writer.write_all(&bytes)?;
        self.data_section.size += bytes.len() as u64;
        self.record_count += 1;
        Ok(())
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    fn add_feature(&mut self, feature_id: u8, payload: Vec<u8>) {
        self.features.insert(feature_id);
        self.pending_features.push((feature_id, payload));
        // Descriptors are laid out in ascending feature id order.
        self.pending_features.sort_by_key(|(id, _)| *id);
    }

    pub fn write_build_id_feature(&mut self, entries: &[BuildIdRecord]) -> Result<(), Error> {
        let attr = EventAttr::default();
        let mut payload = Vec::new();
        for entry in entries {
            let record = Record::BuildId(entry.clone());
            payload.extend_from_slice(&record.encode::<NativeEndian>(&attr));
        }
        self.add_feature(crate::file_format::feature::BUILD_ID, payload);
        Ok(())
    }

    pub fn write_meta_info_feature(&mut self, pairs: &[(String, String)]) -> Result<(), Error> {
        self.add_feature(
            crate::file_format::feature::META_INFO,
            encode_meta_info(pairs),
        );
        Ok(())
    }

    pub fn write_file_features(&mut self, entries: &[FileFeature]) -> Result<(), Error> {
        let mut payload = Vec::new();
        for entry in entries {
            entry.encode::<NativeEndian>(&mut payload);
        }
        self.add_feature(crate::file_format::feature::FILE, payload);
        Ok(())
    }

    pub fn write_string_feature(&mut self, feature_id: u8, value: &str) -> Result<(), Error> {
        self.add_feature(feature_id, encode_header_string::<NativeEndian>(value));
        Ok(())
    }

    /// Write the feature section and the final header, and flush.
    pub fn finish(mut self) -> Result<W, Error> {
        // The descriptor array sits right after the data section, followed
        // by the payloads.
        let desc_array_offset = self.data_section.offset + self.data_section.size;
        self.writer.seek(SeekFrom::Start(desc_array_offset))?;
        let mut payload_offset = desc_array_offset + self.pending_features.len() as u64 * 16;
        for (_, payload) in &self.pending_features {
            SectionDesc {
                offset: payload_offset,
                size: payload.len() as u64,
            }
            .encode::<_, NativeEndian>(&mut self.writer)?;
            payload_offset += payload.len() as u64;
        }
        for (_, payload) in &self.pending_features {
            self.writer.write_all(payload)?;
        }

        let header = FileHeader {
            header_size: FILE_HEADER_SIZE,
            attr_size: ATTR_SIZE_VER3 as u64 + 16,
            attrs: self.attr_section,
            data: self.data_section,
            event_types: SectionDesc::default(),
            features: self.features,
        };
        self.writer.seek(SeekFrom::Start(0))?;
        header.encode::<_, NativeEndian>(&mut self.writer)?;
        self.writer.flush()?;
        Ok(self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_attr::{AttrFlags, SampleFormat};
    use crate::file_format::{dso_type, FileSymbol};
    use crate::record::{CommRecord, MmapRecord, SampleId, SampleRecord, MISC_USER};
    use crate::RecordFileReader;
    use std::io::Cursor;

    fn test_attr() -> EventAttr {
        EventAttr {
            sample_type: SampleFormat::IP
                | SampleFormat::TID
                | SampleFormat::TIME
                | SampleFormat::PERIOD,
            flags: AttrFlags::SAMPLE_ID_ALL | AttrFlags::FREQ,
            sample_period_or_freq: 4000,
            ..Default::default()
        }
    }

    #[test]
    fn write_then_read_roundtrips() {
        let attr = test_attr();
        let records = vec![
            Record::Mmap(MmapRecord {
                misc: MISC_USER,
                pid: 1,
                tid: 1,
                addr: 0x1000,
                len: 0x2000,
                pgoff: 0,
                filename: "/bin/true".into(),
                sample_id: SampleId {
                    pid: 1,
                    tid: 1,
                    time: 100,
                    ..Default::default()
                },
            }),
            Record::Comm(CommRecord {
                misc: 0,
                pid: 1,
                tid: 1,
                comm: "true".into(),
                sample_id: SampleId {
                    pid: 1,
                    tid: 1,
                    time: 101,
                    ..Default::default()
                },
            }),
            Record::Sample(SampleRecord {
                ip: 0x1100,
                pid: 1,
                tid: 1,
                time: 102,
                period: 9,
                ..Default::default()
            }),
        ];

        let mut writer = RecordFileWriter::new(Cursor::new(Vec::new())).unwrap();
        writer
            .write_attrs(&[FileAttr {
                attr: attr.clone(),
                ids: vec![11, 12],
            }])
            .unwrap();
        for record in &records {
            writer.write_record(record).unwrap();
        }
        writer
            .write_meta_info_feature(&[("clockid".into(), "monotonic".into())])
            .unwrap();
        writer
            .write_build_id_feature(&[BuildIdRecord {
                misc: MISC_USER,
                pid: -1,
                build_id: vec![1; 20],
                filename: "/bin/true".into(),
            }])
            .unwrap();
        writer
            .write_file_features(&[FileFeature {
                path: "/bin/true".into(),
                file_type: dso_type::DSO_ELF_FILE,
                min_vaddr: 0x1000,
                symbols: vec![FileSymbol {
                    vaddr: 0x1100,
                    len: 0x10,
                    name: "main".into(),
                }],
                file_offset_of_min_vaddr: Some(0x1000),
                memory_offset_of_min_vaddr: None,
                dex_file_offsets: Vec::new(),
            }])
            .unwrap();
        let cursor = writer.finish().unwrap();

        let mut reader = RecordFileReader::parse_file(Cursor::new(cursor.into_inner())).unwrap();
        assert_eq!(reader.attrs().len(), 1);
        assert_eq!(reader.attrs()[0].attr, attr);
        assert_eq!(reader.attrs()[0].ids, vec![11, 12]);
        assert_eq!(reader.attr_index_for_id(12), Some(0));

        let mut read_back = Vec::new();
        while let Some(record) = reader.read_record().unwrap() {
            read_back.push(record);
        }
        assert_eq!(read_back, records);

        assert_eq!(
            reader.meta_info().get("clockid").map(String::as_str),
            Some("monotonic")
        );
        let build_ids = reader.build_ids().unwrap();
        assert_eq!(build_ids.len(), 1);
        assert_eq!(build_ids[0].build_id, vec![1; 20]);
        let files = reader.file_features().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].symbols[0].name, "main");
    }

    #[test]
    fn bad_magic_is_rejected() {
        let err = RecordFileReader::parse_file(Cursor::new(b"NOTPERF!xxxxxxxx".to_vec()))
            .unwrap_err();
        assert!(matches!(err, Error::UnrecognizedMagicValue(_)));
    }
}
