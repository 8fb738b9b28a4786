use std::io;

/// The error type used in this crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A record or header did not frame correctly.
    #[error("Read error: {0}")]
    Read(#[from] ReadError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Did not recognize magic value {0:?}")]
    UnrecognizedMagicValue([u8; 8]),

    #[error("Section size did not fit into usize")]
    SectionSizeTooBig,

    #[error("The attr section does not contain a whole number of attrs")]
    MisalignedAttrSection,

    #[error("Feature section {0} is declared but its descriptor is out of bounds")]
    BadFeatureSection(u8),
}

/// Framing failures while decoding a single record or struct. The record in
/// question is abandoned; decoding can continue with the next one.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    #[error("Could not read the record header")]
    RecordHeader,

    #[error("The size in a record header was smaller than the header itself")]
    InvalidRecordSize,

    #[error("A variable-length field ran past the end of the record")]
    FieldOutOfBounds,

    #[error("A string field was not NUL-terminated within the record")]
    UnterminatedString,

    #[error("Could not read EventAttr")]
    EventAttr,

    #[error("Sample carries a group read format, which this codec does not decode")]
    GroupReadFormat,

    #[error("Could not read FileHeader")]
    FileHeader,

    #[error("Could not read a feature struct")]
    Feature,
}
