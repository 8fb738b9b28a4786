use std::io;

/// The error type used across the tool. One variant per failure class; the
/// CLI prints one line per cause and exits nonzero.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to open perf event file for {name}: {source}")]
    KernelOpen {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to read perf event counter: {0}")]
    KernelRead(#[source] io::Error),

    #[error("failed to mmap perf event buffer: {0}")]
    BufferMap(#[source] io::Error),

    #[error("poll failed: {0}")]
    Poll(#[source] io::Error),

    #[error("{0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to load symbols: {0}")]
    SymbolLoad(String),

    #[error("record file error: {0}")]
    RecordFile(#[from] miniperf_record::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
