pub mod callchain;
pub mod dso;
pub mod sample_tree;
pub mod thread_tree;

// Marker values the kernel interleaves into callchain ip arrays to flag
// privilege level switches.
pub const PERF_CONTEXT_KERNEL: u64 = -128i64 as u64;
pub const PERF_CONTEXT_USER: u64 = -512i64 as u64;
pub const PERF_CONTEXT_MAX: u64 = -4095i64 as u64;
