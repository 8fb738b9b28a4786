use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "miniperf",
    version,
    about = r#"
miniperf is a sampling CPU profiler in the tradition of Linux perf.

EXAMPLES:
    # Profile a freshly launched command:
    miniperf record ./yourcommand yourargs

    # Profile an existing process for 10 seconds:
    miniperf record -p 12345 --duration 10

    # Count events instead of sampling:
    miniperf stat -e cpu-cycles,instructions ./yourcommand

    # Report a recorded profile:
    miniperf report -i perf.data --sort comm,dso,symbol
"#
)]
pub struct Opt {
    /// Print verbose log messages.
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub action: Action,
}

#[derive(Debug, Subcommand)]
pub enum Action {
    /// List event types supported on this machine.
    List(ListArgs),

    /// Count events in running processes or a launched workload.
    Stat(StatArgs),

    /// Record sampled events to a file.
    Record(RecordArgs),

    /// Aggregate and print a recorded file.
    Report(ReportArgs),

    /// Inspect the stack-capture data stored with samples.
    DebugUnwind(DebugUnwindArgs),
}

#[derive(Debug, Args)]
pub struct ListArgs {
    /// Categories to list: hw, sw, cache, tracepoint. All when empty.
    pub categories: Vec<String>,
}

#[derive(Debug, Args)]
pub struct TargetArgs {
    /// Processes to monitor (comma separated, repeatable).
    #[arg(short = 'p', long = "pid", value_delimiter = ',')]
    pub pids: Vec<i32>,

    /// Threads to monitor (comma separated, repeatable).
    #[arg(short = 't', long = "tid", value_delimiter = ',')]
    pub tids: Vec<i32>,

    /// Monitor the whole system on all cpus.
    #[arg(short = 'a', long = "all")]
    pub system_wide: bool,
}

#[derive(Debug, Args)]
pub struct EventArgs {
    /// Events to use (comma separated, repeatable).
    #[arg(short = 'e', long = "event", value_delimiter = ',')]
    pub events: Vec<String>,

    /// Events to open as one group, scheduled together by the kernel.
    /// The argument is a comma separated event list; repeatable.
    #[arg(long = "group")]
    pub groups: Vec<String>,
}

#[derive(Debug, Args)]
pub struct StatArgs {
    #[command(flatten)]
    pub events: EventArgs,

    #[command(flatten)]
    pub target: TargetArgs,

    /// Stop counting after this many seconds.
    #[arg(long)]
    pub duration: Option<f64>,

    /// Write the counter report to this file instead of stdout.
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,

    /// Command to launch and count. Implies enable-on-exec.
    #[arg(trailing_var_arg = true)]
    pub command: Vec<String>,
}

#[derive(Debug, Args)]
pub struct RecordArgs {
    #[command(flatten)]
    pub events: EventArgs,

    #[command(flatten)]
    pub target: TargetArgs,

    /// Cpus to monitor (kernel list notation, e.g. 0-3,5).
    #[arg(long = "cpu")]
    pub cpus: Option<String>,

    /// Sample at this frequency (samples per second).
    #[arg(short = 'f', long = "freq")]
    pub freq: Option<u64>,

    /// Sample once every this many events; overrides -f.
    #[arg(short = 'c', long = "count")]
    pub period: Option<u64>,

    /// Record call chains with frame pointers. Same as --call-graph fp.
    #[arg(short = 'g')]
    pub call_graph_fp: bool,

    /// Call chain mode: fp, or dwarf[,stack_size].
    #[arg(long = "call-graph")]
    pub call_graph: Option<String>,

    /// Ring buffer size per cpu, in pages (a power of two).
    #[arg(short = 'm', long = "mmap-pages")]
    pub mmap_pages: Option<usize>,

    /// Output file.
    #[arg(short = 'o', long = "output", default_value = "perf.data")]
    pub output: PathBuf,

    /// Stop recording after this many seconds.
    #[arg(long)]
    pub duration: Option<f64>,

    /// Keep captured stacks as-is; do not post-process them.
    #[arg(long)]
    pub no_unwind: bool,

    /// Keep stack and register data of samples whose offline unwinding
    /// would fail, for later debugging.
    #[arg(long)]
    pub keep_failed_unwinding_debug_info: bool,

    /// Command to launch and record. Implies enable-on-exec.
    #[arg(trailing_var_arg = true)]
    pub command: Vec<String>,
}

#[derive(Debug, Args)]
pub struct ReportArgs {
    /// Record file to report.
    #[arg(short = 'i', long = "input", default_value = "perf.data")]
    pub input: PathBuf,

    /// Print the sample count column.
    #[arg(short = 'n')]
    pub show_sample_count: bool,

    /// Print call graphs below each entry.
    #[arg(short = 'g', long = "call-graph")]
    pub show_callchain: bool,

    /// Report mangled symbol names.
    #[arg(long = "no-demangle")]
    pub no_demangle: bool,

    /// Sort and group keys: any of comm,pid,tid,dso,symbol.
    #[arg(long = "sort", value_delimiter = ',')]
    pub sort: Vec<String>,

    /// Look up DSO files under this directory instead of /.
    #[arg(long = "symfs")]
    pub symfs: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct DebugUnwindArgs {
    /// Record file to inspect.
    #[arg(short = 'i', long = "input", default_value = "perf.data")]
    pub input: PathBuf,

    /// Write the selected samples and their state records to this file.
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,

    /// Only inspect the sample with this timestamp.
    #[arg(long = "sample-time")]
    pub sample_time: Option<u64>,

    /// Look up DSO files under this directory instead of /.
    #[arg(long = "symfs")]
    pub symfs: Option<PathBuf>,

    /// Print the stack-capture details of each selected sample.
    #[arg(long = "unwind-sample")]
    pub unwind_sample: bool,
}
