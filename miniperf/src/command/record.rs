use std::cell::RefCell;
use std::fs::File;
use std::io::BufWriter;
use std::rc::Rc;
use std::time::Duration;

use log::{info, warn};

use miniperf_record::{
    dso_type, feature, BuildIdRecord, CommRecord, FileAttr, FileFeature, FileSymbol,
    KernelSymbolRecord, MmapRecord, Record, RecordFileWriter, SampleId, MISC_KERNEL, MISC_USER,
};

use crate::cli::RecordArgs;
use crate::error::{Error, Result};
use crate::linux::environment::{
    get_kernel_build_id, get_kernel_start_address, get_process_maps, get_thread_comm,
    get_threads_in_process, machine_arch, max_sample_rate, os_release, parse_cpu_list,
    read_string_lossy,
};
use crate::linux::event_selection::EventSelectionSet;
use crate::linux::io_loop::IOEventLoop;
use crate::linux::workload::Workload;
use crate::profile::dso::{DsoType, SymbolConfig, DEFAULT_KERNEL_MMAP_NAME};
use crate::profile::thread_tree::ThreadTree;
use crate::profile::{PERF_CONTEXT_KERNEL, PERF_CONTEXT_MAX, PERF_CONTEXT_USER};
use crate::record_cache::RecordCache;

const DEFAULT_MIN_MMAP_PAGES: usize = 16;
const DEFAULT_MAX_MMAP_PAGES: usize = 1024;
const DEFAULT_DUMP_STACK_SIZE: u32 = 65528;
const CACHE_MIN_SIZE: usize = 1000;
const CACHE_MIN_TIME_DIFF_NS: u64 = 1_000_000_000;
const HOTPLUG_CHECK_INTERVAL: Duration = Duration::from_secs(2);

enum CallGraphMode {
    None,
    FramePointer,
    Dwarf(u32),
}

fn parse_call_graph(args: &RecordArgs) -> Result<CallGraphMode> {
    if let Some(value) = &args.call_graph {
        let (mode, size) = match value.split_once(',') {
            Some((mode, size)) => (mode, Some(size)),
            None => (value.as_str(), None),
        };
        return match mode {
            "fp" => Ok(CallGraphMode::FramePointer),
            "dwarf" => {
                let size = match size {
                    Some(size) => size.parse().map_err(|_| {
                        Error::InvalidConfig(format!("invalid dwarf stack size '{size}'"))
                    })?,
                    None => DEFAULT_DUMP_STACK_SIZE,
                };
                Ok(CallGraphMode::Dwarf(size))
            }
            other => Err(Error::InvalidConfig(format!(
                "unknown call graph mode '{other}', expected fp or dwarf"
            ))),
        };
    }
    if args.call_graph_fp {
        return Ok(CallGraphMode::FramePointer);
    }
    Ok(CallGraphMode::None)
}

/// Everything the record callback mutates, behind one RefCell so the
/// reactor closures can share it.
struct Recorder {
    cache: RecordCache,
    tree: ThreadTree,
    writer: Option<RecordFileWriter<BufWriter<File>>>,
    sample_count: u64,
    lost_count: u64,
}

impl Recorder {
    fn pump(&mut self) -> Result<()> {
        while let Some(record) = self.cache.pop() {
            self.handle(record)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if !self.cache.is_empty() {
            log::debug!("flushing {} buffered records", self.cache.len());
        }
        for record in self.cache.drain() {
            self.handle(record)?;
        }
        Ok(())
    }

    fn write(&mut self, record: &Record) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.write_record(record)?;
        }
        Ok(())
    }

    fn handle(&mut self, record: Record) -> Result<()> {
        self.tree.update(&record);
        match &record {
            Record::Sample(_) => {
                self.sample_count += 1;
                self.mark_sample_hits(&record);
            }
            Record::Lost(lost) => self.lost_count += lost.lost,
            _ => {}
        }
        self.write(&record)
    }

    // Resolving every sampled ip marks the DSOs it hits, which decides what
    // gets a dumped symbol table later.
    fn mark_sample_hits(&mut self, record: &Record) {
        let Record::Sample(sample) = record else {
            return;
        };
        let pid = sample.pid as i32;
        let tid = sample.tid as i32;
        self.tree.resolve(pid, tid, sample.ip, sample.in_kernel());
        let mut in_kernel = sample.in_kernel();
        for &ip in &sample.callchain {
            if ip >= PERF_CONTEXT_MAX {
                match ip {
                    PERF_CONTEXT_KERNEL => in_kernel = true,
                    PERF_CONTEXT_USER => in_kernel = false,
                    _ => {}
                }
                continue;
            }
            self.tree.resolve(pid, tid, ip, in_kernel);
        }
    }
}

pub fn run(args: &RecordArgs) -> Result<()> {
    let event_selection_set = EventSelectionSet::new(false);
    for group in &args.events.groups {
        let names: Vec<String> = group.split(',').map(str::to_string).collect();
        event_selection_set.add_event_group(&names)?;
    }
    for event in &args.events.events {
        event_selection_set.add_event_type(event)?;
    }
    if event_selection_set.is_empty() {
        // Hardware counters are missing on some VMs; fall back to the timer.
        if event_selection_set.add_event_type("cpu-cycles").is_err() {
            event_selection_set.add_event_type("cpu-clock")?;
        }
    }

    if let Some(period) = args.period {
        event_selection_set.set_sample_period(period);
    } else if let Some(freq) = args.freq {
        if let Some(max) = max_sample_rate() {
            if freq > max {
                return Err(Error::InvalidConfig(format!(
                    "sample frequency can be at most {max} as configured in \
                     /proc/sys/kernel/perf_event_max_sample_rate"
                )));
            }
        }
        event_selection_set.set_sample_freq(freq);
    }
    match parse_call_graph(args)? {
        CallGraphMode::None => {}
        CallGraphMode::FramePointer => event_selection_set.enable_fp_callchain_sampling(),
        CallGraphMode::Dwarf(stack_size) => {
            event_selection_set.enable_dwarf_callchain_sampling(stack_size)?;
            // Captured stacks and registers are stored raw in the file; the
            // reporting side owns the unwinding.
            if args.no_unwind {
                info!("--no-unwind: stack data is stored raw (this is also the default)");
            }
            if args.keep_failed_unwinding_debug_info {
                info!("keeping stack and register data for all samples");
            }
        }
    }
    event_selection_set.sample_id_all();
    event_selection_set.set_low_watermark();

    let mut workload = None;
    let mut target_pids: Vec<i32> = args.target.pids.clone();
    if !args.command.is_empty() {
        if args.target.system_wide || !args.target.pids.is_empty() || !args.target.tids.is_empty()
        {
            return Err(Error::InvalidConfig(
                "a workload command can't be combined with other targets".into(),
            ));
        }
        let spawned = Workload::spawn(&args.command)?;
        target_pids.push(spawned.pid());
        event_selection_set.add_monitored_processes(&[spawned.pid()]);
        event_selection_set.set_enable_on_exec(true);
        workload = Some(spawned);
    } else if args.target.system_wide {
        event_selection_set.add_monitored_threads(&[-1]);
    } else if !args.target.pids.is_empty() || !args.target.tids.is_empty() {
        event_selection_set.add_monitored_processes(&args.target.pids);
        event_selection_set.add_monitored_threads(&args.target.tids);
    } else {
        return Err(Error::InvalidConfig(
            "no target to record; use -p, -t, -a or a command".into(),
        ));
    }

    // Sampling always opens per (tid, cpu) pairs so ring buffers can be
    // shared per cpu; an empty list means the online set.
    let cpus: Vec<i32> = match &args.cpus {
        Some(list) => parse_cpu_list(list)?,
        None => vec![],
    };
    event_selection_set.open_event_files(&cpus)?;
    let (min_pages, max_pages) = match args.mmap_pages {
        Some(pages) => {
            if !pages.is_power_of_two() {
                return Err(Error::InvalidConfig(
                    "mmap pages must be a power of two".into(),
                ));
            }
            (pages, pages)
        }
        None => (DEFAULT_MIN_MMAP_PAGES, DEFAULT_MAX_MMAP_PAGES),
    };
    event_selection_set.mmap_event_files(min_pages, max_pages)?;

    let attrs_with_id = event_selection_set.event_attrs_with_id();
    let attrs: Vec<FileAttr> = attrs_with_id
        .iter()
        .map(|a| FileAttr {
            attr: a.attr.clone(),
            ids: a.ids.clone(),
        })
        .collect();
    // Lines of "name,type,config", the format the meta info section uses.
    let event_names: Vec<String> = attrs_with_id
        .iter()
        .map(|a| format!("{},{},{}", a.name, a.attr.event_type, a.attr.config))
        .collect();

    let file = File::create(&args.output)?;
    let mut writer = RecordFileWriter::new(BufWriter::new(file))?;
    writer.write_attrs(&attrs)?;

    let has_timestamp = attrs
        .first()
        .is_some_and(|a| a.attr.sample_type.contains(miniperf_record::SampleFormat::TIME));
    let recorder = Rc::new(RefCell::new(Recorder {
        cache: RecordCache::new(has_timestamp, CACHE_MIN_SIZE, CACHE_MIN_TIME_DIFF_NS),
        tree: ThreadTree::new(Rc::new(SymbolConfig {
            demangle: false,
            ..Default::default()
        })),
        writer: Some(writer),
        sample_count: 0,
        lost_count: 0,
    }));

    dump_initial_state(&recorder, args.target.system_wide, &target_pids, &args.target.tids)?;

    let io_loop = IOEventLoop::new();
    {
        let handle = io_loop.clone();
        io_loop.add_signal_events(&[libc::SIGINT, libc::SIGTERM, libc::SIGHUP], move || {
            handle.exit_loop();
            Ok(())
        })?;
    }
    if let Some(seconds) = args.duration {
        let handle = io_loop.clone();
        io_loop.add_periodic_event(Duration::from_secs_f64(seconds), move || {
            handle.exit_loop();
            Ok(())
        });
    }
    let callback = {
        let recorder = recorder.clone();
        Rc::new(RefCell::new(move |record: Record| {
            let mut recorder = recorder.borrow_mut();
            recorder.cache.push(record);
            recorder.pump()
        })) as Rc<RefCell<dyn FnMut(Record) -> Result<()>>>
    };
    event_selection_set.prepare_to_read_mmap_event_data(&io_loop, callback)?;
    let monitored_cpus: Vec<i32> = cpus.clone();
    event_selection_set.handle_cpu_hotplug_events(
        &io_loop,
        &monitored_cpus,
        HOTPLUG_CHECK_INTERVAL,
    )?;

    if let Some(workload) = &mut workload {
        // Register before the child can exit, so the signal is never missed.
        // WNOWAIT peeks without reaping; the Workload reaps after the loop.
        let handle = io_loop.clone();
        let pid = workload.pid();
        io_loop.add_signal_event(libc::SIGCHLD, move || {
            let mut status = 0;
            let flags = libc::WNOHANG | libc::WNOWAIT;
            if unsafe { libc::waitpid(pid, &mut status, flags) } == pid {
                handle.exit_loop();
            }
            Ok(())
        })?;
        workload.start()?;
    }

    io_loop.run()?;
    if let Some(workload) = &mut workload {
        match workload.try_finished() {
            Some(false) => warn!("profiled command exited with a nonzero status"),
            // Still running (duration expired or interrupted): dropping the
            // workload stops it.
            Some(true) | None => {}
        }
    }

    event_selection_set.finish_read_mmap_event_data()?;
    let (sample_count, lost_count) = {
        let mut recorder = recorder.borrow_mut();
        finish_recording(&mut recorder, &event_selection_set, &event_names)?
    };

    if lost_count > 0 {
        warn!("lost {lost_count} samples due to buffer overflow");
    }
    info!("samples recorded: {sample_count}; samples lost: {lost_count}");
    println!("Samples recorded: {sample_count}. Samples lost: {lost_count}.");
    Ok(())
}

fn finish_recording(
    recorder: &mut Recorder,
    event_selection_set: &EventSelectionSet,
    event_names: &[String],
) -> Result<(u64, u64)> {
    recorder.flush()?;

    // Dump kernel symbols when kernel ips were sampled, so reporting works
    // away from this machine. A record's size field is 16 bits, so the dump
    // is split into chunks at line boundaries.
    if event_selection_set.need_kernel_symbol() && recorder.tree.kernel_dso().is_hit() {
        if let Ok(kallsyms) = read_string_lossy("/proc/kallsyms") {
            const KERNEL_SYMBOL_CHUNK: usize = 63 * 1024;
            let mut rest = kallsyms.as_str();
            while !rest.is_empty() {
                let mut end = rest.len().min(KERNEL_SYMBOL_CHUNK);
                while end < rest.len() && !rest.is_char_boundary(end) {
                    end -= 1;
                }
                if end < rest.len() {
                    end = rest[..end].rfind('\n').map(|i| i + 1).unwrap_or(end);
                }
                let (chunk, tail) = rest.split_at(end);
                recorder.write(&Record::KernelSymbol(KernelSymbolRecord {
                    kallsyms: chunk.to_string(),
                }))?;
                rest = tail;
            }
        }
    }

    // Per-DSO symbol tables for everything that was hit.
    let mut file_features = Vec::new();
    for dso in recorder.tree.hit_dsos() {
        if dso.is_dumped() {
            continue;
        }
        dso.set_dumped();
        let symbols = dso.symbols();
        if symbols.is_empty() {
            continue;
        }
        let file_type = match dso.dso_type() {
            DsoType::Kernel => dso_type::DSO_KERNEL,
            DsoType::KernelModule => dso_type::DSO_KERNEL_MODULE,
            DsoType::DexFile => dso_type::DSO_DEX_FILE,
            DsoType::SymbolMapFile => dso_type::DSO_SYMBOL_MAP_FILE,
            DsoType::ElfFile | DsoType::EmbeddedElf => dso_type::DSO_ELF_FILE,
            DsoType::Unknown => dso_type::DSO_UNKNOWN_FILE,
        };
        file_features.push(FileFeature {
            path: dso.path().to_string(),
            file_type,
            min_vaddr: dso.min_vaddr(),
            symbols: symbols
                .iter()
                .map(|s| FileSymbol {
                    vaddr: s.addr,
                    len: s.len.min(u32::MAX as u64) as u32,
                    name: s.name.clone(),
                })
                .collect(),
            file_offset_of_min_vaddr: (file_type == dso_type::DSO_ELF_FILE)
                .then(|| dso.min_vaddr()),
            memory_offset_of_min_vaddr: (file_type == dso_type::DSO_KERNEL_MODULE)
                .then(|| dso.min_vaddr()),
            dex_file_offsets: Vec::new(),
        });
    }
    if let Some(writer) = recorder.writer.as_mut() {
        if !file_features.is_empty() {
            writer.write_file_features(&file_features)?;
        }
        if let Some(build_id) = get_kernel_build_id() {
            writer.write_build_id_feature(&[BuildIdRecord {
                misc: MISC_KERNEL,
                pid: -1,
                build_id,
                filename: DEFAULT_KERNEL_MMAP_NAME.to_string(),
            }])?;
        }
        writer.write_meta_info_feature(&[
            (
                "miniperf_version".to_string(),
                env!("CARGO_PKG_VERSION").to_string(),
            ),
            ("event_type_info".to_string(), event_names.join("\n")),
            ("kernel_symbols_available".to_string(), "true".to_string()),
        ])?;
        writer.write_string_feature(feature::ARCH, &machine_arch())?;
        writer.write_string_feature(feature::OSRELEASE, &os_release())?;
    }

    if let Some(writer) = recorder.writer.take() {
        writer.finish()?;
    }
    Ok((recorder.sample_count, recorder.lost_count))
}

/// Processes and maps that exist before recording starts are synthesized as
/// records, so state replay at report time sees them.
fn dump_initial_state(
    recorder: &Rc<RefCell<Recorder>>,
    system_wide: bool,
    pids: &[i32],
    tids: &[i32],
) -> Result<()> {
    let mut recorder = recorder.borrow_mut();

    // Kernel text mapping first.
    if let Some(start) = get_kernel_start_address() {
        recorder.handle(Record::Mmap(MmapRecord {
            misc: MISC_KERNEL,
            pid: u32::MAX,
            tid: 0,
            addr: start,
            len: u64::MAX - start,
            pgoff: 0,
            filename: DEFAULT_KERNEL_MMAP_NAME.to_string(),
            sample_id: SampleId::default(),
        }))?;
    }

    let mut dump_pids: Vec<i32> = pids.to_vec();
    if system_wide {
        if let Ok(entries) = std::fs::read_dir("/proc") {
            for entry in entries.flatten() {
                if let Ok(pid) = entry.file_name().to_string_lossy().parse::<i32>() {
                    dump_pids.push(pid);
                }
            }
        }
    }
    for &tid in tids {
        // /proc/<tid> works as a process directory, so bare tids can be
        // dumped the same way.
        if !dump_pids.contains(&tid) {
            dump_pids.push(tid);
        }
    }

    for &pid in &dump_pids {
        let Ok(threads) = get_threads_in_process(pid) else {
            continue;
        };
        for tid in threads {
            let comm = get_thread_comm(pid, tid).unwrap_or_else(|| "unknown".to_string());
            recorder.handle(Record::Comm(CommRecord {
                misc: 0,
                pid: pid as u32,
                tid: tid as u32,
                comm,
                sample_id: SampleId::default(),
            }))?;
        }
        let Ok(regions) = get_process_maps(pid) else {
            continue;
        };
        for region in regions {
            if !region.is_executable {
                continue;
            }
            recorder.handle(Record::Mmap(MmapRecord {
                misc: MISC_USER,
                pid: pid as u32,
                tid: pid as u32,
                addr: region.start,
                len: region.end - region.start,
                pgoff: region.file_offset,
                filename: region.name,
                sample_id: SampleId::default(),
            }))?;
        }
    }
    Ok(())
}
