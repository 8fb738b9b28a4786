use miniperf_record::{
    AttrFlags, EventAttr, ReadFormat, SampleFormat, EVENT_TYPE_HARDWARE, EVENT_TYPE_HW_CACHE,
    EVENT_TYPE_SOFTWARE, EVENT_TYPE_TRACEPOINT, EVENT_TYPE_USER_SPACE_SAMPLER,
};

use super::environment::read_string_lossy;
use super::event_fd::EventFd;
use super::sys::*;
use crate::error::{Error, Result};

pub const DEFAULT_SAMPLE_FREQ_FOR_NONTRACEPOINT_EVENT: u64 = 4000;
pub const DEFAULT_SAMPLE_PERIOD_FOR_TRACEPOINT_EVENT: u64 = 1;

/// One entry of the event table: a name the user can select and the
/// (type, config) pair the kernel understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventType {
    pub name: String,
    pub event_type: u32,
    pub config: u64,
}

static HARDWARE_EVENTS: &[(&str, u64)] = &[
    ("cpu-cycles", PERF_COUNT_HW_CPU_CYCLES),
    ("instructions", PERF_COUNT_HW_INSTRUCTIONS),
    ("cache-references", PERF_COUNT_HW_CACHE_REFERENCES),
    ("cache-misses", PERF_COUNT_HW_CACHE_MISSES),
    ("branch-instructions", PERF_COUNT_HW_BRANCH_INSTRUCTIONS),
    ("branch-misses", PERF_COUNT_HW_BRANCH_MISSES),
    ("bus-cycles", PERF_COUNT_HW_BUS_CYCLES),
    ("stalled-cycles-frontend", PERF_COUNT_HW_STALLED_CYCLES_FRONTEND),
    ("stalled-cycles-backend", PERF_COUNT_HW_STALLED_CYCLES_BACKEND),
];

static SOFTWARE_EVENTS: &[(&str, u64)] = &[
    ("cpu-clock", PERF_COUNT_SW_CPU_CLOCK),
    ("task-clock", PERF_COUNT_SW_TASK_CLOCK),
    ("page-faults", PERF_COUNT_SW_PAGE_FAULTS),
    ("context-switches", PERF_COUNT_SW_CONTEXT_SWITCHES),
    ("cpu-migrations", PERF_COUNT_SW_CPU_MIGRATIONS),
    ("minor-faults", PERF_COUNT_SW_PAGE_FAULTS_MIN),
    ("major-faults", PERF_COUNT_SW_PAGE_FAULTS_MAJ),
    ("alignment-faults", PERF_COUNT_SW_ALIGNMENT_FAULTS),
    ("emulation-faults", PERF_COUNT_SW_EMULATION_FAULTS),
];

static CACHE_NAMES: &[(&str, u64)] = &[
    ("L1-dcache", PERF_COUNT_HW_CACHE_L1D),
    ("L1-icache", PERF_COUNT_HW_CACHE_L1I),
    ("LLC", PERF_COUNT_HW_CACHE_LL),
    ("dTLB", PERF_COUNT_HW_CACHE_DTLB),
    ("iTLB", PERF_COUNT_HW_CACHE_ITLB),
    ("branch", PERF_COUNT_HW_CACHE_BPU),
];

static CACHE_OPS: &[(&str, u64, u64)] = &[
    ("loads", PERF_COUNT_HW_CACHE_OP_READ, PERF_COUNT_HW_CACHE_RESULT_ACCESS),
    ("load-misses", PERF_COUNT_HW_CACHE_OP_READ, PERF_COUNT_HW_CACHE_RESULT_MISS),
    ("stores", PERF_COUNT_HW_CACHE_OP_WRITE, PERF_COUNT_HW_CACHE_RESULT_ACCESS),
    ("store-misses", PERF_COUNT_HW_CACHE_OP_WRITE, PERF_COUNT_HW_CACHE_RESULT_MISS),
    ("prefetches", PERF_COUNT_HW_CACHE_OP_PREFETCH, PERF_COUNT_HW_CACHE_RESULT_ACCESS),
    ("prefetch-misses", PERF_COUNT_HW_CACHE_OP_PREFETCH, PERF_COUNT_HW_CACHE_RESULT_MISS),
];

pub const USER_SPACE_SAMPLER_EVENT_NAME: &str = "inplace-sampler";

pub fn hardware_event_types() -> Vec<EventType> {
    HARDWARE_EVENTS
        .iter()
        .map(|&(name, config)| EventType {
            name: name.to_string(),
            event_type: EVENT_TYPE_HARDWARE,
            config,
        })
        .collect()
}

pub fn software_event_types() -> Vec<EventType> {
    SOFTWARE_EVENTS
        .iter()
        .map(|&(name, config)| EventType {
            name: name.to_string(),
            event_type: EVENT_TYPE_SOFTWARE,
            config,
        })
        .collect()
}

pub fn cache_event_types() -> Vec<EventType> {
    let mut result = Vec::with_capacity(CACHE_NAMES.len() * CACHE_OPS.len());
    for &(cache, cache_id) in CACHE_NAMES {
        for &(op, op_id, result_id) in CACHE_OPS {
            result.push(EventType {
                name: format!("{cache}-{op}"),
                event_type: EVENT_TYPE_HW_CACHE,
                config: cache_id | (op_id << 8) | (result_id << 16),
            });
        }
    }
    result
}

/// Tracepoint events published under tracefs, as "subsys:name" pairs.
pub fn tracepoint_event_types() -> Vec<EventType> {
    let mut result = Vec::new();
    for events_dir in ["/sys/kernel/tracing/events", "/sys/kernel/debug/tracing/events"] {
        let subsystems = match std::fs::read_dir(events_dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for subsys in subsystems.flatten() {
            if !subsys.path().is_dir() {
                continue;
            }
            let subsys_name = subsys.file_name().to_string_lossy().into_owned();
            let events = match std::fs::read_dir(subsys.path()) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for event in events.flatten() {
                let id_path = event.path().join("id");
                if let Ok(id) = read_string_lossy(&id_path) {
                    if let Ok(config) = id.trim().parse() {
                        result.push(EventType {
                            name: format!("{}:{}", subsys_name, event.file_name().to_string_lossy()),
                            event_type: EVENT_TYPE_TRACEPOINT,
                            config,
                        });
                    }
                }
            }
        }
        if !result.is_empty() {
            break;
        }
    }
    result.sort_by(|a, b| a.name.cmp(&b.name));
    result
}

pub fn find_event_type_by_name(name: &str) -> Option<EventType> {
    if name == USER_SPACE_SAMPLER_EVENT_NAME {
        return Some(EventType {
            name: name.to_string(),
            event_type: EVENT_TYPE_USER_SPACE_SAMPLER,
            config: 0,
        });
    }
    if let Some(&(n, config)) = HARDWARE_EVENTS.iter().find(|(n, _)| *n == name) {
        return Some(EventType {
            name: n.to_string(),
            event_type: EVENT_TYPE_HARDWARE,
            config,
        });
    }
    if let Some(&(n, config)) = SOFTWARE_EVENTS.iter().find(|(n, _)| *n == name) {
        return Some(EventType {
            name: n.to_string(),
            event_type: EVENT_TYPE_SOFTWARE,
            config,
        });
    }
    if let Some(event) = cache_event_types().into_iter().find(|e| e.name == name) {
        return Some(event);
    }
    if name.contains(':') {
        return tracepoint_event_types().into_iter().find(|e| e.name == name);
    }
    None
}

/// An event selected by the user: the base type plus parsed modifiers.
#[derive(Debug, Clone)]
pub struct EventTypeAndModifier {
    /// Full selection name including the modifier suffix.
    pub name: String,
    pub event_type: EventType,
    pub modifier: String,
    pub exclude_user: bool,
    pub exclude_kernel: bool,
    pub exclude_hv: bool,
    pub exclude_host: bool,
    pub exclude_guest: bool,
    pub precise_ip: u8,
}

/// Parse "event[:modifier]" where the modifier chars are u k h G H p.
pub fn parse_event_type(full_name: &str) -> Result<EventTypeAndModifier> {
    let (type_name, modifier) = match full_name.rsplit_once(':') {
        // A ':' inside a tracepoint name is part of the event, so only treat
        // the suffix as a modifier if it parses as one.
        Some((base, suffix)) if is_modifier(suffix) && find_event_type_by_name(base).is_some() => {
            (base, suffix)
        }
        _ => (full_name, ""),
    };
    let event_type = find_event_type_by_name(type_name)
        .ok_or_else(|| Error::InvalidConfig(format!("unknown event type '{type_name}'")))?;

    let mut parsed = EventTypeAndModifier {
        name: if modifier.is_empty() {
            type_name.to_string()
        } else {
            format!("{type_name}:{modifier}")
        },
        event_type,
        modifier: modifier.to_string(),
        exclude_user: false,
        exclude_kernel: false,
        exclude_hv: false,
        exclude_host: false,
        exclude_guest: false,
        precise_ip: 0,
    };
    // Any of u,k,h implies excluding the other privilege levels; G,H do the
    // same for guest/host.
    if modifier.contains(['u', 'k', 'h']) {
        parsed.exclude_user = !modifier.contains('u');
        parsed.exclude_kernel = !modifier.contains('k');
        parsed.exclude_hv = !modifier.contains('h');
    }
    if modifier.contains(['G', 'H']) {
        parsed.exclude_guest = !modifier.contains('G');
        parsed.exclude_host = !modifier.contains('H');
    }
    parsed.precise_ip = modifier.chars().filter(|&c| c == 'p').count().min(3) as u8;
    Ok(parsed)
}

fn is_modifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| "ukhGHp".contains(c))
}

/// Default attr for an event type: frequency-based sampling with the usual
/// record-side selectors, and mmap/comm/task reporting turned on so the
/// kernel tells us about address space and thread changes. The selection
/// set refines it further.
pub fn create_default_attr(event_type: &EventType) -> EventAttr {
    let mut attr = EventAttr {
        event_type: event_type.event_type,
        config: event_type.config,
        sample_type: SampleFormat::IP | SampleFormat::TID | SampleFormat::TIME | SampleFormat::PERIOD,
        read_format: ReadFormat::TOTAL_TIME_ENABLED | ReadFormat::TOTAL_TIME_RUNNING | ReadFormat::ID,
        flags: AttrFlags::MMAP | AttrFlags::MMAP2 | AttrFlags::COMM | AttrFlags::TASK,
        ..Default::default()
    };
    if event_type.event_type == EVENT_TYPE_TRACEPOINT {
        attr.sample_period_or_freq = DEFAULT_SAMPLE_PERIOD_FOR_TRACEPOINT_EVENT;
    } else {
        attr.flags |= AttrFlags::FREQ;
        attr.sample_period_or_freq = DEFAULT_SAMPLE_FREQ_FOR_NONTRACEPOINT_EVENT;
    }
    attr
}

/// Probe kernel support for an attr by opening it briefly on this thread.
/// A permission error means the event exists but is restricted, which still
/// counts as supported.
pub fn is_supported_by_kernel(attr: &EventAttr) -> bool {
    if attr.event_type == EVENT_TYPE_USER_SPACE_SAMPLER {
        return true;
    }
    let tid = unsafe { libc::syscall(libc::SYS_gettid) } as libc::pid_t;
    match EventFd::open(attr, "probe", tid, -1, None) {
        Ok(_) => true,
        Err(Error::KernelOpen { source, .. }) => matches!(
            source.raw_os_error(),
            Some(libc::EPERM) | Some(libc::EACCES)
        ),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_event_names_resolve() {
        let cycles = find_event_type_by_name("cpu-cycles").unwrap();
        assert_eq!(cycles.event_type, EVENT_TYPE_HARDWARE);
        assert_eq!(cycles.config, PERF_COUNT_HW_CPU_CYCLES);

        let clock = find_event_type_by_name("task-clock").unwrap();
        assert_eq!(clock.event_type, EVENT_TYPE_SOFTWARE);

        let cache = find_event_type_by_name("L1-dcache-load-misses").unwrap();
        assert_eq!(cache.event_type, EVENT_TYPE_HW_CACHE);
        assert_eq!(
            cache.config,
            PERF_COUNT_HW_CACHE_L1D
                | (PERF_COUNT_HW_CACHE_OP_READ << 8)
                | (PERF_COUNT_HW_CACHE_RESULT_MISS << 16)
        );

        assert!(find_event_type_by_name("no-such-event").is_none());
    }

    #[test]
    fn modifier_parsing() {
        let parsed = parse_event_type("cpu-cycles:u").unwrap();
        assert!(!parsed.exclude_user);
        assert!(parsed.exclude_kernel);
        assert!(parsed.exclude_hv);

        let parsed = parse_event_type("cpu-cycles:kpp").unwrap();
        assert!(parsed.exclude_user);
        assert!(!parsed.exclude_kernel);
        assert_eq!(parsed.precise_ip, 2);

        let parsed = parse_event_type("instructions").unwrap();
        assert!(!parsed.exclude_user);
        assert!(!parsed.exclude_kernel);
        assert_eq!(parsed.precise_ip, 0);

        assert!(parse_event_type("bogus:u").is_err());
    }

    #[test]
    fn default_attr_uses_freq_except_tracepoints() {
        let cycles = find_event_type_by_name("cpu-cycles").unwrap();
        let attr = create_default_attr(&cycles);
        assert!(attr.flags.contains(AttrFlags::FREQ));
        assert_eq!(
            attr.sample_period_or_freq,
            DEFAULT_SAMPLE_FREQ_FOR_NONTRACEPOINT_EVENT
        );

        let tracepoint = EventType {
            name: "sched:sched_switch".into(),
            event_type: EVENT_TYPE_TRACEPOINT,
            config: 323,
        };
        let attr = create_default_attr(&tracepoint);
        assert!(!attr.flags.contains(AttrFlags::FREQ));
        assert_eq!(attr.sample_period_or_freq, 1);
    }
}
