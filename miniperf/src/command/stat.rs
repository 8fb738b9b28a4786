use std::fs::File;
use std::io::Write;
use std::time::{Duration, Instant};

use log::warn;

use crate::cli::StatArgs;
use crate::error::{Error, Result};
use crate::linux::event_selection::{CountersInfo, EventSelectionSet};
use crate::linux::io_loop::IOEventLoop;
use crate::linux::workload::Workload;

// Counted when the user names no events, in this order.
static DEFAULT_STAT_EVENTS: &[&str] = &[
    "cpu-cycles",
    "stalled-cycles-frontend",
    "stalled-cycles-backend",
    "instructions",
    "branch-instructions",
    "branch-misses",
    "task-clock",
    "context-switches",
    "page-faults",
];

pub fn run(args: &StatArgs) -> Result<()> {
    let event_selection_set = EventSelectionSet::new(true);
    for group in &args.events.groups {
        let names: Vec<String> = group.split(',').map(str::to_string).collect();
        event_selection_set.add_event_group(&names)?;
    }
    for event in &args.events.events {
        event_selection_set.add_event_type(event)?;
    }
    if event_selection_set.is_empty() {
        for event in DEFAULT_STAT_EVENTS {
            if let Err(err) = event_selection_set.add_event_type(event) {
                warn!("skipping default event {event}: {err}");
            }
        }
    }
    if event_selection_set.is_empty() {
        return Err(Error::InvalidConfig(
            "no event is usable on this machine".into(),
        ));
    }

    let mut workload = None;
    if !args.command.is_empty() {
        if args.target.system_wide || !args.target.pids.is_empty() || !args.target.tids.is_empty()
        {
            return Err(Error::InvalidConfig(
                "a workload command can't be combined with other targets".into(),
            ));
        }
        let spawned = Workload::spawn(&args.command)?;
        event_selection_set.add_monitored_processes(&[spawned.pid()]);
        event_selection_set.set_enable_on_exec(true);
        workload = Some(spawned);
    } else if args.target.system_wide {
        event_selection_set.add_monitored_threads(&[-1]);
        event_selection_set.set_start_disabled();
    } else if !args.target.pids.is_empty() || !args.target.tids.is_empty() {
        event_selection_set.add_monitored_processes(&args.target.pids);
        event_selection_set.add_monitored_threads(&args.target.tids);
        // Open the counters stopped and flip them on together once the loop
        // is set up, so setup time is not counted.
        event_selection_set.set_start_disabled();
    } else {
        return Err(Error::InvalidConfig(
            "no target to monitor; use -p, -t, -a or a command".into(),
        ));
    }

    let cpus: Vec<i32> = if args.target.system_wide { vec![] } else { vec![-1] };
    event_selection_set.open_event_files(&cpus)?;

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
    event_selection_set.handle_cpu_hotplug_events(&io_loop, &[], Duration::from_secs(2))?;

    let start = Instant::now();
    if workload.is_none() {
        event_selection_set.enable()?;
    }
    match &mut workload {
        Some(workload) => {
            // Register before the child can exit, so the signal is never
            // missed. WNOWAIT peeks without reaping; the Workload reaps
            // after the loop.
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
            io_loop.run()?;
            if workload.try_finished() == Some(false) {
                warn!("counted command exited with a nonzero status");
            }
        }
        None => {
            if args.duration.is_none() {
                log::info!("counting until ctrl-c");
            }
            io_loop.run()?;
        }
    }
    let wall_clock = start.elapsed();

    // Stop the counters so the values hold still while they are read.
    event_selection_set.disable()?;
    let counters = event_selection_set.read_counters()?;
    let report = format_counters(&counters, wall_clock);
    match &args.output {
        Some(path) => File::create(path)?.write_all(report.as_bytes())?,
        None => print!("{report}"),
    }
    Ok(())
}

fn format_counters(counters: &[CountersInfo], wall_clock: Duration) -> String {
    let mut out = String::from("Performance counter statistics:\n\n");
    for info in counters {
        let mut value = 0u64;
        let mut time_enabled = 0u64;
        let mut time_running = 0u64;
        for counter in &info.counters {
            value += counter.counter.value;
            time_enabled += counter.counter.time_enabled;
            time_running += counter.counter.time_running;
        }
        let name = if info.event_modifier.is_empty() {
            info.event_name.clone()
        } else {
            format!("{}:{}", info.event_name, info.event_modifier)
        };
        // The kernel multiplexes over-committed counters; scale the value up
        // by the fraction of time the event was actually scheduled.
        if time_running < time_enabled && time_running != 0 {
            let scaled = (value as u128 * time_enabled as u128 / time_running as u128) as u64;
            let percent = time_running as f64 / time_enabled as f64 * 100.0;
            out += &format!("  {scaled:>20}  {name:<30} # (scaled from {percent:.0}%)\n");
        } else if time_running == 0 && time_enabled != 0 {
            out += &format!("  {:>20}  {name:<30} # (never scheduled)\n", "<not counted>");
        } else {
            out += &format!("  {value:>20}  {name}\n");
        }
    }
    out += &format!("\nTotal test time: {:.6} seconds.\n", wall_clock.as_secs_f64());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linux::event_fd::{CounterInfo, PerfCounter};

    fn info(name: &str, value: u64, time_enabled: u64, time_running: u64) -> CountersInfo {
        CountersInfo {
            group_id: 0,
            event_name: name.to_string(),
            event_modifier: String::new(),
            counters: vec![CounterInfo {
                tid: 1,
                cpu: 0,
                counter: PerfCounter {
                    value,
                    time_enabled,
                    time_running,
                    id: 1,
                },
            }],
        }
    }

    #[test]
    fn scaling_is_reported() {
        let counters = vec![
            info("cpu-cycles", 1000, 200, 100),
            info("instructions", 500, 200, 200),
        ];
        let report = format_counters(&counters, Duration::from_millis(1500));
        assert!(report.contains("2000"), "{report}");
        assert!(report.contains("(scaled from 50%)"), "{report}");
        assert!(report.contains("500"));
        assert!(!report.contains("instructions                   #"));
        assert!(report.contains("Total test time: 1.500000 seconds."));
    }

    #[test]
    fn never_scheduled_counters_are_marked() {
        let counters = vec![info("branch-misses", 0, 100, 0)];
        let report = format_counters(&counters, Duration::from_secs(1));
        assert!(report.contains("<not counted>"));
    }
}
