use std::cmp::Ordering;
use std::fs::File;
use std::io::BufReader;
use std::rc::Rc;

use miniperf_record::{Record, RecordFileReader, SampleRecord};

use crate::cli::ReportArgs;
use crate::error::{Error, Result};
use crate::profile::callchain::{CallChainNode, CallChainRoot};
use crate::profile::dso::{SymbolConfig, SymbolEntry};
use crate::profile::sample_tree::{SampleComparator, SampleEntry, SampleTree};
use crate::profile::thread_tree::ThreadTree;
use crate::profile::{PERF_CONTEXT_KERNEL, PERF_CONTEXT_MAX, PERF_CONTEXT_USER};

const MAX_CALLCHAIN_PRINT_DEPTH: usize = 20;

/// One report column: its header, how to render an entry into it, and how
/// to compare entries when it is used as a sort key.
struct Displayer {
    header: &'static str,
    render: fn(&SampleEntry) -> String,
    compare: fn(&SampleEntry, &SampleEntry) -> Ordering,
}

fn displayer_for_key(key: &str) -> Option<Displayer> {
    let displayer = match key {
        "pid" => Displayer {
            header: "Pid",
            render: |e| e.pid.to_string(),
            compare: |a, b| a.pid.cmp(&b.pid),
        },
        "tid" => Displayer {
            header: "Tid",
            render: |e| e.tid.to_string(),
            compare: |a, b| a.tid.cmp(&b.tid),
        },
        "comm" => Displayer {
            header: "Command",
            render: |e| e.thread_comm.clone(),
            compare: |a, b| a.thread_comm.cmp(&b.thread_comm),
        },
        "dso" => Displayer {
            header: "Shared Object",
            render: |e| e.dso.path().to_string(),
            compare: |a, b| a.dso.path().cmp(b.dso.path()),
        },
        "symbol" => Displayer {
            header: "Symbol",
            render: |e| e.symbol.display_name().to_string(),
            compare: |a, b| a.symbol.display_name().cmp(b.symbol.display_name()),
        },
        _ => return None,
    };
    Some(displayer)
}

fn build_displayers(sort_keys: &[String]) -> Result<Vec<Displayer>> {
    let default_keys = ["comm", "pid", "tid", "dso", "symbol"];
    let keys: Vec<String> = if sort_keys.is_empty() {
        default_keys.iter().map(|s| s.to_string()).collect()
    } else {
        sort_keys.to_vec()
    };
    keys.iter()
        .map(|key| {
            displayer_for_key(key)
                .ok_or_else(|| Error::InvalidConfig(format!("unknown sort key '{key}'")))
        })
        .collect()
}

pub fn run(args: &ReportArgs) -> Result<()> {
    if let Some(symfs) = &args.symfs {
        if !symfs.is_dir() {
            return Err(Error::SymbolLoad(format!(
                "symfs directory {} does not exist",
                symfs.display()
            )));
        }
    }
    let file = File::open(&args.input)?;
    let mut reader = RecordFileReader::parse_file(BufReader::new(file))?;

    let mut build_id_map = std::collections::HashMap::new();
    for entry in reader.build_ids()? {
        build_id_map.insert(entry.filename.clone(), entry.build_id.clone());
    }
    let config = Rc::new(SymbolConfig {
        symfs_dir: args.symfs.clone(),
        kallsyms: None,
        build_id_map,
        demangle: !args.no_demangle,
    });
    let mut tree = ThreadTree::new(config);
    for feature in reader.file_features()? {
        tree.install_file_feature(
            &feature.path,
            feature.file_type,
            feature.min_vaddr,
            feature.file_offset_of_min_vaddr,
            feature
                .symbols
                .iter()
                .map(|s| SymbolEntry {
                    addr: s.vaddr,
                    len: s.len as u64,
                    name: s.name.clone(),
                    demangled_name: String::new(),
                })
                .collect(),
        );
    }

    let displayers = build_displayers(&args.sort)?;
    let comparator: SampleComparator = {
        let compares: Vec<fn(&SampleEntry, &SampleEntry) -> Ordering> =
            displayers.iter().map(|d| d.compare).collect();
        Box::new(move |a, b| {
            for compare in &compares {
                let ordering = compare(a, b);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        })
    };
    let mut sample_tree = SampleTree::new(comparator);

    // Records were time-ordered at record time, so one pass replays state
    // and resolves each sample against the state it saw.
    while let Some(record) = reader.read_record()? {
        tree.update(&record);
        if let Record::Sample(sample) = &record {
            add_sample(&mut tree, &mut sample_tree, sample, args.show_callchain);
        }
    }

    let event_name = reader
        .meta_info()
        .get("event_type_info")
        .and_then(|info| info.lines().next().map(|l| l.split(',').next().unwrap_or(l).to_string()))
        .unwrap_or_else(|| "unknown".to_string());

    print_report(&mut sample_tree, &displayers, &event_name, args);
    Ok(())
}

fn add_sample(
    tree: &mut ThreadTree,
    sample_tree: &mut SampleTree,
    sample: &SampleRecord,
    with_callchain: bool,
) {
    let pid = sample.pid as i32;
    let tid = sample.tid as i32;
    let (map, symbol, _) = tree.resolve(pid, tid, sample.ip, sample.in_kernel());
    let thread_comm = tree
        .find_thread(tid)
        .map(|t| t.comm.clone())
        .unwrap_or_else(|| "unknown".to_string());

    let mut chain: Vec<Rc<SymbolEntry>> = Vec::new();
    if with_callchain && !sample.callchain.is_empty() {
        chain.push(symbol.clone());
        let mut in_kernel = sample.in_kernel();
        let mut first_frame = true;
        for &ip in &sample.callchain {
            if ip >= PERF_CONTEXT_MAX {
                match ip {
                    PERF_CONTEXT_KERNEL => in_kernel = true,
                    PERF_CONTEXT_USER => in_kernel = false,
                    _ => {}
                }
                continue;
            }
            // The first real entry repeats the sampled ip.
            if first_frame && ip == sample.ip {
                first_frame = false;
                continue;
            }
            first_frame = false;
            let (_, frame_symbol, _) = tree.resolve(pid, tid, ip, in_kernel);
            chain.push(frame_symbol);
        }
    }

    let entry = SampleEntry {
        pid,
        tid,
        thread_comm,
        dso: map.dso.clone(),
        symbol,
        period: sample.period,
        sample_count: 1,
        callchain: CallChainRoot::new(),
    };
    sample_tree.add_sample(entry, &chain);
}

fn print_report(
    sample_tree: &mut SampleTree,
    displayers: &[Displayer],
    event_name: &str,
    args: &ReportArgs,
) {
    println!(
        "Samples: {} of event '{}'",
        sample_tree.total_samples(),
        event_name
    );
    println!("Event count (approx.): {}", sample_tree.total_period());
    println!();

    // Two passes: render all rows first so every column gets the width of
    // its longest value.
    let total_period = sample_tree.total_period();
    let mut rows: Vec<(Vec<String>, u64)> = Vec::new();
    sample_tree.visit_all(|entry| {
        let mut row = Vec::with_capacity(displayers.len() + 2);
        let overhead = if total_period > 0 {
            entry.period as f64 / total_period as f64 * 100.0
        } else {
            0.0
        };
        row.push(format!("{overhead:.2}%"));
        if args.show_sample_count {
            row.push(entry.sample_count.to_string());
        }
        for displayer in displayers {
            row.push((displayer.render)(entry));
        }
        rows.push((row, entry.period));
    });

    let mut headers: Vec<&str> = vec!["Overhead"];
    if args.show_sample_count {
        headers.push("Sample");
    }
    headers.extend(displayers.iter().map(|d| d.header));
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for (row, _) in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let header_line: Vec<String> = headers
        .iter()
        .zip(&widths)
        .map(|(h, &w)| format!("{h:<w$}"))
        .collect();
    println!("{}", header_line.join("  "));
    for (row, _) in &rows {
        let line: Vec<String> = row
            .iter()
            .zip(&widths)
            .map(|(cell, &w)| format!("{cell:<w$}"))
            .collect();
        println!("{}", line.join("  "));
    }

    if args.show_callchain {
        println!();
        sample_tree.visit_all(|entry| {
            if entry.callchain.children.is_empty() {
                return;
            }
            println!(
                "-- {} ({}, period {})",
                entry.symbol.display_name(),
                entry.thread_comm,
                entry.period
            );
            for child in &entry.callchain.children {
                print_callchain_node(child, 1);
            }
            println!();
        });
    }
}

fn print_callchain_node(node: &CallChainNode<Rc<SymbolEntry>>, depth: usize) {
    if depth > MAX_CALLCHAIN_PRINT_DEPTH {
        return;
    }
    let indent = "   ".repeat(depth);
    let total = node.period + node.children_period;
    for symbol in &node.chain {
        println!("{indent}|-- {} (period {total})", symbol.display_name());
    }
    for child in &node.children {
        print_callchain_node(child, depth + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_keys_build_comparators() {
        assert!(build_displayers(&["pid".into(), "symbol".into()]).is_ok());
        assert!(build_displayers(&[]).unwrap().len() == 5);
        assert!(build_displayers(&["bogus".into()]).is_err());
    }
}
