use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::rc::Rc;

use miniperf_record::{Record, RecordFileReader, RecordFileWriter, SampleRecord};

use crate::cli::DebugUnwindArgs;
use crate::error::Result;
use crate::profile::dso::SymbolConfig;
use crate::profile::thread_tree::ThreadTree;
use crate::profile::{PERF_CONTEXT_KERNEL, PERF_CONTEXT_MAX, PERF_CONTEXT_USER};

/// Pull the stack-capture data of selected samples out of a record file:
/// print what a later offline unwind would consume, and optionally write a
/// pruned file holding just those samples and the state records they need.
pub fn run(args: &DebugUnwindArgs) -> Result<()> {
    if let Some(symfs) = &args.symfs {
        if !symfs.is_dir() {
            return Err(crate::error::Error::SymbolLoad(format!(
                "symfs directory {} does not exist",
                symfs.display()
            )));
        }
    }
    let file = File::open(&args.input)?;
    let mut reader = RecordFileReader::parse_file(BufReader::new(file))?;

    let mut writer = match &args.output {
        Some(path) => {
            let mut writer = RecordFileWriter::new(BufWriter::new(File::create(path)?))?;
            writer.write_attrs(reader.attrs())?;
            Some(writer)
        }
        None => None,
    };

    let config = Rc::new(SymbolConfig {
        symfs_dir: args.symfs.clone(),
        demangle: true,
        ..Default::default()
    });
    let mut tree = ThreadTree::new(config);

    let mut selected = 0u64;
    let mut skipped = 0u64;
    while let Some(record) = reader.read_record()? {
        tree.update(&record);
        match &record {
            Record::Sample(sample) => {
                if args.sample_time.is_some_and(|time| time != sample.time) {
                    skipped += 1;
                    continue;
                }
                selected += 1;
                if args.unwind_sample {
                    dump_sample(&mut tree, sample);
                }
                if let Some(writer) = writer.as_mut() {
                    writer.write_record(&record)?;
                }
            }
            // State records are kept so the pruned file still resolves.
            _ => {
                if let Some(writer) = writer.as_mut() {
                    writer.write_record(&record)?;
                }
            }
        }
    }
    if let Some(writer) = writer.take() {
        writer.finish()?;
    }

    println!("Selected {selected} samples, skipped {skipped}.");
    Ok(())
}

fn dump_sample(tree: &mut ThreadTree, sample: &SampleRecord) {
    println!("sample at time {}:", sample.time);
    println!("  pid {} tid {} cpu {}", sample.pid, sample.tid, sample.cpu);
    let (map, symbol, vaddr) = tree.resolve(
        sample.pid as i32,
        sample.tid as i32,
        sample.ip,
        sample.in_kernel(),
    );
    println!(
        "  ip {:#x} ({} in {}, vaddr {:#x})",
        sample.ip,
        symbol.display_name(),
        map.dso.path(),
        vaddr
    );
    println!(
        "  user regs: abi {}, {} values; user stack: {} bytes captured, {} dynamic",
        sample.regs_abi,
        sample.regs.len(),
        sample.stack.len(),
        sample.stack_dyn_size
    );
    if !sample.callchain.is_empty() {
        println!("  kernel callchain ({} entries):", sample.callchain.len());
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
            let (_, frame, _) =
                tree.resolve(sample.pid as i32, sample.tid as i32, ip, in_kernel);
            println!("    {:#x} {}", ip, frame.display_name());
        }
    }
}
