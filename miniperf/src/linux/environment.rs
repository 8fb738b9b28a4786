use std::fs;
use std::path::Path;

use libc::pid_t;

use crate::error::{Error, Result};

pub fn read_string_lossy<P: AsRef<Path>>(path: P) -> std::io::Result<String> {
    let data = fs::read(path)?;
    Ok(String::from_utf8_lossy(&data).into_owned())
}

/// Parse a cpu list in the kernel's "0-3,5,7-8" notation.
pub fn parse_cpu_list(list: &str) -> Result<Vec<i32>> {
    let mut cpus = Vec::new();
    for part in list.trim().split(',') {
        if part.is_empty() {
            continue;
        }
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: i32 = lo
                    .trim()
                    .parse()
                    .map_err(|_| Error::InvalidConfig(format!("invalid cpu range '{part}'")))?;
                let hi: i32 = hi
                    .trim()
                    .parse()
                    .map_err(|_| Error::InvalidConfig(format!("invalid cpu range '{part}'")))?;
                if lo > hi {
                    return Err(Error::InvalidConfig(format!("invalid cpu range '{part}'")));
                }
                cpus.extend(lo..=hi);
            }
            None => cpus.push(
                part.trim()
                    .parse()
                    .map_err(|_| Error::InvalidConfig(format!("invalid cpu '{part}'")))?,
            ),
        }
    }
    Ok(cpus)
}

/// The kernel's current online cpu set.
pub fn get_online_cpus() -> Vec<i32> {
    match read_string_lossy("/sys/devices/system/cpu/online") {
        Ok(list) => parse_cpu_list(&list).unwrap_or_default(),
        Err(_) => (0..num_cpus::get() as i32).collect(),
    }
}

pub fn get_threads_in_process(pid: pid_t) -> std::io::Result<Vec<pid_t>> {
    let mut tids = Vec::new();
    for entry in fs::read_dir(format!("/proc/{pid}/task"))? {
        let entry = entry?;
        if let Ok(tid) = entry.file_name().to_string_lossy().parse() {
            tids.push(tid);
        }
    }
    tids.sort_unstable();
    Ok(tids)
}

pub fn get_thread_comm(pid: pid_t, tid: pid_t) -> Option<String> {
    let comm = read_string_lossy(format!("/proc/{pid}/task/{tid}/comm")).ok()?;
    Some(comm.trim_end_matches('\n').to_string())
}

pub fn get_process_maps(pid: pid_t) -> std::io::Result<Vec<super::proc_maps::Region>> {
    let maps = read_string_lossy(format!("/proc/{pid}/maps"))?;
    Ok(super::proc_maps::parse(&maps))
}

/// Start address of the kernel text mapping, from the `_text` symbol in
/// kallsyms. Unreadable or restricted kallsyms yields `None`.
pub fn get_kernel_start_address() -> Option<u64> {
    let kallsyms = read_string_lossy("/proc/kallsyms").ok()?;
    for line in kallsyms.lines() {
        let mut parts = line.split_whitespace();
        let addr = parts.next()?;
        let _kind = parts.next()?;
        if parts.next() == Some("_text") {
            return u64::from_str_radix(addr, 16).ok();
        }
    }
    None
}

/// Find the GNU build id note in an ELF note section blob.
pub fn build_id_from_notes(section_data: &[u8]) -> Option<Vec<u8>> {
    const NT_GNU_BUILD_ID: u32 = 3;
    let mut data = section_data;
    while data.len() >= 12 {
        let name_size = u32::from_ne_bytes(data[0..4].try_into().unwrap()) as usize;
        let desc_size = u32::from_ne_bytes(data[4..8].try_into().unwrap()) as usize;
        let note_type = u32::from_ne_bytes(data[8..12].try_into().unwrap());
        let name_end = 12 + name_size.next_multiple_of(4);
        let desc_end = name_end + desc_size.next_multiple_of(4);
        if desc_end > data.len() {
            return None;
        }
        let name = &data[12..12 + name_size];
        if note_type == NT_GNU_BUILD_ID && name == b"GNU\0" {
            return Some(data[name_end..name_end + desc_size].to_vec());
        }
        data = &data[desc_end..];
    }
    None
}

pub fn get_kernel_build_id() -> Option<Vec<u8>> {
    let notes = fs::read("/sys/kernel/notes").ok()?;
    build_id_from_notes(&notes)
}

pub fn max_sample_rate() -> Option<u64> {
    let data = read_string_lossy("/proc/sys/kernel/perf_event_max_sample_rate").ok()?;
    data.trim().parse().ok()
}

pub fn machine_arch() -> String {
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        return String::new();
    }
    c_chars_to_string(&uts.machine)
}

pub fn os_release() -> String {
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        return String::new();
    }
    c_chars_to_string(&uts.release)
}

fn c_chars_to_string(chars: &[libc::c_char]) -> String {
    let bytes: Vec<u8> = chars
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_id_note_parsing() {
        let notes = b"\x04\0\0\0\x14\0\0\0\x03\0\0\0GNU\0\x98Kvo\x1c\xb5i\x9c;\x1bw\xb5\x92\x98<\"\xe9\xd1\x97\xad\x06\0\0\0\x04\0\0\0\x01\x01\0\0Linux\0\0\0\0\0\0\0";
        let build_id = build_id_from_notes(notes).unwrap();
        assert_eq!(build_id.len(), 20);
        assert_eq!(build_id[0], 0x98);
        assert!(build_id_from_notes(b"junk").is_none());
    }

    #[test]
    fn cpu_list_parsing() {
        assert_eq!(parse_cpu_list("0-3,5").unwrap(), vec![0, 1, 2, 3, 5]);
        assert_eq!(parse_cpu_list("2").unwrap(), vec![2]);
        assert_eq!(parse_cpu_list("0-1,4-5\n").unwrap(), vec![0, 1, 4, 5]);
        assert!(parse_cpu_list("3-1").is_err());
        assert!(parse_cpu_list("x").is_err());
    }
}
