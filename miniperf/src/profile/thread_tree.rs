use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use miniperf_record::{dso_type, Record};

use super::dso::{Dso, DsoType, SymbolConfig, SymbolEntry, DEFAULT_KERNEL_MMAP_NAME};

/// A mapped region of one address space, bound to the DSO behind it.
#[derive(Debug, Clone)]
pub struct MapEntry {
    pub start: u64,
    pub len: u64,
    pub pgoff: u64,
    pub time: u64,
    pub dso: Rc<Dso>,
}

impl MapEntry {
    pub fn end(&self) -> u64 {
        self.start + self.len
    }

    pub fn contains(&self, ip: u64) -> bool {
        ip >= self.start && ip < self.end()
    }
}

/// Maps of one address space, keyed by start, non-overlapping.
pub type MapSet = BTreeMap<u64, Rc<MapEntry>>;

pub struct ThreadEntry {
    pub pid: i32,
    pub tid: i32,
    pub comm: String,
    /// Threads of one process share the map set; a new process gets its own
    /// copy seeded from the parent.
    pub maps: Rc<RefCell<MapSet>>,
}

/// The mutable model of processes, threads, maps, and DSOs, updated from the
/// record stream and queried at every sample.
pub struct ThreadTree {
    threads: HashMap<i32, ThreadEntry>,
    kernel_maps: RefCell<MapSet>,
    kernel_dso: Rc<Dso>,
    module_dsos: RefCell<HashMap<String, Rc<Dso>>>,
    user_dsos: RefCell<HashMap<String, Rc<Dso>>>,
    /// DSOs announced by Dso records in a record file, keyed by their id.
    file_dsos: HashMap<u64, Rc<Dso>>,
    unknown_dso: Rc<Dso>,
    unknown_map: Rc<MapEntry>,
    unknown_symbol: Rc<SymbolEntry>,
    next_dso_id: std::cell::Cell<u64>,
    /// Whether in-band KernelSymbol records have replaced the local
    /// kallsyms; later chunks then merge instead of replacing.
    kernel_symbols_from_records: bool,
    config: Rc<SymbolConfig>,
}

impl ThreadTree {
    pub fn new(config: Rc<SymbolConfig>) -> ThreadTree {
        let kernel_dso = Rc::new(Dso::new(
            DsoType::Kernel,
            0,
            DEFAULT_KERNEL_MMAP_NAME,
            config.clone(),
        ));
        let unknown_dso = Rc::new(Dso::new(DsoType::Unknown, 1, "unknown", config.clone()));
        let unknown_map = Rc::new(MapEntry {
            start: 0,
            len: 0,
            pgoff: 0,
            time: 0,
            dso: unknown_dso.clone(),
        });
        let unknown_symbol = Rc::new(SymbolEntry {
            addr: 0,
            len: 0,
            name: "unknown".to_string(),
            demangled_name: String::new(),
        });
        ThreadTree {
            threads: HashMap::new(),
            kernel_maps: RefCell::new(MapSet::new()),
            kernel_dso,
            module_dsos: RefCell::new(HashMap::new()),
            user_dsos: RefCell::new(HashMap::new()),
            file_dsos: HashMap::new(),
            unknown_dso,
            unknown_map,
            unknown_symbol,
            next_dso_id: std::cell::Cell::new(2),
            kernel_symbols_from_records: false,
            config,
        }
    }

    /// Apply one record's effect on the tree. Samples do not mutate state
    /// and are not handled here.
    pub fn update(&mut self, record: &Record) {
        match record {
            Record::Comm(r) => self.add_thread(r.pid as i32, r.tid as i32, &r.comm),
            Record::Fork(r) => self.fork_thread(
                r.pid as i32,
                r.tid as i32,
                r.ppid as i32,
                r.ptid as i32,
            ),
            // Exited threads stay reachable; late samples may still name
            // them.
            Record::Exit(_) => {}
            Record::Mmap(r) => {
                if r.in_kernel() {
                    self.add_kernel_map(r.addr, r.len, r.pgoff, r.sample_id.time, &r.filename);
                } else {
                    self.add_thread_map(
                        r.pid as i32,
                        r.tid as i32,
                        r.addr,
                        r.len,
                        r.pgoff,
                        r.sample_id.time,
                        &r.filename,
                    );
                }
            }
            Record::Mmap2(r) => {
                if r.in_kernel() {
                    self.add_kernel_map(r.addr, r.len, r.pgoff, r.sample_id.time, &r.filename);
                } else {
                    self.add_thread_map(
                        r.pid as i32,
                        r.tid as i32,
                        r.addr,
                        r.len,
                        r.pgoff,
                        r.sample_id.time,
                        &r.filename,
                    );
                }
            }
            // Kallsyms dumps arrive split across records at line
            // boundaries; the first chunk replaces whatever the local
            // machine would provide, later chunks merge in.
            Record::KernelSymbol(r) => {
                let mut symbols = super::dso::parse_kallsyms(&r.kallsyms);
                if self.kernel_symbols_from_records {
                    symbols.extend(self.kernel_dso.symbols().iter().map(|s| (**s).clone()));
                }
                super::dso::fix_kernel_symbol_len(&mut symbols);
                self.kernel_dso.set_symbols(symbols);
                self.kernel_symbols_from_records = true;
            }
            Record::Dso(r) => self.add_dso_record(r.dso_type, r.dso_id, r.min_vaddr, &r.dso_name),
            Record::Symbol(r) => {
                if let Some(dso) = self.file_dsos.get(&r.dso_id) {
                    let mut symbols: Vec<SymbolEntry> = dso
                        .symbols()
                        .iter()
                        .map(|s| (**s).clone())
                        .collect();
                    symbols.push(SymbolEntry {
                        addr: r.addr,
                        len: r.len,
                        name: r.name.clone(),
                        demangled_name: String::new(),
                    });
                    dso.set_symbols(symbols);
                }
            }
            _ => {}
        }
    }

    pub fn add_thread(&mut self, pid: i32, tid: i32, comm: &str) {
        let maps = self.maps_for_process(pid, tid);
        let entry = self.threads.entry(tid).or_insert_with(|| ThreadEntry {
            pid,
            tid,
            comm: "unknown".to_string(),
            maps,
        });
        entry.pid = pid;
        entry.comm = comm.to_string();
    }

    pub fn fork_thread(&mut self, pid: i32, tid: i32, ppid: i32, ptid: i32) {
        let (parent_comm, parent_maps) = {
            let parent = self.find_thread_or_new(ppid, ptid);
            (parent.comm.clone(), parent.maps.clone())
        };
        let maps = if pid == ppid {
            // Same process: the new thread shares its address space.
            parent_maps
        } else {
            // New process: it starts with a copy of the parent's maps.
            Rc::new(RefCell::new(parent_maps.borrow().clone()))
        };
        let entry = self.threads.entry(tid).or_insert_with(|| ThreadEntry {
            pid,
            tid,
            comm: String::new(),
            maps: maps.clone(),
        });
        entry.pid = pid;
        entry.comm = parent_comm;
        entry.maps = maps;
    }

    pub fn find_thread_or_new(&mut self, pid: i32, tid: i32) -> &ThreadEntry {
        if !self.threads.contains_key(&tid) {
            let maps = self.maps_for_process(pid, tid);
            self.threads.insert(
                tid,
                ThreadEntry {
                    pid,
                    tid,
                    comm: "unknown".to_string(),
                    maps,
                },
            );
        } else if self.threads[&tid].pid != pid {
            let maps = self.maps_for_process(pid, tid);
            if let Some(entry) = self.threads.get_mut(&tid) {
                log::debug!(
                    "thread {} moved from process {} to {}",
                    entry.tid,
                    entry.pid,
                    pid
                );
                entry.pid = pid;
                entry.maps = maps;
            }
        }
        &self.threads[&tid]
    }

    // The map set of a process lives with its main thread; other threads
    // attach to it so an mmap seen on any of them lands in one place.
    fn maps_for_process(&mut self, pid: i32, tid: i32) -> Rc<RefCell<MapSet>> {
        if pid != tid && pid != -1 {
            if !self.threads.contains_key(&pid) {
                let maps = Rc::new(RefCell::new(MapSet::new()));
                self.threads.insert(
                    pid,
                    ThreadEntry {
                        pid,
                        tid: pid,
                        comm: "unknown".to_string(),
                        maps,
                    },
                );
            }
            self.threads[&pid].maps.clone()
        } else {
            match self.threads.get(&tid) {
                Some(entry) => entry.maps.clone(),
                None => Rc::new(RefCell::new(MapSet::new())),
            }
        }
    }

    pub fn add_kernel_map(&mut self, start: u64, len: u64, pgoff: u64, time: u64, filename: &str) {
        // Kernel map length is 0 when recorded without enough privilege.
        if len == 0 {
            return;
        }
        let dso = self.find_kernel_dso_or_new(filename);
        let map = Rc::new(MapEntry {
            start,
            len,
            pgoff,
            time,
            dso,
        });
        insert_map(&mut self.kernel_maps.borrow_mut(), map);
    }

    pub fn add_thread_map(
        &mut self,
        pid: i32,
        tid: i32,
        start: u64,
        len: u64,
        pgoff: u64,
        time: u64,
        filename: &str,
    ) {
        let dso = self.find_user_dso_or_new(filename);
        let maps = self.find_thread_or_new(pid, tid).maps.clone();
        let map = Rc::new(MapEntry {
            start,
            len,
            pgoff,
            time,
            dso,
        });
        insert_map(&mut maps.borrow_mut(), map);
    }

    fn find_kernel_dso_or_new(&self, filename: &str) -> Rc<Dso> {
        if filename == DEFAULT_KERNEL_MMAP_NAME || filename.starts_with("[kernel") {
            return self.kernel_dso.clone();
        }
        self.module_dsos
            .borrow_mut()
            .entry(filename.to_string())
            .or_insert_with(|| {
                Rc::new(Dso::new(
                    DsoType::KernelModule,
                    self.take_dso_id(),
                    filename,
                    self.config.clone(),
                ))
            })
            .clone()
    }

    fn find_user_dso_or_new(&self, filename: &str) -> Rc<Dso> {
        self.user_dsos
            .borrow_mut()
            .entry(filename.to_string())
            .or_insert_with(|| {
                let dso_type = user_dso_type_of(filename);
                Rc::new(Dso::new(
                    dso_type,
                    self.take_dso_id(),
                    filename,
                    self.config.clone(),
                ))
            })
            .clone()
    }

    fn take_dso_id(&self) -> u64 {
        let id = self.next_dso_id.get();
        self.next_dso_id.set(id + 1);
        id
    }

    fn add_dso_record(&mut self, raw_type: u64, dso_id: u64, min_vaddr: u64, name: &str) {
        let dso = match raw_type as u32 {
            dso_type::DSO_KERNEL => self.kernel_dso.clone(),
            dso_type::DSO_KERNEL_MODULE => self.find_kernel_dso_or_new(name),
            _ => self.find_user_dso_or_new(name),
        };
        dso.set_min_vaddr(min_vaddr);
        // Start a fresh in-band table; Symbol records follow.
        dso.set_symbols(Vec::new());
        self.file_dsos.insert(dso_id, dso);
    }

    /// Install a symbol table stored in a record file's FILE feature, so
    /// lookups hit it instead of the local filesystem.
    pub fn install_file_feature(
        &mut self,
        path: &str,
        file_type: u32,
        min_vaddr: u64,
        file_offset_of_min_vaddr: Option<u64>,
        symbols: Vec<SymbolEntry>,
    ) {
        let dso = match file_type {
            dso_type::DSO_KERNEL => self.kernel_dso.clone(),
            dso_type::DSO_KERNEL_MODULE => self.find_kernel_dso_or_new(path),
            _ => self.find_user_dso_or_new(path),
        };
        dso.set_min_vaddr(min_vaddr);
        if let Some(offset) = file_offset_of_min_vaddr {
            dso.set_file_offset_of_min_vaddr(offset);
        }
        dso.set_symbols(symbols);
    }

    pub fn kernel_dso(&self) -> Rc<Dso> {
        self.kernel_dso.clone()
    }

    pub fn find_thread(&self, tid: i32) -> Option<&ThreadEntry> {
        self.threads.get(&tid)
    }

    /// All DSOs that recorded a hit, for post-run symbol dumping.
    pub fn hit_dsos(&self) -> Vec<Rc<Dso>> {
        let mut result = Vec::new();
        if self.kernel_dso.is_hit() {
            result.push(self.kernel_dso.clone());
        }
        for dso in self.module_dsos.borrow().values() {
            if dso.is_hit() {
                result.push(dso.clone());
            }
        }
        for dso in self.user_dsos.borrow().values() {
            if dso.is_hit() {
                result.push(dso.clone());
            }
        }
        result.sort_by_key(|dso| dso.id());
        result
    }

    /// The unique map covering `ip` in the thread's or the kernel's address
    /// space, or the unknown-map sentinel.
    pub fn find_map(&self, thread: &ThreadEntry, ip: u64, in_kernel: bool) -> Rc<MapEntry> {
        let found = if in_kernel {
            find_map_by_addr(&self.kernel_maps.borrow(), ip)
        } else {
            find_map_by_addr(&thread.maps.borrow(), ip)
        };
        found.unwrap_or_else(|| self.unknown_map.clone())
    }

    /// Full resolution of one ip: ensure the thread exists, find its map,
    /// and resolve the symbol.
    pub fn resolve(
        &mut self,
        pid: i32,
        tid: i32,
        ip: u64,
        in_kernel: bool,
    ) -> (Rc<MapEntry>, Rc<SymbolEntry>, u64) {
        self.find_thread_or_new(pid, tid);
        let found = {
            let thread = &self.threads[&tid];
            if in_kernel {
                find_map_by_addr(&self.kernel_maps.borrow(), ip)
            } else {
                find_map_by_addr(&thread.maps.borrow(), ip)
            }
        };
        let map = found.unwrap_or_else(|| self.unknown_map.clone());
        let (symbol, vaddr_in_file) = self.find_symbol(&map, ip);
        (map, symbol, vaddr_in_file)
    }

    /// Resolve an ip hitting `map` to a symbol. Marks the DSO hit. Returns
    /// the symbol and the vaddr-in-file the lookup used.
    pub fn find_symbol(&self, map: &MapEntry, ip: u64) -> (Rc<SymbolEntry>, u64) {
        if Rc::ptr_eq(&map.dso, &self.unknown_dso) {
            return (self.unknown_symbol.clone(), ip);
        }
        map.dso.set_hit();
        let vaddr_in_file = map.dso.ip_to_vaddr_in_file(ip, map.start, map.pgoff);
        match map.dso.find_symbol(vaddr_in_file) {
            Some(symbol) => (symbol, vaddr_in_file),
            None => (map.dso.synthesize_symbol(vaddr_in_file), vaddr_in_file),
        }
    }

}

fn user_dso_type_of(filename: &str) -> DsoType {
    if filename.ends_with(".dex") || filename.ends_with(".vdex") || filename.ends_with(".odex") {
        DsoType::DexFile
    } else if filename.contains(".apk!/") || filename.contains(".zip!/") {
        DsoType::EmbeddedElf
    } else if filename.ends_with(".map") {
        DsoType::SymbolMapFile
    } else {
        DsoType::ElfFile
    }
}

fn find_map_by_addr(maps: &MapSet, addr: u64) -> Option<Rc<MapEntry>> {
    let (_, map) = maps.range(..=addr).next_back()?;
    map.contains(addr).then(|| map.clone())
}

/// Insert a map, trimming or removing whatever it overlaps so the new map
/// wins on its range.
pub fn insert_map(maps: &mut MapSet, map: Rc<MapEntry>) {
    if map.len == 0 {
        return;
    }
    let new_start = map.start;
    let new_end = map.end();

    let mut overlapping: Vec<u64> = Vec::new();
    if let Some((&start, old)) = maps.range(..=new_start).next_back() {
        if old.end() > new_start {
            overlapping.push(start);
        }
    }
    for (&start, _) in maps.range(new_start..new_end) {
        if !overlapping.contains(&start) {
            overlapping.push(start);
        }
    }

    for start in overlapping {
        let old = maps.remove(&start).unwrap();
        if old.start < new_start {
            let left_len = new_start - old.start;
            maps.insert(
                old.start,
                Rc::new(MapEntry {
                    start: old.start,
                    len: left_len,
                    pgoff: old.pgoff,
                    time: old.time,
                    dso: old.dso.clone(),
                }),
            );
        }
        if old.end() > new_end {
            let right_start = new_end;
            maps.insert(
                right_start,
                Rc::new(MapEntry {
                    start: right_start,
                    len: old.end() - new_end,
                    pgoff: old.pgoff + (right_start - old.start),
                    time: old.time,
                    dso: old.dso.clone(),
                }),
            );
        }
    }
    maps.insert(map.start, map);
}

#[cfg(test)]
mod tests {
    use super::*;
    use miniperf_record::{CommRecord, MmapRecord, SampleId, TaskRecord, MISC_USER};

    fn tree() -> ThreadTree {
        ThreadTree::new(Rc::new(SymbolConfig::default()))
    }

    fn user_mmap(pid: i32, start: u64, len: u64, pgoff: u64, filename: &str) -> Record {
        Record::Mmap(MmapRecord {
            misc: MISC_USER,
            pid: pid as u32,
            tid: pid as u32,
            addr: start,
            len,
            pgoff,
            filename: filename.into(),
            sample_id: SampleId::default(),
        })
    }

    #[test]
    fn overlapping_maps_are_trimmed() {
        let mut tree = tree();
        tree.update(&user_mmap(1, 0x1000, 0x2000, 0, "/lib/a.so"));
        tree.update(&user_mmap(1, 0x2000, 0x1000, 0, "/lib/b.so"));

        let thread = tree.find_thread_or_new(1, 1);
        let maps = thread.maps.borrow();
        let ranges: Vec<(u64, u64, String)> = maps
            .values()
            .map(|m| (m.start, m.end(), m.dso.path().to_string()))
            .collect();
        assert_eq!(
            ranges,
            vec![
                (0x1000, 0x2000, "/lib/a.so".to_string()),
                (0x2000, 0x3000, "/lib/b.so".to_string()),
            ]
        );
    }

    #[test]
    fn new_map_splits_a_larger_old_one() {
        let mut tree = tree();
        tree.update(&user_mmap(1, 0x1000, 0x4000, 0, "/lib/big.so"));
        tree.update(&user_mmap(1, 0x2000, 0x1000, 0, "/lib/small.so"));

        let thread = tree.find_thread_or_new(1, 1);
        let maps = thread.maps.borrow();
        let ranges: Vec<(u64, u64, u64)> =
            maps.values().map(|m| (m.start, m.end(), m.pgoff)).collect();
        assert_eq!(
            ranges,
            vec![(0x1000, 0x2000, 0), (0x2000, 0x3000, 0), (0x3000, 0x5000, 0x2000)]
        );
    }

    #[test]
    fn threads_share_process_maps_and_forked_processes_copy() {
        let mut tree = tree();
        tree.update(&user_mmap(10, 0x1000, 0x1000, 0, "/bin/app"));
        // A thread of process 10 sees the process map.
        tree.update(&Record::Comm(CommRecord {
            misc: 0,
            pid: 10,
            tid: 11,
            comm: "worker".into(),
            sample_id: SampleId::default(),
        }));
        {
            let thread = tree.find_thread(11).unwrap();
            assert_eq!(thread.maps.borrow().len(), 1);
        }

        // Fork to a new process: it copies the maps, and further maps in the
        // parent stay private to the parent.
        tree.update(&Record::Fork(TaskRecord {
            pid: 20,
            ppid: 10,
            tid: 20,
            ptid: 10,
            time: 0,
            sample_id: SampleId::default(),
        }));
        tree.update(&user_mmap(10, 0x9000, 0x1000, 0, "/lib/late.so"));
        assert_eq!(tree.find_thread(20).unwrap().maps.borrow().len(), 1);
        assert_eq!(tree.find_thread(10).unwrap().maps.borrow().len(), 2);

        // Fork within the same process shares.
        tree.update(&Record::Fork(TaskRecord {
            pid: 10,
            ppid: 10,
            tid: 12,
            ptid: 10,
            time: 0,
            sample_id: SampleId::default(),
        }));
        tree.update(&user_mmap(10, 0xa000, 0x1000, 0, "/lib/later.so"));
        assert_eq!(tree.find_thread(12).unwrap().maps.borrow().len(), 3);
    }

    #[test]
    fn exited_threads_stay_reachable() {
        let mut tree = tree();
        tree.update(&Record::Comm(CommRecord {
            misc: 0,
            pid: 5,
            tid: 5,
            comm: "dying".into(),
            sample_id: SampleId::default(),
        }));
        tree.update(&Record::Exit(TaskRecord {
            pid: 5,
            ppid: 1,
            tid: 5,
            ptid: 1,
            time: 0,
            sample_id: SampleId::default(),
        }));
        assert_eq!(tree.find_thread(5).unwrap().comm, "dying");
    }

    #[test]
    fn ip_resolution_through_map_and_symbols() {
        let mut tree = tree();
        tree.update(&user_mmap(1, 0x8000, 0x1000, 0x400, "/lib/a.so"));
        let (map, _, _) = tree.resolve(1, 1, 0x8100, false);
        assert_eq!(map.start, 0x8000);
        map.dso.set_min_vaddr(0x400);
        map.dso.set_symbols(vec![SymbolEntry {
            addr: 0x500,
            len: 0x20,
            name: "foo".into(),
            demangled_name: String::new(),
        }]);
        let (map, symbol, vaddr) = tree.resolve(1, 1, 0x8100, false);
        assert_eq!(symbol.name, "foo");
        assert_eq!(vaddr, 0x500);
        assert!(map.dso.is_hit());

        // A miss lands on the unknown map sentinel and the unknown symbol.
        let (missed, symbol, _) = tree.resolve(1, 1, 0xdead_0000, false);
        assert_eq!(missed.len, 0);
        assert_eq!(symbol.name, "unknown");
    }

    #[test]
    fn dso_and_symbol_records_install_tables() {
        let mut tree = tree();
        tree.update(&user_mmap(1, 0x8000, 0x1000, 0, "/lib/a.so"));
        tree.update(&Record::Dso(miniperf_record::DsoRecord {
            dso_type: miniperf_record::dso_type::DSO_ELF_FILE as u64,
            dso_id: 7,
            min_vaddr: 0,
            dso_name: "/lib/a.so".into(),
        }));
        tree.update(&Record::Symbol(miniperf_record::SymbolRecord {
            dso_id: 7,
            addr: 0x100,
            len: 0x10,
            name: "bar".into(),
        }));
        let (_, symbol, _) = tree.resolve(1, 1, 0x8105, false);
        assert_eq!(symbol.name, "bar");
    }
}
