use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::rc::Rc;

use log::warn;

use crate::linux::environment::read_string_lossy;

pub const DEFAULT_KERNEL_MMAP_NAME: &str = "[kernel.kallsyms]";

/// Process-wide symbolization settings, fixed before the pipeline starts.
#[derive(Default)]
pub struct SymbolConfig {
    /// Root to prepend when opening DSO files, for symbolizing against a
    /// copied device tree.
    pub symfs_dir: Option<PathBuf>,
    /// kallsyms contents to use instead of `/proc/kallsyms`.
    pub kallsyms: Option<String>,
    /// Expected build ids by DSO path; a mismatch makes the DSO load empty.
    pub build_id_map: HashMap<String, Vec<u8>>,
    pub demangle: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DsoType {
    Kernel,
    KernelModule,
    ElfFile,
    DexFile,
    EmbeddedElf,
    SymbolMapFile,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolEntry {
    pub addr: u64,
    pub len: u64,
    pub name: String,
    pub demangled_name: String,
}

impl SymbolEntry {
    pub fn display_name(&self) -> &str {
        if self.demangled_name.is_empty() {
            &self.name
        } else {
            &self.demangled_name
        }
    }
}

/// Demangle one symbol name, trying the Rust mangling first and Itanium
/// C++ after it.
pub fn demangle(name: &str) -> Option<String> {
    if let Ok(demangled) = rustc_demangle::try_demangle(name) {
        return Some(format!("{demangled:#}"));
    }
    if name.starts_with("_Z") {
        let options = cpp_demangle::DemangleOptions::default().no_return_type();
        if let Ok(symbol) = cpp_demangle::Symbol::new(name) {
            if let Ok(demangled) = symbol.demangle(&options) {
                return Some(demangled);
            }
        }
    }
    None
}

/// An executable or library that produced instruction pointers. Created
/// lazily on first reference and pinned for the program's lifetime; symbols
/// load once, on the first lookup.
pub struct Dso {
    dso_type: DsoType,
    id: u64,
    path: String,
    debug_path: PathBuf,
    min_vaddr: Cell<u64>,
    file_offset_of_min_vaddr: Cell<Option<u64>>,
    /// Sorted by addr, unique on addr.
    symbols: RefCell<Vec<Rc<SymbolEntry>>>,
    /// Interned placeholder symbols for addresses that resolve to nothing,
    /// named by their address so distinct misses stay distinguishable.
    synthesized: RefCell<BTreeMap<u64, Rc<SymbolEntry>>>,
    loaded: Cell<bool>,
    hit: Cell<bool>,
    dumped: Cell<bool>,
    config: Rc<SymbolConfig>,
}

impl Dso {
    pub fn new(dso_type: DsoType, id: u64, path: &str, config: Rc<SymbolConfig>) -> Dso {
        let debug_path = match (&config.symfs_dir, dso_type) {
            (Some(symfs), DsoType::ElfFile | DsoType::EmbeddedElf | DsoType::SymbolMapFile) => {
                symfs.join(path.trim_start_matches('/'))
            }
            _ => PathBuf::from(path),
        };
        Dso {
            dso_type,
            id,
            path: path.to_string(),
            debug_path,
            min_vaddr: Cell::new(0),
            file_offset_of_min_vaddr: Cell::new(None),
            symbols: RefCell::new(Vec::new()),
            synthesized: RefCell::new(BTreeMap::new()),
            loaded: Cell::new(false),
            hit: Cell::new(false),
            dumped: Cell::new(false),
            config,
        }
    }

    pub fn dso_type(&self) -> DsoType {
        self.dso_type
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    pub fn min_vaddr(&self) -> u64 {
        self.min_vaddr.get()
    }

    pub fn set_min_vaddr(&self, min_vaddr: u64) {
        self.min_vaddr.set(min_vaddr);
    }

    pub fn set_file_offset_of_min_vaddr(&self, offset: u64) {
        self.file_offset_of_min_vaddr.set(Some(offset));
    }

    /// Translate an ip hitting `map` to a virtual address in this DSO's
    /// address space. Kernel addresses are already absolute.
    pub fn ip_to_vaddr_in_file(&self, ip: u64, map_start: u64, map_pgoff: u64) -> u64 {
        match self.dso_type {
            DsoType::Kernel => ip,
            DsoType::KernelModule => ip.wrapping_sub(map_start).wrapping_add(self.min_vaddr.get()),
            _ => {
                let file_offset = ip.wrapping_sub(map_start).wrapping_add(map_pgoff);
                let base = self
                    .file_offset_of_min_vaddr
                    .get()
                    .unwrap_or_else(|| self.min_vaddr.get());
                file_offset.wrapping_sub(base).wrapping_add(self.min_vaddr.get())
            }
        }
    }

    pub fn is_hit(&self) -> bool {
        self.hit.get()
    }

    pub fn set_hit(&self) {
        self.hit.set(true);
    }

    pub fn is_dumped(&self) -> bool {
        self.dumped.get()
    }

    pub fn set_dumped(&self) {
        self.dumped.set(true);
    }

    /// Install a symbol table directly (from a record file's symbol records
    /// or FILE feature). Sorts and dedups on address, applies demangling.
    pub fn set_symbols(&self, mut symbols: Vec<SymbolEntry>) {
        symbols.sort_by_key(|s| s.addr);
        symbols.dedup_by_key(|s| s.addr);
        let demangle_enabled = self.config.demangle;
        *self.symbols.borrow_mut() = symbols
            .into_iter()
            .map(|mut symbol| {
                if demangle_enabled && symbol.demangled_name.is_empty() {
                    if let Some(demangled) = demangle(&symbol.name) {
                        symbol.demangled_name = demangled;
                    }
                }
                Rc::new(symbol)
            })
            .collect();
        self.loaded.set(true);
    }

    pub fn symbols(&self) -> Vec<Rc<SymbolEntry>> {
        self.ensure_symbols_loaded();
        self.symbols.borrow().clone()
    }

    /// Largest symbol with `addr <= vaddr_in_file` still covering it.
    pub fn find_symbol(&self, vaddr_in_file: u64) -> Option<Rc<SymbolEntry>> {
        self.ensure_symbols_loaded();
        let symbols = self.symbols.borrow();
        let index = match symbols.binary_search_by(|s| s.addr.cmp(&vaddr_in_file)) {
            Ok(index) => index,
            Err(0) => return None,
            Err(index) => index - 1,
        };
        let symbol = &symbols[index];
        if symbol.addr + symbol.len > vaddr_in_file {
            Some(symbol.clone())
        } else {
            None
        }
    }

    /// Placeholder symbol for an unresolved address, named after it.
    pub fn synthesize_symbol(&self, vaddr_in_file: u64) -> Rc<SymbolEntry> {
        self.synthesized
            .borrow_mut()
            .entry(vaddr_in_file)
            .or_insert_with(|| {
                let name = format!("{}[+{vaddr_in_file:x}]", self.file_name());
                Rc::new(SymbolEntry {
                    addr: vaddr_in_file,
                    len: 1,
                    demangled_name: String::new(),
                    name,
                })
            })
            .clone()
    }

    fn ensure_symbols_loaded(&self) {
        if self.loaded.get() {
            return;
        }
        self.loaded.set(true);
        let symbols = match self.dso_type {
            DsoType::Kernel => self.load_kernel_symbols(),
            DsoType::ElfFile | DsoType::SymbolMapFile => self.load_symbol_map_file(),
            // Kernel modules, dex files and embedded ELFs need symbol tables
            // provided in-band (symbol records or the FILE feature).
            _ => Vec::new(),
        };
        if !symbols.is_empty() {
            self.set_symbols(symbols);
        }
    }

    fn load_kernel_symbols(&self) -> Vec<SymbolEntry> {
        let kallsyms = match &self.config.kallsyms {
            Some(contents) => contents.clone(),
            None => match read_string_lossy("/proc/kallsyms") {
                Ok(contents) => contents,
                Err(err) => {
                    warn!("cannot read /proc/kallsyms: {err}");
                    return Vec::new();
                }
            },
        };
        let mut symbols = parse_kallsyms(&kallsyms);
        fix_kernel_symbol_len(&mut symbols);
        symbols
    }

    /// A plain-text symbol map: one "addr size name" line per symbol, both
    /// numbers hex. The user-space analogue of kallsyms.
    fn load_symbol_map_file(&self) -> Vec<SymbolEntry> {
        if !self.expected_build_id_matches() {
            return Vec::new();
        }
        let contents = match read_string_lossy(&self.debug_path) {
            Ok(contents) => contents,
            Err(_) => return Vec::new(),
        };
        parse_symbol_map(&contents)
    }

    fn expected_build_id_matches(&self) -> bool {
        // Identity verification needs the ELF note reader, which sits behind
        // the symbol-extraction seam. A DSO with a pinned build id therefore
        // only accepts in-band symbol tables.
        if self.config.build_id_map.contains_key(&self.path) {
            warn!(
                "dso {} has a pinned build id and no in-band symbols; treating as empty",
                self.path
            );
            return false;
        }
        true
    }
}

impl std::fmt::Debug for Dso {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Dso")
            .field("type", &self.dso_type)
            .field("id", &self.id)
            .field("path", &self.path)
            .field("min_vaddr", &self.min_vaddr.get())
            .finish()
    }
}

/// Parse kallsyms text into symbols with absolute addresses. Only text-ish
/// symbol kinds are kept.
pub fn parse_kallsyms(contents: &str) -> Vec<SymbolEntry> {
    let mut symbols = Vec::new();
    for line in contents.lines() {
        let mut parts = line.split_whitespace();
        let (Some(addr), Some(kind), Some(name)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        if !matches!(kind, "T" | "t" | "W" | "w") {
            continue;
        }
        let Ok(addr) = u64::from_str_radix(addr, 16) else {
            continue;
        };
        symbols.push(SymbolEntry {
            addr,
            len: 0,
            name: name.to_string(),
            demangled_name: String::new(),
        });
    }
    symbols
}

/// kallsyms entries carry no length; each symbol extends to the next one,
/// the last to the end of the address space.
pub fn fix_kernel_symbol_len(symbols: &mut [SymbolEntry]) {
    symbols.sort_by_key(|s| s.addr);
    for i in 0..symbols.len() {
        symbols[i].len = if i + 1 < symbols.len() {
            symbols[i + 1].addr - symbols[i].addr
        } else {
            u64::MAX - symbols[i].addr
        };
    }
}

pub fn parse_symbol_map(contents: &str) -> Vec<SymbolEntry> {
    let mut symbols = Vec::new();
    for line in contents.lines() {
        let mut parts = line.split_whitespace();
        let (Some(addr), Some(len)) = (parts.next(), parts.next()) else {
            continue;
        };
        let (Ok(addr), Ok(len)) = (
            u64::from_str_radix(addr.trim_start_matches("0x"), 16),
            u64::from_str_radix(len.trim_start_matches("0x"), 16),
        ) else {
            continue;
        };
        let name: String = parts.collect::<Vec<_>>().join(" ");
        if name.is_empty() {
            continue;
        }
        symbols.push(SymbolEntry {
            addr,
            len,
            name,
            demangled_name: String::new(),
        });
    }
    symbols
}

#[cfg(test)]
mod tests {
    use super::*;

    fn elf_dso(config: SymbolConfig) -> Dso {
        Dso::new(DsoType::ElfFile, 1, "/system/lib64/libfoo.so", Rc::new(config))
    }

    #[test]
    fn symbol_lookup_with_min_vaddr() {
        let dso = elf_dso(SymbolConfig::default());
        dso.set_min_vaddr(0x400);
        dso.set_symbols(vec![SymbolEntry {
            addr: 0x500,
            len: 0x20,
            name: "foo".into(),
            demangled_name: String::new(),
        }]);
        let vaddr = dso.ip_to_vaddr_in_file(0x8100, 0x8000, 0x400);
        assert_eq!(vaddr, 0x500);
        let symbol = dso.find_symbol(vaddr).unwrap();
        assert_eq!(symbol.name, "foo");
        assert!(dso.find_symbol(0x520).is_none());
        assert!(dso.find_symbol(0x4ff).is_none());
    }

    #[test]
    fn kallsyms_parse_and_len_fixup() {
        let kallsyms = "\
ffffffc000080000 T _text
ffffffc000080040 t secondary_entry
ffffffc0000800f0 T cpu_resume
ffffffc000080100 D some_data
";
        let mut symbols = parse_kallsyms(kallsyms);
        assert_eq!(symbols.len(), 3);
        fix_kernel_symbol_len(&mut symbols);
        assert_eq!(symbols[0].len, 0x40);
        assert_eq!(symbols[1].len, 0xb0);
        assert_eq!(symbols[2].addr + symbols[2].len, u64::MAX);
    }

    #[test]
    fn kernel_dso_uses_configured_kallsyms() {
        let config = SymbolConfig {
            kallsyms: Some("ffffffc000080000 T _text\nffffffc000081000 T do_idle\n".into()),
            ..Default::default()
        };
        let dso = Dso::new(DsoType::Kernel, 0, DEFAULT_KERNEL_MMAP_NAME, Rc::new(config));
        let symbol = dso.find_symbol(0xffffffc000081234).unwrap();
        assert_eq!(symbol.name, "do_idle");
        assert_eq!(dso.ip_to_vaddr_in_file(0xffffffc000081234, 0, 0), 0xffffffc000081234);
    }

    #[test]
    fn symbol_map_parsing() {
        let contents = "\
0x2000 0x20 java_method_one
3000 40 java_method_two
garbage line
";
        let symbols = parse_symbol_map(contents);
        assert_eq!(symbols.len(), 2);
        assert_eq!(symbols[0].addr, 0x2000);
        assert_eq!(symbols[1].name, "java_method_two");
    }

    #[test]
    fn demangling_cascade() {
        assert_eq!(
            demangle("_ZN3art7Runtime4InitEv").as_deref(),
            Some("art::Runtime::Init()")
        );
        assert!(demangle("plain_c_symbol").is_none());
    }

    #[test]
    fn synthesized_symbols_are_interned_and_named_by_address() {
        let dso = elf_dso(SymbolConfig::default());
        dso.set_symbols(Vec::new());
        let a = dso.synthesize_symbol(0x1234);
        let b = dso.synthesize_symbol(0x1234);
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(a.name, "libfoo.so[+1234]");
        let c = dso.synthesize_symbol(0x9999);
        assert_ne!(a.name, c.name);
    }

    #[test]
    fn pinned_build_id_without_in_band_symbols_loads_empty() {
        let mut build_id_map = HashMap::new();
        build_id_map.insert("/system/lib64/libfoo.so".to_string(), vec![0xaa; 20]);
        let dso = elf_dso(SymbolConfig {
            build_id_map,
            ..Default::default()
        });
        assert!(dso.find_symbol(0x100).is_none());
    }
}
