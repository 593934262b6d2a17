//! Lazily-loaded symbol tables for the binaries mapped into profiled
//! processes.
//!
//! A [`Dso`] is one of five variants (kernel, kernel module, ELF file, DEX
//! file, unknown), created per unique path and shared by every mapping of
//! that path via `Rc`. Symbols load on the first address lookup, so
//! binaries never touched by a sample cost nothing.
//!
//! Configuration the whole run shares (demangling, kernel symbol sources,
//! expected build ids, the debug-file finder, the name pool) lives in
//! [`DsoEnv`], a context value threaded through the API instead of process
//! globals. It is dropped with its last holder, which frees the interned
//! names once no Dso remains.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use log::{debug, log, warn, Level};

use crate::binary::{dex, elf, kallsyms};
use crate::debug_file::DebugFileFinder;
use crate::domain::{BinaryError, BuildId, DsoType};
use crate::symbols::{merge_symbols, sort_and_fix_symbols, NamePool, Symbol};

/// Prefix the Android dynamic linker puts on its own symbols.
const LINKER_PREFIX: &str = "__dl_";

/// Shared configuration and allocation context for all Dsos of one run.
pub struct DsoEnv {
    demangle: Cell<bool>,
    vmlinux: RefCell<Option<String>>,
    kallsyms: RefCell<Option<String>>,
    read_kernel_symbols_from_proc: Cell<bool>,
    build_id_map: RefCell<HashMap<String, BuildId>>,
    finder: RefCell<DebugFileFinder>,
    dump_id_counter: Cell<u32>,
    names: NamePool,
}

impl Default for DsoEnv {
    fn default() -> Self {
        Self {
            demangle: Cell::new(true),
            vmlinux: RefCell::new(None),
            kallsyms: RefCell::new(None),
            read_kernel_symbols_from_proc: Cell::new(false),
            build_id_map: RefCell::new(HashMap::new()),
            finder: RefCell::new(DebugFileFinder::default()),
            dump_id_counter: Cell::new(0),
            names: NamePool::default(),
        }
    }
}

impl DsoEnv {
    #[must_use]
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn set_demangle(&self, demangle: bool) {
        self.demangle.set(demangle);
    }

    /// Use this vmlinux image for kernel symbols instead of kallsyms.
    pub fn set_vmlinux(&self, vmlinux: &str) {
        *self.vmlinux.borrow_mut() = Some(vmlinux.to_string());
    }

    /// Cache kallsyms text (e.g. captured on the profiled device).
    pub fn set_kallsyms(&self, kallsyms: String) {
        *self.kallsyms.borrow_mut() = Some(kallsyms);
    }

    /// Allow falling back to this machine's `/proc/kallsyms` even without a
    /// kernel build-id match.
    pub fn set_read_kernel_symbols_from_proc(&self, enabled: bool) {
        self.read_kernel_symbols_from_proc.set(enabled);
    }

    /// Install the dso path → expected build id table from the recording.
    pub fn set_build_ids(&self, build_ids: impl IntoIterator<Item = (String, BuildId)>) {
        let map: HashMap<String, BuildId> = build_ids.into_iter().collect();
        for (path, build_id) in &map {
            debug!("build_id_map: {path}, {build_id}");
        }
        *self.build_id_map.borrow_mut() = map;
    }

    /// The build id recorded for `path`, or the empty id.
    #[must_use]
    pub fn expected_build_id_for_path(&self, path: &str) -> BuildId {
        self.build_id_map
            .borrow()
            .get(path)
            .copied()
            .unwrap_or_default()
    }

    /// See [`DebugFileFinder::set_symfs_dir`].
    pub fn set_symfs_dir(&self, dir: &str) -> anyhow::Result<()> {
        self.finder.borrow_mut().set_symfs_dir(dir)
    }

    /// See [`DebugFileFinder::set_vdso_file`].
    pub fn set_vdso_file(&self, vdso_file: &str, is_64bit: bool) {
        self.finder.borrow_mut().set_vdso_file(vdso_file, is_64bit);
    }

    /// Demangle `name` if demangling is enabled.
    ///
    /// Names carrying the dynamic linker prefix are demangled without it
    /// and rendered as `[linker]<demangled>`. Undecodable names are
    /// returned unchanged.
    #[must_use]
    pub fn demangle(&self, name: &str) -> String {
        if !self.demangle.get() {
            return name.to_string();
        }
        let (is_linker_symbol, mangled) = match name.strip_prefix(LINKER_PREFIX) {
            Some(rest) => (true, rest),
            None => (false, name),
        };
        match (demangle_name(mangled), is_linker_symbol) {
            (Some(demangled), true) => format!("[linker]{demangled}"),
            (None, true) => format!("[linker]{mangled}"),
            (Some(demangled), false) => demangled,
            (None, false) => name.to_string(),
        }
    }

    pub(crate) fn intern(&self, name: &str) -> Rc<str> {
        self.names.intern(name)
    }

    fn next_dump_id(&self) -> u32 {
        let id = self.dump_id_counter.get();
        self.dump_id_counter.set(id + 1);
        id
    }
}

/// Try Rust demangling first, then Itanium C++.
fn demangle_name(mangled: &str) -> Option<String> {
    if let Ok(demangled) = rustc_demangle::try_demangle(mangled) {
        return Some(format!("{demangled:#}"));
    }
    let symbol = cpp_demangle::Symbol::new(mangled).ok()?;
    symbol
        .demangle(&cpp_demangle::DemangleOptions::default())
        .ok()
}

/// Per-variant state. The ELF variant owns the DEX state it grows when a
/// mapping turns out to host bytecode.
enum DsoKind {
    Kernel,
    KernelModule,
    Elf {
        /// Lazily read; `Some(0)` is also the cached failure value.
        min_vaddr: Option<u64>,
        /// Present once the dso was reclassified as DEX.
        dex: Option<DexState>,
    },
    Dex(DexState),
    Unknown,
}

#[derive(Default)]
struct DexState {
    file_offsets: Vec<u64>,
}

/// A lazily-loaded symbol table for one binary.
pub struct Dso {
    env: Rc<DsoEnv>,
    path: String,
    file_name: String,
    debug_file_path: String,
    kind: RefCell<DsoKind>,
    symbols: RefCell<Vec<Symbol>>,
    unknown_symbols: RefCell<HashMap<u64, Symbol>>,
    is_loaded: Cell<bool>,
    dump_id: Cell<Option<u32>>,
    symbol_dump_id: Cell<u32>,
}

/// Construct a Dso of the requested type.
///
/// For ELF files the debug file is resolved immediately through the env's
/// [`DebugFileFinder`]; everything else reads symbols from the recorded
/// path itself.
#[must_use]
pub fn create_dso(env: &Rc<DsoEnv>, dso_type: DsoType, path: &str, force_64bit: bool) -> Rc<Dso> {
    let (kind, debug_file_path) = match dso_type {
        DsoType::ElfFile => {
            let build_id = env.expected_build_id_for_path(path);
            let debug_file_path = env
                .finder
                .borrow()
                .find_debug_file(path, force_64bit, &build_id);
            (
                DsoKind::Elf {
                    min_vaddr: None,
                    dex: None,
                },
                debug_file_path,
            )
        }
        DsoType::Kernel => (DsoKind::Kernel, path.to_string()),
        DsoType::KernelModule => (DsoKind::KernelModule, path.to_string()),
        DsoType::DexFile => (DsoKind::Dex(DexState::default()), path.to_string()),
        DsoType::Unknown => (DsoKind::Unknown, path.to_string()),
    };
    let file_name = path
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(path)
        .to_string();
    Rc::new(Dso {
        env: Rc::clone(env),
        path: path.to_string(),
        file_name,
        debug_file_path,
        kind: RefCell::new(kind),
        symbols: RefCell::new(Vec::new()),
        unknown_symbols: RefCell::new(HashMap::new()),
        is_loaded: Cell::new(false),
        dump_id: Cell::new(None),
        symbol_dump_id: Cell::new(0),
    })
}

impl Dso {
    /// The path the recording used for this binary.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Final path component of [`Self::path`].
    #[must_use]
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// The file symbols are read from (may differ from `path` for ELF).
    #[must_use]
    pub fn debug_file_path(&self) -> &str {
        &self.debug_file_path
    }

    /// The current variant. An ELF dso that received dex file offsets
    /// reports [`DsoType::DexFile`].
    #[must_use]
    pub fn dso_type(&self) -> DsoType {
        match &*self.kind.borrow() {
            DsoKind::Kernel => DsoType::Kernel,
            DsoKind::KernelModule => DsoType::KernelModule,
            DsoKind::Elf { dex: Some(_), .. } | DsoKind::Dex(_) => DsoType::DexFile,
            DsoKind::Elf { dex: None, .. } => DsoType::ElfFile,
            DsoKind::Unknown => DsoType::Unknown,
        }
    }

    /// The build id the recording expects for this dso path.
    #[must_use]
    pub fn expected_build_id(&self) -> BuildId {
        self.env.expected_build_id_for_path(&self.path)
    }

    /// Lowest executable vaddr of the ELF image, read lazily. Zero for
    /// every other variant and on read failure.
    #[must_use]
    pub fn min_vaddr(&self) -> u64 {
        let mut kind = self.kind.borrow_mut();
        let DsoKind::Elf { min_vaddr, dex } = &mut *kind else {
            return 0;
        };
        if let Some(v) = *min_vaddr {
            return v;
        }
        let mut vaddr = 0;
        if dex.is_none() {
            let build_id = self.env.expected_build_id_for_path(&self.path);
            match elf::read_min_executable_vaddr(&self.debug_file_path, &build_id) {
                Ok(v) => vaddr = v,
                Err(e) => {
                    warn!(
                        "failed to read min virtual address of {}: {e}",
                        self.debug_file_path
                    );
                }
            }
        }
        *min_vaddr = Some(vaddr);
        vaddr
    }

    /// Install the min vaddr recorded in the profile's file feature,
    /// saving the lazy read.
    pub fn set_min_vaddr(&self, vaddr: u64) {
        if let DsoKind::Elf { min_vaddr, .. } = &mut *self.kind.borrow_mut() {
            *min_vaddr = Some(vaddr);
        }
    }

    /// Register a DEX image at `offset` inside this file.
    ///
    /// On an ELF dso this switches the variant to DEX: mmap records are
    /// processed before the dex file list is known, so a mapping created as
    /// ELF may turn out to host bytecode.
    pub fn add_dex_file_offset(&self, offset: u64) {
        match &mut *self.kind.borrow_mut() {
            DsoKind::Elf { dex, .. } => {
                dex.get_or_insert_with(DexState::default)
                    .file_offsets
                    .push(offset);
            }
            DsoKind::Dex(state) => state.file_offsets.push(offset),
            _ => debug!("ignored dex file offset on {}", self.path),
        }
    }

    /// The registered DEX offsets; `None` for non-DEX variants.
    #[must_use]
    pub fn dex_file_offsets(&self) -> Option<Vec<u64>> {
        match &*self.kind.borrow() {
            DsoKind::Elf { dex: Some(state), .. } | DsoKind::Dex(state) => {
                Some(state.file_offsets.clone())
            }
            _ => None,
        }
    }

    /// Find the symbol covering `vaddr`, loading the table on first use.
    #[must_use]
    pub fn find_symbol(&self, vaddr: u64) -> Option<Symbol> {
        if !self.is_loaded.get() {
            self.load();
        }
        {
            let symbols = self.symbols.borrow();
            let idx = symbols.partition_point(|s| s.addr <= vaddr);
            if idx > 0 && symbols[idx - 1].contains(vaddr) {
                return Some(symbols[idx - 1].clone());
            }
        }
        self.unknown_symbols.borrow().get(&vaddr).cloned()
    }

    /// Pre-populate symbols (from the recording's file feature). A later
    /// lazy load merges into these.
    pub(crate) fn set_symbols(&self, mut symbols: Vec<Symbol>) {
        sort_and_fix_symbols(&mut symbols);
        *self.symbols.borrow_mut() = symbols;
    }

    /// Record a synthetic symbol for an address nothing covers.
    pub fn add_unknown_symbol(&self, vaddr: u64, name: &str) {
        self.unknown_symbols
            .borrow_mut()
            .insert(vaddr, Symbol::new(self.env.intern(name), vaddr, 1));
    }

    #[must_use]
    pub fn has_dump_id(&self) -> bool {
        self.dump_id.get().is_some()
    }

    /// Assign this dso the next run-wide dump id. Call at most once.
    pub fn create_dump_id(&self) -> u32 {
        assert!(!self.has_dump_id(), "dump id assigned twice for {}", self.path);
        let id = self.env.next_dump_id();
        self.dump_id.set(Some(id));
        id
    }

    /// Assign `symbol` the next dump id within this dso. Call at most once
    /// per symbol.
    pub fn create_symbol_dump_id(&self, symbol: &Symbol) -> u32 {
        assert!(!symbol.has_dump_id(), "dump id assigned twice for symbol");
        let id = self.symbol_dump_id.get();
        self.symbol_dump_id.set(id + 1);
        symbol.set_dump_id(id);
        id
    }

    fn load(&self) {
        self.is_loaded.set(true);
        let loaded = self.load_symbols();
        let mut symbols = self.symbols.borrow_mut();
        if symbols.is_empty() {
            *symbols = loaded;
        } else if !loaded.is_empty() {
            let existing = std::mem::take(&mut *symbols);
            *symbols = merge_symbols(existing, loaded);
        }
    }

    /// Failed loads warn only when no symbols arrived with the recording;
    /// otherwise the on-disk file is a nice-to-have.
    fn load_failure_level(&self) -> Level {
        if self.symbols.borrow().is_empty() {
            Level::Warn
        } else {
            Level::Debug
        }
    }

    fn report_elf_result(&self, result: Result<(), BinaryError>, debug_file_path: &str) {
        match result {
            Ok(()) => debug!("read symbols from {debug_file_path} successfully"),
            Err(BinaryError::NoSymbolTable(_)) => {
                // The vdso only carries a dynamic symbol table; that is not
                // worth a warning.
                if self.path != "[vdso]" {
                    log!(
                        self.load_failure_level(),
                        "{debug_file_path} doesn't contain symbol table"
                    );
                }
            }
            Err(e) => log!(
                self.load_failure_level(),
                "failed to read symbols from {debug_file_path}: {e}"
            ),
        }
    }

    fn load_symbols(&self) -> Vec<Symbol> {
        let kind = self.kind.borrow();
        let mut symbols = match &*kind {
            DsoKind::Elf { dex: Some(state), .. } => self.load_dex_symbols(&state.file_offsets),
            DsoKind::Dex(state) => self.load_dex_symbols(&state.file_offsets),
            DsoKind::Elf { dex: None, .. } => self.load_elf_symbols(),
            DsoKind::Kernel => self.load_kernel_symbols(),
            DsoKind::KernelModule => self.load_kernel_module_symbols(),
            DsoKind::Unknown => Vec::new(),
        };
        drop(kind);
        sort_and_fix_symbols(&mut symbols);
        if matches!(&*self.kind.borrow(), DsoKind::Kernel) {
            // Let the last kernel symbol cover the rest of kernel space.
            if let Some(last) = symbols.last_mut() {
                last.len = u64::MAX - last.addr;
            }
        }
        symbols
    }

    fn load_elf_symbols(&self) -> Vec<Symbol> {
        let build_id = self.expected_build_id();
        let mut symbols = Vec::new();
        let result = elf::parse_symbols(&self.debug_file_path, &build_id, |sym| {
            if sym.is_func || (sym.is_label && sym.is_in_text_section) {
                symbols.push(Symbol::new(self.env.intern(&sym.name), sym.vaddr, sym.len));
            }
        });
        self.report_elf_result(result, &self.debug_file_path);
        symbols
    }

    fn load_kernel_module_symbols(&self) -> Vec<Symbol> {
        let build_id = self.expected_build_id();
        let mut symbols = Vec::new();
        let result = elf::parse_symbols(&self.debug_file_path, &build_id, |sym| {
            if sym.is_func || sym.is_in_text_section {
                symbols.push(Symbol::new(self.env.intern(&sym.name), sym.vaddr, sym.len));
            }
        });
        self.report_elf_result(result, &self.debug_file_path);
        symbols
    }

    fn load_kernel_symbols(&self) -> Vec<Symbol> {
        let build_id = self.expected_build_id();
        if let Some(vmlinux) = self.env.vmlinux.borrow().as_deref() {
            let mut symbols = Vec::new();
            let result = elf::parse_symbols(vmlinux, &build_id, |sym| {
                if sym.is_func {
                    symbols.push(Symbol::new(self.env.intern(&sym.name), sym.vaddr, sym.len));
                }
            });
            self.report_elf_result(result, vmlinux);
            return symbols;
        }
        if let Some(kallsyms) = self.env.kallsyms.borrow().as_deref() {
            return self.kallsyms_symbols(kallsyms);
        }
        if self.env.read_kernel_symbols_from_proc.get() || !build_id.is_empty() {
            // Only trust this machine's kallsyms when asked to, or when the
            // recorded kernel build id matches the running kernel's.
            if !build_id.is_empty() {
                match kallsyms::kernel_build_id() {
                    Some(real) if real == build_id => {}
                    _ => {
                        debug!("not reading /proc/kallsyms: kernel build id mismatch");
                        return Vec::new();
                    }
                }
            }
            match std::fs::read_to_string("/proc/kallsyms") {
                Ok(text) => return self.kallsyms_symbols(&text),
                Err(e) => debug!("failed to read /proc/kallsyms: {e}"),
            }
        }
        Vec::new()
    }

    fn kallsyms_symbols(&self, text: &str) -> Vec<Symbol> {
        let mut symbols = Vec::new();
        kallsyms::parse_kallsyms(text, |sym| {
            if matches!(sym.ty, 'T' | 't' | 'W' | 'w') && sym.addr != 0 {
                symbols.push(Symbol::new(self.env.intern(sym.name), sym.addr, 0));
            }
        });
        if symbols.is_empty() {
            warn!("no usable kallsyms entries; addresses may be zeroed by kptr_restrict");
        }
        symbols
    }

    fn load_dex_symbols(&self, offsets: &[u64]) -> Vec<Symbol> {
        // A reclassified ELF dso reads bytecode from the mapped path, not
        // the resolved debug file.
        let mut symbols = Vec::new();
        let result = dex::read_symbols(&self.path, offsets, |sym| {
            symbols.push(Symbol::new(self.env.intern(&sym.name), sym.offset, sym.len));
        });
        match result {
            Ok(()) => debug!("read dex symbols from {} successfully", self.path),
            Err(e) => log!(
                self.load_failure_level(),
                "failed to read dex symbols from {}: {e}",
                self.path
            ),
        }
        symbols
    }

    /// Translate a runtime ip inside `map` to a vaddr in this dso's file.
    pub(crate) fn ip_to_vaddr_in_file(&self, ip: u64, map_start: u64, map_pgoff: u64) -> u64 {
        match self.dso_type() {
            DsoType::Kernel => ip,
            DsoType::KernelModule | DsoType::Unknown => ip.wrapping_sub(map_start),
            DsoType::DexFile => ip.wrapping_sub(map_start).wrapping_add(map_pgoff),
            DsoType::ElfFile => ip.wrapping_sub(map_start).wrapping_add(self.min_vaddr()),
        }
    }
}
