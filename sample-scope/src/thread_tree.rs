//! The per-process view of threads and address-space mappings over time.
//!
//! Fork, comm, and mmap records stream through [`ThreadTree::update`],
//! maintaining for every thread the set of mappings covering its address
//! space. Sample enrichment then asks which mapping covered an ip and which
//! symbol covers the translated file vaddr. Lookups never fail: a sentinel
//! "unknown" mapping and symbol stand in when nothing matches.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use crate::domain::DsoType;
use crate::dso::{create_dso, Dso, DsoEnv};
use crate::record::{FileFeature, MmapRecord, Record};
use crate::symbols::Symbol;

const DEFAULT_KERNEL_MMAP_NAME: &str = "[kernel.kallsyms]";
const UNKNOWN_DSO_PATH: &str = "unknown";

/// One virtual-address range inside a process.
pub struct MapEntry {
    pub start_addr: u64,
    pub len: u64,
    pub pgoff: u64,
    /// Timestamp of the mmap record that installed this entry.
    pub time: u64,
    pub dso: Rc<Dso>,
}

impl MapEntry {
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr.wrapping_sub(self.start_addr) < self.len
    }

    #[must_use]
    pub fn end_addr(&self) -> u64 {
        self.start_addr.saturating_add(self.len)
    }
}

/// Mappings of one process, keyed by start address. Inserting a map evicts
/// or splits whatever it overlaps, so the set always describes the current
/// state.
#[derive(Default, Clone)]
struct MapSet {
    entries: BTreeMap<u64, Rc<MapEntry>>,
}

impl MapSet {
    fn insert(&mut self, map: Rc<MapEntry>) {
        self.fix_overlaps(&map);
        self.entries.insert(map.start_addr, map);
    }

    fn fix_overlaps(&mut self, map: &MapEntry) {
        let overlapped: Vec<u64> = self
            .entries
            .range(..map.end_addr())
            .filter(|(_, old)| old.end_addr() > map.start_addr)
            .map(|(&start, _)| start)
            .collect();
        for start in overlapped {
            let old = self.entries.remove(&start).expect("key seen in range scan");
            if old.start_addr < map.start_addr {
                self.entries.insert(
                    old.start_addr,
                    Rc::new(MapEntry {
                        start_addr: old.start_addr,
                        len: map.start_addr - old.start_addr,
                        pgoff: old.pgoff,
                        time: old.time,
                        dso: Rc::clone(&old.dso),
                    }),
                );
            }
            if old.end_addr() > map.end_addr() {
                self.entries.insert(
                    map.end_addr(),
                    Rc::new(MapEntry {
                        start_addr: map.end_addr(),
                        len: old.end_addr() - map.end_addr(),
                        pgoff: old.pgoff + (map.end_addr() - old.start_addr),
                        time: old.time,
                        dso: Rc::clone(&old.dso),
                    }),
                );
            }
        }
    }

    fn find(&self, addr: u64) -> Option<Rc<MapEntry>> {
        self.entries
            .range(..=addr)
            .next_back()
            .map(|(_, map)| Rc::clone(map))
            .filter(|map| map.contains(addr))
    }
}

/// One thread of one process. Cheap to clone; all threads of a process
/// share one map set.
#[derive(Clone)]
pub struct ThreadEntry {
    pub pid: u32,
    pub tid: u32,
    pub comm: Rc<str>,
    maps: Rc<RefCell<MapSet>>,
}

/// The process/thread/mapping state machine.
pub struct ThreadTree {
    env: Rc<DsoEnv>,
    /// Threads by tid.
    threads: HashMap<u32, ThreadEntry>,
    /// Shared map sets by pid.
    process_maps: HashMap<u32, Rc<RefCell<MapSet>>>,
    kernel_maps: MapSet,
    kernel_dso: Option<Rc<Dso>>,
    module_dsos: HashMap<String, Rc<Dso>>,
    user_dsos: HashMap<String, Rc<Dso>>,
    unknown_dso: Rc<Dso>,
    unknown_map: Rc<MapEntry>,
    unknown_symbol: Symbol,
    show_ip_for_unknown_symbol: bool,
}

impl ThreadTree {
    #[must_use]
    pub fn new(env: Rc<DsoEnv>) -> Self {
        let unknown_dso = create_dso(&env, DsoType::Unknown, UNKNOWN_DSO_PATH, false);
        let unknown_map = Rc::new(MapEntry {
            start_addr: 0,
            len: 0,
            pgoff: 0,
            time: 0,
            dso: Rc::clone(&unknown_dso),
        });
        let unknown_symbol = Symbol::new(env.intern("unknown"), 0, 0);
        Self {
            env,
            threads: HashMap::new(),
            process_maps: HashMap::new(),
            kernel_maps: MapSet::default(),
            kernel_dso: None,
            module_dsos: HashMap::new(),
            user_dsos: HashMap::new(),
            unknown_dso,
            unknown_map,
            unknown_symbol,
            show_ip_for_unknown_symbol: false,
        }
    }

    /// Failed symbol lookups synthesize a `file[+vaddr]` symbol instead of
    /// the shared "unknown" sentinel.
    pub fn show_ip_for_unknown_symbol(&mut self) {
        self.show_ip_for_unknown_symbol = true;
    }

    /// Apply one record to the process view. Sample records and unknown
    /// record types are no-ops here.
    pub fn update(&mut self, record: &Record) {
        match record {
            Record::Mmap(mmap) => self.add_map(mmap),
            Record::Comm(comm) => {
                self.find_thread_or_new(comm.pid, comm.tid);
                let interned = self.env.intern(&comm.comm);
                if let Some(thread) = self.threads.get_mut(&comm.tid) {
                    thread.comm = interned;
                }
            }
            Record::Fork(fork) => self.fork_thread(fork.pid, fork.tid, fork.ppid, fork.ptid),
            Record::Sample(_) | Record::Other => {}
        }
    }

    pub fn find_thread_or_new(&mut self, pid: u32, tid: u32) -> ThreadEntry {
        match self.threads.get(&tid) {
            Some(thread) if thread.pid == pid => thread.clone(),
            _ => self.create_thread(pid, tid),
        }
    }

    fn create_thread(&mut self, pid: u32, tid: u32) -> ThreadEntry {
        let maps = Rc::clone(self.process_maps.entry(pid).or_default());
        let thread = ThreadEntry {
            pid,
            tid,
            comm: self.env.intern("unknown"),
            maps,
        };
        self.threads.insert(tid, thread.clone());
        thread
    }

    fn fork_thread(&mut self, pid: u32, tid: u32, ppid: u32, ptid: u32) {
        if pid == ppid && tid == ptid {
            return;
        }
        let parent = self.find_thread_or_new(ppid, ptid);
        let child = self.find_thread_or_new(pid, tid);
        if let Some(thread) = self.threads.get_mut(&tid) {
            thread.comm = Rc::clone(&parent.comm);
        }
        if pid != ppid {
            // A new process starts with a copy of the parent's address
            // space; threads of one process keep sharing theirs.
            *child.maps.borrow_mut() = parent.maps.borrow().clone();
        }
    }

    fn add_map(&mut self, mmap: &MmapRecord) {
        if mmap.in_kernel {
            self.add_kernel_map(mmap);
            return;
        }
        let thread = self.find_thread_or_new(mmap.pid, mmap.tid);
        let dso = self.find_user_dso_or_new(&mmap.filename);
        thread.maps.borrow_mut().insert(Rc::new(MapEntry {
            start_addr: mmap.addr,
            len: mmap.len,
            pgoff: mmap.pgoff,
            time: mmap.time,
            dso,
        }));
    }

    fn add_kernel_map(&mut self, mmap: &MmapRecord) {
        let dso = if mmap.filename.starts_with(DEFAULT_KERNEL_MMAP_NAME) {
            self.kernel_dso_or_new()
        } else {
            self.module_dso_or_new(&mmap.filename)
        };
        self.kernel_maps.insert(Rc::new(MapEntry {
            start_addr: mmap.addr,
            len: mmap.len,
            pgoff: mmap.pgoff,
            time: mmap.time,
            dso,
        }));
    }

    fn kernel_dso_or_new(&mut self) -> Rc<Dso> {
        if let Some(dso) = &self.kernel_dso {
            return Rc::clone(dso);
        }
        let dso = create_dso(
            &self.env,
            DsoType::Kernel,
            DEFAULT_KERNEL_MMAP_NAME,
            false,
        );
        self.kernel_dso = Some(Rc::clone(&dso));
        dso
    }

    fn module_dso_or_new(&mut self, path: &str) -> Rc<Dso> {
        if let Some(dso) = self.module_dsos.get(path) {
            return Rc::clone(dso);
        }
        let dso = create_dso(&self.env, DsoType::KernelModule, path, false);
        self.module_dsos.insert(path.to_string(), Rc::clone(&dso));
        dso
    }

    fn find_user_dso_or_new(&mut self, filename: &str) -> Rc<Dso> {
        if filename == UNKNOWN_DSO_PATH {
            return Rc::clone(&self.unknown_dso);
        }
        if let Some(dso) = self.user_dsos.get(filename) {
            return Rc::clone(dso);
        }
        let dso_type = if is_unsymbolizable_name(filename) {
            DsoType::Unknown
        } else {
            DsoType::ElfFile
        };
        let dso = create_dso(&self.env, dso_type, filename, false);
        self.user_dsos.insert(filename.to_string(), Rc::clone(&dso));
        dso
    }

    /// The mapping covering `ip` in `thread` (or kernel space), falling
    /// back to the unknown sentinel.
    #[must_use]
    pub fn find_map(&self, thread: &ThreadEntry, ip: u64, in_kernel: bool) -> Rc<MapEntry> {
        let found = if in_kernel {
            self.kernel_maps.find(ip)
        } else {
            thread.maps.borrow().find(ip)
        };
        found.unwrap_or_else(|| Rc::clone(&self.unknown_map))
    }

    /// Resolve `ip` inside `map` to a symbol and the vaddr it has in the
    /// backing file. Never fails; unresolvable addresses yield the
    /// "unknown" symbol (or a synthesized per-address one, see
    /// [`Self::show_ip_for_unknown_symbol`]).
    #[must_use]
    pub fn find_symbol(&self, map: &MapEntry, ip: u64) -> (Symbol, u64) {
        let vaddr_in_file = map.dso.ip_to_vaddr_in_file(ip, map.start_addr, map.pgoff);
        if let Some(symbol) = map.dso.find_symbol(vaddr_in_file) {
            return (symbol, vaddr_in_file);
        }
        if self.show_ip_for_unknown_symbol {
            let name = format!("{}[+{vaddr_in_file:x}]", map.dso.file_name());
            map.dso.add_unknown_symbol(vaddr_in_file, &name);
            if let Some(symbol) = map.dso.find_symbol(vaddr_in_file) {
                return (symbol, vaddr_in_file);
            }
        }
        (self.unknown_symbol.clone(), vaddr_in_file)
    }

    /// Apply one entry of the recording's file feature: locate or create
    /// the dso and install its recorded min vaddr, symbols, and dex
    /// offsets.
    pub(crate) fn add_dso_info(&mut self, feature: &FileFeature) {
        let dso = match feature.dso_type {
            DsoType::Kernel => self.kernel_dso_or_new(),
            DsoType::KernelModule => self.module_dso_or_new(&feature.path),
            _ => self.find_user_dso_or_new(&feature.path),
        };
        dso.set_min_vaddr(feature.min_vaddr);
        if !feature.symbols.is_empty() {
            let symbols = feature
                .symbols
                .iter()
                .map(|s| Symbol::new(self.env.intern(&s.name), s.addr, s.len))
                .collect();
            dso.set_symbols(symbols);
        }
        for &offset in &feature.dex_file_offsets {
            dso.add_dex_file_offset(offset);
        }
    }
}

/// Pseudo-mappings that never resolve to a file on disk. `[vdso]` is the
/// exception: it is a real ELF image and has per-bitness overrides.
fn is_unsymbolizable_name(filename: &str) -> bool {
    filename.is_empty()
        || filename == "//anon"
        || (filename.starts_with('[') && filename != "[vdso]")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DsoType;
    use crate::record::{CommRecord, ForkRecord};

    fn mmap(pid: u32, addr: u64, len: u64, pgoff: u64, filename: &str) -> Record {
        Record::Mmap(MmapRecord {
            in_kernel: false,
            pid,
            tid: pid,
            addr,
            len,
            pgoff,
            filename: filename.to_string(),
            time: 0,
        })
    }

    fn tree() -> ThreadTree {
        ThreadTree::new(DsoEnv::new())
    }

    #[test]
    fn maps_resolve_by_address() {
        let mut tree = tree();
        tree.update(&mmap(10, 0x1000, 0x1000, 0, "/bin/a"));
        tree.update(&mmap(10, 0x3000, 0x1000, 0, "/bin/b"));
        let thread = tree.find_thread_or_new(10, 10);
        assert_eq!(tree.find_map(&thread, 0x1800, false).dso.path(), "/bin/a");
        assert_eq!(tree.find_map(&thread, 0x3000, false).dso.path(), "/bin/b");
        // A hole resolves to the unknown sentinel.
        assert_eq!(
            tree.find_map(&thread, 0x2500, false).dso.path(),
            UNKNOWN_DSO_PATH
        );
    }

    #[test]
    fn overlapping_map_splits_the_old_one() {
        let mut tree = tree();
        tree.update(&mmap(10, 0x1000, 0x3000, 0, "/bin/big"));
        tree.update(&mmap(10, 0x2000, 0x1000, 0, "/bin/small"));
        let thread = tree.find_thread_or_new(10, 10);
        assert_eq!(tree.find_map(&thread, 0x1800, false).dso.path(), "/bin/big");
        assert_eq!(
            tree.find_map(&thread, 0x2800, false).dso.path(),
            "/bin/small"
        );
        let right = tree.find_map(&thread, 0x3800, false);
        assert_eq!(right.dso.path(), "/bin/big");
        // The right piece keeps its file offset consistent.
        assert_eq!(right.pgoff, 0x2000);
        assert_eq!(right.start_addr, 0x3000);
    }

    #[test]
    fn threads_of_one_process_share_maps() {
        let mut tree = tree();
        tree.update(&Record::Fork(ForkRecord {
            pid: 10,
            tid: 11,
            ppid: 10,
            ptid: 10,
        }));
        tree.update(&mmap(10, 0x1000, 0x1000, 0, "/bin/a"));
        let sibling = tree.find_thread_or_new(10, 11);
        assert_eq!(tree.find_map(&sibling, 0x1400, false).dso.path(), "/bin/a");
    }

    #[test]
    fn forked_process_copies_maps() {
        let mut tree = tree();
        tree.update(&mmap(10, 0x1000, 0x1000, 0, "/bin/a"));
        tree.update(&Record::Comm(CommRecord {
            pid: 10,
            tid: 10,
            comm: "parent".to_string(),
        }));
        tree.update(&Record::Fork(ForkRecord {
            pid: 20,
            tid: 20,
            ppid: 10,
            ptid: 10,
        }));
        let child = tree.find_thread_or_new(20, 20);
        assert_eq!(&*child.comm, "parent");
        assert_eq!(tree.find_map(&child, 0x1400, false).dso.path(), "/bin/a");
        // The copy is independent of the parent's later mmaps.
        tree.update(&mmap(10, 0x5000, 0x1000, 0, "/bin/late"));
        let child = tree.find_thread_or_new(20, 20);
        assert_eq!(
            tree.find_map(&child, 0x5400, false).dso.path(),
            UNKNOWN_DSO_PATH
        );
    }

    #[test]
    fn bracketed_names_become_unknown_dsos() {
        let mut tree = tree();
        tree.update(&mmap(10, 0x1000, 0x1000, 0, "[heap]"));
        tree.update(&mmap(10, 0x2000, 0x1000, 0, "[vdso]"));
        let thread = tree.find_thread_or_new(10, 10);
        assert_eq!(
            tree.find_map(&thread, 0x1400, false).dso.dso_type(),
            DsoType::Unknown
        );
        assert_eq!(
            tree.find_map(&thread, 0x2400, false).dso.dso_type(),
            DsoType::ElfFile
        );
    }

    #[test]
    fn kernel_maps_are_separate() {
        let mut tree = tree();
        tree.update(&Record::Mmap(MmapRecord {
            in_kernel: true,
            pid: u32::MAX,
            tid: u32::MAX,
            addr: 0xffff_8000_0000_0000,
            len: 0x10_0000,
            pgoff: 0,
            filename: "[kernel.kallsyms]_text".to_string(),
            time: 0,
        }));
        let thread = tree.find_thread_or_new(10, 10);
        let map = tree.find_map(&thread, 0xffff_8000_0000_1234, true);
        assert_eq!(map.dso.dso_type(), DsoType::Kernel);
        // User-space lookup ignores kernel maps.
        assert_eq!(
            tree.find_map(&thread, 0xffff_8000_0000_1234, false).dso.path(),
            UNKNOWN_DSO_PATH
        );
    }

    #[test]
    fn unknown_symbol_sentinel_and_show_ip_mode() {
        let mut tree = tree();
        tree.update(&mmap(10, 0x1000, 0x1000, 0, "[anon:scratch]"));
        let thread = tree.find_thread_or_new(10, 10);
        let map = tree.find_map(&thread, 0x1400, false);
        let (symbol, vaddr) = tree.find_symbol(&map, 0x1400);
        assert_eq!(symbol.name(), "unknown");
        assert_eq!(vaddr, 0x400);

        tree.show_ip_for_unknown_symbol();
        let (symbol, _) = tree.find_symbol(&map, 0x1400);
        assert_eq!(symbol.name(), "[anon:scratch][+400]");
    }

    #[test]
    fn comm_updates_apply_to_later_lookups() {
        let mut tree = tree();
        tree.update(&Record::Comm(CommRecord {
            pid: 10,
            tid: 10,
            comm: "worker".to_string(),
        }));
        assert_eq!(&*tree.find_thread_or_new(10, 10).comm, "worker");
    }
}
