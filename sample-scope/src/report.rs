//! The sample-iteration driver.
//!
//! [`SampleReader`] pulls records out of a [`RecordSource`], routes every
//! record through the [`ThreadTree`], and turns each sample record into an
//! enriched [`Sample`] with a resolved call chain. Under `trace_offcpu`
//! recordings, one sample per thread is held back so each emitted sample's
//! period can cover the time until that thread's next sample.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::rc::Rc;

use anyhow::{Context, Result};

use crate::domain::BuildId;
use crate::dso::DsoEnv;
use crate::frames::{filter_art_frames, CallChainEntry, Mapping, Sample, SymbolEntry};
use crate::record::{Record, RecordSource, SampleRecord};
use crate::thread_tree::{MapEntry, ThreadTree};

/// Streams enriched samples out of one recording.
pub struct SampleReader<R: RecordSource> {
    source: R,
    env: Rc<DsoEnv>,
    thread_tree: ThreadTree,
    opened: bool,
    trace_offcpu: bool,
    event_names: Vec<String>,
    /// Per-tid most recent unemitted sample, only under `trace_offcpu`.
    next_sample_cache: HashMap<u32, SampleRecord>,
    show_art_frames: bool,
}

impl<R: RecordSource> SampleReader<R> {
    #[must_use]
    pub fn new(source: R) -> Self {
        let env = DsoEnv::new();
        let thread_tree = ThreadTree::new(Rc::clone(&env));
        Self {
            source,
            env,
            thread_tree,
            opened: false,
            trace_offcpu: false,
            event_names: Vec::new(),
            next_sample_cache: HashMap::new(),
            show_art_frames: false,
        }
    }

    /// Root directory holding copies of the profiled machine's binaries.
    pub fn set_symfs_dir(&mut self, dir: &str) -> Result<()> {
        self.env.set_symfs_dir(dir)
    }

    /// Use this vmlinux image for kernel symbols.
    pub fn set_vmlinux(&mut self, vmlinux: &str) {
        self.env.set_vmlinux(vmlinux);
    }

    /// Read kallsyms text from `path` (e.g. captured on the profiled
    /// device) and cache it for kernel symbolization.
    pub fn set_kallsyms_file(&mut self, path: &str) -> Result<()> {
        let kallsyms = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read kallsyms file {path}"))?;
        self.env.set_kallsyms(kallsyms);
        Ok(())
    }

    /// Allow `/proc/kallsyms` of this machine as a kernel symbol source.
    pub fn set_read_kernel_symbols_from_proc(&mut self, enabled: bool) {
        self.env.set_read_kernel_symbols_from_proc(enabled);
    }

    /// Replace `[vdso]` lookups of the given bitness with `path`.
    pub fn set_vdso_file(&mut self, path: &str, is_64bit: bool) {
        self.env.set_vdso_file(path, is_64bit);
    }

    pub fn set_demangle(&mut self, demangle: bool) {
        self.env.set_demangle(demangle);
    }

    /// Keep ART interpreter frames instead of eliding them next to DEX
    /// frames.
    pub fn show_art_frames(&mut self, show: bool) {
        self.show_art_frames = show;
    }

    /// Resolve otherwise-unknown addresses to synthetic `file[+vaddr]`
    /// symbols.
    pub fn show_ip_for_unknown_symbol(&mut self) {
        self.thread_tree.show_ip_for_unknown_symbol();
    }

    /// The shared configuration context, for advanced setups.
    #[must_use]
    pub fn env(&self) -> &Rc<DsoEnv> {
        &self.env
    }

    /// The build id the recording expects for `path`, if any.
    pub fn build_id_for_path(&mut self, path: &str) -> Option<BuildId> {
        self.open_if_needed();
        let build_id = self.env.expected_build_id_for_path(path);
        (!build_id.is_empty()).then_some(build_id)
    }

    /// The next enriched sample, or `None` at end of stream.
    ///
    /// Non-sample records never surface here; they only advance the
    /// process view. Under `trace_offcpu` each thread's samples are
    /// emitted one behind, and the final sample per thread is withheld.
    ///
    /// # Errors
    /// Only record-source errors propagate; symbolization failures degrade
    /// individual frames to the unknown symbol.
    pub fn next_sample(&mut self) -> Result<Option<Sample>> {
        self.open_if_needed();
        let current = loop {
            let Some(record) = self.source.next_record()? else {
                return Ok(None);
            };
            self.thread_tree.update(&record);
            let Record::Sample(sample) = record else {
                continue;
            };
            if !self.trace_offcpu {
                break sample;
            }
            match self.next_sample_cache.entry(sample.tid) {
                Entry::Vacant(slot) => {
                    slot.insert(sample);
                }
                Entry::Occupied(mut slot) => {
                    break std::mem::replace(slot.get_mut(), sample);
                }
            }
        };
        Ok(Some(self.enrich_sample(&current)))
    }

    fn open_if_needed(&mut self) {
        if self.opened {
            return;
        }
        self.opened = true;
        self.env.set_build_ids(self.source.build_ids().to_vec());
        for feature in self.source.file_features() {
            self.thread_tree.add_dso_info(feature);
        }
        self.event_names = self.source.attr_names().to_vec();
        self.trace_offcpu = self.source.meta_info("trace_offcpu") == Some("true");
    }

    fn enrich_sample(&mut self, record: &SampleRecord) -> Sample {
        let thread = self.thread_tree.find_thread_or_new(record.pid, record.tid);
        let period = if self.trace_offcpu {
            // Off-CPU weight: time until this thread's next sample,
            // clamped to stay positive.
            let next_time = self
                .next_sample_cache
                .get(&record.tid)
                .map_or(record.time + 1, |next| next.time.max(record.time + 1));
            next_time - record.time
        } else {
            record.period
        };

        let (ips, kernel_ip_count) = record.call_chain();
        let ip_maps: Vec<(u64, Rc<MapEntry>)> = ips
            .iter()
            .enumerate()
            .map(|(i, &ip)| (ip, self.thread_tree.find_map(&thread, ip, i < kernel_ip_count)))
            .collect();

        let mut entries: Vec<CallChainEntry> = filter_art_frames(ip_maps, self.show_art_frames)
            .into_iter()
            .map(|(ip, map)| self.resolve_entry(ip, &map))
            .collect();
        // Filtering keeps at least the DEX frame that triggered it, so the
        // chain can only be empty if the raw chain was.
        let leading = if entries.is_empty() {
            let map = self.thread_tree.find_map(&thread, record.ip, record.in_kernel);
            self.resolve_entry(record.ip, &map)
        } else {
            entries.remove(0)
        };

        // For trace-offcpu recordings every sample reports the first event;
        // the sched-switch attr that drove them is an implementation detail.
        let attr_index = if self.trace_offcpu { 0 } else { record.attr_index };
        let event_name = self.event_names.get(attr_index).cloned().unwrap_or_default();

        Sample {
            ip: leading.ip,
            pid: record.pid,
            tid: record.tid,
            thread_comm: thread.comm.to_string(),
            time: record.time,
            in_kernel: record.in_kernel,
            cpu: record.cpu,
            period,
            event_name,
            symbol: leading.symbol,
            call_chain: entries,
        }
    }

    fn resolve_entry(&self, ip: u64, map: &Rc<MapEntry>) -> CallChainEntry {
        let (symbol, vaddr_in_file) = self.thread_tree.find_symbol(map, ip);
        CallChainEntry {
            ip,
            symbol: SymbolEntry {
                dso_name: map.dso.path().to_string(),
                vaddr_in_file,
                symbol_name: symbol.demangled_name(&self.env).to_string(),
                symbol_addr: symbol.addr,
                symbol_len: symbol.len,
                mapping: Mapping {
                    start: map.start_addr,
                    end: map.end_addr(),
                    pgoff: map.pgoff,
                },
            },
        }
    }
}
