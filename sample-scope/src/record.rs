//! The decoded record stream the engine consumes.
//!
//! The on-disk `perf.data` reader is an external collaborator; this module
//! pins down the contract the engine needs from it: the feature sections
//! consumed once at open (build ids, per-file symbol dumps, attr names,
//! meta info) and the per-record payloads that drive the process view.

use anyhow::Result;

use crate::domain::{BuildId, DsoType};

// perf call chains interleave context markers with real ips; anything at or
// above PERF_CONTEXT_MAX is a marker.
pub const PERF_CONTEXT_KERNEL: u64 = (-128i64) as u64;
pub const PERF_CONTEXT_USER: u64 = (-512i64) as u64;
pub const PERF_CONTEXT_MAX: u64 = (-4095i64) as u64;

/// A new mapping in a process (or in kernel space).
#[derive(Debug, Clone)]
pub struct MmapRecord {
    pub in_kernel: bool,
    pub pid: u32,
    pub tid: u32,
    pub addr: u64,
    pub len: u64,
    pub pgoff: u64,
    pub filename: String,
    pub time: u64,
}

/// A thread renamed itself (or was first observed).
#[derive(Debug, Clone)]
pub struct CommRecord {
    pub pid: u32,
    pub tid: u32,
    pub comm: String,
}

/// A new process or thread was created.
#[derive(Debug, Clone)]
pub struct ForkRecord {
    pub pid: u32,
    pub tid: u32,
    pub ppid: u32,
    pub ptid: u32,
}

/// One PC sample with its raw call chain.
#[derive(Debug, Clone)]
pub struct SampleRecord {
    pub ip: u64,
    pub pid: u32,
    pub tid: u32,
    pub time: u64,
    pub cpu: u32,
    pub period: u64,
    /// Sampled while executing kernel code.
    pub in_kernel: bool,
    /// Raw chain as recorded, including `PERF_CONTEXT_*` markers, not
    /// including `ip`.
    pub callchain: Vec<u64>,
    /// Index into [`RecordSource::attr_names`] of the event that produced
    /// this sample.
    pub attr_index: usize,
}

impl SampleRecord {
    /// The effective call chain: the sample ip followed by the recorded
    /// frames with context markers stripped. Also returns how many leading
    /// ips are kernel-space.
    #[must_use]
    pub fn call_chain(&self) -> (Vec<u64>, usize) {
        let mut ips = Vec::with_capacity(1 + self.callchain.len());
        let mut in_kernel = self.in_kernel;
        ips.push(self.ip);
        let mut kernel_ip_count = usize::from(in_kernel);
        for &ip in &self.callchain {
            if ip >= PERF_CONTEXT_MAX {
                if ip == PERF_CONTEXT_USER {
                    in_kernel = false;
                }
                continue;
            }
            ips.push(ip);
            if in_kernel {
                kernel_ip_count += 1;
            }
        }
        (ips, kernel_ip_count)
    }
}

/// One record out of the recording, decoded as far as the engine needs.
#[derive(Debug, Clone)]
pub enum Record {
    Mmap(MmapRecord),
    Comm(CommRecord),
    Fork(ForkRecord),
    Sample(SampleRecord),
    /// Any record type the engine doesn't inspect. It still participates
    /// in stream ordering.
    Other,
}

/// A symbol stored in the recording's file feature.
#[derive(Debug, Clone)]
pub struct FileSymbol {
    pub addr: u64,
    pub len: u64,
    pub name: String,
}

/// Per-dso metadata dumped into the recording so reports can run without
/// the original binaries.
#[derive(Debug, Clone)]
pub struct FileFeature {
    pub path: String,
    pub dso_type: DsoType,
    pub min_vaddr: u64,
    pub symbols: Vec<FileSymbol>,
    pub dex_file_offsets: Vec<u64>,
}

/// The contract between the engine and the record-file reader.
///
/// Feature accessors must be valid before the first
/// [`RecordSource::next_record`] call; the engine consumes them once when
/// the stream is opened.
pub trait RecordSource {
    /// The build-id feature: recorded dso path → build id.
    fn build_ids(&self) -> &[(String, BuildId)];

    /// The file feature: per-dso symbol dumps.
    fn file_features(&self) -> &[FileFeature];

    /// Event names, indexable by [`SampleRecord::attr_index`].
    fn attr_names(&self) -> &[String];

    /// Meta-info key/value lookup (`trace_offcpu`, `event_type_info`, ...).
    fn meta_info(&self, key: &str) -> Option<&str>;

    /// The next record, or `None` at end of stream. Errors abort sample
    /// iteration.
    fn next_record(&mut self) -> Result<Option<Record>>;
}
