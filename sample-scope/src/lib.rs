//! # Sample Scope - Symbolization Engine for Recorded Profiles
//!
//! Sample Scope turns a previously recorded `perf`-style profile plus a set
//! of on-disk binaries into a stream of symbolized samples. It rebuilds the
//! process/thread/mapping view the profiled machine had at each sample,
//! resolves every instruction pointer of every call chain to a demangled
//! symbol, and anchors each frame in the exact binary file it came from.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Recording (perf.data)                    │
//! │    build-id table · file feature · meta info · records       │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │ RecordSource (contract)
//!                                ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    SampleReader (report)                     │
//! │                                                              │
//! │   non-sample records ──▶ ThreadTree (process/mapping view)   │
//! │   sample records ──────▶ frame filter ──▶ symbol resolution  │
//! │                                │                 │           │
//! │                                ▼                 ▼           │
//! │                         frames policy      Dso (lazy load)   │
//! │                                             │        │       │
//! │                                  DebugFileFinder  binary::*  │
//! │                                  (symfs, build ids) (ELF/DEX │
//! │                                                     /APK/    │
//! │                                                     kallsyms)│
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`report`]: the [`SampleReader`] driving record iteration, off-CPU
//!   period computation, and sample enrichment
//! - [`thread_tree`]: processes, threads, and their mapping tables
//! - [`dso`]: lazily-loaded per-binary symbol tables (five variants:
//!   kernel, kernel module, ELF, DEX, unknown) and the shared [`DsoEnv`]
//!   configuration context
//! - [`debug_file`]: resolution of recorded dso paths to on-disk debug
//!   files through a build-id index, a symbol root, and vdso overrides
//! - [`binary`]: the format layer - ELF (via `object`), DEX containers,
//!   APK-embedded images, kallsyms text
//! - [`frames`]: ART interpreter frame elision and the emitted sample types
//! - [`record`]: the decoded record model and the [`RecordSource`]
//!   contract the record-file reader fulfils
//! - [`symbols`], [`domain`]: symbols, name interning, build ids, errors
//!
//! ## Key Concepts
//!
//! - **Build id**: a byte tag identifying one exact build of a binary;
//!   every debug-file candidate must match it before being used
//! - **DSO**: any binary mapped into a profiled process, generalized to
//!   kernel images, modules, and DEX bytecode containers
//! - **Off-CPU sample**: under `trace_offcpu`, a sample whose period is
//!   the time until the same thread's next sample
//!
//! ## Typical Usage
//!
//! ```ignore
//! let mut reader = SampleReader::new(source);
//! reader.set_symfs_dir("symbols/")?;
//! while let Some(sample) = reader.next_sample()? {
//!     println!("{} {}", sample.thread_comm, sample.symbol.symbol_name);
//! }
//! ```

pub mod binary;
pub mod debug_file;
pub mod domain;
pub mod dso;
pub mod frames;
pub mod record;
pub mod report;
pub mod symbols;
pub mod thread_tree;

pub use debug_file::DebugFileFinder;
pub use domain::{BinaryError, BuildId, DsoType};
pub use dso::{create_dso, Dso, DsoEnv};
pub use frames::{CallChainEntry, Mapping, Sample, SymbolEntry};
pub use record::{
    CommRecord, FileFeature, FileSymbol, ForkRecord, MmapRecord, Record, RecordSource,
    SampleRecord,
};
pub use report::SampleReader;
pub use symbols::Symbol;
pub use thread_tree::{MapEntry, ThreadEntry, ThreadTree};
