//! Frame filtering and the enriched sample shapes handed to callers.
//!
//! The ART runtime's interpreter shows up in call chains as `libart.so`
//! frames surrounding the bytecode method actually running. Unless the
//! caller asks for them, those interpreter frames are elided wherever they
//! touch a DEX frame, leaving the Java-level view.

use std::rc::Rc;

use crate::domain::DsoType;
use crate::thread_tree::MapEntry;

/// The address range a frame's dso was mapped at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub start: u64,
    pub end: u64,
    pub pgoff: u64,
}

/// A resolved frame: where the ip landed and what symbol covers it.
#[derive(Debug, Clone)]
pub struct SymbolEntry {
    pub dso_name: String,
    pub vaddr_in_file: u64,
    pub symbol_name: String,
    pub symbol_addr: u64,
    pub symbol_len: u64,
    pub mapping: Mapping,
}

/// One frame of a sample's call chain.
#[derive(Debug, Clone)]
pub struct CallChainEntry {
    pub ip: u64,
    pub symbol: SymbolEntry,
}

/// One enriched sample.
#[derive(Debug, Clone)]
pub struct Sample {
    pub ip: u64,
    pub pid: u32,
    pub tid: u32,
    pub thread_comm: String,
    pub time: u64,
    pub in_kernel: bool,
    pub cpu: u32,
    pub period: u64,
    /// Name of the event that produced this sample.
    pub event_name: String,
    /// The leading frame's resolution.
    pub symbol: SymbolEntry,
    /// Caller frames, innermost first (the leading frame excluded).
    pub call_chain: Vec<CallChainEntry>,
}

fn is_art_interpreter(map: &MapEntry) -> bool {
    map.dso.path().ends_with("/libart.so")
}

/// Drop interpreter frames adjacent to DEX frames.
///
/// A DEX frame retroactively removes the interpreter frames accumulated
/// just before it and suppresses those immediately after; any other frame
/// ends the suppression window. Idempotent.
pub(crate) fn filter_art_frames(
    ip_maps: Vec<(u64, Rc<MapEntry>)>,
    show_art_frames: bool,
) -> Vec<(u64, Rc<MapEntry>)> {
    if show_art_frames {
        return ip_maps;
    }
    let mut result: Vec<(u64, Rc<MapEntry>)> = Vec::with_capacity(ip_maps.len());
    let mut near_java_method = false;
    for (ip, map) in ip_maps {
        if map.dso.dso_type() == DsoType::DexFile {
            near_java_method = true;
            while result.last().is_some_and(|(_, m)| is_art_interpreter(m)) {
                result.pop();
            }
        } else if is_art_interpreter(&map) {
            if near_java_method {
                continue;
            }
        } else {
            near_java_method = false;
        }
        result.push((ip, map));
    }
    result
}
