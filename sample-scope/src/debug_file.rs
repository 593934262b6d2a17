//! Locating the on-disk file that carries symbols for a recorded dso path.
//!
//! Recordings name binaries by their path on the profiled machine. When the
//! report runs elsewhere, a symbol root directory (`symfs`) holds copies of
//! those binaries, indexed by build id through a `build_id_list` file. The
//! finder resolves each dso path to the best debug file, verifying build
//! ids so a stale copy is never used.

use std::collections::HashMap;
use std::fs;

use anyhow::{bail, Context, Result};
use log::debug;

use crate::binary::elf;
use crate::domain::BuildId;

const VDSO_PATH: &str = "[vdso]";
const LINUX_DEBUG_DIR: &str = "/usr/lib/debug";

/// Resolves `(dso_path, build_id, bitness)` to a debug file path.
#[derive(Default)]
pub struct DebugFileFinder {
    /// Symbol root, stored with a trailing `/` so lookups are plain string
    /// concatenation (dso paths are usually absolute).
    symfs_dir: Option<String>,
    /// hex build id → path relative to `symfs_dir`, from `build_id_list`.
    build_id_to_file: HashMap<String, String>,
    vdso_32bit: Option<String>,
    vdso_64bit: Option<String>,
}

impl DebugFileFinder {
    pub fn reset(&mut self) {
        *self = DebugFileFinder::default();
    }

    /// Set the symbol root directory and reload its `build_id_list` index.
    ///
    /// # Errors
    /// Fails if `dir` is not a directory.
    pub fn set_symfs_dir(&mut self, dir: &str) -> Result<()> {
        if dir.is_empty() {
            self.symfs_dir = None;
            self.build_id_to_file.clear();
            return Ok(());
        }
        let mut dirname = dir.to_string();
        if !dirname.ends_with('/') {
            dirname.push('/');
        }
        if !fs::metadata(dir)
            .with_context(|| format!("invalid symfs_dir '{dir}'"))?
            .is_dir()
        {
            bail!("invalid symfs_dir '{dir}': not a directory");
        }
        self.build_id_to_file.clear();
        if let Ok(list) = fs::read_to_string(format!("{dirname}build_id_list")) {
            for line in list.lines() {
                let items: Vec<&str> = line.split('=').collect();
                if items.len() == 2 {
                    self.build_id_to_file
                        .insert(items[0].to_string(), items[1].to_string());
                }
            }
        }
        self.symfs_dir = Some(dirname);
        Ok(())
    }

    /// Override the file used for the `[vdso]` pseudo-path, per bitness.
    pub fn set_vdso_file(&mut self, vdso_file: &str, is_64bit: bool) {
        if is_64bit {
            self.vdso_64bit = Some(vdso_file.to_string());
        } else {
            self.vdso_32bit = Some(vdso_file.to_string());
        }
    }

    /// Resolve `dso_path` to the file to read symbols from.
    ///
    /// Policy, in order: vdso overrides; the `build_id_list` index; the
    /// symfs copy of the path; the system debug directory. Every candidate
    /// must carry the expected build id; when nothing matches, the dso
    /// path is returned unchanged.
    #[must_use]
    pub fn find_debug_file(&self, dso_path: &str, force_64bit: bool, build_id: &BuildId) -> String {
        if dso_path == VDSO_PATH {
            let vdso = if force_64bit {
                &self.vdso_64bit
            } else {
                &self.vdso_32bit
            };
            if let Some(path) = vdso {
                return path.clone();
            }
        } else if let Some(symfs_dir) = &self.symfs_dir {
            let expected = if build_id.is_empty() {
                elf::read_build_id(dso_path).ok()
            } else {
                Some(*build_id)
            };
            if let Some(expected) = expected.filter(|id| !id.is_empty()) {
                if let Some(relpath) = self.build_id_to_file.get(&expected.to_string()) {
                    let candidate = format!("{symfs_dir}{relpath}");
                    if check_debug_file(&candidate, &expected) {
                        return candidate;
                    }
                }
                let candidate = format!("{symfs_dir}{dso_path}");
                if check_debug_file(&candidate, &expected) {
                    return candidate;
                }
                // Linux hosts keep debug shared libraries here.
                let candidate = format!("{LINUX_DEBUG_DIR}{dso_path}");
                if check_debug_file(&candidate, &expected) {
                    return candidate;
                }
            }
        }
        dso_path.to_string()
    }
}

/// A candidate is usable only when its on-disk build id equals the
/// expected one.
fn check_debug_file(path: &str, expected: &BuildId) -> bool {
    match elf::read_build_id(path) {
        Ok(found) if found == *expected => true,
        Ok(found) => {
            debug!("skipped debug file {path}: build id {found} doesn't match {expected}");
            false
        }
        Err(e) => {
            debug!("skipped debug file {path}: {e}");
            false
        }
    }
}
