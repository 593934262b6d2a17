//! Parsers for the on-disk binary formats the profiler maps into processes.
//!
//! Four container formats are understood:
//! - ELF shared objects, executables, kernel images and modules (`elf`)
//! - DEX bytecode embedded at arbitrary offsets in another file (`dex`)
//! - APK/ZIP archives holding native libraries, addressed with the
//!   `archive!/entry` URL convention
//! - the kernel's `kallsyms` text table (`kallsyms`)

pub mod dex;
pub mod elf;
pub mod kallsyms;

use std::fs::File;
use std::io::Read;

use crate::domain::BinaryError;

pub use dex::DexSymbol;
pub use elf::ElfSymbol;
pub use kallsyms::KernelSymbol;

/// Split an `archive!/entry` URL into its archive path and entry name.
///
/// Returns `None` for plain file paths.
#[must_use]
pub fn split_apk_url(path: &str) -> Option<(&str, &str)> {
    let pos = path.find("!/")?;
    Some((&path[..pos], &path[pos + 2..]))
}

/// Read the raw bytes of one entry out of an APK/ZIP archive.
pub(crate) fn read_apk_entry(apk_path: &str, entry_name: &str) -> Result<Vec<u8>, BinaryError> {
    let file = File::open(apk_path)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| BinaryError::malformed(apk_path, format!("not a zip archive: {e}")))?;
    let mut entry = match archive.by_name(entry_name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => {
            return Err(BinaryError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no entry {entry_name} in {apk_path}"),
            )));
        }
        Err(e) => return Err(BinaryError::malformed(apk_path, e.to_string())),
    };
    let mut data = Vec::with_capacity(entry.size() as usize);
    entry
        .read_to_end(&mut data)
        .map_err(|e| BinaryError::malformed(apk_path, format!("bad entry {entry_name}: {e}")))?;
    Ok(data)
}

/// Load the bytes of a binary, resolving `archive!/entry` URLs through the
/// containing zip archive.
pub(crate) fn load_binary_bytes(path: &str) -> Result<Vec<u8>, BinaryError> {
    if let Some((apk, entry)) = split_apk_url(path) {
        read_apk_entry(apk, entry)
    } else {
        Ok(std::fs::read(path)?)
    }
}
