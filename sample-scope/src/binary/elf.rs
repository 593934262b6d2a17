//! ELF metadata and symbol-table extraction.
//!
//! Works on plain files and on `archive!/entry` URLs naming an ELF embedded
//! in an APK; either way the whole image is read into memory and handed to
//! the `object` crate.

use object::elf::PF_X;
use object::{
    Object, ObjectSection, ObjectSegment, ObjectSymbol, ObjectSymbolTable, SectionKind,
    SegmentFlags, SymbolKind,
};

use super::load_binary_bytes;
use crate::domain::{BinaryError, BuildId};

/// One entry of an ELF symbol table, before Dso-level filtering.
#[derive(Debug, Clone)]
pub struct ElfSymbol {
    pub name: String,
    pub vaddr: u64,
    pub len: u64,
    /// `STT_FUNC` symbol.
    pub is_func: bool,
    /// `STT_NOTYPE` symbol; only meaningful together with
    /// `is_in_text_section`.
    pub is_label: bool,
    pub is_in_text_section: bool,
}

fn parse_object<'a>(path: &str, data: &'a [u8]) -> Result<object::File<'a>, BinaryError> {
    object::File::parse(data).map_err(|e| BinaryError::malformed(path, e.to_string()))
}

fn build_id_of(path: &str, obj: &object::File<'_>) -> Result<BuildId, BinaryError> {
    match obj.build_id() {
        Ok(Some(id)) => Ok(BuildId::new(id)),
        Ok(None) => Err(BinaryError::NoBuildId(path.to_string())),
        Err(e) => Err(BinaryError::malformed(path, e.to_string())),
    }
}

/// Verify the file carries `expected` when an expectation exists.
fn check_build_id(
    path: &str,
    obj: &object::File<'_>,
    expected: &BuildId,
) -> Result<(), BinaryError> {
    if expected.is_empty() {
        return Ok(());
    }
    let found = build_id_of(path, obj)?;
    if found != *expected {
        return Err(BinaryError::BuildIdMismatch {
            path: path.to_string(),
            expected: *expected,
            found,
        });
    }
    Ok(())
}

/// Read the `NT_GNU_BUILD_ID` note of an ELF file or APK-embedded entry.
pub fn read_build_id(path: &str) -> Result<BuildId, BinaryError> {
    let data = load_binary_bytes(path)?;
    let obj = parse_object(path, &data)?;
    build_id_of(path, &obj)
}

/// The lowest `p_vaddr` among executable `PT_LOAD` segments, or 0 when the
/// file has none.
///
/// Fails with [`BinaryError::BuildIdMismatch`] when `expected_build_id` is
/// non-empty and disagrees with the file.
pub fn read_min_executable_vaddr(
    path: &str,
    expected_build_id: &BuildId,
) -> Result<u64, BinaryError> {
    let data = load_binary_bytes(path)?;
    let obj = parse_object(path, &data)?;
    check_build_id(path, &obj, expected_build_id)?;
    let mut min_vaddr = u64::MAX;
    for segment in obj.segments() {
        if let SegmentFlags::Elf { p_flags } = segment.flags() {
            if p_flags & PF_X != 0 {
                min_vaddr = min_vaddr.min(segment.address());
            }
        }
    }
    Ok(if min_vaddr == u64::MAX { 0 } else { min_vaddr })
}

/// Walk the symbol table, preferring `.symtab` and falling back to
/// `.dynsym`, and feed every named entry to `sink`.
///
/// # Errors
/// [`BinaryError::NoSymbolTable`] when neither table exists;
/// [`BinaryError::BuildIdMismatch`] on a build-id disagreement.
pub fn parse_symbols(
    path: &str,
    expected_build_id: &BuildId,
    mut sink: impl FnMut(ElfSymbol),
) -> Result<(), BinaryError> {
    let data = load_binary_bytes(path)?;
    let obj = parse_object(path, &data)?;
    check_build_id(path, &obj, expected_build_id)?;

    let table = obj
        .symbol_table()
        .or_else(|| obj.dynamic_symbol_table())
        .ok_or_else(|| BinaryError::NoSymbolTable(path.to_string()))?;

    for symbol in table.symbols() {
        let Ok(name) = symbol.name() else { continue };
        if name.is_empty() {
            continue;
        }
        let is_in_text_section = symbol
            .section_index()
            .and_then(|index| obj.section_by_index(index).ok())
            .is_some_and(|section| section.kind() == SectionKind::Text);
        sink(ElfSymbol {
            name: name.to_string(),
            vaddr: symbol.address(),
            len: symbol.size(),
            is_func: symbol.kind() == SymbolKind::Text,
            is_label: matches!(symbol.kind(), SymbolKind::Label | SymbolKind::Unknown),
            is_in_text_section,
        });
    }
    Ok(())
}
