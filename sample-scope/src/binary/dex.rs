//! DEX container parsing for method code-item extents.
//!
//! A DEX file may be embedded at arbitrary offsets inside another file (a
//! vdex, an APK). The file is memory-mapped once, then each offset is
//! interpreted as a DEX header and walked for class data. Every method with
//! a code item yields one symbol whose address is the file offset of its
//! first instruction and whose length covers the instruction array.

use std::fs::File;

use memmap2::Mmap;

use crate::domain::BinaryError;

/// One method extent extracted from a DEX file.
#[derive(Debug, Clone)]
pub struct DexSymbol {
    /// Dotted `package.Class.method` form.
    pub name: String,
    /// File offset of the first code unit, relative to the containing file.
    pub offset: u64,
    /// Instruction array size in bytes.
    pub len: u64,
}

const HEADER_SIZE: usize = 0x70;
const ENDIAN_CONSTANT: u32 = 0x1234_5678;
// The instruction array starts after the fixed code_item header.
const CODE_ITEM_INSNS_OFF: u64 = 16;

/// Parse the DEX files at `offsets` inside `path` and feed every method
/// symbol to `sink`.
///
/// Any mapping, header, or structural failure aborts the whole parse.
pub fn read_symbols(
    path: &str,
    offsets: &[u64],
    mut sink: impl FnMut(DexSymbol),
) -> Result<(), BinaryError> {
    let file = File::open(path)?;
    let map = unsafe { Mmap::map(&file)? };
    let file_size = map.len() as u64;
    for &offset in offsets {
        if offset >= file_size || file_size - offset < HEADER_SIZE as u64 {
            return Err(BinaryError::malformed(
                path,
                format!("dex offset {offset:#x} out of range"),
            ));
        }
        let dex = DexFile::parse(path, &map[offset as usize..])?;
        dex.visit_methods(offset, &mut sink)?;
    }
    Ok(())
}

/// A validated view over one embedded DEX image.
struct DexFile<'a> {
    path: &'a str,
    data: &'a [u8],
    string_ids_size: u32,
    string_ids_off: u32,
    type_ids_size: u32,
    type_ids_off: u32,
    method_ids_size: u32,
    method_ids_off: u32,
    class_defs_size: u32,
    class_defs_off: u32,
}

impl<'a> DexFile<'a> {
    fn parse(path: &'a str, data: &'a [u8]) -> Result<Self, BinaryError> {
        if data.len() < HEADER_SIZE {
            return Err(BinaryError::malformed(path, "truncated dex header"));
        }
        if &data[0..4] != b"dex\n" || data[7] != 0 {
            return Err(BinaryError::malformed(path, "bad dex magic"));
        }
        let file_size = read_u32(data, 0x20);
        if (file_size as usize) < HEADER_SIZE || file_size as usize > data.len() {
            return Err(BinaryError::malformed(
                path,
                format!("dex file_size {file_size:#x} exceeds mapping"),
            ));
        }
        if read_u32(data, 0x28) != ENDIAN_CONSTANT {
            return Err(BinaryError::malformed(path, "unsupported dex endianness"));
        }
        let dex = DexFile {
            path,
            data: &data[..file_size as usize],
            string_ids_size: read_u32(data, 0x38),
            string_ids_off: read_u32(data, 0x3c),
            type_ids_size: read_u32(data, 0x40),
            type_ids_off: read_u32(data, 0x44),
            method_ids_size: read_u32(data, 0x58),
            method_ids_off: read_u32(data, 0x5c),
            class_defs_size: read_u32(data, 0x60),
            class_defs_off: read_u32(data, 0x64),
        };
        Ok(dex)
    }

    fn error(&self, reason: impl Into<String>) -> BinaryError {
        BinaryError::malformed(self.path, reason)
    }

    fn u32_at(&self, off: u64) -> Result<u32, BinaryError> {
        let off = off as usize;
        if off + 4 > self.data.len() {
            return Err(self.error(format!("read past end of dex at {off:#x}")));
        }
        Ok(read_u32(self.data, off))
    }

    fn u16_at(&self, off: u64) -> Result<u16, BinaryError> {
        let off = off as usize;
        if off + 2 > self.data.len() {
            return Err(self.error(format!("read past end of dex at {off:#x}")));
        }
        Ok(u16::from_le_bytes([self.data[off], self.data[off + 1]]))
    }

    /// Emit a symbol for every method carrying a code item.
    ///
    /// `dex_begin` is the offset of this DEX image inside the containing
    /// file; emitted symbol offsets are relative to the containing file.
    fn visit_methods(
        &self,
        dex_begin: u64,
        sink: &mut impl FnMut(DexSymbol),
    ) -> Result<(), BinaryError> {
        for i in 0..u64::from(self.class_defs_size) {
            // class_def_item is 32 bytes; class_data_off sits at +24.
            let class_def_off = u64::from(self.class_defs_off) + i * 32;
            let class_data_off = self.u32_at(class_def_off + 24)?;
            if class_data_off == 0 {
                continue;
            }
            self.visit_class_data(u64::from(class_data_off), dex_begin, sink)?;
        }
        Ok(())
    }

    fn visit_class_data(
        &self,
        class_data_off: u64,
        dex_begin: u64,
        sink: &mut impl FnMut(DexSymbol),
    ) -> Result<(), BinaryError> {
        let mut cursor = Uleb128Cursor::new(self, class_data_off);
        let static_fields = cursor.next()?;
        let instance_fields = cursor.next()?;
        let direct_methods = cursor.next()?;
        let virtual_methods = cursor.next()?;
        for _ in 0..static_fields.saturating_add(instance_fields) {
            cursor.next()?; // field_idx_diff
            cursor.next()?; // access_flags
        }
        for method_count in [direct_methods, virtual_methods] {
            let mut method_idx: u32 = 0;
            for _ in 0..method_count {
                method_idx = method_idx.wrapping_add(cursor.next()?);
                cursor.next()?; // access_flags
                let code_off = cursor.next()?;
                if code_off == 0 {
                    continue;
                }
                // insns_size (in 16-bit code units) sits at +12 in code_item.
                let insns_size = self.u32_at(u64::from(code_off) + 12)?;
                sink(DexSymbol {
                    name: self.pretty_method(method_idx)?,
                    offset: u64::from(code_off) + CODE_ITEM_INSNS_OFF + dex_begin,
                    len: u64::from(insns_size) * 2,
                });
            }
        }
        Ok(())
    }

    /// `package.Class.method`, the dotted form reports display.
    fn pretty_method(&self, method_idx: u32) -> Result<String, BinaryError> {
        if method_idx >= self.method_ids_size {
            return Err(self.error(format!("method index {method_idx} out of range")));
        }
        // method_id_item: class_idx u16, proto_idx u16, name_idx u32.
        let method_id_off = u64::from(self.method_ids_off) + u64::from(method_idx) * 8;
        let class_idx = self.u16_at(method_id_off)?;
        let name_idx = self.u32_at(method_id_off + 4)?;
        let descriptor = self.type_descriptor(u32::from(class_idx))?;
        let method_name = self.string_at_idx(name_idx)?;
        Ok(format!(
            "{}.{}",
            descriptor_to_dotted(&descriptor),
            method_name
        ))
    }

    fn type_descriptor(&self, type_idx: u32) -> Result<String, BinaryError> {
        if type_idx >= self.type_ids_size {
            return Err(self.error(format!("type index {type_idx} out of range")));
        }
        let descriptor_idx = self.u32_at(u64::from(self.type_ids_off) + u64::from(type_idx) * 4)?;
        self.string_at_idx(descriptor_idx)
    }

    fn string_at_idx(&self, string_idx: u32) -> Result<String, BinaryError> {
        if string_idx >= self.string_ids_size {
            return Err(self.error(format!("string index {string_idx} out of range")));
        }
        let data_off = self.u32_at(u64::from(self.string_ids_off) + u64::from(string_idx) * 4)?;
        // string_data_item: uleb128 utf16 length, then MUTF-8 bytes, NUL
        // terminated.
        let mut cursor = Uleb128Cursor::new(self, u64::from(data_off));
        cursor.next()?;
        let start = cursor.pos as usize;
        let end = self.data[start..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| start + p)
            .ok_or_else(|| self.error("unterminated string data"))?;
        Ok(decode_mutf8(&self.data[start..end]))
    }
}

/// Bounds-checked ULEB128 reader over a dex image.
struct Uleb128Cursor<'a, 'b> {
    dex: &'b DexFile<'a>,
    pos: u64,
}

impl<'a, 'b> Uleb128Cursor<'a, 'b> {
    fn new(dex: &'b DexFile<'a>, pos: u64) -> Self {
        Self { dex, pos }
    }

    fn next(&mut self) -> Result<u32, BinaryError> {
        let mut value: u32 = 0;
        for shift in (0..35).step_by(7) {
            let pos = self.pos as usize;
            let byte = *self
                .dex
                .data
                .get(pos)
                .ok_or_else(|| self.dex.error("uleb128 past end of dex"))?;
            self.pos += 1;
            value |= u32::from(byte & 0x7f).wrapping_shl(shift);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(self.dex.error("uleb128 too long"))
    }
}

fn read_u32(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

/// `Lcom/foo/Bar;` → `com.foo.Bar`. Non-class descriptors pass through.
fn descriptor_to_dotted(descriptor: &str) -> String {
    match descriptor.strip_prefix('L').and_then(|s| s.strip_suffix(';')) {
        Some(inner) => inner.replace('/', "."),
        None => descriptor.to_string(),
    }
}

/// Decode modified UTF-8: standard UTF-8 minus 4-byte sequences, with NUL
/// encoded as `C0 80` and supplementary characters as CESU-8 surrogate
/// pairs. Invalid sequences decode to U+FFFD.
fn decode_mutf8(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b & 0x80 == 0 {
            units.push(u16::from(b));
            i += 1;
        } else if b & 0xe0 == 0xc0 && i + 1 < bytes.len() {
            units.push((u16::from(b & 0x1f) << 6) | u16::from(bytes[i + 1] & 0x3f));
            i += 2;
        } else if b & 0xf0 == 0xe0 && i + 2 < bytes.len() {
            units.push(
                (u16::from(b & 0x0f) << 12)
                    | (u16::from(bytes[i + 1] & 0x3f) << 6)
                    | u16::from(bytes[i + 2] & 0x3f),
            );
            i += 3;
        } else {
            units.push(0xfffd);
            i += 1;
        }
    }
    out.extend(char::decode_utf16(units).map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER)));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_conversion() {
        assert_eq!(descriptor_to_dotted("Lcom/example/Foo$1;"), "com.example.Foo$1");
        assert_eq!(descriptor_to_dotted("I"), "I");
    }

    #[test]
    fn mutf8_ascii_and_two_byte() {
        assert_eq!(decode_mutf8(b"run"), "run");
        // U+00E9 (e-acute) in MUTF-8: C3 A9
        assert_eq!(decode_mutf8(&[0xc3, 0xa9]), "\u{e9}");
    }

    #[test]
    fn mutf8_surrogate_pair() {
        // U+1D11E (musical symbol) as CESU-8: ED A0 B4 ED B4 9E
        assert_eq!(
            decode_mutf8(&[0xed, 0xa0, 0xb4, 0xed, 0xb4, 0x9e]),
            "\u{1d11e}"
        );
    }

    #[test]
    fn rejects_bad_magic() {
        let data = vec![0u8; HEADER_SIZE];
        assert!(DexFile::parse("x", &data).is_err());
    }
}
