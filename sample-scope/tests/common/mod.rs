//! Synthetic binary fixtures: a minimal ELF64 shared object, a minimal DEX
//! image, and a stored-entry zip, all built byte-by-byte so tests control
//! every field.

#![allow(dead_code)]

use std::io::Write;

/// Capture engine logs in test output.
pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// One symbol to place in the fixture's `.symtab`.
pub struct ElfSymbolSpec {
    pub name: &'static str,
    pub vaddr: u64,
    pub size: u64,
    /// `STT_FUNC` when true, `STT_NOTYPE` otherwise.
    pub is_func: bool,
    /// Whether the symbol lives in `.text` (otherwise `SHN_ABS`).
    pub in_text: bool,
}

const EHSIZE: usize = 64;
const PHSIZE: usize = 56;
const SHSIZE: usize = 64;
const TEXT_SIZE: usize = 0x100;

/// Build a little-endian x86-64 `ET_DYN` image with a build-id note, one
/// read-only and one executable `PT_LOAD` segment, a `.text` section at
/// `text_vaddr`, and a `.symtab` holding `symbols`.
pub fn build_elf(build_id: &[u8], text_vaddr: u64, symbols: &[ElfSymbolSpec]) -> Vec<u8> {
    // String tables.
    let mut strtab = vec![0u8];
    let mut name_offsets = Vec::new();
    for sym in symbols {
        name_offsets.push(strtab.len() as u32);
        strtab.extend(sym.name.bytes());
        strtab.push(0);
    }
    let mut shstrtab = vec![0u8];
    let mut sh_names = Vec::new();
    for name in [".note.gnu.build-id", ".text", ".symtab", ".strtab", ".shstrtab"] {
        sh_names.push(shstrtab.len() as u32);
        shstrtab.extend(name.bytes());
        shstrtab.push(0);
    }

    // The build-id note.
    let mut note = Vec::new();
    note.extend(4u32.to_le_bytes());
    note.extend((build_id.len() as u32).to_le_bytes());
    note.extend(3u32.to_le_bytes()); // NT_GNU_BUILD_ID
    note.extend(b"GNU\0");
    note.extend(build_id);
    while note.len() % 4 != 0 {
        note.push(0);
    }

    let phnum = 2usize;
    let note_off = EHSIZE + phnum * PHSIZE;
    let text_off = note_off + note.len();
    let symtab_off = text_off + TEXT_SIZE;
    let symtab_size = 24 * (1 + symbols.len());
    let strtab_off = symtab_off + symtab_size;
    let shstrtab_off = strtab_off + strtab.len();
    let shoff = (shstrtab_off + shstrtab.len() + 7) & !7;
    let shnum = 6u16;

    let mut out = Vec::new();
    // ELF header.
    out.extend([0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
    out.extend([0u8; 8]);
    out.extend(3u16.to_le_bytes()); // ET_DYN
    out.extend(62u16.to_le_bytes()); // EM_X86_64
    out.extend(1u32.to_le_bytes());
    out.extend(text_vaddr.to_le_bytes()); // e_entry
    out.extend((EHSIZE as u64).to_le_bytes());
    out.extend((shoff as u64).to_le_bytes());
    out.extend(0u32.to_le_bytes());
    out.extend((EHSIZE as u16).to_le_bytes());
    out.extend((PHSIZE as u16).to_le_bytes());
    out.extend((phnum as u16).to_le_bytes());
    out.extend((SHSIZE as u16).to_le_bytes());
    out.extend(shnum.to_le_bytes());
    out.extend(5u16.to_le_bytes()); // e_shstrndx

    // PT_LOAD r-- covering the file header, PT_LOAD r-x for .text.
    push_phdr(&mut out, 4, 0, 0, (note_off + note.len()) as u64);
    push_phdr(&mut out, 4 | 1, text_off as u64, text_vaddr, TEXT_SIZE as u64);

    out.extend(&note);
    out.extend(vec![0x90u8; TEXT_SIZE]);

    // Symbol table: null entry, then the requested symbols.
    out.extend([0u8; 24]);
    for (sym, &name_off) in symbols.iter().zip(&name_offsets) {
        out.extend(name_off.to_le_bytes());
        let stt: u8 = if sym.is_func { 2 } else { 0 };
        out.push((1 << 4) | stt); // STB_GLOBAL
        out.push(0);
        let shndx: u16 = if sym.in_text { 2 } else { 0xfff1 };
        out.extend(shndx.to_le_bytes());
        out.extend(sym.vaddr.to_le_bytes());
        out.extend(sym.size.to_le_bytes());
    }

    out.extend(&strtab);
    out.extend(&shstrtab);
    while out.len() < shoff {
        out.push(0);
    }

    // Section headers: null, note, text, symtab, strtab, shstrtab.
    out.extend([0u8; SHSIZE]);
    push_shdr(&mut out, sh_names[0], 7, 2, 0, note_off, note.len(), 0, 0, 4, 0);
    push_shdr(&mut out, sh_names[1], 1, 6, text_vaddr, text_off, TEXT_SIZE, 0, 0, 16, 0);
    push_shdr(&mut out, sh_names[2], 2, 0, 0, symtab_off, symtab_size, 4, 1, 8, 24);
    push_shdr(&mut out, sh_names[3], 3, 0, 0, strtab_off, strtab.len(), 0, 0, 1, 0);
    push_shdr(&mut out, sh_names[4], 3, 0, 0, shstrtab_off, shstrtab.len(), 0, 0, 1, 0);
    out
}

fn push_phdr(out: &mut Vec<u8>, flags: u32, offset: u64, vaddr: u64, size: u64) {
    out.extend(1u32.to_le_bytes()); // PT_LOAD
    out.extend(flags.to_le_bytes());
    out.extend(offset.to_le_bytes());
    out.extend(vaddr.to_le_bytes());
    out.extend(vaddr.to_le_bytes());
    out.extend(size.to_le_bytes());
    out.extend(size.to_le_bytes());
    out.extend(0x1000u64.to_le_bytes());
}

#[allow(clippy::too_many_arguments)]
fn push_shdr(
    out: &mut Vec<u8>,
    name: u32,
    sh_type: u32,
    flags: u64,
    addr: u64,
    offset: usize,
    size: usize,
    link: u32,
    info: u32,
    align: u64,
    entsize: u64,
) {
    out.extend(name.to_le_bytes());
    out.extend(sh_type.to_le_bytes());
    out.extend(flags.to_le_bytes());
    out.extend(addr.to_le_bytes());
    out.extend((offset as u64).to_le_bytes());
    out.extend((size as u64).to_le_bytes());
    out.extend(link.to_le_bytes());
    out.extend(info.to_le_bytes());
    out.extend(align.to_le_bytes());
    out.extend(entsize.to_le_bytes());
}

const NO_INDEX: u32 = 0xffff_ffff;

fn push_uleb(out: &mut Vec<u8>, mut value: u32) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

/// Build a single-class DEX image. Each method gets a code item whose
/// instruction array holds `insns` 16-bit code units.
///
/// Returns the image and, per method, the offset of its first code unit
/// relative to the image start.
pub fn build_dex(class_descriptor: &str, methods: &[(&str, u32)]) -> (Vec<u8>, Vec<u64>) {
    let strings: Vec<&str> = std::iter::once(class_descriptor)
        .chain(methods.iter().map(|(name, _)| *name))
        .collect();
    let nstr = strings.len();

    let string_ids_off = 0x70usize;
    let type_ids_off = string_ids_off + 4 * nstr;
    let method_ids_off = type_ids_off + 4;
    let class_defs_off = method_ids_off + 8 * methods.len();
    let mut pos = class_defs_off + 32;

    // String data items.
    let mut string_data = Vec::new();
    let mut string_offsets = Vec::new();
    for s in &strings {
        string_offsets.push((pos + string_data.len()) as u32);
        push_uleb(&mut string_data, s.chars().count() as u32);
        string_data.extend(s.bytes());
        string_data.push(0);
    }
    pos += string_data.len();

    // Code items, 4-aligned.
    let mut code = Vec::new();
    let mut code_offs = Vec::new();
    for &(_, insns) in methods {
        while (pos + code.len()) % 4 != 0 {
            code.push(0);
        }
        code_offs.push((pos + code.len()) as u32);
        code.extend(1u16.to_le_bytes()); // registers_size
        code.extend(1u16.to_le_bytes()); // ins_size
        code.extend(0u16.to_le_bytes()); // outs_size
        code.extend(0u16.to_le_bytes()); // tries_size
        code.extend(0u32.to_le_bytes()); // debug_info_off
        code.extend(insns.to_le_bytes()); // insns_size
        code.extend(vec![0u8; insns as usize * 2]);
    }
    pos += code.len();

    // class_data_item.
    let class_data_off = pos as u32;
    let mut class_data = Vec::new();
    push_uleb(&mut class_data, 0); // static fields
    push_uleb(&mut class_data, 0); // instance fields
    push_uleb(&mut class_data, methods.len() as u32); // direct methods
    push_uleb(&mut class_data, 0); // virtual methods
    for (i, _) in methods.iter().enumerate() {
        push_uleb(&mut class_data, u32::from(i != 0)); // method_idx_diff
        push_uleb(&mut class_data, 0); // access_flags
        push_uleb(&mut class_data, code_offs[i]);
    }
    pos += class_data.len();
    let file_size = pos as u32;

    let mut out = Vec::with_capacity(pos);
    out.extend(b"dex\n035\0");
    out.extend(0u32.to_le_bytes()); // checksum (unchecked)
    out.extend([0u8; 20]); // signature (unchecked)
    out.extend(file_size.to_le_bytes());
    out.extend(0x70u32.to_le_bytes()); // header_size
    out.extend(0x1234_5678u32.to_le_bytes()); // endian_tag
    out.extend(0u32.to_le_bytes()); // link_size
    out.extend(0u32.to_le_bytes()); // link_off
    out.extend(0u32.to_le_bytes()); // map_off
    out.extend((nstr as u32).to_le_bytes());
    out.extend((string_ids_off as u32).to_le_bytes());
    out.extend(1u32.to_le_bytes()); // type_ids_size
    out.extend((type_ids_off as u32).to_le_bytes());
    out.extend(0u32.to_le_bytes()); // proto_ids_size
    out.extend(0u32.to_le_bytes()); // proto_ids_off
    out.extend(0u32.to_le_bytes()); // field_ids_size
    out.extend(0u32.to_le_bytes()); // field_ids_off
    out.extend((methods.len() as u32).to_le_bytes());
    out.extend((method_ids_off as u32).to_le_bytes());
    out.extend(1u32.to_le_bytes()); // class_defs_size
    out.extend((class_defs_off as u32).to_le_bytes());
    out.extend((file_size - class_data_off).to_le_bytes()); // data_size
    out.extend(class_data_off.to_le_bytes()); // data_off

    for off in &string_offsets {
        out.extend(off.to_le_bytes());
    }
    out.extend(0u32.to_le_bytes()); // type id 0 -> string 0

    for (i, _) in methods.iter().enumerate() {
        out.extend(0u16.to_le_bytes()); // class_idx
        out.extend(0u16.to_le_bytes()); // proto_idx
        out.extend((1 + i as u32).to_le_bytes()); // name_idx
    }

    // class_def_item.
    out.extend(0u32.to_le_bytes()); // class_idx
    out.extend(0u32.to_le_bytes()); // access_flags
    out.extend(NO_INDEX.to_le_bytes()); // superclass
    out.extend(0u32.to_le_bytes()); // interfaces_off
    out.extend(NO_INDEX.to_le_bytes()); // source_file
    out.extend(0u32.to_le_bytes()); // annotations_off
    out.extend(class_data_off.to_le_bytes());
    out.extend(0u32.to_le_bytes()); // static_values_off

    out.extend(&string_data);
    out.extend(&code);
    out.extend(&class_data);
    assert_eq!(out.len(), file_size as usize);

    let insns_offs = code_offs.iter().map(|&off| u64::from(off) + 16).collect();
    (out, insns_offs)
}

/// Build a zip archive with stored (uncompressed) entries.
pub fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        for (name, data) in entries {
            let options = zip::write::SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Stored);
            writer.start_file(*name, options).expect("zip entry");
            writer.write_all(data).expect("zip entry data");
        }
        writer.finish().expect("zip finish");
    }
    cursor.into_inner()
}
