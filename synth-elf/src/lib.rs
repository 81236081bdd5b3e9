//! Synthesize ELF executables and shared objects for tests, so that binary
//! fixtures never need to be checked in. Sections are assembled with
//! [`test_assembler`] labels, which means section addresses, dynamic-entry
//! values, and header offsets can reference each other before the final
//! layout is known.

use goblin::elf::{header, section_header};
use std::collections::HashMap;

pub use test_assembler::{Endian, Label, LabelMaker, Section};

/// An ELF string table under construction. Identical strings share one slot.
pub struct StringTable {
    section: Section,
    strings: HashMap<String, Label>,
}

impl Default for StringTable {
    fn default() -> Self {
        Self::with_endian(test_assembler::DEFAULT_ENDIAN)
    }
}

impl StringTable {
    pub fn with_endian(endian: Endian) -> Self {
        let mut this = Self {
            section: Section::with_endian(endian),
            strings: HashMap::new(),
        };
        this.section = this.section.set_start_const(0);
        this.add("");
        this
    }

    /// Add a string and return a label for its offset.
    pub fn add(&mut self, string: impl Into<String>) -> Label {
        let string = string.into();
        if let Some(label) = self.strings.get(&string) {
            return label.clone();
        }

        let here = self.section.here();
        self.section = std::mem::take(&mut self.section)
            .append_bytes(string.as_bytes())
            .append_bytes(&[0]);
        self.strings.insert(string, here.clone());
        here
    }

    pub fn into_section(self) -> Section {
        self.section
    }

    pub fn finish(self) -> Option<Vec<u8>> {
        self.section.get_contents()
    }
}

/// Symbol binding and type, combined into `st_info` on write.
#[derive(Copy, Clone)]
pub struct StInfo {
    pub bind: u8,
    pub kind: u8,
}

impl From<StInfo> for u8 {
    fn from(info: StInfo) -> u8 {
        (info.bind << 4) | (info.kind & 0xf)
    }
}

mod word {
    use super::{Section, StInfo};

    /// Address width of a symbol table; the two classes lay `Elf_Sym` out
    /// differently, not just wider.
    pub trait SymWord: Copy + Default {
        fn write_sym(section: &mut Section, name: &super::Label, value: Self, size: Self, info: StInfo, shndx: u16);
    }

    impl SymWord for u32 {
        fn write_sym(section: &mut Section, name: &super::Label, value: u32, size: u32, info: StInfo, shndx: u16) {
            *section = std::mem::take(section)
                .D32(name)
                .D32(value)
                .D32(size)
                .D8(u8::from(info))
                .D8(0)
                .D16(shndx);
        }
    }

    impl SymWord for u64 {
        fn write_sym(section: &mut Section, name: &super::Label, value: u64, size: u64, info: StInfo, shndx: u16) {
            *section = std::mem::take(section)
                .D32(name)
                .D8(u8::from(info))
                .D8(0)
                .D16(shndx)
                .D64(value)
                .D64(size);
        }
    }
}

pub use word::SymWord;

/// A `.symtab`/`.dynsym` under construction; `W` selects the ELF class.
/// The mandatory null symbol at index 0 is written up front.
pub struct SymbolTable<W> {
    section: Section,
    count: usize,
    _word: std::marker::PhantomData<W>,
}

impl<W: SymWord> SymbolTable<W> {
    pub fn with_endian(endian: Endian) -> Self {
        let section = Section::with_endian(endian).set_start_const(0);
        let mut this = Self {
            section,
            count: 0,
            _word: std::marker::PhantomData,
        };
        let null_name = Label::new();
        null_name.set_const(0);
        this.raw_symbol(&null_name, W::default(), W::default(), StInfo { bind: 0, kind: 0 }, 0);
        this
    }

    fn raw_symbol(&mut self, name: &Label, value: W, size: W, info: StInfo, shndx: u16) {
        W::write_sym(&mut self.section, name, value, size, info, shndx);
        self.count += 1;
    }

    pub fn add_symbol(
        &mut self,
        strtab: &mut StringTable,
        name: impl Into<String>,
        value: W,
        size: W,
        info: StInfo,
        shndx: u16,
    ) -> &mut Self {
        let name = strtab.add(name);
        self.raw_symbol(&name, value, size, info, shndx);
        self
    }

    /// Number of symbols written, including the null entry.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn entsize(&self) -> u64 {
        if std::mem::size_of::<W>() == 8 {
            24
        } else {
            16
        }
    }

    pub fn into_section(self) -> Section {
        self.section
    }

    pub fn finish(self) -> Option<Vec<u8>> {
        self.section.get_contents()
    }
}

/// A `.dynamic` section under construction. The `DT_NULL` terminator is
/// appended by `into_section`.
pub struct DynamicSection {
    section: Section,
    is64: bool,
}

impl DynamicSection {
    pub fn with_endian(endian: Endian, class: ElfClass) -> Self {
        let section = Section::with_endian(endian).set_start_const(0);
        Self {
            section,
            is64: class.is_64(),
        }
    }

    pub fn entry(&mut self, tag: u64, val: u64) -> &mut Self {
        self.section = if self.is64 {
            std::mem::take(&mut self.section).D64(tag).D64(val)
        } else {
            std::mem::take(&mut self.section).D32(tag as u32).D32(val as u32)
        };
        self
    }

    /// An entry whose value is a label, e.g. the eventual address of some
    /// other section.
    pub fn entry_label(&mut self, tag: u64, val: &Label) -> &mut Self {
        self.section = if self.is64 {
            std::mem::take(&mut self.section).D64(tag).D64(val)
        } else {
            std::mem::take(&mut self.section).D32(tag as u32).D32(val)
        };
        self
    }

    pub fn entsize(&self) -> u64 {
        if self.is64 {
            16
        } else {
            8
        }
    }

    pub fn into_section(mut self) -> Section {
        self.entry(0, 0); // DT_NULL
        self.section
    }
}

#[derive(Copy, Clone)]
pub enum ElfClass {
    Class32,
    Class64,
}

impl ElfClass {
    pub fn is_64(self) -> bool {
        matches!(self, Self::Class64)
    }

    pub fn class(self) -> u8 {
        match self {
            Self::Class32 => header::ELFCLASS32,
            Self::Class64 => header::ELFCLASS64,
        }
    }

    pub fn addr_size(self) -> usize {
        match self {
            Self::Class32 => 4,
            Self::Class64 => 8,
        }
    }

    pub fn ehsize(self) -> u16 {
        match self {
            Self::Class32 => header::header32::SIZEOF_EHDR as u16,
            Self::Class64 => header::header64::SIZEOF_EHDR as u16,
        }
    }

    pub fn phentsize(self) -> u16 {
        match self {
            Self::Class32 => goblin::elf32::program_header::SIZEOF_PHDR as u16,
            Self::Class64 => goblin::elf64::program_header::SIZEOF_PHDR as u16,
        }
    }

    pub fn shentsize(self) -> u16 {
        match self {
            Self::Class32 => goblin::elf32::section_header::SIZEOF_SHDR as u16,
            Self::Class64 => goblin::elf64::section_header::SIZEOF_SHDR as u16,
        }
    }

    /// The matching symbol value width, for `SymbolTable` instantiation.
    pub fn syment(self) -> u64 {
        match self {
            Self::Class32 => 16,
            Self::Class64 => 24,
        }
    }
}

trait NumCast: test_assembler::Num {
    fn to_u32(self) -> u32;
    fn to_u64(self) -> u64;
}

impl NumCast for u32 {
    fn to_u32(self) -> u32 {
        self
    }
    fn to_u64(self) -> u64 {
        self as u64
    }
}

impl NumCast for u64 {
    fn to_u32(self) -> u32 {
        self as u32
    }
    fn to_u64(self) -> u64 {
        self
    }
}

trait WithSize {
    fn append_word(self, is_64: bool, num: impl NumCast) -> Self;
    fn append_word_label(self, is_64: bool, label: &Label) -> Self;
}

impl WithSize for Section {
    fn append_word(self, is_64: bool, num: impl NumCast) -> Section {
        if is_64 {
            self.D64(num.to_u64())
        } else {
            self.D32(num.to_u32())
        }
    }

    fn append_word_label(self, is_64: bool, label: &Label) -> Section {
        if is_64 {
            self.D64(label)
        } else {
            self.D32(label)
        }
    }
}

/// Extra section-header fields beyond name/type/content.
#[derive(Default)]
pub struct SectionAttrs {
    pub flags: u64,
    pub addr: u64,
    pub link: u32,
    pub entsize: u64,
    pub offset: u64,
}

struct ElfSection {
    inner: Section,
    kind: u32,
    addr: u64,
    addr_label: Option<Label>,
    offset: u64,
    offset_label: Label,
    size: u64,
}

pub struct Elf {
    section: Section,
    class: ElfClass,
    program_header_label: Label,
    program_count: usize,
    program_count_label: Label,
    program_headers: Section,
    section_header_label: Label,
    section_count_label: Label,
    section_headers: Section,
    section_header_string_index: Label,
    section_header_strings: StringTable,
    sections: Vec<ElfSection>,
}

impl Elf {
    pub fn new(machine: u16, etype: u16, file_class: ElfClass, endian: Endian) -> Self {
        let mut section = Section::with_endian(endian);

        section = section
            .set_start_const(0)
            .append_bytes(header::ELFMAG)
            // ei_class
            .D8(file_class.class())
            // ei_data
            .D8(match endian {
                Endian::Little => header::ELFDATA2LSB,
                Endian::Big => header::ELFDATA2MSB,
            })
            // ei_version
            .D8(header::EV_CURRENT)
            // ei_osabi
            .D8(header::ELFOSABI_NONE)
            // ei_abiversion
            .D8(0)
            // ei_pad
            .append_repeated(0, 7);

        debug_assert_eq!(section.size() as usize, header::SIZEOF_IDENT);

        let program_header_label = Label::new();
        let section_header_label = Label::new();
        let program_count_label = Label::new();
        let section_count_label = Label::new();
        let section_header_string_index = Label::new();

        let is_64 = file_class.is_64();

        section = section
            // e_type
            .D16(etype)
            // e_machine
            .D16(machine)
            // e_version
            .D32(header::EV_CURRENT as u32)
            // e_entry
            .append_word(is_64, 0u32)
            // e_phoff
            .append_word_label(is_64, &program_header_label)
            // e_shoff
            .append_word_label(is_64, &section_header_label)
            // e_flags
            .D32(0)
            // e_ehsize
            .D16(file_class.ehsize())
            // e_phentsize
            .D16(file_class.phentsize())
            // e_phnum
            .D16(&program_count_label)
            // e_shentsize
            .D16(file_class.shentsize())
            // e_shnum
            .D16(&section_count_label)
            // e_shstrndx
            .D16(&section_header_string_index);

        let mut this = Self {
            section,
            class: file_class,
            program_header_label,
            program_count: 0,
            program_count_label,
            program_headers: Section::with_endian(endian),
            section_header_label,
            section_count_label,
            section_headers: Section::with_endian(endian),
            section_header_string_index,
            section_header_strings: StringTable::with_endian(endian),
            sections: Vec::new(),
        };

        // Empty section for SHN_UNDEF
        this.add_section("", Section::new(), section_header::SHT_NULL);
        this
    }

    /// Add the section to the section header table and append it to the
    /// file. Returns the index of the section in the section header table.
    pub fn add_section(&mut self, name: impl Into<String>, section: Section, kind: u32) -> usize {
        self.add_section_with_attrs(name, section, kind, SectionAttrs::default())
    }

    /// Like [`add_section`](Self::add_section) with explicit header fields.
    pub fn add_section_with_attrs(
        &mut self,
        name: impl Into<String>,
        section: Section,
        kind: u32,
        attrs: SectionAttrs,
    ) -> usize {
        self.push_section(name, section, kind, attrs, None)
    }

    /// Add a section whose `sh_addr` tracks its eventual file offset plus a
    /// load bias, modeling an image mapped wholesale at `bias`. Returns the
    /// section index and a label holding the section's virtual address,
    /// usable in dynamic entries and segment definitions.
    pub fn add_loaded_section(
        &mut self,
        name: impl Into<String>,
        section: Section,
        kind: u32,
        mut attrs: SectionAttrs,
        bias: u64,
    ) -> (usize, Label) {
        let offset_label = Label::new();
        let addr = &offset_label + bias as i64;
        attrs.addr = 0;
        let index = self.push_section_with_offset(name, section, kind, attrs, Some(addr.clone()), offset_label);
        (index, addr)
    }

    fn push_section(
        &mut self,
        name: impl Into<String>,
        section: Section,
        kind: u32,
        attrs: SectionAttrs,
        addr_label: Option<Label>,
    ) -> usize {
        self.push_section_with_offset(name, section, kind, attrs, addr_label, Label::new())
    }

    fn push_section_with_offset(
        &mut self,
        name: impl Into<String>,
        section: Section,
        kind: u32,
        attrs: SectionAttrs,
        addr_label: Option<Label>,
        offset_label: Label,
    ) -> usize {
        let string_label = self.section_header_strings.add(name);
        let size = section.size();
        let is_64 = self.class.is_64();

        self.section_headers = std::mem::take(&mut self.section_headers)
            // sh_name
            .D32(&string_label)
            // sh_type
            .D32(kind)
            // sh_flags
            .append_word(is_64, attrs.flags);
        self.section_headers = match &addr_label {
            // sh_addr
            Some(label) => std::mem::take(&mut self.section_headers).append_word_label(is_64, label),
            None => std::mem::take(&mut self.section_headers).append_word(is_64, attrs.addr),
        };
        self.section_headers = std::mem::take(&mut self.section_headers)
            // sh_offset
            .append_word_label(is_64, &offset_label)
            // sh_size
            .append_word(is_64, size)
            // sh_link
            .D32(attrs.link)
            // sh_info
            .D32(0)
            // sh_addralign
            .append_word(is_64, 0u32)
            // sh_entsize
            .append_word(is_64, attrs.entsize);

        self.sections.push(ElfSection {
            inner: section,
            kind,
            addr: attrs.addr,
            addr_label,
            offset: attrs.offset,
            offset_label,
            size,
        });
        self.sections.len() - 1
    }

    /// A label for the file offset the section will land at.
    pub fn section_offset(&self, index: usize) -> Label {
        self.sections[index].offset_label.clone()
    }

    /// Add a program header spanning the sections `start..=end`. The
    /// segment's vaddr is the first section's address.
    pub fn add_segment(&mut self, start: usize, end: usize, kind: u32, flags: u32) {
        self.program_count += 1;
        let is_64 = self.class.is_64();

        // p_type
        self.program_headers = std::mem::take(&mut self.program_headers).D32(kind);

        if is_64 {
            // p_flags
            self.program_headers = std::mem::take(&mut self.program_headers).D32(flags);
        }

        let mut file_size = 0;
        let mut mem_size = 0;
        for section in &self.sections[start..=end] {
            let mut size = section.size;
            if section.kind != section_header::SHT_NOBITS {
                size = (size + 3) & !3;
                file_size += size;
            }
            mem_size += size;
        }

        let section = &self.sections[start];

        // p_offset
        self.program_headers = std::mem::take(&mut self.program_headers)
            .append_word_label(is_64, &section.offset_label);
        // p_vaddr and p_paddr
        for _ in 0..2 {
            self.program_headers = match &section.addr_label {
                Some(label) => std::mem::take(&mut self.program_headers).append_word_label(is_64, label),
                None => std::mem::take(&mut self.program_headers).append_word(is_64, section.addr),
            };
        }
        self.program_headers = std::mem::take(&mut self.program_headers)
            // p_filesz
            .append_word(is_64, file_size)
            // p_memsz
            .append_word(is_64, mem_size);

        if !is_64 {
            // p_flags
            self.program_headers = std::mem::take(&mut self.program_headers).D32(flags);
        }

        // p_align
        self.program_headers = std::mem::take(&mut self.program_headers).append_word(is_64, 0u32);
    }

    /// Finalize the image.
    pub fn finish(mut self) -> Option<Vec<u8>> {
        self.section_header_string_index
            .set_const(self.sections.len() as u64);

        {
            let string_label = self.section_header_strings.add(".shstrtab");
            let strtab = std::mem::replace(&mut self.section_header_strings, StringTable::default());
            let inner = strtab.into_section();
            let size = inner.size();
            let is_64 = self.class.is_64();
            let offset_label = Label::new();

            self.section_headers = std::mem::take(&mut self.section_headers)
                .D32(&string_label)
                .D32(section_header::SHT_STRTAB);
            self.section_headers = std::mem::take(&mut self.section_headers).append_word(is_64, 0u32);
            self.section_headers = std::mem::take(&mut self.section_headers).append_word(is_64, 0u32);
            self.section_headers = std::mem::take(&mut self.section_headers)
                .append_word_label(is_64, &offset_label);
            self.section_headers = std::mem::take(&mut self.section_headers).append_word(is_64, size);
            self.section_headers = std::mem::take(&mut self.section_headers).D32(0).D32(0);
            self.section_headers = std::mem::take(&mut self.section_headers).append_word(is_64, 0u32);
            self.section_headers = std::mem::take(&mut self.section_headers).append_word(is_64, 0u32);

            self.sections.push(ElfSection {
                inner,
                kind: section_header::SHT_STRTAB,
                addr: 0,
                addr_label: None,
                offset: 0,
                offset_label,
                size,
            });
        }

        if self.program_count > 0 {
            self.section = std::mem::take(&mut self.section)
                .mark(&self.program_header_label)
                .append_section(std::mem::replace(&mut self.program_headers, Section::new()));
        } else {
            self.program_header_label.set_const(0);
        }

        let num_sections = self.sections.len() as u64;
        for esec in std::mem::take(&mut self.sections) {
            // NULL and NOBITS sections have no content in the file.
            if esec.kind == section_header::SHT_NULL {
                esec.offset_label.set_const(0);
            } else if esec.kind == section_header::SHT_NOBITS {
                esec.offset_label.set_const(esec.offset);
            } else {
                self.section = std::mem::take(&mut self.section)
                    .mark(&esec.offset_label)
                    .append_section(esec.inner)
                    .align(4);
            }
        }

        self.section_count_label.set_const(num_sections);
        self.program_count_label
            .set_const(self.program_count as u64);

        self.section = std::mem::take(&mut self.section)
            .mark(&self.section_header_label)
            .append_section(self.section_headers);

        self.section.get_contents()
    }
}
