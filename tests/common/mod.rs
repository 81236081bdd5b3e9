//! A scriptable stand-in for a live process: an address space assembled
//! from synthesized ELF images, a mapping table, an aux vector, and
//! optional dynamic-linker records.

#![allow(dead_code)]

use goblin::elf::{dynamic, header, program_header, section_header, sym};
use proc_symtab::{Error, LoadObject, MapFlags, MapRecord, Target, TargetState};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use synth_elf::{
    DynamicSection, Elf, ElfClass, Endian, Section, SectionAttrs, StInfo, StringTable, SymbolTable,
};

pub const PAGE: u64 = 0x1000;

pub struct FakeTarget {
    pub state: TargetState,
    pub maps: Vec<MapRecord>,
    pub mem: Vec<(u64, Vec<u8>)>,
    pub auxv: Vec<u8>,
    /// `None` means "no linker agent for this target".
    pub loadobjs: Option<Vec<LoadObject>>,
    pub objdir: HashMap<String, PathBuf>,
    pub exe: Option<String>,
}

impl Default for FakeTarget {
    fn default() -> Self {
        Self {
            state: TargetState::Live,
            maps: Vec::new(),
            mem: Vec::new(),
            auxv: Vec::new(),
            loadobjs: None,
            objdir: HashMap::new(),
            exe: None,
        }
    }
}

impl FakeTarget {
    pub fn add_mapping(&mut self, vaddr: u64, size: u64, offset: u64, flags: MapFlags, name: &str) {
        self.maps.push(MapRecord {
            vaddr,
            size,
            offset,
            flags,
            pagesize: PAGE,
            shmid: -1,
            mapname: name.to_string(),
        });
        self.maps.sort_by_key(|m| m.vaddr);
    }

    pub fn set_auxv(&mut self, entries: &[(u64, u64)]) {
        self.auxv.clear();
        for &(t, v) in entries {
            self.auxv.extend_from_slice(&(t as usize).to_ne_bytes());
            self.auxv.extend_from_slice(&(v as usize).to_ne_bytes());
        }
        self.auxv.extend_from_slice(&0usize.to_ne_bytes());
        self.auxv.extend_from_slice(&0usize.to_ne_bytes());
    }
}

impl Target for FakeTarget {
    fn state(&self) -> TargetState {
        self.state
    }

    fn read_mem(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), Error> {
        let len = buf.len() as u64;
        for (base, bytes) in &self.mem {
            if addr >= *base && addr + len <= *base + bytes.len() as u64 {
                let start = (addr - base) as usize;
                buf.copy_from_slice(&bytes[start..start + buf.len()]);
                return Ok(());
            }
        }
        Err(Error::TargetUnreadable(addr))
    }

    fn mapping_snapshot(&mut self) -> Result<Vec<MapRecord>, Error> {
        Ok(self.maps.clone())
    }

    fn read_auxv(&mut self) -> Result<Vec<u8>, Error> {
        if self.auxv.is_empty() {
            return Err(Error::NotLive);
        }
        Ok(self.auxv.clone())
    }

    fn exe_path(&mut self) -> Option<String> {
        self.exe.clone()
    }

    fn object_path(&self, mapname: &str) -> PathBuf {
        self.objdir
            .get(mapname)
            .cloned()
            .unwrap_or_else(|| PathBuf::from(mapname))
    }

    fn load_objects(&mut self, f: &mut dyn FnMut(&LoadObject)) -> Result<usize, Error> {
        match &self.loadobjs {
            Some(records) => {
                for lop in records {
                    f(lop);
                }
                Ok(records.len())
            }
            None => Err(Error::AgentUnavailable),
        }
    }
}

#[derive(Clone, Copy)]
pub struct SymSpec {
    pub name: &'static str,
    pub value: u64,
    pub size: u64,
    pub bind: u8,
    pub kind: u8,
    pub shndx: u16,
}

pub fn func(name: &'static str, value: u64, size: u64) -> SymSpec {
    SymSpec {
        name,
        value,
        size,
        bind: sym::STB_GLOBAL,
        kind: sym::STT_FUNC,
        shndx: 1,
    }
}

pub fn object(name: &'static str, value: u64, size: u64) -> SymSpec {
    SymSpec {
        kind: sym::STT_OBJECT,
        ..func(name, value, size)
    }
}

pub fn local(spec: SymSpec) -> SymSpec {
    SymSpec {
        bind: sym::STB_LOCAL,
        ..spec
    }
}

/// An undefined reference, e.g. a PLT placeholder in the executable.
pub fn undef(name: &'static str) -> SymSpec {
    SymSpec {
        name,
        value: 0,
        size: 0,
        bind: sym::STB_GLOBAL,
        kind: sym::STT_FUNC,
        shndx: section_header::SHN_UNDEF as u16,
    }
}

pub const SHT_SUNW_LDYNSYM: u32 = 0x6fff_fff3;
pub const DT_CHECKSUM: u64 = 0x6fff_fdf8;

/// Describes one synthesized 64-bit object; `build` lays it out.
pub struct ObjImage {
    pub etype: u16,
    /// Virtual address the section layout is based at: the load address for
    /// `ET_EXEC` images, zero for `ET_DYN`.
    pub bias: u64,
    pub dynsym: Vec<SymSpec>,
    pub ldynsym: Vec<SymSpec>,
    pub symtab: Vec<SymSpec>,
    pub checksum: Option<u64>,
    pub hash: bool,
    /// Add a fixed-address `.plt` section: (vaddr, content size).
    pub plt: Option<(u64, u64)>,
    pub ctf: Option<Vec<u8>>,
    /// Add a writable data segment at a fixed address: (vaddr, size).
    pub data_seg: Option<(u64, u64)>,
}

impl Default for ObjImage {
    fn default() -> Self {
        Self {
            etype: header::ET_DYN,
            bias: 0,
            dynsym: Vec::new(),
            ldynsym: Vec::new(),
            symtab: Vec::new(),
            checksum: None,
            hash: true,
            plt: None,
            ctf: None,
            data_seg: None,
        }
    }
}

impl ObjImage {
    pub fn build(&self) -> Vec<u8> {
        let endian = Endian::Little;
        let class = ElfClass::Class64;
        let mut elf = Elf::new(header::EM_X86_64, self.etype, class, endian);

        let mut dynstr = StringTable::with_endian(endian);
        let mut dynsym = SymbolTable::<u64>::with_endian(endian);
        for s in &self.dynsym {
            dynsym.add_symbol(
                &mut dynstr,
                s.name,
                s.value,
                s.size,
                StInfo {
                    bind: s.bind,
                    kind: s.kind,
                },
                s.shndx,
            );
        }
        let dynsym_count = dynsym.count();

        let mut strsz = 1u64;
        {
            let mut seen = std::collections::HashSet::new();
            for s in self.dynsym.iter().chain(&self.ldynsym) {
                if seen.insert(s.name) {
                    strsz += s.name.len() as u64 + 1;
                }
            }
        }

        // Fixed layout: 0 null, 1 .dynsym, 2 .dynstr, then the optional
        // sections in declaration order.
        let (dynsym_idx, dynsym_addr) = elf.add_loaded_section(
            ".dynsym",
            dynsym.into_section(),
            section_header::SHT_DYNSYM,
            SectionAttrs {
                flags: u64::from(section_header::SHF_ALLOC),
                entsize: class.syment(),
                link: 2,
                ..SectionAttrs::default()
            },
            self.bias,
        );
        assert_eq!(dynsym_idx, 1);

        let mut ldynsym_syms = SymbolTable::<u64>::with_endian(endian);
        for s in &self.ldynsym {
            ldynsym_syms.add_symbol(
                &mut dynstr,
                s.name,
                s.value,
                s.size,
                StInfo {
                    bind: s.bind,
                    kind: s.kind,
                },
                s.shndx,
            );
        }

        let (_, dynstr_addr) = elf.add_loaded_section(
            ".dynstr",
            dynstr.into_section(),
            section_header::SHT_STRTAB,
            SectionAttrs {
                flags: u64::from(section_header::SHF_ALLOC),
                ..SectionAttrs::default()
            },
            self.bias,
        );

        if !self.ldynsym.is_empty() {
            elf.add_loaded_section(
                ".SUNW_ldynsym",
                ldynsym_syms.into_section(),
                SHT_SUNW_LDYNSYM,
                SectionAttrs {
                    flags: u64::from(section_header::SHF_ALLOC),
                    entsize: class.syment(),
                    link: 2,
                    ..SectionAttrs::default()
                },
                self.bias,
            );
        }

        let hash_addr = if self.hash {
            let mut hash = Section::with_endian(endian).D32(1).D32(dynsym_count as u32).D32(0);
            for _ in 0..dynsym_count {
                hash = hash.D32(0);
            }
            let (_, addr) = elf.add_loaded_section(
                ".hash",
                hash,
                section_header::SHT_HASH,
                SectionAttrs {
                    flags: u64::from(section_header::SHF_ALLOC),
                    entsize: 4,
                    link: 1,
                    ..SectionAttrs::default()
                },
                self.bias,
            );
            Some(addr)
        } else {
            None
        };

        if !self.symtab.is_empty() {
            // The builder writes headers eagerly, so name the string table
            // by the index it is about to get: one past .symtab's own.
            let mut next_idx = 3;
            if !self.ldynsym.is_empty() {
                next_idx += 1;
            }
            if self.hash {
                next_idx += 1;
            }
            let mut strtab = StringTable::with_endian(endian);
            let mut symtab = SymbolTable::<u64>::with_endian(endian);
            for s in &self.symtab {
                symtab.add_symbol(
                    &mut strtab,
                    s.name,
                    s.value,
                    s.size,
                    StInfo {
                        bind: s.bind,
                        kind: s.kind,
                    },
                    s.shndx,
                );
            }
            let symtab_idx = elf.add_section_with_attrs(
                ".symtab",
                symtab.into_section(),
                section_header::SHT_SYMTAB,
                SectionAttrs {
                    entsize: class.syment(),
                    link: next_idx + 1,
                    ..SectionAttrs::default()
                },
            );
            assert_eq!(symtab_idx as u32, next_idx);
            elf.add_section(".strtab", strtab.into_section(), section_header::SHT_STRTAB);
        }

        let mut dyns = DynamicSection::with_endian(endian, class);
        dyns.entry_label(dynamic::DT_SYMTAB, &dynsym_addr)
            .entry_label(dynamic::DT_STRTAB, &dynstr_addr)
            .entry(dynamic::DT_SYMENT, class.syment())
            .entry(dynamic::DT_STRSZ, strsz);
        if let Some(addr) = &hash_addr {
            dyns.entry_label(dynamic::DT_HASH, addr);
        }
        if let Some(cksum) = self.checksum {
            dyns.entry(DT_CHECKSUM, cksum);
        }
        let entsize = dyns.entsize();
        let (dynamic_idx, _) = elf.add_loaded_section(
            ".dynamic",
            dyns.into_section(),
            section_header::SHT_DYNAMIC,
            SectionAttrs {
                flags: 3,
                entsize,
                link: 2,
                ..SectionAttrs::default()
            },
            self.bias,
        );

        if let Some((addr, size)) = self.plt {
            let plt = Section::with_endian(endian).append_repeated(0x90, size as usize);
            elf.add_section_with_attrs(
                ".plt",
                plt,
                section_header::SHT_PROGBITS,
                SectionAttrs {
                    flags: 6,
                    addr,
                    ..SectionAttrs::default()
                },
            );
        }

        if let Some(ctf) = &self.ctf {
            let sec = Section::with_endian(endian).append_bytes(ctf);
            elf.add_section_with_attrs(
                ".SUNW_ctf",
                sec,
                section_header::SHT_PROGBITS,
                SectionAttrs {
                    link: 1,
                    ..SectionAttrs::default()
                },
            );
        }

        elf.add_segment(1, dynamic_idx, program_header::PT_LOAD, 5);
        elf.add_segment(dynamic_idx, dynamic_idx, program_header::PT_DYNAMIC, 6);

        if let Some((addr, size)) = self.data_seg {
            let data = Section::with_endian(endian).append_repeated(0, size as usize);
            let idx = elf.add_section_with_attrs(
                ".data",
                data,
                section_header::SHT_PROGBITS,
                SectionAttrs {
                    flags: 3,
                    addr,
                    ..SectionAttrs::default()
                },
            );
            elf.add_segment(idx, idx, program_header::PT_LOAD, 6);
        }

        elf.finish().unwrap()
    }
}

/// Round a length up to whole pages.
pub fn pages(len: usize) -> u64 {
    ((len as u64) + PAGE - 1) & !(PAGE - 1)
}

/// Install an image into the fake address space: write it to `dir`, map it
/// read-execute at `base`, and make its bytes readable there.
pub fn load_into(
    target: &mut FakeTarget,
    base: u64,
    image: Vec<u8>,
    mapname: &str,
    dir: &Path,
) -> PathBuf {
    let fname = mapname.rsplit('/').next().unwrap_or(mapname);
    let path = dir.join(fname);
    std::fs::write(&path, &image).unwrap();

    target.add_mapping(
        base,
        pages(image.len()),
        0,
        MapFlags::READ | MapFlags::EXEC,
        mapname,
    );
    target.mem.push((base, image));
    target.objdir.insert(mapname.to_string(), path.clone());
    path
}

pub fn loadobj(base: u64, end: u64, name: &str, lmid: i64) -> LoadObject {
    LoadObject {
        base,
        end,
        name: Some(name.to_string()),
        lmid,
        ..LoadObject::default()
    }
}
