use crate::{
    object::{CtfLocation, ElfMeta, FileId},
    Error, ProcessSymbols, Target, TargetState,
};
use goblin::container::{Container, Ctx};
use goblin::elf::{
    dynamic::{DT_HASH, DT_JMPREL, DT_STRSZ, DT_STRTAB, DT_SYMENT, DT_SYMTAB},
    header::{ELFCLASS32, ELFCLASS64, ELFDATA2LSB, ELFDATA2MSB, ELFMAG, ET_DYN, EV_CURRENT},
    program_header::{PF_W, PT_DYNAMIC, PT_LOAD},
    section_header::{SHT_DYNAMIC, SHT_DYNSYM, SHT_NOBITS, SHT_SYMTAB},
    sym::Symtab,
};
use scroll::Pread;
use std::io::Read;

/// Dynamic-section whole-file checksum, the drift detector.
pub(crate) const DT_CHECKSUM: u64 = 0x6fff_fdf8;
/// Auxiliary local-dynamic symbol table.
pub(crate) const SHT_SUNW_LDYNSYM: u32 = 0x6fff_fff3;

const PN_XNUM: u32 = 0xffff;
const EHDR32_SIZE: usize = goblin::elf32::header::SIZEOF_EHDR;
const EHDR64_SIZE: usize = goblin::elf64::header::SIZEOF_EHDR;
const SHDR32_SIZE: usize = goblin::elf32::section_header::SIZEOF_SHDR;
const SHDR64_SIZE: usize = goblin::elf64::section_header::SIZEOF_SHDR;
const PHDR32_SIZE: usize = goblin::elf32::program_header::SIZEOF_PHDR;
const PHDR64_SIZE: usize = goblin::elf64::program_header::SIZEOF_PHDR;

const PLT_SYMBOL: &str = "_PROCEDURE_LINKAGE_TABLE_";

/// Largest single target read the ingest will attempt.
const MAX_TARGET_READ: usize = 1 << 28;

fn host_data() -> u8 {
    if cfg!(target_endian = "little") {
        ELFDATA2LSB
    } else {
        ELFDATA2MSB
    }
}

fn host_endian() -> scroll::Endian {
    if cfg!(target_endian = "little") {
        scroll::LE
    } else {
        scroll::BE
    }
}

pub(crate) fn container_ctx(is64: bool) -> Ctx {
    Ctx::new(
        if is64 { Container::Big } else { Container::Little },
        host_endian(),
    )
}

/// Check the identification bytes: real ELF, a class we know, byte order
/// matching the host (no swapping here), current version.
pub(crate) fn validate_ident(buf: &[u8]) -> Result<u8, Error> {
    if buf.len() < goblin::elf::header::SIZEOF_IDENT || &buf[..4] != ELFMAG {
        return Err(Error::MalformedElf);
    }
    let class = buf[4];
    if class != ELFCLASS32 && class != ELFCLASS64 {
        return Err(Error::UnsupportedElf);
    }
    if buf[5] != host_data() || buf[6] != EV_CURRENT {
        return Err(Error::UnsupportedElf);
    }
    Ok(class)
}

/// The header fields the in-memory probes need, one shape for both classes.
pub(crate) struct RawEhdr {
    pub class: u8,
    pub etype: u16,
    pub machine: u16,
    pub phoff: u64,
    pub phentsize: u16,
    pub phnum: u32,
    pub shoff: u64,
    pub shentsize: u16,
}

impl RawEhdr {
    pub fn is64(&self) -> bool {
        self.class == ELFCLASS64
    }
}

pub(crate) struct RawPhdr {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
}

fn read_vec<T: Target>(target: &mut T, addr: u64, len: usize) -> Result<Vec<u8>, Error> {
    if len > MAX_TARGET_READ {
        return Err(Error::MalformedElf);
    }
    let mut buf = vec![0u8; len];
    target.read_mem(addr, &mut buf)?;
    Ok(buf)
}

/// Read and validate an ELF header out of target memory at `addr`,
/// resolving an extended program-header count through section header 0.
pub(crate) fn read_ehdr<T: Target>(target: &mut T, addr: u64) -> Result<RawEhdr, Error> {
    let mut ident = [0u8; goblin::elf::header::SIZEOF_IDENT];
    target.read_mem(addr, &mut ident)?;
    let class = validate_ident(&ident)?;
    let is64 = class == ELFCLASS64;
    let le = host_endian();

    let buf = read_vec(target, addr, if is64 { EHDR64_SIZE } else { EHDR32_SIZE })?;
    let bad = |_| Error::MalformedElf;
    let mut ehdr = RawEhdr {
        class,
        etype: buf.pread_with(16, le).map_err(bad)?,
        machine: buf.pread_with(18, le).map_err(bad)?,
        phoff: 0,
        phentsize: 0,
        phnum: 0,
        shoff: 0,
        shentsize: 0,
    };
    if is64 {
        ehdr.phoff = buf.pread_with::<u64>(32, le).map_err(bad)?;
        ehdr.shoff = buf.pread_with::<u64>(40, le).map_err(bad)?;
        ehdr.phentsize = buf.pread_with(54, le).map_err(bad)?;
        ehdr.phnum = buf.pread_with::<u16>(56, le).map_err(bad)? as u32;
        ehdr.shentsize = buf.pread_with(58, le).map_err(bad)?;
    } else {
        ehdr.phoff = buf.pread_with::<u32>(28, le).map_err(bad)? as u64;
        ehdr.shoff = buf.pread_with::<u32>(32, le).map_err(bad)? as u64;
        ehdr.phentsize = buf.pread_with(42, le).map_err(bad)?;
        ehdr.phnum = buf.pread_with::<u16>(44, le).map_err(bad)? as u32;
        ehdr.shentsize = buf.pread_with(46, le).map_err(bad)?;
    }

    // The real program-header count of a PN_XNUM file lives in section
    // header 0. Refuse files whose section headers are shorter than the
    // structure we are about to read.
    if ehdr.phnum == PN_XNUM {
        let shdr_size = if is64 { SHDR64_SIZE } else { SHDR32_SIZE };
        if ehdr.shoff == 0 || (ehdr.shentsize as usize) < shdr_size {
            return Err(Error::MalformedElf);
        }
        let shdr0 = read_vec(target, addr + ehdr.shoff, shdr_size)?;
        let info_off = if is64 { 44 } else { 28 };
        let sh_info = shdr0.pread_with::<u32>(info_off, le).map_err(bad)?;
        if sh_info != 0 {
            ehdr.phnum = sh_info;
        }
    }

    Ok(ehdr)
}

pub(crate) fn read_phdr<T: Target>(
    target: &mut T,
    ehdr: &RawEhdr,
    base: u64,
    i: u32,
) -> Result<RawPhdr, Error> {
    let size = if ehdr.is64() { PHDR64_SIZE } else { PHDR32_SIZE };
    if (ehdr.phentsize as usize) < size {
        return Err(Error::MalformedElf);
    }
    let at = base + ehdr.phoff + i as u64 * ehdr.phentsize as u64;
    let buf = read_vec(target, at, size)?;
    let le = host_endian();
    let bad = |_| Error::MalformedElf;

    Ok(if ehdr.is64() {
        RawPhdr {
            p_type: buf.pread_with(0, le).map_err(bad)?,
            p_flags: buf.pread_with(4, le).map_err(bad)?,
            p_offset: buf.pread_with(8, le).map_err(bad)?,
            p_vaddr: buf.pread_with(16, le).map_err(bad)?,
            p_filesz: buf.pread_with(32, le).map_err(bad)?,
            p_memsz: buf.pread_with(40, le).map_err(bad)?,
        }
    } else {
        RawPhdr {
            p_type: buf.pread_with(0, le).map_err(bad)?,
            p_offset: buf.pread_with::<u32>(4, le).map_err(bad)? as u64,
            p_vaddr: buf.pread_with::<u32>(8, le).map_err(bad)? as u64,
            p_filesz: buf.pread_with::<u32>(16, le).map_err(bad)? as u64,
            p_memsz: buf.pread_with::<u32>(20, le).map_err(bad)? as u64,
            p_flags: buf.pread_with(24, le).map_err(bad)?,
        }
    })
}

fn read_dynamic_phdr<T: Target>(
    target: &mut T,
    ehdr: &RawEhdr,
    base: u64,
) -> Result<RawPhdr, Error> {
    for i in 0..ehdr.phnum {
        let phdr = read_phdr(target, ehdr, base, i)?;
        if phdr.p_type == PT_DYNAMIC {
            return Ok(phdr);
        }
    }
    Err(Error::MalformedElf)
}

/// Decode a raw dynamic-section image into `(tag, value)` pairs, stopping
/// at `DT_NULL`.
pub(crate) fn dyn_entries(buf: &[u8], is64: bool) -> Vec<(u64, u64)> {
    let le = host_endian();
    let step = if is64 { 16 } else { 8 };
    let mut out = Vec::new();
    let mut off = 0;
    while off + step <= buf.len() {
        let (tag, val) = if is64 {
            (
                buf.pread_with::<u64>(off, le).unwrap_or(0),
                buf.pread_with::<u64>(off + 8, le).unwrap_or(0),
            )
        } else {
            (
                buf.pread_with::<u32>(off, le).unwrap_or(0) as u64,
                buf.pread_with::<u32>(off + 4, le).unwrap_or(0) as u64,
            )
        };
        if tag == 0 {
            break;
        }
        out.push((tag, val));
        off += step;
    }
    out
}

enum DiskVerdict {
    Ok,
    Differs,
    Unusable,
}

impl<T: Target> ProcessSymbols<T> {
    /// List the in-memory load segments of the object whose header lives at
    /// `ehdr_start`, as sorted `(start, end)` pairs, plus the start of the
    /// first writable one.
    pub(crate) fn section_addrs(&mut self, ehdr_start: u64) -> Option<(Vec<(u64, u64)>, Option<u64>)> {
        let ehdr = read_ehdr(&mut self.target, ehdr_start).ok()?;

        let mut addrs = Vec::new();
        let mut data_start = None;
        let mut unordered = false;
        let mut last = 0u64;

        for i in 0..ehdr.phnum {
            let phdr = read_phdr(&mut self.target, &ehdr, ehdr_start, i).ok()?;
            if phdr.p_type != PT_LOAD || phdr.p_memsz == 0 {
                continue;
            }
            let mut addr = phdr.p_vaddr;
            if ehdr.etype == ET_DYN {
                addr = addr.wrapping_add(ehdr_start);
            }
            if last > addr {
                unordered = true;
            }
            last = addr.wrapping_add(phdr.p_memsz);
            addrs.push((addr, last));
            if data_start.is_none() && phdr.p_flags & PF_W != 0 {
                data_start = Some(addr);
            }
        }

        if unordered {
            addrs.sort_unstable();
        }
        Some((addrs, data_start))
    }

    /// Compare the `DT_CHECKSUM` of the on-disk file with the one in the
    /// loaded image. Absent checksums report a match, the legacy-lenient
    /// behavior; only a provable mismatch triggers synthesis.
    fn file_differs(&mut self, fid: FileId, disk: &goblin::elf::Elf<'_>, disk_buf: &[u8]) -> bool {
        let primary = match self.file(fid).primary {
            Some(p) => p,
            None => return false,
        };

        let mut disk_cksum = None;
        for sh in &disk.section_headers {
            if sh.sh_type != SHT_DYNAMIC {
                continue;
            }
            if let Some(data) = disk_buf.get(sh.sh_offset as usize..)
                .and_then(|t| t.get(..sh.sh_size as usize))
            {
                disk_cksum = dyn_entries(data, disk.is_64)
                    .into_iter()
                    .find(|&(tag, _)| tag == DT_CHECKSUM)
                    .map(|(_, val)| val);
            }
            break;
        }
        let disk_cksum = match disk_cksum {
            Some(c) => c,
            None => return false,
        };
        debug_print!("elf cksum value is {:#x}", disk_cksum);

        let addr = self.mappings[primary].pmap.vaddr;
        let mem_cksum = (|| -> Result<Option<u64>, Error> {
            let ehdr = read_ehdr(&mut self.target, addr)?;
            let phdr = read_dynamic_phdr(&mut self.target, &ehdr, addr)?;
            let mut vaddr = phdr.p_vaddr;
            if ehdr.etype == ET_DYN {
                vaddr = vaddr.wrapping_add(addr);
            }
            let dynbuf = read_vec(&mut self.target, vaddr, phdr.p_filesz as usize)?;
            Ok(dyn_entries(&dynbuf, ehdr.is64())
                .into_iter()
                .find(|&(tag, _)| tag == DT_CHECKSUM)
                .map(|(_, val)| val))
        })();

        match mem_cksum {
            Ok(Some(mem)) => {
                debug_print!("image cksum value is {:#x}", mem);
                mem != disk_cksum
            }
            _ => false,
        }
    }

    /// Construct a minimal ELF image from the loaded object: its `.dynsym`
    /// and `.dynstr` pulled out of target memory, the raw `.dynamic`
    /// segment, and a `.plt` section header. The result goes back through
    /// the ordinary reader so everything downstream stays uniform.
    fn fake_elf(&mut self, fid: FileId) -> Result<Vec<u8>, Error> {
        let primary = self.file(fid).primary.ok_or(Error::MalformedElf)?;
        let base = self.mappings[primary].pmap.vaddr;

        let ehdr = read_ehdr(&mut self.target, base)?;
        let phdr = read_dynamic_phdr(&mut self.target, &ehdr, base)?;
        let is64 = ehdr.is64();

        let mut dvaddr = phdr.p_vaddr;
        if ehdr.etype == ET_DYN {
            dvaddr = dvaddr.wrapping_add(base);
        }
        let dynbuf = read_vec(&mut self.target, dvaddr, phdr.p_filesz as usize)?;
        let entries = dyn_entries(&dynbuf, is64);
        let find = |tag: u64| entries.iter().find(|&&(t, _)| t == tag).map(|&(_, v)| v);

        let symtab = find(DT_SYMTAB).ok_or(Error::MalformedElf)?;
        let strtab = find(DT_STRTAB).ok_or(Error::MalformedElf)?;
        let strsz = find(DT_STRSZ).ok_or(Error::MalformedElf)?;
        let syment = find(DT_SYMENT).unwrap_or(if is64 { 24 } else { 16 });
        if syment == 0 || strsz == 0 {
            return Err(Error::MalformedElf);
        }

        // The dynamic linker may have relocated the pointer entries of a
        // shared object in place; values still below the base have not been.
        let adjust = |v: u64| {
            if ehdr.etype == ET_DYN && v < base {
                v.wrapping_add(base)
            } else {
                v
            }
        };
        let unadjust = |v: u64| {
            if ehdr.etype == ET_DYN && v >= base {
                v - base
            } else {
                v
            }
        };

        // Symbol count: the hash table knows it exactly; otherwise lean on
        // the usual layout of the string table directly behind the symbols.
        let count = match find(DT_HASH) {
            Some(hash) => {
                let words = read_vec(&mut self.target, adjust(hash), 8)?;
                words
                    .pread_with::<u32>(4, host_endian())
                    .map_err(|_| Error::MalformedElf)? as u64
            }
            None if strtab > symtab => (strtab - symtab) / syment,
            None => return Err(Error::MalformedElf),
        };
        if count == 0 {
            return Err(Error::MalformedElf);
        }
        let symsize = count
            .checked_mul(syment)
            .filter(|&n| n as usize <= MAX_TARGET_READ)
            .ok_or(Error::MalformedElf)?;

        let symdata = read_vec(&mut self.target, adjust(symtab), symsize as usize)?;
        let strdata = read_vec(&mut self.target, adjust(strtab), strsz as usize)?;

        // The PLT's address is only recoverable through its reserved symbol.
        let plt_addr = Symtab::parse(&symdata, 0, count as usize, container_ctx(is64))
            .ok()
            .and_then(|st| {
                st.iter()
                    .find(|s| crate::symtab::str_at(&strdata, s.st_name) == PLT_SYMBOL.as_bytes())
                    .map(|s| s.st_value)
            })
            .unwrap_or(0);

        Ok(assemble_fake_image(&FakeImage {
            ehdr: &ehdr,
            dynsym_addr: unadjust(symtab),
            syment,
            symdata: &symdata,
            dynstr_addr: unadjust(strtab),
            strdata: &strdata,
            dynamic_addr: phdr.p_vaddr,
            dyndata: &dynbuf,
            plt_addr,
        }))
    }

    /// Open, verify, and index the object file backing `fid`, falling back
    /// to an image synthesized from target memory when the file is missing,
    /// unreadable, or has drifted from what is loaded. Runs at most once
    /// per object; a failure leaves the object permanently symbol-less.
    pub(crate) fn build_file_symtab(&mut self, fid: FileId) {
        if self.file(fid).init {
            return;
        }
        self.file_mut(fid).init = true;

        // Live targets can hand us a path for the mapname; otherwise only
        // the recorded names can guide us.
        let objectfile = if self.target.state() == TargetState::Live {
            self.target.object_path(&self.file(fid).pname)
        } else {
            let f = self.file(fid);
            std::path::PathBuf::from(f.lname.clone().unwrap_or_else(|| f.pname.clone()))
        };
        debug_print!("processing ELF file {}", objectfile.display());

        let mut fd = None;
        let mut disk_buf = None;
        match std::fs::File::open(&objectfile) {
            Ok(mut file) => {
                let mut buf = Vec::new();
                if file.read_to_end(&mut buf).is_ok() && validate_ident(&buf).is_ok() {
                    disk_buf = Some(buf);
                    fd = Some(file);
                } else {
                    debug_print!("{} is not a usable ELF file", objectfile.display());
                }
            }
            Err(e) => {
                debug_print!("failed to open {}: {}", objectfile.display(), e);
            }
        }

        let mut synthetic = false;
        let image = match disk_buf {
            Some(buf) => {
                let verdict = match goblin::elf::Elf::parse(&buf) {
                    Ok(elf) => {
                        if self.file_differs(fid, &elf, &buf) {
                            DiskVerdict::Differs
                        } else {
                            DiskVerdict::Ok
                        }
                    }
                    Err(e) => {
                        debug_print!("failed to process {}: {}", objectfile.display(), e);
                        DiskVerdict::Unusable
                    }
                };
                match verdict {
                    DiskVerdict::Ok => buf,
                    DiskVerdict::Differs => {
                        debug_print!(
                            "ELF file {} doesn't match in-core image",
                            objectfile.display()
                        );
                        match self.fake_elf(fid) {
                            Ok(fake) => {
                                debug_print!("switched to faked-up ELF file");
                                synthetic = true;
                                fake
                            }
                            // Fall back to the mismatched file: inaccurate
                            // symbols beat no symbols.
                            Err(_) => buf,
                        }
                    }
                    DiskVerdict::Unusable => match self.fake_elf(fid) {
                        Ok(fake) => {
                            synthetic = true;
                            fake
                        }
                        Err(e) => {
                            debug_print!("failed to fake up ELF file: {}", e);
                            return;
                        }
                    },
                }
            }
            None => match self.fake_elf(fid) {
                Ok(fake) => {
                    synthetic = true;
                    fake
                }
                Err(e) => {
                    debug_print!("failed to fake up ELF file: {}", e);
                    return;
                }
            },
        };

        self.file_mut(fid).fd = fd;
        if self.ingest_image(fid, &image, synthetic).is_err() {
            let f = self.file_mut(fid);
            f.elf = None;
            f.synthetic = false;
            f.fd = None;
        }
    }

    fn ingest_image(&mut self, fid: FileId, image: &[u8], synthetic: bool) -> Result<(), ()> {
        validate_ident(image).map_err(|_| ())?;
        let elf = goblin::elf::Elf::parse(image).map_err(|_| ())?;
        let ctx = container_ctx(elf.is_64);
        let shnum = elf.section_headers.len();

        let mut names = Vec::with_capacity(shnum);
        for sh in &elf.section_headers {
            match elf.shdr_strtab.get(sh.sh_name) {
                Some(Ok(name)) => names.push(name.to_string()),
                _ => return Err(()), // corrupt section name
            }
        }

        let data = |sh: &goblin::elf::SectionHeader| -> Result<&[u8], ()> {
            if sh.sh_type == SHT_NOBITS {
                return Ok(&[]);
            }
            image
                .get(sh.sh_offset as usize..)
                .and_then(|t| t.get(..sh.sh_size as usize))
                .ok_or(())
        };

        let parse_syms = |sh: &goblin::elf::SectionHeader| -> Result<(Vec<goblin::elf::sym::Sym>, u64), ()> {
            let entsize = sh.sh_entsize;
            if entsize == 0 || sh.sh_size > image.len() as u64 {
                return Err(());
            }
            let count = (sh.sh_size / entsize) as usize;
            let syms = Symtab::parse(image, sh.sh_offset as usize, count, ctx)
                .map_err(|_| ())?
                .iter()
                .collect();
            Ok((syms, entsize))
        };

        let mut dyn_idx = None;
        let mut plt_idx = None;
        let mut ctf_idx = None;

        for (i, sh) in elf.section_headers.iter().enumerate().skip(1) {
            match sh.sh_type {
                SHT_SYMTAB | SHT_DYNSYM => {
                    let link = sh.sh_link as usize;
                    if link >= shnum {
                        return Err(());
                    }
                    let table = if sh.sh_type == SHT_SYMTAB {
                        &self.file(fid).symtab
                    } else {
                        &self.file(fid).dynsym
                    };
                    if table.has_primary() {
                        debug_print!("symbol table already there for {}", names[i]);
                        continue;
                    }
                    let (syms, entsize) = parse_syms(sh)?;
                    let strs = data(&elf.section_headers[link])?.to_vec();
                    let raw = data(sh)?.to_vec();
                    let table = if sh.sh_type == SHT_SYMTAB {
                        &mut self.file_mut(fid).symtab
                    } else {
                        &mut self.file_mut(fid).dynsym
                    };
                    table.set_primary(syms, strs, raw, entsize);
                }
                SHT_SUNW_LDYNSYM => {
                    if !self.file(fid).dynsym.has_aux() {
                        let (syms, _) = parse_syms(sh)?;
                        self.file_mut(fid).dynsym.set_aux(syms);
                    }
                }
                SHT_DYNAMIC => dyn_idx = Some(i),
                _ => {
                    if names[i] == ".plt" {
                        plt_idx = Some(i);
                    } else if names[i] == ".SUNW_ctf" {
                        // Skip over bogus CTF sections so they don't come
                        // back to haunt us later.
                        let link = sh.sh_link as usize;
                        if link == 0
                            || link >= shnum
                            || !matches!(
                                elf.section_headers[link].sh_type,
                                SHT_SYMTAB | SHT_DYNSYM
                            )
                        {
                            debug_print!("bad sh_link {} for CTF", link);
                            continue;
                        }
                        ctf_idx = Some(i);
                    }
                }
            }
        }

        // Sorted views have to exist before any lookup below.
        let sort = !self.no_sort;
        self.file_mut(fid).symtab.optimize(sort);
        self.file_mut(fid).dynsym.optimize(sort);

        let etype = elf.header.e_type;

        // The slide every st_value needs before librtld_db has weighed in.
        if etype == ET_DYN {
            if let Some(p) = self.file(fid).primary {
                let pm = &self.mappings[p].pmap;
                let dyn_base = pm.vaddr.wrapping_sub(pm.offset);
                self.file_mut(fid).dyn_base = dyn_base;
            }
        }

        if let Some(ci) = ctf_idx {
            let sh = &elf.section_headers[ci];
            let linked_dynsym = elf.section_headers[sh.sh_link as usize].sh_type == SHT_DYNSYM;
            self.file_mut(fid).ctf = Some(CtfLocation {
                offset: sh.sh_offset,
                size: sh.sh_size,
                dynsym: linked_dynsym,
            });
        }

        {
            let f = self.file_mut(fid);
            f.elf = Some(ElfMeta {
                class: elf.header.e_ident[4],
                etype,
                section_names: names,
            });
            f.synthetic = synthetic;
        }

        if self.file(fid).lo.is_none() {
            return Ok(()); // nothing else to do without load-object info
        }

        // The agent knows the true base of a shared object; trust it over
        // the mapping arithmetic.
        let lo_base = self.file(fid).lo.as_ref().unwrap().base;
        if etype == ET_DYN && lo_base != self.file(fid).dyn_base {
            debug_print!("resetting dyn base to {:#x}", lo_base);
            self.file_mut(fid).dyn_base = lo_base;
        }
        let dyn_base = self.file(fid).dyn_base;

        let plt_shdr = plt_idx.map(|i| elf.section_headers[i].clone());
        let plt = match self.file(fid).dynsym.by_name(PLT_SYMBOL) {
            Some((s, _)) => Some((
                s.st_value.wrapping_add(dyn_base),
                plt_shdr.as_ref().map_or(0, |sh| sh.sh_size),
            )),
            // No reserved symbol; the section's own virtual address is the
            // PLT base once the slide is applied.
            None => plt_shdr
                .as_ref()
                .map(|sh| (sh.sh_addr.wrapping_add(dyn_base), sh.sh_size)),
        };
        if let Some((plt_base, plt_size)) = plt {
            debug_print!("PLT found at {:#x}, size = {}", plt_base, plt_size);
            let f = self.file_mut(fid);
            f.plt_base = plt_base;
            f.plt_size = plt_size;
            let lo = f.lo.as_mut().unwrap();
            lo.plt_base = plt_base;
            lo.plt_size = plt_size;
        }

        if let Some(di) = dyn_idx {
            let dyndata = data(&elf.section_headers[di])?;
            if let Some((_, val)) = dyn_entries(dyndata, elf.is_64)
                .into_iter()
                .find(|&(tag, _)| tag == DT_JMPREL)
            {
                let jmp_rel = val.wrapping_add(dyn_base);
                debug_print!("DT_JMPREL is {:#x}", jmp_rel);
                self.file_mut(fid).jmp_rel = jmp_rel;
            }
        }

        Ok(())
    }
}

struct FakeImage<'a> {
    ehdr: &'a RawEhdr,
    dynsym_addr: u64,
    syment: u64,
    symdata: &'a [u8],
    dynstr_addr: u64,
    strdata: &'a [u8],
    dynamic_addr: u64,
    dyndata: &'a [u8],
    plt_addr: u64,
}

struct Emit {
    buf: Vec<u8>,
    is64: bool,
}

impl Emit {
    fn u8v(&mut self, v: u8) {
        self.buf.push(v);
    }
    fn u16v(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }
    fn u32v(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }
    fn u64v(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }
    fn word(&mut self, v: u64) {
        if self.is64 {
            self.u64v(v);
        } else {
            self.u32v(v as u32);
        }
    }
    fn pad_to(&mut self, off: usize) {
        while self.buf.len() < off {
            self.buf.push(0);
        }
    }
    fn shdr(
        &mut self,
        name: u32,
        sh_type: u32,
        flags: u64,
        addr: u64,
        offset: u64,
        size: u64,
        link: u32,
        entsize: u64,
    ) {
        self.u32v(name);
        self.u32v(sh_type);
        self.word(flags);
        self.word(addr);
        self.word(offset);
        self.word(size);
        self.u32v(link);
        self.u32v(0); // sh_info
        self.word(8); // sh_addralign
        self.word(entsize);
    }
}

/// Lay the recovered pieces out as a self-contained ELF image:
/// header, .dynsym, .dynstr, .dynamic, .shstrtab, section headers.
fn assemble_fake_image(img: &FakeImage<'_>) -> Vec<u8> {
    use goblin::elf::section_header::{SHT_DYNAMIC as DYN, SHT_DYNSYM as DSYM, SHT_PROGBITS, SHT_STRTAB};

    let is64 = img.ehdr.is64();
    let ehsize = if is64 { EHDR64_SIZE } else { EHDR32_SIZE };
    let shentsize = if is64 { SHDR64_SIZE } else { SHDR32_SIZE };

    const SHSTRTAB: &[u8] = b"\0.dynsym\0.dynstr\0.dynamic\0.plt\0.shstrtab\0";
    const NAME_DYNSYM: u32 = 1;
    const NAME_DYNSTR: u32 = 9;
    const NAME_DYNAMIC: u32 = 17;
    const NAME_PLT: u32 = 26;
    const NAME_SHSTRTAB: u32 = 31;

    let align8 = |v: usize| (v + 7) & !7;
    let off_dynsym = align8(ehsize);
    let off_dynstr = off_dynsym + img.symdata.len();
    let off_dynamic = align8(off_dynstr + img.strdata.len());
    let off_shstr = off_dynamic + img.dyndata.len();
    let off_shdrs = align8(off_shstr + SHSTRTAB.len());

    let mut e = Emit {
        buf: Vec::with_capacity(off_shdrs + shentsize * 6),
        is64,
    };

    e.buf.extend_from_slice(ELFMAG);
    e.u8v(img.ehdr.class);
    e.u8v(host_data());
    e.u8v(EV_CURRENT);
    e.buf.extend_from_slice(&[0; 9]); // abi + padding
    e.u16v(img.ehdr.etype);
    e.u16v(img.ehdr.machine);
    e.u32v(1); // e_version
    e.word(0); // e_entry
    e.word(0); // e_phoff
    e.word(off_shdrs as u64); // e_shoff
    e.u32v(0); // e_flags
    e.u16v(ehsize as u16);
    e.u16v(0); // e_phentsize
    e.u16v(0); // e_phnum
    e.u16v(shentsize as u16);
    e.u16v(6); // e_shnum
    e.u16v(5); // e_shstrndx

    e.pad_to(off_dynsym);
    e.buf.extend_from_slice(img.symdata);
    e.buf.extend_from_slice(img.strdata);
    e.pad_to(off_dynamic);
    e.buf.extend_from_slice(img.dyndata);
    e.buf.extend_from_slice(SHSTRTAB);
    e.pad_to(off_shdrs);

    let dynentsize = if is64 { 16 } else { 8 };
    e.shdr(0, 0, 0, 0, 0, 0, 0, 0);
    e.shdr(
        NAME_DYNSYM,
        DSYM,
        2, // SHF_ALLOC
        img.dynsym_addr,
        off_dynsym as u64,
        img.symdata.len() as u64,
        2,
        img.syment,
    );
    e.shdr(
        NAME_DYNSTR,
        SHT_STRTAB,
        2,
        img.dynstr_addr,
        off_dynstr as u64,
        img.strdata.len() as u64,
        0,
        0,
    );
    e.shdr(
        NAME_DYNAMIC,
        DYN,
        3,
        img.dynamic_addr,
        off_dynamic as u64,
        img.dyndata.len() as u64,
        2,
        dynentsize,
    );
    e.shdr(NAME_PLT, SHT_PROGBITS, 6, img.plt_addr, 0, 0, 0, 0);
    e.shdr(
        NAME_SHSTRTAB,
        SHT_STRTAB,
        0,
        0,
        off_shstr as u64,
        SHSTRTAB.len() as u64,
        0,
        0,
    );

    e.buf
}
