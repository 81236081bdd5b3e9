use crate::{
    maps::{MapFlags, MapRecord},
    symtab::SymTable,
    Lmid, ObjSelector, ProcessSymbols, Target, LM_ID_BASE, PR_LMID_EVERY,
};

/// One record per load object, mirroring what the dynamic linker's debug
/// interface reports. `name` carries the object path directly when the
/// agent hands out strings instead of target addresses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadObject {
    pub base: u64,
    pub end: u64,
    /// Start of the object's data segment; zero when unknown.
    pub data_base: u64,
    /// Target address of the object's NUL-terminated path, if any.
    pub nameaddr: u64,
    pub name: Option<String>,
    pub lmid: Lmid,
    pub plt_base: u64,
    pub plt_size: u64,
}

pub(crate) type FileId = usize;

/// Section kind, offset, and size of an object's embedded CTF data.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CtfLocation {
    pub offset: u64,
    pub size: u64,
    /// True when the CTF symbol references resolve against `.dynsym`.
    pub dynsym: bool,
}

/// Retained metadata of a successfully ingested ELF image.
pub(crate) struct ElfMeta {
    pub class: u8,
    pub etype: u16,
    /// Section names by section index, for symbol-iteration naming.
    pub section_names: Vec<String>,
}

/// Everything known about one backing object file.
///
/// Reachable from its primary mapping and from every mapping whose sections
/// overlap it; `refs` counts those owners and the record is vacated when it
/// drops to zero.
pub(crate) struct FileInfo {
    pub pname: String,
    pub lname: Option<String>,
    /// Index of the primary (text) mapping, kept current across refreshes.
    pub primary: Option<usize>,
    pub refs: u32,
    pub fd: Option<std::fs::File>,
    pub elf: Option<ElfMeta>,
    pub synthetic: bool,
    pub lo: Option<LoadObject>,
    /// Sorted (start, end) address pairs of the in-memory load segments.
    pub saddrs: Option<Vec<(u64, u64)>>,
    /// Start of the first writable load segment, from the same probe.
    pub data_start: Option<u64>,
    pub symtab: SymTable,
    pub dynsym: SymTable,
    pub ctf: Option<CtfLocation>,
    pub ctf_buf: Option<Vec<u8>>,
    pub dyn_base: u64,
    pub plt_base: u64,
    pub plt_size: u64,
    pub jmp_rel: u64,
    pub init: bool,
}

impl FileInfo {
    fn new(pname: String) -> Self {
        Self {
            pname,
            lname: None,
            primary: None,
            refs: 1,
            fd: None,
            elf: None,
            synthetic: false,
            lo: None,
            saddrs: None,
            data_start: None,
            symtab: SymTable::default(),
            dynsym: SymTable::default(),
            ctf: None,
            ctf_buf: None,
            dyn_base: 0,
            plt_base: 0,
            plt_size: 0,
            jmp_rel: 0,
            init: false,
        }
    }

    pub fn lbase(&self) -> Option<&str> {
        self.lname.as_deref().map(basename)
    }
}

pub(crate) fn basename(s: &str) -> &str {
    s.rsplit('/').next().unwrap_or(s)
}

impl<T: Target> ProcessSymbols<T> {
    /// Live object ids in insertion order.
    pub(crate) fn file_ids(&self) -> Vec<FileId> {
        (0..self.files.len())
            .filter(|&i| self.files[i].is_some())
            .collect()
    }

    pub(crate) fn file(&self, fid: FileId) -> &FileInfo {
        self.files[fid].as_ref().unwrap()
    }

    pub(crate) fn file_mut(&mut self, fid: FileId) -> &mut FileInfo {
        self.files[fid].as_mut().unwrap()
    }

    /// Drop one reference; the record and everything it owns goes away when
    /// the last one is gone. Slot ids are never reused.
    pub(crate) fn file_info_free(&mut self, fid: FileId) {
        let f = match self.files[fid].as_mut() {
            Some(f) => f,
            None => return,
        };
        f.refs -= 1;
        if f.refs == 0 {
            self.files[fid] = None;
            self.num_files -= 1;
        }
    }

    /// Allocate a record for the object backing the mapping at `mi` and bind
    /// every mapping that overlaps one of its load segments to it.
    pub(crate) fn file_info_new(&mut self, mi: usize) -> FileId {
        let pname = self.mappings[mi].pmap.mapname.clone();
        let fid = self.files.len();
        self.files.push(Some(FileInfo::new(pname)));
        self.num_files += 1;
        self.mappings[mi].file = Some(fid);

        // Probe the in-memory image for its load segments, then walk the
        // mapping array and the sorted segment list in lock step to find
        // every mapping this object backs.
        let probe = self.section_addrs(self.mappings[mi].pmap.vaddr);
        if let Some((saddrs, data_start)) = probe {
            let mut mp = 0;
            let mut i = 0;
            while mp < self.mappings.len() && i < saddrs.len() {
                let mstart = self.mappings[mp].pmap.vaddr;
                let mend = mstart + self.mappings[mp].pmap.size;
                let (sstart, send) = saddrs[i];

                if mend <= sstart {
                    // Mapping is below the current section.
                    mp += 1;
                } else if mstart >= send {
                    // Mapping is above the current section.
                    i += 1;
                } else {
                    if self.mappings[mp].file.is_none() {
                        debug_print!("associating segment at {:#x}", mstart);
                        self.mappings[mp].file = Some(fid);
                        self.file_mut(fid).refs += 1;
                    } else if self.mappings[mp].file != Some(fid) {
                        debug_print!(
                            "segment at {:#x} already associated with {}",
                            mstart,
                            self.file(self.mappings[mp].file.unwrap()).pname
                        );
                    }
                    mp += 1;
                }
            }
            let f = self.file_mut(fid);
            f.saddrs = Some(saddrs);
            f.data_start = data_start;
        }

        fid
    }

    /// Whether the mapping at `mi` belongs to the load object of `fid`.
    ///
    /// The cheap test is whether the mapping encloses the text or data base
    /// the linker reported. A mapping split by a segment demotion can fail
    /// that while still being backed by the object, so fall back to asking
    /// whether any in-memory section overlaps the mapping.
    pub(crate) fn is_mapping_in_file(&mut self, mi: usize, fid: FileId) -> bool {
        let pmap = &self.mappings[mi].pmap;
        let (mstart, mend) = (pmap.vaddr, pmap.vaddr + pmap.size);

        if let Some(lo) = &self.file(fid).lo {
            if (mstart <= lo.base && lo.base < mend)
                || (lo.data_base != 0 && mstart <= lo.data_base && lo.data_base < mend)
            {
                return true;
            }
        }

        if self.file(fid).saddrs.is_none() {
            let primary = match self.file(fid).primary {
                Some(p) => p,
                None => return false,
            };
            let probe = self.section_addrs(self.mappings[primary].pmap.vaddr);
            match probe {
                Some((saddrs, data_start)) => {
                    let f = self.file_mut(fid);
                    f.saddrs = Some(saddrs);
                    f.data_start = data_start;
                }
                None => return false,
            }
        }

        let (mstart, mend) = {
            let pmap = &self.mappings[mi].pmap;
            (pmap.vaddr, pmap.vaddr + pmap.size)
        };
        self.file(fid)
            .saddrs
            .as_ref()
            .unwrap()
            .iter()
            .any(|&(sstart, send)| !(mend <= sstart || mstart >= send))
    }

    /// Find or build the object record (and its symbol tables) for the
    /// mapping at `mi`.
    pub(crate) fn build_map_symtab(&mut self, mi: usize) -> Option<FileId> {
        if let Some(fid) = self.mappings[mi].file {
            self.build_file_symtab(fid);
            return Some(fid);
        }

        if self.mappings[mi].pmap.mapname.is_empty() {
            return None;
        }

        // A file can be mapped at several different addresses; try to find a
        // record for the same object first.
        for fid in self.file_ids() {
            let matches = {
                let f = self.file(fid);
                f.lo.is_some() && f.pname == self.mappings[mi].pmap.mapname
            };
            if matches && self.is_mapping_in_file(mi, fid) {
                self.mappings[mi].file = Some(fid);
                self.file_mut(fid).refs += 1;
                self.build_file_symtab(fid);
                return Some(fid);
            }
        }

        // A new object. Let the linker agent connect it with its primary
        // text mapping; the dynamic linker itself is special-cased since it
        // is what bootstraps the agent in the first place.
        let fid = self.file_info_new(mi);
        if self.map_ldso != Some(mi) {
            if self.rd_active {
                self.iter_load_objects();
            } else {
                self.rd_agent();
            }
        } else {
            self.file_mut(fid).primary = Some(mi);
        }

        // The agent may be unaware of a legitimate ELF file mmap'ed in
        // without dlopen; ingest requires a primary mapping either way.
        if self.file(fid).primary.is_none() {
            self.file_mut(fid).primary = Some(mi);
        }

        self.build_file_symtab(fid);
        Some(fid)
    }

    /// The mapping of the executable, located by scanning for the reserved
    /// `a.out` mapname when the aux vector cannot pin it down.
    pub(crate) fn exec_map(&mut self) -> Option<usize> {
        let mut data_fallback = None;

        for mi in 0..self.mappings.len() {
            if self.mappings[mi].pmap.mapname != "a.out" {
                continue;
            }
            if let Some(fid) = self.mappings[mi].file {
                if let Some(lo) = &self.file(fid).lo {
                    let base = lo.base;
                    let pmap = &self.mappings[mi].pmap;
                    if pmap.contains(base) {
                        return Some(mi); // text space
                    }
                    data_fallback = Some(mi); // must be the data
                    continue;
                }
            }
            let flags = self.mappings[mi].pmap.flags;
            if !flags.contains(MapFlags::EXEC) || flags.contains(MapFlags::WRITE) {
                data_fallback = Some(mi);
                continue;
            }
            return Some(mi);
        }

        data_fallback
    }

    /// Resolve a full or partial object name to a mapping.
    ///
    /// Pass one matches the entire link-map path or its basename exactly;
    /// pass two matches a basename prefix up to a `.` suffix (so `libc`
    /// finds `libc.so.1`); finally the literal `a.out` aliases the
    /// executable. A specific link-map id restricts every pass, but without
    /// an agent all requests are effectively wildcard.
    pub(crate) fn object_to_map(&mut self, lmid: Lmid, objname: &str) -> Option<usize> {
        let lmid = if self.rd_active { lmid } else { PR_LMID_EVERY };

        let candidate = |this: &Self, mi: usize| -> Option<FileId> {
            let fid = this.mappings[mi].file?;
            if this.mappings[mi].pmap.mapname.is_empty() {
                return None;
            }
            let f = this.file(fid);
            f.lname.as_ref()?;
            if lmid != PR_LMID_EVERY
                && f.lo.as_ref().map(|lo| lo.lmid) != Some(lmid)
            {
                return None;
            }
            Some(fid)
        };

        // If we match, return the primary text mapping; otherwise just
        // return the mapping we matched.
        for mi in 0..self.mappings.len() {
            if let Some(fid) = candidate(self, mi) {
                let f = self.file(fid);
                let lname = f.lname.as_deref().unwrap();
                if lname == objname || f.lbase() == Some(objname) {
                    return Some(f.primary.unwrap_or(mi));
                }
            }
        }

        for mi in 0..self.mappings.len() {
            if let Some(fid) = candidate(self, mi) {
                let f = self.file(fid);
                let lbase = f.lbase().unwrap_or("");
                if lbase.len() > objname.len()
                    && lbase.starts_with(objname)
                    && lbase.as_bytes()[objname.len()] == b'.'
                {
                    return Some(f.primary.unwrap_or(mi));
                }
            }
        }

        if (lmid == PR_LMID_EVERY || lmid == LM_ID_BASE) && objname == "a.out" {
            return self.map_exec;
        }

        None
    }

    /// Resolve an object selector, establishing the executable and dynamic
    /// linker mappings from the aux vector on the way.
    pub(crate) fn object_name_to_map(&mut self, lmid: Lmid, sel: ObjSelector<'_>) -> Option<usize> {
        if !self.info_valid {
            self.update_maps();
        }

        if self.map_exec.is_none() {
            self.map_exec = self
                .getauxval(crate::auxv::AT_ENTRY)
                .and_then(|a| self.addr2mptr(a))
                .or_else(|| self.exec_map());
        }
        if self.map_ldso.is_none() {
            self.map_ldso = self
                .getauxval(crate::auxv::AT_BASE)
                .and_then(|a| self.addr2mptr(a));
        }

        match sel {
            ObjSelector::Exec => self.map_exec,
            ObjSelector::Ldso => self.map_ldso,
            // A reasonable mistake, but not a meaningful one.
            ObjSelector::Every => None,
            ObjSelector::Name(name) => {
                if self.rd_agent() || self.target.state() == crate::TargetState::Idle {
                    self.object_to_map(lmid, name)
                } else {
                    None
                }
            }
        }
    }

    /// Convert an object selector to the record of its primary text mapping,
    /// restricted to the given link map.
    pub fn lmid_to_map(&mut self, lmid: Lmid, sel: ObjSelector<'_>) -> Option<&MapRecord> {
        let mi = self.object_name_to_map(lmid, sel)?;
        Some(&self.mappings[mi].pmap)
    }

    pub fn name_to_map(&mut self, sel: ObjSelector<'_>) -> Option<&MapRecord> {
        self.lmid_to_map(PR_LMID_EVERY, sel)
    }

    /// The load-object descriptor of the object containing `addr`. Building
    /// the symbol table on the way brings the PLT information up to date.
    pub fn addr_to_loadobj(&mut self, addr: u64) -> Option<&LoadObject> {
        if !self.info_valid {
            self.update_maps();
        }
        let mi = self.addr2mptr(addr)?;
        let fid = self.build_map_symtab(mi)?;
        self.file(fid).lo.as_ref()
    }

    pub fn lmid_to_loadobj(&mut self, lmid: Lmid, sel: ObjSelector<'_>) -> Option<&LoadObject> {
        let mi = self.object_name_to_map(lmid, sel)?;
        let fid = self.build_map_symtab(mi)?;
        self.file(fid).lo.as_ref()
    }

    pub fn name_to_loadobj(&mut self, sel: ObjSelector<'_>) -> Option<&LoadObject> {
        self.lmid_to_loadobj(PR_LMID_EVERY, sel)
    }

    /// Iterate the mapped objects in the order they were discovered,
    /// passing each primary mapping and link-map name. Returns `false` if
    /// the callback stopped the walk.
    pub fn object_iter<F>(&mut self, mut f: F) -> bool
    where
        F: FnMut(&MapRecord, &str) -> bool,
    {
        self.rd_agent();
        self.update_maps();

        for fid in self.file_ids() {
            let (primary, lname) = {
                let fp = self.file(fid);
                (fp.primary, fp.lname.clone())
            };
            let mi = match primary {
                Some(mi) => mi,
                None => continue,
            };
            if !f(&self.mappings[mi].pmap, lname.as_deref().unwrap_or("")) {
                return false;
            }
        }
        true
    }
}
