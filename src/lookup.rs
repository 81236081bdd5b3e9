use crate::{
    symtab::sym_prefer, Lmid, ObjSelector, ProcessSymbols, Target, LM_ID_BASE, PR_LMID_EVERY,
};
use goblin::elf::section_header::SHN_UNDEF;
use goblin::elf::sym::{Sym, STT_SECTION, STT_TLS};

/// Which physical symbol table a result came from or a query should search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhichTable {
    Symtab,
    Dynsym,
}

/// Iteration order for [`ProcessSymbols::symbol_iter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymOrder {
    /// Logical table order: auxiliary entries first, then the primary table.
    Natural,
    ByAddr,
    ByName,
}

const STB_NUM: u8 = 3;
const STT_NUM: u8 = 7;

/// Bind/type filter for symbol iteration. Symbols with a binding or type
/// outside the standard range never match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymFilter {
    bind_mask: u32,
    type_mask: u32,
}

impl SymFilter {
    pub const ANY: SymFilter = SymFilter {
        bind_mask: !0,
        type_mask: !0,
    };

    pub fn new(binds: &[u8], types: &[u8]) -> Self {
        let fold = |vals: &[u8]| vals.iter().fold(0u32, |m, &v| m | 1 << (v & 31));
        Self {
            bind_mask: fold(binds),
            type_mask: fold(types),
        }
    }

    fn accepts(&self, bind: u8, ty: u8) -> bool {
        if bind >= STB_NUM || ty >= STT_NUM {
            return false;
        }
        self.bind_mask & (1 << bind) != 0 && self.type_mask & (1 << ty) != 0
    }
}

/// Ancillary information about a resolved symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct SymInfo {
    pub name: String,
    /// Basename of the object the symbol came from, when known.
    pub object: Option<String>,
    pub lmid: Lmid,
    pub table: WhichTable,
    /// Stable logical index of the symbol within its table.
    pub id: usize,
}

impl<T: Target> ProcessSymbols<T> {
    /// The symbol containing `addr`, with ancillary information. When
    /// several enclose it, the canonical alias wins.
    pub fn xlookup_by_addr(&mut self, addr: u64) -> Option<(Sym, SymInfo)> {
        self.rd_agent();
        if !self.info_valid {
            self.update_maps();
        }

        let mi = self.addr2mptr(addr)?;
        let fid = self.build_map_symtab(mi)?;
        let f = self.file(fid);
        f.elf.as_ref()?;

        // Bias the query into the object's own address space; shared
        // objects keep their unrelocated st_values.
        let biased = addr.wrapping_sub(f.dyn_base);

        let hit1 = f.symtab.by_addr(biased).map(|(s, i)| (s, i, &f.symtab));
        let hit2 = f.dynsym.by_addr(biased).map(|(s, i)| (s, i, &f.dynsym));
        let (mut sym, id, table, from_symtab) = sym_prefer(hit1, hit2)?;

        let name = table.name_string(&sym);
        if sym.st_type() != STT_TLS {
            sym.st_value = sym.st_value.wrapping_add(f.dyn_base);
        }

        let info = SymInfo {
            name,
            object: f.lbase().map(Into::into),
            lmid: f.lo.as_ref().map_or(LM_ID_BASE, |lo| lo.lmid),
            table: if from_symtab {
                WhichTable::Symtab
            } else {
                WhichTable::Dynsym
            },
            id,
        };
        Some((sym, info))
    }

    /// The name and table entry of the symbol containing `addr`.
    pub fn lookup_by_addr(&mut self, addr: u64) -> Option<(String, Sym)> {
        self.xlookup_by_addr(addr).map(|(sym, info)| (info.name, sym))
    }

    /// Search for `name` in the given object (or all of them), restricted to
    /// one link map unless `lmid` is the wildcard.
    ///
    /// `.symtab` wins over `.dynsym` within one object. A match that is
    /// merely an undefined reference (a PLT placeholder in the executable,
    /// say) is held on to while the remaining objects are searched for a
    /// real definition.
    pub fn xlookup_by_name(
        &mut self,
        lmid: Lmid,
        obj: ObjSelector<'_>,
        name: &str,
    ) -> Option<(Sym, SymInfo)> {
        let fids = match obj {
            ObjSelector::Every => {
                self.rd_agent();
                self.file_ids()
            }
            sel => {
                let mi = self.object_name_to_map(lmid, sel)?;
                vec![self.build_map_symtab(mi)?]
            }
        };

        let mut tentative: Option<(Sym, SymInfo)> = None;

        for fid in fids {
            self.build_file_symtab(fid);
            let f = self.file(fid);
            if f.elf.is_none() {
                continue;
            }
            if lmid != PR_LMID_EVERY {
                if let Some(lo) = &f.lo {
                    if lo.lmid != lmid {
                        continue;
                    }
                }
            }

            let (hit, table) = if f.symtab.has_primary() {
                match f.symtab.by_name(name) {
                    Some(hit) => (Some(hit), WhichTable::Symtab),
                    None => (f.dynsym.by_name(name), WhichTable::Dynsym),
                }
            } else {
                (f.dynsym.by_name(name), WhichTable::Dynsym)
            };
            let (mut sym, id) = match hit {
                Some(h) => h,
                None => continue,
            };

            if sym.st_type() != STT_TLS {
                sym.st_value = sym.st_value.wrapping_add(f.dyn_base);
            }

            let info = SymInfo {
                name: name.to_string(),
                object: match obj {
                    ObjSelector::Name(n) => Some(n.to_string()),
                    _ => f.lbase().map(Into::into),
                },
                lmid: f.lo.as_ref().map_or(LM_ID_BASE, |lo| lo.lmid),
                table,
                id,
            };

            if sym.st_shndx != SHN_UNDEF as usize {
                return Some((sym, info));
            }
            if tentative.is_none() {
                tentative = Some((sym, info));
            }
        }

        tentative
    }

    /// Search for `name` without any link-map restriction.
    pub fn lookup_by_name(&mut self, obj: ObjSelector<'_>, name: &str) -> Option<Sym> {
        self.xlookup_by_name(PR_LMID_EVERY, obj, name).map(|(s, _)| s)
    }

    /// Iterate one object's symbols in the requested order, applying the
    /// bind/type filter. Returns `false` if the object could not be
    /// resolved or the callback stopped the walk.
    pub fn symbol_iter_lmid<F>(
        &mut self,
        lmid: Lmid,
        obj: ObjSelector<'_>,
        which: WhichTable,
        filter: SymFilter,
        order: SymOrder,
        mut f: F,
    ) -> bool
    where
        F: FnMut(&str, &Sym, &SymInfo) -> bool,
    {
        let mi = match self.object_name_to_map(lmid, obj) {
            Some(mi) => mi,
            None => return false,
        };
        let fid = match self.build_map_symtab(mi) {
            Some(fid) => fid,
            None => return false,
        };

        let fp = self.file(fid);
        let meta = match &fp.elf {
            Some(meta) => meta,
            None => return false,
        };
        let table = match which {
            WhichTable::Symtab => &fp.symtab,
            WhichTable::Dynsym => &fp.dynsym,
        };
        if !table.has_primary() || table.strs.is_empty() {
            return false;
        }

        let object = match obj {
            ObjSelector::Name(n) => Some(n.to_string()),
            _ => fp.lbase().map(Into::into),
        };
        let obj_lmid = fp.lo.as_ref().map_or(LM_ID_BASE, |lo| lo.lmid);
        let dyn_base = fp.dyn_base;

        let count = match table.index(order) {
            Some(map) => map.len(),
            None => table.symn(),
        };

        for i in 0..count {
            let ndx = match table.index(order) {
                Some(map) => map[i] as usize,
                None => i,
            };
            let sym = match table.get(ndx) {
                Some(s) => *s,
                None => continue,
            };
            if sym.st_name >= table.strs.len() {
                continue;
            }
            if !filter.accepts(sym.st_bind(), sym.st_type()) {
                continue;
            }

            let mut sym = sym;
            if sym.st_type() != STT_TLS {
                sym.st_value = sym.st_value.wrapping_add(dyn_base);
            }

            // Section symbols have no name of their own; show the section's.
            let name = if sym.st_type() == STT_SECTION {
                meta.section_names
                    .get(sym.st_shndx)
                    .filter(|n| !n.is_empty())
                    .cloned()
                    .unwrap_or_else(|| table.name_string(&sym))
            } else {
                table.name_string(&sym)
            };

            let info = SymInfo {
                name,
                object: object.clone(),
                lmid: obj_lmid,
                table: which,
                id: ndx,
            };
            if !f(&info.name, &sym, &info) {
                return false;
            }
        }
        true
    }

    /// [`symbol_iter_lmid`](Self::symbol_iter_lmid) without a link-map
    /// restriction.
    pub fn symbol_iter<F>(
        &mut self,
        obj: ObjSelector<'_>,
        which: WhichTable,
        filter: SymFilter,
        order: SymOrder,
        f: F,
    ) -> bool
    where
        F: FnMut(&str, &Sym, &SymInfo) -> bool,
    {
        self.symbol_iter_lmid(PR_LMID_EVERY, obj, which, filter, order, f)
    }

    /// The link-map name of the object mapped at `addr`.
    pub fn objname(&mut self, addr: u64) -> Option<String> {
        self.rd_agent();
        if !self.info_valid {
            self.update_maps();
        }
        let mi = self.addr2mptr(addr)?;
        let fid = self.mappings[mi].file?;
        self.file(fid).lname.clone()
    }

    /// The link-map id of the object mapped at `addr`.
    pub fn lmid(&mut self, addr: u64) -> Option<Lmid> {
        self.rd_agent();
        if !self.info_valid {
            self.update_maps();
        }
        let mi = self.addr2mptr(addr)?;
        let fid = self.mappings[mi].file?;
        self.file(fid).lo.as_ref().map(|lo| lo.lmid)
    }
}
