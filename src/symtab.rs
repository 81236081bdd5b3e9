use goblin::elf::sym::{self, Sym};
use std::cmp::Ordering;

/// Symbol types worth indexing: data, functions, commons, and TLS entries.
fn is_data_type(ty: u8) -> bool {
    matches!(
        ty,
        sym::STT_OBJECT | sym::STT_FUNC | sym::STT_COMMON | sym::STT_TLS
    )
}

/// One logical symbol table of an object file.
///
/// Two physical tables may back it: a primary one (`.symtab` or `.dynsym`)
/// and an auxiliary local-dynamic extension. The logical index space puts
/// the auxiliary entries first, so index `i` resolves to `aux[i]` when
/// `i < aux.len()` and to `pri[i - aux.len()]` otherwise. Indices handed to
/// callers are always logical and stay stable for the life of the object.
#[derive(Default)]
pub(crate) struct SymTable {
    pri: Option<Vec<Sym>>,
    aux: Vec<Sym>,
    /// String table bytes shared by both physical tables.
    pub strs: Vec<u8>,
    /// Raw image of the primary table, kept for the CTF handoff.
    pub pri_raw: Vec<u8>,
    pub pri_entsize: u64,
    byaddr: Vec<u32>,
    byname: Vec<u32>,
    indexed: bool,
    sorted: bool,
}

impl SymTable {
    pub fn has_primary(&self) -> bool {
        self.pri.is_some()
    }

    pub fn set_primary(&mut self, syms: Vec<Sym>, strs: Vec<u8>, raw: Vec<u8>, entsize: u64) {
        self.pri = Some(syms);
        self.strs = strs;
        self.pri_raw = raw;
        self.pri_entsize = entsize;
    }

    pub fn has_aux(&self) -> bool {
        !self.aux.is_empty()
    }

    pub fn set_aux(&mut self, syms: Vec<Sym>) {
        self.aux = syms;
    }

    /// Total logical symbol count.
    pub fn symn(&self) -> usize {
        self.aux.len() + self.pri.as_ref().map_or(0, |p| p.len())
    }

    /// Number of retained (indexed) symbols.
    pub fn count(&self) -> usize {
        self.byaddr.len()
    }

    /// Look a symbol up by logical index.
    pub fn get(&self, ndx: usize) -> Option<&Sym> {
        if ndx < self.aux.len() {
            self.aux.get(ndx)
        } else {
            self.pri.as_ref()?.get(ndx - self.aux.len())
        }
    }

    /// The name bytes of `sym`, empty when `st_name` is out of range.
    pub fn name_bytes(&self, sym: &Sym) -> &[u8] {
        str_at(&self.strs, sym.st_name)
    }

    pub fn name_string(&self, sym: &Sym) -> String {
        String::from_utf8_lossy(self.name_bytes(sym)).into_owned()
    }

    pub fn index(&self, order: crate::lookup::SymOrder) -> Option<&[u32]> {
        match order {
            crate::lookup::SymOrder::Natural => None,
            crate::lookup::SymOrder::ByAddr => Some(&self.byaddr),
            crate::lookup::SymOrder::ByName => Some(&self.byname),
        }
    }

    /// Build the by-address and by-name index permutations over the retained
    /// symbols. Runs once per table; later calls are no-ops, including after
    /// a failed ingest.
    pub fn optimize(&mut self, sort: bool) {
        if self.pri.is_none() || self.indexed {
            return;
        }
        self.indexed = true;

        let strsz = self.strs.len();
        let retained: Vec<u32> = (0..self.symn())
            .filter(|&i| {
                let s = self.get(i).unwrap();
                s.st_name < strsz && is_data_type(s.st_type())
            })
            .map(|i| i as u32)
            .collect();

        self.byname = retained.clone();
        self.byaddr = retained;

        // Sorting is skipped under the no-sort escape switch; lookups then
        // fall back to linear scans.
        if sort {
            let mut byaddr = std::mem::take(&mut self.byaddr);
            byaddr.sort_by(|&a, &b| {
                let (sa, sb) = (self.get(a as usize).unwrap(), self.get(b as usize).unwrap());
                byaddr_cmp(sa, self.name_bytes(sa), sb, self.name_bytes(sb))
            });
            self.byaddr = byaddr;

            let mut byname = std::mem::take(&mut self.byname);
            byname.sort_by(|&a, &b| {
                let (sa, sb) = (self.get(a as usize).unwrap(), self.get(b as usize).unwrap());
                self.name_bytes(sa).cmp(self.name_bytes(sb))
            });
            self.byname = byname;
            self.sorted = true;
        }
    }

    /// Narrowest, most-preferred symbol whose `[st_value, st_value+st_size)`
    /// range contains `addr`, along with its logical index.
    pub fn by_addr(&self, addr: u64) -> Option<(Sym, usize)> {
        if self.sorted {
            self.by_addr_binary(addr)
        } else {
            self.by_addr_linear(addr)
        }
    }

    fn by_addr_binary(&self, addr: u64) -> Option<(Sym, usize)> {
        if self.pri.is_none() || self.byaddr.is_empty() {
            return None;
        }

        let mut min = 0isize;
        let mut max = self.byaddr.len() as isize - 1;
        let mut found: Option<(Sym, usize, isize)> = None;

        // A match is not final: keep narrowing towards the greatest
        // st_value still containing the address.
        while min <= max {
            let mid = (min + max) / 2;
            let i = self.byaddr[mid as usize] as usize;
            let s = *self.get(i).unwrap();
            if addr >= s.st_value
                && addr < s.st_value + s.st_size
                && found.map_or(true, |(os, _, _)| s.st_value > os.st_value)
            {
                found = Some((s, i, mid));
            }
            if addr < s.st_value {
                max = mid - 1;
            } else {
                min = mid + 1;
            }
        }

        let (mut sym, mut id, mut pos) = found?;

        // Aliases share the value; the index orders them best-first, so walk
        // back to the first predecessor that still encloses the address.
        while pos > 0 {
            let pi = self.byaddr[(pos - 1) as usize] as usize;
            let p = *self.get(pi).unwrap();
            if p.st_value == sym.st_value && addr >= p.st_value && addr < p.st_value + p.st_size {
                sym = p;
                id = pi;
                pos -= 1;
            } else {
                break;
            }
        }

        Some((sym, id))
    }

    fn by_addr_linear(&self, addr: u64) -> Option<(Sym, usize)> {
        self.pri.as_ref()?;
        let mut best: Option<(Sym, usize)> = None;
        for i in 0..self.symn() {
            let s = *self.get(i).unwrap();
            if addr >= s.st_value && addr < s.st_value + s.st_size {
                best = match best {
                    None => Some((s, i)),
                    Some((o, oi)) => {
                        if byaddr_cmp(&s, self.name_bytes(&s), &o, self.name_bytes(&o))
                            == Ordering::Less
                        {
                            Some((s, i))
                        } else {
                            Some((o, oi))
                        }
                    }
                };
            }
        }
        best
    }

    /// A symbol whose name matches `name` exactly, with its logical index.
    pub fn by_name(&self, name: &str) -> Option<(Sym, usize)> {
        if self.sorted {
            self.by_name_binary(name.as_bytes())
        } else {
            self.by_name_linear(name.as_bytes())
        }
    }

    fn by_name_binary(&self, name: &[u8]) -> Option<(Sym, usize)> {
        if self.pri.is_none() || self.byname.is_empty() {
            return None;
        }

        let mut min = 0isize;
        let mut max = self.byname.len() as isize - 1;
        while min <= max {
            let mid = (min + max) / 2;
            let i = self.byname[mid as usize] as usize;
            let s = *self.get(i).unwrap();
            match name.cmp(self.name_bytes(&s)) {
                Ordering::Equal => return Some((s, i)),
                Ordering::Less => max = mid - 1,
                Ordering::Greater => min = mid + 1,
            }
        }
        None
    }

    fn by_name_linear(&self, name: &[u8]) -> Option<(Sym, usize)> {
        self.pri.as_ref()?;
        (0..self.symn()).find_map(|i| {
            let s = *self.get(i).unwrap();
            if self.name_bytes(&s) == name {
                Some((s, i))
            } else {
                None
            }
        })
    }
}

pub(crate) fn str_at(strs: &[u8], off: usize) -> &[u8] {
    match strs.get(off..) {
        Some(tail) => match tail.iter().position(|&b| b == 0) {
            Some(nul) => &tail[..nul],
            None => tail,
        },
        None => &[],
    }
}

/// Total order used for the by-address index, which doubles as the alias
/// preference: at equal addresses the canonical symbol sorts first.
pub(crate) fn byaddr_cmp(a: &Sym, aname: &[u8], b: &Sym, bname: &[u8]) -> Ordering {
    if a.st_value != b.st_value {
        return a.st_value.cmp(&b.st_value);
    }

    // Prefer the function to the non-function.
    if a.st_type() != b.st_type() {
        if a.st_type() == sym::STT_FUNC {
            return Ordering::Less;
        }
        if b.st_type() == sym::STT_FUNC {
            return Ordering::Greater;
        }
    }

    // Prefer the weak or strong global symbol to the local symbol.
    if a.st_bind() != b.st_bind() {
        if b.st_bind() == sym::STB_LOCAL {
            return Ordering::Less;
        }
        if a.st_bind() == sym::STB_LOCAL {
            return Ordering::Greater;
        }
    }

    // Prefer the name that doesn't begin with '$', a prefix compilers and
    // other symbol generators like to claim.
    match (
        aname.first() == Some(&b'$'),
        bname.first() == Some(&b'$'),
    ) {
        (false, true) => return Ordering::Less,
        (true, false) => return Ordering::Greater,
        _ => {}
    }

    // Prefer the name with fewer leading underscores.
    let mut an = aname;
    let mut bn = bname;
    while an.first() == Some(&b'_') && bn.first() == Some(&b'_') {
        an = &an[1..];
        bn = &bn[1..];
    }
    match (an.first() == Some(&b'_'), bn.first() == Some(&b'_')) {
        (false, true) => return Ordering::Less,
        (true, false) => return Ordering::Greater,
        _ => {}
    }

    // Prefer the symbol with the smaller size.
    if a.st_size != b.st_size {
        return a.st_size.cmp(&b.st_size);
    }

    aname.cmp(bname)
}

/// Pick the better of two by-address hits from different tables.
pub(crate) fn sym_prefer<'t>(
    s1: Option<(Sym, usize, &'t SymTable)>,
    s2: Option<(Sym, usize, &'t SymTable)>,
) -> Option<(Sym, usize, &'t SymTable, bool)> {
    match (s1, s2) {
        (None, None) => None,
        (Some((s, i, t)), None) => Some((s, i, t, true)),
        (None, Some((s, i, t))) => Some((s, i, t, false)),
        (Some((a, ai, at)), Some((b, bi, bt))) => {
            if byaddr_cmp(&a, at.name_bytes(&a), &b, bt.name_bytes(&b)) != Ordering::Greater {
                Some((a, ai, at, true))
            } else {
                Some((b, bi, bt, false))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn mk(name_off: usize, value: u64, size: u64, ty: u8, bind: u8) -> Sym {
        Sym {
            st_name: name_off,
            st_info: (bind << 4) | (ty & 0xf),
            st_other: 0,
            st_shndx: 1,
            st_value: value,
            st_size: size,
        }
    }

    /// Builds a table whose string data holds the given names back to back,
    /// with the symbol constructor receiving each name's offset.
    fn table(syms: Vec<(&str, u64, u64, u8, u8)>) -> SymTable {
        let mut strs = vec![0u8];
        let mut out = Vec::new();
        for (name, value, size, ty, bind) in syms {
            let off = strs.len();
            strs.extend_from_slice(name.as_bytes());
            strs.push(0);
            out.push(mk(off, value, size, ty, bind));
        }
        let mut t = SymTable::default();
        t.set_primary(out, strs, Vec::new(), 24);
        t
    }

    fn names_in_addr_order(t: &SymTable) -> Vec<String> {
        t.byaddr
            .iter()
            .map(|&i| t.name_string(t.get(i as usize).unwrap()))
            .collect()
    }

    #[test]
    fn alias_ordering_at_equal_addresses() {
        let mut t = table(vec![
            ("foo", 0x500, 4, sym::STT_FUNC, sym::STB_GLOBAL),
            ("foo_data", 0x500, 4, sym::STT_OBJECT, sym::STB_GLOBAL),
            ("$bar", 0x500, 4, sym::STT_FUNC, sym::STB_LOCAL),
            ("_foo", 0x500, 4, sym::STT_FUNC, sym::STB_GLOBAL),
        ]);
        t.optimize(true);
        assert_eq!(names_in_addr_order(&t), ["foo", "_foo", "$bar", "foo_data"]);
    }

    #[test]
    fn underscore_pairs_strip_before_comparing() {
        let mut t = table(vec![
            ("__libc_malloc", 0x100, 8, sym::STT_FUNC, sym::STB_GLOBAL),
            ("malloc", 0x100, 8, sym::STT_FUNC, sym::STB_GLOBAL),
        ]);
        t.optimize(true);
        assert_eq!(names_in_addr_order(&t), ["malloc", "__libc_malloc"]);
    }

    #[test]
    fn smaller_size_wins_ties() {
        let mut t = table(vec![
            ("big", 0x100, 32, sym::STT_FUNC, sym::STB_GLOBAL),
            ("tiny", 0x100, 8, sym::STT_FUNC, sym::STB_GLOBAL),
        ]);
        t.optimize(true);
        assert_eq!(names_in_addr_order(&t), ["tiny", "big"]);
    }

    #[test]
    fn comparator_is_a_total_order_on_dollar_names() {
        let a = mk(1, 0x10, 4, sym::STT_FUNC, sym::STB_GLOBAL);
        let b = mk(6, 0x10, 4, sym::STT_FUNC, sym::STB_GLOBAL);
        let strs = b"\0$aaa\0$bbb\0";
        assert_eq!(
            byaddr_cmp(&a, str_at(strs, 1), &b, str_at(strs, 6)),
            Ordering::Less
        );
        assert_eq!(
            byaddr_cmp(&b, str_at(strs, 6), &a, str_at(strs, 1)),
            Ordering::Greater
        );
    }

    #[test]
    fn retention_filters_types_and_bad_names() {
        let mut t = table(vec![
            ("func", 0x100, 4, sym::STT_FUNC, sym::STB_GLOBAL),
            ("sect", 0x200, 4, sym::STT_SECTION, sym::STB_LOCAL),
            ("file", 0x300, 4, sym::STT_FILE, sym::STB_LOCAL),
            ("obj", 0x400, 4, sym::STT_OBJECT, sym::STB_GLOBAL),
        ]);
        // A symbol pointing past the string table is dropped too.
        let strsz = t.strs.len();
        t.pri.as_mut().unwrap().push(mk(strsz + 10, 0x500, 4, sym::STT_FUNC, sym::STB_GLOBAL));
        t.optimize(true);
        assert_eq!(t.count(), 2);
        assert_eq!(names_in_addr_order(&t), ["func", "obj"]);
    }

    #[test]
    fn logical_indices_put_aux_first() {
        let mut t = table(vec![
            ("a", 0x100, 4, sym::STT_FUNC, sym::STB_GLOBAL),
            ("b", 0x200, 4, sym::STT_FUNC, sym::STB_GLOBAL),
            ("c", 0x300, 4, sym::STT_FUNC, sym::STB_GLOBAL),
        ]);
        let xoff = t.strs.len();
        t.strs.extend_from_slice(b"x\0y\0");
        t.set_aux(vec![
            mk(xoff, 0x400, 4, sym::STT_FUNC, sym::STB_LOCAL),
            mk(xoff + 2, 0x500, 4, sym::STT_FUNC, sym::STB_LOCAL),
        ]);
        t.optimize(true);

        assert_eq!(t.symn(), 5);
        assert_eq!(t.name_bytes(t.get(0).unwrap()), b"x");
        assert_eq!(t.name_bytes(t.get(1).unwrap()), b"y");
        assert_eq!(t.name_bytes(t.get(2).unwrap()), b"a");
        assert_eq!(t.name_bytes(t.get(4).unwrap()), b"c");

        let (_, id) = t.by_name("y").unwrap();
        assert_eq!(id, 1);
        let (_, id) = t.by_name("b").unwrap();
        assert_eq!(id, 3);
        let (_, id) = t.by_addr(0x400).unwrap();
        assert_eq!(id, 0);
    }

    #[test]
    fn by_addr_returns_enclosing_symbol() {
        let mut t = table(vec![
            ("low", 0x100, 0x10, sym::STT_FUNC, sym::STB_GLOBAL),
            ("high", 0x200, 0x10, sym::STT_FUNC, sym::STB_GLOBAL),
        ]);
        t.optimize(true);
        assert_eq!(t.by_addr(0x100).map(|(s, _)| s.st_value), Some(0x100));
        assert_eq!(t.by_addr(0x10f).map(|(s, _)| s.st_value), Some(0x100));
        assert!(t.by_addr(0x110).is_none());
        assert!(t.by_addr(0xff).is_none());
        assert_eq!(t.by_addr(0x20f).map(|(s, _)| s.st_value), Some(0x200));
    }

    #[test]
    fn by_addr_prefers_canonical_alias() {
        let mut t = table(vec![
            ("_write", 0x700, 0x20, sym::STT_FUNC, sym::STB_WEAK),
            ("write", 0x700, 0x20, sym::STT_FUNC, sym::STB_GLOBAL),
        ]);
        t.optimize(true);
        let (s, _) = t.by_addr(0x705).unwrap();
        assert_eq!(t.name_bytes(&s), b"write");
    }

    #[test]
    fn nested_symbol_narrows_to_inner() {
        // An enclosing region symbol and a small function inside it.
        let mut t = table(vec![
            ("region", 0x100, 0x100, sym::STT_OBJECT, sym::STB_GLOBAL),
            ("inner", 0x140, 0x10, sym::STT_FUNC, sym::STB_GLOBAL),
        ]);
        t.optimize(true);
        let (s, _) = t.by_addr(0x145).unwrap();
        assert_eq!(t.name_bytes(&s), b"inner");
        let (s, _) = t.by_addr(0x105).unwrap();
        assert_eq!(t.name_bytes(&s), b"region");
    }

    #[test]
    fn linear_and_binary_lookups_agree() {
        let syms = vec![
            ("a", 0x100u64, 0x10u64, sym::STT_FUNC, sym::STB_GLOBAL),
            ("b", 0x100, 0x10, sym::STT_FUNC, sym::STB_LOCAL),
            ("c", 0x120, 0x8, sym::STT_OBJECT, sym::STB_GLOBAL),
            ("d", 0x200, 0x40, sym::STT_FUNC, sym::STB_GLOBAL),
        ];
        let mut sorted = table(syms.clone());
        sorted.optimize(true);
        let mut unsorted = table(syms);
        unsorted.optimize(false);

        for addr in (0xf0..0x250).step_by(4) {
            let a = sorted.by_addr(addr).map(|(s, _)| s);
            let b = unsorted.by_addr(addr).map(|(s, _)| s);
            assert_eq!(a, b, "disagreement at {:#x}", addr);
        }
        for name in ["a", "b", "c", "d", "nope"] {
            assert_eq!(
                sorted.by_name(name).map(|(s, _)| s),
                unsorted.by_name(name).map(|(s, _)| s)
            );
        }
    }

    #[test]
    fn optimize_runs_once() {
        let mut t = table(vec![("f", 0x100, 4, sym::STT_FUNC, sym::STB_GLOBAL)]);
        t.optimize(true);
        let before = t.byaddr.clone();
        t.pri
            .as_mut()
            .unwrap()
            .push(mk(1, 0x200, 4, sym::STT_FUNC, sym::STB_GLOBAL));
        t.optimize(true);
        assert_eq!(t.byaddr, before);
    }
}
