use crate::{ProcessSymbols, Target};

/// Access and kind flags for one mapping.
///
/// `BREAK` and `STACK` mark the heap and stack segments; they are excluded
/// from the identity comparison used when reconciling snapshots because the
/// kernel may flip them on an otherwise unchanged mapping.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MapFlags(pub u32);

impl MapFlags {
    pub const READ: Self = Self(0x01);
    pub const WRITE: Self = Self(0x02);
    pub const EXEC: Self = Self(0x04);
    pub const BREAK: Self = Self(0x08);
    pub const STACK: Self = Self(0x10);

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl std::ops::BitOr for MapFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for MapFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// One contiguous region of the target's address space.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MapRecord {
    pub vaddr: u64,
    pub size: u64,
    pub offset: u64,
    pub flags: MapFlags,
    pub pagesize: u64,
    pub shmid: i64,
    /// Identifier of the backing file as reported by the mapping source;
    /// empty for anonymous mappings.
    pub mapname: String,
}

impl MapRecord {
    /// Single-subtraction containment test; wraps around rather than
    /// overflowing when `addr` is below the base.
    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        addr.wrapping_sub(self.vaddr) < self.size
    }

    /// True when both records describe the same region of the same file.
    /// The latest access flags are taken from the snapshot regardless.
    fn same_identity(&self, other: &MapRecord) -> bool {
        let ignore = MapFlags::BREAK | MapFlags::STACK;
        self.vaddr == other.vaddr
            && self.size == other.size
            && self.offset == other.offset
            && self.flags.without(ignore) == other.flags.without(ignore)
            && self.pagesize == other.pagesize
            && self.shmid == other.shmid
            && self.mapname == other.mapname
    }
}

/// A mapping plus its binding to the object registry.
pub(crate) struct MappingInfo {
    pub pmap: MapRecord,
    pub file: Option<crate::object::FileId>,
}

impl MappingInfo {
    fn unbound(pmap: MapRecord) -> Self {
        Self { pmap, file: None }
    }
}

const MAPNAME_MAX: usize = libc::PATH_MAX as usize;

fn page_size() -> u64 {
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android"))] {
            nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
                .ok()
                .flatten()
                .map(|v| v as u64)
                .unwrap_or(4096)
        } else {
            4096
        }
    }
}

/// Parse the textual `/proc/<pid>/maps` form into mapping records.
/// Unparsable lines are skipped.
pub fn parse_maps(text: &str) -> Vec<MapRecord> {
    let pagesize = page_size();
    text.lines()
        .filter_map(|line| parse_maps_line(line, pagesize))
        .collect()
}

// start              - end               perms offset   dev   inode    pathname
// 7feca168a000-7feca1699000 rwxp 00007000 fd:00 1705088  /usr/lib64/libpthread-2.33.so
fn parse_maps_line(line: &str, pagesize: u64) -> Option<MapRecord> {
    let mut fields = line.split_whitespace();

    let range = fields.next()?;
    let dash = range.find('-')?;
    let vaddr = u64::from_str_radix(&range[..dash], 16).ok()?;
    let end = u64::from_str_radix(&range[dash + 1..], 16).ok()?;
    if end < vaddr {
        return None;
    }

    let perms = fields.next()?;
    let mut flags = MapFlags::empty();
    for (c, bit) in perms.chars().zip([MapFlags::READ, MapFlags::WRITE, MapFlags::EXEC].iter()) {
        if c != '-' && c != 'p' && c != 's' {
            flags |= *bit;
        }
    }

    let offset = u64::from_str_radix(fields.next()?, 16).ok()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;

    // The path is everything from the first '/'; special entries like
    // [stack] and [heap] only contribute flags.
    let mut mapname = String::new();
    if let Some(path_start) = line.find('/') {
        let mut name = line[path_start..].trim_end();
        if let Some(stripped) = name.strip_suffix(" (deleted)") {
            name = stripped.trim_end();
        }
        mapname.push_str(name);
        mapname.truncate(MAPNAME_MAX);
    } else if line.contains("[stack") {
        flags |= MapFlags::STACK;
    } else if line.contains("[heap]") {
        flags |= MapFlags::BREAK;
    }

    Some(MapRecord {
        vaddr,
        size: end - vaddr,
        offset,
        flags,
        pagesize,
        shmid: -1,
        mapname,
    })
}

impl<T: Target> ProcessSymbols<T> {
    /// Rebuild the mapping model from a fresh snapshot, carrying the file
    /// bindings of mappings that survived unchanged and releasing the ones
    /// that are gone. Cheap when the model is already valid.
    pub fn update_maps(&mut self) {
        if self.info_valid {
            return;
        }

        self.read_auxv_vec();

        let snapshot = match self.target.mapping_snapshot() {
            Ok(s) => s,
            Err(e) => {
                debug_print!("mapping snapshot failed: {}", e);
                self.reset_maps();
                return;
            }
        };

        let mut old: Vec<Option<MappingInfo>> = std::mem::take(&mut self.mappings)
            .into_iter()
            .map(Some)
            .collect();
        let mut new_maps: Vec<MappingInfo> = Vec::with_capacity(snapshot.len());
        let mut new_exec = None;
        let mut new_ldso = None;
        let mut k = 0;

        for pmap in snapshot {
            loop {
                if k == old.len() {
                    // The old mappings are exhausted; everything left is new.
                    new_maps.push(MappingInfo::unbound(pmap));
                    break;
                }

                let om = old[k].as_ref().unwrap();
                if om.pmap.same_identity(&pmap) {
                    // Unchanged: carry the file binding over, take the latest
                    // flags, and fix up the indices that referenced it.
                    let om = old[k].take().unwrap();
                    let j = new_maps.len();
                    if self.map_exec == Some(k) {
                        new_exec = Some(j);
                    }
                    if self.map_ldso == Some(k) {
                        new_ldso = Some(j);
                    }
                    if let Some(fid) = om.file {
                        if let Some(f) = self.files[fid].as_mut() {
                            if f.primary == Some(k) {
                                f.primary = Some(j);
                            }
                        }
                    }
                    new_maps.push(MappingInfo { pmap, file: om.file });
                    k += 1;
                    break;
                } else if pmap.vaddr + pmap.size > om.pmap.vaddr {
                    // The old mapping no longer exists.
                    let om = old[k].take().unwrap();
                    self.drop_old_mapping(k, om);
                    k += 1;
                } else {
                    new_maps.push(MappingInfo::unbound(pmap));
                    break;
                }
            }
        }

        while k < old.len() {
            let om = old[k].take().unwrap();
            self.drop_old_mapping(k, om);
            k += 1;
        }

        self.mappings = new_maps;
        self.map_exec = new_exec;
        self.map_ldso = new_ldso;
        self.info_valid = true;

        if self.rd_active {
            self.iter_load_objects();
        }
    }

    fn drop_old_mapping(&mut self, old_idx: usize, om: MappingInfo) {
        if let Some(fid) = om.file {
            if let Some(f) = self.files[fid].as_mut() {
                if f.primary == Some(old_idx) {
                    f.primary = None;
                }
            }
            self.file_info_free(fid);
        }
        if self.map_exec == Some(old_idx) || self.map_ldso == Some(old_idx) {
            self.auxv = None;
        }
    }

    /// Binary search for the mapping containing `addr`.
    pub(crate) fn addr2mptr(&self, addr: u64) -> Option<usize> {
        let mut lo = 0isize;
        let mut hi = self.mappings.len() as isize - 1;
        while lo <= hi {
            let mid = ((lo + hi) / 2) as usize;
            let m = &self.mappings[mid].pmap;
            if m.contains(addr) {
                return Some(mid);
            }
            if addr < m.vaddr {
                hi = mid as isize - 1;
            } else {
                lo = mid as isize + 1;
            }
        }
        None
    }

    /// The mapping containing `addr`, with no restriction on its kind.
    pub fn addr_to_map(&mut self, addr: u64) -> Option<&MapRecord> {
        if !self.info_valid {
            self.update_maps();
        }
        let mi = self.addr2mptr(addr)?;
        Some(&self.mappings[mi].pmap)
    }

    /// The mapping containing `addr`, but only if it is the text section of
    /// its load object.
    pub fn addr_to_text_map(&mut self, addr: u64) -> Option<&MapRecord> {
        if !self.info_valid {
            self.update_maps();
        }
        let mi = self.addr2mptr(addr)?;
        let fid = self.build_map_symtab(mi)?;
        let f = self.files[fid].as_ref()?;
        let lo = f.lo.as_ref()?;
        let pmap = &self.mappings[mi].pmap;

        // With no known data section every section is text; otherwise a
        // section is text only if it ends below the start of the data.
        if lo.data_base == 0 || pmap.vaddr + pmap.size < lo.data_base {
            Some(pmap)
        } else {
            None
        }
    }

    /// Iterate the address-space mappings in ascending base order, passing
    /// each record and the link-map name of its object, if any. Returns
    /// `false` if the callback stopped the walk.
    pub fn mapping_iter<F>(&mut self, mut f: F) -> bool
    where
        F: FnMut(&MapRecord, Option<&str>) -> bool,
    {
        self.rd_agent();
        for mi in 0..self.mappings.len() {
            let lname = self.mappings[mi]
                .file
                .and_then(|fid| self.files[fid].as_ref())
                .and_then(|fp| fp.lname.clone());
            if !f(&self.mappings[mi].pmap, lname.as_deref()) {
                return false;
            }
        }
        true
    }
}
