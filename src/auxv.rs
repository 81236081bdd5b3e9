use crate::{ProcessSymbols, Target, TargetState};

pub const AT_NULL: u64 = 0;
pub const AT_IGNORE: u64 = 1;
pub const AT_EXECFD: u64 = 2;
pub const AT_PHDR: u64 = 3;
pub const AT_PHENT: u64 = 4;
pub const AT_PHNUM: u64 = 5;
pub const AT_PAGESZ: u64 = 6;
/// Base address of the program interpreter (the dynamic linker).
pub const AT_BASE: u64 = 7;
pub const AT_FLAGS: u64 = 8;
/// Entry point of the executable.
pub const AT_ENTRY: u64 = 9;
pub const AT_UID: u64 = 11;
pub const AT_EUID: u64 = 12;
pub const AT_GID: u64 = 13;
pub const AT_EGID: u64 = 14;
pub const AT_PLATFORM: u64 = 15;
pub const AT_HWCAP: u64 = 16;
pub const AT_CLKTCK: u64 = 17;
pub const AT_SECURE: u64 = 23;
pub const AT_RANDOM: u64 = 25;
pub const AT_EXECFN: u64 = 31;
pub const AT_SYSINFO: u64 = 32;
pub const AT_SYSINFO_EHDR: u64 = 33;

/// One `(type, value)` pair of the auxiliary vector, widened to 64 bits
/// regardless of the target's word size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuxvEntry {
    pub a_type: u64,
    pub a_val: u64,
}

static EMPTY_AUXV: [AuxvEntry; 1] = [AuxvEntry {
    a_type: AT_NULL,
    a_val: 0,
}];

fn read_word32(buf: &[u8], at: usize) -> u64 {
    let mut w = [0u8; 4];
    w.copy_from_slice(&buf[at..at + 4]);
    u32::from_ne_bytes(w) as u64
}

cfg_if::cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        fn read_word(buf: &[u8], at: usize) -> u64 {
            let mut w = [0u8; 8];
            w.copy_from_slice(&buf[at..at + 8]);
            u64::from_ne_bytes(w)
        }

        /// A 32-bit target on a 64-bit host hands us packed 4-byte pairs; the
        /// second word of the first entry is then the (non-zero) value, while
        /// a 64-bit vector has the high half of the first type word there.
        fn parse_raw(raw: &[u8]) -> Vec<AuxvEntry> {
            let mut entries = Vec::new();
            let packed = raw.len() >= 8 && read_word32(raw, 4) != 0;
            if packed {
                for pair in raw.chunks_exact(8) {
                    let a_type = read_word32(pair, 0);
                    if a_type == AT_NULL {
                        break;
                    }
                    entries.push(AuxvEntry { a_type, a_val: read_word32(pair, 4) });
                }
            } else {
                for pair in raw.chunks_exact(16) {
                    let a_type = read_word(pair, 0);
                    if a_type == AT_NULL {
                        break;
                    }
                    entries.push(AuxvEntry { a_type, a_val: read_word(pair, 8) });
                }
            }
            entries
        }
    } else {
        fn parse_raw(raw: &[u8]) -> Vec<AuxvEntry> {
            let mut entries = Vec::new();
            for pair in raw.chunks_exact(8) {
                let a_type = read_word32(pair, 0);
                if a_type == AT_NULL {
                    break;
                }
                entries.push(AuxvEntry { a_type, a_val: read_word32(pair, 4) });
            }
            entries
        }
    }
}

impl<T: Target> ProcessSymbols<T> {
    /// Re-read the target's auxiliary vector. Leaves the vector unset when
    /// the target cannot provide one (idle targets, read failures).
    pub(crate) fn read_auxv_vec(&mut self) {
        self.auxv = None;

        if self.target.state() == TargetState::Idle {
            return;
        }

        let raw = match self.target.read_auxv() {
            Ok(raw) => raw,
            Err(e) => {
                debug_print!("reading auxv failed: {}", e);
                return;
            }
        };

        let mut entries = parse_raw(&raw);

        // Some kernels hand out a vector whose AT_BASE entry is zero or
        // missing entirely; recover the interpreter base from the mapping
        // named like the dynamic linker.
        let base_idx = entries.iter().position(|e| e.a_type == AT_BASE);
        if base_idx.map_or(true, |i| entries[i].a_val == 0) {
            if let Some(addr) = self.find_interp_base() {
                match base_idx {
                    Some(i) => entries[i].a_val = addr,
                    None => entries.push(AuxvEntry {
                        a_type: AT_BASE,
                        a_val: addr,
                    }),
                }
            }
        }

        entries.push(AuxvEntry {
            a_type: AT_NULL,
            a_val: 0,
        });
        self.auxv = Some(entries);
    }

    /// Base address of a mapping that looks like the dynamic linker
    /// (`ld-*.so` and friends).
    fn find_interp_base(&mut self) -> Option<u64> {
        let looks_like_interp = |name: &str| {
            !name.is_empty()
                && (name.contains("/ld-") || name.rsplit('/').next().unwrap_or(name).starts_with("ld-"))
        };

        // The mapping model may not be built yet (the auxv is read before
        // the first snapshot lands), so ask the source directly.
        if let Some(m) = self
            .mappings
            .iter()
            .find(|m| looks_like_interp(&m.pmap.mapname))
        {
            return Some(m.pmap.vaddr);
        }
        self.target
            .mapping_snapshot()
            .ok()?
            .iter()
            .find(|m| looks_like_interp(&m.mapname))
            .map(|m| m.vaddr)
    }

    /// The value of the auxiliary vector entry of type `ty`, or `None` when
    /// the entry is absent or no vector could be read.
    pub fn getauxval(&mut self, ty: u64) -> Option<u64> {
        if self.auxv.is_none() {
            self.read_auxv_vec();
        }
        self.auxv
            .as_ref()?
            .iter()
            .take_while(|e| e.a_type != AT_NULL)
            .find(|e| e.a_type == ty)
            .map(|e| e.a_val)
    }

    /// The whole normalized vector, always terminated by an `AT_NULL` entry.
    pub fn getauxvec(&mut self) -> &[AuxvEntry] {
        if self.auxv.is_none() {
            self.read_auxv_vec();
        }
        match &self.auxv {
            Some(v) => v,
            None => &EMPTY_AUXV,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn native_pairs(entries: &[(u64, u64)]) -> Vec<u8> {
        let mut raw = Vec::new();
        for &(t, v) in entries {
            raw.extend_from_slice(&(t as usize).to_ne_bytes());
            raw.extend_from_slice(&(v as usize).to_ne_bytes());
        }
        raw
    }

    #[test]
    fn parses_native_vector() {
        let raw = native_pairs(&[
            (AT_SYSINFO_EHDR, 0x7fff_f7fd_1000),
            (AT_PAGESZ, 4096),
            (AT_ENTRY, 0x40_1000),
            (AT_NULL, 0),
        ]);
        let entries = parse_raw(&raw);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].a_type, AT_ENTRY);
        assert_eq!(entries[2].a_val, 0x40_1000);
    }

    #[test]
    fn stops_at_null() {
        let raw = native_pairs(&[(AT_PAGESZ, 4096), (AT_NULL, 0), (AT_ENTRY, 0xdead)]);
        let entries = parse_raw(&raw);
        assert_eq!(entries.len(), 1);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn widens_packed_32bit_vector() {
        let mut raw = Vec::new();
        for &(t, v) in &[(AT_PAGESZ, 4096u32), (AT_BASE, 0xf7ff_0000), (0, 0)] {
            raw.extend_from_slice(&(t as u32).to_ne_bytes());
            raw.extend_from_slice(&v.to_ne_bytes());
        }
        let entries = parse_raw(&raw);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].a_type, AT_PAGESZ);
        assert_eq!(entries[0].a_val, 4096);
        assert_eq!(entries[1].a_val, 0xf7ff_0000);
    }
}
