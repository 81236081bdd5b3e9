use crate::{object::FileId, Lmid, ObjSelector, ProcessSymbols, Target, PR_LMID_EVERY};

/// The located CTF data of one object, plus the symbol and string sections
/// an external CTF opener needs to resolve its references.
#[derive(Debug)]
pub struct CtfData<'a> {
    pub data: &'a [u8],
    pub symtab: &'a [u8],
    pub strtab: &'a [u8],
    pub sym_entsize: u64,
    /// True when the references resolve against `.dynsym`/`.dynstr`.
    pub from_dynsym: bool,
}

impl<T: Target> ProcessSymbols<T> {
    /// Read (once) and hand out the object's CTF section.
    pub(crate) fn build_file_ctf(&mut self, fid: FileId) -> Option<CtfData<'_>> {
        self.build_file_symtab(fid);

        let (offset, size, from_dynsym) = {
            let f = self.file(fid);
            let loc = f.ctf?;
            if loc.size == 0 {
                return None;
            }
            let symp = if loc.dynsym { &f.dynsym } else { &f.symtab };
            if !symp.has_primary() {
                return None;
            }
            (loc.offset, loc.size, loc.dynsym)
        };

        if self.file(fid).ctf_buf.is_none() {
            use std::os::unix::fs::FileExt;
            let mut buf = vec![0u8; size as usize];
            let ok = match &self.file(fid).fd {
                Some(fd) => fd.read_exact_at(&mut buf, offset).is_ok(),
                None => false,
            };
            if !ok {
                debug_print!("failed to read CTF data");
                return None;
            }
            debug_print!("loaded {} bytes of CTF data", size);
            self.file_mut(fid).ctf_buf = Some(buf);
        }

        let f = self.file(fid);
        let symp = if from_dynsym { &f.dynsym } else { &f.symtab };
        Some(CtfData {
            data: f.ctf_buf.as_ref().unwrap(),
            symtab: &symp.pri_raw,
            strtab: &symp.strs,
            sym_entsize: symp.pri_entsize,
            from_dynsym,
        })
    }

    /// CTF data of the object containing `addr`.
    pub fn addr_to_ctf(&mut self, addr: u64) -> Option<CtfData<'_>> {
        if !self.info_valid {
            self.update_maps();
        }
        let mi = self.addr2mptr(addr)?;
        let fid = self.mappings[mi].file?;
        self.build_file_ctf(fid)
    }

    /// CTF data of the named object on the given link map.
    pub fn lmid_to_ctf(&mut self, lmid: Lmid, sel: ObjSelector<'_>) -> Option<CtfData<'_>> {
        let mi = self.object_name_to_map(lmid, sel)?;
        let fid = self.mappings[mi].file?;
        self.build_file_ctf(fid)
    }

    /// CTF data of the named object on any link map.
    pub fn name_to_ctf(&mut self, sel: ObjSelector<'_>) -> Option<CtfData<'_>> {
        self.lmid_to_ctf(PR_LMID_EVERY, sel)
    }
}
