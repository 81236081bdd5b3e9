//! Symbol resolution for a target process, live or post-mortem.
//!
//! A [`ProcessSymbols`] handle models the target's address-space mappings,
//! associates each mapping with its backing object file, indexes the symbol
//! tables found in those objects (or synthesized from target memory when the
//! on-disk file has drifted from the loaded image), and answers the two
//! queries an inspector needs: address to symbol and name to symbol.
//!
//! Everything is read through a [`Target`], so the same handle works against
//! `/proc` ([`LiveTarget`]), a core-file reader, or a test fixture. All
//! symbol tables are built lazily, on the first query touching an object.

#[cfg(feature = "debug-logs")]
macro_rules! debug_print {
    ($($arg:tt)*) => {
        eprintln!("proc-symtab: {}", format_args!($($arg)*))
    };
}

#[cfg(not(feature = "debug-logs"))]
macro_rules! debug_print {
    ($($arg:tt)*) => {{
        // Type-check the arguments without evaluating them.
        let _ = || {
            let _ = format_args!($($arg)*);
        };
    }};
}

pub mod auxv;
mod ctf;
mod elf;
mod error;
mod lookup;
mod maps;
mod object;
mod symtab;
mod target;

pub use auxv::AuxvEntry;
pub use ctf::CtfData;
pub use error::Error;
pub use goblin;
pub use goblin::elf::sym::Sym;
pub use lookup::{SymFilter, SymInfo, SymOrder, WhichTable};
pub use maps::{parse_maps, MapFlags, MapRecord};
pub use object::LoadObject;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use target::LiveTarget;
pub use target::{Target, TargetState};

use maps::MappingInfo;
use object::FileInfo;

/// Identifier of one of the dynamic linker's namespaces.
pub type Lmid = i64;

/// Wildcard matching every link map.
pub const PR_LMID_EVERY: Lmid = -1;
/// The base link map, where the executable and its direct dependencies live.
pub const LM_ID_BASE: Lmid = 0;

/// Selects the load object a query applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjSelector<'a> {
    /// Every loaded object.
    Every,
    /// The executable.
    Exec,
    /// The dynamic linker.
    Ldso,
    /// A full path, a basename, or a basename prefix up to a `.` suffix.
    Name(&'a str),
}

impl<'a> From<&'a str> for ObjSelector<'a> {
    fn from(name: &'a str) -> Self {
        ObjSelector::Name(name)
    }
}

/// Handle construction knobs.
#[derive(Debug, Default, Clone)]
pub struct Options {
    /// Skip building sorted symbol indexes and use linear lookups instead.
    /// Worth it only for huge symbol tables that will see few queries.
    pub no_sort: bool,
}

/// The symbol-resolution model of one target process.
///
/// Not shareable for mutation; lookups take `&mut self` because they may
/// lazily refresh mappings and ingest object files on the way.
pub struct ProcessSymbols<T: Target> {
    pub(crate) target: T,
    pub(crate) mappings: Vec<MappingInfo>,
    /// Object registry; slot ids are stable and never reused, iteration in
    /// slot order is discovery order.
    pub(crate) files: Vec<Option<FileInfo>>,
    pub(crate) num_files: usize,
    pub(crate) map_exec: Option<usize>,
    pub(crate) map_ldso: Option<usize>,
    pub(crate) auxv: Option<Vec<AuxvEntry>>,
    pub(crate) info_valid: bool,
    pub(crate) rd_active: bool,
    pub(crate) no_sort: bool,
}

impl<T: Target> ProcessSymbols<T> {
    pub fn new(target: T) -> Self {
        Self::with_options(
            target,
            Options {
                no_sort: std::env::var_os("PROC_SYMTAB_NO_SORT").is_some(),
            },
        )
    }

    pub fn with_options(target: T, options: Options) -> Self {
        Self {
            target,
            mappings: Vec::new(),
            files: Vec::new(),
            num_files: 0,
            map_exec: None,
            map_ldso: None,
            auxv: None,
            info_valid: false,
            rd_active: false,
            no_sort: options.no_sort,
        }
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    /// Mutable access to the underlying target. Changing what it reports
    /// does not invalidate the model; call
    /// [`invalidate_maps`](Self::invalidate_maps) when the mappings may
    /// have moved.
    pub fn target_mut(&mut self) -> &mut T {
        &mut self.target
    }

    /// Throw the whole model away. The next query rebuilds from scratch.
    pub fn reset_maps(&mut self) {
        self.mappings.clear();
        self.files.clear();
        self.num_files = 0;
        self.map_exec = None;
        self.map_ldso = None;
        self.auxv = None;
        self.info_valid = false;
    }

    /// Note that the target's mappings may have changed (an exec, a dlopen,
    /// rtld activity); the next query triggers a refresh.
    pub fn invalidate_maps(&mut self) {
        self.info_valid = false;
    }

    /// Refresh the mappings and eagerly build every object's symbol tables
    /// and CTF data instead of waiting for the first lookup.
    pub fn update_syms(&mut self) {
        self.update_maps();
        for fid in self.file_ids() {
            self.build_file_symtab(fid);
            let _ = self.build_file_ctf(fid);
        }
    }

    /// Bring up the dynamic-linker view: make sure the static exec/ldso
    /// bindings exist and run one load-object iteration. True once records
    /// from the linker agent have been applied.
    pub(crate) fn rd_agent(&mut self) -> bool {
        if self.rd_active {
            return true;
        }
        if self.target.state() == TargetState::Idle {
            return false;
        }
        self.update_maps();
        if self.num_files == 0 {
            self.load_static_maps();
        }
        self.rd_active = self.iter_load_objects();
        self.rd_active
    }

    /// Pull the current load-object records from the target and apply them.
    pub(crate) fn iter_load_objects(&mut self) -> bool {
        let mut records = Vec::new();
        match self.target.load_objects(&mut |lop| records.push(lop.clone())) {
            Ok(_) => {
                for lop in &records {
                    self.apply_load_object(lop);
                }
                true
            }
            Err(_) => false,
        }
    }

    /// One load-object record: bind the mapping containing its base to an
    /// object record, install the descriptor, and resolve the object's
    /// human-readable name.
    fn apply_load_object(&mut self, lop: &LoadObject) {
        debug_print!("encountered rd object at {:#x}", lop.base);

        let mi = match self.addr2mptr(lop.base) {
            Some(mi) => mi,
            None => {
                debug_print!("load object base matches no mapping");
                return;
            }
        };
        let fid = match self.mappings[mi].file {
            Some(fid) => fid,
            None => self.file_info_new(mi),
        };

        let lname = match &lop.name {
            Some(name) => Some(name.clone()),
            None if lop.nameaddr != 0 => {
                match self
                    .target
                    .read_string(lop.nameaddr, libc::PATH_MAX as usize)
                {
                    Ok(s) if !s.is_empty() => Some(s),
                    _ => {
                        debug_print!("failed to read string at {:#x}", lop.nameaddr);
                        None
                    }
                }
            }
            None => None,
        };

        let f = self.file_mut(fid);
        f.primary = Some(mi);
        let mut lo = lop.clone();
        // The record from the agent knows nothing about the PLT; keep what
        // ingest has already learned.
        lo.plt_base = f.plt_base;
        lo.plt_size = f.plt_size;
        f.lo = Some(lo);
        f.lname = lname;

        debug_print!(
            "loaded rd object {} lmid {:#x}",
            self.file(fid).lname.as_deref().unwrap_or("<unknown>"),
            lop.lmid
        );
    }

    /// Give the mapping at `mi` an object record and a synthesized
    /// load-object descriptor covering exactly that mapping.
    fn map_set(&mut self, mi: usize, lname: &str) {
        let fid = match self.mappings[mi].file {
            Some(fid) => fid,
            None => self.file_info_new(mi),
        };
        let (vaddr, size) = {
            let pmap = &self.mappings[mi].pmap;
            (pmap.vaddr, pmap.size)
        };

        let f = self.file_mut(fid);
        f.primary = Some(mi);
        f.lo = Some(LoadObject {
            base: vaddr,
            end: vaddr + size,
            data_base: f.data_start.unwrap_or(0),
            plt_base: f.plt_base,
            plt_size: f.plt_size,
            ..LoadObject::default()
        });
        if f.lname.is_none() {
            f.lname = Some(lname.to_string());
        }
    }

    /// Bind the executable and (if present) the dynamic linker before any
    /// linker agent is available, so lookups against them work immediately.
    pub(crate) fn load_static_maps(&mut self) {
        if let Some(mi) = self.object_name_to_map(PR_LMID_EVERY, ObjSelector::Exec) {
            let lname = self
                .target
                .exe_path()
                .unwrap_or_else(|| "a.out".to_string());
            self.map_set(mi, &lname);
        }

        if self.getauxval(auxv::AT_BASE).is_some() {
            if let Some(mi) = self.object_name_to_map(PR_LMID_EVERY, ObjSelector::Ldso) {
                self.map_set(mi, "ld.so.1");
            }
        }
    }
}
