use crate::{maps::MapRecord, object::LoadObject, Error};
use std::path::PathBuf;

/// Liveness of the inspected process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    /// A running process; object files can be opened through the target.
    Live,
    /// A post-mortem image; files are located by their recorded names.
    Core,
    /// A bare object file with no process behind it.
    Idle,
}

/// Everything the resolver needs from the process it inspects.
///
/// The resolver does not attach, stop, or otherwise control the target; it
/// only consumes the narrow read surface below. Implementations decide where
/// the bytes come from: `/proc` for a live pid ([`LiveTarget`]), note
/// sections for a core reader, fixtures for tests.
pub trait Target {
    fn state(&self) -> TargetState;

    /// Fill `buf` from the target's virtual address space at `addr`.
    fn read_mem(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), Error>;

    /// The target's memory mappings, sorted by base address.
    fn mapping_snapshot(&mut self) -> Result<Vec<MapRecord>, Error>;

    /// The raw auxiliary vector image, in the target's own word size.
    fn read_auxv(&mut self) -> Result<Vec<u8>, Error>;

    /// Path of the running executable, if it can be determined.
    fn exe_path(&mut self) -> Option<String>;

    /// Path under which the object backing `mapname` can be opened.
    fn object_path(&self, mapname: &str) -> PathBuf;

    /// Yield one record per load object known to the dynamic linker's debug
    /// interface, returning how many were reported.
    fn load_objects(&mut self, f: &mut dyn FnMut(&LoadObject)) -> Result<usize, Error>;

    /// Read a NUL-terminated string of at most `max` bytes from `addr`.
    fn read_string(&mut self, addr: u64, max: usize) -> Result<String, Error> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 64];
        while out.len() < max {
            let want = chunk.len().min(max - out.len());
            self.read_mem(addr + out.len() as u64, &mut chunk[..want])?;
            match chunk[..want].iter().position(|&b| b == 0) {
                Some(nul) => {
                    out.extend_from_slice(&chunk[..nul]);
                    return Ok(String::from_utf8_lossy(&out).into_owned());
                }
                None => out.extend_from_slice(&chunk[..want]),
            }
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        use std::io::Read;

        /// A [`Target`] backed by the `/proc` filesystem of a live process.
        ///
        /// The caller is responsible for having whatever ptrace/yama
        /// permissions reading `/proc/<pid>/mem` requires; this type does not
        /// attach to the process.
        pub struct LiveTarget {
            pid: u32,
            mem: Option<std::fs::File>,
        }

        impl LiveTarget {
            pub fn new(pid: u32) -> Self {
                Self { pid, mem: None }
            }

            pub fn pid(&self) -> u32 {
                self.pid
            }

            fn mem(&mut self) -> Result<&std::fs::File, Error> {
                if self.mem.is_none() {
                    self.mem = Some(std::fs::File::open(format!("/proc/{}/mem", self.pid))?);
                }
                Ok(self.mem.as_ref().unwrap())
            }
        }

        impl Target for LiveTarget {
            fn state(&self) -> TargetState {
                TargetState::Live
            }

            fn read_mem(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), Error> {
                use std::os::unix::fs::FileExt;
                self.mem()?
                    .read_exact_at(buf, addr)
                    .map_err(|_| Error::TargetUnreadable(addr))
            }

            fn mapping_snapshot(&mut self) -> Result<Vec<MapRecord>, Error> {
                let mut text = String::new();
                std::fs::File::open(format!("/proc/{}/maps", self.pid))?
                    .read_to_string(&mut text)?;
                Ok(crate::maps::parse_maps(&text))
            }

            fn read_auxv(&mut self) -> Result<Vec<u8>, Error> {
                Ok(std::fs::read(format!("/proc/{}/auxv", self.pid))?)
            }

            fn exe_path(&mut self) -> Option<String> {
                std::fs::read_link(format!("/proc/{}/exe", self.pid))
                    .ok()
                    .map(|p| p.to_string_lossy().into_owned())
            }

            fn object_path(&self, mapname: &str) -> PathBuf {
                // /proc/<pid>/maps reports the full path of the backing file,
                // so the mapname can be opened as-is.
                PathBuf::from(mapname)
            }

            fn load_objects(&mut self, _f: &mut dyn FnMut(&LoadObject)) -> Result<usize, Error> {
                // Walking the r_debug link map chain is the business of a
                // dynamic-linker agent, not of this reader.
                Err(Error::AgentUnavailable)
            }
        }
    }
}
