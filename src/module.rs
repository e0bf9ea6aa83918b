//! The modules of the process being unwound, keyed by address range.
//!
//! A [`ModuleTable`] is owned by the caller and rebuilt before an unwind
//! session, either from `/proc/<pid>/maps` (another process, or this one if
//! reading files is fine) or from the dynamic linker's list of loaded objects
//! (this process, without touching the file system). Every rebuild bumps a
//! generation counter, so a [`ModuleRef`] from an older session can be told
//! apart from a current one.
//!
//! Images of modules found through the maps are loaded on first use: the
//! backing file is `mmap`ed read-only and stays mapped until the table is
//! cleared.


mod divination;

use core::fmt::Write;
use core::ptr;

use arrayvec::{ArrayString, ArrayVec};

use crate::elf::ModuleImage;
use crate::maps::MapEntry;
use crate::memory::MemoryView;
use crate::stdext::{self, Fd};
use crate::{Error, Result, MAX_MODULES, PATH_CAPACITY};

/// Names a module of a particular generation of a [`ModuleTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleRef {
    pub generation: u64,
    pub index: usize,
}

/// A read-only private file mapping, unmapped on drop.
#[derive(Debug)]
struct Mapping {
    addr: usize,
    len: usize,
}

impl Mapping {
    fn of_file(fd: &Fd, len: usize) -> Result<Mapping> {
        // SAFETY: a fresh mapping chosen by the kernel aliases nothing.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                fd.raw(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            stdext::with_last_os_error_str(|err| debug!("mmap failed: {err}"));
            return Err(Error::Os(stdext::errno()));
        }
        Ok(Mapping {
            addr: addr.expose_provenance(),
            len,
        })
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: we created this mapping and nothing borrows it past the
        // module that owns us.
        unsafe { libc::munmap(ptr::with_exposed_provenance_mut(self.addr), self.len) };
    }
}

#[derive(Debug)]
pub struct Module {
    /// Executable address range `[start, end)` in the target.
    pub start: usize,
    pub end: usize,
    /// `pc - load_bias` is the relative pc the image understands.
    pub load_bias: usize,
    pub name: ArrayString<PATH_CAPACITY>,
    // field order matters: the image points into the mapping
    image: Option<ModuleImage<'static>>,
    mapping: Option<Mapping>,
    /// Loading the image failed once; do not try again.
    load_failed: bool,
}

impl Module {
    fn new(start: usize, end: usize, load_bias: usize, name: &str) -> Module {
        let mut module = Module {
            start,
            end,
            load_bias,
            name: ArrayString::new(),
            image: None,
            mapping: None,
            load_failed: false,
        };
        for c in name.chars() {
            if module.name.try_push(c).is_err() {
                break;
            }
        }
        module
    }

    pub fn contains(&self, pc: usize) -> bool {
        (self.start..self.end).contains(&pc)
    }

    pub fn relative_pc(&self, pc: usize) -> usize {
        pc.wrapping_sub(self.load_bias)
    }

    /// The parsed image, if it is loaded.
    pub fn image(&self) -> Option<&ModuleImage<'static>> {
        self.image.as_ref()
    }

    fn ensure_loaded(&mut self) {
        if self.image.is_some() || self.load_failed {
            return;
        }
        match self.load_file() {
            Ok(()) => {}
            Err(err) => {
                debug!(name = %self.name, ?err, "could not load module image");
                self.load_failed = true;
            }
        }
    }

    #[instrument(level = "debug", skip(self), fields(name = %self.name))]
    fn load_file(&mut self) -> Result<()> {
        let mut buf = [0; PATH_CAPACITY + 1];
        let path = stdext::path_cstr(&self.name, &mut buf)?;
        let fd = Fd::open_read_only(path)?;
        let len = fd.size()?;
        let mapping = Mapping::of_file(&fd, len)?;

        // SAFETY: the mapping lives as long as the image, both are dropped
        // together when the module goes away.
        let view = unsafe { MemoryView::local(mapping.addr, mapping.len) };
        let image = ModuleImage::load(view)?;

        self.image = Some(image);
        self.mapping = Some(mapping);
        Ok(())
    }
}

#[derive(Debug)]
pub struct ModuleTable {
    generation: u64,
    modules: ArrayVec<Module, MAX_MODULES>,
}

impl Default for ModuleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleTable {
    pub const fn new() -> ModuleTable {
        ModuleTable {
            generation: 0,
            modules: ArrayVec::new_const(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    pub fn get(&self, module: ModuleRef) -> Option<&Module> {
        if module.generation != self.generation {
            return None;
        }
        self.modules.get(module.index)
    }

    /// Forgets every module and unmaps their images.
    pub fn clear(&mut self) {
        self.modules.clear();
        self.generation = self.generation.wrapping_add(1);
    }

    /// Adds the module behind an executable file mapping. Other mappings are
    /// skipped, which is why this returns whether anything was added.
    pub fn push_mapping(&mut self, entry: &MapEntry) -> Result<bool> {
        if !entry.perms.execute || !entry.is_file() {
            return Ok(false);
        }
        let module = Module::new(entry.start, entry.end, entry.load_bias(), &entry.path);
        self.modules.try_push(module).map_err(|_| Error::TableFull)?;
        Ok(true)
    }

    /// Adds a module whose image the caller already has.
    pub fn push_image(
        &mut self,
        start: usize,
        end: usize,
        load_bias: usize,
        name: &str,
        image: Option<ModuleImage<'static>>,
    ) -> Result<()> {
        let mut module = Module::new(start, end, load_bias, name);
        module.load_failed = image.is_none();
        module.image = image;
        self.modules.try_push(module).map_err(|_| Error::TableFull)
    }

    /// Replaces the table with the executable file mappings of `pid`.
    #[instrument(level = "debug", skip(self))]
    pub fn rebuild_from_proc_maps(&mut self, pid: libc::pid_t) -> Result<()> {
        self.clear();

        let mut path = ArrayString::<32>::new();
        write!(path, "/proc/{pid}/maps").map_err(|_| Error::PathTooLong)?;
        let mut buf = [0; PATH_CAPACITY + 1];
        let path = stdext::path_cstr(&path, &mut buf)?;

        let mut result = Ok(());
        stdext::for_each_line(path, |line| {
            if result.is_err() {
                return;
            }
            let Some(entry) = core::str::from_utf8(line).ok().and_then(MapEntry::parse) else {
                trace!("skipping unparsable maps line");
                return;
            };
            if let Err(err) = self.push_mapping(&entry) {
                result = Err(err);
            }
        })?;
        debug!(modules = self.modules.len(), "read {}", path.to_str().unwrap_or("maps"));
        result
    }

    /// Replaces the table with the objects the dynamic linker loaded into this
    /// process. Their images are read in place.
    #[instrument(level = "debug", skip(self))]
    pub fn rebuild_from_loaded_objects(&mut self) -> Result<()> {
        self.clear();
        divination::loaded_objects(self)?;
        debug!(modules = self.modules.len(), "enumerated loaded objects");
        Ok(())
    }

    /// Finds the module containing `pc`, loading its image if that did not
    /// happen yet.
    pub fn resolve(&mut self, pc: usize) -> Option<ModuleRef> {
        let index = self.modules.iter().position(|m| m.contains(pc))?;
        self.modules[index].ensure_loaded();
        Some(ModuleRef {
            generation: self.generation,
            index,
        })
    }
}
