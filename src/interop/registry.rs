//! Symbol & library registry - load-time tables of native routines
//!
//! Design: Single-writer during library load (serialized by the loader),
//! lock-free multi-reader afterwards. Each library keeps one replaceable
//! symbol table per registration batch kind plus two loader flags; a
//! process-wide table stores cross-library exported entries.

use super::types::NativeAddress;
use crate::logging::{debug, log_symbol_registration, warn};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Registration batch kind for a routine table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BatchKind {
    C,
    Call,
    Fortran,
    External,
}

impl BatchKind {
    pub const COUNT: usize = 4;

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Decode the ABI batch-kind integer
    pub const fn from_index(index: i32) -> Option<Self> {
        match index {
            0 => Some(Self::C),
            1 => Some(Self::Call),
            2 => Some(Self::Fortran),
            3 => Some(Self::External),
            _ => None,
        }
    }
}

/// One entry of a native registration table
#[derive(Debug, Clone)]
pub struct RoutineEntry {
    pub name: String,
    pub address: NativeAddress,
    pub arity: i32,
}

/// Resolved native symbol descriptor
#[derive(Debug)]
pub struct NativeSymbol {
    pub name: String,
    pub address: NativeAddress,
    pub arity: i32,
    pub library: String,
}

/// Handle for one loaded native library
pub struct Library {
    name: String,
    path: Option<String>,
    batches: RwLock<[Option<Vec<Arc<NativeSymbol>>>; BatchKind::COUNT]>,
    use_dynamic_symbols: AtomicBool,
    force_symbols: AtomicBool,
}

impl Library {
    fn new(name: &str, path: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            path: path.map(str::to_string),
            batches: RwLock::new([None, None, None, None]),
            use_dynamic_symbols: AtomicBool::new(true),
            force_symbols: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Resolve `entries` into symbol descriptors and store them under
    /// `kind`, replacing any prior table for that kind
    pub fn register_routines(&self, kind: BatchKind, entries: &[RoutineEntry]) {
        let symbols: Vec<Arc<NativeSymbol>> = entries
            .iter()
            .map(|e| {
                Arc::new(NativeSymbol {
                    name: e.name.clone(),
                    address: e.address,
                    arity: e.arity,
                    library: self.name.clone(),
                })
            })
            .collect();

        let mut batches = self.batches.write();
        if batches[kind.index()].is_some() {
            debug!(
                event = "batch_replaced",
                library = %self.name,
                kind = ?kind,
                "Replacing prior routine table"
            );
        }
        batches[kind.index()] = Some(symbols);
        log_symbol_registration(&self.name, entries.len());
    }

    /// Update one entry of an already-registered batch in place
    pub fn set_dot_symbol_values(
        &self,
        kind: BatchKind,
        index: usize,
        name: &str,
        address: NativeAddress,
        arity: i32,
    ) -> Result<(), RegistryError> {
        let mut batches = self.batches.write();
        let table = batches[kind.index()]
            .as_mut()
            .ok_or(RegistryError::BatchNotRegistered { kind })?;
        let slot = table
            .get_mut(index)
            .ok_or(RegistryError::IndexOutOfRange { kind, index })?;
        *slot = Arc::new(NativeSymbol {
            name: name.to_string(),
            address,
            arity,
            library: self.name.clone(),
        });
        Ok(())
    }

    /// Look up a symbol by name in one batch kind
    pub fn find_in_batch(&self, kind: BatchKind, name: &str) -> Option<Arc<NativeSymbol>> {
        self.batches.read()[kind.index()]
            .as_ref()
            .and_then(|table| table.iter().find(|s| s.name == name).cloned())
    }

    /// Look up a symbol by name across all batch kinds
    pub fn find_symbol(&self, name: &str) -> Option<Arc<NativeSymbol>> {
        let batches = self.batches.read();
        batches
            .iter()
            .flatten()
            .flat_map(|table| table.iter())
            .find(|s| s.name == name)
            .cloned()
    }

    /// Symbols registered across all batches
    pub fn symbol_count(&self) -> usize {
        self.batches
            .read()
            .iter()
            .flatten()
            .map(|table| table.len())
            .sum()
    }

    pub fn set_use_dynamic_symbols(&self, flag: bool) {
        self.use_dynamic_symbols.store(flag, Ordering::Relaxed);
    }

    pub fn use_dynamic_symbols(&self) -> bool {
        self.use_dynamic_symbols.load(Ordering::Relaxed)
    }

    pub fn set_force_symbols(&self, flag: bool) {
        self.force_symbols.store(flag, Ordering::Relaxed);
    }

    pub fn force_symbols(&self) -> bool {
        self.force_symbols.load(Ordering::Relaxed)
    }
}

/// Registry lookup failures (recoverable, never defects)
#[derive(Debug, PartialEq, Eq)]
pub enum RegistryError {
    SymbolNotFound { library: String, function: String },
    BatchNotRegistered { kind: BatchKind },
    IndexOutOfRange { kind: BatchKind, index: usize },
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SymbolNotFound { library, function } => {
                write!(f, "function '{}' not provided by package '{}'", function, library)
            }
            Self::BatchNotRegistered { kind } => {
                write!(f, "no routine table registered for kind {:?}", kind)
            }
            Self::IndexOutOfRange { kind, index } => {
                write!(f, "routine index {} out of range for kind {:?}", index, kind)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Process-wide registry of libraries and cross-library entries
pub struct LibraryRegistry {
    libraries: DashMap<String, Arc<Library>>,
    ccallables: DashMap<(String, String), NativeAddress>,
}

impl LibraryRegistry {
    pub fn new() -> Self {
        Self {
            libraries: DashMap::new(),
            ccallables: DashMap::new(),
        }
    }

    /// Create (or return) the handle for a loading library
    pub fn open_library(&self, name: &str, path: Option<&str>) -> Arc<Library> {
        self.libraries
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Library::new(name, path)))
            .value()
            .clone()
    }

    /// Drop a library's tables at unload
    pub fn close_library(&self, name: &str) {
        if self.libraries.remove(name).is_none() {
            warn!(event = "close_unknown_library", library = name);
        }
        self.ccallables.retain(|(lib, _), _| lib.as_str() != name);
    }

    pub fn get_library(&self, name: &str) -> Option<Arc<Library>> {
        self.libraries.get(name).map(|entry| entry.value().clone())
    }

    /// Add a cross-library exported entry
    ///
    /// Must only be called after the owning library loaded; an unknown
    /// library here is an internal invariant violation.
    pub fn register_ccallable(&self, library: &str, function: &str, address: NativeAddress) {
        if !self.libraries.contains_key(library) {
            crate::defect!("ccallable registered for unloaded library '{}'", library);
        }
        self.ccallables
            .insert((library.to_string(), function.to_string()), address);
    }

    /// Look up a cross-library entry; absence is a recoverable failure
    pub fn get_ccallable(
        &self,
        library: &str,
        function: &str,
    ) -> Result<NativeAddress, RegistryError> {
        self.ccallables
            .get(&(library.to_string(), function.to_string()))
            .map(|entry| *entry.value())
            .ok_or_else(|| RegistryError::SymbolNotFound {
                library: library.to_string(),
                function: function.to_string(),
            })
    }

    /// Resolve a symbol by name across every loaded library
    pub fn find_symbol(&self, name: &str) -> Option<Arc<NativeSymbol>> {
        self.libraries
            .iter()
            .find_map(|entry| entry.value().find_symbol(name))
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            libraries: self.libraries.len(),
            symbols: self
                .libraries
                .iter()
                .map(|entry| entry.value().symbol_count())
                .sum(),
            ccallables: self.ccallables.len(),
        }
    }
}

impl Default for LibraryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry statistics for monitoring
#[derive(Debug, Clone, Copy)]
pub struct RegistryStats {
    pub libraries: usize,
    pub symbols: usize,
    pub ccallables: usize,
}

// ============================================================================
// Shared-object loading (dlopen / LoadLibrary)
// ============================================================================

/// Handle to a dynamically loaded shared object
///
/// Used when a registered library is backed by a real native binary and
/// routine addresses must be resolved from its export table.
pub struct SharedObject {
    handle: *mut core::ffi::c_void,
}

/// Shared-object loading errors
#[derive(Debug)]
pub enum LoadError {
    InvalidName,
    LoadFailed(String),
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidName => write!(f, "invalid library name"),
            Self::LoadFailed(msg) => write!(f, "failed to load library: {}", msg),
        }
    }
}

impl std::error::Error for LoadError {}

impl SharedObject {
    #[cfg(unix)]
    pub fn open(path: &str) -> Result<Self, LoadError> {
        use std::ffi::CString;

        let cpath = CString::new(path).map_err(|_| LoadError::InvalidName)?;
        let handle = unsafe { libc::dlopen(cpath.as_ptr(), libc::RTLD_NOW) };
        if handle.is_null() {
            let msg = unsafe {
                let err = libc::dlerror();
                if err.is_null() {
                    "unknown error".to_string()
                } else {
                    std::ffi::CStr::from_ptr(err).to_string_lossy().into_owned()
                }
            };
            return Err(LoadError::LoadFailed(msg));
        }
        Ok(Self { handle })
    }

    #[cfg(windows)]
    pub fn open(path: &str) -> Result<Self, LoadError> {
        use std::ffi::OsStr;
        use std::os::windows::ffi::OsStrExt;
        use winapi::um::errhandlingapi::GetLastError;
        use winapi::um::libloaderapi::LoadLibraryW;

        let wide: Vec<u16> = OsStr::new(path).encode_wide().chain(Some(0)).collect();
        let handle = unsafe { LoadLibraryW(wide.as_ptr()) };
        if handle.is_null() {
            let code = unsafe { GetLastError() };
            return Err(LoadError::LoadFailed(format!("error code {}", code)));
        }
        Ok(Self {
            handle: handle as *mut core::ffi::c_void,
        })
    }

    /// Resolve an exported symbol to its address
    #[cfg(unix)]
    pub fn symbol(&self, name: &str) -> Option<NativeAddress> {
        use std::ffi::CString;

        let cname = CString::new(name).ok()?;
        let ptr = unsafe { libc::dlsym(self.handle, cname.as_ptr()) };
        if ptr.is_null() {
            None
        } else {
            Some(NativeAddress::new(ptr as usize))
        }
    }

    #[cfg(windows)]
    pub fn symbol(&self, name: &str) -> Option<NativeAddress> {
        use std::ffi::CString;
        use winapi::um::libloaderapi::GetProcAddress;

        let cname = CString::new(name).ok()?;
        let ptr = unsafe {
            GetProcAddress(
                self.handle as winapi::shared::minwindef::HMODULE,
                cname.as_ptr(),
            )
        };
        if ptr.is_null() {
            None
        } else {
            Some(NativeAddress::new(ptr as usize))
        }
    }
}

impl Drop for SharedObject {
    #[cfg(unix)]
    fn drop(&mut self) {
        unsafe {
            libc::dlclose(self.handle);
        }
    }

    #[cfg(windows)]
    fn drop(&mut self) {
        use winapi::um::libloaderapi::FreeLibrary;
        unsafe {
            FreeLibrary(self.handle as winapi::shared::minwindef::HMODULE);
        }
    }
}

unsafe impl Send for SharedObject {}
unsafe impl Sync for SharedObject {}
