//! Low-level PE file format access through the goblin and pelite libraries

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::common::LookupError;
use crate::system::WinFileSystemCache;

pub const COFF_MACHINE_X86: u16 = goblin::pe::header::COFF_MACHINE_X86;
pub const COFF_MACHINE_ARMNT: u16 = goblin::pe::header::COFF_MACHINE_ARMNT;

/// One entry of a binary's import table
#[derive(Debug, Clone)]
pub struct PeImportDll {
    /// Dependency name as it appears in the import descriptor
    pub name: String,
    /// Whether the descriptor comes from the delay-load directory
    pub delay_load: bool,
    /// Symbols imported from this dependency (empty for ordinal-only imports)
    pub symbols: Vec<String>,
}

/// Owned, parsed representation of a PE-COFF file
///
/// This is the entire surface the resolution engine needs; everything else
/// in the file format is left to the parsing libraries.
#[derive(Debug, Clone)]
pub struct PeBinary {
    /// Location the file was parsed from
    pub filepath: PathBuf,
    /// DLL name recorded in the export directory, if any
    pub dll_name: Option<String>,
    /// COFF machine id
    pub machine: u16,
    /// 64-bit optional header
    pub is_64: bool,
    /// Import descriptors, in import-table order (regular table first,
    /// delay-load table after)
    pub imports: Vec<PeImportDll>,
    /// Exported symbol names
    pub exports: HashSet<String>,
}

impl PeBinary {
    pub fn parse<P: AsRef<Path>>(path: P, content: &[u8]) -> Result<Self, LookupError> {
        let goblin_pe = match goblin::Object::parse(content) {
            Ok(goblin::Object::PE(pe)) => Some(pe),
            Ok(other) => {
                tracing::debug!(path = ?path.as_ref(), format = ?other, "unexpected executable format");
                None
            }
            Err(e) => {
                tracing::debug!(path = ?path.as_ref(), error = %e, "goblin parse failed");
                None
            }
        };
        let pelite_pe = match pelite::PeFile::from_bytes(content) {
            Ok(pe) => Some(pe),
            Err(e) => {
                tracing::debug!(path = ?path.as_ref(), error = %e, "pelite parse failed");
                None
            }
        };

        if goblin_pe.is_none() && pelite_pe.is_none() {
            return Err(LookupError::ParseError(format!(
                "{} is not a valid PE-COFF file",
                path.as_ref().display()
            )));
        }

        let (machine, is_64) = if let Some(pe) = goblin_pe.as_ref() {
            (pe.header.coff_header.machine, pe.is_64)
        } else {
            match pelite_pe.as_ref().unwrap() {
                pelite::PeFile::T32(f) => {
                    use pelite::pe32::Pe;
                    (f.file_header().Machine, false)
                }
                pelite::PeFile::T64(f) => {
                    use pelite::pe64::Pe;
                    (f.file_header().Machine, true)
                }
            }
        };

        let mut imports = if let Some(pe) = goblin_pe.as_ref() {
            Self::read_imports_goblin(pe)
        } else {
            Self::read_imports_pelite(pelite_pe.as_ref().unwrap())
        };
        imports.extend(Self::read_delay_imports(pelite_pe.as_ref()));

        let exports = if let Some(pe) = goblin_pe.as_ref() {
            // prefer goblin since it seems to be less fragile
            pe.exports
                .iter()
                .filter_map(|e| e.name.map(str::to_owned))
                .collect()
        } else {
            Self::read_exports_pelite(pelite_pe.as_ref().unwrap())
        };

        let dll_name = pelite_pe
            .as_ref()
            .and_then(|pe| pe.exports().ok())
            .and_then(|ex| ex.dll_name().ok())
            .map(|n| n.to_string());

        Ok(Self {
            filepath: path.as_ref().to_owned(),
            dll_name,
            machine,
            is_64,
            imports,
            exports,
        })
    }

    fn read_imports_goblin(pe: &goblin::pe::PE) -> Vec<PeImportDll> {
        let by_dll: multimap::MultiMap<&str, &str> = pe
            .imports
            .iter()
            .map(|i| (i.dll, i.name.as_ref()))
            .collect();

        pe.libraries
            .iter()
            .map(|&lib| PeImportDll {
                name: lib.to_owned(),
                delay_load: false,
                symbols: by_dll
                    .get_vec(lib)
                    .map(|v| v.iter().map(|&s| s.to_owned()).collect())
                    .unwrap_or_default(),
            })
            .collect()
    }

    fn read_imports_pelite(pe: &pelite::PeFile) -> Vec<PeImportDll> {
        let mut ret = Vec::new();
        let descriptors = match pe.imports() {
            Ok(imports) => imports,
            // no import directory at all, e.g. in a resource-only DLL
            Err(pelite::Error::Null) => return ret,
            Err(e) => {
                tracing::debug!(error = %e, "could not read import directory");
                return ret;
            }
        };
        for desc in descriptors.iter() {
            if let Ok(dll_name) = desc.dll_name() {
                ret.push(PeImportDll {
                    name: dll_name.to_string(),
                    delay_load: false,
                    symbols: Vec::new(),
                });
            }
        }
        ret
    }

    fn read_delay_imports(pe: Option<&pelite::PeFile>) -> Vec<PeImportDll> {
        let mut ret = Vec::new();
        let Some(pe) = pe else {
            return ret;
        };
        let names: Vec<String> = match pe {
            pelite::PeFile::T32(f) => {
                use pelite::pe32::Pe;
                f.delay_load()
                    .map(|dl| {
                        dl.iter()
                            .filter_map(|desc| desc.dll_name().ok())
                            .map(|n| n.to_string())
                            .collect()
                    })
                    .unwrap_or_default()
            }
            pelite::PeFile::T64(f) => {
                use pelite::pe64::Pe;
                f.delay_load()
                    .map(|dl| {
                        dl.iter()
                            .filter_map(|desc| desc.dll_name().ok())
                            .map(|n| n.to_string())
                            .collect()
                    })
                    .unwrap_or_default()
            }
        };
        for name in names {
            ret.push(PeImportDll {
                name,
                delay_load: true,
                symbols: Vec::new(),
            });
        }
        ret
    }

    fn read_exports_pelite(pe: &pelite::PeFile) -> HashSet<String> {
        let exports = match pe.exports() {
            Ok(exports) => exports,
            // there is no export directory, e.g. in case of an executable
            Err(_) => return HashSet::new(),
        };
        let by = match exports.by() {
            Ok(by) => by,
            Err(_) => return HashSet::new(),
        };
        by.iter_names()
            .filter_map(|(name, _)| name.ok())
            .filter_map(|n| n.to_str().ok())
            .map(str::to_owned)
            .collect()
    }

    /// Display name: the export directory name if present, the file name otherwise
    pub fn name(&self) -> String {
        self.dll_name.clone().unwrap_or_else(|| {
            self.filepath
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default()
        })
    }

    pub fn is_wow64(&self) -> bool {
        !self.is_64 && self.machine == COFF_MACHINE_X86
    }

    pub fn is_arm32(&self) -> bool {
        self.machine == COFF_MACHINE_ARMNT
    }

    pub fn has_imports(&self) -> bool {
        !self.imports.is_empty()
    }

    pub fn find_import(&self, name: &str) -> Option<&PeImportDll> {
        self.imports.iter().find(|i| i.name.eq_ignore_ascii_case(name))
    }
}

/// Filesystem boundary of the resolution engine
///
/// The resolver only ever probes directories for a file name, asks whether a
/// path is present, and loads binaries. Keeping those three behind a trait
/// lets the whole engine run against a synthetic filesystem in tests.
pub trait BinaryLocator: Send + Sync {
    /// Case-insensitive probe for `filename` inside `folder`
    fn find_in_dir(&self, folder: &Path, filename: &str) -> Option<PathBuf>;

    /// Whether the path is actually present on disk
    fn exists(&self, path: &Path) -> bool;

    /// Read and parse the binary at `path`
    fn load(&self, path: &Path) -> Result<PeBinary, LookupError>;
}

/// Locator over the real filesystem, with a per-directory scan cache
pub struct DiskLocator {
    fs_cache: Mutex<WinFileSystemCache>,
}

impl DiskLocator {
    pub fn new() -> Self {
        Self {
            fs_cache: Mutex::new(WinFileSystemCache::new()),
        }
    }
}

impl Default for DiskLocator {
    fn default() -> Self {
        Self::new()
    }
}

impl BinaryLocator for DiskLocator {
    fn find_in_dir(&self, folder: &Path, filename: &str) -> Option<PathBuf> {
        self.fs_cache
            .lock()
            .expect("filesystem cache lock poisoned")
            .test_file_in_folder_case_insensitive(filename, folder)
            .unwrap_or(None)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn load(&self, path: &Path) -> Result<PeBinary, LookupError> {
        let content = fs_err::read(path)?;
        PeBinary::parse(path, &content)
    }
}

/// Memoizes parsed binaries by path
///
/// A parse failure is memoized as well: a file that exists but is not a
/// valid PE is equivalent to a missing one for traversal purposes, and
/// re-parsing it for every referencing import would be wasted I/O.
pub struct BinaryCache {
    locator: Arc<dyn BinaryLocator>,
    loaded: Mutex<HashMap<PathBuf, Option<Arc<PeBinary>>>>,
}

impl BinaryCache {
    pub fn new(locator: Arc<dyn BinaryLocator>) -> Self {
        Self {
            locator,
            loaded: Mutex::new(HashMap::new()),
        }
    }

    pub fn locator(&self) -> &Arc<dyn BinaryLocator> {
        &self.locator
    }

    pub fn get<P: AsRef<Path>>(&self, path: P) -> Option<Arc<PeBinary>> {
        let path = path.as_ref();
        let mut loaded = self.loaded.lock().expect("binary cache lock poisoned");
        if let Some(cached) = loaded.get(path) {
            return cached.clone();
        }
        let parsed = match self.locator.load(path) {
            Ok(pe) => Some(Arc::new(pe)),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "binary failed to load");
                None
            }
        };
        loaded.insert(path.to_owned(), parsed.clone());
        parsed
    }
}

/// Get a humanly-readable version of the (imported or exported) symbol
pub fn demangle_symbol(symbol: &str) -> Result<String, LookupError> {
    let flags =
        msvc_demangler::DemangleFlags::llvm() | msvc_demangler::DemangleFlags::NO_MS_KEYWORDS;
    msvc_demangler::demangle(symbol, flags)
        .map_err(|_| LookupError::DemanglingError(symbol.to_owned()))
}
