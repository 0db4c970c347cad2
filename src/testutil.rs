//! Synthetic binaries and a synthetic filesystem for the engine tests
//!
//! The resolution engine only touches the world through [`BinaryLocator`],
//! so an in-memory locator plus hand-built [`PeBinary`] values are enough to
//! script arbitrary loader scenarios without real PE files on disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::common::LookupError;
use crate::pe::{BinaryLocator, PeBinary, PeImportDll};
use crate::system::WindowsSystem;

pub(crate) fn synthetic_pe(name: &str, path: &str, imports: &[&str]) -> PeBinary {
    PeBinary {
        filepath: PathBuf::from(path),
        dll_name: Some(name.to_owned()),
        machine: goblin::pe::header::COFF_MACHINE_X86_64,
        is_64: true,
        imports: imports
            .iter()
            .map(|&n| PeImportDll {
                name: n.to_owned(),
                delay_load: false,
                symbols: Vec::new(),
            })
            .collect(),
        exports: Default::default(),
    }
}

pub(crate) fn delay_import(name: &str) -> PeImportDll {
    PeImportDll {
        name: name.to_owned(),
        delay_load: true,
        symbols: Vec::new(),
    }
}

/// In-memory filesystem: a map from path to "a parseable binary", or to
/// "a file that exists but is not a valid PE" (`None`)
#[derive(Default)]
pub(crate) struct FakeLocator {
    files: Mutex<HashMap<PathBuf, Option<PeBinary>>>,
}

impl FakeLocator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_binary(&self, pe: PeBinary) {
        self.files
            .lock()
            .unwrap()
            .insert(pe.filepath.clone(), Some(pe));
    }

    /// A file that is present on disk but fails to parse
    pub(crate) fn add_unparseable(&self, path: &str) {
        self.files.lock().unwrap().insert(PathBuf::from(path), None);
    }
}

impl BinaryLocator for FakeLocator {
    fn find_in_dir(&self, folder: &Path, filename: &str) -> Option<PathBuf> {
        self.files
            .lock()
            .unwrap()
            .keys()
            .find(|p| {
                p.parent() == Some(folder)
                    && p.file_name()
                        .and_then(|f| f.to_str())
                        .map(|f| f.eq_ignore_ascii_case(filename))
                        .unwrap_or(false)
            })
            .cloned()
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().unwrap().contains_key(path)
    }

    fn load(&self, path: &Path) -> Result<PeBinary, LookupError> {
        match self.files.lock().unwrap().get(path) {
            Some(Some(pe)) => Ok(pe.clone()),
            Some(None) => Err(LookupError::ParseError(format!(
                "{} is not a valid PE-COFF file",
                path.display()
            ))),
            None => Err(LookupError::IOError(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                path.display().to_string(),
            ))),
        }
    }
}

pub(crate) const TEST_SYS_DIR: &str = "C:/Windows/System32";
pub(crate) const TEST_SYSWOW_DIR: &str = "C:/Windows/SysWOW64";

pub(crate) fn test_system() -> WindowsSystem {
    WindowsSystem {
        win_dir: PathBuf::from("C:/Windows"),
        sys_dir: PathBuf::from(TEST_SYS_DIR),
        syswow_dir: Some(PathBuf::from(TEST_SYSWOW_DIR)),
        system_path: None,
        known_dlls: None,
        apiset: None,
        appinit_config: None,
    }
}
