//! Description of the Windows installation the lookup runs against

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::apiset::ApiSetSchema;
use crate::common::LookupError;
use crate::pe::PeBinary;

/// List of DLLs provided by the operating system and hardcoded into the loader
///
/// If a DLL with this name is required, the OS will not perform any further
/// lookup but load the copy distributed with Windows.
#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct KnownDllList {
    entries: HashMap<String, PathBuf>,
}

impl KnownDllList {
    pub fn from_names<I: IntoIterator<Item = String>>(names: I, sys_dir: &Path) -> Self {
        Self {
            entries: names
                .into_iter()
                .map(|n| (n.to_lowercase(), sys_dir.join(&n)))
                .collect(),
        }
    }

    pub fn get(&self, library: &str) -> Option<&PathBuf> {
        self.entries.get(&library.to_ascii_lowercase())
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }
}

/// Read-only key/value configuration lookup, the registry-equivalent store
/// behind the AppInit DLL feature
///
/// An absent key (or an entirely absent store) is the normal "feature off"
/// state, which is why every accessor returns `Option` instead of `Result`.
pub trait ConfigStore: Send + Sync {
    fn read_dword(&self, key: &str, value: &str) -> Option<u32>;
    fn read_string(&self, key: &str, value: &str) -> Option<String>;
}

/// In-memory [`ConfigStore`], filled by the embedder (or by tests)
#[derive(Debug, Clone, Default)]
pub struct StaticConfigStore {
    dwords: HashMap<(String, String), u32>,
    strings: HashMap<(String, String), String>,
}

impl StaticConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dword(mut self, key: &str, value: &str, data: u32) -> Self {
        self.dwords.insert((key.to_owned(), value.to_owned()), data);
        self
    }

    pub fn with_string(mut self, key: &str, value: &str, data: &str) -> Self {
        self.strings
            .insert((key.to_owned(), value.to_owned()), data.to_owned());
        self
    }
}

impl ConfigStore for StaticConfigStore {
    fn read_dword(&self, key: &str, value: &str) -> Option<u32> {
        self.dwords.get(&(key.to_owned(), value.to_owned())).copied()
    }

    fn read_string(&self, key: &str, value: &str) -> Option<String> {
        self.strings.get(&(key.to_owned(), value.to_owned())).cloned()
    }
}

/// Configuration namespace for the AppInit values, keyed by the bitness of
/// the process whose loading is being simulated
pub fn appinit_key_for(pe: &PeBinary) -> &'static str {
    if pe.is_arm32() {
        "SOFTWARE\\WowAA32Node\\Microsoft\\Windows NT\\CurrentVersion\\Windows"
    } else if pe.is_wow64() {
        "SOFTWARE\\Wow6432Node\\Microsoft\\Windows NT\\CurrentVersion\\Windows"
    } else {
        "SOFTWARE\\Microsoft\\Windows NT\\CurrentVersion\\Windows"
    }
}

/// Description of a Windows system
///
/// If running from within Windows we extract the available information from
/// the environment and the Windows API. If running in another OS we can only
/// guess the directories from a mounted partition, and can't do anything
/// about the PATH.
#[derive(Clone)]
pub struct WindowsSystem {
    /// Windows directory (typically C:\Windows)
    pub win_dir: PathBuf,
    /// Native system directory (typically C:\Windows\System32)
    pub sys_dir: PathBuf,
    /// 32-bit system directory on 64-bit installations (SysWOW64)
    pub syswow_dir: Option<PathBuf>,
    /// PATH as specified by the system
    pub system_path: Option<Vec<PathBuf>>,
    pub known_dlls: Option<KnownDllList>,
    pub apiset: Option<ApiSetSchema>,
    /// Store holding the AppInit enable flag and DLL list; `None` disables
    /// the feature entirely
    pub appinit_config: Option<Arc<dyn ConfigStore>>,
}

impl fmt::Debug for WindowsSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowsSystem")
            .field("win_dir", &self.win_dir)
            .field("sys_dir", &self.sys_dir)
            .field("syswow_dir", &self.syswow_dir)
            .field("system_path", &self.system_path)
            .field("known_dlls", &self.known_dlls)
            .field("apiset", &self.apiset.as_ref().map(|a| a.len()))
            .field("appinit_config", &self.appinit_config.is_some())
            .finish()
    }
}

impl PartialEq for WindowsSystem {
    fn eq(&self, other: &Self) -> bool {
        self.win_dir == other.win_dir
            && self.sys_dir == other.sys_dir
            && self.syswow_dir == other.syswow_dir
            && self.system_path == other.system_path
            && self.known_dlls == other.known_dlls
    }
}

impl WindowsSystem {
    /// Collect information about the host operating system
    #[cfg(windows)]
    pub fn current() -> Result<Self, LookupError> {
        let win_dir = get_windows_directory()?;
        let sys_dir = get_system_directory()?;
        let syswow_dir = get_syswow64_directory().ok();

        let system_path = std::env::var("PATH")
            .map(|s| {
                s.split(';')
                    .filter_map(|entry| fs_err::canonicalize(entry).ok())
                    .collect()
            })
            .ok();

        let known_dlls = match crate::knowndlls::get_known_dlls() {
            Ok(names) => Some(KnownDllList::from_names(names, &sys_dir)),
            Err(e) => {
                tracing::warn!(error = %e, "could not enumerate KnownDlls");
                None
            }
        };

        Ok(Self {
            win_dir,
            sys_dir,
            syswow_dir,
            system_path,
            known_dlls,
            apiset: None,
            appinit_config: None,
        })
    }

    /// Collect information about the Windows operating system installed on
    /// the partition the target executable lies on
    #[cfg(not(windows))]
    pub fn from_exe_location<P: AsRef<Path>>(p: P) -> Result<Option<Self>, LookupError> {
        if let Some(root) = Self::find_root(&p) {
            Ok(Self::from_root(root))
        } else {
            Ok(None)
        }
    }

    /// Try finding a Windows installation along the path to the target executable
    ///
    /// Rationale: the user may have mounted a Windows partition at an unknown
    /// depth in the filesystem.
    #[cfg(not(windows))]
    fn find_root<P: AsRef<Path>>(p: P) -> Option<PathBuf> {
        for a in p.as_ref().parent()?.ancestors() {
            if Self::from_root(a).is_some() {
                return Some(a.to_owned());
            }
        }
        None
    }

    /// Collect information about the Windows installation at the given path
    ///
    /// The path should point to the C:\ partition.
    pub fn from_root<P: AsRef<Path>>(root_path: P) -> Option<Self> {
        let win_dir = root_path.as_ref().join("Windows");
        let sys_dir = win_dir.join("System32");
        if !sys_dir.exists() {
            return None;
        }
        let syswow_dir = Some(win_dir.join("SysWOW64")).filter(|p| p.exists());
        Some(Self {
            win_dir,
            sys_dir,
            syswow_dir,
            system_path: None,
            known_dlls: None,
            apiset: None,
            appinit_config: None,
        })
    }

    /// System directory the loader would search for the given binary:
    /// the 32-bit one for WOW64/ARM32 processes, the native one otherwise
    pub fn system_dir_for(&self, pe: &PeBinary) -> &PathBuf {
        if pe.is_wow64() || pe.is_arm32() {
            self.syswow_dir.as_ref().unwrap_or(&self.sys_dir)
        } else {
            &self.sys_dir
        }
    }
}

/// Fetch the path to a system directory through the Windows API
#[cfg(windows)]
fn get_winapi_directory(
    a: unsafe extern "system" fn(
        winapi::um::winnt::LPWSTR,
        winapi::shared::minwindef::UINT,
    ) -> winapi::shared::minwindef::UINT,
) -> Result<PathBuf, std::io::Error> {
    use std::ffi::OsString;
    use std::io::Error;
    use std::os::windows::ffi::OsStringExt;

    const BFR_SIZE: usize = 512;
    let mut bfr: [u16; BFR_SIZE] = [0; BFR_SIZE];

    let ret: u32 = unsafe { a(bfr.as_mut_ptr(), BFR_SIZE as u32) };
    if ret == 0 {
        Err(Error::last_os_error())
    } else {
        let valid_bfr = &bfr[..ret as usize];
        fs_err::canonicalize(OsString::from_wide(valid_bfr))
    }
}

/// Get the path to the System directory (typically C:\Windows\System32)
#[cfg(windows)]
fn get_system_directory() -> Result<PathBuf, std::io::Error> {
    get_winapi_directory(winapi::um::sysinfoapi::GetSystemDirectoryW)
}

/// Get the path to the Windows directory (typically C:\Windows)
#[cfg(windows)]
fn get_windows_directory() -> Result<PathBuf, std::io::Error> {
    get_winapi_directory(winapi::um::sysinfoapi::GetWindowsDirectoryW)
}

/// Get the path to the 32-bit system directory (typically C:\Windows\SysWOW64)
#[cfg(windows)]
fn get_syswow64_directory() -> Result<PathBuf, std::io::Error> {
    get_winapi_directory(winapi::um::wow64apiset::GetSystemWow64DirectoryW)
}

/// Caches the content of already scanned directories, to avoid repeated
/// expensive filesystem access
pub(crate) struct WinFileSystemCache {
    files_in_dirs: HashMap<PathBuf, HashMap<String, PathBuf>>,
}

impl WinFileSystemCache {
    pub(crate) fn new() -> Self {
        Self {
            files_in_dirs: HashMap::new(),
        }
    }

    pub(crate) fn test_file_in_folder_case_insensitive(
        &mut self,
        filename: &str,
        folder: &Path,
    ) -> Result<Option<PathBuf>, LookupError> {
        if let std::collections::hash_map::Entry::Vacant(e) =
            self.files_in_dirs.entry(folder.to_owned())
        {
            let entries: HashMap<String, PathBuf> = fs_err::read_dir(folder)?
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.metadata().map(|m| m.is_file()).unwrap_or(false))
                .filter_map(|entry| {
                    entry
                        .file_name()
                        .to_str()
                        .map(|s| (s.to_lowercase(), entry.file_name().into()))
                })
                .collect();
            e.insert(entries);
        }
        let dir = self
            .files_in_dirs
            .get(folder)
            .expect("directory scanned just above");
        Ok(dir
            .get(&filename.to_lowercase())
            .map(|p| folder.join(p)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pe::{COFF_MACHINE_ARMNT, COFF_MACHINE_X86};
    use crate::testutil::synthetic_pe;

    #[test]
    fn fscache_probes_case_insensitively() -> Result<(), LookupError> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("SomeLib.dll");
        fs_err::write(&file, b"")?;

        let mut fscache = WinFileSystemCache::new();
        let expected = Some(dir.path().join("SomeLib.dll"));
        assert_eq!(
            fscache.test_file_in_folder_case_insensitive("somelib.dll", dir.path())?,
            expected
        );
        assert_eq!(
            fscache.test_file_in_folder_case_insensitive("SOMELIB.DLL", dir.path())?,
            expected
        );
        assert_eq!(
            fscache.test_file_in_folder_case_insensitive("other.dll", dir.path())?,
            None
        );
        Ok(())
    }

    #[test]
    fn system_dir_is_bitness_aware() {
        let mut system = WindowsSystem {
            win_dir: PathBuf::from("C:/Windows"),
            sys_dir: PathBuf::from("C:/Windows/System32"),
            syswow_dir: Some(PathBuf::from("C:/Windows/SysWOW64")),
            system_path: None,
            known_dlls: None,
            apiset: None,
            appinit_config: None,
        };

        let mut pe = synthetic_pe("app.exe", "C:/app/app.exe", &[]);
        pe.machine = COFF_MACHINE_X86;
        pe.is_64 = false;
        assert_eq!(
            system.system_dir_for(&pe),
            &PathBuf::from("C:/Windows/SysWOW64")
        );

        pe.machine = COFF_MACHINE_ARMNT;
        assert_eq!(
            system.system_dir_for(&pe),
            &PathBuf::from("C:/Windows/SysWOW64")
        );

        pe.machine = goblin::pe::header::COFF_MACHINE_X86_64;
        pe.is_64 = true;
        assert_eq!(
            system.system_dir_for(&pe),
            &PathBuf::from("C:/Windows/System32")
        );

        // 32-bit-only installation: no SysWOW64 to redirect to
        system.syswow_dir = None;
        pe.machine = COFF_MACHINE_X86;
        pe.is_64 = false;
        assert_eq!(
            system.system_dir_for(&pe),
            &PathBuf::from("C:/Windows/System32")
        );
    }

    #[test]
    fn appinit_key_follows_bitness() {
        let mut pe = synthetic_pe("app.exe", "C:/app/app.exe", &[]);
        pe.machine = COFF_MACHINE_X86;
        pe.is_64 = false;
        assert!(appinit_key_for(&pe).contains("Wow6432Node"));
        pe.machine = COFF_MACHINE_ARMNT;
        assert!(appinit_key_for(&pe).contains("WowAA32Node"));
        pe.machine = goblin::pe::header::COFF_MACHINE_X86_64;
        pe.is_64 = true;
        assert!(!appinit_key_for(&pe).contains("Node"));
    }

    #[test]
    fn static_store_reports_missing_keys_as_none() {
        let store = StaticConfigStore::new()
            .with_dword("K", "LoadAppInit_DLLs", 1)
            .with_string("K", "AppInit_DLLs", "a.dll b.dll");
        assert_eq!(store.read_dword("K", "LoadAppInit_DLLs"), Some(1));
        assert_eq!(store.read_string("K", "AppInit_DLLs").as_deref(), Some("a.dll b.dll"));
        assert_eq!(store.read_dword("K", "Missing"), None);
        assert_eq!(store.read_string("Other", "AppInit_DLLs"), None);
    }
}
