//! Reproduction of the loader's module search order
//!
//! Given an import name and the binary requesting it, [`ModuleResolver`]
//! determines how and where the loader would locate the module, tagging the
//! outcome with the strategy that matched. Failure to find anything is a
//! normal, expected terminal outcome, reported as
//! [`ModuleSearchStrategy::NotFound`] rather than as an error.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::apiset::is_apiset_name;
use crate::pe::{BinaryCache, PeBinary};
use crate::query::ScanQuery;
use crate::sxs::SxsEntries;

/// How a module was located
///
/// Exactly one strategy applies per resolved module; the ordering of the
/// search mirrors the real loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ModuleSearchStrategy {
    /// The binary under analysis itself
    Root,
    /// Redirected by a side-by-side manifest to a private assembly
    SxS,
    /// Virtual DLL resolved through the API set schema
    ApiSetSchema,
    /// Hardcoded into the loader, always mapped from the system directory
    WellKnownDlls,
    /// Directory of the requesting binary
    ApplicationDirectory,
    /// One of the user-supplied search folders
    UserSearchFolders,
    /// Working directory of the simulated process
    WorkingDirectory,
    /// Bitness-appropriate system directory
    WindowsSystemDirectory,
    /// A directory from the PATH environment
    Environment,
    /// Injected through the AppInit_DLLs configuration
    AppInitDLL,
    /// Referenced by a managed assembly
    ClrAssembly,
    /// No strategy succeeded
    NotFound,
}

impl ModuleSearchStrategy {
    /// Modules materialized from OS-managed locations
    pub fn is_system(&self) -> bool {
        matches!(
            self,
            Self::WellKnownDlls | Self::ApiSetSchema | Self::WindowsSystemDirectory
        )
    }
}

impl std::fmt::Display for ModuleSearchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Root => "Root",
            Self::SxS => "Side-by-Side",
            Self::ApiSetSchema => "ApiSetSchema",
            Self::WellKnownDlls => "WellKnownDlls",
            Self::ApplicationDirectory => "ApplicationDirectory",
            Self::UserSearchFolders => "UserSearchFolders",
            Self::WorkingDirectory => "WorkingDirectory",
            Self::WindowsSystemDirectory => "WindowsSystemDirectory",
            Self::Environment => "Environment",
            Self::AppInitDLL => "AppInitDLL",
            Self::ClrAssembly => "ClrAssembly",
            Self::NotFound => "NotFound",
        };
        f.write_str(label)
    }
}

/// Outcome of one resolution
///
/// `binary` is `None` either because nothing was found
/// ([`ModuleSearchStrategy::NotFound`]) or because the located file failed
/// to parse; the latter is equivalent to not-found for traversal purposes.
#[derive(Clone)]
pub struct ResolvedModule {
    pub strategy: ModuleSearchStrategy,
    pub binary: Option<Arc<PeBinary>>,
}

impl ResolvedModule {
    fn not_found() -> Self {
        Self {
            strategy: ModuleSearchStrategy::NotFound,
            binary: None,
        }
    }

    pub fn filepath(&self) -> Option<&Path> {
        self.binary.as_ref().map(|b| b.filepath.as_path())
    }
}

/// Applies the loader search order for one scan
///
/// Pure over its inputs plus the memoizing [`BinaryCache`]: resolving the
/// same name for the same requesting binary twice yields the same outcome.
pub struct ModuleResolver {
    query: ScanQuery,
    sxs: SxsEntries,
    binaries: BinaryCache,
}

impl ModuleResolver {
    pub fn new(query: ScanQuery, sxs: SxsEntries, binaries: BinaryCache) -> Self {
        Self {
            query,
            sxs,
            binaries,
        }
    }

    pub fn query(&self) -> &ScanQuery {
        &self.query
    }

    pub fn binaries(&self) -> &BinaryCache {
        &self.binaries
    }

    /// Locate `name` the way the loader would when `importer` requests it
    pub fn resolve(&self, importer: &PeBinary, name: &str) -> ResolvedModule {
        // 1. api set contracts take precedence over any on-disk file
        if is_apiset_name(name) {
            if let Some(backing) = self
                .query
                .system
                .as_ref()
                .and_then(|s| s.apiset.as_ref())
                .and_then(|schema| schema.lookup(name))
            {
                return ResolvedModule {
                    strategy: ModuleSearchStrategy::ApiSetSchema,
                    binary: self.load_from_system_dir(importer, backing),
                };
            }
            // not in the schema: a file by that name may still exist on disk
        }

        // 2. side-by-side redirection
        if let Some(entry) = self.sxs.find(name) {
            return ResolvedModule {
                strategy: ModuleSearchStrategy::SxS,
                binary: self.binaries.get(&entry.path),
            };
        }

        // 3. DLLs hardcoded into the loader
        if let Some(path) = self
            .query
            .system
            .as_ref()
            .and_then(|s| s.known_dlls.as_ref())
            .and_then(|kd| kd.get(name))
        {
            return ResolvedModule {
                strategy: ModuleSearchStrategy::WellKnownDlls,
                binary: self.binaries.get(path),
            };
        }

        // 4.-8. directory search in loader order
        if let Some(hit) = self.probe(&self.query.app_dir, name) {
            return self.found(ModuleSearchStrategy::ApplicationDirectory, hit);
        }
        for folder in &self.query.custom_search_folders {
            if let Some(hit) = self.probe(folder, name) {
                return self.found(ModuleSearchStrategy::UserSearchFolders, hit);
            }
        }
        if let Some(hit) = self.probe(&self.query.working_dir, name) {
            return self.found(ModuleSearchStrategy::WorkingDirectory, hit);
        }
        if let Some(system) = &self.query.system {
            if let Some(hit) = self.probe(system.system_dir_for(importer), name) {
                return self.found(ModuleSearchStrategy::WindowsSystemDirectory, hit);
            }
            for folder in system.system_path.as_deref().unwrap_or(&[]) {
                if let Some(hit) = self.probe(folder, name) {
                    return self.found(ModuleSearchStrategy::Environment, hit);
                }
            }
        }

        ResolvedModule::not_found()
    }

    fn probe(&self, folder: &Path, name: &str) -> Option<PathBuf> {
        self.binaries.locator().find_in_dir(folder, name)
    }

    fn found(&self, strategy: ModuleSearchStrategy, path: PathBuf) -> ResolvedModule {
        ResolvedModule {
            strategy,
            binary: self.binaries.get(&path),
        }
    }

    fn load_from_system_dir(&self, importer: &PeBinary, name: &str) -> Option<Arc<PeBinary>> {
        let system = self.query.system.as_ref()?;
        let path = self
            .probe(system.system_dir_for(importer), name)
            .or_else(|| self.probe(&system.sys_dir.join("downlevel"), name))?;
        self.binaries.get(&path)
    }
}
