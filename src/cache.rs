//! Deduplication of resolved modules
//!
//! The cache is the single source of truth for "have we seen this module
//! before". Identity is the name as referenced plus the resolved location
//! plus the resolution flags at creation time; the same DLL reached through
//! a different path or with different flags is a distinct entry. All
//! mutation happens on the coordinating thread; tree nodes only ever hold
//! `Arc` clones of the records.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::pe::PeBinary;
use crate::search::ModuleSearchStrategy;

bitflags::bitflags! {
    /// Attributes accumulated by a module over the whole traversal
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ModuleFlag: u32 {
        /// Resolved lazily at first call rather than at load time
        const DELAY_LOAD = 1 << 0;
        /// No search strategy succeeded
        const NOT_FOUND = 1 << 1;
        /// Virtual DLL resolved through the api set schema
        const API_SET = 1 << 2;
        /// Extension api set, tracked but suppressed from module lists
        const API_SET_EXT = 1 << 3;
        /// Module found, but one of its own imports is unsatisfied
        const MISSING_IMPORTS = 1 << 4;
        /// A descendant somewhere below this module failed
        const CHILDREN_ERROR = 1 << 5;
        /// Referenced by a managed assembly rather than the import table
        const CLR_REFERENCE = 1 << 6;
    }
}

impl ModuleFlag {
    /// Flags that mark the module itself as problematic
    pub fn has_errors(self) -> bool {
        self.intersects(Self::NOT_FOUND | Self::MISSING_IMPORTS | Self::CHILDREN_ERROR)
    }

    pub fn names(self) -> Vec<&'static str> {
        self.iter_names().map(|(name, _)| name).collect()
    }
}

/// Cache identity of a module
///
/// Stable for the lifetime of a traversal; never recomputed after insertion.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleCacheKey {
    name: String,
    filepath: Option<PathBuf>,
    flag_bits: u32,
}

impl ModuleCacheKey {
    pub fn new(name: &str, filepath: Option<&Path>, flags: ModuleFlag) -> Self {
        Self {
            name: name.to_lowercase(),
            filepath: filepath.map(Path::to_owned),
            flag_bits: flags.bits(),
        }
    }
}

/// One distinct resolved-or-unresolved module
///
/// Owned by the [`ModulesCache`]; every tree position referencing the module
/// shares the same record, so the flag set is the union of everything every
/// referencing import learned about it.
pub struct ModuleInfo {
    /// Name as referenced by the import that discovered the module
    pub name: String,
    /// Resolved location, `None` when unresolved (or unparseable)
    pub filepath: Option<PathBuf>,
    pub strategy: ModuleSearchStrategy,
    /// Real backing library, for api set contracts
    pub apiset_backing: Option<String>,
    binary: Option<Arc<PeBinary>>,
    flags: AtomicU32,
}

impl ModuleInfo {
    pub fn new(
        name: &str,
        strategy: ModuleSearchStrategy,
        binary: Option<Arc<PeBinary>>,
        apiset_backing: Option<String>,
        flags: ModuleFlag,
    ) -> Self {
        Self {
            name: name.to_owned(),
            filepath: binary.as_ref().map(|b| b.filepath.clone()),
            strategy,
            apiset_backing,
            binary,
            flags: AtomicU32::new(flags.bits()),
        }
    }

    pub fn root(pe: Arc<PeBinary>) -> Self {
        let name = pe.name();
        Self::new(
            &name,
            ModuleSearchStrategy::Root,
            Some(pe),
            None,
            ModuleFlag::empty(),
        )
    }

    pub fn binary(&self) -> Option<&Arc<PeBinary>> {
        self.binary.as_ref()
    }

    pub fn found(&self) -> bool {
        self.filepath.is_some()
    }

    pub fn flags(&self) -> ModuleFlag {
        ModuleFlag::from_bits_retain(self.flags.load(Ordering::Relaxed))
    }

    /// Union more attributes into the record (re-encounter of the identity)
    pub fn add_flags(&self, flags: ModuleFlag) {
        self.flags.fetch_or(flags.bits(), Ordering::Relaxed);
    }

    pub fn remove_flags(&self, flags: ModuleFlag) {
        self.flags.fetch_and(!flags.bits(), Ordering::Relaxed);
    }

    pub fn has_errors(&self) -> bool {
        self.flags().has_errors()
    }
}

impl std::fmt::Debug for ModuleInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleInfo")
            .field("name", &self.name)
            .field("filepath", &self.filepath)
            .field("strategy", &self.strategy)
            .field("flags", &self.flags())
            .finish()
    }
}

/// Missing libraries and symbols detected across the cached modules
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModulesCheckReport {
    /// Importer name -> dependencies that were not found
    pub not_found_libraries: HashMap<String, HashSet<String>>,
    /// Importer name -> exporter name -> symbols the exporter lacks
    pub not_found_symbols: HashMap<String, HashMap<String, HashSet<String>>>,
}

impl ModulesCheckReport {
    pub fn is_clean(&self) -> bool {
        self.not_found_libraries.is_empty() && self.not_found_symbols.is_empty()
    }
}

/// All distinct modules discovered by one traversal, keyed by identity
#[derive(Default)]
pub struct ModulesCache {
    index: HashMap<ModuleCacheKey, Arc<ModuleInfo>>,
    // insertion order, for stable module listings
    order: Vec<Arc<ModuleInfo>>,
}

impl ModulesCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &ModuleCacheKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn get(&self, key: &ModuleCacheKey) -> Option<&Arc<ModuleInfo>> {
        self.index.get(key)
    }

    /// Insert a newly created record; the identity must not be present yet
    pub fn insert(&mut self, key: ModuleCacheKey, info: ModuleInfo) -> Arc<ModuleInfo> {
        debug_assert!(!self.index.contains_key(&key), "module resolved twice");
        let info = Arc::new(info);
        self.index.insert(key, info.clone());
        self.order.push(info.clone());
        info
    }

    /// Modules in discovery order
    pub fn modules(&self) -> impl Iterator<Item = &Arc<ModuleInfo>> {
        self.order.iter()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// First cached module carrying the given name, however it was resolved
    pub fn find_by_name(&self, name: &str) -> Option<&Arc<ModuleInfo>> {
        self.order
            .iter()
            .find(|m| m.name.eq_ignore_ascii_case(name))
    }

    /// Check that all referenced DLLs were found and that every imported
    /// symbol is present in the exporting module
    pub fn check(&self) -> ModulesCheckReport {
        let mut report = ModulesCheckReport::default();

        for module in &self.order {
            let Some(binary) = module.binary() else {
                continue;
            };
            for import in &binary.imports {
                let Some(exporter) = self.find_by_name(&import.name) else {
                    // never looked up (e.g. branch truncated by the depth limit)
                    continue;
                };
                if !exporter.found() {
                    report
                        .not_found_libraries
                        .entry(module.name.clone())
                        .or_default()
                        .insert(import.name.clone());
                    continue;
                }
                let Some(exporter_binary) = exporter.binary() else {
                    continue;
                };
                if exporter.strategy == ModuleSearchStrategy::ApiSetSchema {
                    // the contract's symbols live in the backing library
                    continue;
                }
                let missing: HashSet<String> = import
                    .symbols
                    .iter()
                    .filter(|s| !exporter_binary.exports.contains(*s))
                    .cloned()
                    .collect();
                if !missing.is_empty() {
                    report
                        .not_found_symbols
                        .entry(module.name.clone())
                        .or_default()
                        .insert(exporter.name.clone(), missing);
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::synthetic_pe;

    fn not_found_info(name: &str) -> ModuleInfo {
        ModuleInfo::new(
            name,
            ModuleSearchStrategy::NotFound,
            None,
            None,
            ModuleFlag::NOT_FOUND,
        )
    }

    #[test]
    fn identity_distinguishes_paths_and_flags() {
        let a = ModuleCacheKey::new("Dep.dll", Some(Path::new("C:/app/dep.dll")), ModuleFlag::empty());
        let b = ModuleCacheKey::new("dep.DLL", Some(Path::new("C:/app/dep.dll")), ModuleFlag::empty());
        let c = ModuleCacheKey::new("dep.dll", Some(Path::new("C:/other/dep.dll")), ModuleFlag::empty());
        let d = ModuleCacheKey::new("dep.dll", Some(Path::new("C:/app/dep.dll")), ModuleFlag::DELAY_LOAD);

        assert_eq!(a, b); // same module, case-insensitive name
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn flags_accumulate_by_union() {
        let info = not_found_info("dep.dll");
        info.add_flags(ModuleFlag::DELAY_LOAD);
        info.add_flags(ModuleFlag::CHILDREN_ERROR);
        assert_eq!(
            info.flags(),
            ModuleFlag::NOT_FOUND | ModuleFlag::DELAY_LOAD | ModuleFlag::CHILDREN_ERROR
        );
        assert!(info.has_errors());
    }

    #[test]
    fn each_identity_is_inserted_once() {
        let mut cache = ModulesCache::new();
        let key = ModuleCacheKey::new("dep.dll", None, ModuleFlag::NOT_FOUND);
        cache.insert(key.clone(), not_found_info("dep.dll"));
        assert!(cache.contains(&key));
        assert_eq!(cache.len(), 1);

        // a second reference reuses the record and unions its flags
        let info = cache.get(&key).unwrap().clone();
        info.add_flags(ModuleFlag::DELAY_LOAD);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&key).unwrap().flags().contains(ModuleFlag::DELAY_LOAD));
    }

    #[test]
    fn check_reports_missing_symbols_and_libraries() {
        let mut cache = ModulesCache::new();

        let mut app = synthetic_pe("app.exe", "C:/app/app.exe", &[]);
        app.imports = vec![
            crate::pe::PeImportDll {
                name: "dep.dll".to_owned(),
                delay_load: false,
                symbols: vec!["present".to_owned(), "absent".to_owned()],
            },
            crate::pe::PeImportDll {
                name: "gone.dll".to_owned(),
                delay_load: false,
                symbols: vec![],
            },
        ];
        let mut dep = synthetic_pe("dep.dll", "C:/app/dep.dll", &[]);
        dep.exports = ["present".to_owned()].into_iter().collect();

        cache.insert(
            ModuleCacheKey::new("app.exe", Some(Path::new("C:/app/app.exe")), ModuleFlag::empty()),
            ModuleInfo::root(Arc::new(app)),
        );
        cache.insert(
            ModuleCacheKey::new("dep.dll", Some(Path::new("C:/app/dep.dll")), ModuleFlag::empty()),
            ModuleInfo::new(
                "dep.dll",
                ModuleSearchStrategy::ApplicationDirectory,
                Some(Arc::new(dep)),
                None,
                ModuleFlag::empty(),
            ),
        );
        cache.insert(
            ModuleCacheKey::new("gone.dll", None, ModuleFlag::NOT_FOUND),
            not_found_info("gone.dll"),
        );

        let report = cache.check();
        assert!(!report.is_clean());
        assert!(report.not_found_libraries["app.exe"].contains("gone.dll"));
        assert!(report.not_found_symbols["app.exe"]["dep.dll"].contains("absent"));
        assert!(!report.not_found_symbols["app.exe"]["dep.dll"].contains("present"));
    }
}
