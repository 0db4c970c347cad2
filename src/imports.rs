//! Per-binary import resolution
//!
//! Turns one binary's raw import table into enriched per-import resolution
//! contexts: delay-load marking, api set indirection, AppInit DLL injection
//! and the optional managed-assembly seam. One context is created per import
//! edge and consumed immediately by the tree builder; contexts are never
//! retained.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::apiset::is_apiset_ext_name;
use crate::cache::{ModuleCacheKey, ModuleFlag};
use crate::common::LookupError;
use crate::pe::{PeBinary, PeImportDll};
use crate::search::{ModuleResolver, ModuleSearchStrategy};
use crate::system::appinit_key_for;

/// Resolution outcome for one import edge
#[derive(Clone)]
pub struct ImportContext {
    /// Module name as referenced by the importer
    pub name: String,
    pub strategy: ModuleSearchStrategy,
    pub binary: Option<Arc<PeBinary>>,
    /// Real backing library name, for api set contracts
    pub apiset_backing: Option<String>,
    pub flags: ModuleFlag,
}

impl ImportContext {
    pub fn filepath(&self) -> Option<&Path> {
        self.binary.as_ref().map(|b| b.filepath.as_path())
    }

    pub fn cache_key(&self) -> ModuleCacheKey {
        ModuleCacheKey::new(&self.name, self.filepath(), self.flags)
    }
}

/// Walker over the referenced assemblies of a managed binary
///
/// Invoked only when the CLR loader module is among a binary's resolved
/// imports. No implementation is bundled; embedders can plug a metadata
/// reader in.
pub trait ClrScanner: Send + Sync {
    fn referenced_modules(&self, assembly: &Path) -> Result<Vec<String>, LookupError>;
}

/// Builds batches of [`ImportContext`]s, one batch per analyzed binary
pub struct ImportContextBuilder {
    resolver: Arc<ModuleResolver>,
    clr_scanner: Option<Arc<dyn ClrScanner>>,
    appv_warned: AtomicBool,
    clr_warned: AtomicBool,
}

impl ImportContextBuilder {
    pub fn new(resolver: Arc<ModuleResolver>) -> Self {
        Self {
            resolver,
            clr_scanner: None,
            appv_warned: AtomicBool::new(false),
            clr_warned: AtomicBool::new(false),
        }
    }

    pub fn with_clr_scanner(mut self, scanner: Arc<dyn ClrScanner>) -> Self {
        self.clr_scanner = Some(scanner);
        self
    }

    pub fn resolver(&self) -> &Arc<ModuleResolver> {
        &self.resolver
    }

    /// Resolve a single import of `importer`
    pub fn resolve_import(&self, importer: &PeBinary, import: &PeImportDll) -> ImportContext {
        let mut flags = ModuleFlag::empty();
        if import.delay_load {
            flags |= ModuleFlag::DELAY_LOAD;
        }

        let resolved = self.resolver.resolve(importer, &import.name);
        if resolved.strategy == ModuleSearchStrategy::NotFound {
            flags |= ModuleFlag::NOT_FOUND;
        } else if let Some(binary) = resolved.binary.as_ref() {
            if import
                .symbols
                .iter()
                .any(|s| !binary.exports.contains(s))
            {
                flags |= ModuleFlag::MISSING_IMPORTS;
            }
        }

        let mut apiset_backing = None;
        if resolved.strategy == ModuleSearchStrategy::ApiSetSchema {
            flags |= ModuleFlag::API_SET;
            apiset_backing = self
                .resolver
                .query()
                .system
                .as_ref()
                .and_then(|s| s.apiset.as_ref())
                .and_then(|schema| schema.lookup(&import.name))
                .map(str::to_owned);
            if is_apiset_ext_name(&import.name) {
                flags |= ModuleFlag::API_SET_EXT;
            }
        }

        ImportContext {
            name: import.name.clone(),
            strategy: resolved.strategy,
            binary: resolved.binary,
            apiset_backing,
            flags,
        }
    }

    /// Resolve every import of one binary, in import-table order
    ///
    /// The first occurrence of a name wins; AppInit and CLR augmentation
    /// runs inline so synthesized modules participate in the same batch.
    pub fn build(&self, importer: &PeBinary) -> Vec<ImportContext> {
        let mut contexts: Vec<ImportContext> = Vec::new();

        for import in &importer.imports {
            if contains_name(&contexts, &import.name) {
                continue;
            }

            let ctx = self.resolve_import(importer, import);
            self.warn_on_appv_imports(&import.name);

            let resolved_path = ctx.filepath().map(Path::to_owned);
            contexts.push(ctx);

            // AppInit DLLs are triggered by user32.dll; a binary that does
            // not load it from the system directory never sees them
            self.append_appinit_dlls(importer, resolved_path.as_deref(), &mut contexts);

            // mscoree.dll means the module hosts the CLR and carries
            // assembly references next to its native import table
            self.append_clr_references(importer, resolved_path.as_deref(), &mut contexts);
        }

        contexts
    }

    fn warn_on_appv_imports(&self, import_name: &str) {
        if import_name.eq_ignore_ascii_case("AppvIsvSubsystems32.dll")
            || import_name.eq_ignore_ascii_case("AppvIsvSubsystems64.dll")
        {
            if !self.appv_warned.swap(true, Ordering::Relaxed) {
                tracing::warn!(
                    "binary uses App-V containerization, which fiddles with search \
                     directories and PATH in ways the simulation can't follow; \
                     results are probably not quite exact"
                );
            }
        }
    }

    fn append_appinit_dlls(
        &self,
        importer: &PeBinary,
        resolved_path: Option<&Path>,
        contexts: &mut Vec<ImportContext>,
    ) {
        let Some(system) = self.resolver.query().system.as_ref() else {
            return;
        };
        let expected = system.system_dir_for(importer).join("user32.dll");
        if !resolved_path.is_some_and(|p| same_path(p, &expected)) {
            return;
        }
        // store or key unavailable: the feature is simply off
        let Some(store) = system.appinit_config.as_ref() else {
            return;
        };
        let key = appinit_key_for(importer);
        let enabled = store.read_dword(key, "LoadAppInit_DLLs").unwrap_or(0);
        let dll_list = store.read_string(key, "AppInit_DLLs").unwrap_or_default();
        if enabled == 0 || dll_list.is_empty() {
            return;
        }

        // Extremely crude parser: entries are split on every space, so a
        // quoted path containing spaces comes apart. This mirrors what the
        // loader's consumers get away with and is kept as documented
        // behaviour.
        for dll in dll_list.split(' ').filter(|s| !s.is_empty()) {
            if importer.find_import(dll).is_some() || contains_name(contexts, dll) {
                continue;
            }
            tracing::debug!(dll, "AppInit injection");

            let resolved = self.resolver.resolve(importer, dll);
            let mut flags = ModuleFlag::empty();
            if resolved.strategy == ModuleSearchStrategy::NotFound {
                flags |= ModuleFlag::NOT_FOUND;
            }
            contexts.push(ImportContext {
                name: dll.to_owned(),
                strategy: ModuleSearchStrategy::AppInitDLL,
                binary: resolved.binary,
                apiset_backing: None,
                flags,
            });
        }
    }

    fn append_clr_references(
        &self,
        importer: &PeBinary,
        resolved_path: Option<&Path>,
        contexts: &mut Vec<ImportContext>,
    ) {
        let Some(scanner) = self.clr_scanner.as_ref() else {
            return;
        };
        let Some(system) = self.resolver.query().system.as_ref() else {
            return;
        };
        let expected = system.system_dir_for(importer).join("mscoree.dll");
        if !resolved_path.is_some_and(|p| same_path(p, &expected)) {
            return;
        }

        let referenced = match scanner.referenced_modules(&importer.filepath) {
            Ok(referenced) => referenced,
            Err(e) => {
                if !self.clr_warned.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        assembly = %importer.filepath.display(),
                        error = %e,
                        "managed metadata could not be parsed, CLR references will not be shown"
                    );
                }
                return;
            }
        };

        for name in referenced {
            // some assemblies carry a reference to an "empty" module
            if name.is_empty() {
                continue;
            }
            if importer.find_import(&name).is_some() || contains_name(contexts, &name) {
                continue;
            }
            tracing::debug!(module = %name, "referenced assembly");

            let resolved = self.resolver.resolve(importer, &name);
            let mut flags = ModuleFlag::CLR_REFERENCE;
            if resolved.strategy == ModuleSearchStrategy::NotFound {
                flags |= ModuleFlag::NOT_FOUND;
            }
            contexts.push(ImportContext {
                name,
                strategy: ModuleSearchStrategy::ClrAssembly,
                binary: resolved.binary,
                apiset_backing: None,
                flags,
            });
        }
    }
}

fn contains_name(contexts: &[ImportContext], name: &str) -> bool {
    contexts.iter().any(|c| c.name.eq_ignore_ascii_case(name))
}

fn same_path(a: &Path, b: &Path) -> bool {
    a.to_string_lossy()
        .eq_ignore_ascii_case(b.to_string_lossy().as_ref())
}
