//! Side-by-Side manifest handling
//!
//! A binary may carry a `<name>.manifest` file next to it redirecting some
//! of its imports to private assemblies. Only the redirections matter here:
//! the output is a name -> path lookup consulted by the resolver before the
//! regular directory search.

use std::path::{Path, PathBuf};

use crate::common::{path_to_string, LookupError};
use crate::pe::BinaryLocator;

#[derive(Debug, Clone)]
pub struct SxsEntry {
    /// Redirected module name, as it would appear in an import table
    pub name: String,
    /// Private-assembly location of the module
    pub path: PathBuf,
}

/// Private-assembly redirections collected for one root binary
#[derive(Debug, Clone, Default)]
pub struct SxsEntries {
    entries: Vec<SxsEntry>,
}

impl SxsEntries {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Gather redirections for `binary_path` from its sibling manifest,
    /// if there is one
    pub fn collect_for_binary(locator: &dyn BinaryLocator, binary_path: &Path) -> Self {
        let manifest_path = PathBuf::from(format!("{}.manifest", path_to_string(binary_path)));
        if !locator.exists(&manifest_path) {
            return Self::empty();
        }
        match Self::from_manifest_file(locator, &manifest_path) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(
                    manifest = %manifest_path.display(),
                    error = %e,
                    "ignoring unreadable side-by-side manifest"
                );
                Self::empty()
            }
        }
    }

    /// Parse one manifest file; redirected files live relative to the
    /// manifest, dependent assemblies are probed in the application
    /// directory and in a subdirectory carrying the assembly name
    pub fn from_manifest_file(
        locator: &dyn BinaryLocator,
        manifest_path: &Path,
    ) -> Result<Self, LookupError> {
        let app_dir = manifest_path
            .parent()
            .map(Path::to_owned)
            .unwrap_or_default();
        let content = fs_err::read_to_string(manifest_path)?;
        let doc = roxmltree::Document::parse(&content)
            .map_err(|e| LookupError::ParseError(format!("manifest: {}", e)))?;

        let mut entries = Vec::new();

        for node in doc.descendants().filter(|n| n.has_tag_name("file")) {
            if let Some(name) = node.attribute("name") {
                entries.push(SxsEntry {
                    name: name.to_owned(),
                    path: app_dir.join(name),
                });
            }
        }

        for dependent in doc
            .descendants()
            .filter(|n| n.has_tag_name("dependentAssembly"))
        {
            let Some(identity) = dependent
                .descendants()
                .find(|n| n.has_tag_name("assemblyIdentity"))
            else {
                continue;
            };
            if identity.attribute("type") != Some("win32") {
                continue;
            }
            let Some(assembly) = identity.attribute("name") else {
                continue;
            };
            let dll = format!("{}.dll", assembly);
            for candidate_dir in [app_dir.clone(), app_dir.join(assembly)] {
                if let Some(found) = locator.find_in_dir(&candidate_dir, &dll) {
                    entries.push(SxsEntry {
                        name: dll.clone(),
                        path: found,
                    });
                    break;
                }
            }
        }

        Ok(Self { entries })
    }

    /// Look up a redirection for the given import name
    pub fn find(&self, import_name: &str) -> Option<&SxsEntry> {
        self.entries
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(import_name))
    }
}
