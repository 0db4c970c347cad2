//! Data structures that must be filled with the input and the parameters for a scan
//!
//! All tree-building behaviour is carried explicitly by the query; there is
//! no ambient global configuration anywhere in the engine.

use std::path::{Path, PathBuf};

use crate::common::LookupError;
use crate::system::WindowsSystem;

/// Absolute ceiling on eager tree expansion, applied regardless of the
/// configured maximum depth: an adversarial import cycle must never take
/// the traversal down with it.
pub const MAX_RECURSION_DEPTH: usize = 100;

/// How far the dependency tree is expanded eagerly
///
/// A full recursive dependency tree can be memory intensive, therefore the
/// choice is left to the caller to override the default behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum TreePolicy {
    /// Only the root's direct imports are resolved; nothing recurses
    ChildOnly,
    /// Recurse through non-delay-loaded imports only
    #[default]
    RecursiveOnlyOnDirectImports,
    /// Recurse through everything, including delay-loaded and API-set
    /// redirected targets
    Recursive,
}

/// Complete specification of a scan task
#[derive(Debug, Clone)]
pub struct ScanQuery {
    /// Path to the root binary under analysis
    pub target: PathBuf,
    /// Parent directory of the target, first entry of the loader search
    pub app_dir: PathBuf,
    /// Working directory of the (virtual) process whose loading is simulated
    pub working_dir: PathBuf,
    /// Additional search folders supplied by the user
    pub custom_search_folders: Vec<PathBuf>,
    pub policy: TreePolicy,
    /// Maximum eager recursion depth; the hard ceiling still applies on top
    pub max_depth: Option<usize>,
    /// Description of the Windows installation to resolve system DLLs
    /// against; `None` leaves system lookups unresolved
    pub system: Option<WindowsSystem>,
}

impl ScanQuery {
    /// Autodetect the settings with sensible defaults
    ///
    /// The working directory will be set to the one containing the binary
    /// (i.e. the app dir).
    #[cfg(windows)]
    pub fn deduce_from_binary_location<P: AsRef<Path>>(target: P) -> Result<Self, LookupError> {
        let app_dir = Self::parent_of(target.as_ref())?;
        Ok(Self {
            target: target.as_ref().to_owned(),
            app_dir: fs_err::canonicalize(&app_dir)?,
            working_dir: fs_err::canonicalize(&app_dir)?,
            custom_search_folders: Vec::new(),
            policy: TreePolicy::default(),
            max_depth: None,
            system: Some(WindowsSystem::current()?),
        })
    }

    /// Autodetect the settings with sensible defaults
    ///
    /// The working directory will be set to the one containing the binary
    /// (i.e. the app dir). The Windows system description is deduced from a
    /// Windows partition found along the target path, if any.
    #[cfg(not(windows))]
    pub fn deduce_from_binary_location<P: AsRef<Path>>(target: P) -> Result<Self, LookupError> {
        let app_dir = Self::parent_of(target.as_ref())?;
        Ok(Self {
            target: target.as_ref().to_owned(),
            app_dir: app_dir.clone(),
            working_dir: app_dir,
            custom_search_folders: Vec::new(),
            policy: TreePolicy::default(),
            max_depth: None,
            system: WindowsSystem::from_exe_location(target.as_ref())?,
        })
    }

    fn parent_of(target: &Path) -> Result<PathBuf, LookupError> {
        target
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_owned)
            .ok_or_else(|| {
                LookupError::ContextDeductionError(format!(
                    "could not find application directory for {}",
                    target.display()
                ))
            })
    }

    /// Depth limit actually applied to eager expansion
    pub fn effective_max_depth(&self) -> usize {
        self.max_depth
            .unwrap_or(MAX_RECURSION_DEPTH)
            .min(MAX_RECURSION_DEPTH)
    }
}
