//! Windows loader simulation: given a PE-COFF binary, reproduce the search
//! the loader would perform for every import and grow the result into a
//! deduplicated, cycle-safe dependency tree.

pub mod apiset;
pub mod cache;
pub mod common;
pub mod imports;
#[cfg(windows)]
pub mod knowndlls;
pub mod pe;
pub mod query;
pub mod runner;
pub mod search;
pub mod sxs;
pub mod system;
pub mod tree;

#[cfg(test)]
pub(crate) mod testutil;

use std::sync::Arc;

pub use cache::{ModuleFlag, ModuleInfo, ModulesCache};
pub use common::{decanonicalize, osstring_to_string, path_to_string, readable_canonical_path};
pub use common::LookupError;
pub use query::{ScanQuery, TreePolicy};
pub use runner::{CancellationToken, ScanObserver, ScanOutcome, ScanSession};
pub use search::ModuleSearchStrategy;

use imports::ImportContextBuilder;
use pe::{BinaryCache, DiskLocator};
use search::ModuleResolver;
use sxs::SxsEntries;

/// Run one complete traversal for the given query against the real
/// filesystem, to completion
pub fn scan(query: ScanQuery) -> Result<ScanOutcome, LookupError> {
    let locator = Arc::new(DiskLocator::new());
    let sxs = SxsEntries::collect_for_binary(locator.as_ref(), &query.target);
    let binaries = BinaryCache::new(locator);
    let resolver = Arc::new(ModuleResolver::new(query, sxs, binaries));
    let builder = Arc::new(ImportContextBuilder::new(resolver));

    let mut session = ScanSession::new(builder);
    let root = session.run()?;
    Ok(session.into_outcome(root))
}
