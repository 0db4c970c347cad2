use std::ffi::OsStr;
use std::path::Path;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LookupError {
    #[error("could not open file")]
    CouldNotOpenFile { source: std::io::Error },

    #[error("file is not in PE format: {0}")]
    WrongFileFormatError(pelite::Error),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("scan error: {0}")]
    ScanError(String),

    #[error("lookup context building error: {0}")]
    ContextDeductionError(String),

    #[error("could not demangle symbol {0}")]
    DemanglingError(String),

    #[error(transparent)]
    IOError(#[from] std::io::Error),
    #[error(transparent)]
    PEError(#[from] pelite::Error),
    #[error(transparent)]
    GoblinError(#[from] goblin::error::Error),
}

/// Lossy display form of an OsStr for messages and reports
pub fn osstring_to_string(s: &OsStr) -> String {
    s.to_string_lossy().into_owned()
}

/// Lossy display form of a path
pub fn path_to_string<P: AsRef<Path>>(p: P) -> String {
    osstring_to_string(p.as_ref().as_os_str())
}

/// Strip the extended-length prefix Windows canonicalization prepends
pub fn decanonicalize(s: &str) -> String {
    s.replacen(r"\\?\", "", 1)
}

/// Canonical path in a form suitable for the user (no \\?\ prefix)
pub fn readable_canonical_path<P: AsRef<Path>>(p: P) -> Result<String, LookupError> {
    Ok(decanonicalize(&path_to_string(fs_err::canonicalize(
        p.as_ref(),
    )?)))
}
