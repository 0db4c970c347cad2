/*!
API set resolution

Certain system DLL names are virtual: the loader redirects them at load time
to a real backing library through the API set schema. The schema itself ships
inside `apisetschema.dll`; here it is an injected collaborator, fed either
from explicit pairs or from a JSON map extracted elsewhere.

Resources:

* https://blog.quarkslab.com/runtime-dll-name-resolution-apisetschema-part-i.html
* https://lucasg.github.io/2017/10/15/Api-set-resolution/
* https://www.geoffchappell.com/studies/windows/win32/apisetschema/index.htm

 */

use std::collections::HashMap;
use std::path::Path;

use crate::common::LookupError;

/// Whether the name looks like an API set contract rather than a file
pub fn is_apiset_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.starts_with("api-") || lower.starts_with("ext-")
}

/// Whether the name belongs to the extension api sets, which are tracked but
/// suppressed from user-facing module lists
pub fn is_apiset_ext_name(name: &str) -> bool {
    name.to_ascii_lowercase().starts_with("ext-")
}

/// Map from virtual DLL name to the real backing library
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiSetSchema {
    entries: HashMap<String, String>,
}

impl ApiSetSchema {
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        Self {
            entries: pairs
                .into_iter()
                .map(|(k, v)| (normalize(&k.into()), v.into()))
                .collect(),
        }
    }

    /// Load a schema dumped as a JSON object of `"contract": "backing.dll"`
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, LookupError> {
        let content = fs_err::read_to_string(path.as_ref())?;
        let map: HashMap<String, String> = serde_json::from_str(&content)
            .map_err(|e| LookupError::ParseError(format!("api set schema: {}", e)))?;
        Ok(Self::from_pairs(map))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve a contract name to its backing library name
    ///
    /// The schema is keyed without the trailing version group: a lookup for
    /// `api-ms-win-core-file-l1-2-0.dll` first tries the exact normalized
    /// name, then retries with the last `-N` group stripped, which is how
    /// the loader hashes contract names.
    pub fn lookup(&self, name: &str) -> Option<&str> {
        let normalized = normalize(name);
        if let Some(backing) = self.entries.get(&normalized) {
            return Some(backing);
        }
        let stripped = normalized.rsplit_once('-')?.0;
        self.entries.get(stripped).map(String::as_str)
    }
}

fn normalize(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    lower.trim_end_matches(".dll").to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> ApiSetSchema {
        ApiSetSchema::from_pairs([
            ("api-ms-win-core-file-l1-2-0", "kernelbase.dll"),
            ("api-ms-win-core-processthreads-l1-1", "kernel32.dll"),
            ("ext-ms-win-gdi-draw-l1-1-1", "gdi32full.dll"),
        ])
    }

    #[test]
    fn name_pattern() {
        assert!(is_apiset_name("api-ms-win-core-file-l1-2-0.dll"));
        assert!(is_apiset_name("EXT-ms-win-gdi-draw-l1-1-1.dll"));
        assert!(!is_apiset_name("kernel32.dll"));
        assert!(is_apiset_ext_name("ext-ms-win-gdi-draw-l1-1-1.dll"));
        assert!(!is_apiset_ext_name("api-ms-win-core-file-l1-2-0.dll"));
    }

    #[test]
    fn exact_lookup_ignores_case_and_extension() {
        let s = schema();
        assert_eq!(
            s.lookup("API-MS-Win-Core-File-L1-2-0.DLL"),
            Some("kernelbase.dll")
        );
        assert_eq!(
            s.lookup("api-ms-win-core-file-l1-2-0"),
            Some("kernelbase.dll")
        );
    }

    #[test]
    fn lookup_falls_back_to_stripped_version_group() {
        let s = schema();
        // schema entry is keyed without the trailing minor version
        assert_eq!(
            s.lookup("api-ms-win-core-processthreads-l1-1-3.dll"),
            Some("kernel32.dll")
        );
        assert_eq!(s.lookup("api-ms-win-core-unknown-l1-1-0.dll"), None);
    }
}
