//! On-disk capture format (JSON).
//!
//! ```json
//! {
//!   "byte_order": "little",
//!   "processes": [{ "pid": 42, "cmdline": "gedit", "maps": "<proc maps text>", "root": "/proc/42/root" }],
//!   "samples": [{ "pid": 42, "tid": 42, "time": 1000, "addresses": [140737351, 140737400] }],
//!   "files": [{ "name": "/proc/kallsyms", "text": "ffffffff81000000 T _stext\n" }],
//!   "jitmap": [{ "address": 16140901064495857665, "name": "js::Interpret" }]
//! }
//! ```

use super::traceable::Traceable;
use super::{Document, Endianness, JitEntry};
use crate::domain::{DocumentError, Pid};
use crate::symbolization::{AddressLayout, HostNamespace, MountNamespace, RootedNamespace};
use log::debug;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capture {
    #[serde(default)]
    pub byte_order: Endianness,
    #[serde(default)]
    pub processes: Vec<ProcessRecord>,
    #[serde(default)]
    pub samples: Vec<Traceable>,
    #[serde(default)]
    pub files: Vec<EmbeddedFile>,
    #[serde(default)]
    pub jitmap: Vec<JitEntry>,
}

/// A process seen during capture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: Pid,
    #[serde(default)]
    pub cmdline: Option<String>,
    /// `/proc/<pid>/maps` text at capture time
    #[serde(default)]
    pub maps: String,
    /// Host directory the process saw as `/`, if it ran in a container
    #[serde(default)]
    pub root: Option<String>,
}

/// A file copied into the capture. Exactly one of `text` and `bytes` is
/// expected; `bytes` wins if both are present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedFile {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<Vec<u8>>,
}

impl EmbeddedFile {
    fn into_contents(self) -> (String, Vec<u8>) {
        let contents = self.bytes.or_else(|| self.text.map(String::into_bytes)).unwrap_or_default();
        (self.name, contents)
    }
}

impl Capture {
    /// Parse a capture file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or is not a valid capture.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DocumentError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|error| DocumentError::ReadFailed {
            path: path.display().to_string(),
            error,
        })?;
        Self::from_json(&content)
    }

    /// # Errors
    /// Returns an error if `json` is not a valid capture.
    pub fn from_json(json: &str) -> Result<Self, DocumentError> {
        let capture: Self = serde_json::from_str(json)?;
        debug!(
            "Capture: {} processes, {} samples, {} files",
            capture.processes.len(),
            capture.samples.len(),
            capture.files.len()
        );
        Ok(capture)
    }

    /// Build the in-memory document.
    ///
    /// # Errors
    /// Returns an error if two embedded files share a name.
    pub fn into_document(self) -> Result<Document, DocumentError> {
        let mut builder = Document::builder().endianness(self.byte_order);

        for record in self.processes {
            let namespace: Arc<dyn MountNamespace> = match record.root {
                Some(root) if !root.is_empty() => Arc::new(RootedNamespace::new(root)),
                _ => Arc::new(HostNamespace),
            };
            builder = builder.process_in_namespace(
                record.pid,
                record.cmdline.as_deref(),
                AddressLayout::parse(&record.maps),
                namespace,
            );
        }

        let mut seen = std::collections::HashSet::new();
        for file in self.files {
            if !seen.insert(file.name.clone()) {
                return Err(DocumentError::InvalidDocument(format!(
                    "file {} embedded twice",
                    file.name
                )));
            }
            let (name, contents) = file.into_contents();
            builder = builder.file(&name, contents);
        }

        for entry in self.jitmap {
            builder = builder.jit_entry(entry.address, &entry.name);
        }

        Ok(builder.traceables(self.samples).build())
    }
}
