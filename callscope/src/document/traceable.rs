//! Recorded stacks: timed samples and allocation events.

use crate::domain::{Pid, Tid};
use serde::{Deserialize, Serialize};

/// Maximum stack depth accepted by the callgraph.
pub const MAX_STACK_DEPTH: usize = 1024;

/// What produced a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TraceableKind {
    /// A timer- or counter-driven CPU sample
    #[default]
    Sample,
    /// A memory allocation (negative sizes are frees)
    Allocation { size: i64 },
}

/// One recorded stack. `addresses` are leaf-first and may contain context
/// markers (see [`AddressContext`](crate::domain::AddressContext)).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Traceable {
    pub pid: Pid,
    #[serde(default)]
    pub tid: Tid,
    /// Capture timestamp in nanoseconds
    #[serde(default)]
    pub time: i64,
    pub addresses: Vec<u64>,
    #[serde(default)]
    pub kind: TraceableKind,
}

impl Traceable {
    #[must_use]
    pub fn sample(pid: Pid, tid: Tid, addresses: Vec<u64>) -> Self {
        Self { pid, tid, time: 0, addresses, kind: TraceableKind::Sample }
    }

    #[must_use]
    pub fn allocation(pid: Pid, tid: Tid, size: i64, addresses: Vec<u64>) -> Self {
        Self { pid, tid, time: 0, addresses, kind: TraceableKind::Allocation { size } }
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.addresses.len()
    }

    /// Allocation size, or `None` for CPU samples.
    #[must_use]
    pub fn allocation_size(&self) -> Option<i64> {
        match self.kind {
            TraceableKind::Allocation { size } => Some(size),
            TraceableKind::Sample => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_defaults() {
        let traceable: Traceable = serde_json::from_str(r#"{"pid": 5, "addresses": [1, 2]}"#).unwrap();
        assert_eq!(traceable, Traceable::sample(Pid(5), Tid(0), vec![1, 2]));
    }

    #[test]
    fn test_allocation_json() {
        let traceable: Traceable = serde_json::from_str(
            r#"{"pid": 5, "tid": 6, "addresses": [], "kind": {"type": "allocation", "size": 64}}"#,
        )
        .unwrap();
        assert_eq!(traceable.allocation_size(), Some(64));
        assert_eq!(traceable.depth(), 0);
    }

    #[test]
    fn test_context_markers_survive_json() {
        let marker = u64::MAX - 127;
        let traceable = Traceable::sample(Pid(1), Tid(1), vec![marker, 0x1000]);
        let json = serde_json::to_string(&traceable).unwrap();
        let back: Traceable = serde_json::from_str(&json).unwrap();
        assert_eq!(back.addresses[0], marker);
    }
}
