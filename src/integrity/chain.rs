// src/integrity/chain.rs

//! Sequential SHA-256 chain over task payloads and artifacts.
//!
//! `head(n) = hex(SHA256(head(n-1) ∥ bytes(n)))`, with an empty string as
//! the head before the first element. Changing any earlier input changes
//! every later head.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::task::{Payload, canonical_bytes};

/// One chain step.
pub fn chain_hash(bytes: &[u8], prev: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev.as_bytes());
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Holds the current head of the chain and optionally persists it.
#[derive(Debug, Default, Clone)]
pub struct TaskChainer {
    head: String,
    head_path: Option<PathBuf>,
}

impl TaskChainer {
    /// In-memory chain starting from the empty head.
    pub fn new() -> Self {
        Self::default()
    }

    /// Chain whose head is written to `path` after every step.
    ///
    /// Picks up an existing head from `path` if one was persisted before.
    pub fn resume(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let head = match fs::read_to_string(&path) {
            Ok(text) => text.trim().to_string(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e),
        };
        info!(path = %path.display(), head = %head, "resumed integrity chain");
        Ok(Self {
            head,
            head_path: Some(path),
        })
    }

    pub fn head(&self) -> &str {
        &self.head
    }

    /// Head that [`TaskChainer::add_task`] would produce for `payload`.
    pub fn next_task_head(&self, payload: &Payload) -> String {
        chain_hash(&task_bytes(payload), &self.head)
    }

    /// Fold a task payload (canonical JSON bytes) into the chain.
    pub fn add_task(&mut self, payload: &Payload) -> io::Result<String> {
        self.advance(&task_bytes(payload))
    }

    /// Fold an artifact into the chain.
    pub fn add_artifact(&mut self, bytes: &[u8]) -> io::Result<String> {
        self.advance(bytes)
    }

    /// The in-memory head always advances; a failed write of the head file
    /// is reported after the fact.
    fn advance(&mut self, bytes: &[u8]) -> io::Result<String> {
        let next = chain_hash(bytes, &self.head);
        self.head = next.clone();
        debug!(head = %next, "chain advanced");
        if let Some(path) = &self.head_path {
            persist_head(path, &next)?;
        }
        Ok(next)
    }
}

fn task_bytes(payload: &Payload) -> Vec<u8> {
    canonical_bytes(&serde_json::Value::Object(payload.clone()))
}

/// Write the head through a temp file so readers never see a torn value.
fn persist_head(path: &Path, head: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, head)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn payload(v: serde_json::Value) -> Payload {
        v.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn first_link_hashes_bytes_alone() {
        assert_eq!(
            chain_hash(b"", ""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_ne!(chain_hash(b"a", ""), chain_hash(b"a", "x"));
    }

    #[test]
    fn replay_is_deterministic() {
        let run = || {
            let mut c = TaskChainer::new();
            c.add_task(&payload(json!({"b": 2, "a": 1}))).unwrap();
            c.add_artifact(b"artifact").unwrap();
            c.add_task(&payload(json!({"c": 3}))).unwrap()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn changing_an_early_payload_changes_every_later_head() {
        let heads = |first: serde_json::Value| {
            let mut c = TaskChainer::new();
            vec![
                c.add_task(&payload(first)).unwrap(),
                c.add_artifact(b"x").unwrap(),
                c.add_task(&payload(json!({"z": 0}))).unwrap(),
            ]
        };
        let a = heads(json!({"v": 1}));
        let b = heads(json!({"v": 2}));
        for (x, y) in a.iter().zip(b.iter()) {
            assert_ne!(x, y);
        }
    }

    #[test]
    fn next_task_head_does_not_advance() {
        let mut c = TaskChainer::new();
        let p = payload(json!({"k": 1}));
        let peeked = c.next_task_head(&p);
        assert_eq!(c.head(), "");
        assert_eq!(c.add_task(&p).unwrap(), peeked);
        assert_eq!(c.head(), peeked);
    }

    #[test]
    fn head_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain").join("head");

        let mut first = TaskChainer::resume(&path).unwrap();
        assert_eq!(first.head(), "");
        let head = first.add_artifact(b"one").unwrap();

        let mut again = TaskChainer::resume(&path).unwrap();
        assert_eq!(again.head(), head);
        let expected = chain_hash(b"two", &head);
        assert_eq!(again.add_artifact(b"two").unwrap(), expected);
    }
}
