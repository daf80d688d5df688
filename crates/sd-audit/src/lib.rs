//! Append-only audit log: JSON Lines, one event per line.
//!
//! Optional hash chain: each event records `hash_prev` (the previous
//! event's hash) and `hash_self`, so tampering with any line breaks every
//! line after it. Event ids are derived deterministically from the chain
//! state and a sequence counter — replaying the same events after a restart
//! produces the same ids, never a fork.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub plan_id: Option<Uuid>,
    pub ts_utc: DateTime<Utc>,
    /// Coarse stream: `engine`, `broker`, `orchestrator`, `cache`.
    pub topic: String,
    pub event_type: String,
    pub payload: Value,
    pub hash_prev: Option<String>,
    pub hash_self: Option<String>,
}

/// Append-only audit writer.
///
/// Not `Sync`; the orchestrator owns one writer and serializes appends.
/// When resuming an existing log after restart, call [`AuditWriter::resume`]
/// so the chain and the sequence counter continue instead of forking.
pub struct AuditWriter {
    path: PathBuf,
    hash_chain: bool,
    last_hash: Option<String>,
    seq: u64,
}

impl AuditWriter {
    /// Create the writer and ensure parent directories exist.
    pub fn new(path: impl AsRef<Path>, hash_chain: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create_dir_all {parent:?}"))?;
        }
        Ok(Self {
            path,
            hash_chain,
            last_hash: None,
            seq: 0,
        })
    }

    /// Restore chain state from an existing log file.
    ///
    /// Reads the file once, counts events, and picks up the last
    /// `hash_self`. A missing file is a fresh start, not an error.
    pub fn resume(path: impl AsRef<Path>, hash_chain: bool) -> Result<Self> {
        let mut w = Self::new(&path, hash_chain)?;
        let text = match fs::read_to_string(&w.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(w),
            Err(e) => return Err(e).with_context(|| format!("read audit log {:?}", w.path)),
        };
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let ev: AuditEvent =
                serde_json::from_str(line).context("corrupt audit log line on resume")?;
            w.last_hash = ev.hash_self;
            w.seq += 1;
        }
        Ok(w)
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn last_hash(&self) -> Option<&str> {
        self.last_hash.as_deref()
    }

    /// Append one event and return it as written.
    pub fn append(
        &mut self,
        plan_id: Option<Uuid>,
        topic: &str,
        event_type: &str,
        payload: Value,
    ) -> Result<AuditEvent> {
        let event_id = derive_event_id(self.last_hash.as_deref(), self.seq);
        self.seq += 1;

        let mut ev = AuditEvent {
            event_id,
            plan_id,
            ts_utc: Utc::now(),
            topic: topic.to_string(),
            event_type: event_type.to_string(),
            payload,
            hash_prev: None,
            hash_self: None,
        };

        if self.hash_chain {
            ev.hash_prev = self.last_hash.clone();
            let hash = compute_event_hash(&ev)?;
            ev.hash_self = Some(hash.clone());
            self.last_hash = Some(hash);
        }

        let line = serde_json::to_string(&ev).context("serialize audit event")?;
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open audit log {:?}", self.path))?;
        writeln!(f, "{line}").context("write audit event")?;
        Ok(ev)
    }
}

/// Verify the hash chain of a log file; returns the number of valid events.
pub fn verify_chain(path: impl AsRef<Path>) -> Result<usize> {
    let text = fs::read_to_string(path.as_ref())
        .with_context(|| format!("read audit log {:?}", path.as_ref()))?;
    let mut prev: Option<String> = None;
    let mut count = 0usize;
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let ev: AuditEvent = serde_json::from_str(line).context("corrupt audit log line")?;
        if ev.hash_prev != prev {
            anyhow::bail!("hash chain broken at event {count}: prev mismatch");
        }
        let expected = compute_event_hash(&AuditEvent {
            hash_self: None,
            ..ev.clone()
        })?;
        if ev.hash_self.as_deref() != Some(expected.as_str()) {
            anyhow::bail!("hash chain broken at event {count}: self mismatch");
        }
        prev = ev.hash_self;
        count += 1;
    }
    Ok(count)
}

/// Deterministic event id: UUIDv5 over the chain tip and sequence number.
fn derive_event_id(last_hash: Option<&str>, seq: u64) -> Uuid {
    let material = format!("{}:{}", last_hash.unwrap_or("genesis"), seq);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, material.as_bytes())
}

/// Hash over the event with `hash_self` cleared, fields in struct order.
fn compute_event_hash(ev: &AuditEvent) -> Result<String> {
    let mut clone = ev.clone();
    clone.hash_self = None;
    let bytes = serde_json::to_vec(&clone).context("serialize event for hashing")?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chain_links_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let mut w = AuditWriter::new(&path, true).unwrap();

        let a = w.append(None, "engine", "state_change", json!({"to": "armed"})).unwrap();
        let b = w.append(None, "engine", "state_change", json!({"to": "triggered"})).unwrap();
        assert_eq!(b.hash_prev, a.hash_self);
        assert_eq!(verify_chain(&path).unwrap(), 2);
    }

    #[test]
    fn tamper_breaks_verification() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let mut w = AuditWriter::new(&path, true).unwrap();
        w.append(None, "engine", "a", json!({})).unwrap();
        w.append(None, "engine", "b", json!({})).unwrap();

        let text = fs::read_to_string(&path).unwrap().replace("\"a\"", "\"x\"");
        fs::write(&path, text).unwrap();
        assert!(verify_chain(&path).is_err());
    }

    #[test]
    fn resume_continues_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        {
            let mut w = AuditWriter::new(&path, true).unwrap();
            w.append(None, "engine", "a", json!({})).unwrap();
        }
        let mut w = AuditWriter::resume(&path, true).unwrap();
        assert_eq!(w.seq(), 1);
        w.append(None, "engine", "b", json!({})).unwrap();
        assert_eq!(verify_chain(&path).unwrap(), 2);
    }

    #[test]
    fn event_ids_deterministic_per_chain_position() {
        let dir = tempfile::tempdir().unwrap();
        let mk = |name: &str| {
            let path = dir.path().join(name);
            let mut w = AuditWriter::new(&path, true).unwrap();
            let a = w.append(None, "t", "a", json!({})).unwrap();
            (a.event_id, w)
        };
        let (id1, _w1) = mk("one.jsonl");
        let (id2, _w2) = mk("two.jsonl");
        // Same chain position, same genesis → same derived id.
        assert_eq!(id1, id2);
    }
}
