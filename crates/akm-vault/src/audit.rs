//! Tamper-evident audit trail.
//!
//! Every operation against a named key appends one signed entry to a
//! newline-delimited JSON file.  Entries are never rewritten.  The signature
//! is an HMAC-SHA256 over the canonical JSON of the entry's identifying
//! fields, so any edit to a recorded line is detectable by
//! [`AuditLog::verify_all`].
//!
//! Audit-write failures are non-fatal: the triggering operation proceeds and
//! the failure is counted in a cumulative, externally observable counter.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::CryptoEngine;
use crate::error::Result;

/// The operation a single audit entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Read,
    Add,
    Update,
    Delete,
    Inject,
    Export,
    Backup,
    Proxy,
}

impl AuditAction {
    /// The string written to the audit file.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Add => "add",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Inject => "inject",
            Self::Export => "export",
            Self::Backup => "backup",
            Self::Proxy => "proxy",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One signed, append-only record of an operation against a named key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub key_name: String,
    pub project: String,
    pub action: AuditAction,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// The canonical field tuple covered by the signature.  Serialized field
/// order is fixed by this struct and must never change.
#[derive(Serialize)]
struct SignedFields<'a> {
    key_name: &'a str,
    project: &'a str,
    action: &'a str,
    timestamp: String,
}

fn canonical_message(key_name: &str, project: &str, action: AuditAction, ts: DateTime<Utc>) -> String {
    let fields = SignedFields {
        key_name,
        project,
        action: action.as_str(),
        timestamp: ts.to_rfc3339_opts(SecondsFormat::Nanos, true),
    };
    serde_json::to_string(&fields).expect("canonical audit fields serialize")
}

/// Aggregate result of replaying the audit file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub total: usize,
    pub verified: usize,
    pub unsigned: usize,
    pub tampered: usize,
}

// ---------------------------------------------------------------------------
// Log
// ---------------------------------------------------------------------------

/// Signed append-only audit log.
pub struct AuditLog {
    path: PathBuf,
    crypto: Arc<CryptoEngine>,
    failures: AtomicU64,
}

impl AuditLog {
    /// Create a log appending to `path`.  The file is created on first write.
    pub fn new(path: impl Into<PathBuf>, crypto: Arc<CryptoEngine>) -> Self {
        Self {
            path: path.into(),
            crypto,
            failures: AtomicU64::new(0),
        }
    }

    /// Path of the audit file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cumulative count of audit-write failures since process start.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Append one signed entry.  Write failures are counted and logged,
    /// never propagated; the triggering operation proceeds.
    pub fn append(&self, key_name: &str, project: &str, action: AuditAction) {
        let timestamp = Utc::now();
        let signature = self
            .crypto
            .sign(canonical_message(key_name, project, action, timestamp).as_bytes())
            .ok();

        let entry = AuditEntry {
            key_name: key_name.to_string(),
            project: project.to_string(),
            action,
            timestamp,
            signature,
        };

        if let Err(e) = self.write_line(&entry) {
            let count = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(
                error = %e,
                cumulative_failures = count,
                key_name,
                action = %action,
                "audit log write failed"
            );
        }
    }

    fn write_line(&self, entry: &AuditEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Replay every line, recompute its MAC, and classify it.
    ///
    /// A malformed line counts as tampered and does not abort the scan.  A
    /// missing audit file yields an all-zero report.
    pub fn verify_all(&self) -> Result<AuditReport> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(AuditReport::default());
            }
            Err(e) => return Err(e.into()),
        };

        let mut report = AuditReport::default();
        for line in data.lines() {
            if line.trim().is_empty() {
                continue;
            }
            report.total += 1;

            let entry: AuditEntry = match serde_json::from_str(line) {
                Ok(entry) => entry,
                Err(_) => {
                    report.tampered += 1;
                    continue;
                }
            };

            let Some(signature) = entry.signature.as_deref().filter(|s| !s.is_empty()) else {
                report.unsigned += 1;
                continue;
            };

            let message =
                canonical_message(&entry.key_name, &entry.project, entry.action, entry.timestamp);
            if self.crypto.verify(message.as_bytes(), signature)? {
                report.verified += 1;
            } else {
                report.tampered += 1;
            }
        }

        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
