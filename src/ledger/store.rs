//! Durable, append-only job ledger.
//!
//! - One JSON line per committed `ResultRecord`, never rewritten
//! - The whole file is read at open to rebuild the committed fingerprint set
//! - `append` is the only mutation; it writes one whole line under a lock
//!   and only then publishes the fingerprint to readers
//! - A partial trailing line left by a crash is skipped on load and
//!   terminated before the next append

use crate::ledger::Fingerprint;
use crate::models::{PairgenError, ResultRecord, Result};
use dashmap::DashSet;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};

/// The fields needed to rebuild ledger state; tolerant of extra columns.
#[derive(Debug, Deserialize)]
struct LedgerKey {
    fingerprint: Fingerprint,
    #[serde(default)]
    content_hash: Option<Fingerprint>,
}

/// Outcome of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Record written and fingerprint published
    Committed,
    /// Fingerprint was already committed; nothing written
    Duplicate,
}

/// Append-only JSONL ledger of completed jobs.
pub struct Ledger {
    path: PathBuf,
    fsync: bool,
    /// Serializes appends; the only writer of `committed`
    writer: Mutex<File>,
    committed: DashSet<Fingerprint>,
    content_hashes: DashSet<Fingerprint>,
    preloaded: usize,
    appended: AtomicUsize,
}

impl Ledger {
    /// Open (or create) the ledger at `path`, loading prior state.
    pub fn open(path: &Path, fsync: bool) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| PairgenError::ledger_write("creating ledger dir", e))?;
        }

        let committed = DashSet::new();
        let content_hashes = DashSet::new();
        let mut skipped = 0usize;

        if path.exists() {
            for key in read_keys(path, &mut skipped)? {
                if let Some(hash) = key.content_hash {
                    content_hashes.insert(hash);
                }
                committed.insert(key.fingerprint);
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)
            .map_err(|e| PairgenError::ledger_write("opening ledger", e))?;
        terminate_partial_line(&mut file)?;

        let preloaded = committed.len();
        info!(
            path = %path.display(),
            committed = preloaded,
            skipped_lines = skipped,
            "Ledger opened"
        );

        Ok(Self {
            path: path.to_path_buf(),
            fsync,
            writer: Mutex::new(file),
            committed,
            content_hashes,
            preloaded,
            appended: AtomicUsize::new(0),
        })
    }

    /// Fingerprints already committed by earlier runs of the ledger file.
    pub fn load_existing(path: &Path) -> Result<HashSet<Fingerprint>> {
        if !path.exists() {
            return Ok(HashSet::new());
        }
        let mut skipped = 0usize;
        Ok(read_keys(path, &mut skipped)?
            .into_iter()
            .map(|k| k.fingerprint)
            .collect())
    }

    /// Read every well-formed record in the ledger file.
    pub fn read_records(path: &Path) -> Result<Vec<ResultRecord>> {
        let mut records = Vec::new();
        for_each_line(path, |line_num, line| {
            match serde_json::from_slice::<ResultRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(line = line_num, error = %e, "Skipping unreadable ledger line"),
            }
        })?;
        Ok(records)
    }

    /// Whether a job with this fingerprint is already committed, by an earlier
    /// run or earlier in this one.
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.committed.contains(fingerprint)
    }

    /// Whether some committed record already has this content hash.
    pub fn contains_content(&self, content_hash: &Fingerprint) -> bool {
        self.content_hashes.contains(content_hash)
    }

    /// Durably append one record.
    ///
    /// Safe to call from many workers at once. The record is serialized
    /// first, then written as a single line under the writer lock. A record
    /// whose fingerprint is already committed is dropped.
    pub fn append(&self, record: &ResultRecord) -> Result<AppendOutcome> {
        let mut line = serde_json::to_vec(record)
            .map_err(|e| PairgenError::Internal(format!("Serializing record: {e}")))?;
        line.push(b'\n');

        let mut file = self
            .writer
            .lock()
            .map_err(|_| PairgenError::Internal("Ledger writer lock poisoned".to_string()))?;

        if self.committed.contains(&record.fingerprint) {
            debug!(fingerprint = %record.fingerprint.short(), "Dropping duplicate record");
            return Ok(AppendOutcome::Duplicate);
        }

        file.write_all(&line)
            .map_err(|e| PairgenError::ledger_write("appending record", e))?;
        file.flush()
            .map_err(|e| PairgenError::ledger_write("flushing ledger", e))?;
        if self.fsync {
            file.sync_data()
                .map_err(|e| PairgenError::ledger_write("syncing ledger", e))?;
        }

        self.content_hashes.insert(record.content_hash.clone());
        self.committed.insert(record.fingerprint.clone());
        self.appended.fetch_add(1, Ordering::Relaxed);
        drop(file);

        debug!(
            fingerprint = %record.fingerprint.short(),
            provider = %record.provider_id,
            "Record committed"
        );
        Ok(AppendOutcome::Committed)
    }

    /// Committed fingerprints, including this run's.
    pub fn len(&self) -> usize {
        self.committed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.committed.is_empty()
    }

    /// Fingerprints loaded at open.
    pub fn preloaded(&self) -> usize {
        self.preloaded
    }

    /// Records appended through this handle.
    pub fn appended(&self) -> usize {
        self.appended.load(Ordering::Relaxed)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Record counts per provider, then source label.
pub type LedgerTally = BTreeMap<String, BTreeMap<String, usize>>;

/// Count the ledger's records per (provider, source).
pub fn tally(path: &Path) -> Result<LedgerTally> {
    let mut counts = LedgerTally::new();
    for record in Ledger::read_records(path)? {
        *counts
            .entry(record.provider_id)
            .or_default()
            .entry(record.source_label)
            .or_default() += 1;
    }
    Ok(counts)
}

fn read_keys(path: &Path, skipped: &mut usize) -> Result<Vec<LedgerKey>> {
    let mut keys = Vec::new();
    for_each_line(path, |line_num, line| {
        match serde_json::from_slice::<LedgerKey>(line) {
            Ok(key) => keys.push(key),
            Err(e) => {
                *skipped += 1;
                warn!(line = line_num, error = %e, "Skipping unreadable ledger line");
            }
        }
    })?;
    Ok(keys)
}

/// Visit each non-blank line as raw bytes (1-based line numbers).
fn for_each_line(path: &Path, mut visit: impl FnMut(usize, &[u8])) -> Result<()> {
    let file = File::open(path).map_err(|e| PairgenError::io("opening ledger", e))?;
    let reader = BufReader::new(file);

    for (idx, line) in reader.split(b'\n').enumerate() {
        let line = line.map_err(|e| PairgenError::io("reading ledger", e))?;
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        visit(idx + 1, &line);
    }
    Ok(())
}

/// Make sure the next append starts on a fresh line.
fn terminate_partial_line(file: &mut File) -> Result<()> {
    let len = file
        .metadata()
        .map_err(|e| PairgenError::ledger_write("reading ledger metadata", e))?
        .len();
    if len == 0 {
        return Ok(());
    }

    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))
        .and_then(|_| file.read_exact(&mut last))
        .map_err(|e| PairgenError::ledger_write("inspecting ledger tail", e))?;

    if last[0] != b'\n' {
        warn!("Ledger ends with a partial line, terminating it");
        file.write_all(b"\n")
            .map_err(|e| PairgenError::ledger_write("terminating partial line", e))?;
    }
    Ok(())
}
