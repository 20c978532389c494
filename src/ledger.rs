use crate::rewrite::NormalizedKey;
use crate::Result;
use chrono::{SecondsFormat, Utc};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

/// One durable line of the ledger: `<key>\t<when>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRecord {
    pub key: NormalizedKey,
    /// Absent on bare-key lines written by older runs.
    pub when: Option<String>,
}

impl DownloadRecord {
    pub fn now(key: NormalizedKey) -> Self {
        Self {
            key,
            when: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
        }
    }

    fn parse_line(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        let (key, when) = match trimmed.split_once('\t') {
            Some((key, when)) => (key, Some(when.trim().to_string())),
            None => (trimmed, None),
        };
        if key.trim().is_empty() {
            return None;
        }
        Some(Self {
            key: NormalizedKey::from_recorded(key),
            when,
        })
    }

    fn to_line(&self) -> String {
        match &self.when {
            Some(when) => format!("{}\t{when}\n", self.key),
            None => format!("{}\n", self.key),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerEntry {
    Recorded,
    /// The file exists although no record was appended (crash between write and record).
    OnDisk,
    /// Another worker holds the key right now.
    InFlight,
    Missing,
}

/// Append-only record of downloaded keys, mirrored into memory on open.
#[derive(Debug)]
pub struct DownloadLedger {
    path: PathBuf,
    download_dir: PathBuf,
    keys: HashSet<NormalizedKey>,
    in_flight: HashSet<NormalizedKey>,
    needs_newline: bool,
}

impl DownloadLedger {
    /// A missing ledger file is an empty ledger.
    pub fn open(path: &Path, download_dir: &Path) -> Result<Self> {
        let mut ledger = Self::empty(path, download_dir);
        if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            ledger.needs_newline = !raw.is_empty() && !raw.ends_with('\n');
            for record in raw.lines().filter_map(DownloadRecord::parse_line) {
                ledger.keys.insert(record.key);
            }
        }
        Ok(ledger)
    }

    /// Starts with no records; appends still go to `path`.
    pub fn empty(path: &Path, download_dir: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            download_dir: download_dir.to_path_buf(),
            keys: HashSet::new(),
            in_flight: HashSet::new(),
            needs_newline: false,
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, key: &NormalizedKey) -> bool {
        self.keys.contains(key)
    }

    pub fn target_path(&self, key: &NormalizedKey) -> Option<PathBuf> {
        key.file_name().map(|name| self.download_dir.join(name))
    }

    pub fn lookup(&self, key: &NormalizedKey) -> LedgerEntry {
        if self.keys.contains(key) {
            return LedgerEntry::Recorded;
        }
        if self.in_flight.contains(key) {
            return LedgerEntry::InFlight;
        }
        match self.target_path(key) {
            Some(path) if path.exists() => LedgerEntry::OnDisk,
            _ => LedgerEntry::Missing,
        }
    }

    /// Read-only check for single-threaded callers. Concurrent callers use
    /// [`DownloadLedger::claim`], which answers the same question and reserves
    /// the key in one step.
    pub fn should_skip(&self, key: &NormalizedKey) -> bool {
        self.lookup(key) != LedgerEntry::Missing
    }

    /// Marks `key` in flight when it is missing; otherwise reports why it is taken.
    pub fn claim(&mut self, key: &NormalizedKey) -> LedgerEntry {
        let entry = self.lookup(key);
        if entry == LedgerEntry::Missing {
            self.in_flight.insert(key.clone());
        }
        entry
    }

    pub fn release(&mut self, key: &NormalizedKey) {
        self.in_flight.remove(key);
    }

    /// Idempotent. The in-memory set is updated even when the append fails, so a
    /// failed write never causes a second download within the run.
    pub fn record(&mut self, key: &NormalizedKey) -> Result<bool> {
        self.in_flight.remove(key);
        if !self.keys.insert(key.clone()) {
            return Ok(false);
        }
        self.append(&DownloadRecord::now(key.clone()))?;
        Ok(true)
    }

    fn append(&mut self, record: &DownloadRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut line = record.to_line();
        if self.needs_newline {
            line.insert(0, '\n');
        }
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?
            .write_all(line.as_bytes())?;
        self.needs_newline = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewrite::normalize;

    fn key(id: &str) -> NormalizedKey {
        normalize(&format!("https://pbs.twimg.com/media/{id}.jpg"), "NASA")
    }

    #[test]
    fn missing_ledger_file_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger =
            DownloadLedger::open(&dir.path().join("downloaded_urls.log"), dir.path()).expect("open");
        assert!(ledger.is_empty());
        assert!(!ledger.should_skip(&key("A")));
    }

    #[test]
    fn record_is_idempotent_and_durable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("downloaded_urls.log");
        let mut ledger = DownloadLedger::open(&path, dir.path()).expect("open");

        assert!(ledger.record(&key("A")).expect("first"));
        assert!(!ledger.record(&key("A")).expect("second"));
        assert!(ledger.should_skip(&key("A")));

        let raw = std::fs::read_to_string(&path).expect("read");
        assert_eq!(raw.lines().count(), 1);

        ledger.record(&key("B")).expect("record b");
        drop(ledger);
        let reloaded = DownloadLedger::open(&path, dir.path()).expect("reopen");
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.contains(&key("A")));
        assert!(reloaded.contains(&key("B")));
    }

    #[test]
    fn reload_accepts_bare_keys_and_repairs_torn_tail() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("downloaded_urls.log");
        std::fs::write(
            &path,
            format!("{}\t2024-01-01T00:00:00Z\n\n{}", key("A"), key("B")),
        )
        .expect("seed");

        let mut ledger = DownloadLedger::open(&path, dir.path()).expect("open");
        assert_eq!(ledger.len(), 2);
        ledger.record(&key("C")).expect("record c");

        let reloaded = DownloadLedger::open(&path, dir.path()).expect("reopen");
        assert_eq!(reloaded.len(), 3);
        assert!(reloaded.contains(&key("B")));
        assert!(reloaded.contains(&key("C")));
    }

    #[test]
    fn file_on_disk_counts_as_downloaded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger =
            DownloadLedger::open(&dir.path().join("downloaded_urls.log"), dir.path()).expect("open");
        let k = key("ONDISK");
        std::fs::write(dir.path().join("NASA_ONDISK.jpg"), b"jpeg").expect("write");
        assert_eq!(ledger.lookup(&k), LedgerEntry::OnDisk);
        assert!(ledger.should_skip(&k));
    }

    #[test]
    fn should_skip_agrees_with_claim() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut ledger =
            DownloadLedger::open(&dir.path().join("downloaded_urls.log"), dir.path()).expect("open");
        ledger.record(&key("DONE")).expect("record");
        std::fs::write(dir.path().join("NASA_DISK.jpg"), b"jpeg").expect("write");
        for id in ["DONE", "DISK", "NEW"] {
            let k = key(id);
            let skip = ledger.should_skip(&k);
            assert_eq!(skip, ledger.claim(&k) != LedgerEntry::Missing, "id={id}");
        }
        assert!(!ledger.should_skip(&key("OTHER")));
    }

    #[test]
    fn claim_blocks_concurrent_download_until_released() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut ledger =
            DownloadLedger::open(&dir.path().join("downloaded_urls.log"), dir.path()).expect("open");
        let k = key("A");
        assert_eq!(ledger.claim(&k), LedgerEntry::Missing);
        assert_eq!(ledger.claim(&k), LedgerEntry::InFlight);
        ledger.release(&k);
        assert_eq!(ledger.claim(&k), LedgerEntry::Missing);
        ledger.record(&k).expect("record");
        assert_eq!(ledger.claim(&k), LedgerEntry::Recorded);
    }
}
