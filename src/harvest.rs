use crate::config::HarvestRequest;
use crate::dispatch::{ExtractorChain, PageExtraction};
use crate::fetch::{Fetch, FetchKind};
use crate::journal::FailureLog;
use crate::layouts::ImageRef;
use crate::ledger::{DownloadLedger, LedgerEntry};
use crate::paths::GalleryPaths;
use crate::rewrite::{self, NormalizedKey};
use crate::snapshots::{self, Snapshot};
use crate::{HarvestError, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Serialize)]
pub struct HarvestSummary {
    pub profile_id: String,
    pub run_id: String,
    pub snapshots_total: usize,
    pub snapshots_visited: usize,
    pub pages_failed: usize,
    pub pages_malformed: usize,
    pub pages_without_profile_content: usize,
    pub pages_with_profile_content: usize,
    pub images_found: usize,
    pub images_downloaded: usize,
    pub images_skipped: usize,
    pub images_failed: usize,
    pub ledger_records: usize,
    pub canceled: bool,
    pub output_dir: String,
    pub manifest_path: String,
    pub summary_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageStatus {
    Downloaded,
    SkippedRecorded,
    SkippedOnDisk,
    SkippedInFlight,
    Failed,
    UnresolvableFilename,
}

impl ImageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Downloaded => "downloaded",
            Self::SkippedRecorded => "skipped_recorded",
            Self::SkippedOnDisk => "skipped_on_disk",
            Self::SkippedInFlight => "skipped_in_flight",
            Self::Failed => "failed",
            Self::UnresolvableFilename => "unresolvable_filename",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchedFrom {
    Primary,
    RawContent,
}

impl FetchedFrom {
    fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::RawContent => "raw_content",
        }
    }
}

#[derive(Debug)]
struct ImageOutcome {
    status: ImageStatus,
    fetched_from: Option<FetchedFrom>,
    saved_path: Option<PathBuf>,
    bytes: Option<usize>,
    sha256: Option<String>,
}

impl ImageOutcome {
    fn status_only(status: ImageStatus) -> Self {
        Self {
            status,
            fetched_from: None,
            saved_path: None,
            bytes: None,
            sha256: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct ManifestRow<'a> {
    snapshot_timestamp: &'a str,
    image_ref: &'a str,
    key: &'a str,
    status: &'static str,
    fetched_from: &'static str,
    saved_path: String,
    bytes: Option<usize>,
    sha256: Option<&'a str>,
}

#[derive(Debug, Default)]
struct Tally {
    snapshots_visited: AtomicUsize,
    pages_failed: AtomicUsize,
    pages_malformed: AtomicUsize,
    pages_without_profile_content: AtomicUsize,
    pages_with_profile_content: AtomicUsize,
    images_found: AtomicUsize,
    images_downloaded: AtomicUsize,
    images_skipped: AtomicUsize,
    images_failed: AtomicUsize,
}

fn bump(counter: &AtomicUsize, by: usize) {
    counter.fetch_add(by, Ordering::SeqCst);
}

fn read(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

/// Harvests every archived capture of one profile.
///
/// Only a snapshot-index failure is returned as an error. Page-level and
/// image-level failures are appended to the failure logs and counted in the
/// summary. `should_cancel` is polled between snapshots and between images.
pub fn run_profile_harvest<FShouldCancel, FLog>(
    request: &HarvestRequest,
    paths: &GalleryPaths,
    run_id: &str,
    fetcher: &dyn Fetch,
    chain: &ExtractorChain,
    should_cancel: FShouldCancel,
    log_line: FLog,
) -> Result<HarvestSummary>
where
    FShouldCancel: Fn() -> bool + Sync,
    FLog: Fn(&str, &str, serde_json::Value) -> Result<()> + Sync,
{
    let profile_id = request.profile_id.as_str();
    let output_dir = paths.profile_dir(profile_id);
    if let Err(err) = paths.ensure_dirs(profile_id) {
        eprintln!(
            "!!! cannot create output dirs under {}: {err}",
            paths.base_dir.to_string_lossy()
        );
        emit(
            &log_line,
            "error",
            "output_dir_unavailable",
            serde_json::json!({
                "output_dir": output_dir.to_string_lossy().to_string(),
                "error": err.to_string(),
            }),
        );
    }
    let snapshot_failures = FailureLog::new(paths.snapshot_failures_path(profile_id));
    let image_failures = FailureLog::new(paths.image_failures_path(profile_id));

    let ledger_path = paths.ledger_path(profile_id);
    let ledger = match DownloadLedger::open(&ledger_path, &output_dir) {
        Ok(v) => v,
        Err(err) => {
            eprintln!(
                "!!! cannot read ledger {}: {err}; continuing with files on disk only",
                ledger_path.to_string_lossy()
            );
            DownloadLedger::empty(&ledger_path, &output_dir)
        }
    };

    emit(
        &log_line,
        "info",
        "harvest_begin",
        serde_json::json!({
            "range": request.range,
            "workers": request.workers,
            "max_attempts": request.http.max_attempts,
            "ledger_records": ledger.len(),
            "output_dir": output_dir.to_string_lossy().to_string(),
            "strategies": chain.strategy_names(),
        }),
    );

    let snapshots = match snapshots::query_snapshots(
        fetcher,
        &request.cdx_endpoint,
        &request.site_root,
        profile_id,
        &request.range,
    ) {
        Ok(v) => v,
        Err(err) => {
            snapshot_failures.append(&format!(
                "snapshot index query failed for {}/{profile_id} (from={}, to={}): {err}",
                request.site_root,
                request.range.from.as_deref().unwrap_or("-"),
                request.range.to.as_deref().unwrap_or("-"),
            ));
            emit(
                &log_line,
                "error",
                "snapshot_index_failed",
                serde_json::json!({
                    "site_root": request.site_root,
                    "range": request.range,
                    "error": err.to_string(),
                }),
            );
            return Err(err);
        }
    };
    let snapshots: Vec<Snapshot> = snapshots.into_iter().collect();
    emit(
        &log_line,
        "info",
        "snapshot_index_loaded",
        serde_json::json!({ "snapshots": snapshots.len() }),
    );

    let manifest_path = paths.manifest_path(profile_id, run_id);
    let manifest = match csv::Writer::from_path(&manifest_path) {
        Ok(writer) => Some(Mutex::new(writer)),
        Err(err) => {
            eprintln!(
                "!!! cannot create manifest {}: {err}",
                manifest_path.to_string_lossy()
            );
            None
        }
    };

    let harvest = Harvest {
        request,
        fetcher,
        chain,
        ledger: Mutex::new(ledger),
        manifest,
        snapshot_failures,
        image_failures,
        should_cancel: &should_cancel,
        log_line: &log_line,
        tally: Tally::default(),
        canceled: AtomicBool::new(false),
    };
    harvest.process_all(&snapshots);
    harvest.flush_manifest();

    let tally = &harvest.tally;
    let summary_path = paths.summary_path(profile_id, run_id);
    let summary = HarvestSummary {
        profile_id: profile_id.to_string(),
        run_id: run_id.to_string(),
        snapshots_total: snapshots.len(),
        snapshots_visited: read(&tally.snapshots_visited),
        pages_failed: read(&tally.pages_failed),
        pages_malformed: read(&tally.pages_malformed),
        pages_without_profile_content: read(&tally.pages_without_profile_content),
        pages_with_profile_content: read(&tally.pages_with_profile_content),
        images_found: read(&tally.images_found),
        images_downloaded: read(&tally.images_downloaded),
        images_skipped: read(&tally.images_skipped),
        images_failed: read(&tally.images_failed),
        ledger_records: harvest.lock_ledger().len(),
        canceled: harvest.canceled.load(Ordering::SeqCst),
        output_dir: output_dir.to_string_lossy().to_string(),
        manifest_path: manifest_path.to_string_lossy().to_string(),
        summary_path: summary_path.to_string_lossy().to_string(),
    };

    if let Err(err) = write_summary(&summary_path, &summary) {
        eprintln!(
            "!!! cannot write summary {}: {err}",
            summary_path.to_string_lossy()
        );
    }
    emit(
        &log_line,
        "info",
        "harvest_done",
        serde_json::json!({
            "snapshots_total": summary.snapshots_total,
            "snapshots_visited": summary.snapshots_visited,
            "pages_failed": summary.pages_failed,
            "pages_malformed": summary.pages_malformed,
            "images_found": summary.images_found,
            "images_downloaded": summary.images_downloaded,
            "images_skipped": summary.images_skipped,
            "images_failed": summary.images_failed,
            "canceled": summary.canceled,
        }),
    );

    Ok(summary)
}

/// Log sink failures must never interrupt downloads.
fn emit<FLog>(log_line: &FLog, level: &str, event: &str, data: serde_json::Value)
where
    FLog: Fn(&str, &str, serde_json::Value) -> Result<()>,
{
    if let Err(err) = log_line(level, event, data) {
        eprintln!("!!! cannot write event log ({event}): {err}");
    }
}

fn write_summary(path: &Path, summary: &HarvestSummary) -> Result<()> {
    let json = serde_json::to_string_pretty(summary)?;
    std::fs::write(path, format!("{json}\n"))?;
    Ok(())
}

/// Writes through a `.part` sibling so a crash never leaves a truncated file
/// under the name the on-disk skip check looks for.
fn write_media_file(target: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut partial = target.as_os_str().to_owned();
    partial.push(".part");
    let partial = PathBuf::from(partial);
    std::fs::write(&partial, data)?;
    if let Err(err) = std::fs::rename(&partial, target) {
        let _ = std::fs::remove_file(&partial);
        return Err(err);
    }
    Ok(())
}

struct Harvest<'a, FShouldCancel, FLog> {
    request: &'a HarvestRequest,
    fetcher: &'a dyn Fetch,
    chain: &'a ExtractorChain,
    ledger: Mutex<DownloadLedger>,
    manifest: Option<Mutex<csv::Writer<std::fs::File>>>,
    snapshot_failures: FailureLog,
    image_failures: FailureLog,
    should_cancel: &'a FShouldCancel,
    log_line: &'a FLog,
    tally: Tally,
    canceled: AtomicBool,
}

impl<FShouldCancel, FLog> Harvest<'_, FShouldCancel, FLog>
where
    FShouldCancel: Fn() -> bool + Sync,
    FLog: Fn(&str, &str, serde_json::Value) -> Result<()> + Sync,
{
    fn process_all(&self, snapshots: &[Snapshot]) {
        let workers = self.request.workers.clamp(1, snapshots.len().max(1));
        let cursor = AtomicUsize::new(0);
        if workers == 1 {
            self.worker_loop(snapshots, &cursor);
            return;
        }
        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| self.worker_loop(snapshots, &cursor));
            }
        });
    }

    fn worker_loop(&self, snapshots: &[Snapshot], cursor: &AtomicUsize) {
        loop {
            if self.check_canceled() {
                break;
            }
            let index = cursor.fetch_add(1, Ordering::SeqCst);
            let Some(snapshot) = snapshots.get(index) else {
                break;
            };
            self.process_snapshot(index, snapshots.len(), snapshot);
            if self.request.page_delay_ms > 0 {
                thread::sleep(Duration::from_millis(self.request.page_delay_ms));
            }
        }
    }

    fn check_canceled(&self) -> bool {
        if self.canceled.load(Ordering::SeqCst) {
            return true;
        }
        if (self.should_cancel)() {
            self.canceled.store(true, Ordering::SeqCst);
            self.emit("info", "harvest_canceled", serde_json::json!({}));
            return true;
        }
        false
    }

    fn emit(&self, level: &str, event: &str, data: serde_json::Value) {
        emit(self.log_line, level, event, data);
    }

    fn lock_ledger(&self) -> MutexGuard<'_, DownloadLedger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn process_snapshot(&self, index: usize, total: usize, snapshot: &Snapshot) {
        bump(&self.tally.snapshots_visited, 1);
        let page_url = snapshot.page_url(&self.request.archive_root);
        self.emit(
            "info",
            "snapshot_begin",
            serde_json::json!({ "index": index + 1, "total": total, "url": page_url }),
        );

        let body = match self.fetcher.fetch(&page_url, FetchKind::Page) {
            Ok(v) => v,
            Err(err) => {
                bump(&self.tally.pages_failed, 1);
                self.snapshot_failures
                    .append(&format!("page fetch failed: {page_url} | {err}"));
                self.emit(
                    "warn",
                    "page_fetch_failed",
                    serde_json::json!({ "url": page_url, "error": err.to_string() }),
                );
                return;
            }
        };

        match self.chain.dispatch(&body, &self.request.profile_id) {
            PageExtraction::Malformed { strategy, detail } => {
                bump(&self.tally.pages_malformed, 1);
                let err = HarvestError::MalformedPage {
                    url: page_url.clone(),
                    detail,
                };
                self.snapshot_failures
                    .append(&format!("page parse failed ({strategy}): {err}"));
                self.emit(
                    "warn",
                    "page_malformed",
                    serde_json::json!({ "url": page_url, "strategy": strategy, "error": err.to_string() }),
                );
            }
            PageExtraction::NoProfileContent => {
                bump(&self.tally.pages_without_profile_content, 1);
                self.emit(
                    "info",
                    "page_without_profile_content",
                    serde_json::json!({ "url": page_url }),
                );
            }
            PageExtraction::Images { strategy, images } => {
                bump(&self.tally.pages_with_profile_content, 1);
                bump(&self.tally.images_found, images.len());
                self.emit(
                    "info",
                    "page_extracted",
                    serde_json::json!({ "url": page_url, "strategy": strategy, "images": images.len() }),
                );
                for image_ref in &images {
                    if self.check_canceled() {
                        break;
                    }
                    self.process_image(snapshot, image_ref);
                }
            }
        }
    }

    fn process_image(&self, snapshot: &Snapshot, image_ref: &ImageRef) {
        let key = rewrite::normalize(image_ref, &self.request.profile_id);
        let outcome = self.download_image(snapshot, image_ref, &key);
        match outcome.status {
            ImageStatus::Downloaded => bump(&self.tally.images_downloaded, 1),
            ImageStatus::SkippedRecorded
            | ImageStatus::SkippedOnDisk
            | ImageStatus::SkippedInFlight => bump(&self.tally.images_skipped, 1),
            ImageStatus::Failed | ImageStatus::UnresolvableFilename => {
                bump(&self.tally.images_failed, 1)
            }
        }
        self.write_manifest_row(snapshot, image_ref, &key, &outcome);
    }

    fn download_image(
        &self,
        snapshot: &Snapshot,
        image_ref: &ImageRef,
        key: &NormalizedKey,
    ) -> ImageOutcome {
        let Some(target) = self.lock_ledger().target_path(key) else {
            let err = HarvestError::UnresolvableFilename(image_ref.clone());
            self.image_failures.append(&format!("filename parse failed: {err}"));
            self.emit(
                "warn",
                "image_filename_unresolvable",
                serde_json::json!({ "image_ref": image_ref, "key": key.as_str() }),
            );
            return ImageOutcome::status_only(ImageStatus::UnresolvableFilename);
        };

        let entry = self.lock_ledger().claim(key);
        match entry {
            LedgerEntry::Recorded => return ImageOutcome::status_only(ImageStatus::SkippedRecorded),
            LedgerEntry::InFlight => return ImageOutcome::status_only(ImageStatus::SkippedInFlight),
            LedgerEntry::OnDisk => {
                self.record_key(key);
                return ImageOutcome::status_only(ImageStatus::SkippedOnDisk);
            }
            LedgerEntry::Missing => {}
        }

        let primary = rewrite::resolve_fetch_url(image_ref, &self.request.archive_root);
        let (data, fetched_from) = match self.fetch_media(snapshot, &primary) {
            Ok(v) => v,
            Err(err) => {
                self.lock_ledger().release(key);
                self.image_failures
                    .append(&format!("download failed (all paths): {primary} | {err}"));
                self.emit(
                    "warn",
                    "image_failed",
                    serde_json::json!({ "url": primary, "error": err.to_string() }),
                );
                return ImageOutcome::status_only(ImageStatus::Failed);
            }
        };

        if let Err(err) = write_media_file(&target, &data) {
            self.lock_ledger().release(key);
            self.image_failures.append(&format!(
                "file save failed: {primary} -> {} | {err}",
                target.to_string_lossy()
            ));
            self.emit(
                "warn",
                "image_save_failed",
                serde_json::json!({ "url": primary, "path": target.to_string_lossy().to_string(), "error": err.to_string() }),
            );
            return ImageOutcome::status_only(ImageStatus::Failed);
        }
        self.record_key(key);

        let digest = hex::encode(Sha256::digest(&data));
        self.emit(
            "info",
            "image_downloaded",
            serde_json::json!({
                "url": primary,
                "fetched_from": fetched_from.as_str(),
                "path": target.to_string_lossy().to_string(),
                "bytes": data.len(),
            }),
        );
        ImageOutcome {
            status: ImageStatus::Downloaded,
            fetched_from: Some(fetched_from),
            saved_path: Some(target),
            bytes: Some(data.len()),
            sha256: Some(digest),
        }
    }

    fn fetch_media(&self, snapshot: &Snapshot, primary: &str) -> Result<(Vec<u8>, FetchedFrom)> {
        let primary_err = match self.fetch_non_empty(primary) {
            Ok(data) => return Ok((data, FetchedFrom::Primary)),
            Err(err) => err,
        };
        self.emit(
            "warn",
            "image_primary_failed",
            serde_json::json!({ "url": primary, "error": primary_err.to_string() }),
        );

        let Some(raw_url) = self.raw_content_url(snapshot, primary) else {
            return Err(primary_err);
        };
        self.emit(
            "info",
            "image_retry_raw_content",
            serde_json::json!({ "url": raw_url }),
        );
        let data = self
            .fetch_non_empty(&raw_url)
            .map_err(|err| HarvestError::Transport {
                url: raw_url.clone(),
                detail: format!("primary: {primary_err}; raw content: {err}"),
            })?;
        Ok((data, FetchedFrom::RawContent))
    }

    fn fetch_non_empty(&self, url: &str) -> Result<Vec<u8>> {
        let data = self.fetcher.fetch(url, FetchKind::Media)?;
        if data.is_empty() {
            return Err(HarvestError::Transport {
                url: url.to_string(),
                detail: "empty body".to_string(),
            });
        }
        Ok(data)
    }

    /// Archive URLs are rewritten in place. Direct CDN URLs are first placed under
    /// the snapshot's own capture time, since the CDN copy may be gone.
    fn raw_content_url(&self, snapshot: &Snapshot, primary: &str) -> Option<String> {
        if let Some(url) = rewrite::to_raw_content_url(primary) {
            return Some(url);
        }
        if rewrite::is_archive_url(primary)
            || !(primary.starts_with("http://") || primary.starts_with("https://"))
        {
            return None;
        }
        let archived =
            rewrite::wrap_in_archive(primary, &self.request.archive_root, &snapshot.timestamp);
        rewrite::to_raw_content_url(&archived)
    }

    fn record_key(&self, key: &NormalizedKey) {
        let result = self.lock_ledger().record(key);
        if let Err(err) = result {
            eprintln!("!!! cannot append ledger record {key}: {err}");
            self.emit(
                "error",
                "ledger_append_failed",
                serde_json::json!({ "key": key.as_str(), "error": err.to_string() }),
            );
        }
    }

    fn write_manifest_row(
        &self,
        snapshot: &Snapshot,
        image_ref: &ImageRef,
        key: &NormalizedKey,
        outcome: &ImageOutcome,
    ) {
        let Some(manifest) = &self.manifest else {
            return;
        };
        let row = ManifestRow {
            snapshot_timestamp: &snapshot.timestamp,
            image_ref,
            key: key.as_str(),
            status: outcome.status.as_str(),
            fetched_from: outcome.fetched_from.map(FetchedFrom::as_str).unwrap_or(""),
            saved_path: outcome
                .saved_path
                .as_ref()
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default(),
            bytes: outcome.bytes,
            sha256: outcome.sha256.as_deref(),
        };
        let mut writer = manifest.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = writer.serialize(&row) {
            eprintln!("!!! cannot write manifest row: {err}");
        }
    }

    fn flush_manifest(&self) {
        let Some(manifest) = &self.manifest else {
            return;
        };
        let mut writer = manifest.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = writer.flush() {
            eprintln!("!!! cannot flush manifest: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_writes_leave_no_partial_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("NASA_A.jpg");
        write_media_file(&target, b"jpeg-bytes").expect("write");
        assert_eq!(std::fs::read(&target).expect("read"), b"jpeg-bytes");
        assert!(!dir.path().join("NASA_A.jpg.part").exists());
    }

    #[test]
    fn status_labels_are_stable() {
        assert_eq!(ImageStatus::Downloaded.as_str(), "downloaded");
        assert_eq!(ImageStatus::SkippedOnDisk.as_str(), "skipped_on_disk");
        assert_eq!(
            ImageStatus::UnresolvableFilename.as_str(),
            "unresolvable_filename"
        );
    }
}
