use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use wayback_gallery::config::{self, HarvestOverrides};
use wayback_gallery::dispatch::ExtractorChain;
use wayback_gallery::fetch::HttpFetcher;
use wayback_gallery::harvest::{self, HarvestSummary};
use wayback_gallery::journal::EventLog;
use wayback_gallery::paths::GalleryPaths;
use wayback_gallery::{HarvestError, Result};

const BASE_DIR_ENV_VAR: &str = "WAYBACK_GALLERY_BASE_DIR";
const DEFAULT_BASE_DIR: &str = "twitter_images";
const INTERRUPT_EXIT_CODE: i32 = 130;

fn main() -> std::result::Result<(), String> {
    run().map_err(|e| e.to_string())
}

fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "-h" || a == "--help") {
        print_help();
        return Ok(());
    }

    let mut base_dir: Option<PathBuf> = None;
    let mut overrides = HarvestOverrides::default();
    let mut init_config = false;
    let mut profiles: Vec<String> = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--base-dir" => {
                base_dir = Some(PathBuf::from(flag_value(&args, &mut i, "--base-dir")?));
            }
            "--from" => overrides.from = Some(flag_value(&args, &mut i, "--from")?),
            "--to" => overrides.to = Some(flag_value(&args, &mut i, "--to")?),
            "--workers" => {
                let v = flag_value(&args, &mut i, "--workers")?;
                overrides.workers = Some(v.parse().map_err(|_| {
                    HarvestError::InvalidRequest(format!("--workers expects a number, got {v:?}"))
                })?);
            }
            "--retries" => {
                let v = flag_value(&args, &mut i, "--retries")?;
                let retries: u32 = v.parse().map_err(|_| {
                    HarvestError::InvalidRequest(format!("--retries expects a number, got {v:?}"))
                })?;
                overrides.max_attempts = Some(retries.saturating_add(1));
            }
            "--init-config" => init_config = true,
            other if other.starts_with("--") => {
                return Err(HarvestError::InvalidRequest(format!(
                    "unknown arg: {other} (try --help)"
                )));
            }
            profile => profiles.push(profile.to_string()),
        }
        i += 1;
    }

    let base_dir = base_dir.unwrap_or_else(default_base_dir);
    let paths = GalleryPaths::new(base_dir);
    let harvest_config = config::load_harvest_config(&paths)?;

    if init_config {
        config::save_harvest_config(&paths, &harvest_config)?;
        println!(
            "wrote config: {}",
            paths.harvest_config_path().to_string_lossy()
        );
        if profiles.is_empty() {
            return Ok(());
        }
    }

    if profiles.is_empty() {
        return Err(HarvestError::InvalidRequest(
            "missing profile id (try --help)".to_string(),
        ));
    }

    let requests = profiles
        .iter()
        .map(|p| config::build_harvest_request(&harvest_config, p, overrides.clone()))
        .collect::<Result<Vec<_>>>()?;

    let run_id = uuid::Uuid::new_v4().to_string();
    let fetcher = HttpFetcher::new(harvest_config.http.clone());
    let chain = ExtractorChain::default();

    let canceled = Arc::new(AtomicBool::new(false));
    let flag = canceled.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        if is_repeat_interrupt(&flag) {
            eprintln!("interrupted again, exiting now");
            std::process::exit(INTERRUPT_EXIT_CODE);
        }
        eprintln!("stopping after the current image; press Ctrl+C again to quit now");
    }) {
        eprintln!("!!! cannot install Ctrl-C handler: {err}");
    }

    println!("base dir: {}", paths.base_dir.to_string_lossy());
    println!("run id: {run_id}");
    println!("press Ctrl+C to stop after the current image");

    let mut summaries: Vec<HarvestSummary> = Vec::new();
    let mut failed_profiles: Vec<String> = Vec::new();
    for request in &requests {
        println!();
        println!("=== {} ===", request.profile_id);
        let events = EventLog::new(paths.run_log_path(&run_id), &run_id, &request.profile_id);
        let outcome = harvest::run_profile_harvest(
            request,
            &paths,
            &run_id,
            &fetcher,
            &chain,
            || canceled.load(Ordering::SeqCst),
            |level, event, data| {
                echo_event(level, event, &data);
                events.log_line(level, event, data)
            },
        );
        match outcome {
            Ok(summary) => {
                let stop = summary.canceled;
                summaries.push(summary);
                if stop {
                    println!("canceled; remaining profiles skipped");
                    break;
                }
            }
            Err(err) => {
                eprintln!("!!! {}: {err}", request.profile_id);
                failed_profiles.push(request.profile_id.clone());
            }
        }
    }

    println!();
    for summary in &summaries {
        println!(
            "{}: {} new image(s), {} skipped, {} failed across {} snapshot(s) -> {}",
            summary.profile_id,
            summary.images_downloaded,
            summary.images_skipped,
            summary.images_failed,
            summary.snapshots_visited,
            summary.output_dir
        );
    }

    if !failed_profiles.is_empty() {
        return Err(HarvestError::InvalidRequest(format!(
            "snapshot index unavailable for: {}",
            failed_profiles.join(", ")
        )));
    }
    Ok(())
}

/// Raises the cancel flag and reports whether it was already raised.
fn is_repeat_interrupt(canceled: &AtomicBool) -> bool {
    canceled.swap(true, Ordering::SeqCst)
}

fn flag_value(args: &[String], i: &mut usize, flag: &str) -> Result<String> {
    *i += 1;
    args.get(*i)
        .cloned()
        .ok_or_else(|| HarvestError::InvalidRequest(format!("{flag} requires a value")))
}

fn default_base_dir() -> PathBuf {
    match std::env::var(BASE_DIR_ENV_VAR) {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => PathBuf::from(DEFAULT_BASE_DIR),
    }
}

/// Console echo of the events a person watching the run cares about.
fn echo_event(level: &str, event: &str, data: &serde_json::Value) {
    let field = |name: &str| {
        data.get(name)
            .map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default()
    };
    match event {
        "snapshot_index_loaded" => println!("found {} snapshot(s)", field("snapshots")),
        "snapshot_begin" => println!(
            "[{}/{}] {}",
            field("index"),
            field("total"),
            field("url")
        ),
        "page_extracted" => println!(
            "  {} image(s) via {}",
            field("images"),
            field("strategy")
        ),
        "page_without_profile_content" => println!("  no profile content"),
        "image_downloaded" => println!("  saved {}", field("path")),
        "image_retry_raw_content" => println!("  retrying raw capture {}", field("url")),
        _ if level == "warn" || level == "error" => {
            eprintln!("  !! {event}: {}", field("error"))
        }
        _ => {}
    }
}

fn print_help() {
    println!(
        "wayback_gallery\n\n\
Downloads the images posted by one or more profiles from their archived captures.\n\n\
Usage:\n\
  wayback_gallery [options] <profile_id> [<profile_id> ...]\n\n\
Options:\n\
  --base-dir <path>   Output root (default: ${BASE_DIR_ENV_VAR} or ./{DEFAULT_BASE_DIR})\n\
  --from <stamp>      Earliest capture, 1-14 digits of YYYYMMDDhhmmss\n\
  --to <stamp>        Latest capture, 1-14 digits of YYYYMMDDhhmmss\n\
  --workers <n>       Snapshots processed concurrently (1-16)\n\
  --retries <n>       Extra attempts per request on network failure\n\
  --init-config       Write the effective config to <base-dir>/config/harvest.json\n\
  -h, --help          Show this help\n"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_interrupt_is_reported_as_repeat() {
        let canceled = AtomicBool::new(false);
        assert!(!is_repeat_interrupt(&canceled));
        assert!(canceled.load(Ordering::SeqCst));
        assert!(is_repeat_interrupt(&canceled));
    }
}
