use std::path::PathBuf;

const LEDGER_FILE: &str = "downloaded_urls.log";
const SNAPSHOT_FAILURES_FILE: &str = "snapshot_failures.txt";
const IMAGE_FAILURES_FILE: &str = "image_failures.txt";

#[derive(Debug, Clone)]
pub struct GalleryPaths {
    pub base_dir: PathBuf,
}

impl GalleryPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn config_dir(&self) -> PathBuf {
        self.base_dir.join("config")
    }

    pub fn harvest_config_path(&self) -> PathBuf {
        self.config_dir().join("harvest.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn run_log_path(&self, run_id: &str) -> PathBuf {
        self.logs_dir().join(format!("{run_id}.jsonl"))
    }

    /// Images, ledger, failure logs and manifests for one profile live here.
    pub fn profile_dir(&self, profile_id: &str) -> PathBuf {
        self.base_dir.join(profile_id)
    }

    pub fn ledger_path(&self, profile_id: &str) -> PathBuf {
        self.profile_dir(profile_id).join(LEDGER_FILE)
    }

    pub fn snapshot_failures_path(&self, profile_id: &str) -> PathBuf {
        self.profile_dir(profile_id).join(SNAPSHOT_FAILURES_FILE)
    }

    pub fn image_failures_path(&self, profile_id: &str) -> PathBuf {
        self.profile_dir(profile_id).join(IMAGE_FAILURES_FILE)
    }

    pub fn manifest_path(&self, profile_id: &str, run_id: &str) -> PathBuf {
        self.profile_dir(profile_id)
            .join(format!("manifest_{run_id}.csv"))
    }

    pub fn summary_path(&self, profile_id: &str, run_id: &str) -> PathBuf {
        self.profile_dir(profile_id)
            .join(format!("summary_{run_id}.json"))
    }

    pub fn ensure_dirs(&self, profile_id: &str) -> std::io::Result<()> {
        std::fs::create_dir_all(self.config_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        std::fs::create_dir_all(self.profile_dir(profile_id))?;
        Ok(())
    }
}
