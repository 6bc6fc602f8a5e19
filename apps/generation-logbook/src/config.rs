use crate::layout::{LogKind, LogLayout};
use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_HOURLY_PREFIX: &str = "Pulangi IV HEP - Operational Highlights - RAW_";
const DEFAULT_HOURLY_TEMPLATE: &str = "Pulangi IV HEP - Operational Highlights - RAW Template.xlsx";
const DEFAULT_SHIFT_PREFIX: &str = "Pulangi IV HEP - Generation Data - RAW_";
const DEFAULT_SHIFT_TEMPLATE: &str = "Pulangi IV HEP - Generation Data - RAW Template.xlsx";
const DEFAULT_OUTAGE_PREFIX: &str = "Pulangi IV HEP - Outage Report_";
const DEFAULT_OUTAGE_TEMPLATE: &str = "Pulangi IV HEP - Outage Report Template.xlsx";

#[derive(Debug, Clone)]
pub struct StreamFiles {
    pub file_prefix: String,
    pub template: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub db_pool_size: u32,
    pub series_table: String,

    pub output_dir: PathBuf,
    pub buffer_dir: PathBuf,
    pub plant_title: String,
    pub hourly: StreamFiles,
    pub shift: StreamFiles,
    pub outage: StreamFiles,

    pub merge_interval: Duration,
    pub collect_minute: u32,
    pub fetch_retry_seconds: u32,
    pub gap_scan_max_fetches: usize,
    pub noise_threshold_hours: f64,

    pub enable_hourly: bool,
    pub enable_shift: bool,
    pub enable_outage: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let database_url = env_optional("LOGBOOK_DATABASE_URL")
            .or_else(|| env_optional("DATABASE_URL"))
            .ok_or_else(|| anyhow!("missing env var LOGBOOK_DATABASE_URL (or DATABASE_URL)"))?;
        let db_pool_size = env_u64("LOGBOOK_DB_POOL_SIZE", Some(5))?.clamp(1, 64) as u32;

        let series_table = env_string("LOGBOOK_SERIES_TABLE", Some("pulangi".to_string()))?;
        validate_identifier(&series_table).context("invalid LOGBOOK_SERIES_TABLE")?;

        let output_dir = PathBuf::from(env_string("LOGBOOK_OUTPUT_DIR", Some("rawdata".to_string()))?);
        let template_dir = PathBuf::from(env_string("LOGBOOK_TEMPLATE_DIR", Some("templates".to_string()))?);
        let buffer_dir = env_optional("LOGBOOK_BUFFER_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| output_dir.clone());
        let plant_title = env_string("LOGBOOK_PLANT_TITLE", Some("PULANGI IV HE PLANT".to_string()))?;

        let stream = |name: &str, prefix: &str, template: &str| -> Result<StreamFiles> {
            let file_prefix = env_string(&format!("LOGBOOK_{name}_FILE_PREFIX"), Some(prefix.to_string()))?;
            let template = env_string(&format!("LOGBOOK_{name}_TEMPLATE"), Some(template.to_string()))?;
            Ok(StreamFiles {
                file_prefix,
                template: template_dir.join(template),
            })
        };
        let hourly = stream("HOURLY", DEFAULT_HOURLY_PREFIX, DEFAULT_HOURLY_TEMPLATE)?;
        let shift = stream("SHIFT", DEFAULT_SHIFT_PREFIX, DEFAULT_SHIFT_TEMPLATE)?;
        let outage = stream("OUTAGE", DEFAULT_OUTAGE_PREFIX, DEFAULT_OUTAGE_TEMPLATE)?;

        let merge_interval = Duration::from_secs(env_u64("LOGBOOK_MERGE_INTERVAL_SECONDS", Some(120))?.max(10));
        let collect_minute = env_u64("LOGBOOK_COLLECT_MINUTE", Some(1))?;
        if collect_minute > 59 {
            bail!("LOGBOOK_COLLECT_MINUTE must be 0..=59");
        }
        let fetch_retry_seconds = env_u64("LOGBOOK_FETCH_RETRY_SECONDS", Some(10))?.clamp(1, 3600) as u32;
        let gap_scan_max_fetches = env_u64("LOGBOOK_GAP_SCAN_MAX_FETCHES", Some(200))? as usize;
        let noise_threshold_hours = env_f64("LOGBOOK_NOISE_THRESHOLD_HOURS", 0.15)?;

        Ok(Self {
            database_url,
            db_pool_size,
            series_table,
            output_dir,
            buffer_dir,
            plant_title,
            hourly,
            shift,
            outage,
            merge_interval,
            collect_minute: collect_minute as u32,
            fetch_retry_seconds,
            gap_scan_max_fetches,
            noise_threshold_hours,
            enable_hourly: env_bool("LOGBOOK_ENABLE_HOURLY", true)?,
            enable_shift: env_bool("LOGBOOK_ENABLE_SHIFT", true)?,
            enable_outage: env_bool("LOGBOOK_ENABLE_OUTAGE", true)?,
        })
    }

    pub fn layout(&self, kind: LogKind) -> LogLayout {
        let files = match kind {
            LogKind::Hourly => &self.hourly,
            LogKind::Shift => &self.shift,
            LogKind::Outage => &self.outage,
        };
        LogLayout::new(
            kind,
            self.output_dir.clone(),
            files.file_prefix.clone(),
            files.template.clone(),
            self.plant_title.clone(),
        )
    }

    pub fn buffer_path(&self, kind: LogKind) -> PathBuf {
        self.buffer_dir.join(kind.buffer_file_name())
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.buffer_dir.join("outage_ledger.json")
    }
}

fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        bail!("{name:?} is not a plain table name");
    }
    Ok(())
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_f64(key: &str, default: f64) -> Result<f64> {
    match env_optional(key) {
        Some(value) => value.parse::<f64>().with_context(|| format!("invalid {key}")),
        None => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match env_optional(key) {
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => bail!("invalid {key}: expected a boolean"),
        },
        None => Ok(default),
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
