pub mod collector;
pub mod outage_log;

use crate::config::Config;
use crate::layout::LogKind;
use crate::lock_probe::OsLockProbe;
use crate::merge::MergeEngine;
use crate::source::SeriesSource;
use crate::workbook::XlsxStore;
use anyhow::Result;
use chrono::{Local, NaiveDateTime};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use collector::CollectorService;
pub use outage_log::OutageLogService;

/// Plant-local wall clock. Series rows and log rows are both local time.
pub fn now_local() -> NaiveDateTime {
    Local::now().naive_local()
}

/// Mutable bookkeeping owned by one stream's task.
#[derive(Debug, Default, Clone)]
pub struct StreamState {
    pub last_fire: Option<NaiveDateTime>,
    pub consecutive_failures: u32,
}

impl StreamState {
    pub fn record(&mut self, log: LogKind, what: &str, result: &Result<()>) {
        match result {
            Ok(()) => self.consecutive_failures = 0,
            Err(err) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                tracing::warn!(
                    log = log.as_str(),
                    failures = self.consecutive_failures,
                    "{what} failed: {err:#}"
                );
            }
        }
    }
}

fn merge_engine(config: &Config, kind: LogKind) -> MergeEngine<XlsxStore, OsLockProbe> {
    MergeEngine::new(
        config.layout(kind),
        crate::buffer::DurableBuffer::new(config.buffer_path(kind)),
        XlsxStore,
        OsLockProbe,
    )
}

pub fn hourly(config: &Config, source: Arc<dyn SeriesSource>) -> CollectorService<XlsxStore, OsLockProbe> {
    CollectorService::hourly(config, merge_engine(config, LogKind::Hourly), source)
}

pub fn shift(config: &Config, source: Arc<dyn SeriesSource>) -> CollectorService<XlsxStore, OsLockProbe> {
    CollectorService::shift(config, merge_engine(config, LogKind::Shift), source)
}

pub fn outage(config: &Config, source: Arc<dyn SeriesSource>) -> OutageLogService<XlsxStore, OsLockProbe> {
    OutageLogService::new(config, merge_engine(config, LogKind::Outage), source)
}

/// Starts every enabled stream on its own task and returns their handles.
pub fn start_all(
    config: &Config,
    source: Arc<dyn SeriesSource>,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    if config.enable_hourly {
        handles.push(hourly(config, source.clone()).start(cancel.clone()));
    }
    if config.enable_shift {
        handles.push(shift(config, source.clone()).start(cancel.clone()));
    }
    if config.enable_outage {
        handles.push(outage(config, source).start(cancel));
    }
    handles
}
