use super::{now_local, StreamState};
use crate::buffer::{EntryId, PendingWrite, Slot};
use crate::config::Config;
use crate::cycle::resolve_row;
use crate::gap_scan::{self, GapScanSettings, Projection};
use crate::lock_probe::LockProbe;
use crate::merge::{MergeEngine, MergeReport};
use crate::scheduler::Trigger;
use crate::source::{fetch_with_retry, hourly_values, shift_values, SeriesSource};
use crate::workbook::WorkbookStore;
use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Samples the series into the hourly or shift log: collect the slot that
/// just closed, backfill gaps in its cycle, then merge.
pub struct CollectorService<S, P> {
    engine: MergeEngine<S, P>,
    source: Arc<dyn SeriesSource>,
    trigger: Trigger,
    project: Projection,
    retry_seconds: u32,
    gap_scan: GapScanSettings,
    merge_interval: Duration,
    state: StreamState,
}

impl<S, P> CollectorService<S, P>
where
    S: WorkbookStore + 'static,
    P: LockProbe + 'static,
{
    pub fn hourly(config: &Config, engine: MergeEngine<S, P>, source: Arc<dyn SeriesSource>) -> Self {
        Self::new(
            config,
            engine,
            source,
            Trigger::HourlyAt {
                minute: config.collect_minute,
            },
            hourly_values,
        )
    }

    pub fn shift(config: &Config, engine: MergeEngine<S, P>, source: Arc<dyn SeriesSource>) -> Self {
        Self::new(
            config,
            engine,
            source,
            Trigger::TwiceDailyAt {
                minute: config.collect_minute,
            },
            shift_values,
        )
    }

    fn new(
        config: &Config,
        engine: MergeEngine<S, P>,
        source: Arc<dyn SeriesSource>,
        trigger: Trigger,
        project: Projection,
    ) -> Self {
        Self {
            engine,
            source,
            trigger,
            project,
            retry_seconds: config.fetch_retry_seconds,
            gap_scan: GapScanSettings {
                retry_seconds: config.fetch_retry_seconds,
                max_fetches: config.gap_scan_max_fetches,
            },
            merge_interval: config.merge_interval,
            state: StreamState::default(),
        }
    }

    /// Spawns the stream's task. It finishes its current tick and exits once
    /// `cancel` fires.
    pub fn start(mut self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let log = self.engine.layout().kind;
            tracing::info!(log = log.as_str(), trigger = ?self.trigger, "collector started");

            let result = self.run_once(now_local()).await;
            self.state.record(log, "startup collection", &result);

            let mut merge_ticker = tokio::time::interval(self.merge_interval);
            merge_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                let (fire_at, wait) = self.trigger.delay(now_local(), self.state.last_fire);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {
                        self.state.last_fire = Some(fire_at);
                        let result = self.run_once(fire_at).await;
                        self.state.record(log, "collection", &result);
                    }
                    _ = merge_ticker.tick() => {
                        let result = self.merge().await.map(|_| ());
                        self.state.record(log, "merge", &result);
                    }
                }
            }
            tracing::info!(log = log.as_str(), "stream stopped");
        })
    }

    /// One full tick as if fired at `fired_at`.
    pub async fn run_once(&self, fired_at: NaiveDateTime) -> Result<()> {
        let slot_time = self.trigger.slot_for(fired_at);
        self.collect(slot_time).await?;
        self.backfill(slot_time).await?;
        self.merge().await?;
        Ok(())
    }

    /// Buffers the slot at `slot_time`. A sample that never shows up is still
    /// buffered with the log's "missing" value so the row is not left unknown.
    pub async fn collect(&self, slot_time: NaiveDateTime) -> Result<()> {
        let layout = self.engine.layout();
        let (context, row) = resolve_row(slot_time, layout.cadence(), layout.base_row)?;
        let sample = fetch_with_retry(&*self.source, slot_time, self.retry_seconds)
            .await
            .with_context(|| format!("fetching {slot_time}"))?;
        if sample.is_none() {
            tracing::warn!(log = layout.kind.as_str(), %slot_time, "no sample within retry window");
        }

        let buffer = self.engine.buffer();
        let entry = PendingWrite {
            id: EntryId::Sequence(buffer.next_sequence()?),
            slot: Slot {
                file_path: layout.file_path(context.file_year),
                sheet_index: context.sheet_index,
                target_row: row,
            },
            values: (self.project)(sample.as_ref()),
            target_year: context.file_year,
            timestamp: slot_time,
        };
        buffer.upsert(entry)?;
        tracing::info!(
            log = layout.kind.as_str(),
            %slot_time,
            sheet = context.sheet_index,
            row,
            "slot buffered"
        );
        Ok(())
    }

    async fn backfill(&self, now: NaiveDateTime) -> Result<()> {
        let layout = self.engine.layout();
        let (context, _) = resolve_row(now, layout.cadence(), layout.base_row)?;
        gap_scan::reconcile(&self.engine, &*self.source, &context, now, self.gap_scan, self.project).await?;
        Ok(())
    }

    pub async fn merge(&self) -> Result<MergeReport> {
        self.engine.merge().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::DurableBuffer;
    use crate::layout::{LogKind, LogLayout};
    use crate::test_support::{at, sample, FakeLockProbe, MemoryBook, MemorySeries, MemoryWorkbookStore};
    use crate::workbook::CellValue;
    use std::path::Path;
    use tempfile::TempDir;

    const TEMPLATE: &str = "/templates/t.xlsx";

    fn config(dir: &TempDir) -> Config {
        Config {
            database_url: "mysql://localhost/test".to_string(),
            db_pool_size: 1,
            series_table: "pulangi".to_string(),
            output_dir: "/logs".into(),
            buffer_dir: dir.path().to_path_buf(),
            plant_title: "PLANT".to_string(),
            hourly: crate::config::StreamFiles {
                file_prefix: "Hourly_".to_string(),
                template: TEMPLATE.into(),
            },
            shift: crate::config::StreamFiles {
                file_prefix: "Shift_".to_string(),
                template: TEMPLATE.into(),
            },
            outage: crate::config::StreamFiles {
                file_prefix: "Outage_".to_string(),
                template: TEMPLATE.into(),
            },
            merge_interval: Duration::from_secs(120),
            collect_minute: 1,
            fetch_retry_seconds: 10,
            gap_scan_max_fetches: 200,
            noise_threshold_hours: 0.15,
            enable_hourly: true,
            enable_shift: true,
            enable_outage: true,
        }
    }

    fn collector(
        kind: LogKind,
        dir: &TempDir,
        series: Arc<MemorySeries>,
        store: &MemoryWorkbookStore,
        probe: &FakeLockProbe,
    ) -> CollectorService<MemoryWorkbookStore, FakeLockProbe> {
        let config = config(dir);
        let layout: LogLayout = config.layout(kind);
        let engine = MergeEngine::new(
            layout,
            DurableBuffer::new(config.buffer_path(kind)),
            store.clone(),
            probe.clone(),
        );
        match kind {
            LogKind::Shift => CollectorService::shift(&config, engine, series),
            _ => CollectorService::hourly(&config, engine, series),
        }
    }

    #[tokio::test]
    async fn hourly_tick_lands_sample_in_its_row() {
        let dir = TempDir::new().unwrap();
        let store = MemoryWorkbookStore::default();
        store.add_template(TEMPLATE, MemoryBook::with_sheets(12));
        let probe = FakeLockProbe::default();
        let mut reading = sample(at(2025, 12, 26, 3, 0, 2));
        reading.units[0].mw = Some(80.123);
        let series = Arc::new(MemorySeries::new(vec![reading]));

        let service = collector(LogKind::Hourly, &dir, series, &store, &probe);
        service.run_once(at(2025, 12, 26, 3, 1, 0)).await.unwrap();

        let book = store.file(Path::new("/logs/Hourly_2026.xlsx")).unwrap();
        // 03:00 on the cycle's first day is row 4 + 3
        assert_eq!(book.value(0, 7, 3), Some(CellValue::Number(80.12)));
        assert!(service.engine.buffer().load().is_empty());
    }

    #[tokio::test]
    async fn locked_log_keeps_samples_buffered_until_released() {
        let dir = TempDir::new().unwrap();
        let store = MemoryWorkbookStore::default();
        let path = Path::new("/logs/Hourly_2026.xlsx");
        store.put_file(path, MemoryBook::with_sheets(12));
        let probe = FakeLockProbe::default();
        probe.lock(path);
        let series = Arc::new(MemorySeries::new(vec![sample(at(2025, 12, 26, 0, 0, 0))]));

        let service = collector(LogKind::Hourly, &dir, series, &store, &probe);
        service.run_once(at(2025, 12, 26, 0, 1, 0)).await.unwrap();
        assert_eq!(service.engine.buffer().load().len(), 1);

        probe.unlock(path);
        let report = service.merge().await.unwrap();
        assert_eq!(report.committed.len(), 1);
        assert!(service.engine.buffer().load().is_empty());
    }

    #[tokio::test]
    async fn shift_tick_writes_zeros_when_sample_missing() {
        let dir = TempDir::new().unwrap();
        let store = MemoryWorkbookStore::default();
        store.add_template(TEMPLATE, MemoryBook::with_sheets(12));
        let probe = FakeLockProbe::default();
        let series = Arc::new(MemorySeries::new(vec![]));

        let service = collector(LogKind::Shift, &dir, series, &store, &probe);
        service.run_once(at(2025, 12, 27, 0, 1, 0)).await.unwrap();

        let book = store.file(Path::new("/logs/Shift_2026.xlsx")).unwrap();
        // Dec 26 12:00 is row 5, Dec 27 00:00 is row 6
        assert_eq!(book.value(0, 6, 3), Some(CellValue::Number(0.0)));
        assert_eq!(book.value(0, 6, 7), Some(CellValue::Number(0.0)));
    }

    #[tokio::test]
    async fn unavailable_source_aborts_the_tick_without_buffering() {
        let dir = TempDir::new().unwrap();
        let store = MemoryWorkbookStore::default();
        let probe = FakeLockProbe::default();
        let series = Arc::new(MemorySeries::new(vec![]));
        series.set_unavailable(true);

        let service = collector(LogKind::Hourly, &dir, series, &store, &probe);
        assert!(service.run_once(at(2025, 12, 26, 5, 1, 0)).await.is_err());
        assert!(service.engine.buffer().load().is_empty());
    }

    #[tokio::test]
    async fn started_stream_exits_after_cancel() {
        let dir = TempDir::new().unwrap();
        let store = MemoryWorkbookStore::default();
        store.add_template(TEMPLATE, MemoryBook::with_sheets(12));
        let probe = FakeLockProbe::default();
        let series = Arc::new(MemorySeries::new(vec![]));

        let cancel = CancellationToken::new();
        let handle = collector(LogKind::Hourly, &dir, series, &store, &probe).start(cancel.clone());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("stream should stop once cancelled")
            .unwrap();
    }
}
