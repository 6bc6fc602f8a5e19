use super::{now_local, StreamState};
use crate::config::Config;
use crate::cycle::{resolve, CycleContext};
use crate::ledger::EventLedger;
use crate::lock_probe::LockProbe;
use crate::merge::{MergeEngine, MergeReport};
use crate::outage::{default_units, pending_writes, OutageDetector, OutageEvent};
use crate::scheduler::Trigger;
use crate::source::SeriesSource;
use crate::workbook::WorkbookStore;
use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub struct OutageLogService<S, P> {
    engine: MergeEngine<S, P>,
    source: Arc<dyn SeriesSource>,
    detector: OutageDetector,
    ledger: EventLedger,
    trigger: Trigger,
    merge_interval: Duration,
    state: StreamState,
}

impl<S, P> OutageLogService<S, P>
where
    S: WorkbookStore + 'static,
    P: LockProbe + 'static,
{
    pub fn new(config: &Config, engine: MergeEngine<S, P>, source: Arc<dyn SeriesSource>) -> Self {
        Self {
            engine,
            source,
            detector: OutageDetector::new(default_units(), config.noise_threshold_hours),
            ledger: EventLedger::new(config.ledger_path()),
            trigger: Trigger::TwiceDailyAt {
                minute: config.collect_minute,
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
            tracing::info!(log = log.as_str(), trigger = ?self.trigger, "outage log started");

            let result = self.run_once(now_local()).await;
            self.state.record(log, "startup detection", &result);

            let mut merge_ticker = tokio::time::interval(self.merge_interval);
            merge_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                let (fire_at, wait) = self.trigger.delay(now_local(), self.state.last_fire);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {
                        self.state.last_fire = Some(fire_at);
                        let result = self.run_once(fire_at).await;
                        self.state.record(log, "detection", &result);
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

    /// Re-derives the outage rows of the previous cycle (closed) and the live
    /// cycle up to `now`, then merges.
    pub async fn run_once(&self, now: NaiveDateTime) -> Result<()> {
        let current = resolve(now, self.engine.layout().cadence())?;
        let previous = current.previous()?;

        self.detect_window(&previous, previous.cycle_end, true, now).await?;
        self.detect_window(&current, now, false, now).await?;
        self.merge().await?;
        Ok(())
    }

    async fn detect_window(
        &self,
        context: &CycleContext,
        range_end: NaiveDateTime,
        force_close: bool,
        now: NaiveDateTime,
    ) -> Result<Vec<OutageEvent>> {
        let range_start = context.cycle_start;
        let seed = self
            .source
            .fetch_last_before(range_start)
            .await
            .context("fetching outage seed sample")?;
        let samples = self
            .source
            .fetch_range(range_start, range_end)
            .await
            .with_context(|| format!("fetching samples {range_start} .. {range_end}"))?;

        let events = self
            .detector
            .detect(seed.as_ref(), &samples, range_start, range_end, force_close);
        tracing::debug!(
            sheet = context.sheet_index,
            file_year = context.file_year,
            samples = samples.len(),
            events = events.len(),
            "outage window scanned"
        );

        self.engine
            .buffer()
            .upsert_many(pending_writes(&events, self.engine.layout(), context))?;
        self.ledger.record(&events, now.date())?;
        Ok(events)
    }

    pub async fn merge(&self) -> Result<MergeReport> {
        self.engine.merge().await
    }
}
