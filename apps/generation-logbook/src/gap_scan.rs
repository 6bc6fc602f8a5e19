use crate::buffer::{EntryId, PendingWrite, Slot, SlotKey};
use crate::cycle::CycleContext;
use crate::lock_probe::LockProbe;
use crate::merge::MergeEngine;
use crate::source::{fetch_with_retry, PlantSample, SeriesSource};
use crate::workbook::{CellValue, Workbook, WorkbookStore};
use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use std::collections::HashSet;

/// Turns a fetched sample (or its absence) into the row's cell values.
pub type Projection = fn(Option<&PlantSample>) -> Vec<CellValue>;

#[derive(Debug, Clone, Copy)]
pub struct GapScanSettings {
    pub retry_seconds: u32,
    /// Upper bound on gaps fetched per scan; the rest wait for the next scan.
    pub max_fetches: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GapScanReport {
    pub skipped: bool,
    pub gaps: usize,
    pub queued: usize,
    pub not_found: usize,
    pub deferred: usize,
}

/// Re-requests every elapsed, still-empty slot of `context` that has nothing
/// queued for it. Missing or locked destinations are skipped silently; the
/// next scan will catch up.
pub async fn reconcile<S, P, Q>(
    engine: &MergeEngine<S, P>,
    source: &Q,
    context: &CycleContext,
    now: NaiveDateTime,
    settings: GapScanSettings,
    project: Projection,
) -> Result<GapScanReport>
where
    S: WorkbookStore,
    P: LockProbe,
    Q: SeriesSource + ?Sized,
{
    let layout = engine.layout();
    let path = layout.file_path(context.file_year);
    let mut report = GapScanReport::default();

    if !engine.store().exists(&path).await || engine.probe().is_open_by_other(&path).await {
        report.skipped = true;
        return Ok(report);
    }
    let book = engine
        .store()
        .open(&path)
        .await
        .with_context(|| format!("gap scan could not open {}", path.display()))?;
    if context.sheet_index >= book.sheet_count() {
        tracing::warn!(path = %path.display(), sheet = context.sheet_index, "gap scan sheet missing");
        report.skipped = true;
        return Ok(report);
    }

    let queued: HashSet<Slot> = engine.buffer().load().into_iter().map(|entry| entry.slot).collect();
    let last_row = if context.contains(now) {
        context.row_for(now, layout.base_row)?
    } else {
        context.last_row(layout.base_row)?
    };

    let mut gaps = Vec::new();
    for row in layout.base_row..=last_row {
        let timestamp = context.slot_timestamp(row, layout.base_row)?;
        if timestamp > now || !book.cell_is_blank(context.sheet_index, row, layout.sentinel_column) {
            continue;
        }
        let slot = Slot {
            file_path: path.clone(),
            sheet_index: context.sheet_index,
            target_row: row,
        };
        if queued.contains(&slot) {
            continue;
        }
        gaps.push((slot, timestamp));
    }
    drop(book);

    report.gaps = gaps.len();
    report.deferred = gaps.len().saturating_sub(settings.max_fetches);
    let mut fills = Vec::new();
    for (slot, timestamp) in gaps.into_iter().take(settings.max_fetches) {
        match fetch_with_retry(source, timestamp, settings.retry_seconds).await? {
            Some(sample) => fills.push(PendingWrite {
                id: EntryId::Slot(SlotKey {
                    file_year: context.file_year,
                    sheet_index: slot.sheet_index,
                    row: slot.target_row,
                }),
                values: project(Some(&sample)),
                slot,
                target_year: context.file_year,
                timestamp,
            }),
            None => {
                tracing::debug!(%timestamp, row = slot.target_row, "gap has no source sample");
                report.not_found += 1;
            }
        }
    }

    report.queued = fills.len();
    engine.buffer().upsert_many(fills)?;
    if report.gaps > 0 {
        tracing::info!(
            log = layout.kind.as_str(),
            gaps = report.gaps,
            queued = report.queued,
            not_found = report.not_found,
            deferred = report.deferred,
            "gap scan finished"
        );
    }
    Ok(report)
}
