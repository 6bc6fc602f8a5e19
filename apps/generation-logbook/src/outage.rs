//! Outage detection over the plant series.
//!
//! A unit is *down* while its measured output is below 1 MW and its
//! reference signal (grid frequency by default) is non-zero; a zero
//! reference means the unit is out of service rather than tripped. An event
//! closes on the first sample that is not down **and** shows non-zero
//! output, so a lone zero reading with a dead reference never closes it.

use crate::buffer::{EntryId, PendingWrite, Slot, SlotKey};
use crate::cycle::CycleContext;
use crate::layout::LogLayout;
use crate::source::PlantSample;
use crate::workbook::CellValue;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

pub const DEFAULT_NOISE_THRESHOLD_HOURS: f64 = 0.15;
const DOWN_BELOW_MW: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutageUnit {
    pub number: u32,
    /// Series column holding the unit's output.
    pub measured: String,
    /// Series column that must be non-zero for low output to count as down.
    pub reference: String,
}

pub fn default_units() -> Vec<OutageUnit> {
    (1..=3)
        .map(|number| OutageUnit {
            number,
            measured: format!("mw{number}"),
            reference: format!("freq{number}"),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutageEvent {
    pub unit: u32,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    /// Still open when the queried range ended.
    pub ongoing: bool,
    /// Already down in the seed sample; `start` is the range start, not the
    /// moment the unit went down.
    pub carried_in: bool,
    /// Closed by the end of the range rather than by a recovery sample.
    pub cut_off: bool,
    pub duration_hours: f64,
}

impl OutageEvent {
    /// True when `start` is the moment the unit actually went down.
    pub fn observed_down(&self) -> bool {
        !self.carried_in
    }

    /// True when `end` is the moment the unit actually came back.
    pub fn observed_recovery(&self) -> bool {
        !self.ongoing && !self.cut_off
    }
}

#[derive(Debug, Clone, Copy)]
struct OpenEvent {
    start: NaiveDateTime,
    carried_in: bool,
}

#[derive(Debug, Clone)]
pub struct OutageDetector {
    units: Vec<OutageUnit>,
    noise_threshold_hours: f64,
}

impl OutageDetector {
    pub fn new(units: Vec<OutageUnit>, noise_threshold_hours: f64) -> Self {
        Self {
            units,
            noise_threshold_hours,
        }
    }

    fn is_down(unit: &OutageUnit, sample: &PlantSample) -> bool {
        let measured = sample.field(&unit.measured).unwrap_or(0.0);
        let reference = sample.field(&unit.reference).unwrap_or(0.0);
        measured < DOWN_BELOW_MW && reference != 0.0
    }

    fn recovered(unit: &OutageUnit, sample: &PlantSample) -> bool {
        let measured = sample.field(&unit.measured).unwrap_or(0.0);
        !Self::is_down(unit, sample) && measured != 0.0
    }

    /// Scans `samples` over `[range_start, range_end)` and returns the events
    /// that exceed the noise threshold, sorted by `(unit, start)`.
    ///
    /// `seed` is the last sample strictly before `range_start`; a unit that is
    /// down there opens its event at `range_start`. Events still open at
    /// `range_end` are closed there with `ongoing = !force_close`.
    pub fn detect(
        &self,
        seed: Option<&PlantSample>,
        samples: &[PlantSample],
        range_start: NaiveDateTime,
        range_end: NaiveDateTime,
        force_close: bool,
    ) -> Vec<OutageEvent> {
        let mut open: Vec<Option<OpenEvent>> = self
            .units
            .iter()
            .map(|unit| {
                seed.filter(|s| s.timestamp < range_start && Self::is_down(unit, s))
                    .map(|_| OpenEvent {
                        start: range_start,
                        carried_in: true,
                    })
            })
            .collect();
        let mut events = Vec::new();

        for sample in samples
            .iter()
            .filter(|s| s.timestamp >= range_start && s.timestamp < range_end)
        {
            for (unit, started) in self.units.iter().zip(open.iter_mut()) {
                match *started {
                    None if Self::is_down(unit, sample) => {
                        *started = Some(OpenEvent {
                            start: sample.timestamp,
                            carried_in: false,
                        })
                    }
                    Some(event) if Self::recovered(unit, sample) => {
                        self.emit(&mut events, unit, event, sample.timestamp, false, false);
                        *started = None;
                    }
                    _ => {}
                }
            }
        }

        for (unit, started) in self.units.iter().zip(open) {
            if let Some(event) = started {
                self.emit(&mut events, unit, event, range_end, !force_close, true);
            }
        }

        events.sort_by(|a, b| a.unit.cmp(&b.unit).then(a.start.cmp(&b.start)));
        events
    }

    fn emit(
        &self,
        events: &mut Vec<OutageEvent>,
        unit: &OutageUnit,
        open: OpenEvent,
        end: NaiveDateTime,
        ongoing: bool,
        cut_off: bool,
    ) {
        let start = open.start;
        let duration_hours = (end - start).num_seconds() as f64 / 3600.0;
        if duration_hours > self.noise_threshold_hours {
            events.push(OutageEvent {
                unit: unit.number,
                start,
                end,
                ongoing,
                carried_in: open.carried_in,
                cut_off,
                duration_hours,
            });
        } else {
            tracing::debug!(unit = unit.number, %start, %end, "outage below noise threshold");
        }
    }
}

fn date_text(ts: NaiveDateTime) -> CellValue {
    CellValue::Text(ts.format("%Y-%m-%d").to_string())
}

fn time_text(ts: NaiveDateTime) -> CellValue {
    CellValue::Text(ts.format("%I:%M %p").to_string())
}

/// Lays events out as consecutive row pairs of the cycle's sheet.
pub fn pending_writes(events: &[OutageEvent], layout: &LogLayout, context: &CycleContext) -> Vec<PendingWrite> {
    let file_path = layout.file_path(context.file_year);
    events
        .iter()
        .zip(0u32..)
        .map(|(event, index)| {
            let row = layout.row_at(index);
            PendingWrite {
                id: EntryId::Slot(SlotKey {
                    file_year: context.file_year,
                    sheet_index: context.sheet_index,
                    row,
                }),
                slot: Slot {
                    file_path: file_path.clone(),
                    sheet_index: context.sheet_index,
                    target_row: row,
                },
                values: vec![
                    CellValue::Number(f64::from(event.unit)),
                    date_text(event.start),
                    time_text(event.start),
                    date_text(event.end),
                    time_text(event.end),
                ],
                target_year: context.file_year,
                timestamp: event.start,
            }
        })
        .collect()
}
