//! Billing-cycle addressing.
//!
//! Logs are organised in cycles that run from the 26th of one month to the
//! 26th of the next. Each cycle owns one sheet of a yearly workbook; the
//! sheet is named after the month the cycle *ends* in, so the cycle that
//! starts on Dec 26 lands on sheet 0 of the following year's file.

use crate::error::CycleError;
use chrono::{Datelike, Duration, Months, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

pub const CYCLE_START_DAY: u32 = 26;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    /// One row per hour, cycle anchored at 00:00 on the 26th.
    Hourly,
    /// One row per 12-hour shift, cycle anchored at 12:00 on the 26th.
    Shift,
}

impl Cadence {
    pub fn unit(self) -> Duration {
        match self {
            Cadence::Hourly => Duration::hours(1),
            Cadence::Shift => Duration::hours(12),
        }
    }

    fn anchor_hour(self) -> u32 {
        match self {
            Cadence::Hourly => 0,
            Cadence::Shift => 12,
        }
    }

    fn starts_next_cycle(self, timestamp: NaiveDateTime) -> bool {
        let day = timestamp.day();
        match self {
            Cadence::Hourly => day >= CYCLE_START_DAY,
            Cadence::Shift => {
                day > CYCLE_START_DAY || (day == CYCLE_START_DAY && timestamp.hour() >= 12)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleContext {
    pub sheet_index: usize,
    pub file_year: i32,
    pub cycle_start: NaiveDateTime,
    pub cycle_end: NaiveDateTime,
    pub cadence: Cadence,
}

/// Maps a plant-local timestamp onto the cycle that contains it.
pub fn resolve(timestamp: NaiveDateTime, cadence: Cadence) -> Result<CycleContext, CycleError> {
    let month_first = NaiveDate::from_ymd_opt(timestamp.year(), timestamp.month(), 1)
        .ok_or(CycleError::Calendar(timestamp))?;
    let start_month = if cadence.starts_next_cycle(timestamp) {
        month_first
    } else {
        month_first
            .checked_sub_months(Months::new(1))
            .ok_or(CycleError::Calendar(timestamp))?
    };
    let cycle_start = start_month
        .with_day(CYCLE_START_DAY)
        .and_then(|date| date.and_hms_opt(cadence.anchor_hour(), 0, 0))
        .ok_or(CycleError::Calendar(timestamp))?;

    let context = CycleContext::starting_at(cycle_start, cadence)?;
    if timestamp < context.cycle_start {
        return Err(CycleError::BeforeCycleStart {
            timestamp,
            cycle_start: context.cycle_start,
        });
    }
    Ok(context)
}

/// Resolves a timestamp straight to its cycle and target row.
pub fn resolve_row(
    timestamp: NaiveDateTime,
    cadence: Cadence,
    base_row: u32,
) -> Result<(CycleContext, u32), CycleError> {
    let context = resolve(timestamp, cadence)?;
    let row = context.row_for(timestamp, base_row)?;
    Ok((context, row))
}

impl CycleContext {
    pub fn starting_at(cycle_start: NaiveDateTime, cadence: Cadence) -> Result<Self, CycleError> {
        let cycle_end = cycle_start
            .checked_add_months(Months::new(1))
            .ok_or(CycleError::Calendar(cycle_start))?;
        Ok(Self {
            sheet_index: cycle_end.month0() as usize,
            file_year: cycle_end.year(),
            cycle_start,
            cycle_end,
            cadence,
        })
    }

    pub fn contains(&self, timestamp: NaiveDateTime) -> bool {
        self.cycle_start <= timestamp && timestamp < self.cycle_end
    }

    pub fn row_for(&self, timestamp: NaiveDateTime, base_row: u32) -> Result<u32, CycleError> {
        if timestamp < self.cycle_start {
            return Err(CycleError::BeforeCycleStart {
                timestamp,
                cycle_start: self.cycle_start,
            });
        }
        let elapsed = (timestamp - self.cycle_start).num_seconds();
        let units = elapsed / self.cadence.unit().num_seconds();
        Ok(base_row + units as u32)
    }

    /// Inverse of [`row_for`](Self::row_for): the slot's anchor timestamp.
    pub fn slot_timestamp(&self, row: u32, base_row: u32) -> Result<NaiveDateTime, CycleError> {
        if row < base_row {
            return Err(CycleError::RowBeforeBase { row, base_row });
        }
        let units = i32::try_from(row - base_row).map_err(|_| CycleError::Calendar(self.cycle_start))?;
        Ok(self.cycle_start + self.cadence.unit() * units)
    }

    pub fn last_row(&self, base_row: u32) -> Result<u32, CycleError> {
        self.row_for(self.cycle_end - Duration::seconds(1), base_row)
    }

    pub fn previous(&self) -> Result<Self, CycleError> {
        resolve(self.cycle_start - Duration::seconds(1), self.cadence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    #[test]
    fn hourly_december_26th_rolls_into_next_file_year() {
        let ctx = resolve(at(2025, 12, 26, 0, 0), Cadence::Hourly).unwrap();
        assert_eq!(ctx.sheet_index, 0);
        assert_eq!(ctx.file_year, 2026);
        assert_eq!(ctx.cycle_start, at(2025, 12, 26, 0, 0));
        assert_eq!(ctx.cycle_end, at(2026, 1, 26, 0, 0));

        let ctx = resolve(at(2025, 12, 25, 23, 59), Cadence::Hourly).unwrap();
        assert_eq!(ctx.sheet_index, 11);
        assert_eq!(ctx.file_year, 2025);
        assert_eq!(ctx.cycle_start, at(2025, 11, 26, 0, 0));
    }

    #[test]
    fn shift_boundary_is_noon_on_the_26th() {
        let before = resolve(at(2025, 12, 26, 11, 59), Cadence::Shift).unwrap();
        assert_eq!(before.sheet_index, 11);
        assert_eq!(before.file_year, 2025);
        assert_eq!(before.cycle_start, at(2025, 11, 26, 12, 0));

        let after = resolve(at(2025, 12, 26, 12, 0), Cadence::Shift).unwrap();
        assert_eq!(after.sheet_index, 0);
        assert_eq!(after.file_year, 2026);
        assert_eq!(after.cycle_start, at(2025, 12, 26, 12, 0));
    }

    #[test]
    fn every_timestamp_lands_inside_exactly_its_cycle() {
        for cadence in [Cadence::Hourly, Cadence::Shift] {
            let mut ts = at(2024, 1, 1, 0, 0);
            let end = at(2026, 3, 1, 0, 0);
            let mut previous: Option<CycleContext> = None;
            while ts < end {
                let ctx = resolve(ts, cadence).unwrap();
                assert!(ctx.contains(ts), "{ts} outside {ctx:?}");
                if let Some(prev) = previous {
                    // cycles are either identical or adjacent
                    assert!(prev == ctx || prev.cycle_end == ctx.cycle_start);
                }
                previous = Some(ctx);
                ts += Duration::minutes(37);
            }
        }
    }

    #[test]
    fn resolve_is_pure() {
        let ts = at(2025, 3, 14, 15, 9);
        let a = resolve_row(ts, Cadence::Hourly, 4).unwrap();
        let b = resolve_row(ts, Cadence::Hourly, 4).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rows_count_whole_units_since_cycle_start() {
        let (_, row) = resolve_row(at(2025, 11, 26, 0, 0), Cadence::Hourly, 4).unwrap();
        assert_eq!(row, 4);
        let (_, row) = resolve_row(at(2025, 11, 27, 1, 59), Cadence::Hourly, 4).unwrap();
        assert_eq!(row, 4 + 25);

        let (_, row) = resolve_row(at(2025, 11, 26, 12, 0), Cadence::Shift, 5).unwrap();
        assert_eq!(row, 5);
        let (_, row) = resolve_row(at(2025, 11, 27, 0, 0), Cadence::Shift, 5).unwrap();
        assert_eq!(row, 6);
    }

    #[test]
    fn row_before_cycle_start_is_an_error() {
        let ctx = resolve(at(2025, 6, 30, 0, 0), Cadence::Hourly).unwrap();
        let err = ctx.row_for(at(2025, 6, 1, 0, 0), 4).unwrap_err();
        assert!(matches!(err, CycleError::BeforeCycleStart { .. }));
    }

    #[test]
    fn slot_timestamp_inverts_row_for() {
        let ctx = resolve(at(2025, 2, 10, 0, 0), Cadence::Shift).unwrap();
        let ts = ctx.slot_timestamp(9, 5).unwrap();
        assert_eq!(ts, at(2025, 1, 28, 12, 0));
        assert_eq!(ctx.row_for(ts, 5).unwrap(), 9);
    }

    #[test]
    fn previous_cycle_wraps_year() {
        let ctx = resolve(at(2026, 1, 3, 8, 0), Cadence::Hourly).unwrap();
        let prev = ctx.previous().unwrap();
        assert_eq!(prev.sheet_index, 11);
        assert_eq!(prev.file_year, 2025);
        assert_eq!(prev.cycle_end, ctx.cycle_start);
    }

    #[test]
    fn last_row_of_a_31_day_cycle() {
        // Dec 26 -> Jan 26 is 31 days of hourly rows.
        let ctx = resolve(at(2025, 12, 30, 0, 0), Cadence::Hourly).unwrap();
        assert_eq!(ctx.last_row(4).unwrap(), 4 + 31 * 24 - 1);
    }
}
