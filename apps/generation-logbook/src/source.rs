//! Reads plant samples from the relational time series.

use crate::error::LogbookError;
use crate::workbook::CellValue;
use async_trait::async_trait;
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use sqlx::MySqlPool;

pub const UNIT_COUNT: usize = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UnitReading {
    pub mw: Option<f64>,
    pub mvar: Option<f64>,
    pub energy: Option<f64>,
    pub vab: Option<f64>,
    pub vbc: Option<f64>,
    pub vca: Option<f64>,
    pub pfa: Option<f64>,
    pub pfb: Option<f64>,
    pub pfc: Option<f64>,
    pub freq: Option<f64>,
}

impl UnitReading {
    pub fn voltage(&self) -> Option<f64> {
        mean3(self.vab, self.vbc, self.vca)
    }

    pub fn power_factor(&self) -> Option<f64> {
        mean3(self.pfa, self.pfb, self.pfc)
    }
}

/// One row of the series: three generating units plus plant totals.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlantSample {
    pub timestamp: NaiveDateTime,
    pub units: [UnitReading; UNIT_COUNT],
    pub plant_mw: Option<f64>,
    pub plant_mvar: Option<f64>,
}

impl PlantSample {
    /// Looks a reading up by its series column name (`mw2`, `freq1`, `mw`).
    pub fn field(&self, column: &str) -> Option<f64> {
        match column {
            "mw" => return self.plant_mw,
            "mvar" => return self.plant_mvar,
            _ => {}
        }
        let split = column.find(|c: char| c.is_ascii_digit())?;
        let (name, index) = column.split_at(split);
        let unit = self.units.get(index.parse::<usize>().ok()?.checked_sub(1)?)?;
        match name {
            "mw" => unit.mw,
            "mvar" => unit.mvar,
            "energy" => unit.energy,
            "vab" => unit.vab,
            "vbc" => unit.vbc,
            "vca" => unit.vca,
            "pfa" => unit.pfa,
            "pfb" => unit.pfb,
            "pfc" => unit.pfc,
            "freq" => unit.freq,
            _ => None,
        }
    }
}

fn mean3(a: Option<f64>, b: Option<f64>, c: Option<f64>) -> Option<f64> {
    Some((a? + b? + c?) / 3.0)
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Hourly analog projection: `mw, v, pf, mvar` per unit then plant `mw, mvar`,
/// rounded to two decimals. A missing sample or reading becomes an empty cell.
pub fn hourly_values(sample: Option<&PlantSample>) -> Vec<CellValue> {
    const WIDTH: usize = UNIT_COUNT * 4 + 2;
    let Some(sample) = sample else {
        return vec![CellValue::Empty; WIDTH];
    };
    let mut raw = Vec::with_capacity(WIDTH);
    for unit in &sample.units {
        raw.extend([unit.mw, unit.voltage(), unit.power_factor(), unit.mvar]);
    }
    raw.extend([sample.plant_mw, sample.plant_mvar]);
    raw.into_iter()
        .map(|value| match value {
            Some(v) if v.is_finite() => CellValue::Number(round_to(v, 2)),
            _ => CellValue::Empty,
        })
        .collect()
}

/// Shift energy projection: one integer counter per unit, missing as zero.
pub fn shift_values(sample: Option<&PlantSample>) -> Vec<CellValue> {
    (0..UNIT_COUNT)
        .map(|idx| {
            let energy = sample
                .and_then(|s| s.units[idx].energy)
                .filter(|v| v.is_finite())
                .unwrap_or(0.0);
            CellValue::Number(energy.round())
        })
        .collect()
}

#[async_trait]
pub trait SeriesSource: Send + Sync {
    /// The row stored at exactly `timestamp`, if any.
    async fn fetch_at(&self, timestamp: NaiveDateTime) -> Result<Option<PlantSample>, LogbookError>;

    /// All rows in `[start, end)`, ordered by time.
    async fn fetch_range(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<PlantSample>, LogbookError>;

    /// The newest row strictly before `timestamp`.
    async fn fetch_last_before(&self, timestamp: NaiveDateTime) -> Result<Option<PlantSample>, LogbookError>;
}

pub async fn fetch_exact<S: SeriesSource + ?Sized>(
    source: &S,
    timestamp: NaiveDateTime,
) -> Result<Option<PlantSample>, LogbookError> {
    source.fetch_at(timestamp).await
}

/// Probes `t, t+1s, …` for up to `max_seconds` lookups and returns the first
/// hit. Loggers stamp rows a second or two late, so the nominal slot time
/// often misses.
pub async fn fetch_with_retry<S: SeriesSource + ?Sized>(
    source: &S,
    timestamp: NaiveDateTime,
    max_seconds: u32,
) -> Result<Option<PlantSample>, LogbookError> {
    for offset in 0..max_seconds {
        let probe = timestamp + Duration::seconds(i64::from(offset));
        if let Some(sample) = source.fetch_at(probe).await? {
            if offset > 0 {
                tracing::debug!(%timestamp, offset, "sample found after retry");
            }
            return Ok(Some(sample));
        }
    }
    Ok(None)
}

#[derive(Debug, sqlx::FromRow)]
struct SampleRow {
    date: NaiveDate,
    time: NaiveTime,
    mw1: Option<f64>,
    mw2: Option<f64>,
    mw3: Option<f64>,
    mvar1: Option<f64>,
    mvar2: Option<f64>,
    mvar3: Option<f64>,
    energy1: Option<f64>,
    energy2: Option<f64>,
    energy3: Option<f64>,
    vab1: Option<f64>,
    vab2: Option<f64>,
    vab3: Option<f64>,
    vbc1: Option<f64>,
    vbc2: Option<f64>,
    vbc3: Option<f64>,
    vca1: Option<f64>,
    vca2: Option<f64>,
    vca3: Option<f64>,
    pfa1: Option<f64>,
    pfa2: Option<f64>,
    pfa3: Option<f64>,
    pfb1: Option<f64>,
    pfb2: Option<f64>,
    pfb3: Option<f64>,
    pfc1: Option<f64>,
    pfc2: Option<f64>,
    pfc3: Option<f64>,
    freq1: Option<f64>,
    freq2: Option<f64>,
    freq3: Option<f64>,
    mw: Option<f64>,
    mvar: Option<f64>,
}

impl From<SampleRow> for PlantSample {
    fn from(row: SampleRow) -> Self {
        let unit = |mw, mvar, energy, vab, vbc, vca, pfa, pfb, pfc, freq| UnitReading {
            mw,
            mvar,
            energy,
            vab,
            vbc,
            vca,
            pfa,
            pfb,
            pfc,
            freq,
        };
        Self {
            timestamp: row.date.and_time(row.time),
            units: [
                unit(row.mw1, row.mvar1, row.energy1, row.vab1, row.vbc1, row.vca1, row.pfa1, row.pfb1, row.pfc1, row.freq1),
                unit(row.mw2, row.mvar2, row.energy2, row.vab2, row.vbc2, row.vca2, row.pfa2, row.pfb2, row.pfc2, row.freq2),
                unit(row.mw3, row.mvar3, row.energy3, row.vab3, row.vbc3, row.vca3, row.pfa3, row.pfb3, row.pfc3, row.freq3),
            ],
            plant_mw: row.mw,
            plant_mvar: row.mvar,
        }
    }
}

const READING_COLUMNS: &[&str] = &[
    "mw1", "mw2", "mw3", "mvar1", "mvar2", "mvar3", "energy1", "energy2", "energy3", "vab1",
    "vab2", "vab3", "vbc1", "vbc2", "vbc3", "vca1", "vca2", "vca3", "pfa1", "pfa2", "pfa3",
    "pfb1", "pfb2", "pfb3", "pfc1", "pfc2", "pfc3", "freq1", "freq2", "freq3", "mw", "mvar",
];

/// MySQL-backed series. Reading columns are cast to DOUBLE so DECIMAL and
/// FLOAT schemas decode the same way.
#[derive(Debug, Clone)]
pub struct SqlSeriesSource {
    pool: MySqlPool,
    select: String,
}

impl SqlSeriesSource {
    /// `table` must already be validated as a plain identifier.
    pub fn new(pool: MySqlPool, table: &str) -> Self {
        let readings = READING_COLUMNS
            .iter()
            .map(|col| format!("CAST(`{col}` AS DOUBLE) AS `{col}`"))
            .collect::<Vec<_>>()
            .join(", ");
        let select = format!("SELECT `date`, `time`, {readings} FROM `{table}`");
        Self { pool, select }
    }
}

#[async_trait]
impl SeriesSource for SqlSeriesSource {
    async fn fetch_at(&self, timestamp: NaiveDateTime) -> Result<Option<PlantSample>, LogbookError> {
        let sql = format!("{} WHERE `date` = ? AND `time` = ? LIMIT 1", self.select);
        let row: Option<SampleRow> = sqlx::query_as(&sql)
            .bind(timestamp.date())
            .bind(timestamp.time())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(PlantSample::from))
    }

    async fn fetch_range(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<PlantSample>, LogbookError> {
        let sql = format!(
            "{} WHERE `date` >= ? AND `date` <= ? ORDER BY `date` ASC, `time` ASC",
            self.select
        );
        let rows: Vec<SampleRow> = sqlx::query_as(&sql)
            .bind(start.date())
            .bind(end.date())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(PlantSample::from)
            .filter(|sample| sample.timestamp >= start && sample.timestamp < end)
            .collect())
    }

    async fn fetch_last_before(&self, timestamp: NaiveDateTime) -> Result<Option<PlantSample>, LogbookError> {
        let sql = format!(
            "{} WHERE `date` < ? OR (`date` = ? AND `time` < ?) ORDER BY `date` DESC, `time` DESC LIMIT 1",
            self.select
        );
        let row: Option<SampleRow> = sqlx::query_as(&sql)
            .bind(timestamp.date())
            .bind(timestamp.date())
            .bind(timestamp.time())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(PlantSample::from))
    }
}
