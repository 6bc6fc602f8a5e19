use crate::buffer::persist_json;
use crate::outage::OutageEvent;
use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerKind {
    WentDown,
    CameBack,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub unit: u32,
    pub kind: LedgerKind,
    pub at: NaiveDateTime,
}

/// Day-keyed record of units going down and coming back, kept for today and
/// yesterday only. Feeds operator notifications.
#[derive(Debug, Clone)]
pub struct EventLedger {
    path: PathBuf,
}

impl EventLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load(&self) -> Result<BTreeMap<NaiveDate, Vec<LedgerRecord>>> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(days) => Ok(days),
                Err(err) => {
                    tracing::warn!(path = %self.path.display(), error = %err, "ledger unreadable; starting empty");
                    Ok(BTreeMap::new())
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(err) => Err(err).with_context(|| format!("read {}", self.path.display())),
        }
    }

    /// Adds the transitions of `events` that fall on `today` or the day
    /// before, prunes older days and returns only the records not seen before.
    /// Range edges are not transitions: an event carried in from the seed has
    /// no "went down", and one still open or cut off at the range end has no
    /// "came back".
    pub fn record(&self, events: &[OutageEvent], today: NaiveDate) -> Result<Vec<LedgerRecord>> {
        let oldest = today - Duration::days(1);
        let mut days = self.load()?;
        days.retain(|day, _| *day >= oldest && *day <= today);

        let mut added = Vec::new();
        for event in events {
            let mut transitions = Vec::with_capacity(2);
            if event.observed_down() {
                transitions.push(LedgerRecord {
                    unit: event.unit,
                    kind: LedgerKind::WentDown,
                    at: event.start,
                });
            }
            if event.observed_recovery() {
                transitions.push(LedgerRecord {
                    unit: event.unit,
                    kind: LedgerKind::CameBack,
                    at: event.end,
                });
            }
            for record in transitions {
                let day = record.at.date();
                if day < oldest || day > today {
                    continue;
                }
                let bucket = days.entry(day).or_default();
                if !bucket.contains(&record) {
                    bucket.push(record.clone());
                    added.push(record);
                }
            }
        }

        persist_json(&self.path, &days)?;
        for record in &added {
            match record.kind {
                LedgerKind::WentDown => tracing::info!(unit = record.unit, at = %record.at, "unit went down"),
                LedgerKind::CameBack => tracing::info!(unit = record.unit, at = %record.at, "unit came back"),
            }
        }
        Ok(added)
    }
}
