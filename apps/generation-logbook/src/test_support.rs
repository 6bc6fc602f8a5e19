use crate::error::LogbookError;
use crate::lock_probe::LockProbe;
use crate::source::{PlantSample, SeriesSource};
use crate::workbook::{CellValue, Workbook, WorkbookStore};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d)
        .expect("date")
        .and_hms_opt(h, min, s)
        .expect("time")
}

pub fn sample(timestamp: NaiveDateTime) -> PlantSample {
    PlantSample {
        timestamp,
        ..PlantSample::default()
    }
}

/// Sample with the given `(mw, freq)` per unit.
pub fn unit_sample(timestamp: NaiveDateTime, readings: [(f64, f64); 3]) -> PlantSample {
    let mut s = sample(timestamp);
    for (unit, (mw, freq)) in s.units.iter_mut().zip(readings) {
        unit.mw = Some(mw);
        unit.freq = Some(freq);
    }
    s
}

#[derive(Default)]
pub struct MemorySeries {
    samples: Mutex<Vec<PlantSample>>,
    lookups: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemorySeries {
    pub fn new(mut samples: Vec<PlantSample>) -> Self {
        samples.sort_by_key(|s| s.timestamp);
        Self {
            samples: Mutex::new(samples),
            ..Self::default()
        }
    }

    pub fn push(&self, sample: PlantSample) {
        let mut samples = self.samples.lock().unwrap();
        samples.push(sample);
        samples.sort_by_key(|s| s.timestamp);
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), LogbookError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LogbookError::SourceUnavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SeriesSource for MemorySeries {
    async fn fetch_at(&self, timestamp: NaiveDateTime) -> Result<Option<PlantSample>, LogbookError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        let samples = self.samples.lock().unwrap();
        Ok(samples.iter().find(|s| s.timestamp == timestamp).cloned())
    }

    async fn fetch_range(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<PlantSample>, LogbookError> {
        self.check()?;
        let samples = self.samples.lock().unwrap();
        Ok(samples
            .iter()
            .filter(|s| s.timestamp >= start && s.timestamp < end)
            .cloned()
            .collect())
    }

    async fn fetch_last_before(&self, timestamp: NaiveDateTime) -> Result<Option<PlantSample>, LogbookError> {
        self.check()?;
        let samples = self.samples.lock().unwrap();
        Ok(samples.iter().rev().find(|s| s.timestamp < timestamp).cloned())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryCell {
    pub value: Option<CellValue>,
    pub formula: Option<String>,
    pub number_format: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBook {
    pub sheets: Vec<HashMap<(u32, u32), MemoryCell>>,
}

impl MemoryBook {
    pub fn with_sheets(count: usize) -> Self {
        Self {
            sheets: vec![HashMap::new(); count],
        }
    }

    pub fn cell(&self, sheet: usize, row: u32, col: u32) -> Option<&MemoryCell> {
        self.sheets.get(sheet)?.get(&(row, col))
    }

    pub fn value(&self, sheet: usize, row: u32, col: u32) -> Option<CellValue> {
        self.cell(sheet, row, col)?.value.clone()
    }

    pub fn formula(&self, sheet: usize, row: u32, col: u32) -> Option<String> {
        self.cell(sheet, row, col)?.formula.clone()
    }

    fn sheet_mut(&mut self, sheet: usize) -> Result<&mut HashMap<(u32, u32), MemoryCell>, LogbookError> {
        let sheet_count = self.sheets.len();
        self.sheets
            .get_mut(sheet)
            .ok_or(LogbookError::SheetIndexOutOfRange {
                path: PathBuf::from("<memory>"),
                sheet_index: sheet,
                sheet_count,
            })
    }
}

impl Workbook for MemoryBook {
    fn sheet_count(&self) -> usize {
        self.sheets.len()
    }

    fn set_cell(
        &mut self,
        sheet: usize,
        row: u32,
        col: u32,
        value: &CellValue,
        number_format: Option<&str>,
    ) -> Result<(), LogbookError> {
        let cell = self.sheet_mut(sheet)?.entry((row, col)).or_default();
        cell.value = Some(value.clone());
        cell.formula = None;
        if let Some(format) = number_format {
            cell.number_format = Some(format.to_string());
        }
        Ok(())
    }

    fn set_formula(&mut self, sheet: usize, row: u32, col: u32, formula: &str) -> Result<(), LogbookError> {
        let cell = self.sheet_mut(sheet)?.entry((row, col)).or_default();
        cell.formula = Some(formula.to_string());
        Ok(())
    }

    fn cell_is_blank(&self, sheet: usize, row: u32, col: u32) -> bool {
        match self.cell(sheet, row, col) {
            None => true,
            Some(cell) => {
                cell.formula.is_none()
                    && match &cell.value {
                        None | Some(CellValue::Empty) => true,
                        Some(CellValue::Text(text)) => text.trim().is_empty(),
                        Some(_) => false,
                    }
            }
        }
    }
}

#[derive(Default)]
struct MemoryFiles {
    files: HashMap<PathBuf, MemoryBook>,
    templates: HashMap<PathBuf, MemoryBook>,
    failing_saves: HashSet<PathBuf>,
    saves: usize,
}

/// Filesystem stand-in; clones share state so tests can inspect saved books.
#[derive(Clone, Default)]
pub struct MemoryWorkbookStore {
    inner: Arc<Mutex<MemoryFiles>>,
}

impl MemoryWorkbookStore {
    pub fn add_template(&self, path: impl Into<PathBuf>, book: MemoryBook) {
        self.inner.lock().unwrap().templates.insert(path.into(), book);
    }

    pub fn put_file(&self, path: impl Into<PathBuf>, book: MemoryBook) {
        self.inner.lock().unwrap().files.insert(path.into(), book);
    }

    pub fn file(&self, path: &Path) -> Option<MemoryBook> {
        self.inner.lock().unwrap().files.get(path).cloned()
    }

    pub fn template(&self, path: &Path) -> Option<MemoryBook> {
        self.inner.lock().unwrap().templates.get(path).cloned()
    }

    pub fn fail_saves_to(&self, path: impl Into<PathBuf>) {
        self.inner.lock().unwrap().failing_saves.insert(path.into());
    }

    pub fn saves(&self) -> usize {
        self.inner.lock().unwrap().saves
    }
}

#[async_trait]
impl WorkbookStore for MemoryWorkbookStore {
    type Book = MemoryBook;

    async fn exists(&self, path: &Path) -> bool {
        self.inner.lock().unwrap().files.contains_key(path)
    }

    async fn open(&self, path: &Path) -> Result<MemoryBook, LogbookError> {
        self.file(path).ok_or_else(|| LogbookError::Workbook {
            path: path.to_path_buf(),
            message: "no such file".to_string(),
        })
    }

    async fn create_from_template(&self, template: &Path) -> Result<MemoryBook, LogbookError> {
        self.template(template).ok_or_else(|| LogbookError::TemplateMissing {
            path: template.to_path_buf(),
        })
    }

    async fn save(&self, book: MemoryBook, path: &Path) -> Result<(), LogbookError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.failing_saves.contains(path) {
            return Err(LogbookError::Workbook {
                path: path.to_path_buf(),
                message: "disk full".to_string(),
            });
        }
        inner.saves += 1;
        inner.files.insert(path.to_path_buf(), book);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct FakeLockProbe {
    locked: Arc<Mutex<HashSet<PathBuf>>>,
}

impl FakeLockProbe {
    pub fn lock(&self, path: impl Into<PathBuf>) {
        self.locked.lock().unwrap().insert(path.into());
    }

    pub fn unlock(&self, path: &Path) {
        self.locked.lock().unwrap().remove(path);
    }
}

#[async_trait]
impl LockProbe for FakeLockProbe {
    async fn is_open_by_other(&self, path: &Path) -> bool {
        self.locked.lock().unwrap().contains(path)
    }
}
