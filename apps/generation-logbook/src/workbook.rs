//! Spreadsheet I/O seam.
//!
//! The merge engine and gap scanner only see [`WorkbookStore`] and
//! [`Workbook`]; the `.xlsx` backend lives in [`XlsxStore`]. Sheets are
//! 0-indexed, rows and columns 1-indexed.

use crate::error::LogbookError;
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Days from 0001-01-01 to the spreadsheet epoch (1899-12-30).
const SERIAL_EPOCH_DAYS_FROM_CE: i32 = 693_594;
const DEFAULT_DATE_FORMAT: &str = "yyyy-mm-dd";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CellValue {
    Empty,
    Number(f64),
    Text(String),
    Date(NaiveDate),
}

impl CellValue {
    pub fn is_empty(&self) -> bool {
        matches!(self, CellValue::Empty)
    }
}

/// Spreadsheet serial number for a calendar date.
pub fn date_serial(date: NaiveDate) -> f64 {
    f64::from(date.num_days_from_ce() - SERIAL_EPOCH_DAYS_FROM_CE)
}

pub trait Workbook: Send + 'static {
    fn sheet_count(&self) -> usize;

    fn set_cell(
        &mut self,
        sheet: usize,
        row: u32,
        col: u32,
        value: &CellValue,
        number_format: Option<&str>,
    ) -> Result<(), LogbookError>;

    fn set_formula(&mut self, sheet: usize, row: u32, col: u32, formula: &str) -> Result<(), LogbookError>;

    /// True when the cell is absent or holds only whitespace. A formula cell
    /// is never blank, whatever its cached value. Missing sheets read as
    /// blank.
    fn cell_is_blank(&self, sheet: usize, row: u32, col: u32) -> bool;
}

#[async_trait]
pub trait WorkbookStore: Send + Sync {
    type Book: Workbook;

    async fn exists(&self, path: &Path) -> bool;

    async fn open(&self, path: &Path) -> Result<Self::Book, LogbookError>;

    /// Loads a fresh copy of a template. The template itself is never written.
    async fn create_from_template(&self, template: &Path) -> Result<Self::Book, LogbookError>;

    /// Persists `book` at `path`, replacing any previous file atomically.
    async fn save(&self, book: Self::Book, path: &Path) -> Result<(), LogbookError>;
}

pub struct XlsxBook {
    path: PathBuf,
    inner: umya_spreadsheet::Spreadsheet,
}

impl XlsxBook {
    fn sheet_mut(&mut self, sheet: usize) -> Result<&mut umya_spreadsheet::Worksheet, LogbookError> {
        let sheet_count = self.inner.get_sheet_count();
        let path = self.path.clone();
        self.inner
            .get_sheet_mut(&sheet)
            .ok_or(LogbookError::SheetIndexOutOfRange {
                path,
                sheet_index: sheet,
                sheet_count,
            })
    }
}

impl Workbook for XlsxBook {
    fn sheet_count(&self) -> usize {
        self.inner.get_sheet_count()
    }

    fn set_cell(
        &mut self,
        sheet: usize,
        row: u32,
        col: u32,
        value: &CellValue,
        number_format: Option<&str>,
    ) -> Result<(), LogbookError> {
        let worksheet = self.sheet_mut(sheet)?;
        let format = match value {
            CellValue::Empty => {
                worksheet.get_cell_mut((col, row)).set_value_string("");
                None
            }
            CellValue::Number(number) => {
                worksheet.get_cell_mut((col, row)).set_value_number(*number);
                number_format
            }
            CellValue::Text(text) => {
                worksheet.get_cell_mut((col, row)).set_value_string(text.as_str());
                None
            }
            CellValue::Date(date) => {
                worksheet.get_cell_mut((col, row)).set_value_number(date_serial(*date));
                Some(number_format.unwrap_or(DEFAULT_DATE_FORMAT))
            }
        };
        if let Some(code) = format {
            worksheet
                .get_style_mut((col, row))
                .get_number_format_mut()
                .set_format_code(code);
        }
        Ok(())
    }

    fn set_formula(&mut self, sheet: usize, row: u32, col: u32, formula: &str) -> Result<(), LogbookError> {
        self.sheet_mut(sheet)?
            .get_cell_mut((col, row))
            .set_formula(formula);
        Ok(())
    }

    fn cell_is_blank(&self, sheet: usize, row: u32, col: u32) -> bool {
        self.inner
            .get_sheet(&sheet)
            .and_then(|worksheet| worksheet.get_cell((col, row)))
            .map(|cell| cell.get_formula().is_empty() && cell.get_value().trim().is_empty())
            .unwrap_or(true)
    }
}

/// `.xlsx` files on the local filesystem. umya-spreadsheet is synchronous, so
/// every call runs on the blocking pool.
#[derive(Debug, Clone, Default)]
pub struct XlsxStore;

impl XlsxStore {
    fn read(path: PathBuf) -> Result<XlsxBook, LogbookError> {
        let inner = umya_spreadsheet::reader::xlsx::read(&path).map_err(|err| LogbookError::Workbook {
            path: path.clone(),
            message: err.to_string(),
        })?;
        Ok(XlsxBook { path, inner })
    }
}

#[async_trait]
impl WorkbookStore for XlsxStore {
    type Book = XlsxBook;

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn open(&self, path: &Path) -> Result<XlsxBook, LogbookError> {
        let path = path.to_path_buf();
        let joined = path.clone();
        tokio::task::spawn_blocking(move || Self::read(path))
            .await
            .map_err(|err| LogbookError::Workbook {
                path: joined,
                message: err.to_string(),
            })?
    }

    async fn create_from_template(&self, template: &Path) -> Result<XlsxBook, LogbookError> {
        if !self.exists(template).await {
            return Err(LogbookError::TemplateMissing {
                path: template.to_path_buf(),
            });
        }
        self.open(template).await
    }

    async fn save(&self, book: XlsxBook, path: &Path) -> Result<(), LogbookError> {
        let path = path.to_path_buf();
        let joined = path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&book.inner, &path))
            .await
            .map_err(|err| LogbookError::Workbook {
                path: joined,
                message: err.to_string(),
            })?
    }
}

fn write_atomic(book: &umya_spreadsheet::Spreadsheet, path: &Path) -> Result<(), LogbookError> {
    let fail = |message: String| LogbookError::Workbook {
        path: path.to_path_buf(),
        message,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| fail(err.to_string()))?;
    }
    let tmp = path.with_extension("xlsx.tmp");
    umya_spreadsheet::writer::xlsx::write(book, &tmp).map_err(|err| fail(err.to_string()))?;
    fs::rename(&tmp, path).map_err(|err| fail(err.to_string()))?;
    Ok(())
}
