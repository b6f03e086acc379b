//! Lazy materialization of raw-backed datasets.
//!
//! Parsed tables are cached outside the dataset, keyed by dataset identity
//! and row cap, so datasets themselves stay immutable.

use crate::models::{columns_of, DatasetId, RawSource, Record, SheetData, SourceDataset};
use crate::services::excel::decode_workbook;
use moka::sync::Cache;
use serde_json::{Number, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MaterializeError {
    #[error("Failed to parse {dataset}: {reason}")]
    Parse { dataset: String, reason: String },
    #[error("Failed to decode workbook {dataset}: {reason}")]
    Workbook { dataset: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseOptions {
    pub header_row: bool,
    pub row_cap: usize,
    pub delimiter: u8,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedTable {
    pub rows: Vec<Record>,
    pub columns: Vec<String>,
    /// Records in the whole text, counted past the row cap without decoding them.
    pub total_rows: usize,
}

/// Decoder for delimited raw text.
pub trait RawTextParser: Send + Sync {
    fn parse(&self, raw: &str, options: ParseOptions) -> Result<ParsedTable, String>;
}

/// `csv`-backed parser. Numeric-looking fields become JSON numbers, empty
/// fields become null.
#[derive(Debug, Default, Clone, Copy)]
pub struct DelimitedTextParser;

impl RawTextParser for DelimitedTextParser {
    fn parse(&self, raw: &str, options: ParseOptions) -> Result<ParsedTable, String> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(options.header_row)
            .delimiter(options.delimiter)
            .flexible(true)
            .trim(csv::Trim::Headers)
            .from_reader(raw.as_bytes());

        let mut columns: Vec<String> = if options.header_row {
            reader
                .headers()
                .map_err(|e| e.to_string())?
                .iter()
                .map(str::to_string)
                .collect()
        } else {
            Vec::new()
        };

        let mut rows = Vec::new();
        for record in reader.records().take(options.row_cap) {
            let record = record.map_err(|e| e.to_string())?;
            while columns.len() < record.len() {
                columns.push(format!("column_{}", columns.len() + 1));
            }
            let row: Record = columns
                .iter()
                .enumerate()
                .map(|(idx, name)| (name.clone(), record.get(idx).map(field_value).unwrap_or(Value::Null)))
                .collect();
            rows.push(row);
        }

        let mut skipped = csv::ByteRecord::new();
        let mut remaining = 0;
        while reader.read_byte_record(&mut skipped).map_err(|e| e.to_string())? {
            remaining += 1;
        }

        Ok(ParsedTable {
            total_rows: rows.len() + remaining,
            rows,
            columns,
        })
    }
}

fn field_value(field: &str) -> Value {
    let trimmed = field.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::Number(i.into());
    }
    if let Some(n) = trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(n);
    }
    Value::String(field.to_string())
}

pub struct MaterializationCache {
    parser: Arc<dyn RawTextParser>,
    tables: Cache<(DatasetId, usize), MaterializedTable>,
}

#[derive(Debug, Clone)]
struct MaterializedTable {
    rows: Arc<Vec<Record>>,
    columns: Vec<String>,
    total_rows: usize,
    /// Decoded sheet map and the sheet rows came from, for workbooks.
    sheets: Option<(BTreeMap<String, SheetData>, String)>,
}

impl MaterializedTable {
    fn from_parsed(parsed: ParsedTable) -> Self {
        let columns = if parsed.columns.is_empty() {
            columns_of(&parsed.rows)
        } else {
            parsed.columns
        };
        Self {
            total_rows: parsed.total_rows.max(parsed.rows.len()),
            rows: Arc::new(parsed.rows),
            columns,
            sheets: None,
        }
    }
}

impl MaterializationCache {
    pub fn new(parser: Arc<dyn RawTextParser>, capacity: u64) -> Self {
        Self {
            parser,
            tables: Cache::new(capacity),
        }
    }

    /// Returns the dataset with rows in place, parsing at most once per
    /// dataset and row cap. Datasets that already carry rows pass through.
    pub fn materialize(&self, dataset: &Arc<SourceDataset>, row_cap: usize) -> Result<Arc<SourceDataset>, MaterializeError> {
        if !dataset.needs_materialization() {
            return Ok(Arc::clone(dataset));
        }

        let table = self
            .tables
            .try_get_with((dataset.id, row_cap), || self.build(dataset, row_cap))
            .map_err(|e| (*e).clone())?;

        let materialized = dataset.with_table(table.rows, table.columns, table.total_rows);
        Ok(Arc::new(match table.sheets {
            Some((sheets, sheet)) => materialized.with_sheets(sheets, Some(sheet)),
            None => materialized,
        }))
    }

    fn build(&self, dataset: &SourceDataset, row_cap: usize) -> Result<MaterializedTable, MaterializeError> {
        if let Some(sheets) = &dataset.sheets {
            let sheet = dataset
                .active_sheet
                .as_ref()
                .and_then(|name| sheets.get(name))
                .or_else(|| sheets.values().next());
            if let Some(sheet) = sheet {
                return Ok(MaterializedTable::from_parsed(ParsedTable {
                    rows: sheet.rows.iter().take(row_cap).cloned().collect(),
                    columns: sheet.columns.clone(),
                    total_rows: sheet.total_rows.max(sheet.rows.len()),
                }));
            }
        }

        match &dataset.raw {
            Some(RawSource::Text(text)) => {
                tracing::debug!(dataset = %dataset.name, row_cap, "Parsing raw text");
                let options = ParseOptions {
                    header_row: true,
                    row_cap,
                    delimiter: dataset.file_type.delimiter(),
                };
                self.parser
                    .parse(text, options)
                    .map(MaterializedTable::from_parsed)
                    .map_err(|reason| MaterializeError::Parse {
                        dataset: dataset.name.clone(),
                        reason,
                    })
            }
            Some(RawSource::Workbook(bytes)) => {
                tracing::debug!(dataset = %dataset.name, row_cap, "Decoding workbook");
                let workbook = decode_workbook(bytes, dataset.active_sheet.as_deref(), row_cap).map_err(|reason| {
                    MaterializeError::Workbook {
                        dataset: dataset.name.clone(),
                        reason,
                    }
                })?;
                let active = workbook.active().cloned().unwrap_or_default();
                let mut table = MaterializedTable::from_parsed(ParsedTable {
                    rows: active.rows,
                    columns: active.columns,
                    total_rows: active.total_rows,
                });
                table.sheets = Some((workbook.sheets, workbook.sheet));
                Ok(table)
            }
            None => Ok(MaterializedTable::from_parsed(ParsedTable::default())),
        }
    }
}

impl Default for MaterializationCache {
    fn default() -> Self {
        Self::new(Arc::new(DelimitedTextParser), 64)
    }
}
