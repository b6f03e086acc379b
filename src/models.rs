use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// One row of tabular data. Key order is column order.
pub type Record = Map<String, Value>;

/// Marker column carried by the placeholder result of a failed step.
pub const ERROR_COLUMN: &str = "Error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetId(Uuid);

impl DatasetId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DatasetId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Csv,
    Tsv,
    Xlsx,
    Json,
    /// Synthetic dataset wrapping a previous step's output.
    Derived,
}

impl FileType {
    /// Maps a loose format tag (`"text/csv"`, `"XLSX"`, `"report.tsv"`) to a file type.
    pub fn from_tag(tag: &str) -> Option<Self> {
        let tag = tag.to_lowercase();
        match () {
            _ if tag.contains("xlsx") || tag.contains("spreadsheetml") => Some(Self::Xlsx),
            _ if tag.contains("tsv") || tag.contains("tab-separated") => Some(Self::Tsv),
            _ if tag.contains("csv") => Some(Self::Csv),
            _ if tag.contains("json") => Some(Self::Json),
            _ => None,
        }
    }

    pub fn delimiter(&self) -> u8 {
        match self {
            Self::Tsv => b'\t',
            _ => b',',
        }
    }
}

/// Unparsed backing data a dataset can be materialized from.
#[derive(Debug, Clone)]
pub enum RawSource {
    Text(Arc<str>),
    Workbook(Bytes),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SheetData {
    pub rows: Vec<Record>,
    pub columns: Vec<String>,
    /// Data rows in the sheet, including those past the decoded cap.
    pub total_rows: usize,
}

/// An imported table. Treated as immutable once built; materialized rows
/// live in the materialization cache rather than on the dataset.
#[derive(Debug, Clone)]
pub struct SourceDataset {
    pub id: DatasetId,
    pub name: String,
    pub file_type: FileType,
    pub rows: Arc<Vec<Record>>,
    pub columns: Vec<String>,
    pub sheets: Option<BTreeMap<String, SheetData>>,
    pub active_sheet: Option<String>,
    pub raw: Option<RawSource>,
    /// Full row count when `rows` holds only a capped sample.
    pub total_rows: Option<usize>,
}

impl SourceDataset {
    pub fn from_rows(name: impl Into<String>, file_type: FileType, rows: Vec<Record>) -> Self {
        let columns = columns_of(&rows);
        Self {
            id: DatasetId::new(),
            name: name.into(),
            file_type,
            rows: Arc::new(rows),
            columns,
            sheets: None,
            active_sheet: None,
            raw: None,
            total_rows: None,
        }
    }

    pub fn from_raw_text(name: impl Into<String>, file_type: FileType, text: impl Into<Arc<str>>) -> Self {
        Self {
            id: DatasetId::new(),
            name: name.into(),
            file_type,
            rows: Arc::new(Vec::new()),
            columns: Vec::new(),
            sheets: None,
            active_sheet: None,
            raw: Some(RawSource::Text(text.into())),
            total_rows: None,
        }
    }

    pub fn from_workbook(name: impl Into<String>, bytes: Bytes, active_sheet: Option<String>) -> Self {
        Self {
            id: DatasetId::new(),
            name: name.into(),
            file_type: FileType::Xlsx,
            rows: Arc::new(Vec::new()),
            columns: Vec::new(),
            sheets: None,
            active_sheet,
            raw: Some(RawSource::Workbook(bytes)),
            total_rows: None,
        }
    }

    pub fn with_sheets(mut self, sheets: BTreeMap<String, SheetData>, active_sheet: Option<String>) -> Self {
        self.sheets = Some(sheets);
        self.active_sheet = active_sheet;
        self
    }

    /// True when rows are empty but something exists to build them from.
    pub fn needs_materialization(&self) -> bool {
        self.rows.is_empty() && (self.raw.is_some() || self.sheets.is_some())
    }

    /// Same dataset identity with a materialized sample in place.
    pub fn with_table(&self, rows: Arc<Vec<Record>>, columns: Vec<String>, total_rows: usize) -> Self {
        Self {
            rows,
            columns,
            total_rows: Some(total_rows),
            ..self.clone()
        }
    }

    /// Rows in the whole dataset, not just the materialized sample.
    pub fn row_total(&self) -> usize {
        self.total_rows.unwrap_or(self.rows.len()).max(self.rows.len())
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
            || self.rows.first().is_some_and(|row| row.contains_key(column))
    }
}

/// Column names taken from the keys of the first record.
pub fn columns_of(rows: &[Record]) -> Vec<String> {
    rows.first()
        .map(|row| row.keys().cloned().collect())
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    Function,
    ColumnSelection,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnReference {
    pub file_name: String,
    pub column_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub id: String,
    pub kind: StepKind,
    pub order: u32,
    pub source: String,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub column_reference: Option<ColumnReference>,
    #[serde(default)]
    pub parameters: Record,
}

impl WorkflowStep {
    pub fn function(id: impl Into<String>, order: u32, formula: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: StepKind::Function,
            order,
            source: formula.into(),
            target: None,
            column_reference: None,
            parameters: Record::new(),
        }
    }

    pub fn column_selection(id: impl Into<String>, order: u32, file_name: &str, column_name: &str) -> Self {
        Self {
            id: id.into(),
            kind: StepKind::ColumnSelection,
            order,
            source: column_name.to_string(),
            target: None,
            column_reference: Some(ColumnReference {
                file_name: file_name.to_string(),
                column_name: column_name.to_string(),
            }),
            parameters: Record::new(),
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }
}

/// Output of one step in one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_index: usize,
    pub rows: Vec<Record>,
    pub columns: Vec<String>,
    /// Row count before sampling.
    pub row_count: usize,
    pub execution_time_ms: u64,
    pub memory_usage: u64,
    pub sample_size: usize,
    /// Columns this step (or the chain feeding it) computed.
    pub derived_columns: Vec<String>,
    /// Set on placeholder results of failed steps.
    pub failure: Option<String>,
    /// Index of the failed upstream step that left this step without input.
    pub blocked_by: Option<usize>,
}

impl StepResult {
    pub fn sentinel(step_index: usize, message: impl Into<String>) -> Self {
        Self {
            step_index,
            rows: Vec::new(),
            columns: vec![ERROR_COLUMN.to_string()],
            row_count: 0,
            execution_time_ms: 0,
            memory_usage: 0,
            sample_size: 0,
            derived_columns: Vec::new(),
            failure: Some(message.into()),
            blocked_by: None,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.failure.is_some()
    }

    /// Equality ignoring the timing-only fields.
    pub fn same_output(&self, other: &Self) -> bool {
        self.step_index == other.step_index
            && self.rows == other.rows
            && self.columns == other.columns
            && self.row_count == other.row_count
            && self.sample_size == other.sample_size
            && self.derived_columns == other.derived_columns
            && self.failure == other.failure
            && self.blocked_by == other.blocked_by
    }
}

/// A fully computed, published run: one result per step, in step order.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRun {
    pub generation: u64,
    pub sample_size: Option<usize>,
    pub results: Vec<StepResult>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    #[default]
    Step,
    Final,
}
