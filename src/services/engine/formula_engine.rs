use super::formulas::{
    AggregateOp, FilterOp, Formula, FormulaRegistry, NumericOp, ReshapeOp, TextOp, BUILTIN_FORMULAS, DEPIVOT_ATTRIBUTE,
    DEPIVOT_VALUE,
};
use super::{EngineError, EngineOutput, TransformEngine};
use crate::models::{columns_of, Record, SourceDataset, StepKind, WorkflowStep};
use async_trait::async_trait;
use serde_json::{Number, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Runs workflow steps against the built-in formula registry.
#[derive(Debug, Clone)]
pub struct FormulaEngine {
    registry: FormulaRegistry,
}

impl Default for FormulaEngine {
    fn default() -> Self {
        Self::new(BUILTIN_FORMULAS.clone())
    }
}

impl FormulaEngine {
    pub fn new(registry: FormulaRegistry) -> Self {
        Self { registry }
    }

    fn run(&self, step: &WorkflowStep, inputs: &[Arc<SourceDataset>], sample_size: usize) -> Result<EngineOutput, EngineError> {
        // Nothing upstream to work on; degrade to an empty preview.
        if inputs.is_empty() {
            return Ok(EngineOutput::empty());
        }

        match step.kind {
            StepKind::ColumnSelection => select_column(step, inputs, sample_size),
            StepKind::Function => {
                let formula = self
                    .registry
                    .get(&step.source)
                    .ok_or_else(|| EngineError::UnknownFormula(step.source.clone()))?;
                apply_formula(formula, step, inputs, sample_size)
            }
            StepKind::Other => {
                let dataset = &inputs[0];
                Ok(EngineOutput {
                    rows: dataset.rows.iter().take(sample_size).cloned().collect(),
                    columns: dataset_columns(dataset),
                    row_count: dataset.row_total(),
                    derived_columns: Some(Vec::new()),
                })
            }
        }
    }
}

#[async_trait]
impl TransformEngine for FormulaEngine {
    async fn process_step(
        &self,
        step: &WorkflowStep,
        inputs: &[Arc<SourceDataset>],
        sample_size: usize,
    ) -> Result<EngineOutput, EngineError> {
        self.run(step, inputs, sample_size)
    }
}

fn dataset_columns(dataset: &SourceDataset) -> Vec<String> {
    if dataset.columns.is_empty() {
        columns_of(&dataset.rows)
    } else {
        dataset.columns.clone()
    }
}

fn target_of(step: &WorkflowStep) -> Result<&str, EngineError> {
    step.target
        .as_deref()
        .or_else(|| step.column_reference.as_ref().map(|r| r.column_name.as_str()))
        .filter(|t| !t.is_empty())
        .ok_or_else(|| EngineError::MissingTarget { step: step.id.clone() })
}

/// The dataset a single-stream formula reads: the referenced file, else the
/// first file holding the target column, else the first input.
fn primary_input<'a>(step: &WorkflowStep, inputs: &'a [Arc<SourceDataset>], target: &str) -> &'a Arc<SourceDataset> {
    step.column_reference
        .as_ref()
        .and_then(|r| inputs.iter().find(|d| d.name == r.file_name))
        .or_else(|| inputs.iter().find(|d| d.has_column(target)))
        .unwrap_or(&inputs[0])
}

fn require_column(dataset: &SourceDataset, column: &str) -> Result<(), EngineError> {
    if dataset.rows.is_empty() || dataset.has_column(column) {
        Ok(())
    } else {
        Err(EngineError::UnknownColumn {
            column: column.to_string(),
            dataset: dataset.name.clone(),
        })
    }
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn number_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::Number((n as i64).into())
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn with_columns(mut columns: Vec<String>, added: &[String]) -> Vec<String> {
    for column in added {
        if !columns.contains(column) {
            columns.push(column.clone());
        }
    }
    columns
}

fn proper_case(s: &str) -> String {
    s.split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn apply_formula(
    formula: Formula,
    step: &WorkflowStep,
    inputs: &[Arc<SourceDataset>],
    sample_size: usize,
) -> Result<EngineOutput, EngineError> {
    let target = target_of(step)?;
    let outputs: Vec<String> = formula.output_columns(target, &step.parameters).into_vec();

    match formula {
        Formula::Text(op) => {
            let dataset = primary_input(step, inputs, target);
            require_column(dataset, target)?;
            let out = &outputs[0];
            let rows = dataset
                .rows
                .iter()
                .take(sample_size)
                .map(|row| {
                    let mut new_row = row.clone();
                    let value = row.get(target).and_then(text_of).map(|s| match op {
                        TextOp::Upper => Value::String(s.to_uppercase()),
                        TextOp::Lower => Value::String(s.to_lowercase()),
                        TextOp::Trim => Value::String(s.trim().to_string()),
                        TextOp::Length => Value::from(s.chars().count()),
                        TextOp::ProperCase => Value::String(proper_case(&s)),
                    });
                    new_row.insert(out.clone(), value.unwrap_or(Value::Null));
                    new_row
                })
                .collect();
            Ok(EngineOutput {
                rows,
                columns: with_columns(dataset_columns(dataset), &outputs),
                row_count: dataset.row_total(),
                derived_columns: Some(outputs),
            })
        }

        Formula::Numeric(op) => {
            let dataset = primary_input(step, inputs, target);
            require_column(dataset, target)?;
            let operand = Operand::from_parameters(&step.parameters, dataset)?;
            if op == NumericOp::Divide && matches!(operand, Operand::Constant(c) if c == 0.0) {
                return Err(EngineError::DivisionByZero);
            }
            let out = &outputs[0];
            let rows = dataset
                .rows
                .iter()
                .take(sample_size)
                .map(|row| {
                    let mut new_row = row.clone();
                    let lhs = row.get(target).and_then(number_of);
                    let rhs = operand.resolve(row);
                    let value = match (lhs, rhs) {
                        (Some(a), Some(b)) => match op {
                            NumericOp::Add => number_value(a + b),
                            NumericOp::Subtract => number_value(a - b),
                            NumericOp::Multiply => number_value(a * b),
                            NumericOp::Divide if b == 0.0 => Value::Null,
                            NumericOp::Divide => number_value(a / b),
                        },
                        _ => Value::Null,
                    };
                    new_row.insert(out.clone(), value);
                    new_row
                })
                .collect();
            Ok(EngineOutput {
                rows,
                columns: with_columns(dataset_columns(dataset), &outputs),
                row_count: dataset.row_total(),
                derived_columns: Some(outputs),
            })
        }

        Formula::Aggregate(op) => {
            let dataset = primary_input(step, inputs, target);
            require_column(dataset, target)?;
            let values: Vec<&Value> = dataset
                .rows
                .iter()
                .filter_map(|row| row.get(target))
                .filter(|v| !v.is_null())
                .collect();
            let aggregate = match op {
                AggregateOp::Sum => number_value(values.iter().filter_map(|v| number_of(v)).sum()),
                AggregateOp::Count => Value::from(values.len()),
                AggregateOp::Average => {
                    let numbers: Vec<f64> = values.iter().filter_map(|v| number_of(v)).collect();
                    if numbers.is_empty() {
                        Value::Null
                    } else {
                        number_value(numbers.iter().sum::<f64>() / numbers.len() as f64)
                    }
                }
                AggregateOp::UniqueCount => {
                    let unique: HashSet<String> = values.iter().filter_map(|v| text_of(v)).collect();
                    Value::from(unique.len())
                }
            };
            let out = &outputs[0];
            let rows = dataset
                .rows
                .iter()
                .take(sample_size)
                .map(|row| {
                    let mut new_row = row.clone();
                    new_row.insert(out.clone(), aggregate.clone());
                    new_row
                })
                .collect();
            Ok(EngineOutput {
                rows,
                columns: with_columns(dataset_columns(dataset), &outputs),
                row_count: dataset.row_total(),
                derived_columns: Some(outputs),
            })
        }

        Formula::Reshape(ReshapeOp::Depivot) => {
            let dataset = primary_input(step, inputs, target);
            require_column(dataset, target)?;
            let columns = dataset_columns(dataset);
            let melted: Vec<Record> = dataset
                .rows
                .iter()
                .flat_map(|row| {
                    let id = row.get(target).cloned().unwrap_or(Value::Null);
                    columns
                        .iter()
                        .filter(|column| column.as_str() != target)
                        .map(move |column| {
                            let mut record = Record::new();
                            record.insert(target.to_string(), id.clone());
                            record.insert(DEPIVOT_ATTRIBUTE.to_string(), Value::String(column.clone()));
                            record.insert(DEPIVOT_VALUE.to_string(), row.get(column).cloned().unwrap_or(Value::Null));
                            record
                        })
                        .collect::<Vec<_>>()
                })
                .collect();
            let melted_per_row = columns.iter().filter(|column| column.as_str() != target).count();
            let row_count = dataset.row_total() * melted_per_row;
            Ok(EngineOutput {
                rows: melted.into_iter().take(sample_size).collect(),
                columns: with_columns(vec![target.to_string()], &outputs),
                row_count,
                derived_columns: Some(outputs),
            })
        }

        Formula::Filter(op) => {
            let dataset = primary_input(step, inputs, target);
            require_column(dataset, target)?;
            let kept: Vec<&Record> = match op {
                FilterOp::Equals => {
                    let expected = step
                        .parameters
                        .get("equals")
                        .ok_or_else(|| EngineError::MissingParameter("equals".to_string()))?;
                    let expected = text_of(expected);
                    dataset
                        .rows
                        .iter()
                        .filter(|row| row.get(target).and_then(text_of) == expected)
                        .collect()
                }
                FilterOp::RemoveDuplicates => {
                    let mut seen = HashSet::new();
                    dataset
                        .rows
                        .iter()
                        .filter(|row| seen.insert(row.get(target).and_then(text_of)))
                        .collect()
                }
            };
            let out = &outputs[0];
            let rows = kept
                .iter()
                .take(sample_size)
                .map(|row| {
                    let mut new_row = (*row).clone();
                    new_row.insert(out.clone(), row.get(target).cloned().unwrap_or(Value::Null));
                    new_row
                })
                .collect();
            Ok(EngineOutput {
                rows,
                columns: with_columns(dataset_columns(dataset), &outputs),
                row_count: kept.len(),
                derived_columns: Some(outputs),
            })
        }

        Formula::Lookup => lookup(step, inputs, target, outputs, sample_size),
    }
}

fn string_parameter<'a>(parameters: &'a Record, name: &str) -> Result<&'a str, EngineError> {
    parameters
        .get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| EngineError::MissingParameter(name.to_string()))
}

fn lookup(
    step: &WorkflowStep,
    inputs: &[Arc<SourceDataset>],
    target: &str,
    outputs: Vec<String>,
    sample_size: usize,
) -> Result<EngineOutput, EngineError> {
    let lookup_file = string_parameter(&step.parameters, "lookup_file")?;
    let key_column = string_parameter(&step.parameters, "key_column")?;
    let return_column = string_parameter(&step.parameters, "return_column")?;

    let table = inputs
        .iter()
        .find(|d| d.name == lookup_file)
        .ok_or_else(|| EngineError::InvalidParameter {
            name: "lookup_file".to_string(),
            reason: format!("no imported file named {}", lookup_file),
        })?;
    require_column(table, key_column)?;

    let dataset = step
        .column_reference
        .as_ref()
        .and_then(|r| inputs.iter().find(|d| d.name == r.file_name))
        .or_else(|| inputs.iter().find(|d| d.name != lookup_file && d.has_column(target)))
        .ok_or_else(|| EngineError::UnknownColumn {
            column: target.to_string(),
            dataset: "any imported file".to_string(),
        })?;

    let mut index: HashMap<String, Value> = HashMap::new();
    for row in table.rows.iter() {
        if let Some(key) = row.get(key_column).and_then(text_of) {
            index
                .entry(key)
                .or_insert_with(|| row.get(return_column).cloned().unwrap_or(Value::Null));
        }
    }

    let out = &outputs[0];
    let rows = dataset
        .rows
        .iter()
        .take(sample_size)
        .map(|row| {
            let mut new_row = row.clone();
            let found = row
                .get(target)
                .and_then(text_of)
                .and_then(|key| index.get(&key).cloned())
                .unwrap_or(Value::Null);
            new_row.insert(out.clone(), found);
            new_row
        })
        .collect();

    Ok(EngineOutput {
        rows,
        columns: with_columns(dataset_columns(dataset), &outputs),
        row_count: dataset.row_total(),
        derived_columns: Some(outputs),
    })
}

fn select_column(step: &WorkflowStep, inputs: &[Arc<SourceDataset>], sample_size: usize) -> Result<EngineOutput, EngineError> {
    let column = step
        .column_reference
        .as_ref()
        .map(|r| r.column_name.as_str())
        .unwrap_or(step.source.as_str());

    let dataset = step
        .column_reference
        .as_ref()
        .and_then(|r| inputs.iter().find(|d| d.name == r.file_name))
        .or_else(|| inputs.iter().find(|d| d.has_column(column)))
        .ok_or_else(|| EngineError::UnknownColumn {
            column: column.to_string(),
            dataset: step
                .column_reference
                .as_ref()
                .map(|r| r.file_name.clone())
                .unwrap_or_else(|| "any imported file".to_string()),
        })?;
    require_column(dataset, column)?;

    let rows = dataset
        .rows
        .iter()
        .take(sample_size)
        .map(|row| {
            let mut record = Record::new();
            record.insert(column.to_string(), row.get(column).cloned().unwrap_or(Value::Null));
            record
        })
        .collect();

    Ok(EngineOutput {
        rows,
        columns: vec![column.to_string()],
        row_count: dataset.row_total(),
        derived_columns: Some(vec![column.to_string()]),
    })
}

/// Right-hand side of a numeric formula: another column or a constant.
#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Column(String),
    Constant(f64),
}

impl Operand {
    fn from_parameters(parameters: &Record, dataset: &SourceDataset) -> Result<Self, EngineError> {
        match parameters.get("operand") {
            None => Err(EngineError::MissingParameter("operand".to_string())),
            Some(Value::Number(n)) => n.as_f64().map(Operand::Constant).ok_or_else(|| EngineError::InvalidParameter {
                name: "operand".to_string(),
                reason: "not a finite number".to_string(),
            }),
            Some(Value::String(s)) if dataset.has_column(s) => Ok(Operand::Column(s.clone())),
            Some(Value::String(s)) => s.trim().parse::<f64>().map(Operand::Constant).map_err(|_| {
                EngineError::InvalidParameter {
                    name: "operand".to_string(),
                    reason: format!("{} is neither a column nor a number", s),
                }
            }),
            Some(other) => Err(EngineError::InvalidParameter {
                name: "operand".to_string(),
                reason: format!("unsupported value {}", other),
            }),
        }
    }

    fn resolve(&self, row: &Record) -> Option<f64> {
        match self {
            Operand::Column(column) => row.get(column).and_then(number_of),
            Operand::Constant(c) => Some(*c),
        }
    }
}
