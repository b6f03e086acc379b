use super::utils::{cell_to_value, clean_column_name};
use crate::models::{Record, SheetData};
use bytes::Bytes;
use calamine::{open_workbook_from_rs, Data, Reader, Xlsx};
use std::collections::{BTreeMap, HashSet};
use std::io::Cursor;

/// Every sheet's decoded data plus the name of the sheet rows come from.
#[derive(Debug, Clone, Default)]
pub struct WorkbookTable {
    pub sheet: String,
    pub sheets: BTreeMap<String, SheetData>,
}

impl WorkbookTable {
    pub fn active(&self) -> Option<&SheetData> {
        self.sheets.get(&self.sheet)
    }
}

/// Decodes an XLSX workbook, keeping at most `row_cap` data rows per sheet.
///
/// The first row of each sheet is the header. Rows come from `active_sheet`
/// when it names an existing sheet, otherwise from the first sheet.
pub fn decode_workbook(bytes: &Bytes, active_sheet: Option<&str>, row_cap: usize) -> Result<WorkbookTable, String> {
    let cursor = Cursor::new(bytes.clone());
    let mut workbook: Xlsx<_> = open_workbook_from_rs(cursor)
        .map_err(|e| format!("Failed to open Excel file: {}", e))?;

    let sheet_names = workbook.sheet_names().to_vec();
    tracing::debug!("Decoding {} sheets: {:?}", sheet_names.len(), sheet_names);

    let chosen = active_sheet
        .filter(|name| sheet_names.iter().any(|s| s == name))
        .map(str::to_string)
        .or_else(|| sheet_names.first().cloned())
        .ok_or_else(|| "No sheets found in workbook".to_string())?;

    let mut sheets = BTreeMap::new();
    for sheet_name in &sheet_names {
        match workbook.worksheet_range(sheet_name) {
            Ok(range) => {
                let rows: Vec<Vec<Data>> = range.rows().take(row_cap.saturating_add(1)).map(|row| row.to_vec()).collect();
                let mut sheet = sheet_from_rows(&rows);
                sheet.total_rows += range.rows().skip(rows.len()).filter(|row| !is_blank(row)).count();
                sheets.insert(sheet_name.clone(), sheet);
            }
            Err(e) => {
                tracing::warn!("Failed to read worksheet {}: {}", sheet_name, e);
                if *sheet_name == chosen {
                    return Err(format!("Failed to read worksheet {}: {}", sheet_name, e));
                }
            }
        }
    }

    Ok(WorkbookTable { sheet: chosen, sheets })
}

fn sheet_from_rows(rows: &[Vec<Data>]) -> SheetData {
    let mut existing_names = HashSet::new();
    let columns: Vec<String> = rows
        .first()
        .map(|row| {
            row.iter()
                .map(|cell| clean_column_name(&cell.to_string(), &mut existing_names))
                .collect()
        })
        .unwrap_or_default();

    let records: Vec<Record> = rows
        .iter()
        .skip(1) // Skip header row
        .filter(|row| !is_blank(row))
        .map(|row| {
            columns
                .iter()
                .enumerate()
                .map(|(idx, name)| (name.clone(), row.get(idx).map(cell_to_value).unwrap_or_default()))
                .collect::<Record>()
        })
        .collect();

    SheetData {
        total_rows: records.len(),
        rows: records,
        columns,
    }
}

fn is_blank(row: &[Data]) -> bool {
    row.iter().all(|cell| matches!(cell, Data::Empty))
}
