pub mod reader;
pub mod utils;

#[cfg(test)]
pub(crate) mod fixtures;

pub use reader::{decode_workbook, WorkbookTable};
