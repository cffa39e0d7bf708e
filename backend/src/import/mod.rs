//! Reads employee rows out of a CSV export of the payroll sheet.
//!
//! This is the import boundary of the pipeline: it maps columns to
//! [`EmployeeRecord`] fields according to a [`ColumnMapping`] and does only the
//! cleanup the delivery side depends on (phone and salary normalisation).

use common::model::employee::{ColumnMapping, EmployeeRecord};
use std::collections::BTreeMap;
use std::io::Read;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("invalid column reference '{0}'")]
    InvalidColumn(String),

    #[error("header row {0} is missing")]
    MissingHeader(u32),

    #[error("data must start after the header row")]
    InvalidRows,

    #[error("cannot read CSV: {0}")]
    Csv(#[from] csv::Error),
}

/// `A` -> 0, `Z` -> 25, `AA` -> 26.
pub fn column_index(letters: &str) -> Result<usize, ImportError> {
    let letters = letters.trim();
    if letters.is_empty() || !letters.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(ImportError::InvalidColumn(letters.to_string()));
    }
    let invalid = || ImportError::InvalidColumn(letters.to_string());
    let mut index = 0usize;
    for c in letters.chars() {
        let digit = c.to_ascii_uppercase() as usize - 'A' as usize + 1;
        index = index
            .checked_mul(26)
            .and_then(|i| i.checked_add(digit))
            .ok_or_else(invalid)?;
    }
    Ok(index - 1)
}

fn normalize_cell(cell: &str) -> String {
    let s = cell.trim();
    let s = s
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| s.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
        .unwrap_or(s);
    s.replace('\u{00A0}', " ").trim().to_string()
}

/// Header title -> field key: lower case, inner whitespace as `_`.
fn field_key(title: &str) -> String {
    normalize_cell(title)
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

/// Drops spaces, dashes and dots; restores the leading zero that spreadsheets
/// strip from 9-digit numbers.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let phone: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-' && *c != '.')
        .collect();
    if phone.is_empty() {
        return None;
    }
    if phone.len() == 9 && phone.chars().all(|c| c.is_ascii_digit()) {
        return Some(format!("0{}", phone));
    }
    Some(phone)
}

/// `12,500,000 VND` -> 12500000.
///
/// `,` and `.` are thousands separators when every group after them has three
/// digits. Otherwise the last one is a decimal point and the fraction is
/// truncated: `12.5` -> 12, `1,234.56` -> 1234.
pub fn parse_salary(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    let trimmed = trimmed
        .strip_suffix("VND")
        .or_else(|| trimmed.strip_suffix("vnd"))
        .unwrap_or(trimmed)
        .trim();
    let integer_part = match trimmed.rfind([',', '.']) {
        Some(pos) if trimmed[pos + 1..].chars().filter(char::is_ascii_digit).count() != 3 => {
            &trimmed[..pos]
        }
        _ => trimmed,
    };
    let digits: String = integer_part
        .chars()
        .filter(|c| !matches!(c, ',' | '.' | ' ' | '\u{00A0}'))
        .collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse::<i64>().ok()
}

/// Reads the sheet rows into employee records, in sheet order.
///
/// Reading stops at the first data row with an empty name column.
pub fn read_employees<R: Read>(
    reader: R,
    mapping: &ColumnMapping,
    session_id: Uuid,
) -> Result<Vec<EmployeeRecord>, ImportError> {
    if mapping.header_row == 0 || mapping.data_start_row <= mapping.header_row {
        return Err(ImportError::InvalidRows);
    }
    let code_col = column_index(&mapping.code_column)?;
    let name_col = column_index(&mapping.name_column)?;
    let phone_col = column_index(&mapping.phone_column)?;
    let salary_col = column_index(&mapping.salary_column)?;

    let mut csv = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);

    let mut titles: Option<Vec<String>> = None;
    let mut employees = Vec::new();

    for (idx, record) in csv.records().enumerate() {
        let record = record?;
        let row_number = idx as u32 + 1;
        let cell = |col: usize| record.get(col).map(normalize_cell).unwrap_or_default();

        if row_number == mapping.header_row {
            titles = Some(record.iter().map(field_key).collect());
            continue;
        }
        if row_number < mapping.data_start_row {
            continue;
        }
        let Some(titles) = titles.as_ref() else {
            return Err(ImportError::MissingHeader(mapping.header_row));
        };

        let name = cell(name_col);
        if name.is_empty() {
            break;
        }

        let fields: BTreeMap<String, String> = titles
            .iter()
            .enumerate()
            .filter(|(_, title)| !title.is_empty())
            .map(|(col, title)| (title.clone(), cell(col)))
            .collect();
        let code = Some(cell(code_col)).filter(|c| !c.is_empty());

        employees.push(EmployeeRecord {
            id: Uuid::new_v4(),
            session_id,
            row_number,
            code,
            name,
            phone: normalize_phone(&cell(phone_col)),
            salary: parse_salary(&cell(salary_col)),
            fields,
            last_sent_at: None,
            delivery_status: None,
        });
    }

    if titles.is_none() {
        return Err(ImportError::MissingHeader(mapping.header_row));
    }
    Ok(employees)
}
