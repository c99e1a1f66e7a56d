//! Spreadsheet input and report output.
//!
//! Input rows carry the account in column D and the password in column E; there is no
//! header row, every row is a credential.
use std::fs;
use std::path::{Path, PathBuf};

use calamine::{open_workbook_auto, Data, Reader};
use rust_xlsxwriter::{Workbook, XlsxError};
use thiserror::Error;

use crate::store::is_result_file;
use crate::types::{format_kbps, format_secs, Credential, ProbeOutcome};

pub const ACCOUNT_COLUMN: usize = 3;
pub const SECRET_COLUMN: usize = 4;

pub const REPORT_SHEET: &str = "results";
pub const REPORT_HEADERS: [&str; 12] = [
    "No.",
    "Tested At",
    "Account",
    "Password",
    "Proxy Host",
    "Proxy Port",
    "Proxy IP",
    "Status",
    "Response Time",
    "Download Speed",
    "Total Time",
    "Note",
];

const SPREADSHEET_EXTENSIONS: &[&str] = &["xlsx", "xlsm", "xls", "ods"];

#[derive(Debug, Error)]
pub enum TabularError {
    #[error("input file not found: {0}")]
    NotFound(PathBuf),
    #[error("unsupported input file type: {0}")]
    Unsupported(PathBuf),
    #[error("failed to read spreadsheet {path}: {source}")]
    Spreadsheet {
        path: PathBuf,
        #[source]
        source: calamine::Error,
    },
    #[error("spreadsheet {0} has no sheets")]
    NoSheet(PathBuf),
    #[error("failed to read csv {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("failed to write report {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: XlsxError,
    },
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

pub fn is_supported_input(path: &Path) -> bool {
    match extension(path) {
        Some(ext) => ext == "csv" || SPREADSHEET_EXTENSIONS.contains(&ext.as_str()),
        None => false,
    }
}

/// Load every row of `path` as a credential, in file order.
pub fn load_credentials(path: &Path) -> Result<Vec<Credential>, TabularError> {
    if !path.exists() {
        return Err(TabularError::NotFound(path.to_path_buf()));
    }
    match extension(path).as_deref() {
        Some("csv") => load_csv(path),
        Some(ext) if SPREADSHEET_EXTENSIONS.contains(&ext) => load_spreadsheet(path),
        _ => Err(TabularError::Unsupported(path.to_path_buf())),
    }
}

fn load_spreadsheet(path: &Path) -> Result<Vec<Credential>, TabularError> {
    let spreadsheet_err = |source| TabularError::Spreadsheet {
        path: path.to_path_buf(),
        source,
    };
    let mut workbook = open_workbook_auto(path).map_err(spreadsheet_err)?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| TabularError::NoSheet(path.to_path_buf()))?
        .map_err(spreadsheet_err)?;

    let (Some((first_row, _)), Some((last_row, _))) = (range.start(), range.end()) else {
        return Ok(Vec::new());
    };
    let cell = |row: u32, col: usize| -> String {
        range
            .get_value((row, col as u32))
            .map(cell_text)
            .unwrap_or_default()
    };
    Ok((first_row..=last_row)
        .enumerate()
        .map(|(i, row)| Credential::new(i, cell(row, ACCOUNT_COLUMN), cell(row, SECRET_COLUMN)))
        .collect())
}

/// Numbers typed into a sheet come back as floats; `13800138000.0` must read as `13800138000`.
fn cell_text(data: &Data) -> String {
    match data {
        Data::Empty | Data::Error(_) => String::new(),
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
        other => other.to_string(),
    }
}

fn load_csv(path: &Path) -> Result<Vec<Credential>, TabularError> {
    let csv_err = |source| TabularError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(csv_err)?;
    let mut out = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record = record.map_err(csv_err)?;
        out.push(Credential::new(
            i,
            record.get(ACCOUNT_COLUMN).unwrap_or(""),
            record.get(SECRET_COLUMN).unwrap_or(""),
        ));
    }
    Ok(out)
}

/// Write one report sheet: fixed header row, one row per outcome, columns sized to content.
pub fn write_outcomes(rows: &[ProbeOutcome], path: &Path) -> Result<(), TabularError> {
    build_workbook(rows, path).map_err(|source| TabularError::Write {
        path: path.to_path_buf(),
        source,
    })
}

fn build_workbook(rows: &[ProbeOutcome], path: &Path) -> Result<(), XlsxError> {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name(REPORT_SHEET)?;

    for (col, header) in REPORT_HEADERS.iter().enumerate() {
        sheet.write_string(0, col as u16, *header)?;
    }

    for (i, o) in rows.iter().enumerate() {
        let row = (i + 1) as u32;
        sheet.write_number(row, 0, (o.sequence_index + 1) as f64)?;
        sheet.write_string(row, 1, o.timestamp.as_str())?;
        sheet.write_string(row, 2, o.account.as_str())?;
        sheet.write_string(row, 3, o.secret.as_str())?;
        sheet.write_string(row, 4, o.proxy_host.as_str())?;
        sheet.write_string(row, 5, o.proxy_port.to_string())?;
        if let Some(ip) = &o.resolved_ip {
            sheet.write_string(row, 6, ip.as_str())?;
        }
        sheet.write_string(row, 7, o.status.as_str())?;
        if let Some(v) = o.response_time_secs {
            sheet.write_string(row, 8, format_secs(v))?;
        }
        if let Some(v) = o.download_speed_kbps {
            sheet.write_string(row, 9, format_kbps(v))?;
        }
        if let Some(v) = o.total_time_secs {
            sheet.write_string(row, 10, format_secs(v))?;
        }
        sheet.write_string(row, 11, o.note.as_str())?;
    }

    sheet.autofit();
    workbook.save(path)?;
    Ok(())
}

/// Candidate input files in `dir`, excluding reports this tool produced.
pub fn find_input_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_file() && is_supported_input(p) && !is_result_file(p))
        .collect();
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_text_drops_integral_fraction() {
        assert_eq!(cell_text(&Data::Float(13800138000.0)), "13800138000");
        assert_eq!(cell_text(&Data::Float(1.5)), "1.5");
        assert_eq!(cell_text(&Data::Int(42)), "42");
        assert_eq!(cell_text(&Data::String("abc".into())), "abc");
        assert_eq!(cell_text(&Data::Empty), "");
    }

    #[test]
    fn supported_inputs() {
        assert!(is_supported_input(Path::new("a.xlsx")));
        assert!(is_supported_input(Path::new("a.XLS")));
        assert!(is_supported_input(Path::new("a.csv")));
        assert!(!is_supported_input(Path::new("a.txt")));
        assert!(!is_supported_input(Path::new("noext")));
    }

    #[test]
    fn missing_file_is_reported() {
        let err = load_credentials(Path::new("/definitely/not/here.xlsx")).unwrap_err();
        assert!(matches!(err, TabularError::NotFound(_)));
    }
}
