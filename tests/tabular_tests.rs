use proxy_audit::tabular::{find_input_files, load_credentials, TabularError};
use rust_xlsxwriter::Workbook;

#[test]
fn loads_xlsx_columns_d_and_e_without_header() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("accounts.xlsx");

    let mut wb = Workbook::new();
    let sheet = wb.add_worksheet();
    sheet.write_string(0, 0, "row-a").unwrap();
    sheet.write_number(0, 3, 13800138000.0).unwrap();
    sheet.write_string(0, 4, "secret0").unwrap();
    sheet.write_string(1, 0, "row-b").unwrap();
    sheet.write_string(1, 3, " spaced ").unwrap();
    sheet.write_number(2, 0, 3.0).unwrap();
    sheet.write_string(2, 3, "user2").unwrap();
    sheet.write_string(2, 4, "pw2").unwrap();
    wb.save(&path).unwrap();

    let creds = load_credentials(&path).unwrap();
    assert_eq!(creds.len(), 3);
    assert_eq!(creds[0].sequence_index, 0);
    assert_eq!(creds[0].account, "13800138000");
    assert_eq!(creds[0].secret, "secret0");
    assert_eq!(creds[1].account, "spaced");
    assert!(!creds[1].is_valid(), "missing password");
    assert_eq!(creds[2].sequence_index, 2);
    assert!(creds[2].is_valid());
}

#[test]
fn loads_short_csv_rows_as_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("accounts.csv");
    std::fs::write(&path, "x,y,z,alice,pw\nx,y\nx,y,z,bob,pw2,extra\n").unwrap();

    let creds = load_credentials(&path).unwrap();
    assert_eq!(creds.len(), 3);
    assert!(creds[0].is_valid());
    assert!(!creds[1].is_valid());
    assert_eq!(creds[2].account, "bob");
    assert_eq!(creds[2].secret, "pw2");
}

#[test]
fn unsupported_extension_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("accounts.txt");
    std::fs::write(&path, "nope").unwrap();
    assert!(matches!(load_credentials(&path), Err(TabularError::Unsupported(_))));
}

#[test]
fn input_listing_skips_reports_and_other_files() {
    let dir = tempfile::tempdir().unwrap();
    for name in ["b.xlsx", "a.csv", "a_result_20240101_000000_000.xlsx", "notes.txt", "c.xls"] {
        std::fs::write(dir.path().join(name), b"").unwrap();
    }
    let names: Vec<String> = find_input_files(dir.path())
        .unwrap()
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["a.csv", "b.xlsx", "c.xls"]);
}
