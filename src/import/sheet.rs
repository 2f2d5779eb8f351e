//! Reading import sheets from CSV.

use crate::error::ImportError;
use crate::import::row::ImportRow;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Read every data row. Row 1 holds the headers, so the first data row is numbered 2.
pub fn read_rows<R: Read>(reader: R, delimiter: u8) -> Result<Vec<ImportRow>, ImportError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);
    let headers = reader.headers()?.clone();

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record?;
        let row = ImportRow::new(index + 2, headers.iter().zip(record.iter()));
        if row.columns().next().is_none() {
            log::trace!("row {}: blank, skipped", row.number);
            continue;
        }
        rows.push(row);
    }
    log::debug!("read {} rows with {} columns", rows.len(), headers.len());
    Ok(rows)
}

pub fn read_sheet(path: &Path, delimiter: u8) -> Result<Vec<ImportRow>, ImportError> {
    let file = File::open(path)?;
    read_rows(file, delimiter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_are_numbered_from_two_and_blank_rows_skipped() {
        let data = "Contact Email,Contact Last Name\n a@x.com ,Doe\n,\nb@x.com,Roe\n";
        let rows = read_rows(data.as_bytes(), b',').unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].number, 2);
        assert_eq!(rows[0].emails, vec!["a@x.com".to_string()]);
        assert_eq!(rows[1].number, 4);
    }

    #[test]
    fn test_short_records_are_accepted() {
        let data = "Account Name;Account Phone\nAcme\n";
        let rows = read_rows(data.as_bytes(), b';').unwrap();
        assert_eq!(rows[0].account_name(), Some("Acme"));
        assert_eq!(rows[0].value("Account Phone"), None);
    }
}
