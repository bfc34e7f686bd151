use crate::models::TickerRecord;
use anyhow::{Context, Result};
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Writes a header row of `fields` followed by one row per record. Absent
/// values are written as empty strings.
pub fn write_csv<W: Write>(records: &[TickerRecord], fields: &[&str], writer: W) -> Result<()> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer
        .write_record(fields)
        .context("failed to write CSV header")?;

    for record in records {
        let row: Vec<String> = fields
            .iter()
            .map(|field| record.raw_value(field).unwrap_or_default())
            .collect();
        csv_writer
            .write_record(&row)
            .context("failed to write CSV row")?;
    }

    csv_writer.flush().context("failed to flush CSV output")?;
    Ok(())
}

pub fn export_to_path(records: &[TickerRecord], fields: &[&str], path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    write_csv(records, fields, file).with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TICKER_FIELDS;

    #[test]
    fn writes_header_and_blank_missing_fields() {
        let records = vec![
            TickerRecord {
                ticker: Some("ZWS".to_string()),
                name: Some("Zurn Elkay Water Solutions Corporation".to_string()),
                active: Some(true),
                last_updated_utc: Some("2025-09-11T06:11:10.586204443Z".to_string()),
                data_date: "2025-09-25".to_string(),
                ..TickerRecord::default()
            },
            TickerRecord {
                ticker: Some("A, B".to_string()),
                ..TickerRecord::default()
            },
        ];

        let mut output = Vec::new();
        write_csv(&records, &TICKER_FIELDS, &mut output).expect("csv should be written");
        let text = String::from_utf8(output).expect("csv is utf-8");
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(
            lines[0],
            "ticker,name,market,locale,primary_exchange,type,active,currency_name,cik,composite_figi,share_class_figi,last_updated_utc,data_date"
        );
        assert_eq!(
            lines[1],
            "ZWS,Zurn Elkay Water Solutions Corporation,,,,,true,,,,,2025-09-11T06:11:10.586204443Z,2025-09-25"
        );
        assert_eq!(lines[2], "\"A, B\",,,,,,,,,,,,");
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn empty_result_set_writes_header_only() {
        let mut output = Vec::new();
        write_csv(&[], &["ticker", "name"], &mut output).expect("csv should be written");
        assert_eq!(String::from_utf8(output).unwrap(), "ticker,name\n");
    }
}
