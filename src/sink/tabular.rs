use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use chrono::Local;
use rust_xlsxwriter::Workbook;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{render_path, Sink, WriteSummary};
use crate::error::SinkError;
use crate::model::{CombinedRecord, SCORE_FIELDS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TabularFormat {
    Csv,
    Tsv,
    Json,
    Excel,
}

impl TabularFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Tsv => "tsv",
            Self::Json => "json",
            Self::Excel => "excel",
        }
    }
}

/// One cell of a flat export row.
#[derive(Debug, Clone, PartialEq)]
enum Cell {
    Text(String),
    Number(f64),
    Empty,
}

impl Cell {
    fn text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Number(n) => n.to_string(),
            Self::Empty => String::new(),
        }
    }

    fn json(&self) -> Value {
        match self {
            Self::Text(s) => Value::String(s.clone()),
            Self::Number(n) => serde_json::Number::from_f64(*n).map_or(Value::Null, Value::Number),
            Self::Empty => Value::Null,
        }
    }
}

/// Column names of the flat layout, in order.
pub fn columns() -> Vec<&'static str> {
    let mut cols = vec!["rank", "name", "country", "detail_url"];
    cols.extend(SCORE_FIELDS);
    cols.extend([
        "score_category",
        "detail_missing",
        "detail_name",
        "key_stats",
        "subject_count",
        "subjects",
        "extra",
    ]);
    cols
}

fn flatten(record: &CombinedRecord) -> Result<Vec<Cell>, SinkError> {
    let entry = &record.ranking;
    let mut row = vec![
        Cell::Number(f64::from(entry.rank)),
        Cell::Text(entry.name.clone()),
        Cell::Text(entry.country.clone()),
        Cell::Text(entry.detail_url.clone()),
    ];
    row.extend(
        entry
            .scores
            .fields()
            .iter()
            .map(|(_, score)| score.map_or(Cell::Empty, Cell::Number)),
    );
    row.push(record.score_category.map_or(Cell::Empty, |c| Cell::Text(c.as_str().to_string())));
    row.push(Cell::Text(record.detail_missing.to_string()));

    match &record.detail {
        Some(detail) => {
            row.push(detail.name.clone().map_or(Cell::Empty, Cell::Text));
            row.push(Cell::Text(serde_json::to_string(&detail.key_stats)?));
            row.push(Cell::Number(detail.subjects.len() as f64));
            row.push(Cell::Text(serde_json::to_string(&detail.subjects)?));
            row.push(Cell::Text(serde_json::to_string(&detail.extra)?));
        }
        None => row.extend([Cell::Empty, Cell::Empty, Cell::Number(0.0), Cell::Empty, Cell::Empty]),
    }
    Ok(row)
}

/// Flat export of combined records: csv, tsv, json rows, or an xlsx workbook.
pub struct TabularSink {
    format: TabularFormat,
    path: String,
    delimiter: char,
    required: bool,
}

impl TabularSink {
    pub fn new(format: TabularFormat, path: impl Into<String>, required: bool) -> Self {
        let delimiter = if format == TabularFormat::Tsv { '\t' } else { ',' };
        Self {
            format,
            path: path.into(),
            delimiter,
            required,
        }
    }

    pub fn with_delimiter(mut self, delimiter: char) -> Self {
        self.delimiter = delimiter;
        self
    }

    fn write_delimited(&self, path: &Path, rows: &[Vec<Cell>]) -> Result<(), SinkError> {
        let mut out = BufWriter::new(File::create(path)?);
        let header: Vec<String> = columns().into_iter().map(str::to_string).collect();
        write_row(&mut out, &header, self.delimiter)?;
        for row in rows {
            let cells: Vec<String> = row.iter().map(Cell::text).collect();
            write_row(&mut out, &cells, self.delimiter)?;
        }
        out.flush()?;
        Ok(())
    }

    fn write_json(&self, path: &Path, rows: &[Vec<Cell>]) -> Result<(), SinkError> {
        let cols = columns();
        let objects: Vec<Value> = rows
            .iter()
            .map(|row| {
                let map: Map<String, Value> = cols
                    .iter()
                    .zip(row)
                    .map(|(col, cell)| ((*col).to_string(), cell.json()))
                    .collect();
                Value::Object(map)
            })
            .collect();
        let mut out = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut out, &objects)?;
        out.flush()?;
        Ok(())
    }

    fn write_excel(&self, path: &Path, rows: &[Vec<Cell>]) -> Result<(), SinkError> {
        let xlsx = |e: rust_xlsxwriter::XlsxError| SinkError::WriteIo(e.to_string());
        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet.set_name("Rankings").map_err(xlsx)?;
        for (col, name) in columns().iter().enumerate() {
            sheet.write_string(0, col as u16, *name).map_err(xlsx)?;
        }
        for (i, row) in rows.iter().enumerate() {
            let r = (i + 1) as u32;
            for (col, cell) in row.iter().enumerate() {
                let c = col as u16;
                match cell {
                    Cell::Text(s) => sheet.write_string(r, c, s).map_err(xlsx)?,
                    Cell::Number(n) => sheet.write_number(r, c, *n).map_err(xlsx)?,
                    Cell::Empty => continue,
                };
            }
        }
        workbook.save(path).map_err(xlsx)?;
        Ok(())
    }
}

impl Sink for TabularSink {
    fn name(&self) -> &str {
        self.format.as_str()
    }

    fn required(&self) -> bool {
        self.required
    }

    fn write(&self, records: &[CombinedRecord]) -> Result<WriteSummary, SinkError> {
        let rows = records.iter().map(flatten).collect::<Result<Vec<_>, _>>()?;
        let path = render_path(&self.path, &Local::now())?;
        match self.format {
            TabularFormat::Csv | TabularFormat::Tsv => self.write_delimited(&path, &rows)?,
            TabularFormat::Json => self.write_json(&path, &rows)?,
            TabularFormat::Excel => self.write_excel(&path, &rows)?,
        }
        Ok(WriteSummary {
            rows: rows.len(),
            target: path.display().to_string(),
        })
    }
}

fn needs_quotes(field: &str, sep: char) -> bool {
    field.contains(sep) || field.contains('"') || field.contains('\n') || field.contains('\r')
}

/// Write one delimited row, quoting fields the way RFC 4180 expects.
pub fn write_row<W: Write>(mut w: W, row: &[String], sep: char) -> io::Result<()> {
    let mut first = true;
    for cell in row {
        if !first {
            write!(w, "{}", sep)?;
        } else {
            first = false;
        }
        if needs_quotes(cell, sep) {
            write!(w, "\"{}\"", cell.replace('"', "\"\""))?;
        } else {
            write!(w, "{}", cell)?;
        }
    }
    writeln!(w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::combined;

    fn write(format: TabularFormat, file: &str) -> (tempfile::TempDir, WriteSummary) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(file);
        let sink = TabularSink::new(format, path.to_str().unwrap(), false);
        let mut with_comma = combined(1, "Alpha, \"The\" University", true);
        with_comma.ranking.country = "Chile".into();
        let summary = sink.write(&[with_comma, combined(2, "Beta", false)]).unwrap();
        (dir, summary)
    }

    #[test]
    fn quotes_only_when_needed() {
        let mut buf = Vec::new();
        let row = vec!["plain".to_string(), "a,b".to_string(), "say \"hi\"".to_string()];
        write_row(&mut buf, &row, ',').unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "plain,\"a,b\",\"say \"\"hi\"\"\"\n");

        let mut buf = Vec::new();
        write_row(&mut buf, &row, '\t').unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "plain\ta,b\t\"say \"\"hi\"\"\"\n");
    }

    #[test]
    fn csv_has_header_and_one_line_per_record() {
        let (_dir, summary) = write(TabularFormat::Csv, "out_{timestamp}.csv");
        assert_eq!(summary.rows, 2);
        let text = std::fs::read_to_string(&summary.target).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("rank,name,country,detail_url,overall_score"));
        assert!(lines[1].starts_with("1,\"Alpha, \"\"The\"\" University\",Chile,"));
        assert!(lines[2].contains(",true,"));
    }

    #[test]
    fn tsv_uses_tabs() {
        let (_dir, summary) = write(TabularFormat::Tsv, "out.tsv");
        let text = std::fs::read_to_string(&summary.target).unwrap();
        assert!(text.lines().next().unwrap().starts_with("rank\tname\tcountry"));
    }

    #[test]
    fn json_rows_are_flat_objects() {
        let (_dir, summary) = write(TabularFormat::Json, "out.json");
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&summary.target).unwrap()).unwrap();
        let rows = value.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["rank"], 1.0);
        assert_eq!(rows[1]["detail_missing"], "true");
        assert_eq!(rows[1]["subject_count"], 0.0);
        assert!(rows[1]["key_stats"].is_null());
        assert_eq!(rows[0].as_object().unwrap().len(), columns().len());
    }

    #[test]
    fn excel_workbook_is_written() {
        let (_dir, summary) = write(TabularFormat::Excel, "out.xlsx");
        let meta = std::fs::metadata(&summary.target).unwrap();
        assert!(meta.len() > 0);
    }

    #[test]
    fn flat_row_matches_columns() {
        let row = flatten(&combined(3, "Gamma", true)).unwrap();
        assert_eq!(row.len(), columns().len());
    }
}
