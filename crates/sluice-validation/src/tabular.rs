//! Structural inspection of tabular files
//!
//! Delimited text is parsed with a small quote-aware reader (RFC 4180
//! quoting, fields may span lines). Binary table formats are recognised by
//! their magic bytes only; their rows are not counted.

use serde::Serialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

const DELIMITER_CANDIDATES: [char; 4] = [',', '\t', ';', '|'];

/// Data rows checked before the row count becomes a lower bound
pub const FORMAT_SCAN_ROWS: u64 = 100_000;

/// Binary table formats: (extension, magic prefix, display name)
const BINARY_FORMATS: &[(&str, &[u8], &str)] = &[
    ("parquet", b"PAR1", "parquet"),
    ("feather", b"ARROW1", "feather"),
    ("arrow", b"ARROW1", "arrow"),
    ("xlsx", b"PK\x03\x04", "xlsx"),
    ("xls", b"\xD0\xCF\x11\xE0", "xls"),
];

/// What was learned about a tabular file
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TabularSummary {
    pub format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delimiter: Option<char>,
    /// Data rows, excluding the header
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<u64>,
    /// Scanning stopped early; `rows` is a lower bound
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub rows_truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<usize>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub header: Vec<String>,
}

/// Why a file failed the tabular check, phrased for an end user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatProblem {
    pub reason: String,
    pub suggestion: String,
}

impl FormatProblem {
    fn new(reason: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            suggestion: suggestion.into(),
        }
    }
}

/// Check that `path` holds a table
///
/// `prefix` is the first bytes of the file, already read by the caller.
/// Delimited files are read up to [`FORMAT_SCAN_ROWS`] data rows.
pub fn inspect_tabular(path: &Path, prefix: &[u8]) -> Result<TabularSummary, FormatProblem> {
    inspect_tabular_rows(path, prefix, FORMAT_SCAN_ROWS)
}

fn inspect_tabular_rows(
    path: &Path,
    prefix: &[u8],
    max_rows: u64,
) -> Result<TabularSummary, FormatProblem> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    if let Some((_, magic, name)) = BINARY_FORMATS.iter().find(|(ext, _, _)| *ext == extension) {
        if !prefix.starts_with(magic) {
            return Err(FormatProblem::new(
                format!("the file has a .{} extension but is not a valid {} file", extension, name),
                "re-export the file from its source application and upload it again",
            ));
        }
        return Ok(TabularSummary {
            format: name.to_string(),
            delimiter: None,
            rows: None,
            rows_truncated: false,
            columns: None,
            header: Vec::new(),
        });
    }

    if prefix.contains(&0) {
        return Err(FormatProblem::new(
            "the file is binary, not delimited text",
            "export the data as CSV and upload it again",
        ));
    }

    let first_line = String::from_utf8_lossy(prefix)
        .lines()
        .find(|line| !line.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_default();
    let delimiter = detect_delimiter(&first_line);

    let file = File::open(path).map_err(|e| {
        FormatProblem::new(
            format!("the file could not be reopened: {}", e),
            "check the file permissions and try again",
        )
    })?;

    let mut records = DelimitedReader::new(BufReader::new(file), delimiter);
    let header = match records.next() {
        Some(Ok(header)) => header,
        Some(Err(e)) => return Err(unreadable_text(e)),
        None => {
            return Err(FormatProblem::new(
                "the file contains no rows",
                "upload a file with a header row and at least one data row",
            ))
        }
    };

    let columns = header.len();
    let mut rows = 0u64;
    let mut rows_truncated = false;
    for record in records {
        if rows >= max_rows {
            rows_truncated = true;
            break;
        }
        let record = record.map_err(unreadable_text)?;
        rows += 1;
        if record.len() != columns {
            return Err(FormatProblem::new(
                format!(
                    "data row {} has {} field(s) but the header has {}",
                    rows,
                    record.len(),
                    columns
                ),
                "fix the row (check for unquoted delimiters) or export the file again",
            ));
        }
    }

    if rows == 0 {
        return Err(FormatProblem::new(
            "the file has a header but no data rows",
            "upload a file with at least one data row",
        ));
    }

    let format = match (extension.as_str(), delimiter) {
        ("tsv", _) | (_, '\t') => "tsv",
        _ => "csv",
    };

    Ok(TabularSummary {
        format: format.to_string(),
        delimiter: Some(delimiter),
        rows: Some(rows),
        rows_truncated,
        columns: Some(columns),
        header: header.into_iter().map(|h| h.trim().to_string()).collect(),
    })
}

fn unreadable_text(e: std::io::Error) -> FormatProblem {
    FormatProblem::new(
        format!("the file is not valid UTF-8 text ({})", e),
        "save the file as UTF-8 CSV and upload it again",
    )
}

/// Pick the candidate delimiter occurring most often outside quotes
///
/// A line with none of them is a single-column file; `,` is returned.
pub fn detect_delimiter(line: &str) -> char {
    let mut counts = [0usize; DELIMITER_CANDIDATES.len()];
    let mut in_quotes = false;
    for c in line.chars() {
        if c == '"' {
            in_quotes = !in_quotes;
        } else if !in_quotes {
            if let Some(i) = DELIMITER_CANDIDATES.iter().position(|d| *d == c) {
                counts[i] += 1;
            }
        }
    }

    let mut best = 0;
    for i in 1..counts.len() {
        if counts[i] > counts[best] {
            best = i;
        }
    }
    DELIMITER_CANDIDATES[best]
}

/// Streaming reader yielding one record (list of fields) at a time
///
/// Blank lines between records are skipped. A quoted field may contain the
/// delimiter, doubled quotes, and line breaks.
pub struct DelimitedReader<R> {
    reader: R,
    delimiter: char,
    line: String,
}

impl<R: BufRead> DelimitedReader<R> {
    pub fn new(reader: R, delimiter: char) -> Self {
        Self {
            reader,
            delimiter,
            line: String::new(),
        }
    }
}

impl<R: BufRead> Iterator for DelimitedReader<R> {
    type Item = std::io::Result<Vec<String>>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut fields = Vec::new();
        let mut field = String::new();
        let mut in_quotes = false;
        let mut in_record = false;

        loop {
            self.line.clear();
            match self.reader.read_line(&mut self.line) {
                Ok(0) => {
                    if !in_record {
                        return None;
                    }
                    // Unterminated quote at end of input
                    fields.push(field);
                    return Some(Ok(fields));
                }
                Ok(_) => {}
                Err(e) => return Some(Err(e)),
            }

            let line = self.line.trim_end_matches(['\n', '\r']);
            if !in_record && line.trim().is_empty() {
                continue;
            }
            in_record = true;

            let mut chars = line.chars().peekable();
            while let Some(c) = chars.next() {
                if in_quotes {
                    if c == '"' {
                        if chars.peek() == Some(&'"') {
                            field.push('"');
                            chars.next();
                        } else {
                            in_quotes = false;
                        }
                    } else {
                        field.push(c);
                    }
                } else if c == '"' {
                    in_quotes = true;
                } else if c == self.delimiter {
                    fields.push(std::mem::take(&mut field));
                } else {
                    field.push(c);
                }
            }

            if in_quotes {
                field.push('\n');
                continue;
            }
            fields.push(field);
            return Some(Ok(fields));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn records(text: &str, delimiter: char) -> Vec<Vec<String>> {
        DelimitedReader::new(Cursor::new(text), delimiter)
            .map(|r| r.unwrap())
            .collect()
    }

    fn inspect(dir: &TempDir, name: &str, content: &[u8]) -> Result<TabularSummary, FormatProblem> {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        inspect_tabular(&path, &content[..content.len().min(4096)])
    }

    #[test]
    fn test_reader_handles_quotes_and_multiline_fields() {
        let parsed = records("a,b\n\"x, y\",\"say \"\"hi\"\"\"\n\"line1\nline2\",3\n\n", ',');
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[1], vec!["x, y", "say \"hi\""]);
        assert_eq!(parsed[2], vec!["line1\nline2", "3"]);
    }

    #[test]
    fn test_reader_handles_crlf() {
        let parsed = records("a;b\r\n1;2\r\n", ';');
        assert_eq!(parsed, vec![vec!["a", "b"], vec!["1", "2"]]);
    }

    #[test]
    fn test_detect_delimiter() {
        assert_eq!(detect_delimiter("region,units,price"), ',');
        assert_eq!(detect_delimiter("region\tunits\tprice"), '\t');
        assert_eq!(detect_delimiter("region;units;\"a,b,c\""), ';');
        assert_eq!(detect_delimiter("single"), ',');
    }

    #[test]
    fn test_csv_counts_rows_and_columns() {
        let dir = TempDir::new().unwrap();
        let summary = inspect(&dir, "sales.csv", b"region,units\nnorth,3\nsouth,5\n").unwrap();
        assert_eq!(summary.format, "csv");
        assert_eq!(summary.rows, Some(2));
        assert_eq!(summary.columns, Some(2));
        assert_eq!(summary.header, vec!["region", "units"]);
    }

    #[test]
    fn test_row_scan_stops_at_limit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.csv");
        // Row 4 is ragged but lies past the scan limit
        let content = b"a,b\n1,2\n3,4\n5,6\n7\n";
        std::fs::write(&path, content).unwrap();

        let summary = inspect_tabular_rows(&path, content, 3).unwrap();
        assert_eq!(summary.rows, Some(3));
        assert!(summary.rows_truncated);

        let full = inspect_tabular_rows(&path, content, 10).unwrap_err();
        assert!(full.reason.contains("data row 4"));
    }

    #[test]
    fn test_ragged_row_is_rejected() {
        let dir = TempDir::new().unwrap();
        let problem = inspect(&dir, "bad.csv", b"a,b\n1,2\n3\n").unwrap_err();
        assert!(problem.reason.contains("data row 2"));
    }

    #[test]
    fn test_header_only_is_rejected() {
        let dir = TempDir::new().unwrap();
        let problem = inspect(&dir, "empty.csv", b"a,b\n").unwrap_err();
        assert!(problem.reason.contains("no data rows"));
    }

    #[test]
    fn test_binary_formats_checked_by_magic() {
        let dir = TempDir::new().unwrap();
        let summary = inspect(&dir, "t.parquet", b"PAR1....PAR1").unwrap();
        assert_eq!(summary.format, "parquet");
        assert_eq!(summary.rows, None);

        let problem = inspect(&dir, "fake.xlsx", b"region,units\n").unwrap_err();
        assert!(problem.reason.contains(".xlsx"));
    }

    #[test]
    fn test_binary_bytes_in_text_file_are_rejected() {
        let dir = TempDir::new().unwrap();
        let problem = inspect(&dir, "blob.csv", b"\x00\x01\x02").unwrap_err();
        assert!(problem.reason.contains("binary"));
    }
}
