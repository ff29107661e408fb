//! Splits an import file into header-keyed records.
//!
//! CSV files go through the `csv` crate when the delimiter is a single byte.
//! Longer delimiters fall back to a literal line splitter without quoting.
//! Files named `*.json` hold an array of objects (or `{"rows": [...]}`).

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

/// One data record keyed by lower-cased header name.
pub type RawRecord = BTreeMap<String, String>;

/// Separator used when a JSON array value is flattened into a field.
pub const LIST_SEPARATOR: &str = "|";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseOptions {
    pub delimiter: String,
    pub skip_empty_lines: bool,
    pub max_rows: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Csv,
    Json,
}

impl FileFormat {
    pub fn from_file_name(file_name: &str) -> Self {
        if file_name.to_ascii_lowercase().ends_with(".json") {
            FileFormat::Json
        } else {
            FileFormat::Csv
        }
    }
}

/// Whole-file problems. Any of these rejects the job without persisting rows.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("file is not valid UTF-8")]
    Encoding,
    #[error("file has no header row")]
    MissingHeader,
    #[error("duplicate column '{0}' in header row")]
    DuplicateColumn(String),
    #[error("invalid CSV header: {0}")]
    Header(String),
    #[error("invalid JSON document: {0}")]
    Json(String),
    #[error("file has more than {limit} data rows")]
    TooManyRows { limit: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRecord {
    /// Zero-based position among the file's data records.
    pub index: usize,
    /// The record, or why it could not be read.
    pub fields: Result<RawRecord, String>,
}

impl ParsedRecord {
    pub fn row_number(&self) -> usize {
        self.index + 1
    }
}

/// Turn `\t` style escapes into the character they name.
pub fn resolve_delimiter(delimiter: &str) -> String {
    match delimiter {
        "\\t" => "\t".to_string(),
        "" => ",".to_string(),
        other => other.to_string(),
    }
}

pub fn parse_file(
    bytes: &[u8],
    file_name: &str,
    options: &ParseOptions,
) -> Result<Vec<ParsedRecord>, ParseError> {
    let text = std::str::from_utf8(bytes).map_err(|_| ParseError::Encoding)?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    let raw = match FileFormat::from_file_name(file_name) {
        FileFormat::Json => split_json(text)?,
        FileFormat::Csv => {
            let delimiter = resolve_delimiter(&options.delimiter);
            match delimiter.as_bytes() {
                [byte] => split_csv(text, *byte)?,
                _ => split_literal(text, &delimiter)?,
            }
        }
    };

    collect_records(raw, options)
}

fn collect_records(
    raw: Vec<Result<RawRecord, String>>,
    options: &ParseOptions,
) -> Result<Vec<ParsedRecord>, ParseError> {
    let mut records = Vec::new();

    for (index, fields) in raw.into_iter().enumerate() {
        let fields = match fields {
            Ok(record) if is_blank(&record) => {
                if options.skip_empty_lines {
                    continue;
                }
                Err("record is empty".to_string())
            }
            other => other,
        };

        if records.len() >= options.max_rows as usize {
            return Err(ParseError::TooManyRows {
                limit: options.max_rows,
            });
        }
        records.push(ParsedRecord { index, fields });
    }

    Ok(records)
}

fn is_blank(record: &RawRecord) -> bool {
    record.values().all(|value| value.trim().is_empty())
}

fn normalize_headers<'a>(
    headers: impl Iterator<Item = &'a str>,
) -> Result<Vec<String>, ParseError> {
    let mut normalized: Vec<String> = Vec::new();
    for header in headers {
        let name = header.trim().to_ascii_lowercase();
        if !name.is_empty() && normalized.contains(&name) {
            return Err(ParseError::DuplicateColumn(name));
        }
        normalized.push(name);
    }

    if normalized.iter().all(|name| name.is_empty()) {
        return Err(ParseError::MissingHeader);
    }
    Ok(normalized)
}

fn zip_record<'a>(
    headers: &[String],
    values: impl ExactSizeIterator<Item = &'a str>,
) -> Result<RawRecord, String> {
    if values.len() != headers.len() {
        return Err(format!(
            "expected {} fields, found {}",
            headers.len(),
            values.len()
        ));
    }

    Ok(headers
        .iter()
        .zip(values)
        .filter(|(name, _)| !name.is_empty())
        .map(|(name, value)| (name.clone(), value.trim().to_string()))
        .collect())
}

fn split_csv(text: &str, delimiter: u8) -> Result<Vec<Result<RawRecord, String>>, ParseError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let headers = reader
        .headers()
        .map_err(|err| ParseError::Header(err.to_string()))?
        .clone();
    if headers.is_empty() {
        return Err(ParseError::MissingHeader);
    }
    let headers = normalize_headers(headers.iter())?;

    // The reader drops empty lines on its own; count them from the byte
    // offset each read starts at so they still occupy a row.
    let bytes = text.as_bytes();
    let mut rows = Vec::new();
    let mut record = csv::StringRecord::new();
    loop {
        let start = usize::try_from(reader.position().byte()).unwrap_or(bytes.len());
        let blanks = leading_empty_lines(bytes, start);
        rows.extend((0..blanks).map(|_| Ok(blank_record(&headers))));

        match reader.read_record(&mut record) {
            Ok(true) => {
                let values: Vec<&str> = record.iter().collect();
                rows.push(zip_record(&headers, values.into_iter()));
            }
            Ok(false) => break,
            Err(err) => rows.push(Err(format!("could not read record: {err}"))),
        }
    }

    Ok(rows)
}

/// Number of bare line terminators in `bytes` from `start` on.
fn leading_empty_lines(bytes: &[u8], start: usize) -> usize {
    let mut rest = bytes.get(start..).unwrap_or_default();
    // A record ended by CR leaves the LF of its CRLF for the next read.
    if start > 0 && bytes.get(start - 1) == Some(&b'\r') {
        if let [b'\n', tail @ ..] = rest {
            rest = tail;
        }
    }

    let mut count = 0;
    loop {
        rest = match rest {
            [b'\r', b'\n', tail @ ..] | [b'\n', tail @ ..] | [b'\r', tail @ ..] => tail,
            _ => return count,
        };
        count += 1;
    }
}

fn blank_record(headers: &[String]) -> RawRecord {
    headers
        .iter()
        .filter(|name| !name.is_empty())
        .map(|name| (name.clone(), String::new()))
        .collect()
}

fn split_literal(
    text: &str,
    delimiter: &str,
) -> Result<Vec<Result<RawRecord, String>>, ParseError> {
    let mut lines = text.lines();
    let header_line = lines.next().ok_or(ParseError::MissingHeader)?;
    let headers = normalize_headers(header_line.split(delimiter))?;

    Ok(lines
        .map(|line| {
            if line.trim().is_empty() {
                Ok(blank_record(&headers))
            } else {
                let values: Vec<&str> = line.split(delimiter).collect();
                zip_record(&headers, values.into_iter())
            }
        })
        .collect())
}

fn split_json(text: &str) -> Result<Vec<Result<RawRecord, String>>, ParseError> {
    let document: Value =
        serde_json::from_str(text).map_err(|err| ParseError::Json(err.to_string()))?;

    let rows = match document {
        Value::Array(rows) => rows,
        Value::Object(mut object) => match object.remove("rows") {
            Some(Value::Array(rows)) => rows,
            _ => {
                return Err(ParseError::Json(
                    "expected an array of rows or an object with a \"rows\" array".into(),
                ));
            }
        },
        _ => {
            return Err(ParseError::Json(
                "expected an array of rows or an object with a \"rows\" array".into(),
            ));
        }
    };

    Ok(rows.into_iter().map(json_record).collect())
}

fn json_record(value: Value) -> Result<RawRecord, String> {
    let Value::Object(object) = value else {
        return Err("expected a JSON object".to_string());
    };

    let mut record = RawRecord::new();
    for (key, value) in object {
        let name = key.trim().to_ascii_lowercase();
        let text = json_field(&name, value)?;
        record.insert(name, text);
    }
    Ok(record)
}

fn json_field(name: &str, value: Value) -> Result<String, String> {
    match value {
        Value::Null => Ok(String::new()),
        Value::String(text) => Ok(text.trim().to_string()),
        Value::Bool(flag) => Ok(flag.to_string()),
        Value::Number(number) => Ok(number.to_string()),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Array(_) | Value::Object(_) => {
                    Err(format!("field '{name}' contains nested values"))
                }
                scalar => json_field(name, scalar),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(|items| items.join(LIST_SEPARATOR)),
        Value::Object(_) => Err(format!("field '{name}' contains nested values")),
    }
}
