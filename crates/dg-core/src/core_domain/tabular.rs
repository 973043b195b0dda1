use crate::core::{
    check_row_widths, validate_field_names, DataItem, ExternalError, PipelineError,
    ValidationError,
};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// A parsed upload: header plus width-checked rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

/// Writes `field_names` as the header and each item's `values` below it.
/// Callers pass the already-filtered view; an item whose width disagrees
/// with the header aborts the export.
pub fn export_csv(field_names: &[String], items: &[&DataItem]) -> Result<Vec<u8>, PipelineError> {
    check_row_widths(field_names, items.iter().map(|item| item.values.as_slice()))?;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(true)
        .from_writer(Vec::new());
    writer.write_record(field_names).map_err(csv_write_error)?;
    for item in items {
        writer.write_record(&item.values).map_err(csv_write_error)?;
    }
    writer.flush().map_err(|e| ExternalError::Serialization(e.to_string()))?;
    writer
        .into_inner()
        .map_err(|e| ExternalError::Serialization(e.to_string()).into())
}

fn csv_write_error(err: csv::Error) -> PipelineError {
    ExternalError::Serialization(err.to_string()).into()
}

/// `dataset_{project}_v{version}.csv`, with the project name lower-cased,
/// reduced to letters, digits and whitespace, and whitespace runs turned
/// into single underscores.
pub fn export_filename(project_name: &str, version: u32) -> String {
    let kept: String = project_name
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();
    let slug = kept.split_whitespace().collect::<Vec<_>>().join("_");
    let slug = slug.trim_matches('_');
    let slug = if slug.is_empty() { "untitled" } else { slug };
    format!("dataset_{slug}_v{version}.csv")
}

// ---------------------------------------------------------------------------
// Import
// ---------------------------------------------------------------------------

/// Parses an upload for appending to an existing schema. The header must
/// equal `field_names` position for position; it is compared before any
/// row is read.
pub fn parse_for_append(
    bytes: &[u8],
    field_names: &[String],
) -> Result<Vec<Vec<String>>, PipelineError> {
    let mut reader = reader(bytes);
    let header = read_header(&mut reader)?;
    if header != field_names {
        return Err(ValidationError::HeaderMismatch {
            expected: field_names.to_vec(),
            found: header,
        }
        .into());
    }
    read_rows(&mut reader, field_names)
}

/// Parses an upload whose header becomes a new schema.
pub fn parse_table(bytes: &[u8]) -> Result<Table, PipelineError> {
    let mut reader = reader(bytes);
    let header = read_header(&mut reader)?;
    validate_field_names(&header)?;
    let rows = read_rows(&mut reader, &header)?;
    Ok(Table { header, rows })
}

fn reader(bytes: &[u8]) -> csv::Reader<&[u8]> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    // Flexible so that a short row surfaces as a width error with its row
    // number instead of a generic parse failure.
    csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes)
}

fn read_header(reader: &mut csv::Reader<&[u8]>) -> Result<Vec<String>, ValidationError> {
    let header = reader
        .headers()
        .map_err(|e| ValidationError::MalformedCsv(e.to_string()))?;
    if header.is_empty() || (header.len() == 1 && header[0].is_empty()) {
        return Err(ValidationError::MissingHeader);
    }
    Ok(header.iter().map(str::to_owned).collect())
}

fn read_rows(
    reader: &mut csv::Reader<&[u8]>,
    field_names: &[String],
) -> Result<Vec<Vec<String>>, PipelineError> {
    let mut rows = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record = record
            .map_err(|e| ValidationError::MalformedCsv(format!("record {}: {e}", i + 1)))?;
        rows.push(record.iter().map(str::to_owned).collect::<Vec<_>>());
    }
    check_row_widths(field_names, rows.iter().map(Vec::as_slice))?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
