//! The in-memory lead table: an append-only, typed union schema over
//! ordered rows, with CSV encoding.

use crate::error::{AppError, Result};
use crate::models::{ColumnKind, IDENTITY_COLUMNS, LeadIdentity, Value};
use indexmap::IndexMap;

static ABSENT: Value = Value::Absent;

#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct Dataset {
    schema: IndexMap<String, ColumnKind>,
    rows: Vec<Vec<Value>>,
}

impl Dataset {
    /// Creates an empty dataset with text columns.
    pub(crate) fn with_columns<S: AsRef<str>>(columns: &[S]) -> Self {
        let schema = columns
            .iter()
            .map(|c| (c.as_ref().to_string(), ColumnKind::Text))
            .collect();
        Self {
            schema,
            rows: Vec::new(),
        }
    }

    /// Parses CSV bytes whose first record is the header. Every cell is read
    /// as text; empty cells are absent.
    pub(crate) fn from_csv_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(false)
            .from_reader(bytes);

        let mut schema = IndexMap::new();
        for header in reader.headers()?.iter() {
            let name = header.trim_start_matches('\u{feff}').to_string();
            if schema.insert(name.clone(), ColumnKind::Text).is_some() {
                return Err(AppError::Parse(format!("Duplicate CSV column '{}'", name)));
            }
        }

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            rows.push(record.iter().map(Value::from_csv).collect());
        }

        Ok(Self { schema, rows })
    }

    /// Encodes the dataset as CSV. Absent cells become empty fields.
    pub(crate) fn to_csv_bytes(&self) -> Result<Vec<u8>> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(self.schema.keys())?;
        for row in &self.rows {
            writer.write_record(row.iter().map(Value::to_csv))?;
        }
        writer
            .into_inner()
            .map_err(|e| AppError::Io(e.into_error()))
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub(crate) fn columns(&self) -> impl Iterator<Item = &str> {
        self.schema.keys().map(String::as_str)
    }

    pub(crate) fn has_column(&self, column: &str) -> bool {
        self.schema.contains_key(column)
    }

    pub(crate) fn kind(&self, column: &str) -> Option<ColumnKind> {
        self.schema.get(column).copied()
    }

    /// Adds `column` with all cells absent, or types an existing text column.
    /// A column that already carries a different non-text type is rejected.
    pub(crate) fn declare_column(&mut self, column: &str, kind: ColumnKind) -> Result<()> {
        match self.schema.get_index_of(column) {
            None => {
                self.schema.insert(column.to_string(), kind);
                for row in &mut self.rows {
                    row.push(Value::Absent);
                }
                Ok(())
            }
            Some(idx) => {
                let current = self.schema[idx];
                if current == kind {
                    return Ok(());
                }
                if !current.is_textual() && !kind.is_textual() {
                    return Err(AppError::Parse(format!(
                        "Column '{}' is {:?} and cannot be re-typed as {:?}",
                        column, current, kind
                    )));
                }
                if !current.is_textual() {
                    // Textual redeclaration of a typed column keeps the type.
                    return Ok(());
                }
                self.schema[idx] = kind;
                for row in &mut self.rows {
                    let cell = std::mem::take(&mut row[idx]);
                    row[idx] = cell.coerce(kind);
                }
                Ok(())
            }
        }
    }

    pub(crate) fn get(&self, row: usize, column: &str) -> &Value {
        match (self.schema.get_index_of(column), self.rows.get(row)) {
            (Some(idx), Some(values)) => &values[idx],
            _ => &ABSENT,
        }
    }

    /// Writes a cell, converting it to the column's declared type.
    pub(crate) fn set(&mut self, row: usize, column: &str, value: Value) -> Result<()> {
        let (idx, _, kind) = self
            .schema
            .get_full(column)
            .ok_or_else(|| AppError::Parse(format!("Unknown column '{}'", column)))?;
        let kind = *kind;
        let values = self
            .rows
            .get_mut(row)
            .ok_or_else(|| AppError::Parse(format!("Row {} out of range", row)))?;
        values[idx] = value.normalized().coerce(kind);
        Ok(())
    }

    /// Appends a row given as (column, value) pairs; missing columns are absent.
    pub(crate) fn push_row(&mut self, cells: Vec<(&str, Value)>) -> Result<()> {
        let mut row = vec![Value::Absent; self.schema.len()];
        for (column, value) in cells {
            let (idx, _, kind) = self
                .schema
                .get_full(column)
                .ok_or_else(|| AppError::Parse(format!("Unknown column '{}'", column)))?;
            row[idx] = value.normalized().coerce(*kind);
        }
        self.rows.push(row);
        Ok(())
    }

    pub(crate) fn row(&self, index: usize) -> RowView<'_> {
        RowView {
            dataset: self,
            index,
        }
    }

    pub(crate) fn identity(&self, row: usize) -> LeadIdentity {
        LeadIdentity::new(IDENTITY_COLUMNS.map(|c| self.get(row, c).clone()))
    }

    /// Keeps only the first `limit` rows.
    pub(crate) fn truncate(&mut self, limit: usize) {
        self.rows.truncate(limit);
    }

    /// Replaces NaN-like cells with the absent marker.
    pub(crate) fn normalize_missing(&mut self) {
        for row in &mut self.rows {
            for cell in row.iter_mut() {
                let value = std::mem::take(cell);
                *cell = value.normalized();
            }
        }
    }

    /// Percentage of rows with a non-absent value in `column`.
    pub(crate) fn coverage(&self, column: &str) -> f64 {
        let Some(idx) = self.schema.get_index_of(column) else {
            return 0.0;
        };
        if self.rows.is_empty() {
            return 0.0;
        }
        let filled = self.rows.iter().filter(|r| !r[idx].is_absent()).count();
        filled as f64 * 100.0 / self.rows.len() as f64
    }

    /// A new dataset with only `columns`, in that order.
    pub(crate) fn select(&self, columns: &[&str]) -> Result<Self> {
        let mut indices = Vec::with_capacity(columns.len());
        let mut schema = IndexMap::new();
        for column in columns {
            let (idx, _, kind) = self.schema.get_full(*column).ok_or_else(|| {
                AppError::Parse(format!("Cannot select missing column '{}'", column))
            })?;
            indices.push(idx);
            schema.insert(column.to_string(), *kind);
        }
        let rows = self
            .rows
            .iter()
            .map(|r| indices.iter().map(|i| r[*i].clone()).collect())
            .collect();
        Ok(Self { schema, rows })
    }

    /// Retains rows for which `keep` returns true.
    pub(crate) fn retain_rows<F>(&mut self, mut keep: F)
    where
        F: FnMut(RowView<'_>) -> bool,
    {
        let mut kept = Vec::with_capacity(self.rows.len());
        for (index, row) in self.rows.iter().enumerate() {
            if keep(RowView {
                dataset: self,
                index,
            }) {
                kept.push(row.clone());
            }
        }
        self.rows = kept;
    }
}

/// Borrowed view of one row.
#[derive(Clone, Copy)]
pub(crate) struct RowView<'a> {
    dataset: &'a Dataset,
    index: usize,
}

impl<'a> RowView<'a> {
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn get(&self, column: &str) -> &'a Value {
        self.dataset.get(self.index, column)
    }

    /// Non-empty trimmed text of a cell.
    pub(crate) fn text(&self, column: &str) -> Option<&'a str> {
        self.get(column).as_trimmed_str()
    }

    pub(crate) fn float(&self, column: &str) -> Option<f64> {
        self.get(column).as_f64()
    }

    pub(crate) fn flag(&self, column: &str) -> Option<bool> {
        self.get(column).as_bool()
    }

    pub(crate) fn identity(&self) -> LeadIdentity {
        self.dataset.identity(self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{COMPANY, EMAIL, FIRST_NAME, LAST_NAME, PHONE};

    const SEED: &str = "Last Name,First Name,Company / Account,Phone,Email\n\
                        Doe,John,Acme,4930183992170,john.doe@acme.example\n\
                        Roe,,Beta GmbH,,x@gmail.com\n";

    #[test]
    fn test_parse_seed_csv() {
        let ds = Dataset::from_csv_bytes(SEED.as_bytes()).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(
            ds.columns().collect::<Vec<_>>(),
            vec![LAST_NAME, FIRST_NAME, COMPANY, PHONE, EMAIL]
        );
        assert_eq!(ds.get(0, FIRST_NAME), &Value::from("John"));
        assert_eq!(ds.get(1, FIRST_NAME), &Value::Absent);
        assert_eq!(ds.get(5, FIRST_NAME), &Value::Absent);
    }

    #[test]
    fn test_csv_encoding_preserves_identity_bytes() {
        let ds = Dataset::from_csv_bytes(SEED.as_bytes()).unwrap();
        let bytes = ds.to_csv_bytes().unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), SEED);
    }

    #[test]
    fn test_declare_column_appends_and_types() {
        let mut ds = Dataset::from_csv_bytes(SEED.as_bytes()).unwrap();
        ds.declare_column("email_valid", ColumnKind::Bool).unwrap();
        assert_eq!(ds.get(0, "email_valid"), &Value::Absent);
        ds.set(0, "email_valid", Value::from("true")).unwrap();
        assert_eq!(ds.get(0, "email_valid"), &Value::Bool(true));
        assert!(ds.declare_column("email_valid", ColumnKind::Int).is_err());
        assert!(ds.declare_column("email_valid", ColumnKind::Text).is_ok());
        assert_eq!(ds.kind("email_valid"), Some(ColumnKind::Bool));
    }

    #[test]
    fn test_declare_coerces_text_from_previous_run() {
        let csv = "First Name,no_candidates\nJohn,3\nJane,\n";
        let mut ds = Dataset::from_csv_bytes(csv.as_bytes()).unwrap();
        ds.declare_column("no_candidates", ColumnKind::Int).unwrap();
        assert_eq!(ds.get(0, "no_candidates"), &Value::Int(3));
        assert_eq!(ds.get(1, "no_candidates"), &Value::Absent);
    }

    #[test]
    fn test_coverage_and_truncate() {
        let mut ds = Dataset::from_csv_bytes(SEED.as_bytes()).unwrap();
        assert_eq!(ds.coverage(FIRST_NAME), 50.0);
        assert_eq!(ds.coverage("missing"), 0.0);
        ds.truncate(1);
        assert_eq!(ds.len(), 1);
        assert_eq!(ds.coverage(FIRST_NAME), 100.0);
    }

    #[test]
    fn test_select_and_push_row() {
        let mut ds = Dataset::with_columns(&["a", "b"]);
        ds.push_row(vec![("b", Value::from("2")), ("a", Value::from("1"))])
            .unwrap();
        let selected = ds.select(&["b"]).unwrap();
        assert_eq!(selected.columns().collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(selected.get(0, "b"), &Value::from("2"));
        assert!(ds.select(&["c"]).is_err());
        assert!(ds.push_row(vec![("c", Value::Absent)]).is_err());
    }

    #[test]
    fn test_normalize_missing_and_retain() {
        let mut ds = Dataset::with_columns(&["a"]);
        ds.push_row(vec![("a", Value::from("x"))]).unwrap();
        ds.rows[0][0] = Value::from("NaN");
        ds.push_row(vec![("a", Value::from("y"))]).unwrap();
        ds.normalize_missing();
        assert_eq!(ds.get(0, "a"), &Value::Absent);
        ds.retain_rows(|row| row.text("a").is_some());
        assert_eq!(ds.len(), 1);
        assert_eq!(ds.get(0, "a"), &Value::from("y"));
    }

    #[test]
    fn test_identity_snapshot() {
        let ds = Dataset::from_csv_bytes(SEED.as_bytes()).unwrap();
        let identity = ds.identity(1);
        assert_eq!(identity.get(LAST_NAME), &Value::from("Roe"));
        assert_eq!(identity.get(FIRST_NAME), &Value::Absent);
        assert_eq!(identity.get(EMAIL), &Value::from("x@gmail.com"));
    }
}
