//! Field-typed, header-validated CSV reading.
//!
//! Every table of a model definition - `model.csv`, `version.csv`,
//! `metadata.csv`, the per-submodel `component.csv`, and the grid/TIN node
//! files - is read through a [TableSpec]: an ordered list of named, typed
//! fields. The reader validates the header row positionally against the
//! spec, then yields [Record]s of typed values, tagging every failure with
//! the file name and record number.
//!
//! A field specification is a space-delimited `name type` pair, where type
//! is one of `int`, `float`, `str`, `datetime`, `boolean` (`Y`/`N`), or a
//! regular expression the cell text must match. Decorations:
//!
//! - a `?` prefix on the type marks the *value* optional (empty cell
//!   becomes [Value::Null]),
//! - a `?` suffix on the name marks the *column* optional (it may be
//!   missing from the file altogether),
//! - a `group[]=name` name collects repeated columns under a single
//!   grouped attribute, in field order.

use crate::time::Time;
use crate::Error;
use log::trace;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Typed content of one CSV cell
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
    Time(Time),
    Bool(bool),
    Null,
}

#[derive(Clone, Debug)]
enum FieldKind {
    Int,
    Float,
    Str,
    DateTime,
    Boolean,
    Pattern(Regex),
}

/// One column of a table specification
#[derive(Clone, Debug)]
pub struct Field {
    name: String,
    group: Option<String>,
    kind: FieldKind,
    optional: bool,
    optional_column: bool,
}

impl Field {
    /// Parse a `name type` field specification
    fn from_spec(spec: &str) -> Result<Field, Error> {
        let bad = || Error::InvalidValue(format!("Invalid field definition \"{spec}\""));
        let (name, typestr) = spec.split_once(' ').ok_or_else(bad)?;

        let (group, name) = match name.split_once("[]=") {
            Some((group, name)) => (Some(group.to_string()), name),
            None => (None, name),
        };
        let (name, optional_column) = match name.strip_suffix('?') {
            Some(name) => (name, true),
            None => (name, false),
        };
        let (typestr, optional) = match typestr.strip_prefix('?') {
            Some(rest) => (rest, true),
            None => (typestr, false),
        };
        if name.is_empty() || typestr.is_empty() {
            return Err(bad());
        }

        let kind = match typestr {
            "int" => FieldKind::Int,
            "float" => FieldKind::Float,
            "str" | "unicode" => FieldKind::Str,
            "datetime" => FieldKind::DateTime,
            "boolean" => FieldKind::Boolean,
            pattern => {
                let anchored = format!("^(?:{pattern})$");
                FieldKind::Pattern(Regex::new(&anchored).map_err(|_| bad())?)
            }
        };

        Ok(Field {
            name: name.to_string(),
            group,
            kind,
            optional,
            optional_column,
        })
    }

    /// Parse one cell into a typed value
    fn parse(&self, text: &str) -> Result<Value, Error> {
        if text.is_empty() {
            if self.optional {
                return Ok(Value::Null);
            }
            return Err(Error::InvalidValue(format!(
                "Missing value for {}",
                self.name
            )));
        }

        match &self.kind {
            FieldKind::Int => text.parse().map(Value::Int).map_err(|_| {
                Error::InvalidValue(format!("Cannot convert {} value \"{text}\" to int", self.name))
            }),
            FieldKind::Float => text.parse().map(Value::Float).map_err(|_| {
                Error::InvalidValue(format!(
                    "Cannot convert {} value \"{text}\" to float",
                    self.name
                ))
            }),
            FieldKind::Str => Ok(Value::Str(text.to_string())),
            FieldKind::DateTime => match Time::parse(text)? {
                Some(t) => Ok(Value::Time(t)),
                None => Ok(Value::Null),
            },
            FieldKind::Boolean => match text {
                "Y" => Ok(Value::Bool(true)),
                "N" => Ok(Value::Bool(false)),
                _ => Err(Error::InvalidValue(format!(
                    "Invalid value \"{text}\" for {}",
                    self.name
                ))),
            },
            FieldKind::Pattern(re) => {
                if re.is_match(text) {
                    Ok(Value::Str(text.to_string()))
                } else {
                    Err(Error::InvalidValue(format!(
                        "Invalid value \"{text}\" for {}",
                        self.name
                    )))
                }
            }
        }
    }
}

/// An ordered set of fields expected in a CSV file
#[derive(Clone, Debug)]
pub struct TableSpec {
    table: String,
    fields: Vec<Field>,
}

impl TableSpec {
    pub fn new(table: &str, specs: &[&str]) -> Result<TableSpec, Error> {
        let mut fields = Vec::with_capacity(specs.len());
        for spec in specs {
            let field = Field::from_spec(spec).map_err(|e| match e {
                Error::InvalidValue(msg) => {
                    Error::InvalidValue(format!("{msg} in {table} file specification"))
                }
                other => other,
            })?;
            fields.push(field);
        }
        Ok(TableSpec {
            table: table.to_string(),
            fields,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

/// One row of typed values, keyed by the spec that produced it
#[derive(Clone, Debug)]
pub struct Record {
    spec: Rc<TableSpec>,
    values: Vec<Value>,
}

impl Record {
    fn value(&self, name: &str) -> Result<&Value, Error> {
        let pos = self.spec.position(name).ok_or_else(|| {
            Error::Definition(format!(
                "Field {name} is not part of the {} schema",
                self.spec.table
            ))
        })?;
        Ok(&self.values[pos])
    }

    pub fn str(&self, name: &str) -> Result<&str, Error> {
        match self.value(name)? {
            Value::Str(s) => Ok(s),
            v => Err(self.type_error(name, "str", v)),
        }
    }

    pub fn int(&self, name: &str) -> Result<i64, Error> {
        match self.value(name)? {
            Value::Int(i) => Ok(*i),
            v => Err(self.type_error(name, "int", v)),
        }
    }

    pub fn float(&self, name: &str) -> Result<f64, Error> {
        match self.value(name)? {
            Value::Float(f) => Ok(*f),
            v => Err(self.type_error(name, "float", v)),
        }
    }

    pub fn opt_float(&self, name: &str) -> Result<Option<f64>, Error> {
        match self.value(name)? {
            Value::Float(f) => Ok(Some(*f)),
            Value::Null => Ok(None),
            v => Err(self.type_error(name, "float", v)),
        }
    }

    pub fn boolean(&self, name: &str) -> Result<bool, Error> {
        match self.value(name)? {
            Value::Bool(b) => Ok(*b),
            v => Err(self.type_error(name, "boolean", v)),
        }
    }

    pub fn time(&self, name: &str) -> Result<Time, Error> {
        match self.value(name)? {
            Value::Time(t) => Ok(*t),
            v => Err(self.type_error(name, "datetime", v)),
        }
    }

    pub fn opt_time(&self, name: &str) -> Result<Option<Time>, Error> {
        match self.value(name)? {
            Value::Time(t) => Ok(Some(*t)),
            Value::Null => Ok(None),
            v => Err(self.type_error(name, "datetime", v)),
        }
    }

    pub fn opt_str(&self, name: &str) -> Result<Option<&str>, Error> {
        match self.value(name)? {
            Value::Str(s) => Ok(Some(s)),
            Value::Null => Ok(None),
            v => Err(self.type_error(name, "str", v)),
        }
    }

    /// All values of a grouped attribute, in field order. Null cells come
    /// back as NaN so that holes in the data flow into the interpolation
    /// arithmetic unchanged.
    pub fn group_floats(&self, group: &str) -> Result<Vec<f64>, Error> {
        let mut values = Vec::new();
        for (field, value) in self.spec.fields.iter().zip(self.values.iter()) {
            if field.group.as_deref() != Some(group) {
                continue;
            }
            match value {
                Value::Float(f) => values.push(*f),
                Value::Null => values.push(f64::NAN),
                v => return Err(self.type_error(&field.name, "float", v)),
            }
        }
        Ok(values)
    }

    /// All int values of a grouped attribute, in field order
    pub fn group_ints(&self, group: &str) -> Result<Vec<i64>, Error> {
        let mut values = Vec::new();
        for (field, value) in self.spec.fields.iter().zip(self.values.iter()) {
            if field.group.as_deref() != Some(group) {
                continue;
            }
            match value {
                Value::Int(i) => values.push(*i),
                v => return Err(self.type_error(&field.name, "int", v)),
            }
        }
        Ok(values)
    }

    fn type_error(&self, name: &str, wanted: &str, got: &Value) -> Error {
        Error::Definition(format!(
            "Field {name} of {} accessed as {wanted} but holds {got:?}",
            self.spec.table
        ))
    }
}

/// A pull-based reader over a CSV file, yielding one [Record] per data row
pub struct TableReader {
    spec: Rc<TableSpec>,
    path: PathBuf,
    records: csv::StringRecordsIntoIter<std::fs::File>,
    // For each spec field: the file column it maps to (None for an absent
    // optional column)
    columns: Vec<Option<usize>>,
    recno: usize,
}

impl TableReader {
    /// Open the file and reconcile its header row with the spec
    pub fn open(spec: &TableSpec, path: &Path) -> Result<TableReader, Error> {
        if !path.is_file() {
            return Err(Error::Definition(format!(
                "CSV file {} doesn't exist",
                path.display()
            )));
        }
        trace!("Reading {} file {}", spec.table, path.display());

        let reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(path)
            .map_err(|e| Error::Definition(format!("Cannot open {}: {e}", path.display())))?;
        let mut records = reader.into_records();

        let headers = match records.next() {
            Some(Ok(headers)) => headers,
            _ => {
                return Err(Error::Definition(format!(
                    "File {} does not have the correct columns for a {} file",
                    path.display(),
                    spec.table
                )))
            }
        };

        let columns = Self::reconcile(spec, &headers, path)?;

        Ok(TableReader {
            spec: Rc::new(spec.clone()),
            path: path.to_path_buf(),
            records,
            columns,
            recno: 0,
        })
    }

    /// Positional header matching: each spec field consumes the next file
    /// header if the names agree; optional columns may be skipped.
    fn reconcile(
        spec: &TableSpec,
        headers: &csv::StringRecord,
        path: &Path,
    ) -> Result<Vec<Option<usize>>, Error> {
        let mismatch = |detail: String| {
            Error::Definition(format!(
                "File {} does not have the correct columns for a {} file: {detail}",
                path.display(),
                spec.table
            ))
        };

        let mut columns = Vec::with_capacity(spec.fields.len());
        let mut next = 0;
        for field in &spec.fields {
            match headers.get(next) {
                Some(h) if h.trim() == field.name => {
                    columns.push(Some(next));
                    next += 1;
                }
                _ if field.optional_column => columns.push(None),
                Some(h) => {
                    return Err(mismatch(format!(
                        "field {} does not match expected {}",
                        h.trim(),
                        field.name
                    )))
                }
                None => return Err(mismatch(format!("missing field {}", field.name))),
            }
        }
        if next < headers.len() {
            let extra: Vec<&str> = headers.iter().skip(next).map(str::trim).collect();
            return Err(mismatch(format!("extra fields: {}", extra.join(", "))));
        }
        Ok(columns)
    }

    fn parse_row(&self, row: &csv::StringRecord) -> Result<Record, Error> {
        let mut values = Vec::with_capacity(self.spec.fields.len());
        for (field, column) in self.spec.fields.iter().zip(self.columns.iter()) {
            let text = column.and_then(|c| row.get(c)).unwrap_or("").trim();
            values.push(field.parse(text)?);
        }
        Ok(Record {
            spec: Rc::clone(&self.spec),
            values,
        })
    }
}

impl Iterator for TableReader {
    type Item = Result<Record, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let row = match self.records.next()? {
                Ok(row) => row,
                Err(e) => {
                    self.recno += 1;
                    return Some(Err(Error::InvalidValue(format!(
                        "Unreadable record {} of file {}: {e}",
                        self.recno,
                        self.path.display()
                    ))));
                }
            };
            self.recno += 1;
            // Skip blank lines (a single empty cell)
            if row.len() == 1 && row.get(0).map_or(false, |c| c.trim().is_empty()) {
                continue;
            }
            return Some(
                self.parse_row(&row)
                    .map_err(|e| e.in_record(self.recno, &self.path)),
            );
        }
    }
}

// ----- T E S T S ------------------------------------------------------------------
