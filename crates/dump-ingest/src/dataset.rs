//! Dataset schemas and parsed records
//!
//! A [`DatasetSpec`] describes one record file of the dump: where it lives in
//! the archive, which table it loads into, and its ordered field schema. The
//! schema drives everything downstream, from header validation in the parser to
//! the table DDL and the insert statement used by the loader.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Declared column type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FieldType {
    Text,
}

impl FieldType {
    pub fn sql_type(self) -> &'static str {
        match self {
            FieldType::Text => "TEXT",
        }
    }
}

/// One column of a dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: FieldType,
    pub nullable: bool,
    pub primary_key: bool,
}

impl FieldSpec {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::Text,
            nullable: false,
            primary_key: false,
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            nullable: true,
            ..Self::required(name)
        }
    }

    /// Primary keys are always required
    pub fn primary_key(name: impl Into<String>) -> Self {
        Self {
            primary_key: true,
            ..Self::required(name)
        }
    }
}

/// Fixed description of one record file and its destination table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetSpec {
    /// Logical name used in logs and reports
    pub name: String,
    pub table: String,
    /// Location of the record file relative to the extraction directory
    pub file_path: PathBuf,
    pub fields: Vec<FieldSpec>,
}

impl DatasetSpec {
    pub fn new(
        name: impl Into<String>,
        table: impl Into<String>,
        file_path: impl Into<PathBuf>,
        fields: Vec<FieldSpec>,
    ) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            file_path: file_path.into(),
            fields,
        }
    }

    /// `dump/customers.csv`
    pub fn customers() -> Self {
        Self::new(
            "customers",
            "customers",
            Path::new("dump").join("customers.csv"),
            vec![
                FieldSpec::required("Index"),
                FieldSpec::primary_key("Customer Id"),
                FieldSpec::required("First Name"),
                FieldSpec::required("Last Name"),
                FieldSpec::optional("Company"),
                FieldSpec::required("City"),
                FieldSpec::required("Country"),
                FieldSpec::optional("Phone 1"),
                FieldSpec::optional("Phone 2"),
                FieldSpec::required("Email"),
                FieldSpec::required("Subscription Date"),
                FieldSpec::required("Website"),
            ],
        )
    }

    /// `dump/organizations.csv`
    pub fn organizations() -> Self {
        Self::new(
            "organizations",
            "organizations",
            Path::new("dump").join("organizations.csv"),
            vec![
                FieldSpec::required("Index"),
                FieldSpec::primary_key("Organization Id"),
                FieldSpec::required("Name"),
                FieldSpec::required("Website"),
                FieldSpec::required("Country"),
                FieldSpec::required("Description"),
                FieldSpec::required("Founded"),
                FieldSpec::required("Industry"),
                FieldSpec::required("Number of employees"),
            ],
        )
    }

    pub fn arity(&self) -> usize {
        self.fields.len()
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn primary_key_index(&self) -> Option<usize> {
        self.fields.iter().position(|f| f.primary_key)
    }

    /// Idempotent DDL for the destination table
    pub fn create_table_sql(&self) -> String {
        let mut columns: Vec<String> = self
            .fields
            .iter()
            .map(|field| {
                let mut column = format!("{} {}", quote_ident(&field.name), field.field_type.sql_type());
                if !field.nullable {
                    column.push_str(" NOT NULL");
                }
                column
            })
            .collect();

        let keys: Vec<String> = self
            .fields
            .iter()
            .filter(|f| f.primary_key)
            .map(|f| quote_ident(&f.name))
            .collect();
        if !keys.is_empty() {
            columns.push(format!("PRIMARY KEY ({})", keys.join(", ")));
        }

        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_ident(&self.table),
            columns.join(", ")
        )
    }

    /// Single-row insert with one positional parameter per field
    pub fn insert_sql(&self) -> String {
        let columns: Vec<String> = self.fields.iter().map(|f| quote_ident(&f.name)).collect();
        let params: Vec<String> = (1..=self.fields.len()).map(|i| format!("?{}", i)).collect();

        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(&self.table),
            columns.join(", "),
            params.join(", ")
        )
    }

    /// Rows in insertion order
    pub fn select_all_sql(&self) -> String {
        let columns: Vec<String> = self.fields.iter().map(|f| quote_ident(&f.name)).collect();
        format!(
            "SELECT {} FROM {} ORDER BY rowid",
            columns.join(", "),
            quote_ident(&self.table)
        )
    }
}

/// The datasets a standard dump contains, in load order
pub fn default_datasets() -> Vec<DatasetSpec> {
    vec![DatasetSpec::customers(), DatasetSpec::organizations()]
}

/// Double-quote an SQL identifier; field names contain spaces
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// One parsed row, shaped by its dataset's schema
///
/// Values are positional and always match the schema's arity. An empty cell
/// is stored as `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    spec: Arc<DatasetSpec>,
    line: u64,
    values: Vec<Option<String>>,
}

impl Record {
    pub(crate) fn new(spec: Arc<DatasetSpec>, line: u64, values: Vec<Option<String>>) -> Self {
        debug_assert_eq!(values.len(), spec.arity());
        Self { spec, line, values }
    }

    pub fn dataset(&self) -> &DatasetSpec {
        &self.spec
    }

    /// 1-based line in the record file where this record starts
    pub fn line(&self) -> u64 {
        self.line
    }

    pub fn values(&self) -> &[Option<String>] {
        &self.values
    }

    /// Value of the named field; `None` for unknown fields and empty cells
    pub fn get(&self, field: &str) -> Option<&str> {
        self.spec
            .field_index(field)
            .and_then(|i| self.values[i].as_deref())
    }

    /// `(field name, value)` pairs in schema order
    pub fn fields(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.spec
            .field_names()
            .zip(self.values.iter().map(|v| v.as_deref()))
    }

    pub fn primary_key(&self) -> Option<&str> {
        self.spec
            .primary_key_index()
            .and_then(|i| self.values[i].as_deref())
    }
}
