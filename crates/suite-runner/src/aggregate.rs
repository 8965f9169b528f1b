//! Merges per-test trial rows into one experiment table.

use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::path::Path;
use suite_core::{atomic_write_bytes, Row, Scalar};

/// Test-level columns joined onto every row of that test.
#[derive(Debug, Clone, PartialEq)]
pub struct TestMeta {
    pub test_name: String,
    pub label: String,
}

/// Rows with the union of their columns, in first-seen order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl Table {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn push(&mut self, row: Row) {
        for column in row.columns() {
            if !self.columns.iter().any(|c| c == column) {
                self.columns.push(column.clone());
            }
        }
        self.rows.push(row);
    }

    /// Header line, then one line per row. Missing cells are empty.
    pub fn to_csv_string(&self) -> String {
        let mut out = String::new();
        let header: Vec<String> = self.columns.iter().map(|c| csv_field(c)).collect();
        let _ = writeln!(out, "{}", header.join(","));
        for row in &self.rows {
            let cells: Vec<String> = self
                .columns
                .iter()
                .map(|c| row.get(c).map(cell).unwrap_or_default())
                .collect();
            let _ = writeln!(out, "{}", cells.join(","));
        }
        out
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        atomic_write_bytes(path, self.to_csv_string().as_bytes())
            .with_context(|| format!("write table {}", path.display()))
    }
}

/// Cross-joins each test's metadata (`test_name`, `label`, `replications`)
/// onto its rows and unions everything. Tests without rows contribute
/// nothing. No statistics are computed here.
pub fn aggregate(tests: Vec<(TestMeta, Vec<Row>)>) -> Table {
    let mut table = Table::default();
    for (meta, rows) in tests {
        let replications = rows.len() as i64;
        for mut row in rows {
            row.insert("test_name", meta.test_name.as_str());
            row.insert("label", meta.label.as_str());
            row.insert("replications", replications);
            table.push(row);
        }
    }
    table
}

fn cell(value: &Scalar) -> String {
    match value {
        Scalar::Str(s) => csv_field(s),
        Scalar::Bool(b) => if *b { "True" } else { "False" }.to_string(),
        other => other.to_string(),
    }
}

fn csv_field(raw: &str) -> String {
    if raw.contains(|c: char| matches!(c, ',' | '"' | '\n' | '\r')) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, Scalar)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn meta(name: &str) -> TestMeta {
        TestMeta {
            test_name: name.to_string(),
            label: name.to_uppercase(),
        }
    }

    #[test]
    fn metadata_is_joined_and_columns_unioned() {
        let table = aggregate(vec![
            (
                meta("a"),
                vec![
                    row(&[("throughput", Scalar::Float(1.5)), ("replication_id", Scalar::Int(0))]),
                    row(&[("throughput", Scalar::Float(2.5)), ("replication_id", Scalar::Int(2))]),
                ],
            ),
            (meta("empty"), vec![]),
            (meta("b"), vec![row(&[("pauses", Scalar::Int(4))])]),
        ]);
        assert_eq!(
            table.columns,
            ["throughput", "replication_id", "test_name", "label", "replications", "pauses"]
        );
        assert_eq!(table.rows.len(), 3);
        assert_eq!(table.rows[0].get("replications"), Some(&Scalar::Int(2)));
        assert_eq!(table.rows[2].get("label"), Some(&Scalar::Str("B".to_string())));
        assert!(!table.rows.iter().any(|r| r.get("test_name") == Some(&Scalar::from("empty"))));
    }

    #[test]
    fn csv_quotes_and_leaves_gaps() {
        let mut table = Table::default();
        table.push(row(&[
            ("name", Scalar::from("a,b")),
            ("ok", Scalar::Bool(true)),
        ]));
        table.push(row(&[("value", Scalar::Float(0.5)), ("name", Scalar::from("say \"hi\""))]));
        assert_eq!(
            table.to_csv_string(),
            "name,ok,value\n\"a,b\",True,\n\"say \"\"hi\"\"\",,0.5\n"
        );
    }
}
