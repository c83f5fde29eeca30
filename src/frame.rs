use crate::{
    data::{RawCell, Value},
    schema::ColumnSchema,
};

/// Ordered header plus rows of untyped cells, exactly as decoded.
///
/// Every row holds one cell per header column; decoders pad or skip rows
/// that would violate this.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawFrame {
    columns: Vec<String>,
    rows: Vec<Vec<RawCell>>,
}

impl RawFrame {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Append a row, returning `false` (and dropping it) when its width does
    /// not match the header.
    pub fn push_row(&mut self, row: Vec<RawCell>) -> bool {
        if row.len() != self.columns.len() {
            return false;
        }
        self.rows.push(row);
        true
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<RawCell>] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column_cells(&self, index: usize) -> impl Iterator<Item = &RawCell> {
        self.rows.iter().filter_map(move |row| row.get(index))
    }
}

/// Rows converted to the inferred schema; `None` marks a storage NULL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypedFrame {
    pub schema: Vec<ColumnSchema>,
    pub rows: Vec<Vec<Option<Value>>>,
}

impl TypedFrame {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.schema
            .iter()
            .map(|column| column.sanitized_name.clone())
            .collect()
    }

    /// Keep only the columns named in `keep`, preserving schema order.
    pub fn project(&self, keep: &[String]) -> TypedFrame {
        let indices: Vec<usize> = self
            .schema
            .iter()
            .enumerate()
            .filter(|(_, column)| keep.contains(&column.sanitized_name))
            .map(|(idx, _)| idx)
            .collect();
        let schema = indices.iter().map(|&idx| self.schema[idx].clone()).collect();
        let rows = self
            .rows
            .iter()
            .map(|row| indices.iter().map(|&idx| row[idx].clone()).collect())
            .collect();
        TypedFrame { schema, rows }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnType;

    #[test]
    fn push_row_rejects_width_mismatch() {
        let mut frame = RawFrame::new(vec!["a".into(), "b".into()]);
        assert!(frame.push_row(vec![RawCell::Integer(1), RawCell::Null]));
        assert!(!frame.push_row(vec![RawCell::Integer(1)]));
        assert_eq!(frame.row_count(), 1);
        assert_eq!(frame.column_cells(0).count(), 1);
    }

    #[test]
    fn project_keeps_schema_order() {
        let schema = ["a", "b", "c"]
            .iter()
            .map(|name| ColumnSchema {
                source_name: name.to_string(),
                sanitized_name: name.to_string(),
                inferred_type: ColumnType::Integer,
                nullable: false,
                sample_size: 1,
            })
            .collect();
        let frame = TypedFrame {
            schema,
            rows: vec![vec![
                Some(Value::Integer(1)),
                Some(Value::Integer(2)),
                Some(Value::Integer(3)),
            ]],
        };
        let projected = frame.project(&["c".to_string(), "a".to_string()]);
        assert_eq!(projected.column_names(), vec!["a", "c"]);
        assert_eq!(
            projected.rows[0],
            vec![Some(Value::Integer(1)), Some(Value::Integer(3))]
        );
    }
}
