use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::{MetricsError, Result};
use crate::model::{EntityId, dedupe_entity_ids};

pub const INDEX_COLUMN: &str = "qid";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cell {
    Count(i64),
    Text(Option<String>),
}

impl Cell {
    pub fn as_count(&self) -> i64 {
        match self {
            Self::Count(value) => *value,
            Self::Text(_) => 0,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => value.as_deref(),
            Self::Count(_) => None,
        }
    }

    fn render(&self) -> String {
        match self {
            Self::Count(value) => value.to_string(),
            Self::Text(value) => value.clone().unwrap_or_default(),
        }
    }
}

/// Two-dimensional table indexed by unique entity id. Columns keep insertion
/// order so written output is stable.
#[derive(Debug, Clone, Default)]
pub struct MetricsTable {
    index: Vec<EntityId>,
    rows: BTreeMap<EntityId, usize>,
    columns: Vec<(String, Vec<Cell>)>,
}

impl MetricsTable {
    pub fn new(ids: impl IntoIterator<Item = EntityId>) -> Self {
        let mut table = Self::default();
        for id in ids {
            if table.rows.contains_key(&id) {
                continue;
            }
            table.rows.insert(id.clone(), table.index.len());
            table.index.push(id);
        }
        table
    }

    pub fn from_raw_ids<I, S>(values: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self::new(dedupe_entity_ids(values)?))
    }

    pub fn index(&self) -> &[EntityId] {
        &self.index
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_position(name).is_some()
    }

    /// Assign `value` to every row of `name`, creating the column if needed.
    pub fn assign(&mut self, name: &str, value: Cell) {
        let filled = vec![value; self.index.len()];
        match self.column_position(name) {
            Some(position) => self.columns[position].1 = filled,
            None => self.columns.push((name.to_string(), filled)),
        }
    }

    pub fn get(&self, id: &EntityId, column: &str) -> Option<&Cell> {
        let row = *self.rows.get(id)?;
        let position = self.column_position(column)?;
        self.columns[position].1.get(row)
    }

    pub fn count(&self, id: &EntityId, column: &str) -> Option<i64> {
        self.get(id, column).map(Cell::as_count)
    }

    pub fn text(&self, id: &EntityId, column: &str) -> Option<&str> {
        self.get(id, column).and_then(Cell::as_text)
    }

    pub fn set(&mut self, id: &EntityId, column: &str, value: Cell) -> Result<()> {
        let row = self.row_position(id)?;
        let position = self.require_column(column)?;
        self.columns[position].1[row] = value;
        Ok(())
    }

    /// Rows whose `column` cell satisfies `predicate`, in index order.
    pub fn select_rows(&self, column: &str, predicate: impl Fn(&Cell) -> bool) -> Vec<EntityId> {
        let Some(position) = self.column_position(column) else {
            return Vec::new();
        };
        self.columns[position]
            .1
            .iter()
            .zip(&self.index)
            .filter(|(cell, _)| predicate(cell))
            .map(|(_, id)| id.clone())
            .collect()
    }

    pub fn add_count(&mut self, id: &EntityId, column: &str, delta: i64) -> Result<()> {
        let row = self.row_position(id)?;
        let position = self.require_column(column)?;
        let cell = &mut self.columns[position].1[row];
        *cell = Cell::Count(cell.as_count() + delta);
        Ok(())
    }

    /// Per-row sum of `sources` written to `target`; text cells count as zero.
    pub fn sum_columns<S: AsRef<str>>(&mut self, target: &str, sources: &[S]) -> Result<()> {
        let mut positions = Vec::with_capacity(sources.len());
        for source in sources {
            positions.push(self.require_column(source.as_ref())?);
        }
        let totals = (0..self.index.len())
            .map(|row| {
                let total = positions
                    .iter()
                    .map(|position| self.columns[*position].1[row].as_count())
                    .sum::<i64>();
                Cell::Count(total)
            })
            .collect::<Vec<_>>();
        match self.column_position(target) {
            Some(position) => self.columns[position].1 = totals,
            None => self.columns.push((target.to_string(), totals)),
        }
        Ok(())
    }

    /// Load a table from a CSV file. The id column (the first column when
    /// `id_column` is `None`) becomes the index; every other column is kept as
    /// text in header order. Repeated ids keep their first row.
    pub fn read_csv(path: &Path, id_column: Option<&str>) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)?;
        let headers = reader.headers()?.clone();
        let position = match id_column {
            Some(name) => headers.iter().position(|header| header == name).ok_or_else(|| {
                MetricsError::validation(format!(
                    "column {name:?} not found in {}",
                    path.display()
                ))
            })?,
            None => 0,
        };
        let carried = headers
            .iter()
            .enumerate()
            .filter(|(field, name)| *field != position && *name != INDEX_COLUMN)
            .map(|(field, name)| (field, name.to_string()))
            .collect::<Vec<_>>();

        let mut table = Self {
            columns: carried
                .iter()
                .map(|(_, name)| (name.clone(), Vec::new()))
                .collect(),
            ..Self::default()
        };
        for record in reader.records() {
            let record = record?;
            let Some(raw) = record.get(position) else {
                continue;
            };
            let id = EntityId::parse(raw.trim())?;
            if table.rows.contains_key(&id) {
                continue;
            }
            table.rows.insert(id.clone(), table.index.len());
            table.index.push(id);
            for (slot, (field, _)) in carried.iter().enumerate() {
                let value = record
                    .get(*field)
                    .filter(|value| !value.is_empty())
                    .map(ToString::to_string);
                table.columns[slot].1.push(Cell::Text(value));
            }
        }
        Ok(table)
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|error| MetricsError::io(parent, error))?;
        }
        let mut writer = csv::Writer::from_path(path)?;
        let mut header = vec![INDEX_COLUMN.to_string()];
        header.extend(self.columns.iter().map(|(name, _)| name.clone()));
        writer.write_record(&header)?;
        for (row, id) in self.index.iter().enumerate() {
            let mut record = vec![id.to_string()];
            record.extend(self.columns.iter().map(|(_, cells)| cells[row].render()));
            writer.write_record(&record)?;
        }
        writer
            .flush()
            .map_err(|error| MetricsError::io(path, error))?;
        Ok(())
    }

    fn column_position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|(column, _)| column == name)
    }

    fn require_column(&self, name: &str) -> Result<usize> {
        self.column_position(name)
            .ok_or_else(|| MetricsError::validation(format!("unknown column {name:?}")))
    }

    fn row_position(&self, id: &EntityId) -> Result<usize> {
        self.rows
            .get(id)
            .copied()
            .ok_or_else(|| MetricsError::validation(format!("entity {id} is not in the table")))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::{Cell, MetricsTable};
    use crate::model::EntityId;

    fn qid(value: &str) -> EntityId {
        EntityId::parse(value).expect("qid")
    }

    #[test]
    fn duplicate_ids_collapse_to_one_row() {
        let table = MetricsTable::from_raw_ids(["Q2", "Q1", "Q2"]).expect("table");
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn select_rows_matches_predicate() {
        let mut table = MetricsTable::from_raw_ids(["Q1", "Q2", "Q3"]).expect("table");
        table.assign("enwikititle", Cell::Text(None));
        table
            .set(&qid("Q1"), "enwikititle", Cell::Text(Some("Paris".to_string())))
            .expect("set");
        table
            .set(&qid("Q3"), "enwikititle", Cell::Text(Some("Paris".to_string())))
            .expect("set");

        let rows = table.select_rows("enwikititle", |cell| cell.as_text() == Some("Paris"));
        assert_eq!(rows, vec![qid("Q1"), qid("Q3")]);
        assert!(table.select_rows("missing", |_| true).is_empty());
    }

    #[test]
    fn sum_columns_adds_per_row() {
        let mut table = MetricsTable::from_raw_ids(["Q1", "Q2"]).expect("table");
        table.assign("a", Cell::Count(0));
        table.assign("b", Cell::Count(0));
        table.add_count(&qid("Q1"), "a", 3).expect("add");
        table.add_count(&qid("Q1"), "b", 4).expect("add");
        table.add_count(&qid("Q2"), "b", 1).expect("add");

        table.sum_columns("total", &["a", "b"]).expect("sum");
        assert_eq!(table.count(&qid("Q1"), "total"), Some(7));
        assert_eq!(table.count(&qid("Q2"), "total"), Some(1));
        assert!(table.sum_columns("bad", &["a", "nope"]).is_err());
    }

    #[test]
    fn set_rejects_unknown_rows_and_columns() {
        let mut table = MetricsTable::from_raw_ids(["Q1"]).expect("table");
        table.assign("a", Cell::Count(0));
        assert!(table.set(&qid("Q9"), "a", Cell::Count(1)).is_err());
        assert!(table.set(&qid("Q1"), "b", Cell::Count(1)).is_err());
    }

    #[test]
    fn csv_round_trip_keeps_input_columns_before_metrics() {
        let temp = tempdir().expect("tempdir");
        let input = temp.path().join("input.csv");
        fs::write(&input, "item,itemLabel\nQ42,Douglas Adams\nQ1,Universe\nQ42,dup\n")
            .expect("write input");

        let mut table = MetricsTable::read_csv(&input, Some("item")).expect("read");
        assert_eq!(table.len(), 2);
        assert_eq!(table.text(&qid("Q42"), "itemLabel"), Some("Douglas Adams"));
        table.assign("edits", Cell::Count(0));
        table.assign("enwikititle", Cell::Text(None));
        table.add_count(&qid("Q42"), "edits", 12).expect("add");

        let output = temp.path().join("out").join("metrics.csv");
        table.write_csv(&output).expect("write");
        let written = fs::read_to_string(&output).expect("read output");
        let lines = written.lines().collect::<Vec<_>>();
        assert_eq!(
            lines,
            vec![
                "qid,itemLabel,edits,enwikititle",
                "Q42,Douglas Adams,12,",
                "Q1,Universe,0,",
            ]
        );
    }

    #[test]
    fn read_csv_defaults_to_first_column_and_keeps_empty_cells_empty() {
        let temp = tempdir().expect("tempdir");
        let input = temp.path().join("input.csv");
        fs::write(&input, "id,note,qid\nQ7,,Q9\n").expect("write input");

        let table = MetricsTable::read_csv(&input, None).expect("read");
        assert_eq!(table.column_names().collect::<Vec<_>>(), vec!["note"]);
        assert_eq!(table.get(&qid("Q7"), "note"), Some(&Cell::Text(None)));
    }

    #[test]
    fn read_csv_rejects_malformed_ids() {
        let temp = tempdir().expect("tempdir");
        let input = temp.path().join("input.csv");
        fs::write(&input, "item\nQ42\nnot-an-id\n").expect("write input");
        assert!(MetricsTable::read_csv(&input, None).is_err());
    }

    #[test]
    fn read_csv_reports_missing_column() {
        let temp = tempdir().expect("tempdir");
        let input = temp.path().join("input.csv");
        fs::write(&input, "item\nQ42\n").expect("write input");
        let error = MetricsTable::read_csv(&input, Some("qid")).expect_err("must fail");
        assert!(error.to_string().contains("qid"));
    }
}
