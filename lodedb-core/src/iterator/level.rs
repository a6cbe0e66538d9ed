//! Concatenating cursor over one sorted, non-overlapping level

use super::{Cursor, EMPTY_VALUE};
use crate::sstable::{Table, TableCursor};
use crate::{Result, ValueStruct};
use std::sync::Arc;

/// Walks the tables of a level one after another. Table cursors are opened
/// lazily so that a level with many tables costs nothing until reached.
pub struct LevelCursor {
    tables: Vec<Arc<Table>>,
    reverse: bool,
    /// Index of the table backing `current`
    table_idx: usize,
    current: Option<TableCursor>,
}

impl LevelCursor {
    /// `tables` must be sorted by key range and pairwise disjoint
    pub fn new(tables: Vec<Arc<Table>>, reverse: bool) -> Result<Self> {
        let mut cursor = Self {
            tables,
            reverse,
            table_idx: 0,
            current: None,
        };
        if !cursor.tables.is_empty() {
            let start = if reverse { cursor.tables.len() - 1 } else { 0 };
            cursor.open_from(start)?;
        }
        Ok(cursor)
    }

    /// Open the first table, starting at `idx` and moving in iteration
    /// direction, whose cursor is valid.
    fn open_from(&mut self, mut idx: usize) -> Result<()> {
        self.current = None;
        while idx < self.tables.len() {
            let cursor = self.tables[idx].cursor(self.reverse)?;
            if cursor.valid() {
                self.table_idx = idx;
                self.current = Some(cursor);
                return Ok(());
            }
            if self.reverse {
                if idx == 0 {
                    break;
                }
                idx -= 1;
            } else {
                idx += 1;
            }
        }
        Ok(())
    }
}

impl Cursor for LevelCursor {
    fn valid(&self) -> bool {
        self.current.as_ref().map_or(false, |c| c.valid())
    }

    fn key(&self) -> &[u8] {
        self.current.as_ref().map_or(&[], |c| c.key())
    }

    fn value(&self) -> &ValueStruct {
        self.current.as_ref().map_or(&EMPTY_VALUE, |c| c.value())
    }

    fn advance(&mut self) -> Result<()> {
        let Some(cursor) = self.current.as_mut() else {
            return Ok(());
        };
        cursor.advance()?;
        if cursor.valid() {
            return Ok(());
        }
        if self.reverse {
            if self.table_idx == 0 {
                self.current = None;
                return Ok(());
            }
            self.open_from(self.table_idx - 1)
        } else {
            self.open_from(self.table_idx + 1)
        }
    }
}
