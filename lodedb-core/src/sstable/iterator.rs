//! Block-by-block cursor over a single table

use super::{Block, Table};
use crate::iterator::{Cursor, EMPTY_VALUE};
use crate::{Result, ValueStruct};
use std::sync::Arc;

/// Cursor over every entry of a table, forward or reverse
///
/// Holds the table alive for as long as the cursor exists.
pub struct TableCursor {
    table: Arc<Table>,
    reverse: bool,
    block_idx: usize,
    block: Option<Arc<Block>>,
    entry_idx: usize,
}

impl TableCursor {
    pub(crate) fn new(table: Arc<Table>, reverse: bool) -> Result<Self> {
        let mut cursor = Self {
            table,
            reverse,
            block_idx: 0,
            block: None,
            entry_idx: 0,
        };
        if reverse {
            let last = cursor.table.block_count();
            if last > 0 {
                cursor.load_block(last - 1)?;
            }
        } else {
            cursor.load_block(0)?;
        }
        Ok(cursor)
    }

    /// Position at the first entry >= `key` (forward only)
    pub fn seek(&mut self, key: &[u8]) -> Result<()> {
        debug_assert!(!self.reverse);
        let idx = self.table.seek_block(key);
        self.load_block(idx)?;
        if let Some(block) = &self.block {
            self.entry_idx = block.seek(key);
            if self.entry_idx >= block.len() {
                self.next_block()?;
            }
        }
        Ok(())
    }

    fn load_block(&mut self, idx: usize) -> Result<()> {
        self.block_idx = idx;
        if idx >= self.table.block_count() {
            self.block = None;
            return Ok(());
        }
        let block = self.table.block(idx)?;
        self.entry_idx = if self.reverse {
            block.len().saturating_sub(1)
        } else {
            0
        };
        self.block = Some(block);
        Ok(())
    }

    fn next_block(&mut self) -> Result<()> {
        if self.reverse {
            if self.block_idx == 0 {
                self.block = None;
                return Ok(());
            }
            self.load_block(self.block_idx - 1)
        } else {
            self.load_block(self.block_idx + 1)
        }
    }

    fn current(&self) -> Option<&(bytes::Bytes, ValueStruct)> {
        self.block.as_ref().and_then(|b| b.entry(self.entry_idx))
    }
}

impl Cursor for TableCursor {
    fn valid(&self) -> bool {
        self.current().is_some()
    }

    fn key(&self) -> &[u8] {
        self.current().map(|(k, _)| k.as_ref()).unwrap_or(&[])
    }

    fn value(&self) -> &ValueStruct {
        self.current().map(|(_, v)| v).unwrap_or(&EMPTY_VALUE)
    }

    fn advance(&mut self) -> Result<()> {
        let Some(block) = self.block.clone() else {
            return Ok(());
        };
        if self.reverse {
            if self.entry_idx == 0 {
                return self.next_block();
            }
            self.entry_idx -= 1;
        } else {
            self.entry_idx += 1;
            if self.entry_idx >= block.len() {
                return self.next_block();
            }
        }
        Ok(())
    }
}
