//! K-way merge over heterogeneous cursors

use super::{Cursor, EMPTY_VALUE};
use crate::{Result, ValueStruct};
use std::cmp::Ordering;

/// Callback receiving every entry hidden by a newer version of the same key
pub type ShadowedHook = Box<dyn FnMut(&[u8], &ValueStruct) + Send>;

/// Merges cursors into one ordered stream of distinct keys.
///
/// Sources are ordered by recency: index 0 is the newest. When several
/// sources sit on the same key only the newest one is exposed and the rest
/// are stepped past it.
pub struct MergeCursor {
    sources: Vec<Box<dyn Cursor>>,
    reverse: bool,
    current: Option<usize>,
    on_shadowed: Option<ShadowedHook>,
}

impl MergeCursor {
    pub fn new(sources: Vec<Box<dyn Cursor>>, reverse: bool) -> Self {
        let mut merge = Self {
            sources,
            reverse,
            current: None,
            on_shadowed: None,
        };
        merge.select();
        merge
    }

    /// Report shadowed entries to `hook` as they are skipped
    pub fn with_shadowed_hook(mut self, hook: ShadowedHook) -> Self {
        self.on_shadowed = Some(hook);
        self
    }

    fn before(&self, a: &[u8], b: &[u8]) -> bool {
        let ord = a.cmp(b);
        if self.reverse {
            ord == Ordering::Greater
        } else {
            ord == Ordering::Less
        }
    }

    /// Pick the source holding the smallest (largest, if reversed) key.
    /// Strict comparison keeps the lowest index on ties.
    fn select(&mut self) {
        let mut best: Option<usize> = None;
        for (idx, source) in self.sources.iter().enumerate() {
            if !source.valid() {
                continue;
            }
            match best {
                Some(b) if !self.before(source.key(), self.sources[b].key()) => {}
                _ => best = Some(idx),
            }
        }
        self.current = best;
    }
}

impl Cursor for MergeCursor {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn key(&self) -> &[u8] {
        match self.current {
            Some(idx) => self.sources[idx].key(),
            None => &[],
        }
    }

    fn value(&self) -> &ValueStruct {
        match self.current {
            Some(idx) => self.sources[idx].value(),
            None => &EMPTY_VALUE,
        }
    }

    fn advance(&mut self) -> Result<()> {
        let Some(current) = self.current else {
            return Ok(());
        };
        let key = self.sources[current].key().to_vec();

        for idx in 0..self.sources.len() {
            if idx == current {
                continue;
            }
            let source = &mut self.sources[idx];
            if source.valid() && source.key() == key.as_slice() {
                if let Some(hook) = self.on_shadowed.as_mut() {
                    hook(source.key(), source.value());
                }
                source.advance()?;
            }
        }
        self.sources[current].advance()?;
        self.select();
        Ok(())
    }
}
