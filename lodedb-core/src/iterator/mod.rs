//! Ordered iteration across every storage tier
//!
//! A [`DbIterator`] merges the memtables and every level of one version
//! snapshot, hides tombstones and engine keys, and resolves values stored in
//! the value log. With a prefetch size above zero a producer thread runs
//! ahead of the consumer through a bounded channel.

mod level;
mod merge;

pub use level::LevelCursor;
pub use merge::{MergeCursor, ShadowedHook};

use crate::{is_reserved_key, KvItem, Result, ValueStruct};
use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Shared fallback returned by exhausted cursors
pub(crate) static EMPTY_VALUE: ValueStruct = ValueStruct {
    meta: 0,
    value: Bytes::new(),
};

/// A positioned, single-direction walk over sorted entries.
///
/// A cursor is created already positioned on its first entry; `key` and
/// `value` are only meaningful while `valid` returns true.
pub trait Cursor: Send {
    fn valid(&self) -> bool;
    fn key(&self) -> &[u8];
    fn value(&self) -> &ValueStruct;
    fn advance(&mut self) -> Result<()>;
}

/// Where iterators get their data from
pub(crate) trait IterSource: Send + Sync {
    /// Merged cursor over a fresh snapshot
    fn merged_cursor(&self, reverse: bool) -> Result<MergeCursor>;

    /// Materialize a stored value; `None` when the key vanished while the
    /// value was being fetched.
    fn resolve(&self, key: &[u8], value: &ValueStruct) -> Result<Option<Bytes>>;
}

/// Iterator options
#[derive(Debug, Clone, Copy, Default)]
pub struct IteratorOptions {
    /// Yield keys in descending order
    pub reverse: bool,
    /// Items buffered ahead of the consumer; 0 iterates synchronously
    pub prefetch_size: usize,
}

/// Advance `cursor` to the next user-visible item
fn next_visible(source: &dyn IterSource, cursor: &mut MergeCursor) -> Option<Result<KvItem>> {
    while cursor.valid() {
        let key = Bytes::copy_from_slice(cursor.key());
        let value = cursor.value().clone();
        if let Err(e) = cursor.advance() {
            return Some(Err(e));
        }
        if value.is_delete() || is_reserved_key(&key) {
            continue;
        }
        match source.resolve(&key, &value) {
            Ok(Some(value)) => return Some(Ok(KvItem { key, value })),
            Ok(None) => continue,
            Err(e) => return Some(Err(e)),
        }
    }
    None
}

enum Mode {
    Direct(MergeCursor),
    Prefetch {
        rx: Receiver<Result<KvItem>>,
        producer: JoinHandle<()>,
    },
    Closed,
}

/// Iterator over the database contents.
///
/// Reads committed data: [`DbIterator::rewind`] starts over from a new
/// snapshot and so observes writes made since the previous pass.
pub struct DbIterator {
    source: Arc<dyn IterSource>,
    options: IteratorOptions,
    mode: Mode,
}

impl DbIterator {
    pub(crate) fn new(source: Arc<dyn IterSource>, options: IteratorOptions) -> Result<Self> {
        let mut iter = Self {
            source,
            options,
            mode: Mode::Closed,
        };
        iter.start()?;
        Ok(iter)
    }

    fn start(&mut self) -> Result<()> {
        let cursor = self.source.merged_cursor(self.options.reverse)?;
        if self.options.prefetch_size == 0 {
            self.mode = Mode::Direct(cursor);
            return Ok(());
        }

        let (tx, rx) = bounded(self.options.prefetch_size);
        let source = self.source.clone();
        let producer = std::thread::Builder::new()
            .name("lodedb-prefetch".into())
            .spawn(move || {
                let mut cursor = cursor;
                while let Some(item) = next_visible(source.as_ref(), &mut cursor) {
                    let failed = item.is_err();
                    // A send error means the consumer went away
                    if tx.send(item).is_err() || failed {
                        break;
                    }
                }
            })?;
        self.mode = Mode::Prefetch { rx, producer };
        Ok(())
    }

    fn stop(&mut self) {
        if let Mode::Prefetch { rx, producer } = std::mem::replace(&mut self.mode, Mode::Closed) {
            // Dropping the receiver unblocks a producer waiting on a full channel
            drop(rx);
            if producer.join().is_err() {
                warn!("Prefetch thread panicked");
            }
        }
        self.mode = Mode::Closed;
    }

    /// Restart from the first key (last key when reversed) of the current state
    pub fn rewind(&mut self) -> Result<()> {
        self.stop();
        debug!("Rewinding iterator (reverse: {})", self.options.reverse);
        self.start()
    }

    /// Release the snapshot and stop any prefetching
    pub fn close(&mut self) {
        self.stop();
    }

    /// Whether this iterator walks keys in descending order
    pub fn is_reverse(&self) -> bool {
        self.options.reverse
    }
}

impl Iterator for DbIterator {
    type Item = Result<KvItem>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.mode {
            Mode::Direct(cursor) => next_visible(self.source.as_ref(), cursor),
            Mode::Prefetch { rx, .. } => rx.recv().ok(),
            Mode::Closed => None,
        }
    }
}

impl Drop for DbIterator {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for DbIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.mode {
            Mode::Direct(_) => "direct",
            Mode::Prefetch { .. } => "prefetch",
            Mode::Closed => "closed",
        };
        f.debug_struct("DbIterator")
            .field("options", &self.options)
            .field("mode", &mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Source over a fixed, sorted list of entries
    struct StaticSource {
        entries: Mutex<Vec<(Bytes, ValueStruct)>>,
    }

    struct OwnedCursor {
        entries: Vec<(Bytes, ValueStruct)>,
        pos: usize,
    }

    impl Cursor for OwnedCursor {
        fn valid(&self) -> bool {
            self.pos < self.entries.len()
        }
        fn key(&self) -> &[u8] {
            &self.entries[self.pos].0
        }
        fn value(&self) -> &ValueStruct {
            &self.entries[self.pos].1
        }
        fn advance(&mut self) -> Result<()> {
            self.pos += 1;
            Ok(())
        }
    }

    impl IterSource for StaticSource {
        fn merged_cursor(&self, reverse: bool) -> Result<MergeCursor> {
            let mut entries = self.entries.lock().clone();
            if reverse {
                entries.reverse();
            }
            Ok(MergeCursor::new(
                vec![Box::new(OwnedCursor { entries, pos: 0 })],
                reverse,
            ))
        }

        fn resolve(&self, _key: &[u8], value: &ValueStruct) -> Result<Option<Bytes>> {
            Ok(Some(value.value.clone()))
        }
    }

    fn source() -> Arc<StaticSource> {
        let mut entries = Vec::new();
        for i in 0..50u32 {
            let key = Bytes::from(format!("k{:02}", i));
            let value = if i % 10 == 3 {
                ValueStruct::tombstone()
            } else {
                ValueStruct::new(0, Bytes::from(format!("v{}", i)))
            };
            entries.push((key, value));
        }
        entries.push((
            Bytes::from_static(crate::HEAD_KEY),
            ValueStruct::new(0, Bytes::from("head")),
        ));
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Arc::new(StaticSource {
            entries: Mutex::new(entries),
        })
    }

    fn keys(iter: &mut DbIterator) -> Vec<Bytes> {
        iter.map(|item| item.unwrap().key).collect()
    }

    #[test]
    fn test_iterator_hides_tombstones_and_reserved_keys() {
        for prefetch_size in [0, 4] {
            let options = IteratorOptions {
                reverse: false,
                prefetch_size,
            };
            let mut iter = DbIterator::new(source(), options).unwrap();
            let keys = keys(&mut iter);
            assert_eq!(keys.len(), 45);
            assert!(keys.windows(2).all(|w| w[0] < w[1]));
            assert!(!keys.iter().any(|k| k.as_ref() == b"k13"));
        }
    }

    #[test]
    fn test_reverse_is_mirror_of_forward() {
        let forward = keys(&mut DbIterator::new(source(), IteratorOptions::default()).unwrap());
        let mut reverse = keys(
            &mut DbIterator::new(
                source(),
                IteratorOptions {
                    reverse: true,
                    prefetch_size: 2,
                },
            )
            .unwrap(),
        );
        reverse.reverse();
        assert_eq!(forward, reverse);
    }

    #[test]
    fn test_rewind_observes_new_state() {
        let src = source();
        let options = IteratorOptions {
            reverse: false,
            prefetch_size: 1,
        };
        let mut iter = DbIterator::new(src.clone(), options).unwrap();
        assert_eq!(iter.next().unwrap().unwrap().key, Bytes::from("k00"));
        assert_eq!(iter.next().unwrap().unwrap().key, Bytes::from("k01"));

        src.entries
            .lock()
            .insert(0, (Bytes::from("a"), ValueStruct::new(0, Bytes::from("new"))));
        iter.rewind().unwrap();
        assert_eq!(iter.next().unwrap().unwrap().key, Bytes::from("a"));
        assert_eq!(keys(&mut iter).len(), 45);

        iter.close();
        assert!(iter.next().is_none());
    }
}
