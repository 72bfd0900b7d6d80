// ============================================================================
// Batched sequence identifiers
// ============================================================================
//
// One generator per sequence, shared by every session of a factory. A block
// of `allocation_size` values is reserved with one database round trip and
// handed out locally:
//
//   fast path: read-lock the current block, atomically take the next slot
//   slow path: the block is exhausted (or absent); take the allocation lock,
//              re-check that no other thread replaced the block meanwhile,
//              then fetch the next sequence value and install a new block
//
// The sequence must advance by exactly `allocation_size` per call; the
// generator trusts this and does not verify it.
//
// ============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{Level, event};

use crate::connection::Connection;
use crate::core::{OrmError, Result};

#[derive(Debug)]
struct Block {
    /// Last value of the block, inclusive.
    last: i64,
    next: AtomicI64,
}

impl Block {
    fn new(first: i64, size: u32) -> Self {
        Self {
            last: first + i64::from(size) - 1,
            next: AtomicI64::new(first),
        }
    }

    fn take(&self) -> Option<i64> {
        let value = self.next.fetch_add(1, Ordering::SeqCst);
        (value <= self.last).then_some(value)
    }
}

#[derive(Debug)]
pub struct SequenceGenerator {
    sequence: String,
    allocation_size: u32,
    block: RwLock<Option<Arc<Block>>>,
    allocation: Mutex<()>,
}

impl SequenceGenerator {
    pub fn new(sequence: impl Into<String>, allocation_size: u32) -> Result<Self> {
        let sequence = sequence.into();
        if allocation_size == 0 {
            return Err(OrmError::Configuration(format!(
                "sequence '{}' needs an allocation size of at least 1",
                sequence
            )));
        }
        Ok(Self {
            sequence,
            allocation_size,
            block: RwLock::new(None),
            allocation: Mutex::new(()),
        })
    }

    pub fn sequence(&self) -> &str {
        &self.sequence
    }

    pub fn allocation_size(&self) -> u32 {
        self.allocation_size
    }

    pub fn next(&self, conn: &mut dyn Connection) -> Result<i64> {
        loop {
            let current = self.block.read()?.clone();
            if let Some(value) = current.as_ref().and_then(|block| block.take()) {
                return Ok(value);
            }

            let _allocating = self.allocation.lock()?;
            let installed = self.block.read()?.clone();
            let replaced = match (&current, &installed) {
                (Some(a), Some(b)) => !Arc::ptr_eq(a, b),
                (None, Some(_)) => true,
                _ => false,
            };
            if replaced {
                // Another thread allocated while we waited; retry on its block.
                continue;
            }

            let first = conn.next_sequence_value(&self.sequence)?;
            let block = Arc::new(Block::new(first, self.allocation_size));
            event!(
                Level::DEBUG,
                sequence = %self.sequence,
                first = first,
                last = block.last,
                "Allocated identifier block"
            );
            let value = block.take();
            *self.block.write()? = Some(block);
            if let Some(value) = value {
                return Ok(value);
            }
        }
    }
}

/// Sequence generators of one session factory, keyed by sequence name.
#[derive(Debug, Default)]
pub struct IdGenerators {
    generators: Mutex<HashMap<String, Arc<SequenceGenerator>>>,
}

impl IdGenerators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generator(&self, sequence: &str, allocation_size: u32) -> Result<Arc<SequenceGenerator>> {
        let mut generators = self.generators.lock()?;
        if let Some(existing) = generators.get(sequence) {
            if existing.allocation_size() != allocation_size {
                return Err(OrmError::Configuration(format!(
                    "sequence '{}' is used with allocation sizes {} and {}",
                    sequence,
                    existing.allocation_size(),
                    allocation_size
                )));
            }
            return Ok(Arc::clone(existing));
        }
        let generator = Arc::new(SequenceGenerator::new(sequence, allocation_size)?);
        generators.insert(sequence.to_string(), Arc::clone(&generator));
        Ok(generator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MemoryDatabase;

    #[test]
    fn test_block_is_used_before_reallocation() {
        let db = MemoryDatabase::new();
        db.create_sequence("seq", 1, 5).unwrap();
        let mut conn = db.open();
        let generator = SequenceGenerator::new("seq", 5).unwrap();

        let values: Vec<i64> = (0..5).map(|_| generator.next(&mut conn).unwrap()).collect();
        assert_eq!(values, vec![1, 2, 3, 4, 5]);
        assert_eq!(db.stats().sequence_calls, 1);

        assert_eq!(generator.next(&mut conn).unwrap(), 6);
        assert_eq!(db.stats().sequence_calls, 2);
    }

    #[test]
    fn test_zero_allocation_size_is_rejected() {
        assert!(matches!(
            SequenceGenerator::new("seq", 0),
            Err(OrmError::Configuration(_))
        ));
    }

    #[test]
    fn test_registry_shares_generators() {
        let generators = IdGenerators::new();
        let a = generators.generator("seq", 10).unwrap();
        let b = generators.generator("seq", 10).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(generators.generator("seq", 20).is_err());
    }
}
