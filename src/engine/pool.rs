//! Size-class buffer pool backing engine allocations
//!
//! # Architecture
//!
//! ```text
//! BufferPool
//!   ├─→ SizeClass(64B)   → Free: [buf, buf]
//!   ├─→ SizeClass(77B)   → Free: [buf]
//!   ├─→ SizeClass(93B)   → Free: []
//!   └─→ ...              (~20% growth up to max_class)
//!
//! Requests above max_class are served exact-size and never recycled.
//! ```
//!
//! Every buffer is charged against an optional byte budget while it is
//! out; exhausting the budget is the engine's out-of-memory condition.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::{EngineError, EngineResult};
use crate::buffer::{Buffer, PoolTag, Reclaim};

/// Recycled buffers kept per class
const MAX_FREE_PER_CLASS: usize = 64;

pub const DEFAULT_MIN_CLASS: usize = 64;
pub const DEFAULT_MAX_CLASS: usize = 65536;

/// Largest slot size a pool accepts for its biggest class
pub const MAX_CLASS_LIMIT: usize = 64 * 1024 * 1024;

/// Buffers of one slot size
#[derive(Debug)]
struct SizeClass {
    slot_size: usize,
    free_slots: Vec<Vec<u8>>,
    in_use: u64,
    total_allocations: u64,
}

impl SizeClass {
    fn new(slot_size: usize) -> Self {
        Self {
            slot_size,
            free_slots: Vec::new(),
            in_use: 0,
            total_allocations: 0,
        }
    }

    /// Take storage for one buffer, reusing a freed one when possible
    fn take(&mut self) -> Vec<u8> {
        self.in_use += 1;
        self.total_allocations += 1;
        self.free_slots
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.slot_size))
    }

    fn give_back(&mut self, bytes: Vec<u8>) {
        self.in_use = self.in_use.saturating_sub(1);
        if bytes.capacity() >= self.slot_size && self.free_slots.len() < MAX_FREE_PER_CLASS {
            self.free_slots.push(bytes);
        }
    }

    fn can_fit(&self, size: usize) -> bool {
        size <= self.slot_size
    }
}

/// Size classes with ~20% growth between `min_size` and `max_size`
pub fn calculate_size_classes(min_size: usize, max_size: usize) -> Vec<usize> {
    let mut classes = Vec::new();
    let mut current = min_size.max(1);

    while current <= max_size {
        classes.push(current);
        let grown = (current as f64 * 1.2).ceil() as usize;
        match current.checked_add(1) {
            Some(step) => current = grown.max(step),
            None => break,
        }
    }

    classes
}

struct PoolShared {
    classes: Vec<Mutex<SizeClass>>,
    budget: Option<usize>,
    outstanding: AtomicUsize,
}

impl PoolShared {
    fn reserve(&self, charge: usize) -> bool {
        match self.budget {
            None => self
                .outstanding
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                    current.checked_add(charge)
                })
                .is_ok(),
            Some(budget) => self
                .outstanding
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                    current.checked_add(charge).filter(|&next| next <= budget)
                })
                .is_ok(),
        }
    }

    fn release(&self, charge: usize) {
        self.outstanding.fetch_sub(charge, Ordering::AcqRel);
    }
}

impl Reclaim for PoolShared {
    fn reclaim(&self, bytes: Vec<u8>, tag: PoolTag) {
        self.release(tag.charge);
        if let Some(class) = tag.class.and_then(|i| self.classes.get(i as usize)) {
            class.lock().give_back(bytes);
        }
    }
}

/// Thread-safe buffer pool
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// Create a pool
    ///
    /// # Arguments
    /// * `min_class` - Smallest slot size (default: 64 bytes)
    /// * `max_class` - Largest pooled slot size (default: 64 KB)
    /// * `budget` - Byte budget for outstanding buffers (None = unlimited)
    pub fn new(min_class: Option<usize>, max_class: Option<usize>, budget: Option<usize>) -> Self {
        let min = min_class.unwrap_or(DEFAULT_MIN_CLASS);
        let max = max_class.unwrap_or(DEFAULT_MAX_CLASS);
        let sizes = calculate_size_classes(min, max);
        debug!(classes = sizes.len(), ?budget, "Initializing buffer pool");

        Self {
            shared: Arc::new(PoolShared {
                classes: sizes.into_iter().map(|s| Mutex::new(SizeClass::new(s))).collect(),
                budget,
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    /// Allocate a buffer of exactly `size` bytes
    pub fn alloc(&self, size: usize) -> EngineResult<Buffer> {
        if size == 0 {
            return Ok(Buffer::from_vec(Vec::new()));
        }

        let class_idx = self
            .shared
            .classes
            .iter()
            .position(|sc| sc.lock().can_fit(size));

        let charge = match class_idx {
            Some(i) => self.shared.classes[i].lock().slot_size,
            None => size,
        };

        if !self.shared.reserve(charge) {
            return Err(EngineError::no_memory(format!(
                "cannot allocate {} bytes: pool budget exhausted",
                size
            )));
        }

        let mut bytes = match class_idx {
            Some(i) => self.shared.classes[i].lock().take(),
            None => {
                let mut exact = Vec::new();
                if exact.try_reserve_exact(size).is_err() {
                    self.shared.release(charge);
                    return Err(EngineError::no_memory(format!(
                        "cannot allocate {} bytes",
                        size
                    )));
                }
                exact
            }
        };
        bytes.clear();
        bytes.resize(size, 0);

        let tag = PoolTag {
            class: class_idx.map(|i| i as u16),
            charge,
        };
        let home: Arc<dyn Reclaim> = self.shared.clone();
        Ok(Buffer::pooled(bytes, home, tag))
    }

    /// Allocate a buffer holding a copy of `data`
    pub fn alloc_copy(&self, data: &[u8]) -> EngineResult<Buffer> {
        let mut buf = self.alloc(data.len())?;
        buf.copy_from_slice(data);
        Ok(buf)
    }

    /// Bytes currently charged to outstanding buffers
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            budget: self.shared.budget,
            outstanding_bytes: self.outstanding(),
            ..Default::default()
        };

        for (index, sc) in self.shared.classes.iter().enumerate() {
            let sc = sc.lock();
            stats.size_classes.push(SizeClassStats {
                index,
                slot_size: sc.slot_size,
                in_use: sc.in_use,
                free_slots: sc.free_slots.len(),
                total_allocations: sc.total_allocations,
            });
        }

        stats
    }
}

/// Statistics for the buffer pool
#[derive(Debug, Default)]
pub struct PoolStats {
    pub size_classes: Vec<SizeClassStats>,
    pub outstanding_bytes: usize,
    pub budget: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
pub struct SizeClassStats {
    pub index: usize,
    pub slot_size: usize,
    pub in_use: u64,
    pub free_slots: usize,
    pub total_allocations: u64,
}
