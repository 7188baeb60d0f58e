//! Simulated devices under test.
//!
//! The pool is generated once at startup and never mutated. DUTs are handed
//! out strictly in pool order through a monotonic cursor; a consumed DUT is
//! never returned to the pool.

use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;

/// Upper bound (exclusive) of generated warpage values, in millimetres
const MAX_WARPAGE_MM: f64 = 0.2;

/// A single simulated device
#[derive(Debug, Clone, PartialEq)]
pub struct DutRecord {
    /// Index-derived identifier (`DUT00001` for the first device)
    pub uid: String,
    pub barcode: String,
    /// Electronic chip ID
    pub ecid: String,
    /// Warpage in millimetres
    pub warpage: f64,
    pub test_count: u32,
}

impl DutRecord {
    /// Generate the record at `index` (0-based) of a lot
    pub fn generate<R: Rng>(lot_id: &str, index: usize, rng: &mut R) -> Self {
        let serial = index + 1;
        let warpage = (rng.gen_range(0.0..MAX_WARPAGE_MM) * 1000.0).round() / 1000.0;

        DutRecord {
            uid: format!("DUT{serial:05}"),
            barcode: format!("{lot_id}-{serial:05}-{:04X}", rng.gen::<u16>()),
            ecid: format!("{:016X}", rng.gen::<u64>()),
            warpage: warpage.min(MAX_WARPAGE_MM - 0.001),
            test_count: 0,
        }
    }
}

/// Ordered, immutable sequence of DUTs with a consumption cursor
#[derive(Debug)]
pub struct DutPool {
    records: Vec<Arc<DutRecord>>,
    cursor: AtomicUsize,
}

impl DutPool {
    /// Build a pool from pre-made records
    pub fn from_records(records: Vec<DutRecord>) -> Self {
        DutPool {
            records: records.into_iter().map(Arc::new).collect(),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Generate `units` random DUTs for a lot
    pub fn generate<R: Rng>(lot_id: &str, units: usize, rng: &mut R) -> Self {
        let records = (0..units)
            .map(|index| DutRecord::generate(lot_id, index, &mut *rng))
            .collect();
        info!(lot_id, units, "Generated DUT pool");
        Self::from_records(records)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Number of DUTs consumed so far
    pub fn consumed(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }

    /// Take the DUT at the cursor and advance it.
    ///
    /// Returns `None` once the cursor has reached the pool length; the
    /// cursor never moves past it.
    pub fn take_next(&self) -> Option<Arc<DutRecord>> {
        let len = self.records.len();
        self.cursor
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cursor| {
                (cursor < len).then_some(cursor + 1)
            })
            .ok()
            .map(|index| Arc::clone(&self.records[index]))
    }
}
