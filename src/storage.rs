//! Shared in-memory state mutated by the command dispatcher.
//!
//! Provides three thread-safe stores, each behind its own lock:
//! - `AllocationTable`: peer IP -> DUT currently checked out to it
//! - `SiteTemperatures`: site number -> last set temperature
//! - `SummaryLog`: append-only list of completed test results
//!
//! Every operation is a single critical section on one lock. No operation
//! takes a second lock while holding the first.

use crate::dut::{DutPool, DutRecord};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, info, trace};

/// Temperature reported for sites that were never set
pub const DEFAULT_SITE_TEMP: f64 = 75.0;

/// Result of asking for a DUT
#[derive(Debug, Clone, PartialEq)]
pub enum Checkout {
    /// The peer already held this DUT
    Held(Arc<DutRecord>),
    /// A fresh DUT was taken from the pool
    Assigned(Arc<DutRecord>),
    /// The pool cursor has reached the end of the lot
    Exhausted,
}

impl Checkout {
    pub fn dut(&self) -> Option<&Arc<DutRecord>> {
        match self {
            Checkout::Held(dut) | Checkout::Assigned(dut) => Some(dut),
            Checkout::Exhausted => None,
        }
    }
}

/// Result of releasing a DUT against a submitted barcode
#[derive(Debug, Clone, PartialEq)]
pub enum Release {
    Released(Arc<DutRecord>),
    /// The peer holds a DUT with a different barcode
    Mismatch,
    /// The peer holds nothing
    NotHeld,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Peer IP -> checked-out DUT
#[derive(Debug, Default)]
pub struct AllocationTable {
    entries: Mutex<HashMap<IpAddr, Arc<DutRecord>>>,
}

impl AllocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the DUT held by `peer`, or assign the next one from `pool`.
    ///
    /// The held-check, the cursor advance and the insert happen under the
    /// table lock, so two sessions from the same peer never both draw.
    pub fn checkout(&self, peer: IpAddr, pool: &DutPool) -> Checkout {
        let mut entries = lock(&self.entries);
        if let Some(dut) = entries.get(&peer) {
            trace!(%peer, uid = %dut.uid, "DUT already held");
            return Checkout::Held(Arc::clone(dut));
        }

        match pool.take_next() {
            Some(dut) => {
                entries.insert(peer, Arc::clone(&dut));
                info!(%peer, uid = %dut.uid, barcode = %dut.barcode, ecid = %dut.ecid, "DUT assigned");
                Checkout::Assigned(dut)
            }
            None => Checkout::Exhausted,
        }
    }

    /// Release the DUT held by `peer` if its barcode matches
    pub fn release_matching(&self, peer: IpAddr, barcode: &str) -> Release {
        let mut entries = lock(&self.entries);
        let matches = match entries.get(&peer) {
            Some(dut) => dut.barcode == barcode,
            None => return Release::NotHeld,
        };
        if !matches {
            return Release::Mismatch;
        }
        entries
            .remove(&peer)
            .map_or(Release::NotHeld, Release::Released)
    }

    /// Drop whatever `peer` holds; the DUT is discarded, not recycled
    pub fn release(&self, peer: IpAddr) -> Option<Arc<DutRecord>> {
        let released = lock(&self.entries).remove(&peer);
        if let Some(dut) = &released {
            debug!(%peer, uid = %dut.uid, "DUT released");
        }
        released
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }
}

/// Site number -> last set temperature
#[derive(Debug, Default)]
pub struct SiteTemperatures {
    temps: RwLock<HashMap<u32, f64>>,
}

impl SiteTemperatures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, site: u32) -> f64 {
        self.temps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&site)
            .copied()
            .unwrap_or(DEFAULT_SITE_TEMP)
    }

    pub fn set(&self, site: u32, temp: f64) {
        self.temps
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(site, temp);
        debug!(site, temp, "Site temperature set");
    }
}

/// A completed test result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryEntry {
    pub site: u32,
    pub barcode: String,
    pub bin: String,
}

/// Append-only result log
#[derive(Debug, Default)]
pub struct SummaryLog {
    entries: Mutex<Vec<SummaryEntry>>,
}

impl SummaryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, entry: SummaryEntry) {
        trace!(site = entry.site, barcode = %entry.barcode, bin = %entry.bin, "Result logged");
        lock(&self.entries).push(entry);
    }

    /// Copy of every entry in append order
    pub fn snapshot(&self) -> Vec<SummaryEntry> {
        lock(&self.entries).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn pool(n: usize) -> DutPool {
        DutPool::from_records(
            (0..n)
                .map(|i| DutRecord {
                    uid: format!("DUT{:05}", i + 1),
                    barcode: format!("BC{i}"),
                    ecid: format!("{i:016X}"),
                    warpage: 0.05,
                    test_count: 0,
                })
                .collect(),
        )
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn test_checkout_is_idempotent() {
        let pool = pool(3);
        let table = AllocationTable::new();

        let first = table.checkout(ip(1), &pool);
        assert!(matches!(first, Checkout::Assigned(_)));
        let again = table.checkout(ip(1), &pool);
        assert!(matches!(again, Checkout::Held(_)));
        assert_eq!(first.dut(), again.dut());
        assert_eq!(pool.consumed(), 1);
    }

    #[test]
    fn test_checkout_in_pool_order_until_exhausted() {
        let pool = pool(2);
        let table = AllocationTable::new();

        assert_eq!(table.checkout(ip(1), &pool).dut().unwrap().barcode, "BC0");
        assert_eq!(table.checkout(ip(2), &pool).dut().unwrap().barcode, "BC1");
        assert_eq!(table.checkout(ip(3), &pool), Checkout::Exhausted);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_release_matching() {
        let pool = pool(2);
        let table = AllocationTable::new();
        table.checkout(ip(1), &pool);

        assert_eq!(table.release_matching(ip(1), "nope"), Release::Mismatch);
        assert_eq!(table.release_matching(ip(2), "BC0"), Release::NotHeld);
        assert!(matches!(
            table.release_matching(ip(1), "BC0"),
            Release::Released(_)
        ));
        assert!(table.release(ip(1)).is_none());

        // Released DUTs are not recycled
        assert_eq!(table.checkout(ip(1), &pool).dut().unwrap().barcode, "BC1");
    }

    #[test]
    fn test_release_on_disconnect() {
        let pool = pool(2);
        let table = AllocationTable::new();
        table.checkout(ip(1), &pool);

        assert_eq!(table.release(ip(1)).unwrap().barcode, "BC0");
        assert!(table.release(ip(1)).is_none());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_concurrent_checkout_distinct() {
        let pool = Arc::new(pool(50));
        let table = Arc::new(AllocationTable::new());

        let handles: Vec<_> = (0..50u8)
            .map(|i| {
                let pool = Arc::clone(&pool);
                let table = Arc::clone(&table);
                thread::spawn(move || table.checkout(ip(i), &pool).dut().unwrap().barcode.clone())
            })
            .collect();

        let mut barcodes: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        barcodes.sort();
        barcodes.dedup();
        assert_eq!(barcodes.len(), 50);
        assert_eq!(pool.consumed(), 50);
    }

    #[test]
    fn test_site_temperature_default_and_set() {
        let temps = SiteTemperatures::new();
        assert_eq!(temps.get(4), DEFAULT_SITE_TEMP);

        temps.set(4, 85.5);
        temps.set(4, 90.0);
        assert_eq!(temps.get(4), 90.0);
        assert_eq!(temps.get(5), DEFAULT_SITE_TEMP);
    }

    #[test]
    fn test_concurrent_site_temperatures() {
        let temps = Arc::new(SiteTemperatures::new());

        let handles: Vec<_> = (0..8u32)
            .map(|site| {
                let temps = Arc::clone(&temps);
                thread::spawn(move || {
                    for i in 0..200 {
                        temps.set(site, f64::from(site * 10 + i % 2));
                    }
                    temps.set(site, f64::from(site * 10));
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        for site in 0..8u32 {
            assert_eq!(temps.get(site), f64::from(site * 10));
        }
    }

    #[test]
    fn test_summary_log_append_order() {
        let log = SummaryLog::new();
        log.append(SummaryEntry {
            site: 1,
            barcode: "A".to_string(),
            bin: "1".to_string(),
        });
        log.append(SummaryEntry {
            site: 2,
            barcode: "B".to_string(),
            bin: "7".to_string(),
        });

        let entries = log.snapshot();
        assert_eq!(log.len(), 2);
        assert_eq!(entries[0].barcode, "A");
        assert_eq!(entries[1].bin, "7");
    }
}
