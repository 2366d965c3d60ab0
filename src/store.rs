// =============================================================================
// Order Store — file-backed, lock-guarded order persistence
// =============================================================================
//
// The store is one JSON array of orders shared by several OS processes: the
// registration callers and the periodic evaluator. Every read-modify-write
// runs as a `StoreTxn`: acquire the exclusive advisory lock, load a fresh
// copy, mutate in memory, then commit with an atomic tmp + rename write.
// In-memory copies are never carried across lock boundaries.
//
// The advisory lock lives on a sidecar `<store>.lock` file, not the store
// file itself: the atomic rename on commit replaces the store inode, which
// would silently defeat a lock held on it.
// =============================================================================

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use tracing::{debug, warn};

use crate::order::{Order, OrderId, OrderKind};

/// Handle to the shared order store file. Holds no state besides the path;
/// all reads go back to disk under a lock.
#[derive(Debug, Clone)]
pub struct OrderStore {
    path: PathBuf,
}

impl OrderStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut os = self.path.clone().into_os_string();
        os.push(".lock");
        PathBuf::from(os)
    }

    /// Open the sidecar lock file and take the advisory lock, blocking until
    /// it is granted.
    fn acquire_lock(&self, exclusive: bool) -> Result<File> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create store directory {}", parent.display())
                })?;
            }
        }

        let lock_path = self.lock_path();
        let lock = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("failed to open lock file {}", lock_path.display()))?;

        if exclusive {
            lock.lock_exclusive()
        } else {
            lock.lock_shared()
        }
        .with_context(|| format!("failed to lock {}", lock_path.display()))?;

        Ok(lock)
    }

    /// Read the store document. A missing or unreadable/corrupt file yields
    /// an empty list: the store is init-on-read and a broken document must
    /// not take the whole engine down.
    fn read_orders(&self) -> Vec<Order> {
        match fs::read_to_string(&self.path) {
            Ok(text) => match serde_json::from_str::<Vec<Order>>(&text) {
                Ok(orders) => orders,
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        error = %e,
                        "order store file is corrupt — treating as empty"
                    );
                    Vec::new()
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "order store file missing — empty store");
                Vec::new()
            }
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "order store file unreadable — treating as empty"
                );
                Vec::new()
            }
        }
    }

    /// Read-only view of the current orders, taken under a shared lock.
    pub fn snapshot(&self) -> Result<Vec<Order>> {
        let _lock = self.acquire_lock(false)?;
        Ok(self.read_orders())
    }

    /// Begin a read-modify-write transaction: exclusive lock plus a fresh
    /// load. The lock is held until the transaction commits or is dropped.
    pub fn begin(&self) -> Result<StoreTxn<'_>> {
        let lock = self.acquire_lock(true)?;
        let orders = self.read_orders();
        debug!(
            path = %self.path.display(),
            count = orders.len(),
            "store transaction started"
        );
        Ok(StoreTxn {
            store: self,
            _lock: lock,
            orders,
        })
    }
}

// =============================================================================
// StoreTxn
// =============================================================================

/// An open read-modify-write transaction. Mutations happen on the in-memory
/// copy; `commit` persists atomically. Dropping without commit discards all
/// mutations and releases the lock, leaving the file untouched.
pub struct StoreTxn<'a> {
    store: &'a OrderStore,
    // Advisory lock, released when the File is dropped.
    _lock: File,
    orders: Vec<Order>,
}

impl StoreTxn<'_> {
    pub fn orders(&self) -> &[Order] {
        &self.orders
    }

    pub fn orders_mut(&mut self) -> &mut Vec<Order> {
        &mut self.orders
    }

    pub fn push(&mut self, order: Order) {
        self.orders.push(order);
    }

    pub fn find_by_id(&self, id: &OrderId, account: &str) -> Option<&Order> {
        self.orders
            .iter()
            .find(|o| &o.id == id && o.account == account)
    }

    pub fn find_by_ticker_and_kind(
        &self,
        ticker: &str,
        kind: OrderKind,
        account: &str,
    ) -> Option<&Order> {
        self.orders
            .iter()
            .find(|o| o.ticker == ticker && o.kind() == kind && o.account == account)
    }

    /// Remove one order by id within the account scope. Returns the removed
    /// order, if any.
    pub fn remove_by_id(&mut self, id: &OrderId, account: &str) -> Option<Order> {
        let idx = self
            .orders
            .iter()
            .position(|o| &o.id == id && o.account == account)?;
        Some(self.orders.remove(idx))
    }

    /// Remove every order for `ticker` within the account scope, optionally
    /// restricted to one kind. Returns the removed orders.
    pub fn remove_by_ticker(
        &mut self,
        ticker: &str,
        kind: Option<OrderKind>,
        account: &str,
    ) -> Vec<Order> {
        let mut removed = Vec::new();
        self.orders.retain(|o| {
            let matches = o.ticker == ticker
                && o.account == account
                && kind.map_or(true, |k| o.kind() == k);
            if matches {
                removed.push(o.clone());
            }
            !matches
        });
        removed
    }

    /// Persist the in-memory copy: serialize, write a tmp sibling, rename
    /// over the store file, then release the lock. A crash mid-commit leaves
    /// either the old or the new document, never a half-written one.
    pub fn commit(self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.orders)
            .context("failed to serialize order store")?;

        let mut tmp_os = self.store.path.clone().into_os_string();
        tmp_os.push(".tmp");
        let tmp_path = PathBuf::from(tmp_os);

        fs::write(&tmp_path, &json)
            .with_context(|| format!("failed to write tmp store {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.store.path).with_context(|| {
            format!("failed to rename tmp store to {}", self.store.path.display())
        })?;

        debug!(
            path = %self.store.path.display(),
            count = self.orders.len(),
            "order store committed"
        );
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::OrderDetail;

    fn store_in(dir: &tempfile::TempDir) -> OrderStore {
        OrderStore::new(dir.path().join("orders.json"))
    }

    fn stop_buy(ticker: &str, account: &str) -> Order {
        Order {
            id: OrderId::generate(OrderKind::StopBuy, ticker),
            account: account.into(),
            ticker: ticker.into(),
            detail: OrderDetail::StopBuy {
                volume: 10.0,
                stop_price: 1000.0,
            },
        }
    }

    #[test]
    fn missing_file_is_an_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.snapshot().unwrap().is_empty());
    }

    #[test]
    fn corrupt_file_is_an_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), "{not json").unwrap();
        assert!(store.snapshot().unwrap().is_empty());
    }

    #[test]
    fn push_commit_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let mut txn = store.begin().unwrap();
        txn.push(stop_buy("005930", "REAL"));
        txn.commit().unwrap();

        let orders = store.snapshot().unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].ticker, "005930");
    }

    #[test]
    fn drop_without_commit_discards_mutations() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let mut txn = store.begin().unwrap();
        txn.push(stop_buy("005930", "REAL"));
        txn.commit().unwrap();

        {
            let mut txn = store.begin().unwrap();
            txn.orders_mut().clear();
            // dropped here, no commit
        }

        assert_eq!(store.snapshot().unwrap().len(), 1);
    }

    #[test]
    fn queries_filter_by_account_scope() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let order = stop_buy("005930", "REAL");
        let id = order.id.clone();
        let mut txn = store.begin().unwrap();
        txn.push(order);
        txn.push(stop_buy("005930", "REAL2"));
        txn.commit().unwrap();

        let txn = store.begin().unwrap();
        assert!(txn.find_by_id(&id, "REAL").is_some());
        assert!(txn.find_by_id(&id, "REAL2").is_none());
        assert!(txn
            .find_by_ticker_and_kind("005930", OrderKind::StopBuy, "REAL2")
            .is_some());
        assert!(txn
            .find_by_ticker_and_kind("005930", OrderKind::StopSell, "REAL")
            .is_none());
    }

    #[test]
    fn remove_by_ticker_respects_kind_filter() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let mut txn = store.begin().unwrap();
        txn.push(stop_buy("005930", "REAL"));
        txn.push(Order {
            id: OrderId::generate(OrderKind::StopLoss, "005930"),
            account: "REAL".into(),
            ticker: "005930".into(),
            detail: OrderDetail::StopLoss { stop_price: 900.0 },
        });
        txn.push(stop_buy("000660", "REAL"));

        let removed = txn.remove_by_ticker("005930", Some(OrderKind::StopBuy), "REAL");
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].kind(), OrderKind::StopBuy);
        assert_eq!(txn.orders().len(), 2);

        let removed = txn.remove_by_ticker("005930", None, "REAL");
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].kind(), OrderKind::StopLoss);
        assert_eq!(txn.orders().len(), 1);
    }

    #[test]
    fn concurrent_registrations_both_persist() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let handles: Vec<_> = ["005930", "000660"]
            .into_iter()
            .map(|ticker| {
                let store = store.clone();
                let ticker = ticker.to_string();
                std::thread::spawn(move || {
                    let mut txn = store.begin().unwrap();
                    txn.push(stop_buy(&ticker, "REAL"));
                    txn.commit().unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let orders = store.snapshot().unwrap();
        assert_eq!(orders.len(), 2, "a registration was lost");
    }
}
