use std::{hash::Hash, sync::Arc};

use fnv::FnvHashMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

/// Memo table where each key is computed at most once.
///
/// Callers racing on a key share one computation: the first runs `init`,
/// the others block on the same cell until the value is there.
#[derive(Debug)]
pub struct SingleFlight<K, V> {
    cells: Mutex<FnvHashMap<K, Arc<OnceCell<V>>>>,
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            cells: Mutex::new(FnvHashMap::default()),
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> SingleFlight<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_init(&self, key: &K, init: impl FnOnce() -> V) -> V {
        let cell = {
            let mut cells = self.cells.lock();
            match cells.get(key) {
                Some(cell) => Arc::clone(cell),
                None => {
                    let cell = Arc::new(OnceCell::new());
                    cells.insert(key.clone(), Arc::clone(&cell));
                    cell
                }
            }
        };
        // the table lock is released, only callers of this key wait here
        cell.get_or_init(init).clone()
    }

    /// Value for `key` if it has been computed
    pub fn get(&self, key: &K) -> Option<V> {
        let cell = self.cells.lock().get(key).map(Arc::clone)?;
        cell.get().cloned()
    }

    pub fn len(&self) -> usize {
        self.cells.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.lock().is_empty()
    }
}
