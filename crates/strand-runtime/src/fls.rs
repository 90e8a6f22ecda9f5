//! Keyed fiber-local storage
//!
//! Values are kept in a two-level table: up to 31 first-level slots, each
//! pointing at a lazily-allocated block of 32 (version, pointer) pairs. The
//! table travels with its fiber across workers; the scheduler swaps the
//! running fiber's table into thread-local reach on every context switch so
//! lookups are O(1) loads with no locking.
//!
//! Keys are generational: `delete_key` bumps the key's version, which makes
//! every value stored under the old version invisible without touching any
//! table. A recycled table borrowed from a [`KeyTablePool`] is safe for the
//! same reason.

use std::sync::{Arc, Mutex, Weak};

use strand_core::error::{FiberError, FiberResult};

/// Entries per second-level block.
pub const KEY_SECOND_LEVEL: u32 = 32;
/// First-level slots per table.
pub const KEY_FIRST_LEVEL: u32 = 31;
/// Maximum live keys per registry.
pub const KEYS_MAX: u32 = KEY_FIRST_LEVEL * KEY_SECOND_LEVEL;

/// Destructor invoked for a live value when its fiber finishes.
pub type KeyDestructor = Arc<dyn Fn(*mut ()) + Send + Sync>;

/// Handle to one storage key.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct LocalKey {
    pub(crate) index: u32,
    pub(crate) version: u32,
}

struct KeyInfo {
    version: u32,
    dtor: Option<KeyDestructor>,
}

struct RegistryInner {
    info: Vec<KeyInfo>,
    free: Vec<u32>,
}

/// Allocator of key indices, shared by all fibers of one runtime.
pub struct KeyRegistry {
    inner: Mutex<RegistryInner>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        KeyRegistry {
            inner: Mutex::new(RegistryInner {
                info: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    /// Allocate a fresh key, optionally with a destructor run for live
    /// values when their fiber finishes.
    pub fn create_key(&self, dtor: Option<KeyDestructor>) -> FiberResult<LocalKey> {
        let mut inner = self.inner.lock().expect("key registry poisoned");
        if let Some(index) = inner.free.pop() {
            let info = &mut inner.info[index as usize];
            info.dtor = dtor;
            return Ok(LocalKey {
                index,
                version: info.version,
            });
        }
        let index = inner.info.len() as u32;
        if index >= KEYS_MAX {
            return Err(FiberError::ResourceExhausted);
        }
        inner.info.push(KeyInfo { version: 1, dtor });
        Ok(LocalKey { index, version: 1 })
    }

    /// Invalidate a key. Values stored under it become unreachable; their
    /// destructors do not run (matching pthread_key_delete).
    pub fn delete_key(&self, key: LocalKey) -> FiberResult<()> {
        let mut inner = self.inner.lock().expect("key registry poisoned");
        match inner.info.get_mut(key.index as usize) {
            Some(info) if info.version == key.version => {
                info.version = info.version.wrapping_add(1);
                if info.version == 0 {
                    info.version = 1;
                }
                info.dtor = None;
            }
            _ => return Err(FiberError::InvalidArgument),
        }
        inner.free.push(key.index);
        Ok(())
    }

    fn version_of(&self, index: u32) -> u32 {
        let inner = self.inner.lock().expect("key registry poisoned");
        inner.info.get(index as usize).map_or(0, |i| i.version)
    }

    fn dtor_of(&self, index: u32) -> Option<KeyDestructor> {
        let inner = self.inner.lock().expect("key registry poisoned");
        inner.info.get(index as usize).and_then(|i| i.dtor.clone())
    }
}

impl Default for KeyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

struct SubTable {
    data: [(u32, *mut ()); KEY_SECOND_LEVEL as usize],
}

impl SubTable {
    fn new() -> Box<Self> {
        Box::new(SubTable {
            data: [(0, std::ptr::null_mut()); KEY_SECOND_LEVEL as usize],
        })
    }
}

/// One fiber's storage table.
pub struct KeyTable {
    subs: [Option<Box<SubTable>>; KEY_FIRST_LEVEL as usize],
    registry: Weak<KeyRegistry>,
}

// Safety: the table is only ever accessed from the thread currently running
// its fiber; migration hands it over through the entity lock. Stored
// pointers are the caller's responsibility, as with pthread TLS.
unsafe impl Send for KeyTable {}

impl KeyTable {
    pub fn new(registry: &Arc<KeyRegistry>) -> Self {
        KeyTable {
            subs: std::array::from_fn(|_| None),
            registry: Arc::downgrade(registry),
        }
    }

    /// Value stored under `key`, or null for unset/stale entries.
    pub fn get(&self, key: LocalKey) -> *mut () {
        let subidx = (key.index / KEY_SECOND_LEVEL) as usize;
        if subidx >= KEY_FIRST_LEVEL as usize {
            return std::ptr::null_mut();
        }
        match &self.subs[subidx] {
            Some(sub) => {
                let (version, ptr) = sub.data[(key.index % KEY_SECOND_LEVEL) as usize];
                if version == key.version {
                    ptr
                } else {
                    std::ptr::null_mut()
                }
            }
            None => std::ptr::null_mut(),
        }
    }

    /// Store `value` under `key`, tagging it with the key's version.
    pub fn set(&mut self, key: LocalKey, value: *mut ()) -> FiberResult<()> {
        let subidx = (key.index / KEY_SECOND_LEVEL) as usize;
        if subidx >= KEY_FIRST_LEVEL as usize {
            return Err(FiberError::InvalidArgument);
        }
        let sub = self.subs[subidx].get_or_insert_with(SubTable::new);
        sub.data[(key.index % KEY_SECOND_LEVEL) as usize] = (key.version, value);
        Ok(())
    }

    /// Run destructors for every live entry and clear the table.
    pub fn clear(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            for sub in self.subs.iter_mut() {
                *sub = None;
            }
            return;
        };
        for (subidx, slot) in self.subs.iter_mut().enumerate() {
            if let Some(sub) = slot.take() {
                for (i, (version, ptr)) in sub.data.iter().enumerate() {
                    if !ptr.is_null() {
                        let index = subidx as u32 * KEY_SECOND_LEVEL + i as u32;
                        if registry.version_of(index) == *version {
                            if let Some(dtor) = registry.dtor_of(index) {
                                dtor(*ptr);
                            }
                        }
                    }
                }
            }
        }
    }
}

impl Drop for KeyTable {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Pool of pre-built tables for short-lived fibers of one attribute.
///
/// Returned tables keep their entries; stale values are invisible to new
/// keys through the version tags and are destructed when the pool drops.
pub struct KeyTablePool {
    free: Mutex<Vec<Box<KeyTable>>>,
}

impl KeyTablePool {
    pub fn new() -> Self {
        KeyTablePool {
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn acquire(&self) -> Option<Box<KeyTable>> {
        self.free.lock().expect("keytable pool poisoned").pop()
    }

    pub fn release(&self, table: Box<KeyTable>) {
        self.free.lock().expect("keytable pool poisoned").push(table);
    }

    pub fn len(&self) -> usize {
        self.free.lock().expect("keytable pool poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for KeyTablePool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_create_set_get() {
        let registry = Arc::new(KeyRegistry::new());
        let key = registry.create_key(None).unwrap();
        let mut table = KeyTable::new(&registry);

        assert!(table.get(key).is_null());
        let mut value = 42u32;
        table.set(key, &mut value as *mut u32 as *mut ()).unwrap();
        assert_eq!(table.get(key) as *mut u32, &mut value as *mut u32);
    }

    #[test]
    fn test_deleted_key_is_stale() {
        let registry = Arc::new(KeyRegistry::new());
        let key = registry.create_key(None).unwrap();
        let mut table = KeyTable::new(&registry);
        let mut value = 1u32;
        table.set(key, &mut value as *mut u32 as *mut ()).unwrap();

        registry.delete_key(key).unwrap();
        assert!(table.get(key).is_null());
        assert_eq!(registry.delete_key(key), Err(FiberError::InvalidArgument));
    }

    #[test]
    fn test_recycled_index_new_version() {
        let registry = Arc::new(KeyRegistry::new());
        let key1 = registry.create_key(None).unwrap();
        registry.delete_key(key1).unwrap();
        let key2 = registry.create_key(None).unwrap();
        assert_eq!(key1.index, key2.index);
        assert_ne!(key1.version, key2.version);

        // A value stored under key1 must not leak into key2.
        let mut table = KeyTable::new(&registry);
        let mut value = 9u32;
        table.set(key2, &mut value as *mut u32 as *mut ()).unwrap();
        assert!(table.get(key1).is_null());
    }

    #[test]
    fn test_destructor_runs_on_clear() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);
        let registry = Arc::new(KeyRegistry::new());
        let dtor: KeyDestructor = Arc::new(|ptr| {
            DROPS.fetch_add(1, Ordering::SeqCst);
            // Reclaim the boxed value.
            unsafe { drop(Box::from_raw(ptr as *mut u64)) };
        });
        let key = registry.create_key(Some(dtor)).unwrap();

        let mut table = KeyTable::new(&registry);
        let boxed = Box::into_raw(Box::new(5u64));
        table.set(key, boxed as *mut ()).unwrap();
        drop(table);
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_key_exhaustion() {
        let registry = Arc::new(KeyRegistry::new());
        for _ in 0..KEYS_MAX {
            registry.create_key(None).unwrap();
        }
        assert_eq!(registry.create_key(None), Err(FiberError::ResourceExhausted));
    }

    #[test]
    fn test_pool_roundtrip() {
        let registry = Arc::new(KeyRegistry::new());
        let pool = KeyTablePool::new();
        assert!(pool.acquire().is_none());
        pool.release(Box::new(KeyTable::new(&registry)));
        assert_eq!(pool.len(), 1);
        assert!(pool.acquire().is_some());
        assert!(pool.is_empty());
    }
}
