use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use log::trace;

use crate::types::{MAX_PAGE_CACHE_SIZE, PageNo, page::IndexPage};

#[derive(Debug)]
struct CacheEntry {
    page: Arc<IndexPage>,
    created: u64,
    last_read: u64,
    reads: u64,
}

/// Position in eviction order: fewest reads, then oldest read, then oldest insert.
type EvictionKey = (u64, u64, u64, PageNo);

impl CacheEntry {
    fn key(&self, page_no: PageNo) -> EvictionKey {
        (self.reads, self.last_read, self.created, page_no)
    }
}

/// Bounded cache of decoded index pages. Eviction drops the least-read
/// pages first, and among equally read pages the one read longest ago.
#[derive(Debug)]
pub struct IndexPageCache {
    capacity: usize,
    entries: HashMap<PageNo, CacheEntry>,
    order: BTreeSet<EvictionKey>,
    clock: u64,
    created_count: u64,
    read_count: u64,
}

impl IndexPageCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.min(MAX_PAGE_CACHE_SIZE),
            entries: HashMap::new(),
            order: BTreeSet::new(),
            clock: 0,
            created_count: 0,
            read_count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pages stored since creation.
    pub fn created_count(&self) -> u64 {
        self.created_count
    }

    /// Cache hits since creation.
    pub fn read_count(&self) -> u64 {
        self.read_count
    }

    pub fn contains(&self, page_no: PageNo) -> bool {
        self.entries.contains_key(&page_no)
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    pub fn get(&mut self, page_no: PageNo) -> Option<Arc<IndexPage>> {
        let now = self.tick();
        let entry = self.entries.get_mut(&page_no)?;
        self.order.remove(&entry.key(page_no));
        entry.reads += 1;
        entry.last_read = now;
        self.order.insert(entry.key(page_no));
        self.read_count += 1;
        Some(Arc::clone(&entry.page))
    }

    pub fn insert(&mut self, page_no: PageNo, page: Arc<IndexPage>) {
        if self.capacity == 0 {
            return;
        }
        if !self.entries.contains_key(&page_no) && self.entries.len() >= self.capacity {
            self.evict(self.entries.len() + 1 - self.capacity);
        }
        let now = self.tick();
        let entry = CacheEntry {
            page,
            created: now,
            last_read: 0,
            reads: 0,
        };
        self.order.insert(entry.key(page_no));
        if let Some(old) = self.entries.insert(page_no, entry) {
            self.order.remove(&old.key(page_no));
        }
        self.created_count += 1;
    }

    /// Change capacity, evicting pages when shrinking. 0 disables caching.
    pub fn resize(&mut self, capacity: usize) {
        let capacity = capacity.min(MAX_PAGE_CACHE_SIZE);
        if self.entries.len() > capacity {
            self.evict(self.entries.len() - capacity);
        }
        self.capacity = capacity;
    }

    /// Drop every page, keeping the capacity.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    fn evict(&mut self, count: usize) {
        for _ in 0..count {
            let Some((_, _, _, page_no)) = self.order.pop_first() else {
                break;
            };
            trace!("Evicting index page {} from cache", page_no);
            self.entries.remove(&page_no);
        }
    }
}
