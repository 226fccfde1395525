//! In-memory response cache. Process-global: one hash plus LRU list
//! behind a single mutex, held only across hash/LRU updates, never
//! across I/O. Entries are refcounted; eviction unlinks an entry and
//! its memory is released when the last in-flight response drops it.

use crate::error::HandlerResult;
use crate::http::{Content, Response};
use hashbrown::HashMap;
use lazy_static::lazy_static;
use std::sync::{Arc, Mutex};

const NONE: usize = usize::max_value();

/// One cached response body with the metadata needed to replay it.
pub struct CacheRec {
    pub content: Vec<u8>,
    pub content_type: String,
    pub content_charset: Option<String>,
    pub last_modified: u64,
    pub gzip_encoded: bool,
}

struct Entry {
    key: String,
    rec: Arc<CacheRec>,
    expires_time: u64,
    prev: usize,
    next: usize,
}

/// Result of a cache lookup. A `Hit` carries a reference taken under
/// the cache mutex; the entry cannot be freed while it is held.
pub enum CacheLookup {
    Hit(Arc<CacheRec>),
    /// Entry fresh and not modified since the client's copy. No
    /// reference is taken for the cheap 304 path.
    NotModified,
    /// Entry expired; caller should revalidate upstream and retry
    /// with the revalidated mtime.
    Revalidate,
    Miss,
}

pub struct MemCache {
    slots: Vec<Option<Entry>>,
    free: Vec<usize>,
    map: HashMap<String, usize>,
    head: usize,
    tail: usize,
    max_items: usize,
    cached_time: u64,
}

impl MemCache {
    pub fn new(max_items: usize, cached_time: u64) -> MemCache {
        MemCache {
            slots: Vec::new(),
            free: Vec::new(),
            map: HashMap::new(),
            head: NONE,
            tail: NONE,
            max_items,
            cached_time,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    fn link(&mut self, idx: usize) {
        // add to head
        {
            let entry = self.slots[idx].as_mut().expect("linking empty slot");
            entry.prev = NONE;
            entry.next = self.head;
        }
        if self.head != NONE {
            self.slots[self.head].as_mut().expect("head entry").prev = idx;
        } else {
            self.tail = idx;
        }
        self.head = idx;
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let entry = self.slots[idx].as_ref().expect("unlinking empty slot");
            (entry.prev, entry.next)
        };
        if prev != NONE {
            self.slots[prev].as_mut().expect("prev entry").next = next;
        } else {
            self.head = next;
        }
        if next != NONE {
            self.slots[next].as_mut().expect("next entry").prev = prev;
        } else {
            self.tail = prev;
        }
    }

    fn remove(&mut self, idx: usize) {
        self.unlink(idx);
        let entry = self.slots[idx].take().expect("removing empty slot");
        self.map.remove(&entry.key);
        self.free.push(idx);
    }

    /// Evict unpinned entries from the LRU tail while over capacity.
    /// Pinned entries (live responses still hold the bytes) are
    /// skipped, so the cache can transiently exceed its capacity.
    fn check_size(&mut self) {
        while self.map.len() > self.max_items {
            let mut idx = self.tail;
            while idx != NONE {
                let entry = self.slots[idx].as_ref().expect("lru entry");
                if Arc::strong_count(&entry.rec) == 1 {
                    break;
                }
                idx = entry.prev;
            }
            if idx == NONE {
                break;
            }
            self.remove(idx);
        }
    }

    /// Look a key up. `loop_time` is the net thread's monotonic clock
    /// in microseconds.
    pub fn try_get(
        &mut self,
        key: &str,
        if_modified_since: Option<u64>,
        revalidated_mtime: Option<u64>,
        loop_time: u64,
    ) -> CacheLookup {
        if key.starts_with(' ') || key.starts_with('*') {
            return CacheLookup::Miss;
        }
        let idx = match self.map.get(key) {
            Some(idx) => *idx,
            None => return CacheLookup::Miss,
        };

        let fresh = {
            let entry = self.slots[idx].as_mut().expect("mapped entry");
            if revalidated_mtime == Some(entry.rec.last_modified) {
                entry.expires_time = loop_time + self.cached_time;
            }
            loop_time <= entry.expires_time
        };

        if fresh {
            if self.head != idx {
                self.unlink(idx);
                self.link(idx);
            }
            let entry = self.slots[idx].as_ref().expect("mapped entry");
            let not_modified = if_modified_since
                .map(|ims| entry.rec.last_modified <= ims)
                .unwrap_or(false);
            if not_modified {
                return CacheLookup::NotModified;
            }
            return CacheLookup::Hit(entry.rec.clone());
        }

        if revalidated_mtime.is_none() {
            return CacheLookup::Revalidate;
        }
        self.remove(idx);
        CacheLookup::Miss
    }

    /// Insert (or adopt the concurrent twin of) an entry. Returns the
    /// record now serving the key.
    pub fn put(&mut self, key: &str, rec: CacheRec, loop_time: u64) -> Arc<CacheRec> {
        if let Some(idx) = self.map.get(key).copied() {
            // key already stored by another thread
            let entry = self.slots[idx].as_ref().expect("mapped entry");
            return entry.rec.clone();
        }
        let rec = Arc::new(rec);
        let entry = Entry {
            key: key.to_owned(),
            rec: rec.clone(),
            expires_time: loop_time + self.cached_time,
            prev: NONE,
            next: NONE,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(entry);
                idx
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };
        self.map.insert(key.to_owned(), idx);
        self.link(idx);
        self.check_size();
        rec
    }

    /// Number of entries still linked in the LRU (diagnostics).
    pub fn lru_len(&self) -> usize {
        let mut count = 0;
        let mut idx = self.head;
        while idx != NONE {
            count += 1;
            idx = self.slots[idx].as_ref().expect("lru entry").next;
        }
        count
    }
}

lazy_static! {
    static ref CACHE: Mutex<MemCache> =
        Mutex::new(MemCache::new(crate::MAX_CACHED_ITEMS, crate::DEFAULT_CACHED_TIME));
}

/// Try to serve `resp` from the global cache. `Ok` means the response
/// is ready to send (the cached entity, or a 304 for a client copy
/// that is still current); `Revalidate` asks the caller to revalidate
/// upstream and retry with the revalidated mtime; `Miss` means no
/// usable entry.
pub fn cache_try(
    resp: &mut Response,
    key: &str,
    if_modified_since: Option<u64>,
    revalidated_mtime: Option<u64>,
    loop_time: u64,
) -> HandlerResult {
    let lookup = {
        let mut cache = CACHE.lock().expect("cache mutex poisoned");
        cache.try_get(key, if_modified_since, revalidated_mtime, loop_time)
    };
    match lookup {
        CacheLookup::Hit(rec) => {
            apply_to_response(&rec, resp);
            resp.content = Content::Cached(rec);
            HandlerResult::Ok
        }
        CacheLookup::NotModified => {
            resp.status_code = 304;
            resp.status = Some("Not Modified".to_owned());
            HandlerResult::Ok
        }
        CacheLookup::Revalidate => HandlerResult::Revalidate,
        CacheLookup::Miss => HandlerResult::Miss,
    }
}

fn apply_to_response(rec: &Arc<CacheRec>, resp: &mut Response) {
    resp.content_length = rec.content.len() as i64;
    resp.content_type = Some(rec.content_type.clone());
    resp.content_charset = rec.content_charset.clone();
    resp.last_modified = Some(rec.last_modified);
    resp.gzip_encoded = rec.gzip_encoded;
}

/// Store a finished file-backed response in the global cache. Only
/// small, whole-file 200 responses qualify.
pub fn cache_store_response(resp: &mut Response, loop_time: u64) {
    if resp.status_code != 0 && resp.status_code != 200 {
        return;
    }
    let key = match resp.cache_key.as_deref() {
        Some(key) if !key.is_empty() => key.to_owned(),
        _ => return,
    };
    let path = match resp.sendfile_path.as_ref() {
        Some(path) => path.clone(),
        None => return, // only cache content served from files
    };
    if resp.content_length < 0 || resp.content_length as usize > crate::MAX_CACHED_ITEM_SIZE {
        return;
    }
    let window_is_whole_file = match &resp.content {
        Content::File(fw) => fw.offset == 0 && fw.end >= fw.meta.size,
        _ => false,
    };
    if !window_is_whole_file {
        return;
    }

    {
        let cache = CACHE.lock().expect("cache mutex poisoned");
        if cache.len() >= crate::MAX_CACHED_ITEMS + 16 {
            return;
        }
    }

    if cache_try(resp, &key, None, resp.last_modified, loop_time) == HandlerResult::Ok {
        return;
    }

    // single open+read; a short read means the file changed under us
    let content = match std::fs::read(&path) {
        Ok(content) => content,
        Err(_) => {
            resp.send_http_error(500, "Internal Server Error");
            return;
        }
    };
    if content.len() as i64 != resp.content_length {
        resp.send_http_error(500, "Internal Server Error");
        return;
    }

    let rec = CacheRec {
        content,
        content_type: resp
            .content_type
            .clone()
            .unwrap_or_else(|| "text/html".to_owned()),
        content_charset: resp.content_charset.clone(),
        last_modified: resp.last_modified.unwrap_or(0),
        gzip_encoded: resp.gzip_encoded,
    };

    let rec = {
        let mut cache = CACHE.lock().expect("cache mutex poisoned");
        cache.put(&key, rec, loop_time)
    };
    apply_to_response(&rec, resp);
    resp.content = Content::Cached(rec);
}
