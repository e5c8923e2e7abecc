//! Cursor-paged post feed.
//!
//! The pager owns the post sequence for one feed view. Fetches run on a
//! worker thread and report back over a channel; nothing is applied until
//! the owning event loop calls [`FeedPager::poll`] (or one of the blocking
//! wrappers), so every state change happens on the loop thread.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::model::Post;
use crate::store::{Cursor, DocumentStore, PageQuery, StoreError};

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("fetch posts: {0}")]
    Store(#[from] StoreError),
    #[error("fetch posts: timed out after {0:?}")]
    Timeout(Duration),
    #[error("fetch posts: worker exited without a result")]
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    Replace,
    Append,
}

#[derive(Debug, Clone, Copy)]
pub struct PagerConfig {
    pub page_size: usize,
    pub fetch_timeout: Duration,
}

impl Default for PagerConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }
}

/// Outcome of one completed fetch, reported by [`FeedPager::poll`].
#[derive(Debug)]
pub enum PageEvent {
    Loaded { mode: LoadMode, added: usize },
    Failed { mode: LoadMode, error: FetchError },
}

struct PendingPage {
    request_id: u64,
    mode: LoadMode,
    deadline: Instant,
    cancel_flag: Arc<AtomicBool>,
}

struct PageResponse {
    request_id: u64,
    result: Result<Vec<Post>, StoreError>,
}

pub struct FeedPager {
    store: Arc<dyn DocumentStore>,
    cfg: PagerConfig,
    posts: Vec<Post>,
    seen: HashSet<String>,
    cursor: Option<Cursor>,
    has_more: bool,
    pending: Option<PendingPage>,
    next_request_id: u64,
    response_tx: Sender<PageResponse>,
    response_rx: Receiver<PageResponse>,
}

impl FeedPager {
    pub fn new(store: Arc<dyn DocumentStore>, cfg: PagerConfig) -> Self {
        let mut cfg = cfg;
        if cfg.page_size == 0 {
            cfg.page_size = DEFAULT_PAGE_SIZE;
        }
        let (response_tx, response_rx) = unbounded();
        Self {
            store,
            cfg,
            posts: Vec::new(),
            seen: HashSet::new(),
            cursor: None,
            has_more: true,
            pending: None,
            next_request_id: 1,
            response_tx,
            response_rx,
        }
    }

    pub fn posts(&self) -> &[Post] {
        &self.posts
    }

    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor.as_ref()
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn is_loading(&self) -> bool {
        self.pending.is_some()
    }

    pub fn page_size(&self) -> usize {
        self.cfg.page_size
    }

    /// Starts a fetch of the first page. Supersedes any fetch in flight.
    pub fn request_initial(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.cancel_flag.store(true, Ordering::SeqCst);
            tracing::debug!(request_id = pending.request_id, "superseding feed fetch");
        }
        self.spawn_fetch(LoadMode::Replace, None);
    }

    /// Starts a fetch of the page after the cursor. Returns `false` without
    /// touching any state when a fetch is already in flight or the feed is
    /// exhausted.
    pub fn request_next(&mut self) -> bool {
        if self.pending.is_some() || !self.has_more {
            return false;
        }
        let after = self.cursor.clone();
        self.spawn_fetch(LoadMode::Append, after);
        true
    }

    fn spawn_fetch(&mut self, mode: LoadMode, after: Option<Cursor>) {
        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);

        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.pending = Some(PendingPage {
            request_id,
            mode,
            deadline: Instant::now() + self.cfg.fetch_timeout,
            cancel_flag: cancel_flag.clone(),
        });

        let query = PageQuery::posts(self.cfg.page_size, after);
        let store = self.store.clone();
        let tx = self.response_tx.clone();
        tracing::debug!(request_id, ?mode, page_size = query.page_size, "fetching feed page");

        thread::spawn(move || {
            if cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let result = store.query_page(&query);
            if cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let _ = tx.send(PageResponse { request_id, result });
        });
    }

    /// Applies a finished fetch, or expires one that ran past its deadline.
    /// Never blocks.
    pub fn poll(&mut self) -> Option<PageEvent> {
        while let Ok(response) = self.response_rx.try_recv() {
            if let Some(event) = self.handle_response(response) {
                return Some(event);
            }
        }
        self.expire_if_overdue()
    }

    /// Blocks until the fetch in flight completes or times out. Returns
    /// `None` when nothing is in flight.
    pub fn wait(&mut self) -> Option<PageEvent> {
        loop {
            let deadline = self.pending.as_ref()?.deadline;
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.response_rx.recv_timeout(remaining) {
                Ok(response) => {
                    if let Some(event) = self.handle_response(response) {
                        return Some(event);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(event) = self.expire_if_overdue() {
                        return Some(event);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    let pending = self.pending.take()?;
                    return Some(PageEvent::Failed {
                        mode: pending.mode,
                        error: FetchError::Disconnected,
                    });
                }
            }
        }
    }

    /// Replaces the feed with its first page.
    pub fn load_initial(&mut self) -> Result<usize, FetchError> {
        self.request_initial();
        match self.wait() {
            Some(PageEvent::Loaded { added, .. }) => Ok(added),
            Some(PageEvent::Failed { error, .. }) => Err(error),
            None => Err(FetchError::Disconnected),
        }
    }

    /// Appends the next page. `Ok(None)` means the call was a no-op.
    pub fn load_next(&mut self) -> Result<Option<usize>, FetchError> {
        if !self.request_next() {
            return Ok(None);
        }
        match self.wait() {
            Some(PageEvent::Loaded { added, .. }) => Ok(Some(added)),
            Some(PageEvent::Failed { error, .. }) => Err(error),
            None => Err(FetchError::Disconnected),
        }
    }

    fn handle_response(&mut self, response: PageResponse) -> Option<PageEvent> {
        let Some(pending) = &self.pending else {
            return None;
        };
        if pending.request_id != response.request_id {
            tracing::debug!(request_id = response.request_id, "dropping stale feed page");
            return None;
        }
        let mode = pending.mode;
        self.pending = None;

        match response.result {
            Ok(page) => {
                let added = self.apply_page(mode, page);
                Some(PageEvent::Loaded { mode, added })
            }
            Err(err) => {
                tracing::warn!(error = %err, ?mode, "failed to fetch posts");
                Some(PageEvent::Failed {
                    mode,
                    error: FetchError::Store(err),
                })
            }
        }
    }

    fn expire_if_overdue(&mut self) -> Option<PageEvent> {
        let pending = self.pending.as_ref()?;
        if Instant::now() < pending.deadline {
            return None;
        }
        let pending = self.pending.take()?;
        pending.cancel_flag.store(true, Ordering::SeqCst);
        tracing::warn!(
            request_id = pending.request_id,
            timeout = ?self.cfg.fetch_timeout,
            "feed fetch timed out"
        );
        Some(PageEvent::Failed {
            mode: pending.mode,
            error: FetchError::Timeout(self.cfg.fetch_timeout),
        })
    }

    fn apply_page(&mut self, mode: LoadMode, page: Vec<Post>) -> usize {
        let returned = page.len();
        let next_cursor = page.last().map(Cursor::after);

        if matches!(mode, LoadMode::Replace) {
            self.posts.clear();
            self.seen.clear();
        }

        let mut added = 0;
        for post in page {
            if !self.seen.insert(post.id.clone()) {
                tracing::debug!(post_id = %post.id, "skipping duplicate post");
                continue;
            }
            self.posts.push(post);
            added += 1;
        }

        match mode {
            LoadMode::Replace => self.cursor = next_cursor,
            LoadMode::Append => {
                if next_cursor.is_some() {
                    self.cursor = next_cursor;
                }
            }
        }
        self.has_more = returned == self.cfg.page_size;
        tracing::debug!(
            returned,
            added,
            total = self.posts.len(),
            has_more = self.has_more,
            "applied feed page"
        );
        added
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use crossbeam_channel::bounded;
    use parking_lot::Mutex;
    use serde_json::Value;
    use std::sync::atomic::AtomicUsize;

    fn post(idx: usize) -> Post {
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        Post {
            id: format!("p{idx:03}"),
            text: format!("post {idx}"),
            media: Vec::new(),
            user_id: "u1".into(),
            user_name: "User".into(),
            user_avatar: String::new(),
            created_at: base + ChronoDuration::seconds(idx as i64),
        }
    }

    fn seeded(count: usize) -> MemoryStore {
        let store = MemoryStore::new();
        for idx in 0..count {
            store.insert_post(post(idx));
        }
        store
    }

    fn pager(store: Arc<dyn DocumentStore>, page_size: usize) -> FeedPager {
        FeedPager::new(
            store,
            PagerConfig {
                page_size,
                fetch_timeout: Duration::from_secs(5),
            },
        )
    }

    /// Counts queries and delegates to a memory store, optionally failing or
    /// holding each query until released.
    struct ScriptedStore {
        inner: MemoryStore,
        calls: AtomicUsize,
        failures: Mutex<Vec<bool>>,
        gate: Option<Receiver<()>>,
    }

    impl ScriptedStore {
        fn new(inner: MemoryStore) -> Self {
            Self {
                inner,
                calls: AtomicUsize::new(0),
                failures: Mutex::new(Vec::new()),
                gate: None,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl DocumentStore for ScriptedStore {
        fn query_page(&self, query: &PageQuery) -> Result<Vec<Post>, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                let _ = gate.recv();
            }
            let fail = {
                let mut failures = self.failures.lock();
                if failures.is_empty() {
                    false
                } else {
                    failures.remove(0)
                }
            };
            if fail {
                return Err(StoreError::Transport("connection reset".into()));
            }
            self.inner.query_page(query)
        }

        fn query_by_field(
            &self,
            collection: &str,
            field: &str,
            value: &str,
        ) -> Result<Vec<Post>, StoreError> {
            self.inner.query_by_field(collection, field, value)
        }

        fn get_document(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
            self.inner.get_document(collection, id)
        }

        fn add_document(
            &self,
            collection: &str,
            fields: Value,
            server_timestamp: Option<&str>,
        ) -> Result<String, StoreError> {
            self.inner.add_document(collection, fields, server_timestamp)
        }

        fn merge_document(
            &self,
            collection: &str,
            id: &str,
            fields: Value,
        ) -> Result<(), StoreError> {
            self.inner.merge_document(collection, id, fields)
        }
    }

    #[test]
    fn pages_through_forty_five_posts() {
        let mut pager = pager(Arc::new(seeded(45)), 20);

        assert_eq!(pager.load_initial().unwrap(), 20);
        assert!(pager.has_more());

        assert_eq!(pager.load_next().unwrap(), Some(20));
        assert_eq!(pager.posts().len(), 40);
        assert!(pager.has_more());

        assert_eq!(pager.load_next().unwrap(), Some(5));
        assert_eq!(pager.posts().len(), 45);
        assert!(!pager.has_more());

        assert_eq!(pager.load_next().unwrap(), None);
        assert_eq!(pager.posts().len(), 45);
    }

    #[test]
    fn sequence_is_descending_without_duplicates() {
        let mut pager = pager(Arc::new(seeded(33)), 4);
        pager.load_initial().unwrap();
        while pager.has_more() {
            pager.load_next().unwrap();
        }
        let posts = pager.posts();
        assert_eq!(posts.len(), 33);
        for pair in posts.windows(2) {
            assert!(pair[0].created_at > pair[1].created_at);
        }
        let ids: HashSet<_> = posts.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids.len(), posts.len());
    }

    #[test]
    fn initial_load_replaces_instead_of_merging() {
        let mut pager = pager(Arc::new(seeded(30)), 20);
        pager.load_initial().unwrap();
        pager.load_initial().unwrap();
        assert_eq!(pager.posts().len(), 20);
        assert_eq!(pager.posts()[0].id, "p029");
    }

    #[test]
    fn short_page_stops_pagination() {
        let store = Arc::new(ScriptedStore::new(seeded(7)));
        let mut pager = pager(store.clone(), 20);
        assert_eq!(pager.load_initial().unwrap(), 7);
        assert!(!pager.has_more());
        assert_eq!(pager.load_next().unwrap(), None);
        assert_eq!(store.calls(), 1);
    }

    #[test]
    fn empty_store_leaves_cursor_unset() {
        let mut pager = pager(Arc::new(MemoryStore::new()), 20);
        assert_eq!(pager.load_initial().unwrap(), 0);
        assert!(pager.cursor().is_none());
        assert!(!pager.has_more());
    }

    #[test]
    fn failed_fetch_leaves_state_untouched_and_allows_retry() {
        let store = Arc::new(ScriptedStore::new(seeded(45)));
        let mut pager = pager(store.clone(), 20);
        pager.load_initial().unwrap();

        let before_ids: Vec<String> = pager.posts().iter().map(|p| p.id.clone()).collect();
        let before_cursor = pager.cursor().cloned();

        store.failures.lock().push(true);
        let err = pager.load_next().unwrap_err();
        assert!(matches!(err, FetchError::Store(StoreError::Transport(_))));

        let after_ids: Vec<String> = pager.posts().iter().map(|p| p.id.clone()).collect();
        assert_eq!(before_ids, after_ids);
        assert_eq!(before_cursor.as_ref(), pager.cursor());
        assert!(!pager.is_loading());
        assert!(pager.has_more());

        assert_eq!(pager.load_next().unwrap(), Some(20));
        assert_eq!(pager.posts().len(), 40);
    }

    #[test]
    fn next_while_in_flight_is_a_no_op() {
        let (release_tx, release_rx) = bounded(4);
        let mut scripted = ScriptedStore::new(seeded(45));
        scripted.gate = Some(release_rx);
        let store = Arc::new(scripted);
        let mut pager = pager(store.clone(), 20);

        release_tx.send(()).unwrap();
        pager.load_initial().unwrap();
        let cursor = pager.cursor().cloned();

        assert!(pager.request_next());
        assert!(!pager.request_next());
        assert!(!pager.request_next());
        assert_eq!(pager.posts().len(), 20);
        assert_eq!(pager.cursor(), cursor.as_ref());
        assert!(pager.has_more());

        release_tx.send(()).unwrap();
        match pager.wait() {
            Some(PageEvent::Loaded { mode, added }) => {
                assert_eq!(mode, LoadMode::Append);
                assert_eq!(added, 20);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(store.calls(), 2);
    }

    #[test]
    fn timeout_clears_in_flight_and_ignores_late_page() {
        let (release_tx, release_rx) = bounded(4);
        let mut scripted = ScriptedStore::new(seeded(45));
        scripted.gate = Some(release_rx);
        let store = Arc::new(scripted);
        let mut pager = FeedPager::new(
            store.clone(),
            PagerConfig {
                page_size: 20,
                fetch_timeout: Duration::from_millis(50),
            },
        );

        let err = pager.load_initial().unwrap_err();
        assert!(matches!(err, FetchError::Timeout(_)));
        assert!(!pager.is_loading());
        assert!(pager.posts().is_empty());

        // The late page from the first request must not land.
        release_tx.send(()).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(pager.poll().is_none());
        assert!(pager.posts().is_empty());

        release_tx.send(()).unwrap();
        assert!(pager.request_next());
        match pager.wait() {
            Some(PageEvent::Loaded { added, .. }) => assert_eq!(added, 20),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn duplicate_ids_from_store_are_dropped() {
        struct RepeatingStore {
            inner: MemoryStore,
        }

        impl DocumentStore for RepeatingStore {
            fn query_page(&self, query: &PageQuery) -> Result<Vec<Post>, StoreError> {
                // Ignores the cursor so every page repeats the first one.
                let mut fresh = query.clone();
                fresh.after = None;
                self.inner.query_page(&fresh)
            }
            fn query_by_field(&self, c: &str, f: &str, v: &str) -> Result<Vec<Post>, StoreError> {
                self.inner.query_by_field(c, f, v)
            }
            fn get_document(&self, c: &str, id: &str) -> Result<Option<Value>, StoreError> {
                self.inner.get_document(c, id)
            }
            fn add_document(
                &self,
                c: &str,
                fields: Value,
                ts: Option<&str>,
            ) -> Result<String, StoreError> {
                self.inner.add_document(c, fields, ts)
            }
            fn merge_document(&self, c: &str, id: &str, fields: Value) -> Result<(), StoreError> {
                self.inner.merge_document(c, id, fields)
            }
        }

        let mut pager = pager(Arc::new(RepeatingStore { inner: seeded(10) }), 5);
        pager.load_initial().unwrap();
        assert_eq!(pager.load_next().unwrap(), Some(0));
        assert_eq!(pager.posts().len(), 5);
    }
}
