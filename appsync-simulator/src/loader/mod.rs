//! Request coalescing and batching for keyed loads.
//!
//! A [`BatchCache`] hands out one shared future per canonical key. In batched
//! mode every key loaded before the task yields back to the scheduler is sent
//! to the [`BatchFn`] as a single ordered batch. In single mode each distinct
//! key is fetched on its own, straight away. Both modes keep successful
//! results for the lifetime of the cache.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use displaydoc::Display;
use futures::future::BoxFuture;
use futures::future::Shared;
use futures::FutureExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tower::BoxError;

pub(crate) mod key;

pub use self::key::CacheKey;
pub use self::key::CanonicalKey;

/// The future returned by [`BatchCache::load`].
///
/// Every load of a canonically-equal key gets a clone of the same future.
pub type Load<V> = Shared<BoxFuture<'static, Result<V, LoadError>>>;

/// Error types for loads.
///
/// A failure is shared between every caller waiting on the same key, so it has
/// to be cloneable.
#[derive(Error, Display, Debug, Clone)]
#[non_exhaustive]
pub enum LoadError {
    /// {0}
    Fetch(Arc<BoxError>),

    /// batch function returned {actual} results for {expected} keys
    ArityMismatch {
        /// Number of keys in the batch.
        expected: usize,
        /// Number of results returned.
        actual: usize,
    },

    /// the batch was dropped before it completed
    Canceled,
}

impl From<BoxError> for LoadError {
    fn from(error: BoxError) -> Self {
        LoadError::Fetch(Arc::new(error))
    }
}

/// Fetches values for a batch of keys.
///
/// The returned list must have the same length and order as `keys`: the value
/// at index `i` belongs to the key at index `i`.
#[async_trait::async_trait]
pub trait BatchFn<K, V>: Send + Sync + 'static {
    async fn load(&self, keys: Vec<K>) -> Result<Vec<V>, BoxError>;
}

/// How a [`BatchCache`] dispatches work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoaderMode {
    /// Group every key loaded during one scheduling tick into one call.
    Batched,
    /// One call per distinct key, issued immediately.
    Single,
}

/// Per-scope loader deduplicating and caching keyed fetches.
///
/// Cloning the cache is cheap and shares its state. Loads must happen inside
/// a Tokio runtime since dispatches run on spawned tasks.
pub struct BatchCache<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for BatchCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<K, V> {
    name: &'static str,
    mode: LoaderMode,
    fetch: Box<dyn BatchFn<K, V>>,
    next_id: AtomicU64,
    state: Mutex<State<K, V>>,
}

struct State<K, V> {
    entries: HashMap<CanonicalKey, CacheEntry<V>>,
    queue: Vec<PendingEntry<K, V>>,
}

struct CacheEntry<V> {
    id: u64,
    load: Load<V>,
}

struct PendingEntry<K, V> {
    id: u64,
    key: CanonicalKey,
    original: K,
    sender: oneshot::Sender<Result<V, LoadError>>,
}

impl<K, V> fmt::Debug for BatchCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("BatchCache")
            .field("name", &self.inner.name)
            .field("mode", &self.inner.mode)
            .field("entries", &state.entries.len())
            .field("queued", &state.queue.len())
            .finish()
    }
}

impl<K, V> BatchCache<K, V>
where
    K: CacheKey,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str, mode: LoaderMode, fetch: impl BatchFn<K, V>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                mode,
                fetch: Box::new(fetch),
                next_id: AtomicU64::new(0),
                state: Mutex::new(State {
                    entries: HashMap::new(),
                    queue: Vec::new(),
                }),
            }),
        }
    }

    pub fn batched(name: &'static str, fetch: impl BatchFn<K, V>) -> Self {
        Self::new(name, LoaderMode::Batched, fetch)
    }

    pub fn single(name: &'static str, fetch: impl BatchFn<K, V>) -> Self {
        Self::new(name, LoaderMode::Single, fetch)
    }

    pub fn mode(&self) -> LoaderMode {
        self.inner.mode
    }

    /// Loads `key`, reusing the pending or cached future of any
    /// canonically-equal key.
    pub fn load(&self, key: K) -> Load<V> {
        let canonical = key.canonical_key();
        let mut state = self.inner.state.lock();
        if let Some(entry) = state.entries.get(&canonical) {
            return entry.load.clone();
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        let load = receiver
            .map(|received| received.unwrap_or(Err(LoadError::Canceled)))
            .boxed()
            .shared();
        state.entries.insert(
            canonical.clone(),
            CacheEntry {
                id,
                load: load.clone(),
            },
        );
        let pending = PendingEntry {
            id,
            key: canonical,
            original: key,
            sender,
        };

        match self.inner.mode {
            LoaderMode::Batched => {
                state.queue.push(pending);
                // the first entry of a tick schedules the flush for everyone
                if state.queue.len() == 1 {
                    let inner = self.inner.clone();
                    tokio::spawn(async move {
                        tokio::task::yield_now().await;
                        let batch = std::mem::take(&mut inner.state.lock().queue);
                        inner.dispatch(batch).await;
                    });
                }
            }
            LoaderMode::Single => {
                drop(state);
                let inner = self.inner.clone();
                tokio::spawn(async move { inner.dispatch(vec![pending]).await });
            }
        }

        load
    }

    /// Forgets the entry for `key`. The next load of an equal key issues new
    /// work; callers already holding the old future still get its result.
    pub fn clear(&self, key: &K) {
        let canonical = key.canonical_key();
        if self.inner.state.lock().entries.remove(&canonical).is_some() {
            tracing::debug!(loader = self.inner.name, key = %canonical, "cleared cache entry");
        }
    }

    /// Forgets every entry.
    pub fn clear_all(&self) {
        let mut state = self.inner.state.lock();
        tracing::debug!(loader = self.inner.name, entries = state.entries.len(), "cleared cache");
        state.entries.clear();
    }
}

impl<K, V> Inner<K, V>
where
    K: CacheKey,
    V: Clone + Send + Sync + 'static,
{
    async fn dispatch(&self, batch: Vec<PendingEntry<K, V>>) {
        if batch.is_empty() {
            return;
        }
        let keys = batch.iter().map(|entry| entry.original.clone()).collect();
        tracing::debug!(loader = self.name, size = batch.len(), "dispatching batch");

        let error = match self.fetch.load(keys).await {
            Ok(values) if values.len() == batch.len() => {
                for (entry, value) in batch.into_iter().zip(values) {
                    let _ = entry.sender.send(Ok(value));
                }
                return;
            }
            Ok(values) => LoadError::ArityMismatch {
                expected: batch.len(),
                actual: values.len(),
            },
            Err(error) => LoadError::from(error),
        };

        tracing::debug!(loader = self.name, size = batch.len(), %error, "batch failed");
        // failed keys must not stay cached, unless a newer load already
        // replaced them after a clear
        {
            let mut state = self.state.lock();
            for entry in &batch {
                if state
                    .entries
                    .get(&entry.key)
                    .is_some_and(|cached| cached.id == entry.id)
                {
                    state.entries.remove(&entry.key);
                }
            }
        }
        for entry in batch {
            let _ = entry.sender.send(Err(error.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json_bytes::json;
    use serde_json_bytes::Value;
    use test_log::test;

    use super::*;

    /// Echoes every key back as `{"echo": key}` and records each batch.
    #[derive(Clone, Default)]
    struct Recorder {
        batches: Arc<Mutex<Vec<Vec<Value>>>>,
        fail_with: Option<&'static str>,
        drop_last: bool,
    }

    impl Recorder {
        fn batches(&self) -> Vec<Vec<Value>> {
            self.batches.lock().clone()
        }
    }

    #[async_trait::async_trait]
    impl BatchFn<Value, Value> for Recorder {
        async fn load(&self, keys: Vec<Value>) -> Result<Vec<Value>, BoxError> {
            self.batches.lock().push(keys.clone());
            if let Some(message) = self.fail_with {
                return Err(message.into());
            }
            let mut values: Vec<Value> = keys
                .into_iter()
                .map(|key| json!({ "echo": key }))
                .collect();
            if self.drop_last {
                values.pop();
            }
            Ok(values)
        }
    }

    #[test(tokio::test)]
    async fn same_tick_loads_share_one_batch() {
        let recorder = Recorder::default();
        let cache = BatchCache::batched("test", recorder.clone());
        assert_eq!(cache.mode(), LoaderMode::Batched);

        let first = cache.load(json!({ "id": 1 }));
        let second = cache.load(json!({ "id": 2 }));
        let third = cache.load(json!({ "id": 3 }));
        let (first, second, third) = tokio::join!(first, second, third);

        assert_eq!(first.unwrap(), json!({ "echo": { "id": 1 } }));
        assert_eq!(second.unwrap(), json!({ "echo": { "id": 2 } }));
        assert_eq!(third.unwrap(), json!({ "echo": { "id": 3 } }));
        assert_eq!(
            recorder.batches(),
            vec![vec![json!({ "id": 1 }), json!({ "id": 2 }), json!({ "id": 3 })]]
        );
    }

    #[test(tokio::test)]
    async fn results_follow_request_positions() {
        /// Answers in reverse internally but returns results in request order.
        struct Reversing;

        #[async_trait::async_trait]
        impl BatchFn<Value, Value> for Reversing {
            async fn load(&self, keys: Vec<Value>) -> Result<Vec<Value>, BoxError> {
                let mut answered: Vec<(usize, Value)> = keys
                    .into_iter()
                    .enumerate()
                    .rev()
                    .map(|(index, key)| (index, json!({ "for": key })))
                    .collect();
                answered.sort_by_key(|(index, _)| *index);
                Ok(answered.into_iter().map(|(_, value)| value).collect())
            }
        }

        let cache = BatchCache::batched("test", Reversing);
        let loads = vec![
            cache.load(json!("k1")),
            cache.load(json!("k2")),
            cache.load(json!("k3")),
        ];
        let results = futures::future::join_all(loads).await;

        assert_eq!(results[0].clone().unwrap(), json!({ "for": "k1" }));
        assert_eq!(results[1].clone().unwrap(), json!({ "for": "k2" }));
        assert_eq!(results[2].clone().unwrap(), json!({ "for": "k3" }));
    }

    #[test(tokio::test)]
    async fn equal_keys_are_fetched_once() {
        let recorder = Recorder::default();
        let cache = BatchCache::batched("test", recorder.clone());

        let first = cache.load(json!({ "id": "42", "kind": "book" }));
        let second = cache.load(json!({ "kind": "book", "id": "42" }));
        let (first, second) = tokio::join!(first, second);

        assert_eq!(first.unwrap(), second.unwrap());
        assert_eq!(recorder.batches().len(), 1);
        assert_eq!(recorder.batches()[0].len(), 1);

        // once resolved, the value is served from the cache
        let third = cache.load(json!({ "id": "42", "kind": "book" })).await;
        assert!(third.is_ok());
        assert_eq!(recorder.batches().len(), 1);
    }

    #[test(tokio::test)]
    async fn separate_ticks_make_separate_batches() {
        let recorder = Recorder::default();
        let cache = BatchCache::batched("test", recorder.clone());

        cache.load(json!(1)).await.unwrap();
        cache.load(json!(2)).await.unwrap();

        assert_eq!(recorder.batches(), vec![vec![json!(1)], vec![json!(2)]]);
    }

    #[test(tokio::test)]
    async fn single_mode_fetches_each_key_alone() {
        let recorder = Recorder::default();
        let cache = BatchCache::single("test", recorder.clone());

        let first = cache.load(json!("a"));
        let second = cache.load(json!("b"));
        let duplicate = cache.load(json!("a"));
        let (first, second, duplicate) = tokio::join!(first, second, duplicate);

        assert_eq!(first.unwrap(), duplicate.unwrap());
        assert_eq!(second.unwrap(), json!({ "echo": "b" }));
        let mut batches = recorder.batches();
        batches.sort_by_key(|batch| batch[0].as_str().map(str::to_string));
        assert_eq!(batches, vec![vec![json!("a")], vec![json!("b")]]);
    }

    #[test(tokio::test)]
    async fn batch_failure_rejects_every_entry() {
        let recorder = Recorder {
            fail_with: Some("function crashed"),
            ..Default::default()
        };
        let cache = BatchCache::batched("test", recorder.clone());

        let (first, second) = tokio::join!(cache.load(json!(1)), cache.load(json!(2)));

        assert_eq!(first.unwrap_err().to_string(), "function crashed");
        assert_eq!(second.unwrap_err().to_string(), "function crashed");
        assert_eq!(recorder.batches().len(), 1);

        // failures are not cached
        assert!(cache.load(json!(1)).await.is_err());
        assert_eq!(recorder.batches().len(), 2);
    }

    #[test(tokio::test)]
    async fn wrong_result_count_is_an_error() {
        let recorder = Recorder {
            drop_last: true,
            ..Default::default()
        };
        let cache = BatchCache::batched("test", recorder);

        let (first, second) = tokio::join!(cache.load(json!(1)), cache.load(json!(2)));

        for result in [first, second] {
            assert!(matches!(
                result,
                Err(LoadError::ArityMismatch {
                    expected: 2,
                    actual: 1
                })
            ));
        }
    }

    #[test(tokio::test)]
    async fn clear_forces_a_new_fetch() {
        let recorder = Recorder::default();
        let cache = BatchCache::batched("test", recorder.clone());

        cache.load(json!({ "id": 1 })).await.unwrap();
        cache.clear(&json!({ "id": 1 }));
        cache.load(json!({ "id": 1 })).await.unwrap();

        assert_eq!(recorder.batches().len(), 2);
    }

    #[test(tokio::test)]
    async fn clear_all_forgets_every_key() {
        let recorder = Recorder::default();
        let cache = BatchCache::single("test", recorder.clone());
        assert_eq!(cache.mode(), LoaderMode::Single);

        cache.load(json!("a")).await.unwrap();
        cache.load(json!("b")).await.unwrap();
        cache.clear_all();
        cache.load(json!("a")).await.unwrap();
        cache.load(json!("b")).await.unwrap();

        assert_eq!(recorder.batches().len(), 4);
    }

    #[test(tokio::test)]
    async fn clear_while_pending_keeps_the_first_caller_waiting() {
        let recorder = Recorder::default();
        let cache = BatchCache::batched("test", recorder.clone());

        let first = cache.load(json!("k"));
        cache.clear(&json!("k"));
        let second = cache.load(json!("k"));
        let (first, second) = tokio::join!(first, second);

        assert_eq!(first.unwrap(), json!({ "echo": "k" }));
        assert_eq!(second.unwrap(), json!({ "echo": "k" }));
        // both loads were queued in the same tick, as separate entries
        assert_eq!(recorder.batches(), vec![vec![json!("k"), json!("k")]]);
    }

    #[test(tokio::test)]
    async fn independent_caches_do_not_share_entries() {
        let calls = Arc::new(AtomicUsize::new(0));

        struct Counting(Arc<AtomicUsize>);

        #[async_trait::async_trait]
        impl BatchFn<Value, Value> for Counting {
            async fn load(&self, keys: Vec<Value>) -> Result<Vec<Value>, BoxError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(keys)
            }
        }

        let one = BatchCache::batched("one", Counting(calls.clone()));
        let two = BatchCache::batched("two", Counting(calls.clone()));
        let (a, b) = tokio::join!(one.load(json!({ "id": 1 })), two.load(json!({ "id": 1 })));

        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
