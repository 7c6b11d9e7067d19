use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::CacheConfig;
use crate::error::Error;

/// The shared completion signal of a single construction.
///
/// Resolves to `Err(Canceled)` if the construction task went away without sending a result.
type Computation<V, E> = Shared<oneshot::Receiver<Result<V, E>>>;

type Constructor<K, V, E> = Arc<dyn Fn(K) -> BoxFuture<'static, Result<V, E>> + Send + Sync>;

type OnDelete<K, V> = Arc<dyn Fn(K, V) + Send + Sync>;

/// A concurrent, lazily populated cache with construction coalescing and idle expiry.
///
/// Looking up a missing key spawns a single construction for it, which all concurrent lookups
/// of that key share. A failed construction is never cached: every caller waiting on it receives
/// the same error, and the next lookup tries again.
///
/// With a `lifetime` configured, successfully constructed entries are removed once they have not
/// been requested for that long. Each lookup resets the idle timer. Entries can also be removed
/// explicitly with [`delete`](Self::delete). Either way, the
/// [`on_delete`](LazyCacheBuilder::on_delete) hook is called exactly once per removed value,
/// after the entry is gone from the cache and without holding any lock.
///
/// The constructor runs on its own spawned task. It belongs to the cache and not to the caller
/// that triggered it: dropping the future returned by
/// [`get_or_construct`](Self::get_or_construct) only stops that caller from waiting, while the
/// construction carries on for everyone else. This means all methods that construct values must
/// be called from within a tokio runtime.
///
/// `LazyCache` is a cheap handle, clones share the same underlying cache.
pub struct LazyCache<K, V, E> {
    inner: Arc<Inner<K, V, E>>,
}

impl<K, V, E> Clone for LazyCache<K, V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V, E> fmt::Debug for LazyCache<K, V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyCache")
            .field("name", &self.inner.name)
            .field("lifetime", &self.inner.lifetime)
            .field("entries", &self.inner.state().entries.len())
            .field("has_constructor", &self.inner.constructor.is_some())
            .field("has_on_delete", &self.inner.on_delete.is_some())
            .finish()
    }
}

/// Builder for a [`LazyCache`].
pub struct LazyCacheBuilder<K, V, E> {
    name: Option<Arc<str>>,
    lifetime: Option<Duration>,
    constructor: Option<Constructor<K, V, E>>,
    on_delete: Option<OnDelete<K, V>>,
}

impl<K, V, E> fmt::Debug for LazyCacheBuilder<K, V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyCacheBuilder")
            .field("name", &self.name)
            .field("lifetime", &self.lifetime)
            .field("has_constructor", &self.constructor.is_some())
            .field("has_on_delete", &self.on_delete.is_some())
            .finish()
    }
}

impl<K, V, E> Default for LazyCacheBuilder<K, V, E> {
    fn default() -> Self {
        Self {
            name: None,
            lifetime: None,
            constructor: None,
            on_delete: None,
        }
    }
}

impl<K, V, E> LazyCacheBuilder<K, V, E> {
    /// Sets the name used for this cache in log output.
    pub fn name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the idle lifetime of entries. A zero duration disables expiry.
    pub fn lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = Some(lifetime).filter(|lifetime| !lifetime.is_zero());
        self
    }

    /// Applies the name and lifetime of a [`CacheConfig`].
    pub fn config(mut self, config: &CacheConfig) -> Self {
        if let Some(ref name) = config.name {
            self.name = Some(name.as_str().into());
        }
        self.lifetime = config.effective_lifetime();
        self
    }

    /// Sets the constructor used by [`LazyCache::get`].
    pub fn constructor<C, Fut>(mut self, constructor: C) -> Self
    where
        C: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        self.constructor = Some(Arc::new(move |key| constructor(key).boxed()));
        self
    }

    /// Sets a hook that is called with every value that leaves the cache.
    ///
    /// The hook runs after the entry was removed, without any lock held, so it may freely call
    /// back into the cache.
    pub fn on_delete<F>(mut self, on_delete: F) -> Self
    where
        F: Fn(K, V) + Send + Sync + 'static,
    {
        self.on_delete = Some(Arc::new(on_delete));
        self
    }

    /// Creates the cache.
    pub fn build(self) -> LazyCache<K, V, E> {
        let inner = Inner {
            name: self.name.unwrap_or_else(|| "lazycache".into()),
            lifetime: self.lifetime,
            constructor: self.constructor,
            on_delete: self.on_delete,
            state: Mutex::new(State {
                entries: HashMap::new(),
                next_generation: 0,
            }),
        };
        LazyCache {
            inner: Arc::new(inner),
        }
    }
}

impl<K, V, E> LazyCache<K, V, E> {
    /// Creates a new cache with the given idle `lifetime`.
    ///
    /// A zero `lifetime` means entries never expire and are only removed by
    /// [`delete`](Self::delete) or [`clear`](Self::clear).
    pub fn new(lifetime: Duration) -> Self {
        Self::builder().lifetime(lifetime).build()
    }

    /// Creates a new cache from its configuration.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::builder().config(config).build()
    }

    /// Returns a builder to configure a new cache.
    pub fn builder() -> LazyCacheBuilder<K, V, E> {
        LazyCacheBuilder::default()
    }

    /// The idle lifetime of entries, `None` if they never expire.
    pub fn lifetime(&self) -> Option<Duration> {
        self.inner.lifetime
    }

    /// The number of entries, both ready and still being constructed.
    pub fn len(&self) -> usize {
        self.inner.state().entries.len()
    }

    /// Returns `true` if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V, E> LazyCache<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: From<Error> + Clone + Send + Sync + 'static,
{
    /// Returns the value for `key`, constructing it with the cache-wide constructor if missing.
    ///
    /// Fails with [`Error::ConstructorMissing`] if the cache was built without a
    /// [`constructor`](LazyCacheBuilder::constructor).
    pub async fn get(&self, key: K) -> Result<V, E> {
        let Some(constructor) = self.inner.constructor.clone() else {
            return Err(Error::ConstructorMissing.into());
        };
        self.get_or_construct(key, move |key| constructor(key)).await
    }

    /// Returns the value for `key`, constructing it with `constructor` if missing.
    ///
    /// If the key is present, its idle timer is reset and the result of its construction is
    /// returned, waiting for the construction to finish if necessary. Otherwise `constructor` is
    /// spawned, and its result returned to this call and every concurrent call for `key`.
    ///
    /// A successful result stays in the cache, an error is returned to all waiters and then
    /// forgotten.
    pub async fn get_or_construct<C, Fut>(&self, key: K, constructor: C) -> Result<V, E>
    where
        C: FnOnce(K) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let computation = match self.inner.lookup_or_insert(&key) {
            Lookup::Hit(computation) => computation,
            Lookup::Miss {
                computation,
                generation,
                sender,
            } => {
                self.inner
                    .spawn_construction(key, generation, sender, constructor);
                computation
            }
        };

        computation
            .await
            .unwrap_or_else(|_canceled| Err(Error::ConstructionAborted.into()))
    }

    /// Removes the entry for `key`.
    ///
    /// Calls the `on_delete` hook with the entry's value after the removal. Deleting a missing
    /// key does nothing.
    ///
    /// An entry that is still being constructed is removed right away. Callers already waiting on
    /// it still receive its result, but the value is not cached. Instead, it is passed to
    /// `on_delete` as soon as it is constructed.
    pub fn delete(&self, key: &K) {
        let removed = self.inner.state().entries.remove_entry(key);
        let Some((key, slot)) = removed else {
            return;
        };
        slot.cancel.cancel();

        tracing::debug!(
            cache = %self.inner.name,
            generation = slot.generation,
            "Deleted cache entry"
        );
        if let Some(value) = slot.value {
            self.inner.notify_delete(key, value);
        }
    }

    /// Returns `true` if an entry for `key` is present, without resetting its idle timer.
    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.state().entries.contains_key(key)
    }

    /// Removes all entries, calling `on_delete` for each constructed value.
    pub fn clear(&self) {
        let removed: Vec<_> = self.inner.state().entries.drain().collect();

        for (key, slot) in removed {
            slot.cancel.cancel();
            if let Some(value) = slot.value {
                self.inner.notify_delete(key, value);
            }
        }
    }
}

enum Lookup<V, E> {
    Hit(Computation<V, E>),
    Miss {
        computation: Computation<V, E>,
        generation: u64,
        sender: oneshot::Sender<Result<V, E>>,
    },
}

/// A single entry in the cache, either pending or ready.
struct Slot<V, E> {
    /// Distinguishes this entry from earlier and later ones for the same key.
    generation: u64,
    computation: Computation<V, E>,
    /// The constructed value, once ready.
    value: Option<V>,
    /// The idle deadline, only set for ready entries of a cache with a lifetime.
    expires_at: Option<Instant>,
    /// Fired when this entry leaves the cache, stops its expiry watcher.
    cancel: CancellationToken,
}

struct State<K, V, E> {
    entries: HashMap<K, Slot<V, E>>,
    next_generation: u64,
}

struct Inner<K, V, E> {
    name: Arc<str>,
    lifetime: Option<Duration>,
    constructor: Option<Constructor<K, V, E>>,
    on_delete: Option<OnDelete<K, V>>,
    state: Mutex<State<K, V, E>>,
}

impl<K, V, E> Inner<K, V, E> {
    /// Locks the structural state.
    ///
    /// No critical section can leave the map half-updated, so a poisoned lock is still usable.
    fn state(&self) -> MutexGuard<'_, State<K, V, E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify_delete(&self, key: K, value: V) {
        if let Some(ref on_delete) = self.on_delete {
            on_delete(key, value);
        }
    }
}

impl<K, V, E> Inner<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Returns the computation for `key`, or inserts a new pending entry for it.
    ///
    /// A hit on a ready entry resets its idle deadline.
    fn lookup_or_insert(&self, key: &K) -> Lookup<V, E> {
        let mut state = self.state();

        if let Some(slot) = state.entries.get_mut(key) {
            if slot.expires_at.is_some() {
                slot.expires_at = self.deadline();
            }
            return Lookup::Hit(slot.computation.clone());
        }

        let generation = state.next_generation;
        state.next_generation += 1;

        let (sender, receiver) = oneshot::channel();
        let computation = receiver.shared();
        state.entries.insert(
            key.clone(),
            Slot {
                generation,
                computation: computation.clone(),
                value: None,
                expires_at: None,
                cancel: CancellationToken::new(),
            },
        );

        Lookup::Miss {
            computation,
            generation,
            sender,
        }
    }

    /// Spawns the construction of a pending entry.
    ///
    /// The task is spawned eagerly and detached, so the construction completes even if the
    /// caller that triggered it stops waiting.
    fn spawn_construction<C, Fut>(
        self: &Arc<Self>,
        key: K,
        generation: u64,
        sender: oneshot::Sender<Result<V, E>>,
        constructor: C,
    ) where
        C: FnOnce(K) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let pending = PendingEntry {
            inner: Arc::clone(self),
            key: key.clone(),
            generation,
            sender: Some(sender),
        };

        let task = async move {
            let result = constructor(key).await;
            pending.resolve(result);
        };

        tracing::trace!(cache = %self.name, generation, "Spawning deduplicated construction");
        let span = tracing::trace_span!("construct", cache = %self.name, generation);
        tokio::spawn(task.instrument(span));
    }

    /// Marks the entry as ready, and starts its expiry watcher.
    ///
    /// Returns `false` if the entry was removed from the cache while it was being constructed.
    fn complete(self: &Arc<Self>, key: &K, generation: u64, value: &V) -> bool {
        let deadline = self.deadline();
        let mut state = self.state();
        let Some(slot) = state
            .entries
            .get_mut(key)
            .filter(|slot| slot.generation == generation)
        else {
            return false;
        };

        slot.value = Some(value.clone());
        if let Some(deadline) = deadline {
            slot.expires_at = Some(deadline);
            tokio::spawn(watch_expiry(
                Arc::downgrade(self),
                key.clone(),
                generation,
                slot.cancel.clone(),
                deadline,
            ));
        }

        true
    }

    /// The idle deadline of an entry requested right now.
    ///
    /// A lifetime too large to be represented as an [`Instant`] never expires.
    fn deadline(&self) -> Option<Instant> {
        self.lifetime.and_then(|lifetime| Instant::now().checked_add(lifetime))
    }

    /// Removes an entry that never became ready.
    fn evict_pending(&self, key: &K, generation: u64) {
        let mut state = self.state();
        let is_pending = state
            .entries
            .get(key)
            .is_some_and(|slot| slot.generation == generation && slot.value.is_none());
        if !is_pending {
            return;
        }

        if let Some(slot) = state.entries.remove(key) {
            slot.cancel.cancel();
        }
    }

    /// Removes the entry if its idle deadline has passed.
    ///
    /// Returns the new deadline if the entry was requested in the meantime, or `None` once the
    /// watcher is no longer needed: the entry is gone, or no longer has a deadline.
    fn expire(&self, key: &K, generation: u64) -> Option<Instant> {
        let (key, value) = {
            let mut state = self.state();
            let expires_at = match state.entries.get(key) {
                Some(slot) if slot.generation == generation => slot.expires_at?,
                _ => return None,
            };
            if expires_at > Instant::now() {
                return Some(expires_at);
            }

            let (key, slot) = state.entries.remove_entry(key)?;
            slot.cancel.cancel();
            (key, slot.value?)
        };

        tracing::debug!(cache = %self.name, generation, "Cache entry expired");
        self.notify_delete(key, value);
        None
    }
}

impl<K, V, E> Drop for Inner<K, V, E> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for slot in state.entries.values() {
            slot.cancel.cancel();
        }
    }
}

/// A pending entry together with the sender its waiters listen on.
///
/// If the construction ends without [`resolve`](Self::resolve), because the constructor panicked
/// or the runtime shut down, dropping this removes the entry before the sender is dropped. Waiters
/// woken with `Canceled` therefore never find the dead entry again.
struct PendingEntry<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    inner: Arc<Inner<K, V, E>>,
    key: K,
    generation: u64,
    sender: Option<oneshot::Sender<Result<V, E>>>,
}

impl<K, V, E> PendingEntry<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Stores a successful result, removes a failed one, and wakes all waiters.
    ///
    /// A value whose entry was deleted during construction is passed to `on_delete` once the
    /// waiters have it.
    fn resolve(mut self, result: Result<V, E>) {
        let orphaned = match &result {
            Ok(value) => {
                (!self.inner.complete(&self.key, self.generation, value)).then(|| value.clone())
            }
            Err(_) => None,
        };

        self.inner.evict_pending(&self.key, self.generation);
        if let Some(sender) = self.sender.take() {
            sender.send(result).ok();
        }

        if let Some(value) = orphaned {
            tracing::debug!(
                cache = %self.inner.name,
                generation = self.generation,
                "Entry was deleted during construction"
            );
            self.inner.notify_delete(self.key.clone(), value);
        }
    }
}

impl<K, V, E> Drop for PendingEntry<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.inner.evict_pending(&self.key, self.generation);
        drop(self.sender.take());
    }
}

/// Waits for the idle deadline of an entry and removes it from the cache.
///
/// Exits as soon as the entry's cancellation token fires, or the cache itself is dropped.
async fn watch_expiry<K, V, E>(
    inner: Weak<Inner<K, V, E>>,
    key: K,
    generation: u64,
    cancel: CancellationToken,
    mut deadline: Instant,
) where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = time::sleep_until(deadline) => {}
        }

        let Some(inner) = inner.upgrade() else {
            return;
        };
        match inner.expire(&key, generation) {
            Some(next) => deadline = next,
            None => return,
        }
    }
}
