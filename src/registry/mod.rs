//! Shared, reference counted watch subscriptions.
//!
//! Every distinct [`RegistryKey`] owns at most one entry, and every entry owns
//! at most one upstream stream, no matter how many consumers registered for
//! it. Events of that stream are fanned out to every registered handler.

mod item;
mod list;

pub use item::{ItemWatch, ItemWatchRegistry};
pub use list::{ListWatch, ListWatchRegistry};

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::key::{QueryKey, RegistryKey};
use crate::transport::{Observer, Subscription, Transport, TransportError};

/// What differs between collection and single object watches.
pub trait WatchKind: Send + Sync + 'static {
    type Params: Clone + Send + Sync + 'static;
    type Event: Send + 'static;

    /// Used in log messages only.
    const NAME: &'static str;

    /// Whether the event identifies an object. Events that don't are dropped
    /// before fan-out.
    fn is_valid(event: &Self::Event) -> bool;

    fn open(
        transport: &dyn Transport,
        params: Self::Params,
        resource_version: Option<String>,
        observer: Observer<Self::Event>,
    ) -> Box<dyn Subscription>;

    fn report(
        key: &RegistryKey,
        params: &Self::Params,
        resource_version: Option<&str>,
        err: &TransportError,
    );
}

type HandlerFn<E> = dyn Fn(&E) -> crate::Result<()> + Send + Sync;

/// A consumer callback.
///
/// The identity of a handler is its allocation: clones are the same handler,
/// two handlers built from identical closures are not.
pub struct Handler<E>(Arc<HandlerFn<E>>);

impl<E> Clone for Handler<E> {
    fn clone(&self) -> Self {
        Handler(Arc::clone(&self.0))
    }
}

impl<E> fmt::Debug for Handler<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handler")
            .field(&Arc::as_ptr(&self.0).cast::<()>())
            .finish()
    }
}

impl<E> Handler<E> {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&E) -> crate::Result<()> + Send + Sync + 'static,
    {
        Handler(Arc::new(f))
    }

    pub fn ptr_eq(&self, other: &Handler<E>) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn call(&self, event: &E) -> crate::Result<()> {
        (self.0)(event)
    }
}

enum Stream {
    Idle,
    /// The transport is being asked to open the stream right now.
    Starting,
    Open(Box<dyn Subscription>),
}

struct Entry<K: WatchKind> {
    /// Distinguishes this entry from earlier entries of the same key.
    id: u64,
    query: QueryKey,
    params: K::Params,
    /// One element per live registration, keyed by registration token.
    registrations: Vec<(u64, Handler<K::Event>)>,
    stream: Stream,
}

impl<K: WatchKind> Entry<K> {
    /// Distinct handlers, in registration order.
    fn handlers(&self) -> Vec<Handler<K::Event>> {
        let mut handlers: Vec<Handler<K::Event>> = Vec::with_capacity(self.registrations.len());
        for (_, handler) in &self.registrations {
            if !handlers.iter().any(|h| h.ptr_eq(handler)) {
                handlers.push(handler.clone());
            }
        }
        handlers
    }
}

struct State<K: WatchKind> {
    entries: HashMap<RegistryKey, Entry<K>>,
    transport: Option<Arc<dyn Transport>>,
    next_id: u64,
}

impl<K: WatchKind> State<K> {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

struct Store<K: WatchKind> {
    state: Mutex<State<K>>,
}

impl<K: WatchKind> Store<K> {
    /// Removes one registration, closing the stream once the entry has none left.
    fn remove(&self, key: &RegistryKey, token: u64) {
        let closing = {
            let mut state = self.state.lock();
            let Some(entry) = state.entries.get_mut(key) else {
                return;
            };
            let Some(pos) = entry.registrations.iter().position(|(t, _)| *t == token) else {
                return;
            };
            entry.registrations.remove(pos);

            if !entry.registrations.is_empty() {
                return;
            }

            state.entries.remove(key)
        };

        if let Some(entry) = closing {
            debug!(message = "last consumer left, closing watch", kind = K::NAME, key = %key);
            close(entry.stream);
        }
    }

    fn dispatch(&self, key: &RegistryKey, entry_id: u64, event: K::Event) {
        let handlers = {
            let state = self.state.lock();
            match state.entries.get(key) {
                Some(entry) if entry.id == entry_id => entry.handlers(),
                // the entry is gone, or was re-created and owns another stream
                _ => return,
            }
        };

        for handler in handlers {
            match panic::catch_unwind(AssertUnwindSafe(|| handler.call(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(message = "watch handler failed", kind = K::NAME, key = %key, %err);
                }
                Err(payload) => {
                    error!(
                        message = "watch handler panicked",
                        kind = K::NAME,
                        key = %key,
                        err = panic_message(payload.as_ref())
                    );
                }
            }
        }
    }
}

fn close(stream: Stream) {
    if let Stream::Open(subscription) = stream {
        subscription.unsubscribe();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic"
    }
}

/// Returned by `register`, the only way for a consumer to leave.
///
/// `unregister` removes exactly the registration that produced this value,
/// at most once. Dropping it unregisters as well.
#[must_use = "dropping a Registration unregisters its handler"]
pub struct Registration {
    unregister: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Registration {
    fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Registration {
            unregister: Mutex::new(Some(Box::new(f))),
        }
    }

    pub fn unregister(&self) {
        let f = self.unregister.lock().take();
        if let Some(f) = f {
            f();
        }
    }

    pub fn is_registered(&self) -> bool {
        self.unregister.lock().is_some()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.unregister();
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("registered", &self.is_registered())
            .finish()
    }
}

/// An entry store for one kind of watch, see [`ListWatchRegistry`] and
/// [`ItemWatchRegistry`]. Clones share the same store.
pub struct WatchRegistry<K: WatchKind> {
    store: Arc<Store<K>>,
}

impl<K: WatchKind> Clone for WatchRegistry<K> {
    fn clone(&self) -> Self {
        WatchRegistry {
            store: Arc::clone(&self.store),
        }
    }
}

impl<K: WatchKind> Default for WatchRegistry<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: WatchKind> WatchRegistry<K> {
    pub fn new() -> Self {
        WatchRegistry {
            store: Arc::new(Store {
                state: Mutex::new(State {
                    entries: HashMap::new(),
                    transport: None,
                    next_id: 0,
                }),
            }),
        }
    }

    /// Replaces the transport used for streams opened from now on. Streams
    /// that are already open keep running on the transport that opened them.
    pub fn set_transport_client(&self, transport: Arc<dyn Transport>) {
        self.store.state.lock().transport = Some(transport);
    }

    pub fn register(
        &self,
        query: &QueryKey,
        params: K::Params,
        handler: Handler<K::Event>,
    ) -> Registration {
        let key = query.registry_key();

        let token = {
            let mut state = self.store.state.lock();
            let token = state.next_id();

            match state.entries.get_mut(&key) {
                Some(entry) => entry.registrations.push((token, handler)),
                None => {
                    let id = state.next_id();
                    trace!(message = "creating watch entry", kind = K::NAME, key = %key);

                    state.entries.insert(
                        key.clone(),
                        Entry {
                            id,
                            query: query.clone(),
                            params,
                            registrations: vec![(token, handler)],
                            stream: Stream::Idle,
                        },
                    );
                }
            }

            token
        };

        let store = Arc::downgrade(&self.store);
        Registration::new(move || {
            if let Some(store) = store.upgrade() {
                store.remove(&key, token);
            }
        })
    }

    /// Removes one registration of `handler` under `query`. No-op if there
    /// is none.
    pub fn unregister(&self, query: &QueryKey, handler: &Handler<K::Event>) {
        let key = query.registry_key();

        let token = {
            let state = self.store.state.lock();
            state.entries.get(&key).and_then(|entry| {
                entry
                    .registrations
                    .iter()
                    .find(|(_, h)| h.ptr_eq(handler))
                    .map(|(token, _)| *token)
            })
        };

        if let Some(token) = token {
            self.store.remove(&key, token);
        }
    }

    /// Opens the upstream stream of `query`, resuming after `resource_version`.
    ///
    /// Does nothing if the stream is already open (or being opened), if no
    /// consumer is registered for `query`, or if there is no transport yet.
    pub fn start_subscription(&self, query: &QueryKey, resource_version: Option<&str>) {
        let key = query.registry_key();
        let resource_version = resource_version
            .filter(|version| !version.is_empty())
            .map(ToString::to_string);

        let (transport, params, entry_id) = {
            let mut state = self.store.state.lock();
            let Some(transport) = state.transport.clone() else {
                debug!(message = "no transport client, watch not started", kind = K::NAME, key = %key);
                return;
            };
            let Some(entry) = state.entries.get_mut(&key) else {
                return;
            };
            if !matches!(entry.stream, Stream::Idle) {
                return;
            }

            entry.stream = Stream::Starting;
            (transport, entry.params.clone(), entry.id)
        };

        let observer = {
            let data_store = Arc::downgrade(&self.store);
            let data_key = key.clone();
            let err_key = key.clone();
            let err_params = params.clone();
            let err_version = resource_version.clone();

            Observer::new(
                move |event: K::Event| {
                    if !K::is_valid(&event) {
                        trace!(message = "dropping event without identity", kind = K::NAME, key = %data_key);
                        return;
                    }

                    if let Some(store) = data_store.upgrade() {
                        store.dispatch(&data_key, entry_id, event);
                    }
                },
                move |err: TransportError| {
                    K::report(&err_key, &err_params, err_version.as_deref(), &err);
                },
            )
        };

        debug!(
            message = "opening watch",
            kind = K::NAME,
            key = %key,
            resource_version = resource_version.as_deref().unwrap_or_default()
        );

        let subscription = K::open(transport.as_ref(), params, resource_version, observer);

        let orphaned = {
            let mut state = self.store.state.lock();
            match state.entries.get_mut(&key) {
                Some(entry) if entry.id == entry_id && matches!(entry.stream, Stream::Starting) => {
                    entry.stream = Stream::Open(subscription);
                    None
                }
                // every consumer left while the stream was being opened
                _ => Some(subscription),
            }
        };

        if let Some(subscription) = orphaned {
            subscription.unsubscribe();
        }
    }

    /// Closes every stream and forgets every entry, whatever their reference
    /// counts are.
    pub fn cleanup(&self) {
        let entries = std::mem::take(&mut self.store.state.lock().entries);
        if entries.is_empty() {
            return;
        }

        debug!(message = "closing all watches", kind = K::NAME, entries = entries.len());

        for (_, entry) in entries {
            close(entry.stream);
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.store.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live registrations for `query`, zero when there is no entry.
    pub fn ref_count(&self, query: &QueryKey) -> usize {
        let key = query.registry_key();
        self.store
            .state
            .lock()
            .entries
            .get(&key)
            .map_or(0, |entry| entry.registrations.len())
    }

    /// Whether the stream of `query` is open, or being opened.
    pub fn is_started(&self, query: &QueryKey) -> bool {
        let key = query.registry_key();
        self.store
            .state
            .lock()
            .entries
            .get(&key)
            .is_some_and(|entry| !matches!(entry.stream, Stream::Idle))
    }

    /// The descriptors of every entry, for diagnostics.
    pub fn queries(&self) -> Vec<QueryKey> {
        self.store
            .state
            .lock()
            .entries
            .values()
            .map(|entry| entry.query.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use kubernetes::DynamicObject;

    use super::*;
    use crate::testing::{RecordingTransport, added, pods};
    use crate::transport::{EventKind, ListEvent, ListWatchParams};

    fn counting() -> (Handler<ListEvent>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let handler = Handler::new(move |_: &ListEvent| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        (handler, count)
    }

    fn setup() -> (ListWatchRegistry, Arc<RecordingTransport>, QueryKey) {
        let transport = Arc::new(RecordingTransport::default());
        let registry = ListWatchRegistry::new();
        registry.set_transport_client(transport.clone());

        (registry, transport, QueryKey::new("prod", pods()).namespace("ci"))
    }

    #[test]
    fn same_handler_twice_is_invoked_once() {
        let (registry, transport, query) = setup();
        let (handler, count) = counting();

        let first = registry.register(&query, ListWatchParams::new(&query), handler.clone());
        let second = registry.register(&query, ListWatchParams::new(&query), handler);
        assert_eq!(registry.ref_count(&query), 2);

        registry.start_subscription(&query, None);
        transport.emit_list(0, added("web-0"));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        first.unregister();
        assert_eq!(registry.ref_count(&query), 1);
        transport.emit_list(0, added("web-1"));
        assert_eq!(count.load(Ordering::SeqCst), 2);

        second.unregister();
        assert!(registry.is_empty());
        assert_eq!(transport.list_unsubscribes(0), 1);
    }

    #[test]
    fn registration_unregisters_once() {
        let (registry, _transport, query) = setup();
        let (h1, _) = counting();
        let (h2, _) = counting();

        let r1 = registry.register(&query, ListWatchParams::new(&query), h1);
        let _r2 = registry.register(&query, ListWatchParams::new(&query), h2);

        r1.unregister();
        r1.unregister();
        r1.unregister();

        assert!(!r1.is_registered());
        assert_eq!(registry.ref_count(&query), 1);
    }

    #[test]
    fn dropping_registration_unregisters() {
        let (registry, transport, query) = setup();
        let (handler, _) = counting();

        {
            let _registration = registry.register(&query, ListWatchParams::new(&query), handler);
            registry.start_subscription(&query, Some("7"));
            assert_eq!(registry.len(), 1);
        }

        assert!(registry.is_empty());
        assert_eq!(transport.list_unsubscribes(0), 1);
    }

    #[test]
    fn unregister_by_handler() {
        let (registry, transport, query) = setup();
        let (h1, _) = counting();
        let (h2, _) = counting();

        let r1 = registry.register(&query, ListWatchParams::new(&query), h1.clone());
        let r2 = registry.register(&query, ListWatchParams::new(&query), h2.clone());
        registry.start_subscription(&query, None);

        registry.unregister(&query, &h1);
        assert_eq!(registry.ref_count(&query), 1);
        registry.unregister(&query, &h2);
        assert_eq!(registry.ref_count(&query), 0);
        assert_eq!(transport.list_unsubscribes(0), 1);

        // nothing left to remove, the closures are no-ops now
        registry.unregister(&query, &h2);
        r1.unregister();
        r2.unregister();
        assert_eq!(transport.list_unsubscribes(0), 1);
    }

    #[test]
    fn no_transport_no_stream() {
        let registry = ListWatchRegistry::new();
        let query = QueryKey::new("prod", pods());
        let (handler, _) = counting();

        let _registration = registry.register(&query, ListWatchParams::new(&query), handler);
        registry.start_subscription(&query, None);
        assert!(!registry.is_started(&query));

        let transport = Arc::new(RecordingTransport::default());
        registry.set_transport_client(transport.clone());
        registry.start_subscription(&query, None);
        assert!(registry.is_started(&query));
        assert_eq!(transport.list_opens(), 1);
    }

    #[test]
    fn start_without_entry_is_noop() {
        let (registry, transport, query) = setup();
        registry.start_subscription(&query, Some("1"));

        assert_eq!(transport.list_opens(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn empty_resource_version_means_now() {
        let (registry, transport, query) = setup();
        let (handler, _) = counting();

        let _registration = registry.register(&query, ListWatchParams::new(&query), handler);
        registry.start_subscription(&query, Some(""));

        assert_eq!(transport.list_params(0).resource_version, None);
    }

    #[test]
    fn handler_may_unregister_itself() {
        let (registry, transport, query) = setup();
        let slot: Arc<Mutex<Option<Registration>>> = Arc::new(Mutex::new(None));

        let s = Arc::clone(&slot);
        let handler = Handler::new(move |_: &ListEvent| {
            if let Some(registration) = s.lock().take() {
                registration.unregister();
            }
            Ok(())
        });

        let registration = registry.register(&query, ListWatchParams::new(&query), handler);
        *slot.lock() = Some(registration);
        registry.start_subscription(&query, None);

        transport.emit_list(0, added("web-0"));
        assert!(registry.is_empty());
        assert_eq!(transport.list_unsubscribes(0), 1);
    }

    #[test]
    fn stale_stream_does_not_reach_new_entry() {
        let (registry, transport, query) = setup();
        let (h1, _) = counting();
        let (h2, count) = counting();

        let r1 = registry.register(&query, ListWatchParams::new(&query), h1);
        registry.start_subscription(&query, None);
        r1.unregister();

        let _r2 = registry.register(&query, ListWatchParams::new(&query), h2);
        registry.start_subscription(&query, None);
        assert_eq!(transport.list_opens(), 2);

        // a late event of the first stream
        transport.emit_list(0, added("web-0"));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        transport.emit_list(1, added("web-0"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn synchronous_first_event_is_not_lost() {
        let transport = Arc::new(RecordingTransport::default().replay_on_open(ListEvent::new(
            EventKind::Added,
            DynamicObject::new("web-0"),
        )));
        let registry = ListWatchRegistry::new();
        registry.set_transport_client(transport.clone());

        let query = QueryKey::new("prod", pods());
        let (handler, count) = counting();
        let _registration = registry.register(&query, ListWatchParams::new(&query), handler);
        registry.start_subscription(&query, None);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(registry.is_started(&query));
    }

    #[test]
    fn queries_lists_every_entry() {
        let (registry, _transport, query) = setup();
        let other = QueryKey::new("prod", pods()).namespace("web");
        let (handler, _) = counting();

        let _r1 = registry.register(&query, ListWatchParams::new(&query), handler.clone());
        let _r2 = registry.register(&other, ListWatchParams::new(&other), handler);

        let mut namespaces = registry
            .queries()
            .into_iter()
            .filter_map(|query| query.namespace)
            .collect::<Vec<_>>();
        namespaces.sort();
        assert_eq!(namespaces, vec!["ci".to_string(), "web".to_string()]);
    }

    #[test]
    fn panic_message_extraction() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");

        let payload: Box<dyn Any + Send> = Box::new(1u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
