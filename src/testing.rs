//! An in-process transport and helpers for exercising registries without an
//! API server.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use kubernetes::{ApiResource, DynamicObject};
use parking_lot::Mutex;

use crate::registry::Handler;
use crate::transport::{
    EventKind, ItemWatchParams, ListEvent, ListWatchParams, Observer, Subscription, Transport,
    TransportError,
};

pub fn pods() -> ApiResource {
    ApiResource::new("", "v1", "Pod", "pods")
}

pub fn deployments() -> ApiResource {
    ApiResource::new("apps", "v1", "Deployment", "deployments")
}

/// An `Added` event of an object called `name`.
pub fn added(name: &str) -> ListEvent {
    ListEvent::new(EventKind::Added, DynamicObject::new(name))
}

/// A handler which keeps every event it receives.
pub fn recorder<E: Clone + Send + 'static>() -> (Handler<E>, Arc<Mutex<Vec<E>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let e = Arc::clone(&events);
    let handler = Handler::new(move |event: &E| {
        e.lock().push(event.clone());
        Ok(())
    });

    (handler, events)
}

struct Recorded<P, T> {
    params: P,
    observer: Arc<Observer<T>>,
    unsubscribed: Arc<AtomicUsize>,
}

struct RecordedSubscription(Arc<AtomicUsize>);

impl Subscription for RecordedSubscription {
    fn unsubscribe(self: Box<Self>) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Keeps every stream it is asked to open, streams are addressed by the
/// order they were opened in. Events are pushed in by the test.
#[derive(Default)]
pub struct RecordingTransport {
    lists: Mutex<Vec<Recorded<ListWatchParams, ListEvent>>>,
    items: Mutex<Vec<Recorded<ItemWatchParams, DynamicObject>>>,
    replay: Option<ListEvent>,
}

impl RecordingTransport {
    /// Delivers `event` from inside `watch_list`, before the handle is returned.
    pub fn replay_on_open(mut self, event: ListEvent) -> Self {
        self.replay = Some(event);
        self
    }

    pub fn list_opens(&self) -> usize {
        self.lists.lock().len()
    }

    pub fn item_opens(&self) -> usize {
        self.items.lock().len()
    }

    pub fn list_params(&self, index: usize) -> ListWatchParams {
        self.lists.lock()[index].params.clone()
    }

    pub fn item_params(&self, index: usize) -> ItemWatchParams {
        self.items.lock()[index].params.clone()
    }

    pub fn emit_list(&self, index: usize, event: ListEvent) {
        let observer = Arc::clone(&self.lists.lock()[index].observer);
        observer.data(event);
    }

    pub fn fail_list(&self, index: usize, err: TransportError) {
        let observer = Arc::clone(&self.lists.lock()[index].observer);
        observer.error(err);
    }

    pub fn emit_item(&self, index: usize, object: DynamicObject) {
        let observer = Arc::clone(&self.items.lock()[index].observer);
        observer.data(object);
    }

    pub fn fail_item(&self, index: usize, err: TransportError) {
        let observer = Arc::clone(&self.items.lock()[index].observer);
        observer.error(err);
    }

    pub fn list_unsubscribes(&self, index: usize) -> usize {
        self.lists.lock()[index].unsubscribed.load(Ordering::SeqCst)
    }

    pub fn item_unsubscribes(&self, index: usize) -> usize {
        self.items.lock()[index].unsubscribed.load(Ordering::SeqCst)
    }

    pub fn total_unsubscribes(&self) -> usize {
        let lists = self
            .lists
            .lock()
            .iter()
            .map(|r| r.unsubscribed.load(Ordering::SeqCst))
            .sum::<usize>();
        let items = self
            .items
            .lock()
            .iter()
            .map(|r| r.unsubscribed.load(Ordering::SeqCst))
            .sum::<usize>();

        lists + items
    }
}

impl Transport for RecordingTransport {
    fn watch_list(
        &self,
        params: ListWatchParams,
        observer: Observer<ListEvent>,
    ) -> Box<dyn Subscription> {
        let observer = Arc::new(observer);
        let unsubscribed = Arc::new(AtomicUsize::new(0));
        self.lists.lock().push(Recorded {
            params,
            observer: Arc::clone(&observer),
            unsubscribed: Arc::clone(&unsubscribed),
        });

        if let Some(event) = &self.replay {
            observer.data(event.clone());
        }

        Box::new(RecordedSubscription(unsubscribed))
    }

    fn watch_item(
        &self,
        params: ItemWatchParams,
        observer: Observer<DynamicObject>,
    ) -> Box<dyn Subscription> {
        let unsubscribed = Arc::new(AtomicUsize::new(0));
        self.items.lock().push(Recorded {
            params,
            observer: Arc::new(observer),
            unsubscribed: Arc::clone(&unsubscribed),
        });

        Box::new(RecordedSubscription(unsubscribed))
    }
}
