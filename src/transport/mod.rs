//! The boundary to whatever actually opens watch streams.
//!
//! A transport opens a stream synchronously and hands back a [`Subscription`]
//! handle, events and errors arrive later through the [`Observer`] callbacks,
//! on whichever thread the transport drives the stream from.

mod kube;

pub use kube::KubeTransport;

use kubernetes::{ApiResource, DynamicObject};

use crate::key::QueryKey;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("unknown cluster {0:?}")]
    UnknownCluster(String),

    #[error("resource version {0:?} is too old")]
    Gone(String),

    #[error("api server error, code: {code}, reason: {reason}, message: {message}")]
    Api {
        code: u16,
        reason: String,
        message: String,
    },

    #[error(transparent)]
    Client(#[from] kubernetes::Error),

    #[error("{0}")]
    Other(String),
}

/// Parameters of a collection watch.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ListWatchParams {
    pub cluster: String,
    pub namespace: Option<String>,
    pub resource: ApiResource,
    pub label_selector: Option<String>,
    /// Events strictly after this version are delivered, `None` means "now".
    pub resource_version: Option<String>,
}

impl ListWatchParams {
    pub fn new(query: &QueryKey) -> Self {
        Self {
            cluster: query.cluster.clone(),
            namespace: query.namespace.clone(),
            resource: query.resource.clone(),
            label_selector: query.label_selector(),
            resource_version: None,
        }
    }
}

/// Parameters of a single object watch.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ItemWatchParams {
    pub cluster: String,
    pub namespace: Option<String>,
    pub resource: ApiResource,
    pub name: String,
    pub resource_version: Option<String>,
}

impl ItemWatchParams {
    pub fn new(query: &QueryKey) -> Self {
        Self {
            cluster: query.cluster.clone(),
            namespace: query.namespace.clone(),
            resource: query.resource.clone(),
            name: query.name.clone().unwrap_or_default(),
            resource_version: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
    Bookmark,
}

/// A change to one member of a watched collection.
#[derive(Clone, Debug, PartialEq)]
pub struct ListEvent {
    pub kind: EventKind,
    pub object: DynamicObject,
}

impl ListEvent {
    pub fn new(kind: EventKind, object: DynamicObject) -> Self {
        Self { kind, object }
    }
}

type DataFn<T> = Box<dyn Fn(T) + Send + Sync>;
type ErrorFn = Box<dyn Fn(TransportError) + Send + Sync>;

/// The `on_data`/`on_error` pair a stream reports to.
pub struct Observer<T> {
    on_data: DataFn<T>,
    on_error: ErrorFn,
}

impl<T> Observer<T> {
    pub fn new<D, E>(on_data: D, on_error: E) -> Self
    where
        D: Fn(T) + Send + Sync + 'static,
        E: Fn(TransportError) + Send + Sync + 'static,
    {
        Self {
            on_data: Box::new(on_data),
            on_error: Box::new(on_error),
        }
    }

    pub fn data(&self, value: T) {
        (self.on_data)(value)
    }

    pub fn error(&self, err: TransportError) {
        (self.on_error)(err)
    }
}

/// Handle of one open stream.
pub trait Subscription: Send {
    /// Closes the stream, no events are delivered afterwards.
    fn unsubscribe(self: Box<Self>);
}

pub trait Transport: Send + Sync {
    fn watch_list(
        &self,
        params: ListWatchParams,
        observer: Observer<ListEvent>,
    ) -> Box<dyn Subscription>;

    fn watch_item(
        &self,
        params: ItemWatchParams,
        observer: Observer<DynamicObject>,
    ) -> Box<dyn Subscription>;
}

/// A subscription with nothing behind it, returned when a stream could not
/// be opened at all.
pub struct Inert;

impl Subscription for Inert {
    fn unsubscribe(self: Box<Self>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_from_query() {
        let query = QueryKey::new("prod", ApiResource::new("apps", "v1", "Deployment", "deployments"))
            .namespace("ci")
            .label("app", "web");

        let params = ListWatchParams::new(&query);
        assert_eq!(params.cluster, "prod");
        assert_eq!(params.namespace.as_deref(), Some("ci"));
        assert_eq!(params.label_selector.as_deref(), Some("app=web"));
        assert_eq!(params.resource_version, None);

        let params = ItemWatchParams::new(&query.name("web"));
        assert_eq!(params.name, "web");
        assert_eq!(params.resource.plural, "deployments");
    }
}
