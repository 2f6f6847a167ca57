use std::collections::HashMap;
use std::time::Duration;

use backoff::ExponentialBackoff;
use futures::StreamExt;
use kubernetes::{
    ApiResource, Bookmark, Client, DynamicObject, ObjectMeta, WatchEvent, WatchParams,
};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{
    EventKind, Inert, ItemWatchParams, ListEvent, ListWatchParams, Observer, Subscription,
    Transport, TransportError,
};
use crate::config::{Config, ConfigError};

const fn rewatch_backoff() -> ExponentialBackoff {
    ExponentialBackoff::from_millis(2)
        .factor(250)
        .max_delay(Duration::from_secs(30))
}

/// Opens watches against the API servers of the configured clusters.
///
/// Every subscription is a task on `runtime`, which re-watches from the
/// last seen resource version whenever the server ends the stream. Re-watches
/// are paced by an exponential backoff, which starts over once events flow.
pub struct KubeTransport {
    clients: HashMap<String, Client>,
    runtime: Handle,
    timeout: Option<u32>,
    backoff: ExponentialBackoff,
}

impl KubeTransport {
    pub fn new(runtime: Handle) -> Self {
        KubeTransport {
            clients: HashMap::new(),
            runtime,
            timeout: None,
            backoff: rewatch_backoff(),
        }
    }

    pub fn from_config(config: &Config, runtime: Handle) -> Result<Self, ConfigError> {
        let mut transport = KubeTransport::new(runtime).with_timeout(config.watch_timeout);

        for cluster in &config.clusters {
            let options = kubernetes::Config::from_options(&cluster.options).map_err(|source| {
                ConfigError::Cluster {
                    name: cluster.name.clone(),
                    source,
                }
            })?;

            transport.add_cluster(cluster.name.clone(), Client::new(options));
        }

        Ok(transport)
    }

    /// Server side timeout of a single watch request, in seconds.
    pub fn with_timeout(mut self, timeout: Option<u32>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Delays between two watch requests of one subscription.
    pub fn with_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn add_cluster(&mut self, name: impl Into<String>, client: Client) {
        self.clients.insert(name.into(), client);
    }

    pub fn client(&self, cluster: &str) -> Option<&Client> {
        self.clients.get(cluster)
    }

    fn spawn<T: Send + 'static>(
        &self,
        cluster: &str,
        target: Target,
        resource_version: Option<String>,
        observer: Observer<T>,
        convert: fn(WatchEvent<DynamicObject>) -> Option<T>,
    ) -> Box<dyn Subscription> {
        let Some(client) = self.clients.get(cluster).cloned() else {
            observer.error(TransportError::UnknownCluster(cluster.to_string()));
            return Box::new(Inert);
        };

        let version = resource_version.unwrap_or_default();
        let backoff = self.backoff.clone();
        let handle = self
            .runtime
            .spawn(watch(client, target, version, backoff, observer, convert));

        Box::new(Task(handle))
    }
}

impl Transport for KubeTransport {
    fn watch_list(
        &self,
        params: ListWatchParams,
        observer: Observer<ListEvent>,
    ) -> Box<dyn Subscription> {
        let target = Target {
            resource: params.resource,
            namespace: params.namespace,
            params: WatchParams {
                label_selector: params.label_selector,
                field_selector: None,
                timeout: self.timeout,
                bookmarks: true,
            },
        };

        self.spawn(
            &params.cluster,
            target,
            params.resource_version,
            observer,
            list_event,
        )
    }

    fn watch_item(
        &self,
        params: ItemWatchParams,
        observer: Observer<DynamicObject>,
    ) -> Box<dyn Subscription> {
        let target = Target {
            resource: params.resource,
            namespace: params.namespace,
            params: WatchParams {
                label_selector: None,
                field_selector: Some(format!("metadata.name={}", params.name)),
                timeout: self.timeout,
                bookmarks: true,
            },
        };

        self.spawn(
            &params.cluster,
            target,
            params.resource_version,
            observer,
            item_event,
        )
    }
}

struct Target {
    resource: ApiResource,
    namespace: Option<String>,
    params: WatchParams,
}

struct Task(JoinHandle<()>);

impl Subscription for Task {
    fn unsubscribe(self: Box<Self>) {
        self.0.abort();
    }
}

async fn watch<T>(
    client: Client,
    target: Target,
    mut version: String,
    mut backoff: ExponentialBackoff,
    observer: Observer<T>,
    convert: fn(WatchEvent<DynamicObject>) -> Option<T>,
) {
    loop {
        let result = client
            .watch::<DynamicObject>(
                &target.resource,
                target.namespace.as_deref(),
                &target.params,
                &version,
            )
            .await;

        match result {
            Ok(mut stream) => {
                while let Some(result) = stream.next().await {
                    let event = match result {
                        Ok(event) => event,
                        Err(err) => {
                            observer.error(err.into());
                            break;
                        }
                    };

                    match event {
                        // HTTP GONE, the version we resume from is too old, start over from now
                        WatchEvent::Error(resp) if resp.code == 410 => {
                            observer.error(TransportError::Gone(std::mem::take(&mut version)));
                            break;
                        }
                        WatchEvent::Error(resp) => {
                            if resp.code == 403 {
                                warn!(
                                    message = "watch event error",
                                    code = resp.code,
                                    reason = %resp.reason
                                );
                            }

                            observer.error(TransportError::Api {
                                code: resp.code,
                                reason: resp.reason,
                                message: resp.message,
                            });
                        }
                        event => {
                            backoff.reset();

                            if let Some(resource_version) = resource_version(&event) {
                                version = resource_version.to_string();
                            }

                            if let Some(value) = convert(event) {
                                observer.data(value);
                            }
                        }
                    }
                }

                debug!(
                    message = "watch stream ended, re-watching",
                    plural = %target.resource.plural,
                    resource_version = %version
                );
            }
            Err(kubernetes::Error::Api(resp)) if resp.code == 410 => {
                observer.error(TransportError::Gone(std::mem::take(&mut version)));
            }
            Err(err) => observer.error(err.into()),
        }

        backoff.wait().await;
    }
}

fn resource_version(event: &WatchEvent<DynamicObject>) -> Option<&str> {
    match event {
        WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => {
            obj.metadata.resource_version.as_deref()
        }
        WatchEvent::Bookmark(bookmark) => Some(bookmark.metadata.resource_version.as_str()),
        WatchEvent::Error(_) => None,
    }
}

/// Bookmarks only carry a resource version, they are passed on as objects
/// without identity.
fn bookmark_object(bookmark: Bookmark) -> DynamicObject {
    DynamicObject {
        metadata: ObjectMeta {
            resource_version: Some(bookmark.metadata.resource_version),
            annotations: bookmark.metadata.annotations,
            ..Default::default()
        },
        data: Default::default(),
    }
}

fn list_event(event: WatchEvent<DynamicObject>) -> Option<ListEvent> {
    let event = match event {
        WatchEvent::Added(obj) => ListEvent::new(EventKind::Added, obj),
        WatchEvent::Modified(obj) => ListEvent::new(EventKind::Modified, obj),
        WatchEvent::Deleted(obj) => ListEvent::new(EventKind::Deleted, obj),
        WatchEvent::Bookmark(bookmark) => {
            ListEvent::new(EventKind::Bookmark, bookmark_object(bookmark))
        }
        WatchEvent::Error(_) => return None,
    };

    Some(event)
}

fn item_event(event: WatchEvent<DynamicObject>) -> Option<DynamicObject> {
    match event {
        WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => Some(obj),
        WatchEvent::Bookmark(bookmark) => Some(bookmark_object(bookmark)),
        WatchEvent::Error(_) => None,
    }
}
