use kubernetes::DynamicObject;
use tracing::error;

use super::{WatchKind, WatchRegistry};
use crate::key::RegistryKey;
use crate::transport::{ItemWatchParams, Observer, Subscription, Transport, TransportError};

/// Single object watches. Every event carries the latest state of the
/// object, which replaces whatever snapshot a consumer held before.
pub struct ItemWatch;

impl WatchKind for ItemWatch {
    type Params = ItemWatchParams;
    type Event = DynamicObject;

    const NAME: &'static str = "item";

    fn is_valid(object: &DynamicObject) -> bool {
        object.metadata.uid().is_some()
    }

    fn open(
        transport: &dyn Transport,
        params: ItemWatchParams,
        resource_version: Option<String>,
        observer: Observer<DynamicObject>,
    ) -> Box<dyn Subscription> {
        transport.watch_item(
            ItemWatchParams {
                resource_version,
                ..params
            },
            observer,
        )
    }

    fn report(
        key: &RegistryKey,
        params: &ItemWatchParams,
        resource_version: Option<&str>,
        err: &TransportError,
    ) {
        error!(
            message = "item watch subscription failed",
            key = %key,
            plural = %params.resource.plural,
            resource_version = resource_version.unwrap_or_default(),
            cluster = %params.cluster,
            namespace = params.namespace.as_deref().unwrap_or_default(),
            name = %params.name,
            %err
        );
    }
}

/// Shares one single object watch per registry key between all its consumers.
pub type ItemWatchRegistry = WatchRegistry<ItemWatch>;
