use tracing::error;

use super::{WatchKind, WatchRegistry};
use crate::key::RegistryKey;
use crate::transport::{
    ListEvent, ListWatchParams, Observer, Subscription, Transport, TransportError,
};

/// Collection watches: "all objects of a type in a namespace matching labels".
pub struct ListWatch;

impl WatchKind for ListWatch {
    type Params = ListWatchParams;
    type Event = ListEvent;

    const NAME: &'static str = "list";

    fn is_valid(event: &ListEvent) -> bool {
        event.object.metadata.name().is_some()
    }

    fn open(
        transport: &dyn Transport,
        params: ListWatchParams,
        resource_version: Option<String>,
        observer: Observer<ListEvent>,
    ) -> Box<dyn Subscription> {
        transport.watch_list(
            ListWatchParams {
                resource_version,
                ..params
            },
            observer,
        )
    }

    fn report(
        key: &RegistryKey,
        params: &ListWatchParams,
        resource_version: Option<&str>,
        err: &TransportError,
    ) {
        error!(
            message = "list watch subscription failed",
            key = %key,
            plural = %params.resource.plural,
            resource_version = resource_version.unwrap_or_default(),
            cluster = %params.cluster,
            namespace = params.namespace.as_deref().unwrap_or_default(),
            labels = params.label_selector.as_deref().unwrap_or_default(),
            %err
        );
    }
}

/// Shares one collection watch per registry key between all its consumers.
pub type ListWatchRegistry = WatchRegistry<ListWatch>;

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use kubernetes::{DynamicObject, ObjectMeta};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::key::QueryKey;
    use crate::registry::Handler;
    use crate::testing::{RecordingTransport, added, pods, recorder};
    use crate::transport::EventKind;

    fn setup() -> (ListWatchRegistry, Arc<RecordingTransport>, QueryKey) {
        let transport = Arc::new(RecordingTransport::default());
        let registry = ListWatchRegistry::new();
        registry.set_transport_client(transport.clone());

        let query = QueryKey::new("prod", pods())
            .namespace("ci")
            .label("app", "web");

        (registry, transport, query)
    }

    #[test]
    fn opens_with_params_and_version() {
        let (registry, transport, query) = setup();
        let (handler, _) = recorder::<ListEvent>();

        let _registration = registry.register(&query, ListWatchParams::new(&query), handler);
        registry.start_subscription(&query, Some("100"));

        assert_eq!(
            transport.list_params(0),
            ListWatchParams {
                cluster: "prod".into(),
                namespace: Some("ci".into()),
                resource: pods(),
                label_selector: Some("app=web".into()),
                resource_version: Some("100".into()),
            }
        );
    }

    #[test]
    fn repeated_start_opens_once() {
        let (registry, transport, query) = setup();
        let (handler, _) = recorder::<ListEvent>();

        let _registration = registry.register(&query, ListWatchParams::new(&query), handler);
        for _ in 0..5 {
            registry.start_subscription(&query, Some("100"));
        }

        assert_eq!(transport.list_opens(), 1);
    }

    #[test]
    fn late_registration_reuses_stream() {
        let (registry, transport, query) = setup();
        let (h1, e1) = recorder::<ListEvent>();
        let (h2, e2) = recorder::<ListEvent>();

        let _r1 = registry.register(&query, ListWatchParams::new(&query), h1);
        registry.start_subscription(&query, Some("100"));
        transport.emit_list(0, added("web-0"));

        let _r2 = registry.register(&query, ListWatchParams::new(&query), h2);
        registry.start_subscription(&query, Some("100"));
        transport.emit_list(0, added("web-1"));

        assert_eq!(transport.list_opens(), 1);
        assert_eq!(e1.lock().len(), 2);
        // no replay of what happened before registering
        assert_eq!(*e2.lock(), vec![added("web-1")]);
    }

    #[test]
    fn events_without_name_are_dropped() {
        let (registry, transport, query) = setup();
        let (handler, events) = recorder::<ListEvent>();

        let _registration = registry.register(&query, ListWatchParams::new(&query), handler);
        registry.start_subscription(&query, None);

        transport.emit_list(0, ListEvent::new(EventKind::Modified, DynamicObject::default()));
        transport.emit_list(
            0,
            ListEvent::new(
                EventKind::Modified,
                DynamicObject {
                    metadata: ObjectMeta {
                        name: Some(String::new()),
                        uid: Some("u1".into()),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            ),
        );
        assert!(events.lock().is_empty());

        transport.emit_list(0, added("web-0"));
        assert_eq!(events.lock().len(), 1);
    }

    #[test]
    fn events_keep_upstream_order() {
        let (registry, transport, query) = setup();
        let (handler, events) = recorder::<ListEvent>();

        let _registration = registry.register(&query, ListWatchParams::new(&query), handler);
        registry.start_subscription(&query, None);

        let names = ["a", "b", "c", "d"];
        for name in names {
            transport.emit_list(0, added(name));
        }

        let received = events
            .lock()
            .iter()
            .filter_map(|event| event.object.metadata.name.clone())
            .collect::<Vec<_>>();
        assert_eq!(received, names);
    }

    #[test]
    fn failing_handlers_are_isolated() {
        let (registry, transport, query) = setup();
        let (h1, e1) = recorder::<ListEvent>();
        let (h3, e3) = recorder::<ListEvent>();
        let failing = Handler::new(|_: &ListEvent| Err("cache rejected event".into()));
        let panicking = Handler::new(|_: &ListEvent| -> crate::Result<()> { panic!("handler bug") });

        let _r1 = registry.register(&query, ListWatchParams::new(&query), h1);
        let _r2 = registry.register(&query, ListWatchParams::new(&query), failing);
        let _r3 = registry.register(&query, ListWatchParams::new(&query), panicking);
        let _r4 = registry.register(&query, ListWatchParams::new(&query), h3);
        registry.start_subscription(&query, None);

        transport.emit_list(0, added("web-0"));
        transport.emit_list(0, added("web-1"));

        assert_eq!(e1.lock().len(), 2);
        assert_eq!(e3.lock().len(), 2);
        assert_eq!(transport.list_unsubscribes(0), 0);
        assert!(registry.is_started(&query));
    }

    #[test]
    fn transport_errors_keep_the_entry() {
        let (registry, transport, query) = setup();
        let (handler, events) = recorder::<ListEvent>();

        let _registration = registry.register(&query, ListWatchParams::new(&query), handler);
        registry.start_subscription(&query, Some("100"));

        transport.fail_list(0, TransportError::Other("connection reset".into()));

        assert_eq!(registry.ref_count(&query), 1);
        assert!(registry.is_started(&query));
        assert_eq!(transport.list_unsubscribes(0), 0);

        transport.emit_list(0, added("web-0"));
        assert_eq!(events.lock().len(), 1);
    }

    #[test]
    fn keys_are_isolated() {
        let (registry, transport, query) = setup();
        let other = QueryKey::new("prod", pods()).namespace("ci");
        let (h1, e1) = recorder::<ListEvent>();
        let (h2, e2) = recorder::<ListEvent>();

        let _r1 = registry.register(&query, ListWatchParams::new(&query), h1);
        let _r2 = registry.register(&other, ListWatchParams::new(&other), h2);
        registry.start_subscription(&query, None);
        registry.start_subscription(&other, None);

        assert_eq!(transport.list_opens(), 2);
        transport.emit_list(1, added("web-0"));

        assert!(e1.lock().is_empty());
        assert_eq!(e2.lock().len(), 1);
    }

    #[test]
    fn swapping_transport_keeps_open_streams() {
        let (registry, first, query) = setup();
        let other = QueryKey::new("prod", pods()).namespace("web");
        let (handler, events) = recorder::<ListEvent>();

        let _r1 = registry.register(&query, ListWatchParams::new(&query), handler.clone());
        registry.start_subscription(&query, None);

        let second = Arc::new(RecordingTransport::default());
        registry.set_transport_client(second.clone());

        let _r2 = registry.register(&other, ListWatchParams::new(&other), handler);
        registry.start_subscription(&other, None);

        assert_eq!(first.list_opens(), 1);
        assert_eq!(second.list_opens(), 1);
        assert_eq!(first.list_unsubscribes(0), 0);

        first.emit_list(0, added("web-0"));
        assert_eq!(events.lock().len(), 1);
    }

    #[test]
    fn register_from_handler() {
        let (registry, transport, query) = setup();
        let other = QueryKey::new("prod", pods()).namespace("web");
        let (late, late_events) = recorder::<ListEvent>();
        let held = Arc::new(Mutex::new(Vec::new()));

        let r = registry.clone();
        let h = Arc::clone(&held);
        let o = other.clone();
        let handler = Handler::new(move |_: &ListEvent| {
            h.lock().push(r.register(&o, ListWatchParams::new(&o), late.clone()));
            Ok(())
        });

        let _registration = registry.register(&query, ListWatchParams::new(&query), handler);
        registry.start_subscription(&query, None);
        transport.emit_list(0, added("web-0"));

        assert_eq!(registry.ref_count(&other), 1);
        assert!(late_events.lock().is_empty());
    }
}
