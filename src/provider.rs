//! Ties the registries to the authentication session.
//!
//! A login creates a fresh pair of registries, a logout tears them down,
//! closing every stream whatever its consumers think about it. Nothing
//! survives from one session to the next.

use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::registry::{ItemWatchRegistry, ListWatchRegistry};
use crate::transport::Transport;

/// What consumers see, both `None` while unauthenticated.
#[derive(Clone, Default)]
pub struct Registries {
    pub list: Option<ListWatchRegistry>,
    pub item: Option<ItemWatchRegistry>,
}

struct Session {
    list: ListWatchRegistry,
    item: ItemWatchRegistry,
}

impl Session {
    fn new(transport: Option<&Arc<dyn Transport>>) -> Self {
        let session = Session {
            list: ListWatchRegistry::new(),
            item: ItemWatchRegistry::new(),
        };
        if let Some(transport) = transport {
            session.inject(transport);
        }

        session
    }

    fn inject(&self, transport: &Arc<dyn Transport>) {
        self.list.set_transport_client(Arc::clone(transport));
        self.item.set_transport_client(Arc::clone(transport));
    }

    fn close(self) {
        self.list.cleanup();
        self.item.cleanup();
    }
}

#[derive(Default)]
struct State {
    authenticated: bool,
    transport: Option<Arc<dyn Transport>>,
    session: Option<Session>,
}

/// Process wide owner of the watch registries. Clones share state.
#[derive(Clone, Default)]
pub struct RegistryProvider {
    state: Arc<RwLock<State>>,
}

impl RegistryProvider {
    pub fn new(transport: Option<Arc<dyn Transport>>) -> Self {
        RegistryProvider {
            state: Arc::new(RwLock::new(State {
                transport,
                ..Default::default()
            })),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.read().authenticated
    }

    /// Applies the authentication signal, nothing happens unless it flips.
    pub fn set_authenticated(&self, authenticated: bool) {
        let retired = {
            let mut state = self.state.write();
            if state.authenticated == authenticated {
                return;
            }
            state.authenticated = authenticated;

            if authenticated {
                let session = Session::new(state.transport.as_ref());
                state.session = Some(session);
                None
            } else {
                state.session.take()
            }
        };

        match retired {
            Some(session) => {
                session.close();
                info!(message = "session closed, all watches stopped");
            }
            None if authenticated => info!(message = "session started"),
            None => {}
        }
    }

    /// Swaps the transport. Registries of the current session pick it up
    /// for streams they open from now on, open streams are left alone.
    pub fn set_transport(&self, transport: Arc<dyn Transport>) {
        let mut state = self.state.write();
        if let Some(session) = &state.session {
            debug!(message = "injecting new transport client");
            session.inject(&transport);
        }
        state.transport = Some(transport);
    }

    pub fn registries(&self) -> Registries {
        let state = self.state.read();
        match &state.session {
            Some(session) => Registries {
                list: Some(session.list.clone()),
                item: Some(session.item.clone()),
            },
            None => Registries::default(),
        }
    }

    pub fn list_watch_registry(&self) -> Option<ListWatchRegistry> {
        self.state
            .read()
            .session
            .as_ref()
            .map(|session| session.list.clone())
    }

    pub fn item_watch_registry(&self) -> Option<ItemWatchRegistry> {
        self.state
            .read()
            .session
            .as_ref()
            .map(|session| session.item.clone())
    }

    /// Follows the authentication and transport signals until `shutdown`
    /// resolves or either sender goes away, then logs out.
    pub async fn run(
        &self,
        mut auth: watch::Receiver<bool>,
        mut transport: watch::Receiver<Option<Arc<dyn Transport>>>,
        shutdown: impl Future<Output = ()>,
    ) {
        tokio::pin!(shutdown);

        let current = transport.borrow_and_update().clone();
        if let Some(current) = current {
            self.set_transport(current);
        }
        let authenticated = *auth.borrow_and_update();
        self.set_authenticated(authenticated);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                result = auth.changed() => {
                    if result.is_err() {
                        break;
                    }

                    let authenticated = *auth.borrow_and_update();
                    self.set_authenticated(authenticated);
                }
                result = transport.changed() => {
                    if result.is_err() {
                        break;
                    }

                    let current = transport.borrow_and_update().clone();
                    if let Some(current) = current {
                        self.set_transport(current);
                    }
                }
            }
        }

        self.set_authenticated(false);
    }
}
