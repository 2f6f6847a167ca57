pub mod config;
pub mod consumer;
pub mod key;
pub mod provider;
pub mod registry;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod trace;
pub mod transport;

pub use key::{QueryKey, RegistryKey};
pub use provider::{Registries, RegistryProvider};
pub use registry::{Handler, ItemWatchRegistry, ListWatchRegistry, Registration};

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = Error> = std::result::Result<T, E>;
