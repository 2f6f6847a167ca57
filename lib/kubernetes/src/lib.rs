mod client;
mod config;
mod resource;

pub use client::{
    Bookmark, BookmarkMeta, Client, Error, ErrorResponse, ListParams, WatchEvent, WatchParams,
};
pub use config::{Auth, ClusterOptions, Config, Error as ConfigError};
pub use resource::{ApiResource, DynamicObject, ListMeta, ObjectList, ObjectMeta};
