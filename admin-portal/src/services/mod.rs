pub mod allow_list;
pub mod auth_client;
pub mod guard_registry;
pub mod identity_cache;
pub mod kv_store;
pub mod metrics;
pub mod reconciler;
pub mod session_source;
pub mod token_store;
