pub mod asset;
pub mod config;
pub mod context;
pub mod control;
pub mod gateway;
pub mod metadata;
pub mod net;
pub mod policy;
pub mod protocol;
pub mod store;
pub mod sync;
pub mod viewport;
pub mod worker;
