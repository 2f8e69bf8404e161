pub mod engine;
pub mod events;
pub mod limits;
pub mod model;
pub mod observability;
pub mod reaper;
pub mod store;
pub mod tenant;
pub mod wal;
pub mod wire;
