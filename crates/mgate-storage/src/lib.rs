//! Persistence for mgate: entities, the storage facade, and the log-detail
//! retention sweep. Runtime request handling never reads the database
//! directly; it works from in-memory snapshots loaded here.

pub mod db;
pub mod entities;
pub mod retention;
pub mod store;

pub use retention::{RetentionSweeper, SweepStats};
pub use store::{
    AuthRows, ChannelRow, GatewayStore, LogDetailInput, LogRecordInput, StorageError,
    StorageResult, TokenRow, UserRow,
};
