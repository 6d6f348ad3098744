pub mod attachment;
pub mod config;
pub mod crypto;
pub mod error;
pub mod ledger;
pub mod pipeline;
pub mod record;
pub mod server;
pub mod storage;
pub mod verify;
