//! Adapters behind the domain ports: ledger storage backends, the rail
//! HTTP client and the chain JSON-RPC client.

pub mod chain;
pub mod in_memory;
pub(crate) mod invariants;
pub mod rail;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
