//! Cache tier backends.
//!
//! | Backend | Durability | On failure |
//! |---------|------------|------------|
//! | [`memory::MemoryBackend`] | process | never fails |
//! | [`sqlite::SqliteBackend`] | survives restart | logged, treated as miss |
//! | [`redis::RedisBackend`] | shared between instances | logged, treated as miss |

pub mod memory;
pub mod redis;
pub mod sqlite;
pub mod traits;
