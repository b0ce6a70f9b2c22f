//! Cache layer: one on-disk LMDB environment per tenant.

mod key;
mod lmdb_backend;

pub use key::{RecordKey, MAX_KEY_LEN};
pub use lmdb_backend::{CacheEntry, CacheError, DirtyEntry, PutOutcome, TenantCache};
