//! Embedded temporal key-value stores over a single redb file.
//!
//! A [`TemporalStateStore`] keeps every value a key held over time and
//! answers point-in-time reads. A [`SessionStore`] records activity
//! intervals and condenses overlapping ones. A [`RangedStateStore`] maps
//! half-open `u64` ranges to values and reads them by point. Oversized
//! keys and values are interned through per-store lookup tables; retention
//! passes sweep lookup rows no surviving record references.

mod buffer;
mod codec;
mod config;
mod env;
mod error;
mod key;
mod lookup;
mod store;

pub use buffer::ByteBufferPool;
pub use codec::time::TimePrecision;
pub use codec::value::{Timestamp, Value};
pub use config::{
    Format, HashWidth, KeyKind, LookupConfig, StoreConfig, StoreKind, ValueMode, FORMAT_VERSION,
};
pub use error::{Error, Result};
pub use lookup::used::SweepStats;
pub use store::ranged::{RangedEntry, RangedStateStore, RangedWriter};
pub use store::session::{SessionEntry, SessionStore, SessionWriter};
pub use store::temporal::{StateEntry, TemporalStateStore, TemporalWriter};
pub use store::{Cancellation, CondenseStats, MaintenanceStats, Query, TimeRange};
