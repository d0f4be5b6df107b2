#![doc = include_str!("../README.md")]

mod context;
pub mod counters;
pub mod db;
pub mod error;
pub mod index;
pub mod protocol;
pub mod range;
pub mod tuple;
pub mod txn;
pub mod workload;

pub use db::{Engine, Table};
pub use error::{AbortReason, Error};
pub use protocol::{GcNotice, LatestOcc, Protocol, SnapshotOcc, TidSource};
pub use range::KeyRange;
pub use txn::{Transaction, TxnFlags, TxnState};

/// Transaction identifier: the engine's logical clock.
pub type Tid = u64;

/// The tid of a version that has never committed. Readers treat a latest
/// version at `NIL_TID` as nil.
pub const NIL_TID: Tid = 0;
