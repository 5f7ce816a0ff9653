pub mod records;

use anyhow::Result;

use crate::core::types::LocalRecord;

pub use records::SqliteRecordStore;

/// Read side of the host's system of record, consulted during reconciliation.
pub trait LocalRecordStore: Send + Sync {
    /// Finds the record for a serial number in any hex notation.
    fn lookup(&self, serial_hex: &str) -> Result<Option<LocalRecord>>;
}
