pub mod core;
pub mod domain;
pub mod enrollment;
pub mod gateway;
pub mod remote;
pub mod storage;
pub mod sync;

pub use crate::core::config::GatewayConfig;
pub use crate::core::types::{
    CanonicalStatus, EnrollmentOutcome, EnrollmentRequest, LocalRecord, LocalSyncRecord,
};
pub use gateway::Gateway;
pub use remote::{InMemoryAuthority, RemoteAuthority, ScmApiClient};
pub use storage::{LocalRecordStore, SqliteRecordStore};
