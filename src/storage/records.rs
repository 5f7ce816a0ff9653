//! Reference record store.
//!
//! Keeps synchronized certificate records in SQLite so the gateway can run
//! complete sync cycles outside a host. Records are keyed by request id and
//! indexed by normalized serial number for reconciliation lookups.

use std::{
    fs,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use log::debug;
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, params};

use crate::core::certificate::inspect_der;
use crate::core::types::{CanonicalStatus, LocalRecord, LocalSyncRecord};
use crate::domain::normalize_serial;

use super::LocalRecordStore;

const DB_FILE: &str = "gateway.sqlite";

#[derive(Clone)]
pub struct SqliteRecordStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRecordStore {
    /// Opens (or creates) the store inside `data_dir`.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created, the database
    /// cannot be opened, or schema initialization fails.
    pub fn initialize_with_path(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create store dir {}", data_dir.display()))?;
        let db_path = data_dir.join(DB_FILE);
        let conn = Connection::open_with_flags(
            &db_path,
            OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .with_context(|| format!("failed to open SQLite database at {}", db_path.display()))?;

        Self::configure_connection(&conn)?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA foreign_keys = ON;
            "#,
        )?;
        Ok(())
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sync_records (
                ca_request_id TEXT PRIMARY KEY,
                serial TEXT,
                product_id TEXT NOT NULL,
                status INTEGER NOT NULL,
                certificate BLOB,
                submission_date TEXT,
                resolution_date TEXT,
                revocation_reason INTEGER NOT NULL,
                revocation_date TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sync_records_serial ON sync_records(serial);
            "#,
        )?;
        Ok(())
    }

    /// Upserts a reconciled record.
    ///
    /// The serial is read from the certificate bytes when present; records
    /// without bytes keep whatever serial was stored before.
    pub fn apply(&self, record: &LocalSyncRecord) -> Result<()> {
        let serial = match record.certificate.as_deref() {
            Some(der) => Some(normalize_serial(&inspect_der(der)?.serial_hex)?),
            None => None,
        };
        let conn = self.lock_conn()?;
        conn.execute(
            r#"
            INSERT INTO sync_records (
                ca_request_id, serial, product_id, status, certificate,
                submission_date, resolution_date, revocation_reason,
                revocation_date, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(ca_request_id) DO UPDATE SET
                serial = COALESCE(excluded.serial, sync_records.serial),
                product_id = excluded.product_id,
                status = excluded.status,
                certificate = COALESCE(excluded.certificate, sync_records.certificate),
                submission_date = excluded.submission_date,
                resolution_date = excluded.resolution_date,
                revocation_reason = excluded.revocation_reason,
                revocation_date = excluded.revocation_date,
                updated_at = excluded.updated_at
            "#,
            params![
                record.ca_request_id,
                serial,
                record.product_id,
                record.status.disposition_code(),
                record.certificate,
                record.submission_date.map(|date| date.to_rfc3339()),
                record.resolution_date.map(|date| date.to_rfc3339()),
                record.legacy_revocation_code(),
                record.revocation_date.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )
        .with_context(|| format!("failed to store record {}", record.ca_request_id))?;
        debug!(
            "[store] applied {} ({})",
            record.ca_request_id, record.status
        );
        Ok(())
    }

    /// Writes a record as the host would have stored it, e.g. legacy
    /// `<id>-<suffix>` request ids.
    pub fn put_local(&self, record: &LocalRecord) -> Result<()> {
        let serial = normalize_serial(&record.serial_number)?;
        let conn = self.lock_conn()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO sync_records (
                ca_request_id, serial, product_id, status, certificate,
                revocation_reason, revocation_date, updated_at
            ) VALUES (?1, ?2, '', ?3, ?4, ?5, ?6, ?6)
            "#,
            params![
                record.ca_request_id,
                serial,
                record.status.disposition_code(),
                record.certificate,
                crate::core::types::NOT_REVOKED_SENTINEL,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, ca_request_id: &str) -> Result<Option<LocalRecord>> {
        let conn = self.lock_conn()?;
        let record = conn
            .query_row(
                r#"
                SELECT ca_request_id, serial, status, certificate
                FROM sync_records
                WHERE ca_request_id = ?1
                "#,
                params![ca_request_id],
                Self::row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Last time a record was written, if it exists.
    pub fn updated_at(&self, ca_request_id: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.lock_conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT updated_at FROM sync_records WHERE ca_request_id = ?1",
                params![ca_request_id],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|value| value.with_timezone(&Utc))
                .with_context(|| format!("invalid updated_at for {ca_request_id}"))
        })
        .transpose()
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM sync_records", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn row_to_record(row: &Row<'_>) -> rusqlite::Result<LocalRecord> {
        let serial: Option<String> = row.get(1)?;
        let status: i32 = row.get(2)?;
        Ok(LocalRecord {
            ca_request_id: row.get(0)?,
            serial_number: serial.unwrap_or_default(),
            status: CanonicalStatus::from_disposition_code(status),
            certificate: row.get(3)?,
        })
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|err| anyhow!("record store mutex poisoned: {err}"))
    }
}

impl LocalRecordStore for SqliteRecordStore {
    fn lookup(&self, serial_hex: &str) -> Result<Option<LocalRecord>> {
        let serial = normalize_serial(serial_hex)?;
        let conn = self.lock_conn()?;
        let record = conn
            .query_row(
                r#"
                SELECT ca_request_id, serial, status, certificate
                FROM sync_records
                WHERE serial = ?1
                ORDER BY updated_at DESC
                LIMIT 1
                "#,
                params![serial],
                Self::row_to_record,
            )
            .optional()?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::RemoteCertificate;
    use rcgen::{CertificateParams, KeyPair};
    use std::path::PathBuf;
    use uuid::Uuid;

    fn create_temp_dir() -> Result<PathBuf> {
        let path = std::env::temp_dir().join(format!("cm_gateway_store_test_{}", Uuid::new_v4().as_simple()));
        fs::create_dir_all(&path)?;
        Ok(path)
    }

    fn issued_der() -> Result<Vec<u8>> {
        let params = CertificateParams::new(vec!["ccmqa.com".to_string()])?;
        let key = KeyPair::generate()?;
        Ok(params.self_signed(&key)?.der().to_vec())
    }

    #[test]
    fn applied_record_is_found_by_serial() -> Result<()> {
        let dir = create_temp_dir()?;
        let store = SqliteRecordStore::initialize_with_path(&dir)?;
        let der = issued_der()?;
        let serial = inspect_der(&der)?.serial_hex;

        let record = LocalSyncRecord::from_remote(
            "139".into(),
            &RemoteCertificate::default(),
            CanonicalStatus::Issued,
            Some(der.clone()),
        )?;
        store.apply(&record)?;

        let found = store.lookup(&serial)?.ok_or_else(|| anyhow!("record missing"))?;
        assert_eq!(found.ca_request_id, "139");
        assert_eq!(found.status, CanonicalStatus::Issued);
        assert_eq!(found.certificate, Some(der));
        assert!(store.updated_at("139")?.is_some());
        fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[test]
    fn status_update_keeps_bytes_and_serial() -> Result<()> {
        let dir = create_temp_dir()?;
        let store = SqliteRecordStore::initialize_with_path(&dir)?;
        let der = issued_der()?;
        let serial = inspect_der(&der)?.serial_hex;

        let issued = LocalSyncRecord::from_remote(
            "7".into(),
            &RemoteCertificate::default(),
            CanonicalStatus::Issued,
            Some(der.clone()),
        )?;
        store.apply(&issued)?;
        let revoked = LocalSyncRecord::from_remote(
            "7".into(),
            &RemoteCertificate::default(),
            CanonicalStatus::Revoked,
            None,
        )?;
        store.apply(&revoked)?;

        assert_eq!(store.count()?, 1);
        let found = store.lookup(&serial)?.ok_or_else(|| anyhow!("record missing"))?;
        assert_eq!(found.status, CanonicalStatus::Revoked);
        assert_eq!(found.certificate, Some(der));
        fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[test]
    fn lookup_accepts_colon_notation() -> Result<()> {
        let dir = create_temp_dir()?;
        let store = SqliteRecordStore::initialize_with_path(&dir)?;
        store.put_local(&LocalRecord {
            ca_request_id: "139-1".into(),
            serial_number: "0A1B2C".into(),
            status: CanonicalStatus::Issued,
            certificate: Some(vec![0x30]),
        })?;

        let found = store.lookup("0a:1b:2c")?.ok_or_else(|| anyhow!("record missing"))?;
        assert_eq!(found.ca_request_id, "139-1");
        assert!(store.lookup("FFFF")?.is_none());
        assert!(store.get("139-1")?.is_some());
        fs::remove_dir_all(dir)?;
        Ok(())
    }
}
