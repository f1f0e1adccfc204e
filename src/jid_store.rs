//! Persistent store for registered JIDs and their credentials (component A's
//! "DB existence check" plus the credential half of component H), grounded
//! in the teacher's `db/mod.rs` / `db/roster.rs` libsql wrapper pattern.
//!
//! The schema matches §6 exactly: `jids(id, jid, password)` plus the three
//! roster tables owned by [`crate::roster::RosterStore`]. Schema creation
//! lives here because every table's foreign key ultimately points back at
//! `jids.id`, so one `init_schema` call brings up the whole store.
//!
//! Passwords are stored in plain text. This is not an oversight: DIGEST-MD5
//! (`HEX(H(user:realm:password))`) and legacy iq-auth digest
//! (`SHA1(streamid+password)`) both require the plaintext password to
//! reproduce the client's hash, so a one-way hash cannot be substituted
//! without dropping those mechanisms.

use std::path::Path;

use jid::BareJid;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::error::XmppError;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to open store: {0}")]
    Open(String),
    #[error("query failed: {0}")]
    Query(String),
}

impl From<StoreError> for XmppError {
    fn from(e: StoreError) -> Self {
        XmppError::storage(e.to_string())
    }
}

/// Creates every table in §6's schema if it does not already exist.
pub async fn init_schema(conn: &libsql::Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS jids (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            jid TEXT NOT NULL UNIQUE,
            password TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS roster (
            userid INTEGER NOT NULL,
            contactid INTEGER NOT NULL,
            name TEXT,
            subscription INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (userid, contactid)
        );

        CREATE TABLE IF NOT EXISTS rostergroups (
            groupid INTEGER PRIMARY KEY AUTOINCREMENT,
            userid INTEGER NOT NULL,
            name TEXT NOT NULL,
            UNIQUE (userid, name)
        );

        CREATE TABLE IF NOT EXISTS rostergroupitems (
            groupid INTEGER NOT NULL,
            contactid INTEGER NOT NULL,
            PRIMARY KEY (groupid, contactid)
        );
        "#,
    )
    .await
    .map_err(|e| StoreError::Open(e.to_string()))?;
    Ok(())
}

/// Handle onto the shared libsql database backing both this store and
/// [`crate::roster::RosterStore`]. Cheap to clone: libsql connections are
/// opened fresh per access per the 10-second-busy-timeout policy in §5.
#[derive(Clone)]
pub struct JidStore {
    db: std::sync::Arc<libsql::Database>,
}

impl JidStore {
    /// Opens (creating if absent) a file-backed store and brings up the
    /// schema. Pass `:memory:` for tests.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if path != Path::new(":memory:") {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| StoreError::Open(e.to_string()))?;
                }
            }
        }
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Open(e.to_string()))?;
        let store = JidStore { db: std::sync::Arc::new(db) };
        let conn = store.connect()?;
        init_schema(&conn).await?;
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:").await
    }

    pub fn connect(&self) -> Result<libsql::Connection, StoreError> {
        self.db.connect().map_err(|e| StoreError::Open(e.to_string()))
    }

    pub fn database(&self) -> std::sync::Arc<libsql::Database> {
        self.db.clone()
    }

    /// Component A's "DB existence check": does a registered account exist
    /// for this bare JID?
    #[instrument(skip(self))]
    pub async fn exists(&self, bare: &BareJid) -> Result<bool, StoreError> {
        Ok(self.id_for(bare).await?.is_some())
    }

    /// Internal `jids.id`, used by roster queries to join on `userid`.
    pub async fn id_for(&self, bare: &BareJid) -> Result<Option<i64>, StoreError> {
        let conn = self.connect()?;
        let mut rows = conn
            .query("SELECT id FROM jids WHERE jid = ?1", libsql::params![bare.to_string()])
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        match rows.next().await.map_err(|e| StoreError::Query(e.to_string()))? {
            Some(row) => Ok(Some(row.get(0).map_err(|e| StoreError::Query(e.to_string()))?)),
            None => Ok(None),
        }
    }

    /// Returns the stored plaintext password, if the account exists.
    #[instrument(skip(self))]
    pub async fn password_for(&self, bare: &BareJid) -> Result<Option<String>, StoreError> {
        let conn = self.connect()?;
        let mut rows = conn
            .query("SELECT password FROM jids WHERE jid = ?1", libsql::params![bare.to_string()])
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        match rows.next().await.map_err(|e| StoreError::Query(e.to_string()))? {
            Some(row) => Ok(Some(row.get(0).map_err(|e| StoreError::Query(e.to_string()))?)),
            None => Ok(None),
        }
    }

    /// `true` iff the account exists and `candidate` is its password.
    pub async fn verify_password(&self, bare: &BareJid, candidate: &str) -> Result<bool, StoreError> {
        Ok(self.password_for(bare).await?.as_deref() == Some(candidate))
    }

    /// Registers a new account, or updates the password of an existing one.
    /// Used by tests and by an eventual admin surface; the core pipeline
    /// never auto-provisions accounts.
    #[instrument(skip(self, password))]
    pub async fn upsert(&self, bare: &BareJid, password: &str) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO jids (jid, password) VALUES (?1, ?2) \
             ON CONFLICT(jid) DO UPDATE SET password = excluded.password",
            libsql::params![bare.to_string(), password.to_string()],
        )
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
        debug!(jid = %bare, "jid upserted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[tokio::test]
    async fn upsert_then_exists_and_verify() {
        let store = JidStore::in_memory().await.unwrap();
        let bob = BareJid::from_str("bob@localhost").unwrap();
        assert!(!store.exists(&bob).await.unwrap());

        store.upsert(&bob, "test").await.unwrap();
        assert!(store.exists(&bob).await.unwrap());
        assert!(store.verify_password(&bob, "test").await.unwrap());
        assert!(!store.verify_password(&bob, "wrong").await.unwrap());
    }

    #[tokio::test]
    async fn upsert_is_idempotent_on_jid() {
        let store = JidStore::in_memory().await.unwrap();
        let bob = BareJid::from_str("bob@localhost").unwrap();
        store.upsert(&bob, "first").await.unwrap();
        store.upsert(&bob, "second").await.unwrap();
        assert!(store.verify_password(&bob, "second").await.unwrap());

        let id = store.id_for(&bob).await.unwrap();
        assert!(id.is_some());
    }

    #[tokio::test]
    async fn unknown_jid_has_no_password() {
        let store = JidStore::in_memory().await.unwrap();
        let nobody = BareJid::from_str("nobody@localhost").unwrap();
        assert_eq!(store.password_for(&nobody).await.unwrap(), None);
    }
}
