use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::debug;

use crate::error::SecRestResult;
use crate::store::{CredentialStore, SessionBinding, SessionKeyStore, SessionStore};

/// SQLite-backed implementation of every session collaborator.
///
/// Bindings older than `duration` seconds are pruned whenever a new one is
/// saved and are never returned by a lookup.
pub struct SessionDb {
    conn: Connection,
    duration: i64,
}

impl SessionDb {
    pub fn new<P: AsRef<Path>>(db_path: P, duration: i64) -> SecRestResult<Self> {
        let conn = Connection::open(db_path)?;
        let db = Self { conn, duration };
        db.create_tables()?;
        Ok(db)
    }

    pub fn new_in_memory(duration: i64) -> SecRestResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn, duration };
        db.create_tables()?;
        Ok(db)
    }

    fn create_tables(&self) -> SqlResult<()> {
        // Client side: latest session per endpoint
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS endpoint_sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                endpoint_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                public_key TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;

        // Server side: client key bound to each session id
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS session_keys (
                session_id TEXT PRIMARY KEY,
                public_key TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS credentials (
                login TEXT PRIMARY KEY,
                password_hash TEXT NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        Ok(())
    }

    /// Stable identifier for an endpoint URL
    pub fn endpoint_id(url: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn cutoff(&self) -> i64 {
        Utc::now().timestamp() - self.duration
    }

    /// Drop every binding that outlived the configured duration
    pub fn prune_expired(&self) -> SecRestResult<usize> {
        let cutoff = self.cutoff();
        let removed = self
            .conn
            .execute("DELETE FROM endpoint_sessions WHERE created_at <= ?1", params![cutoff])?
            + self
                .conn
                .execute("DELETE FROM session_keys WHERE created_at <= ?1", params![cutoff])?;
        if removed > 0 {
            debug!(removed, "pruned expired session bindings");
        }
        Ok(removed)
    }

    /// Register or replace the password hash of `login`
    pub fn set_credential(&self, login: &str, password_hash: &str) -> SecRestResult<()> {
        self.conn.execute(
            "INSERT INTO credentials (login, password_hash) VALUES (?1, ?2)
             ON CONFLICT(login) DO UPDATE SET password_hash = excluded.password_hash",
            params![login, password_hash],
        )?;
        Ok(())
    }

    pub fn delete_credential(&self, login: &str) -> SecRestResult<()> {
        self.conn
            .execute("DELETE FROM credentials WHERE login = ?1", params![login])?;
        Ok(())
    }

    /// Number of live server-side session bindings
    pub fn session_key_count(&self) -> SecRestResult<i64> {
        let mut stmt = self
            .conn
            .prepare("SELECT COUNT(*) FROM session_keys WHERE created_at > ?1")?;
        let count: i64 = stmt.query_row(params![self.cutoff()], |row| row.get(0))?;
        Ok(count)
    }
}

impl SessionStore for SessionDb {
    fn load_session(&self, url: &str) -> SecRestResult<Option<SessionBinding>> {
        let mut stmt = self.conn.prepare(
            "SELECT session_id, public_key
             FROM endpoint_sessions
             WHERE endpoint_id = ?1 AND created_at > ?2
             ORDER BY id DESC
             LIMIT 1",
        )?;

        let binding = stmt
            .query_row(params![Self::endpoint_id(url), self.cutoff()], |row| {
                Ok(SessionBinding {
                    session_id: row.get(0)?,
                    server_public_key: row.get(1)?,
                })
            })
            .optional()?;
        Ok(binding)
    }

    fn save_session(&self, url: &str, session_id: &str, server_public_key: &str) -> SecRestResult<()> {
        self.conn.execute(
            "INSERT INTO endpoint_sessions (endpoint_id, session_id, public_key, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                Self::endpoint_id(url),
                session_id,
                server_public_key,
                Utc::now().timestamp()
            ],
        )?;
        self.prune_expired()?;
        Ok(())
    }
}

impl SessionKeyStore for SessionDb {
    fn save_session_public_key(&self, session_id: &str, public_key: &str) -> SecRestResult<()> {
        self.conn.execute(
            "INSERT INTO session_keys (session_id, public_key, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(session_id) DO UPDATE
             SET public_key = excluded.public_key, created_at = excluded.created_at",
            params![session_id, public_key, Utc::now().timestamp()],
        )?;
        self.prune_expired()?;
        Ok(())
    }

    fn load_session_public_key(&self, session_id: &str) -> SecRestResult<Option<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT public_key FROM session_keys WHERE session_id = ?1 AND created_at > ?2",
        )?;
        let key = stmt
            .query_row(params![session_id, self.cutoff()], |row| row.get(0))
            .optional()?;
        Ok(key)
    }
}

impl CredentialStore for SessionDb {
    fn lookup_credential_hash(&self, login: &str) -> SecRestResult<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT password_hash FROM credentials WHERE login = ?1")?;
        let hash = stmt.query_row(params![login], |row| row.get(0)).optional()?;
        Ok(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_id_generation() {
        let id1 = SessionDb::endpoint_id("http://localhost/servicio.php");
        let id2 = SessionDb::endpoint_id("http://localhost/servicio.php");

        assert_eq!(id1, id2);
        assert_eq!(id1.len(), 64);
    }

    #[test]
    fn test_table_layout() -> SecRestResult<()> {
        let db = SessionDb::new_in_memory(300)?;
        let mut stmt = db.conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<SqlResult<Vec<_>>>()?;

        assert_eq!(names, vec!["credentials", "endpoint_sessions", "session_keys"]);
        Ok(())
    }

    #[test]
    fn test_client_sessions() -> SecRestResult<()> {
        let db = SessionDb::new_in_memory(300)?;
        assert!(db.load_session("http://svc")?.is_none());

        db.save_session("http://svc", "aaaaaaaaaaaaa", "key-1")?;
        db.save_session("http://svc", "bbbbbbbbbbbbb", "key-2")?;
        db.save_session("http://other", "ccccccccccccc", "key-3")?;

        let binding = db.load_session("http://svc")?.unwrap();
        assert_eq!(binding.session_id, "bbbbbbbbbbbbb");
        assert_eq!(binding.server_public_key, "key-2");
        Ok(())
    }

    #[test]
    fn test_session_keys_rebind() -> SecRestResult<()> {
        let db = SessionDb::new_in_memory(300)?;
        db.save_session_public_key("sid", "pem-1")?;
        db.save_session_public_key("sid", "pem-2")?;

        assert_eq!(db.load_session_public_key("sid")?, Some("pem-2".to_string()));
        assert_eq!(db.load_session_public_key("unknown")?, None);
        assert_eq!(db.session_key_count()?, 1);
        Ok(())
    }

    #[test]
    fn test_zero_duration_expires_immediately() -> SecRestResult<()> {
        let db = SessionDb::new_in_memory(0)?;
        db.save_session_public_key("sid", "pem")?;
        assert_eq!(db.load_session_public_key("sid")?, None);
        assert!(db.load_session("http://svc")?.is_none());
        Ok(())
    }

    #[test]
    fn test_credentials() -> SecRestResult<()> {
        let db = SessionDb::new_in_memory(300)?;
        db.set_credential("user", "hash-1")?;
        db.set_credential("user", "hash-2")?;
        assert_eq!(db.lookup_credential_hash("user")?, Some("hash-2".to_string()));

        db.delete_credential("user")?;
        assert_eq!(db.lookup_credential_hash("user")?, None);
        Ok(())
    }

    #[test]
    fn test_on_disk_database() -> SecRestResult<()> {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sessions.db");
        {
            let db = SessionDb::new(&path, 300)?;
            db.set_credential("user", "hash")?;
        }
        let db = SessionDb::new(&path, 300)?;
        assert_eq!(db.lookup_credential_hash("user")?, Some("hash".to_string()));
        Ok(())
    }
}
