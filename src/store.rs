//! Local profile and contact ledger.
//!
//! The session manager only produces and consumes [`UserProfile`] values; how
//! they are kept is up to a [`ProfileStore`]. [`SqliteStore`] is the one the
//! command-line client uses.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::P2PResult;

pub const DATABASE_FILE: &str = "p2p-rtc.db";

/// Local identity plus the exported DH key pair. Never leaves the device.
#[derive(Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub display_name: String,
    /// Private JWK of the long-lived P-256 key pair
    pub dh_key_jwk: String,
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for UserProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserProfile")
            .field("id", &self.id)
            .field("display_name", &self.display_name)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub peer_id: String,
    pub display_name: Option<String>,
    /// Last DH public key the peer sent, base64 raw point
    pub public_key: Option<String>,
    pub last_seen: DateTime<Utc>,
}

impl Contact {
    pub fn seen_now(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            display_name: None,
            public_key: None,
            last_seen: Utc::now(),
        }
    }
}

/// Persistence contract for the profile and the contact ledger
pub trait ProfileStore: Send {
    fn load_profile(&self) -> P2PResult<Option<UserProfile>>;

    fn save_profile(&self, profile: &UserProfile) -> P2PResult<()>;

    fn load_contacts(&self) -> P2PResult<Vec<Contact>>;

    /// Insert or refresh a contact. Fields left `None` keep their stored value.
    fn record_contact(&self, contact: &Contact) -> P2PResult<()>;
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> P2PResult<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        let store = Self { conn };
        store.create_tables()?;
        Ok(store)
    }

    /// Open the database inside `config_dir`.
    pub fn in_dir<P: AsRef<Path>>(config_dir: P) -> P2PResult<Self> {
        Self::new(config_dir.as_ref().join(DATABASE_FILE))
    }

    pub fn new_in_memory() -> P2PResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.create_tables()?;
        Ok(store)
    }

    fn create_tables(&self) -> rusqlite::Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS profile (
                slot INTEGER PRIMARY KEY CHECK (slot = 0),
                id TEXT NOT NULL,
                display_name TEXT NOT NULL,
                dh_key_jwk TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS contacts (
                peer_id TEXT PRIMARY KEY,
                display_name TEXT,
                public_key TEXT,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    pub fn get_contact(&self, peer_id: &str) -> P2PResult<Option<Contact>> {
        let contact = self
            .conn
            .query_row(
                "SELECT peer_id, display_name, public_key, last_seen
                 FROM contacts
                 WHERE peer_id = ?1",
                params![peer_id],
                |row| {
                    Ok(Contact {
                        peer_id: row.get(0)?,
                        display_name: row.get(1)?,
                        public_key: row.get(2)?,
                        last_seen: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(contact)
    }
}

impl ProfileStore for SqliteStore {
    fn load_profile(&self) -> P2PResult<Option<UserProfile>> {
        let profile = self
            .conn
            .query_row(
                "SELECT id, display_name, dh_key_jwk, created_at FROM profile WHERE slot = 0",
                [],
                |row| {
                    Ok(UserProfile {
                        id: row.get(0)?,
                        display_name: row.get(1)?,
                        dh_key_jwk: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(profile)
    }

    fn save_profile(&self, profile: &UserProfile) -> P2PResult<()> {
        self.conn.execute(
            "INSERT INTO profile (slot, id, display_name, dh_key_jwk, created_at)
             VALUES (0, ?1, ?2, ?3, ?4)
             ON CONFLICT(slot) DO UPDATE SET
                id = excluded.id,
                display_name = excluded.display_name,
                dh_key_jwk = excluded.dh_key_jwk,
                created_at = excluded.created_at",
            params![
                profile.id,
                profile.display_name,
                profile.dh_key_jwk,
                profile.created_at
            ],
        )?;
        Ok(())
    }

    fn load_contacts(&self) -> P2PResult<Vec<Contact>> {
        let mut stmt = self.conn.prepare(
            "SELECT peer_id, display_name, public_key, last_seen
             FROM contacts
             ORDER BY last_seen DESC",
        )?;

        let contact_iter = stmt.query_map([], |row| {
            Ok(Contact {
                peer_id: row.get(0)?,
                display_name: row.get(1)?,
                public_key: row.get(2)?,
                last_seen: row.get(3)?,
            })
        })?;

        let mut contacts = Vec::new();
        for contact in contact_iter {
            contacts.push(contact?);
        }

        Ok(contacts)
    }

    fn record_contact(&self, contact: &Contact) -> P2PResult<()> {
        self.conn.execute(
            "INSERT INTO contacts (peer_id, display_name, public_key, first_seen, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(peer_id) DO UPDATE SET
                display_name = COALESCE(excluded.display_name, contacts.display_name),
                public_key = COALESCE(excluded.public_key, contacts.public_key),
                last_seen = excluded.last_seen",
            params![
                contact.peer_id,
                contact.display_name,
                contact.public_key,
                contact.last_seen
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn profile() -> UserProfile {
        UserProfile {
            id: "0b7e4f1c".to_string(),
            display_name: "alice".to_string(),
            dh_key_jwk: r#"{"kty":"EC","crv":"P-256"}"#.to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_profile_operations() -> P2PResult<()> {
        let store = SqliteStore::new_in_memory()?;
        assert!(store.load_profile()?.is_none());

        let mut saved = profile();
        store.save_profile(&saved)?;

        saved.display_name = "alice2".to_string();
        store.save_profile(&saved)?;

        let loaded = store.load_profile()?.unwrap();
        assert_eq!(loaded.id, saved.id);
        assert_eq!(loaded.display_name, "alice2");
        assert_eq!(loaded.dh_key_jwk, saved.dh_key_jwk);
        Ok(())
    }

    #[test]
    fn test_contact_upsert_keeps_known_fields() -> P2PResult<()> {
        let store = SqliteStore::new_in_memory()?;

        let mut first = Contact::seen_now("bob");
        first.display_name = Some("Bob".to_string());
        first.public_key = Some("BASE64KEY".to_string());
        store.record_contact(&first)?;

        let mut later = Contact::seen_now("bob");
        later.last_seen = first.last_seen + Duration::seconds(5);
        store.record_contact(&later)?;

        let contact = store.get_contact("bob")?.unwrap();
        assert_eq!(contact.display_name.as_deref(), Some("Bob"));
        assert_eq!(contact.public_key.as_deref(), Some("BASE64KEY"));
        assert_eq!(contact.last_seen, later.last_seen);
        Ok(())
    }

    #[test]
    fn test_contacts_most_recent_first() -> P2PResult<()> {
        let store = SqliteStore::new_in_memory()?;
        let mut older = Contact::seen_now("carol");
        older.last_seen = older.last_seen - Duration::minutes(10);
        store.record_contact(&older)?;
        store.record_contact(&Contact::seen_now("dave"))?;

        let peers: Vec<String> = store
            .load_contacts()?
            .into_iter()
            .map(|c| c.peer_id)
            .collect();
        assert_eq!(peers, vec!["dave".to_string(), "carol".to_string()]);
        Ok(())
    }

    #[test]
    fn test_store_on_disk() -> P2PResult<()> {
        let dir = tempfile::tempdir()?;
        let nested = dir.path().join("nested");
        {
            let store = SqliteStore::in_dir(&nested)?;
            store.save_profile(&profile())?;
        }

        let reopened = SqliteStore::in_dir(&nested)?;
        assert_eq!(reopened.load_profile()?.unwrap().display_name, "alice");
        Ok(())
    }
}
