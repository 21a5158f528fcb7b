//! Durable credential storage using SQLite.
//!
//! This is the source of truth for every credential. Rows hold ciphertext
//! envelopes produced by [`super::Codec`]; this layer never sees plaintext.

use super::{ActorType, Identity};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// One encrypted credential row.
#[derive(Clone, Debug, PartialEq)]
pub struct SealedCredential {
    pub identity: Identity,
    /// Codec envelope of the access token
    pub access_token: String,
    /// Codec envelope of the refresh token, if the grant is refreshable
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub scope: BTreeSet<String>,
}

/// Encrypted credential table backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE credentials (
///     id INTEGER PRIMARY KEY,
///     provider TEXT NOT NULL,
///     workspace_id TEXT NOT NULL,
///     actor_type TEXT NOT NULL,         -- "user" | "service"
///     actor_id TEXT NOT NULL,
///     access_token TEXT NOT NULL,       -- Codec envelope
///     refresh_token TEXT,               -- Codec envelope (optional)
///     expires_at TEXT NOT NULL,         -- RFC 3339
///     scope TEXT NOT NULL,              -- space separated
///     created_at TEXT NOT NULL,
///     updated_at TEXT NOT NULL,
///     UNIQUE(provider, workspace_id, actor_type, actor_id)
/// );
/// ```
///
/// # Thread Safety
/// The connection is wrapped in a Mutex; SQLite serializes writers and a
/// busy timeout covers other processes sharing the file.
pub struct DurableStore {
    conn: Mutex<Connection>,
}

impl DurableStore {
    /// Creates or opens the store. `":memory:"` gives a private in-memory
    /// database.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open database")?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                id INTEGER PRIMARY KEY,
                provider TEXT NOT NULL,
                workspace_id TEXT NOT NULL,
                actor_type TEXT NOT NULL,
                actor_id TEXT NOT NULL,
                access_token TEXT NOT NULL,
                refresh_token TEXT,
                expires_at TEXT NOT NULL,
                scope TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(provider, workspace_id, actor_type, actor_id)
            )
            "#,
            [],
        )
        .context("Failed to create credentials table")?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_workspace ON credentials(workspace_id)",
            [],
        )
        .context("Failed to create index")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("credential database lock poisoned"))
    }

    /// Inserts or replaces the row for the credential's identity.
    pub fn upsert(&self, sealed: &SealedCredential) -> Result<()> {
        let id = &sealed.identity;
        let now = Utc::now().to_rfc3339();
        let scope = join_scope(&sealed.scope);

        self.conn()?
            .execute(
                r#"
                INSERT INTO credentials (
                    provider, workspace_id, actor_type, actor_id,
                    access_token, refresh_token,
                    expires_at, scope, created_at, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(provider, workspace_id, actor_type, actor_id) DO UPDATE SET
                    access_token = excluded.access_token,
                    refresh_token = excluded.refresh_token,
                    expires_at = excluded.expires_at,
                    scope = excluded.scope,
                    updated_at = excluded.updated_at
                "#,
                params![
                    id.provider,
                    id.workspace_id,
                    id.actor_type.as_str(),
                    id.actor_id,
                    sealed.access_token,
                    sealed.refresh_token,
                    sealed.expires_at.to_rfc3339(),
                    scope,
                    now,
                    now,
                ],
            )
            .context("Failed to store credential")?;

        Ok(())
    }

    /// Reads the row for an identity.
    pub fn fetch(&self, identity: &Identity) -> Result<Option<SealedCredential>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT access_token, refresh_token, expires_at, scope
                FROM credentials
                WHERE provider = ?1 AND workspace_id = ?2 AND actor_type = ?3 AND actor_id = ?4
                "#,
            )
            .context("Failed to prepare query")?;

        let row = stmt
            .query_row(
                params![
                    identity.provider,
                    identity.workspace_id,
                    identity.actor_type.as_str(),
                    identity.actor_id
                ],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .context("Failed to execute query")?;

        let Some((access_token, refresh_token, expires_at, scope)) = row else {
            return Ok(None);
        };

        Ok(Some(SealedCredential {
            identity: identity.clone(),
            access_token,
            refresh_token,
            expires_at: parse_timestamp(&expires_at)?,
            scope: split_scope(&scope),
        }))
    }

    /// Deletes the row for an identity. Returns whether a row existed.
    pub fn remove(&self, identity: &Identity) -> Result<bool> {
        let rows_affected = self
            .conn()?
            .execute(
                r#"
                DELETE FROM credentials
                WHERE provider = ?1 AND workspace_id = ?2 AND actor_type = ?3 AND actor_id = ?4
                "#,
                params![
                    identity.provider,
                    identity.workspace_id,
                    identity.actor_type.as_str(),
                    identity.actor_id
                ],
            )
            .context("Failed to delete credential")?;

        Ok(rows_affected > 0)
    }

    /// Identities with a stored credential in one workspace.
    pub fn list_by_workspace(&self, workspace_id: &str) -> Result<Vec<Identity>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT provider, workspace_id, actor_type, actor_id
                FROM credentials
                WHERE workspace_id = ?1
                ORDER BY provider, actor_type, actor_id
                "#,
            )
            .context("Failed to prepare query")?;

        let rows = stmt
            .query_map(params![workspace_id], identity_from_row)
            .context("Failed to execute query")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read results")?;

        rows.into_iter().collect()
    }

    /// Every stored identity, with its expiry. Used by operator tooling.
    pub fn list_all(&self) -> Result<Vec<(Identity, DateTime<Utc>)>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT provider, workspace_id, actor_type, actor_id, expires_at
                FROM credentials
                ORDER BY workspace_id, provider, actor_type, actor_id
                "#,
            )
            .context("Failed to prepare query")?;

        let rows = stmt
            .query_map([], |row| Ok((identity_from_row(row)?, row.get::<_, String>(4)?)))
            .context("Failed to execute query")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read results")?;

        rows.into_iter()
            .map(|(identity, expires_at)| Ok((identity?, parse_timestamp(&expires_at)?)))
            .collect()
    }
}

/// Reads the identity columns. The actor type is parsed after the row is
/// released so a bad value surfaces as a storage error, not a panic.
fn identity_from_row(row: &Row<'_>) -> rusqlite::Result<Result<Identity>> {
    let provider: String = row.get(0)?;
    let workspace_id: String = row.get(1)?;
    let actor_type: String = row.get(2)?;
    let actor_id: String = row.get(3)?;

    Ok(actor_type
        .parse::<ActorType>()
        .map_err(|e| anyhow!("corrupt credential row: {}", e))
        .map(|actor_type| Identity::new(provider, workspace_id, actor_type, actor_id)))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .context("Failed to parse expires_at timestamp")
}

fn join_scope(scope: &BTreeSet<String>) -> String {
    scope.iter().map(String::as_str).collect::<Vec<_>>().join(" ")
}

fn split_scope(raw: &str) -> BTreeSet<String> {
    raw.split_whitespace().map(str::to_string).collect()
}
