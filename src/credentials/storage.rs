//! Encrypted credential storage using SQLite.
//!
//! Stores OAuth credentials (access tokens, refresh tokens) per
//! (user, project, provider). All tokens are encrypted at rest using
//! AES-256-GCM; the vault is the only component that touches ciphertext.

use super::{encryption, Credentials, EncryptedCredential, EncryptedField};
use crate::error::SyncError;
use crate::provider::Provider;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

/// Encrypted credential storage backed by SQLite.
///
/// # Schema
/// One row per (user_id, project_id, provider); the triple carries a UNIQUE
/// constraint so writes are upserts. `created_at` is set once; `updated_at`
/// is bumped on every write.
///
/// # Security
/// - Access and refresh tokens are encrypted separately with unique nonces
/// - Master key is held in memory only (from env var)
/// - SQLite ACID guarantees prevent partial updates
///
/// # Thread Safety
/// Connection is wrapped in a Mutex for safe concurrent access.
pub struct CredentialStore {
    conn: Mutex<Connection>,
    encryption_key: Vec<u8>,
}

impl CredentialStore {
    /// Creates or opens a credential store.
    ///
    /// Fails with a configuration error if the base64 master key is absent
    /// or malformed, and a persistence error if the database cannot be
    /// opened or migrated.
    pub fn new<P: AsRef<Path>>(db_path: P, encryption_key: &str) -> Result<Self, SyncError> {
        let key_bytes = encryption::validate_key(encryption_key)
            .map_err(|e| SyncError::Configuration(format!("invalid encryption key: {e}")))?;

        let conn = Connection::open(db_path)?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                id INTEGER PRIMARY KEY,
                user_id TEXT NOT NULL,
                project_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                access_token TEXT NOT NULL,
                access_token_nonce TEXT NOT NULL,
                refresh_token TEXT,
                refresh_token_nonce TEXT,
                account_id TEXT,
                account_name TEXT,
                token_uri TEXT NOT NULL,
                scopes TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(user_id, project_id, provider)
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_credentials_lookup
             ON credentials(user_id, project_id, provider)",
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            encryption_key: key_bytes,
        })
    }

    /// Stores credentials for a (user, project, provider) triple.
    ///
    /// Upsert semantics keyed on the triple: an existing row keeps its
    /// `created_at` and gets a fresh `updated_at`.
    pub fn store(
        &self,
        user_id: &str,
        project_id: &str,
        provider: Provider,
        credentials: &Credentials,
    ) -> Result<(), SyncError> {
        let (access_token_encrypted, access_token_nonce) =
            encryption::encrypt(&credentials.access_token, &self.encryption_key)?;

        let (refresh_token_encrypted, refresh_token_nonce) = match &credentials.refresh_token {
            Some(token) => {
                let (encrypted, nonce) = encryption::encrypt(token, &self.encryption_key)?;
                (Some(encrypted), Some(nonce))
            }
            None => (None, None),
        };

        let scopes_json =
            serde_json::to_string(&credentials.scopes).unwrap_or_else(|_| "[]".to_string());
        let now = Utc::now().to_rfc3339();

        self.conn.lock().unwrap().execute(
            r#"
            INSERT INTO credentials (
                user_id, project_id, provider,
                access_token, access_token_nonce,
                refresh_token, refresh_token_nonce,
                account_id, account_name, token_uri, scopes,
                created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(user_id, project_id, provider) DO UPDATE SET
                access_token = excluded.access_token,
                access_token_nonce = excluded.access_token_nonce,
                refresh_token = excluded.refresh_token,
                refresh_token_nonce = excluded.refresh_token_nonce,
                account_id = excluded.account_id,
                account_name = excluded.account_name,
                token_uri = excluded.token_uri,
                scopes = excluded.scopes,
                updated_at = excluded.updated_at
            "#,
            params![
                user_id,
                project_id,
                provider.as_str(),
                access_token_encrypted,
                access_token_nonce,
                refresh_token_encrypted,
                refresh_token_nonce,
                credentials.account_id,
                credentials.account_name,
                credentials.token_uri,
                scopes_json,
                now,
                now,
            ],
        )?;

        Ok(())
    }

    /// Retrieves the stored row with tokens still encrypted.
    ///
    /// Callers that need plaintext go through [`CredentialStore::get`];
    /// everything else (status listings, audit) works on this form.
    pub fn load(
        &self,
        user_id: &str,
        project_id: &str,
        provider: Provider,
    ) -> Result<Option<EncryptedCredential>, SyncError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                r#"
                SELECT access_token, access_token_nonce,
                       refresh_token, refresh_token_nonce,
                       account_id, account_name, token_uri, scopes,
                       created_at, updated_at
                FROM credentials
                WHERE user_id = ?1 AND project_id = ?2 AND provider = ?3
                "#,
                params![user_id, project_id, provider.as_str()],
                |row| {
                    let refresh_token: Option<String> = row.get(2)?;
                    let refresh_token_nonce: Option<String> = row.get(3)?;
                    Ok(EncryptedCredential {
                        access_token: EncryptedField {
                            ciphertext: row.get(0)?,
                            nonce: row.get(1)?,
                        },
                        refresh_token: match (refresh_token, refresh_token_nonce) {
                            (Some(ciphertext), Some(nonce)) => {
                                Some(EncryptedField { ciphertext, nonce })
                            }
                            _ => None,
                        },
                        account_id: row.get(4)?,
                        account_name: row.get(5)?,
                        token_uri: row.get(6)?,
                        scopes_json: row.get(7)?,
                        created_at: row.get(8)?,
                        updated_at: row.get(9)?,
                    })
                },
            )
            .optional()?;

        Ok(row)
    }

    /// Retrieves and decrypts credentials for a (user, project, provider).
    ///
    /// The returned plaintext exists only in memory, for immediate use by
    /// the refresh manager or a source adapter.
    pub fn get(
        &self,
        user_id: &str,
        project_id: &str,
        provider: Provider,
    ) -> Result<Option<Credentials>, SyncError> {
        let Some(row) = self.load(user_id, project_id, provider)? else {
            return Ok(None);
        };

        let access_token = encryption::decrypt(
            &row.access_token.ciphertext,
            &row.access_token.nonce,
            &self.encryption_key,
        )?;

        let refresh_token = match &row.refresh_token {
            Some(field) => Some(encryption::decrypt(
                &field.ciphertext,
                &field.nonce,
                &self.encryption_key,
            )?),
            None => None,
        };

        let scopes: Vec<String> = serde_json::from_str(&row.scopes_json).unwrap_or_default();

        Ok(Some(Credentials {
            access_token,
            refresh_token,
            account_id: row.account_id,
            account_name: row.account_name,
            token_uri: row.token_uri,
            scopes,
        }))
    }

    /// Deletes credentials for a (user, project, provider).
    ///
    /// Returns whether a row was actually removed.
    pub fn delete(
        &self,
        user_id: &str,
        project_id: &str,
        provider: Provider,
    ) -> Result<bool, SyncError> {
        let rows_affected = self.conn.lock().unwrap().execute(
            "DELETE FROM credentials WHERE user_id = ?1 AND project_id = ?2 AND provider = ?3",
            params![user_id, project_id, provider.as_str()],
        )?;

        Ok(rows_affected > 0)
    }

    /// Lists provider names with stored credentials for a user's project.
    ///
    /// Backs the connection-status endpoint.
    pub fn connected_providers(
        &self,
        user_id: &str,
        project_id: &str,
    ) -> Result<Vec<String>, SyncError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT provider FROM credentials
             WHERE user_id = ?1 AND project_id = ?2 ORDER BY provider",
        )?;

        let providers = stmt
            .query_map(params![user_id, project_id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;

        Ok(providers)
    }

    /// Lists all (user_id, project_id, provider) triples across all users.
    ///
    /// Startup reports the vault inventory from this before serving.
    pub fn list_all(&self) -> Result<Vec<(String, String, String)>, SyncError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT user_id, project_id, provider FROM credentials
             ORDER BY user_id, project_id, provider",
        )?;

        let triples = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<Result<Vec<(String, String, String)>, _>>()?;

        Ok(triples)
    }
}
