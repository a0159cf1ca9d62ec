//! Who is signed in.
//!
//! [`AuthProvider`] is the only thing the task core asks of authentication.
//! [`LocalAccounts`] and [`SessionFile`] give the CLI a working sign-up and
//! sign-in flow on top of the same SQLite file as the task store.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{named_params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

use crate::config::AppConfig;
use crate::error::ValidationIssue;

pub const MIN_PASSWORD_CHARS: usize = 6;

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid regex"));

pub trait AuthProvider: Send + Sync {
    /// `None` means nobody is signed in and every task operation must refuse.
    fn current_user_id(&self) -> Option<String>;
}

/// Fixed identity for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticAuth {
    user_id: Option<String>,
}

impl StaticAuth {
    pub fn new(user_id: Option<&str>) -> Self {
        Self {
            user_id: user_id.map(str::to_string),
        }
    }

    pub fn signed_in(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
        }
    }
}

impl AuthProvider for StaticAuth {
    fn current_user_id(&self) -> Option<String> {
        self.user_id.clone()
    }
}

#[derive(Debug, Error)]
pub enum AccountError {
    #[error(transparent)]
    Validation(#[from] ValidationIssue),
    #[error("Email already registered")]
    EmailInUse,
    #[error("User not found")]
    UserNotFound,
    #[error("Wrong password")]
    WrongPassword,
    #[error("Account storage failed: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("Password hashing failed: {0}")]
    Hashing(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub user_id: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

/// Email and password accounts kept in the local database.
pub struct LocalAccounts {
    conn: Connection,
}

impl LocalAccounts {
    pub fn initialize(config: &AppConfig) -> Result<Self> {
        Self::open(config.db_path())
    }

    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to configure SQLite WAL mode")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS accounts (
                user_id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                created_at TEXT NOT NULL
             );",
        )
        .context("Failed to apply account migrations")?;
        Ok(Self { conn })
    }

    pub fn sign_up(
        &self,
        email: &str,
        password: &str,
        confirm: &str,
    ) -> Result<Account, AccountError> {
        let email = normalize_email(email);
        if email.is_empty() || password.is_empty() || confirm.is_empty() {
            return Err(ValidationIssue::EmptyCredentials.into());
        }
        if password != confirm {
            return Err(ValidationIssue::PasswordMismatch.into());
        }
        if !EMAIL_RE.is_match(&email) {
            return Err(ValidationIssue::InvalidEmail.into());
        }
        if password.chars().count() < MIN_PASSWORD_CHARS {
            return Err(ValidationIssue::WeakPassword {
                min: MIN_PASSWORD_CHARS,
            }
            .into());
        }
        if self.find(&email)?.is_some() {
            return Err(AccountError::EmailInUse);
        }

        let account = Account {
            user_id: Ulid::new().to_string(),
            email,
            created_at: Utc::now(),
        };
        let hash = hash_password(password)?;
        self.conn.execute(
            "INSERT INTO accounts (user_id, email, password_hash, created_at)
             VALUES (:user_id, :email, :hash, :created_at)",
            named_params![
                ":user_id": &account.user_id,
                ":email": &account.email,
                ":hash": &hash,
                ":created_at": account.created_at.to_rfc3339(),
            ],
        )?;
        tracing::debug!(user = account.user_id.as_str(), "account created");
        Ok(account)
    }

    pub fn sign_in(&self, email: &str, password: &str) -> Result<Account, AccountError> {
        let email = normalize_email(email);
        if email.is_empty() || password.is_empty() {
            return Err(ValidationIssue::EmptyCredentials.into());
        }
        if !EMAIL_RE.is_match(&email) {
            return Err(ValidationIssue::InvalidEmail.into());
        }
        let (account, hash) = self.find(&email)?.ok_or(AccountError::UserNotFound)?;
        verify_password(password, &hash)?;
        Ok(account)
    }

    fn find(&self, email: &str) -> Result<Option<(Account, String)>, AccountError> {
        let row = self
            .conn
            .query_row(
                "SELECT user_id, email, password_hash, created_at
                 FROM accounts WHERE email = :email",
                named_params![":email": email],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(|(user_id, email, hash, created_at)| {
            let created_at = DateTime::parse_from_rfc3339(&created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_default();
            (
                Account {
                    user_id,
                    email,
                    created_at,
                },
                hash,
            )
        }))
    }
}

fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Argon2id PHC string. The salt comes from a fresh ULID's 16 bytes.
fn hash_password(password: &str) -> Result<String, AccountError> {
    let salt = SaltString::encode_b64(&Ulid::new().0.to_be_bytes())
        .map_err(|e| AccountError::Hashing(e.to_string()))?;
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AccountError::Hashing(e.to_string()))
}

fn verify_password(password: &str, stored: &str) -> Result<(), AccountError> {
    let parsed = PasswordHash::new(stored).map_err(|e| AccountError::Hashing(e.to_string()))?;
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .map_err(|_| AccountError::WrongPassword)
}

/// The signed-in account, remembered between CLI invocations.
#[derive(Debug, Clone)]
pub struct SessionFile {
    path: PathBuf,
}

impl SessionFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn for_config(config: &AppConfig) -> Self {
        Self::new(config.session_path())
    }

    pub fn sign_in(&self, account: &Account) -> Result<()> {
        let payload = serde_json::to_string_pretty(account)?;
        fs::write(&self.path, payload)
            .with_context(|| format!("Failed to write session at {}", self.path.display()))
    }

    /// Returns whether a session existed.
    pub fn sign_out(&self) -> Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err)
                .with_context(|| format!("Failed to remove session at {}", self.path.display())),
        }
    }

    pub fn account(&self) -> Option<Account> {
        let raw = fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(account) => Some(account),
            Err(err) => {
                tracing::warn!(error = %err, path = %self.path.display(), "ignoring unreadable session");
                None
            }
        }
    }
}

impl AuthProvider for SessionFile {
    fn current_user_id(&self) -> Option<String> {
        self.account().map(|account| account.user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use tempfile::TempDir;

    fn accounts() -> (LocalAccounts, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = AppConfig::from_data_dir(dir.path().to_path_buf()).unwrap();
        (LocalAccounts::initialize(&config).unwrap(), dir)
    }

    #[test]
    fn sign_up_then_sign_in_with_normalized_email() {
        let (accounts, _dir) = accounts();
        let created = accounts
            .sign_up(" Ana@Example.com ", "secret1", "secret1")
            .unwrap();
        assert_eq!(created.email, "ana@example.com");

        let signed_in = accounts.sign_in("ANA@example.com", "secret1").unwrap();
        assert_eq!(signed_in.user_id, created.user_id);
    }

    #[rstest]
    #[case("", "secret1", "secret1", ValidationIssue::EmptyCredentials)]
    #[case("a@b.co", "secret1", "secret2", ValidationIssue::PasswordMismatch)]
    #[case("not-an-email", "secret1", "secret1", ValidationIssue::InvalidEmail)]
    #[case("a@b.co", "short", "short", ValidationIssue::WeakPassword { min: 6 })]
    fn sign_up_validates_form(
        #[case] email: &str,
        #[case] password: &str,
        #[case] confirm: &str,
        #[case] expected: ValidationIssue,
    ) {
        let (accounts, _dir) = accounts();
        match accounts.sign_up(email, password, confirm) {
            Err(AccountError::Validation(issue)) => assert_eq!(issue, expected),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn duplicate_and_wrong_credentials_are_reported() {
        let (accounts, _dir) = accounts();
        accounts.sign_up("a@b.co", "secret1", "secret1").unwrap();

        assert!(matches!(
            accounts.sign_up("A@B.CO", "secret1", "secret1"),
            Err(AccountError::EmailInUse)
        ));
        assert!(matches!(
            accounts.sign_in("a@b.co", "wrong!!"),
            Err(AccountError::WrongPassword)
        ));
        assert!(matches!(
            accounts.sign_in("x@b.co", "secret1"),
            Err(AccountError::UserNotFound)
        ));
    }

    #[test]
    fn passwords_are_stored_as_salted_argon2_hashes() {
        let (accounts, _dir) = accounts();
        accounts.sign_up("a@b.co", "secret1", "secret1").unwrap();
        accounts.sign_up("c@d.co", "secret1", "secret1").unwrap();

        let (_, first) = accounts.find("a@b.co").unwrap().unwrap();
        let (_, second) = accounts.find("c@d.co").unwrap().unwrap();
        assert!(first.starts_with("$argon2id$"));
        assert!(!first.contains("secret1"));
        assert_ne!(first, second);
    }

    #[test]
    fn session_file_round_trips_the_user() {
        let dir = TempDir::new().unwrap();
        let session = SessionFile::new(dir.path().join("session"));
        assert_eq!(session.current_user_id(), None);

        let account = Account {
            user_id: "01HX".into(),
            email: "a@b.co".into(),
            created_at: Utc::now(),
        };
        session.sign_in(&account).unwrap();
        assert_eq!(session.current_user_id().as_deref(), Some("01HX"));

        assert!(session.sign_out().unwrap());
        assert!(!session.sign_out().unwrap());
        assert_eq!(session.current_user_id(), None);
    }
}
