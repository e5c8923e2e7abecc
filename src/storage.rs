use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::model::User;

/// Local SQLite state: the signed-in account and its backend tokens.
#[derive(Debug, Clone)]
pub struct StateStore {
    conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Clone)]
pub struct Account {
    pub uid: String,
    pub email: String,
    pub display_name: Option<String>,
    pub photo_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(user: &User, email: impl Into<String>) -> Self {
        let epoch = Utc.timestamp_opt(0, 0).single().unwrap_or_else(Utc::now);
        Self {
            uid: user.uid.clone(),
            email: email.into(),
            display_name: user.display_name.clone(),
            photo_url: user.photo_url.clone(),
            created_at: epoch,
            updated_at: epoch,
        }
    }

    pub fn user(&self) -> User {
        User {
            uid: self.uid.clone(),
            display_name: self.display_name.clone(),
            photo_url: self.photo_url.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Token {
    pub uid: String,
    pub id_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Token {
    pub fn is_expired(&self, now: DateTime<Utc>, skew: chrono::Duration) -> bool {
        self.expires_at - skew <= now
    }
}

#[derive(Debug, Default, Clone)]
pub struct Options {
    pub path: Option<PathBuf>,
}

impl StateStore {
    pub fn open(opts: Options) -> Result<Self> {
        let path = match opts.path {
            Some(path) => path,
            None => default_path().context("storage: resolve default path")?,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("storage: create directory {}", parent.display()))?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("storage: open database at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("storage: set WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("storage: enable foreign keys")?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .context("storage: set busy timeout")?;
        migrate(&conn)?;
        tracing::debug!(path = %path.display(), "opened state database");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn close(self) -> Result<()> {
        let conn = Arc::try_unwrap(self.conn)
            .map_err(|_| anyhow!("storage: connection still in use"))?
            .into_inner();
        conn.close()
            .map_err(|(_, err)| err)
            .context("storage: close connection")
    }

    pub fn upsert_account(&self, mut account: Account) -> Result<()> {
        if account.uid.is_empty() {
            bail!("storage: uid required");
        }
        let now = Utc::now();
        if account.created_at.timestamp() == 0 {
            account.created_at = now;
        }
        account.updated_at = now;

        let conn = self.conn.lock();
        conn.execute(
            r#"
INSERT INTO accounts (uid, email, display_name, photo_url, created_at, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
ON CONFLICT(uid) DO UPDATE SET
  email = excluded.email,
  display_name = excluded.display_name,
  photo_url = excluded.photo_url,
  updated_at = excluded.updated_at
"#,
            params![
                account.uid,
                account.email,
                account.display_name,
                account.photo_url,
                account.created_at.timestamp(),
                account.updated_at.timestamp(),
            ],
        )?;
        Ok(())
    }

    pub fn get_account(&self, uid: &str) -> Result<Option<Account>> {
        let conn = self.conn.lock();
        conn.query_row(
            r#"
SELECT uid, email, display_name, photo_url, created_at, updated_at
FROM accounts
WHERE uid = ?1
"#,
            params![uid],
            account_from_row,
        )
        .optional()
        .context("storage: query account")
    }

    /// Most recently updated account that still holds a token.
    pub fn active_account(&self) -> Result<Option<Account>> {
        let conn = self.conn.lock();
        conn.query_row(
            r#"
SELECT a.uid, a.email, a.display_name, a.photo_url, a.created_at, a.updated_at
FROM accounts a
JOIN tokens t ON t.uid = a.uid
ORDER BY a.updated_at DESC
LIMIT 1
"#,
            [],
            account_from_row,
        )
        .optional()
        .context("storage: query active account")
    }

    pub fn upsert_token(&self, token: Token) -> Result<()> {
        if token.uid.is_empty() {
            bail!("storage: uid required for token");
        }
        let conn = self.conn.lock();
        conn.execute(
            r#"
INSERT INTO tokens (uid, id_token, refresh_token, expires_at)
VALUES (?1, ?2, ?3, ?4)
ON CONFLICT(uid) DO UPDATE SET
  id_token = excluded.id_token,
  refresh_token = excluded.refresh_token,
  expires_at = excluded.expires_at
"#,
            params![
                token.uid,
                token.id_token,
                token.refresh_token,
                token.expires_at.timestamp(),
            ],
        )?;
        Ok(())
    }

    pub fn get_token(&self, uid: &str) -> Result<Option<Token>> {
        let conn = self.conn.lock();
        conn.query_row(
            r#"
SELECT uid, id_token, refresh_token, expires_at
FROM tokens
WHERE uid = ?1
"#,
            params![uid],
            |row| {
                let expires: i64 = row.get(3)?;
                Ok(Token {
                    uid: row.get(0)?,
                    id_token: row.get(1)?,
                    refresh_token: row.get(2)?,
                    expires_at: timestamp(expires),
                })
            },
        )
        .optional()
        .context("storage: query token")
    }

    pub fn delete_token(&self, uid: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let removed = conn
            .execute("DELETE FROM tokens WHERE uid = ?1", params![uid])
            .context("storage: delete token")?;
        Ok(removed > 0)
    }
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    let created: i64 = row.get(4)?;
    let updated: i64 = row.get(5)?;
    Ok(Account {
        uid: row.get(0)?,
        email: row.get(1)?,
        display_name: row.get(2)?,
        photo_url: row.get(3)?,
        created_at: timestamp(created),
        updated_at: timestamp(updated),
    })
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at INTEGER NOT NULL
)
"#,
        [],
    )?;

    let current: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    for (idx, sql) in MIGRATIONS.iter().enumerate() {
        let version = (idx + 1) as i64;
        if version <= current {
            continue;
        }
        conn.execute_batch(sql)
            .with_context(|| format!("storage: apply migration {version}"))?;
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![version, Utc::now().timestamp()],
        )?;
    }
    Ok(())
}

const MIGRATIONS: &[&str] = &[r#"
CREATE TABLE IF NOT EXISTS accounts (
  uid TEXT PRIMARY KEY,
  email TEXT NOT NULL,
  display_name TEXT,
  photo_url TEXT,
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS tokens (
  uid TEXT PRIMARY KEY,
  id_token TEXT NOT NULL,
  refresh_token TEXT NOT NULL,
  expires_at INTEGER NOT NULL,
  FOREIGN KEY(uid) REFERENCES accounts(uid) ON DELETE CASCADE
);
"#];

pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("socialfeed").join("state.db"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open(dir: &tempfile::TempDir) -> StateStore {
        StateStore::open(Options {
            path: Some(dir.path().join("state.db")),
        })
        .unwrap()
    }

    fn linus() -> User {
        User {
            uid: "u-linus".into(),
            display_name: Some("Linus".into()),
            photo_url: Some("https://cdn.test/linus.png".into()),
        }
    }

    #[test]
    fn creates_database_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("state.db");
        let store = StateStore::open(Options {
            path: Some(path.clone()),
        })
        .unwrap();
        assert!(path.exists());
        store.close().unwrap();
    }

    #[test]
    fn account_and_token_survive_reopen() {
        let dir = tempdir().unwrap();
        let expires = Utc::now() + chrono::Duration::hours(1);
        {
            let store = open(&dir);
            store
                .upsert_account(Account::new(&linus(), "linus@example.com"))
                .unwrap();
            store
                .upsert_token(Token {
                    uid: "u-linus".into(),
                    id_token: "id-1".into(),
                    refresh_token: "refresh-1".into(),
                    expires_at: expires,
                })
                .unwrap();
            store.close().unwrap();
        }

        let store = open(&dir);
        let account = store.active_account().unwrap().unwrap();
        assert_eq!(account.user(), linus());
        assert_eq!(account.email, "linus@example.com");
        let token = store.get_token("u-linus").unwrap().unwrap();
        assert_eq!(token.refresh_token, "refresh-1");
        assert_eq!(token.expires_at.timestamp(), expires.timestamp());
        assert!(!token.is_expired(Utc::now(), chrono::Duration::seconds(60)));
    }

    #[test]
    fn deleting_token_clears_active_account() {
        let dir = tempdir().unwrap();
        let store = open(&dir);
        store
            .upsert_account(Account::new(&linus(), "linus@example.com"))
            .unwrap();
        store
            .upsert_token(Token {
                uid: "u-linus".into(),
                id_token: "id".into(),
                refresh_token: "refresh".into(),
                expires_at: Utc::now(),
            })
            .unwrap();
        assert!(store.delete_token("u-linus").unwrap());
        assert!(!store.delete_token("u-linus").unwrap());
        assert!(store.active_account().unwrap().is_none());
        assert!(store.get_account("u-linus").unwrap().is_some());
    }

    #[test]
    fn token_requires_known_account() {
        let dir = tempdir().unwrap();
        let store = open(&dir);
        let err = store.upsert_token(Token {
            uid: "ghost".into(),
            id_token: "id".into(),
            refresh_token: "refresh".into(),
            expires_at: Utc::now(),
        });
        assert!(err.is_err());
    }
}
