use crate::db::DbPool;
use crate::model::UserProfile;
use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

static USERNAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.-]{1,32}$").unwrap());

/// Read-only view of registered users consumed by the realtime core.
pub trait IdentityStore: Send + Sync {
    fn find_by_username(&self, username: &str) -> Result<Option<UserProfile>>;
    fn list_all(&self) -> Result<Vec<UserProfile>>;
}

/// Reasons a registration is refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("invalid_username")]
    InvalidUsername,
    #[error("user_exists")]
    UserExists,
}

pub fn is_valid_username(username: &str) -> bool {
    USERNAME_RE.is_match(username)
}

fn row_to_profile(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserProfile> {
    Ok(UserProfile {
        username: row.get(0)?,
        avatar: row.get(1)?,
        display_name: row.get(2)?,
    })
}

/// Insert a new user. Fails with [`RegisterError`] when the name is malformed
/// or already taken.
pub fn create_user(conn: &Connection, username: &str, password_hash: &str) -> Result<UserProfile> {
    if !is_valid_username(username) {
        return Err(RegisterError::InvalidUsername.into());
    }
    let res = conn.execute(
        "INSERT INTO users (username, password_hash) VALUES (?1, ?2)",
        params![username, password_hash],
    );
    match res {
        Ok(_) => get_user(conn, username)?.ok_or_else(|| anyhow!("user_missing")),
        Err(e) => {
            if matches!(
                e.sqlite_error_code(),
                Some(rusqlite::ErrorCode::ConstraintViolation)
            ) {
                Err(RegisterError::UserExists.into())
            } else {
                Err(e.into())
            }
        }
    }
}

pub fn get_user(conn: &Connection, username: &str) -> Result<Option<UserProfile>> {
    let mut stmt =
        conn.prepare("SELECT username, avatar, display_name FROM users WHERE username = ?1")?;
    let user = stmt.query_row([username], row_to_profile).optional()?;
    Ok(user)
}

/// Profile and password hash, for login.
pub fn get_credentials(conn: &Connection, username: &str) -> Result<Option<(UserProfile, String)>> {
    let mut stmt = conn.prepare(
        "SELECT username, avatar, display_name, password_hash FROM users WHERE username = ?1",
    )?;
    let found = stmt
        .query_row([username], |row| Ok((row_to_profile(row)?, row.get(3)?)))
        .optional()?;
    Ok(found)
}

pub fn list_users(conn: &Connection) -> Result<Vec<UserProfile>> {
    let mut stmt =
        conn.prepare("SELECT username, avatar, display_name FROM users ORDER BY username")?;
    let users = stmt
        .query_map([], row_to_profile)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(users)
}

/// Update the given profile fields, leaving absent ones untouched. Returns
/// `None` for an unknown user.
pub fn update_profile(
    conn: &Connection,
    username: &str,
    display_name: Option<&str>,
    avatar: Option<&str>,
) -> Result<Option<UserProfile>> {
    let changed = conn.execute(
        "UPDATE users SET display_name = COALESCE(?2, display_name), avatar = COALESCE(?3, avatar) \
         WHERE username = ?1",
        params![username, display_name, avatar],
    )?;
    if changed == 0 {
        return Ok(None);
    }
    get_user(conn, username)
}

/// SQLite-backed user directory.
#[derive(Clone)]
pub struct SqliteIdentityStore {
    pool: DbPool,
}

impl SqliteIdentityStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn create_user(&self, username: &str, password_hash: &str) -> Result<UserProfile> {
        let conn = self.pool.get()?;
        create_user(&conn, username, password_hash)
    }

    pub fn credentials(&self, username: &str) -> Result<Option<(UserProfile, String)>> {
        let conn = self.pool.get()?;
        get_credentials(&conn, username)
    }

    pub fn update_profile(
        &self,
        username: &str,
        display_name: Option<&str>,
        avatar: Option<&str>,
    ) -> Result<Option<UserProfile>> {
        let conn = self.pool.get()?;
        update_profile(&conn, username, display_name, avatar)
    }
}

impl IdentityStore for SqliteIdentityStore {
    fn find_by_username(&self, username: &str) -> Result<Option<UserProfile>> {
        let conn = self.pool.get()?;
        get_user(&conn, username)
    }

    fn list_all(&self) -> Result<Vec<UserProfile>> {
        let conn = self.pool.get()?;
        list_users(&conn)
    }
}
