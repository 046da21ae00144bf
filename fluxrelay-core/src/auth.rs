//! Users and privileges
//!
//! The whole auth state is a single JSON blob under `auth`. Every node keeps
//! a local copy; mutations mark it dirty until `save` writes it back, and
//! refreshes from the store are skipped while it is dirty so in-flight edits
//! are not clobbered.

use crate::config::AUTH_REFRESH_INTERVAL;
use crate::influxql::ast::{Measurement, Statement};
use crate::meta::{Keyspace, SharedMetaStore};
use crate::tsdb::Series;
use crate::{RelayError, Result};
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use pbkdf2::pbkdf2_hmac;
use sha2::Sha512;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// PBKDF2 rounds for new password hashes
const HASH_ITERATIONS: u32 = 100_000;

/// Stored hashes with fewer rounds are rejected
const MIN_ITERATIONS: u32 = 10_000;

const SALT_LEN: usize = 16;

const DIGEST_LEN: usize = 64;

const HASH_SCHEME: &str = "pbkdf2-sha512";

/// Database privilege
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Privilege {
    Read,
    Write,
    All,
}

impl Privilege {
    /// Whether holding `self` grants `wanted`
    pub fn allows(self, wanted: Privilege) -> bool {
        self == wanted || self == Privilege::All
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Privilege::Read => "READ",
            Privilege::Write => "WRITE",
            Privilege::All => "ALL PRIVILEGES",
        }
    }
}

/// A privilege on one database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPrivilege {
    /// Database name
    pub name: String,
    pub privilege: Privilege,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    /// `pbkdf2-sha512$<iterations>$<salt hex>$<digest hex>`
    pub hash: String,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub privileges: Vec<UserPrivilege>,
}

/// Persisted form of the auth state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthBlob {
    #[serde(default)]
    pub users: Vec<User>,
}

fn digest(password: &str, salt: &[u8], iterations: u32) -> [u8; DIGEST_LEN] {
    let mut out = [0u8; DIGEST_LEN];
    pbkdf2_hmac::<Sha512>(password.as_bytes(), salt, iterations, &mut out);
    out
}

/// PBKDF2-HMAC-SHA512 of `password` under a random salt
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    format!(
        "{}${}${}${}",
        HASH_SCHEME,
        HASH_ITERATIONS,
        hex::encode(salt),
        hex::encode(digest(password, &salt, HASH_ITERATIONS))
    )
}

/// Check `password` against a stored hash; malformed hashes never match
pub fn verify_password(password: &str, stored: &str) -> bool {
    let mut parts = stored.split('$');
    let (Some(HASH_SCHEME), Some(iterations), Some(salt), Some(expected), None) =
        (parts.next(), parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    let (Ok(iterations), Ok(salt), Ok(expected)) =
        (iterations.parse::<u32>(), hex::decode(salt), hex::decode(expected))
    else {
        return false;
    };
    if iterations < MIN_ITERATIONS || expected.len() != DIGEST_LEN {
        return false;
    }
    let actual = digest(password, &salt, iterations);
    actual.iter().zip(&expected).fold(0u8, |acc, (a, b)| acc | (a ^ b)) == 0
}

/// Privilege a statement needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    None,
    Admin,
    Database(String, Privilege),
}

fn source_db(from: &Option<Measurement>, default: &str) -> String {
    from.as_ref()
        .and_then(|m| m.database.clone())
        .unwrap_or_else(|| default.to_string())
}

/// What `statement` requires when run against `database`
pub fn requirement(statement: &Statement, database: &str) -> Requirement {
    use Statement::*;
    let read = |db: String| Requirement::Database(db, Privilege::Read);
    let write = |db: String| Requirement::Database(db, Privilege::Write);
    match statement {
        Select(select) => {
            let db = select
                .sources
                .iter()
                .find_map(|m| m.database.clone())
                .unwrap_or_else(|| database.to_string());
            match &select.into {
                Some(_) => write(db),
                None => read(db),
            }
        }
        ShowDatabases => Requirement::None,
        ShowMeasurements { on, .. } | ShowRetentionPolicies { on } => {
            read(on.clone().unwrap_or_else(|| database.to_string()))
        }
        ShowSeries { on, from, .. }
        | ShowTagKeys { on, from }
        | ShowTagValues { on, from, .. }
        | ShowFieldKeys { on, from } => read(on.clone().unwrap_or_else(|| source_db(from, database))),
        DropSeries { from, .. } | Delete { from, .. } => write(source_db(from, database)),
        DropMeasurement { .. } => write(database.to_string()),
        ShowContinuousQueries
        | ShowUsers
        | ShowGrants { .. }
        | Diagnostic(_)
        | CreateDatabase { .. }
        | DropDatabase { .. }
        | CreateRetentionPolicy(_)
        | AlterRetentionPolicy(_)
        | DropRetentionPolicy { .. }
        | CreateContinuousQuery { .. }
        | DropContinuousQuery { .. }
        | CreateUser { .. }
        | DropUser { .. }
        | SetPassword { .. }
        | Grant { .. }
        | Revoke { .. } => Requirement::Admin,
    }
}

struct AuthState {
    blob: AuthBlob,
    dirty: bool,
}

/// Local copy of the cluster's users
pub struct AuthService {
    store: SharedMetaStore,
    keys: Keyspace,
    state: RwLock<AuthState>,
}

impl AuthService {
    pub fn new(store: SharedMetaStore, keys: Keyspace) -> Self {
        Self {
            store,
            keys,
            state: RwLock::new(AuthState {
                blob: AuthBlob::default(),
                dirty: false,
            }),
        }
    }

    async fn fetch(&self) -> Result<AuthBlob> {
        match self.store.get(&self.keys.auth()).await? {
            Some(raw) if !raw.trim().is_empty() => Ok(serde_json::from_str(&raw)?),
            _ => Ok(AuthBlob::default()),
        }
    }

    /// Replace local state with the stored blob, discarding local edits
    pub async fn load(&self) -> Result<()> {
        let blob = self.fetch().await?;
        let mut state = self.state.write();
        state.blob = blob;
        state.dirty = false;
        Ok(())
    }

    /// Reload from the store unless local edits are pending
    pub async fn refresh(&self) -> Result<bool> {
        if self.is_dirty() {
            return Ok(false);
        }
        let blob = self.fetch().await?;
        let mut state = self.state.write();
        if state.dirty {
            return Ok(false);
        }
        state.blob = blob;
        Ok(true)
    }

    pub fn is_dirty(&self) -> bool {
        self.state.read().dirty
    }

    /// Write the blob iff it changed locally
    pub async fn save(&self) -> Result<bool> {
        let raw = {
            let state = self.state.read();
            if !state.dirty {
                return Ok(false);
            }
            serde_json::to_string(&state.blob)?
        };
        self.store.put(&self.keys.auth(), &raw, None).await?;
        self.state.write().dirty = false;
        debug!("auth state saved");
        Ok(true)
    }

    fn mutate<T>(&self, name: &str, f: impl FnOnce(&mut User) -> T) -> Result<T> {
        let mut state = self.state.write();
        let user = state
            .blob
            .users
            .iter_mut()
            .find(|u| u.name == name)
            .ok_or_else(|| RelayError::NotFound(format!("user not found: {}", name)))?;
        let out = f(user);
        state.dirty = true;
        Ok(out)
    }

    pub fn user(&self, name: &str) -> Option<User> {
        self.state.read().blob.users.iter().find(|u| u.name == name).cloned()
    }

    pub fn users(&self) -> Vec<User> {
        self.state.read().blob.users.clone()
    }

    pub fn has_admin(&self) -> bool {
        self.state.read().blob.users.iter().any(|u| u.admin)
    }

    pub fn create_user(&self, name: &str, password: &str, admin: bool) -> Result<()> {
        if name.is_empty() {
            return Err(RelayError::BadRequest("username required".into()));
        }
        let hash = hash_password(password);
        let mut state = self.state.write();
        if state.blob.users.iter().any(|u| u.name == name) {
            return Err(RelayError::Conflict(format!("user already exists: {}", name)));
        }
        state.blob.users.push(User {
            name: name.to_string(),
            hash,
            admin,
            privileges: Vec::new(),
        });
        state.dirty = true;
        Ok(())
    }

    /// Change a user's password
    pub fn update_user(&self, name: &str, password: &str) -> Result<()> {
        let hash = hash_password(password);
        self.mutate(name, |u| u.hash = hash)
    }

    pub fn delete_user(&self, name: &str) -> Result<()> {
        let mut state = self.state.write();
        let idx = state
            .blob
            .users
            .iter()
            .position(|u| u.name == name)
            .ok_or_else(|| RelayError::NotFound(format!("user not found: {}", name)))?;
        state.blob.users.remove(idx);
        state.dirty = true;
        Ok(())
    }

    pub fn set_admin(&self, name: &str, admin: bool) -> Result<()> {
        self.mutate(name, |u| u.admin = admin)
    }

    /// Grant `privilege` on `database`, replacing any earlier grant there
    pub fn set_privilege(&self, name: &str, database: &str, privilege: Privilege) -> Result<()> {
        self.mutate(name, |u| {
            match u.privileges.iter_mut().find(|p| p.name == database) {
                Some(p) => p.privilege = privilege,
                None => u.privileges.push(UserPrivilege {
                    name: database.to_string(),
                    privilege,
                }),
            }
        })
    }

    /// Revoke `privilege` on `database`
    ///
    /// Revoking READ or WRITE from an ALL grant leaves the other one.
    pub fn remove_privilege(&self, name: &str, database: &str, privilege: Privilege) -> Result<()> {
        self.mutate(name, |u| {
            let Some(idx) = u.privileges.iter().position(|p| p.name == database) else {
                return;
            };
            let held = u.privileges[idx].privilege;
            match (held, privilege) {
                (Privilege::All, Privilege::Read) => u.privileges[idx].privilege = Privilege::Write,
                (Privilege::All, Privilege::Write) => u.privileges[idx].privilege = Privilege::Read,
                (held, wanted) if held == wanted || wanted == Privilege::All => {
                    u.privileges.remove(idx);
                }
                _ => {}
            }
        })
    }

    /// The user if `password` matches
    pub fn authenticate(&self, name: &str, password: &str) -> Result<User> {
        match self.user(name) {
            Some(user) if verify_password(password, &user.hash) => Ok(user),
            _ => Err(RelayError::Unauthorized("authorization failed".into())),
        }
    }

    /// Admins pass everything; others need the exact privilege or ALL on `database`
    pub fn authorize(user: &User, database: &str, privilege: Privilege) -> bool {
        user.admin
            || user
                .privileges
                .iter()
                .any(|p| p.name == database && p.privilege.allows(privilege))
    }

    /// Check `statement` for `user`
    ///
    /// Creating the first admin is allowed without credentials.
    pub fn check(&self, user: Option<&User>, statement: &Statement, database: &str) -> Result<()> {
        if let Statement::CreateUser { admin: true, .. } = statement {
            if !self.has_admin() {
                return Ok(());
            }
        }
        let required = requirement(statement, database);
        if required == Requirement::None {
            return Ok(());
        }
        let Some(user) = user else {
            return Err(RelayError::Unauthorized("no user provided".into()));
        };
        let allowed = match &required {
            Requirement::None => true,
            Requirement::Admin => user.admin,
            Requirement::Database(db, privilege) => Self::authorize(user, db, *privilege),
        };
        if allowed {
            Ok(())
        } else {
            Err(RelayError::Forbidden(format!(
                "{} not authorized to execute statement '{}'",
                user.name, statement
            )))
        }
    }

    /// Run a user or grant statement and persist the result
    pub async fn execute(&self, statement: &Statement) -> Result<Vec<Series>> {
        match statement {
            Statement::ShowUsers => {
                let mut series = Series::new("", &["user", "admin"]);
                for user in self.users() {
                    series.values.push(vec![Value::from(user.name), Value::from(user.admin)]);
                }
                return Ok(vec![series]);
            }
            Statement::ShowGrants { user } => {
                let user = self
                    .user(user)
                    .ok_or_else(|| RelayError::NotFound(format!("user not found: {}", user)))?;
                let mut series = Series::new("", &["database", "privilege"]);
                for p in user.privileges {
                    series
                        .values
                        .push(vec![Value::from(p.name), Value::from(p.privilege.as_str())]);
                }
                return Ok(vec![series]);
            }
            Statement::CreateUser { name, password, admin } => self.create_user(name, password, *admin)?,
            Statement::DropUser { name } => self.delete_user(name)?,
            Statement::SetPassword { name, password } => self.update_user(name, password)?,
            Statement::Grant { privilege, on: None, user } if *privilege == Privilege::All => {
                self.set_admin(user, true)?
            }
            Statement::Grant { privilege, on: Some(db), user } => self.set_privilege(user, db, *privilege)?,
            Statement::Revoke { privilege, on: None, user } if *privilege == Privilege::All => {
                self.set_admin(user, false)?
            }
            Statement::Revoke { privilege, on: Some(db), user } => {
                self.remove_privilege(user, db, *privilege)?
            }
            other => {
                return Err(RelayError::BadRequest(format!(
                    "not an auth statement: {}",
                    other
                )))
            }
        }
        self.save().await?;
        Ok(Vec::new())
    }

    /// Refresh on store changes and on a timer until `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let mut watch = self.store.watch(&self.keys.auth()).await?;
        let mut ticker = tokio::time::interval(AUTH_REFRESH_INTERVAL);
        info!("auth refresh loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = watch.recv() => {
                    if event.is_none() {
                        watch = self.store.watch(&self.keys.auth()).await?;
                    }
                }
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.refresh().await {
                warn!(error = %e, "auth refresh failed");
            }
        }
    }
}
