//! Session store (C7): a persistent, TTL-expiring credential/session
//! layer backing the admin API, plus the `UserStore` this crate adds
//! (see SPEC_FULL.md's "SUPPLEMENTED FEATURES") since sessions can't be
//! created or reconciled at load time without a user database. Persists
//! via `sled` (new dependency; the closest embedded transactional
//! keyed-store analogue to the bbolt bucket model this component is
//! grounded on) in a single tree named `"sessions-2"`, mirroring
//! `heimdall::cache::DnsCache`'s single-mutex-guarded-map shape for the
//! in-memory index.

use crate::error::SessionError;
use crate::metrics::GatewayMetrics;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::TryRngCore;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: Uuid,
    pub login: String,
    pub password_verifier: String,
}

/// In-memory user database. Both indices (by id, by login) always agree.
#[derive(Default)]
pub struct UserStore {
    by_id: DashMap<Uuid, User>,
    by_login: DashMap<String, Uuid>,
}

impl UserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, login: &str, password_verifier: &str) -> Result<User, SessionError> {
        if self.by_login.contains_key(login) {
            return Err(SessionError::DuplicateLogin(login.to_string()));
        }
        let user = User {
            id: Uuid::now_v7(),
            login: login.to_string(),
            password_verifier: password_verifier.to_string(),
        };
        self.by_login.insert(login.to_string(), user.id);
        self.by_id.insert(user.id, user.clone());
        Ok(user)
    }

    pub fn find_by_id(&self, id: Uuid) -> Option<User> {
        self.by_id.get(&id).map(|u| u.clone())
    }

    pub fn find_by_login(&self, login: &str) -> Option<User> {
        let id = *self.by_login.get(login)?;
        self.by_id.get(&id).map(|u| u.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub token: [u8; 16],
    pub user_id: Uuid,
    pub user_login: String,
    pub expire: u64,
}

const BUCKET_NAME: &str = "sessions-2";

pub struct SessionStore {
    tree: sled::Tree,
    index: DashMap<[u8; 16], Session>,
    users: Arc<UserStore>,
    ttl: Duration,
    lock: Mutex<()>,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl SessionStore {
    /// Opens (or creates) the `"sessions-2"` bucket and loads it,
    /// dropping entries that are malformed, expired, or whose referenced
    /// user can no longer be found. Commits iff any entries were
    /// dropped; otherwise the load is a pure read.
    pub fn open(db: &sled::Db, users: Arc<UserStore>, ttl: Duration) -> Result<Self, SessionError> {
        let tree = db.open_tree(BUCKET_NAME).map_err(|e| match e {
            sled::Error::Io(io) if io.kind() == std::io::ErrorKind::InvalidInput => {
                tracing::error!("session store path is incompatible with the embedded store");
                SessionError::Storage(sled::Error::Io(io))
            }
            other => SessionError::Storage(other),
        })?;

        let index = DashMap::new();
        let mut to_remove: Vec<sled::IVec> = Vec::new();
        let now = now_secs();

        for entry in tree.iter() {
            let (key, value) = entry.map_err(SessionError::Storage)?;
            let Ok(token): Result<[u8; 16], _> = key.as_ref().try_into() else {
                to_remove.push(key);
                continue;
            };
            match decode_session(&value) {
                Some((expire, login)) if expire >= now => match users.find_by_login(&login) {
                    Some(user) => {
                        index.insert(
                            token,
                            Session {
                                token,
                                user_id: user.id,
                                user_login: login,
                                expire,
                            },
                        );
                    }
                    None => to_remove.push(key),
                },
                _ => to_remove.push(key),
            }
        }

        if !to_remove.is_empty() {
            for key in &to_remove {
                tree.remove(key).map_err(SessionError::Storage)?;
            }
            tree.flush().map_err(SessionError::Storage)?;
        }

        Ok(Self {
            tree,
            index,
            users,
            ttl,
            lock: Mutex::new(()),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn report_active_sessions(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.set_active_sessions(self.index.len());
        }
    }

    pub fn new_session(&self, user: &User) -> Result<Session, SessionError> {
        let _guard = self.lock.lock();

        let mut token = [0u8; 16];
        rand::rngs::OsRng
            .try_fill_bytes(&mut token)
            .map_err(|e| SessionError::Random(e.to_string()))?;
        let expire = now_secs() + self.ttl.as_secs();

        let record = encode_session(expire, &user.login);
        self.tree
            .insert(&token, record)
            .map_err(SessionError::Storage)?;
        self.tree.flush().map_err(SessionError::Storage)?;

        let session = Session {
            token,
            user_id: user.id,
            user_login: user.login.clone(),
            expire,
        };
        self.index.insert(token, session.clone());
        self.report_active_sessions();
        Ok(session)
    }

    pub fn find_by_token(&self, token: [u8; 16]) -> Option<Session> {
        let _guard = self.lock.lock();
        let session = self.index.get(&token)?.clone();
        if session.expire < now_secs() {
            self.index.remove(&token);
            let _ = self.tree.remove(token);
            self.report_active_sessions();
            return None;
        }
        Some(session)
    }

    pub fn delete_by_token(&self, token: [u8; 16]) -> Result<(), SessionError> {
        let _guard = self.lock.lock();
        self.tree.remove(token).map_err(SessionError::Storage)?;
        self.index.remove(&token);
        self.report_active_sessions();
        Ok(())
    }

    pub fn close(&self) -> Result<(), SessionError> {
        self.tree.flush().map_err(SessionError::Storage)?;
        Ok(())
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn encode_session(expire: u64, login: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(6 + login.len());
    buf.extend_from_slice(&(expire as u32).to_be_bytes());
    buf.extend_from_slice(&(login.len() as u16).to_be_bytes());
    buf.extend_from_slice(login.as_bytes());
    buf
}

fn decode_session(bytes: &[u8]) -> Option<(u64, String)> {
    if bytes.len() < 6 {
        return None;
    }
    let expire = u32::from_be_bytes(bytes[0..4].try_into().ok()?) as u64;
    let len = u16::from_be_bytes(bytes[4..6].try_into().ok()?) as usize;
    let login = String::from_utf8(bytes.get(6..6 + len)?.to_vec()).ok()?;
    Some((expire, login))
}
