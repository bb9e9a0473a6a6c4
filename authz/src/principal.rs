//! Principals, users and the directory that resolves between them.

use async_trait::async_trait;
use indexmap::IndexMap;
use moka::future::Cache;
use parking_lot::RwLock;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use store::types::UserId;

pub const LOCAL_PROVIDER: &str = "local";
pub const GLOBAL_ADMIN_ROLE: &str = "admin";

const CACHE_SIZE: u64 = 10_000;
const CACHE_TTL_SECS: u64 = 5;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DirectoryError {
    #[error("invalid principal id {0:?}, expected <provider>://<id>")]
    InvalidPrincipal(String),
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

/// `<provider>://<id>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PrincipalId {
    provider: String,
    id: String,
}

impl PrincipalId {
    pub fn local(user_id: &str) -> Self {
        PrincipalId {
            provider: LOCAL_PROVIDER.to_string(),
            id: user_id.to_string(),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl FromStr for PrincipalId {
    type Err = DirectoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once("://") {
            Some((provider, id)) if !provider.is_empty() && !id.is_empty() => Ok(PrincipalId {
                provider: provider.to_string(),
                id: id.to_string(),
            }),
            _ => Err(DirectoryError::InvalidPrincipal(s.to_string())),
        }
    }
}

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.provider, self.id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct User {
    pub id: UserId,
    #[serde(default)]
    pub display_name: String,
    /// External principals mapped to this user, besides `local://<id>`.
    #[serde(default)]
    pub principal_ids: Vec<String>,
    #[serde(default)]
    pub global_roles: Vec<String>,
}

impl User {
    pub fn new(id: &str) -> Self {
        User {
            id: id.to_string(),
            display_name: id.to_string(),
            principal_ids: Vec::new(),
            global_roles: Vec::new(),
        }
    }

    pub fn admin(id: &str) -> Self {
        User {
            global_roles: vec![GLOBAL_ADMIN_ROLE.to_string()],
            ..User::new(id)
        }
    }

    pub fn local_principal(&self) -> PrincipalId {
        PrincipalId::local(&self.id)
    }

    pub fn has_principal(&self, principal: &PrincipalId) -> bool {
        principal == &self.local_principal()
            || self
                .principal_ids
                .iter()
                .any(|p| p.parse::<PrincipalId>().is_ok_and(|p| &p == principal))
    }
}

/// The principal performing a request.
#[derive(Clone, Debug, PartialEq)]
pub struct Actor {
    pub user: User,
}

impl Actor {
    pub fn new(user: User) -> Self {
        Actor { user }
    }

    pub fn id(&self) -> &str {
        &self.user.id
    }

    pub fn is_global_admin(&self) -> bool {
        self.user.global_roles.iter().any(|r| r == GLOBAL_ADMIN_ROLE)
    }
}

#[async_trait]
pub trait PrincipalDirectory: Send + Sync {
    async fn get_user(&self, user_id: &str) -> Result<Option<User>, DirectoryError>;

    /// Resolves a principal to the user it belongs to.
    async fn resolve(&self, principal: &PrincipalId) -> Result<Option<User>, DirectoryError>;
}

#[derive(Default)]
pub struct InMemoryDirectory {
    users: RwLock<IndexMap<UserId, User>>,
}

impl InMemoryDirectory {
    pub fn new(users: impl IntoIterator<Item = User>) -> Self {
        InMemoryDirectory {
            users: RwLock::new(users.into_iter().map(|u| (u.id.clone(), u)).collect()),
        }
    }

    pub fn add_user(&self, user: User) {
        self.users.write().insert(user.id.clone(), user);
    }

    pub fn remove_user(&self, user_id: &str) -> Option<User> {
        self.users.write().shift_remove(user_id)
    }
}

#[async_trait]
impl PrincipalDirectory for InMemoryDirectory {
    async fn get_user(&self, user_id: &str) -> Result<Option<User>, DirectoryError> {
        Ok(self.users.read().get(user_id).cloned())
    }

    async fn resolve(&self, principal: &PrincipalId) -> Result<Option<User>, DirectoryError> {
        let users = self.users.read();
        if principal.provider() == LOCAL_PROVIDER {
            return Ok(users.get(principal.id()).cloned());
        }
        Ok(users.values().find(|u| u.has_principal(principal)).cloned())
    }
}

/// Short-lived cache of successful principal resolutions. Misses always go to
/// the inner directory so newly created users are visible immediately.
pub struct CachedDirectory<D> {
    inner: D,
    cache: Cache<String, User>,
}

impl<D: PrincipalDirectory> CachedDirectory<D> {
    pub fn new(inner: D) -> Self {
        let cache = Cache::builder()
            .max_capacity(CACHE_SIZE)
            .time_to_live(Duration::from_secs(CACHE_TTL_SECS))
            .build();

        CachedDirectory { inner, cache }
    }
}

#[async_trait]
impl<D: PrincipalDirectory> PrincipalDirectory for CachedDirectory<D> {
    async fn get_user(&self, user_id: &str) -> Result<Option<User>, DirectoryError> {
        self.resolve(&PrincipalId::local(user_id)).await
    }

    async fn resolve(&self, principal: &PrincipalId) -> Result<Option<User>, DirectoryError> {
        let key = principal.to_string();
        if let Some(user) = self.cache.get(&key).await {
            return Ok(Some(user));
        }

        let user = self.inner.resolve(principal).await?;
        if let Some(user) = &user {
            self.cache.insert(key, user.clone()).await;
        }
        Ok(user)
    }
}

pub type SharedDirectory = Arc<dyn PrincipalDirectory>;
