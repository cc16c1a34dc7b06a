use nix::unistd::{getuid, User};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("no authenticated user")]
    NotAuthenticated,
    #[error("user lookup failed: {0}")]
    Lookup(#[from] nix::Error),
}

/// The authenticated user the session acts for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
}

pub trait IdentityProvider: Send + Sync {
    fn current_identity(&self) -> Result<Identity, IdentityError>;
}

/// The OS account running the process. The display name comes from the
/// first GECOS field, falling back to the login name.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemIdentity;

impl IdentityProvider for SystemIdentity {
    fn current_identity(&self) -> Result<Identity, IdentityError> {
        let uid = getuid();
        let user = User::from_uid(uid)?.ok_or(IdentityError::NotAuthenticated)?;
        let gecos = user.gecos.to_string_lossy();
        let full_name = gecos.split(',').next().unwrap_or("").trim();

        Ok(Identity {
            display_name: if full_name.is_empty() {
                user.name.clone()
            } else {
                full_name.to_string()
            },
            user_id: user.name,
        })
    }
}

/// A fixed identity, for `--user` overrides and tests.
#[derive(Debug, Clone)]
pub struct StaticIdentity(Identity);

impl StaticIdentity {
    pub fn new(user_id: impl Into<String>, display_name: Option<String>) -> Self {
        let user_id = user_id.into();
        Self(Identity {
            display_name: display_name.unwrap_or_else(|| user_id.clone()),
            user_id,
        })
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_identity(&self) -> Result<Identity, IdentityError> {
        if self.0.user_id.is_empty() {
            return Err(IdentityError::NotAuthenticated);
        }
        Ok(self.0.clone())
    }
}
