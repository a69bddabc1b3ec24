use serde::{Deserialize, Serialize};

use crate::users::{User, UserRole};

/// Named permission granted to an authenticated principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Authority {
    User,
    Admin,
}

impl Authority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Authority::User => "user",
            Authority::Admin => "admin",
        }
    }
}

/// Authenticated identity: the underlying user record plus the authorities
/// derived from its role. Built once at login, held by the session's
/// authentication context, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPrincipal {
    user: User,
    authorities: Vec<Authority>,
}

impl UserPrincipal {
    /// Derives authorities from the user's role: every principal carries
    /// the base `user` authority, admins additionally carry `admin`.
    pub fn new(user: User) -> Self {
        let mut authorities = vec![Authority::User];
        if user.role == UserRole::Admin {
            authorities.push(Authority::Admin);
        }
        Self { user, authorities }
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn email(&self) -> &str {
        &self.user.email
    }

    pub fn authorities(&self) -> &[Authority] {
        &self.authorities
    }

    pub fn has_authority(&self, authority: Authority) -> bool {
        self.authorities.contains(&authority)
    }
}
