//! User records and the directory they are resolved from.
//! Persistence itself lives outside this crate; the directory trait is the
//! seam the authentication core consumes (lookup by email at login time).

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    User,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub role: UserRole,
}

impl User {
    pub fn new(name: &str, email: &str, role: UserRole) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            email: email.to_string(),
            role,
        }
    }
}

/// Directory of known users. `lookup_by_email` is the only call the
/// authentication core makes; `upsert` is used by the surrounding record
/// editing features and by startup provisioning.
pub trait UserDirectory: Send + Sync {
    fn lookup_by_email(&self, email: &str) -> Option<User>;
    fn upsert(&self, user: User) -> User;
}

/// Process-local directory backed by a map keyed on the user id.
#[derive(Default)]
pub struct InMemoryUserDirectory {
    users: RwLock<HashMap<Uuid, User>>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UserDirectory for InMemoryUserDirectory {
    fn lookup_by_email(&self, email: &str) -> Option<User> {
        self.users
            .read()
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned()
    }

    fn upsert(&self, user: User) -> User {
        let mut map = self.users.write();
        map.insert(user.id, user.clone());
        user
    }
}
