//! Access Control
//!
//! Credentials and the access lists applied to every node this process
//! creates. The list is resolved once, from whether credentials are
//! configured, and then passed verbatim to the coordination client.

use std::fmt;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};

/// Permission bits carried by an access control entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permissions(u32);

impl Permissions {
    pub const READ: Permissions = Permissions(1);
    pub const WRITE: Permissions = Permissions(1 << 1);
    pub const CREATE: Permissions = Permissions(1 << 2);
    pub const DELETE: Permissions = Permissions(1 << 3);
    pub const ADMIN: Permissions = Permissions(1 << 4);
    pub const ALL: Permissions = Permissions(0b11111);

    /// Raw bit value
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Check if every bit in `other` is granted
    pub fn contains(&self, other: Permissions) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Permissions {
    type Output = Permissions;

    fn bitor(self, rhs: Permissions) -> Permissions {
        Permissions(self.0 | rhs.0)
    }
}

/// An identity an entry applies to, as `scheme:id`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    pub scheme: String,
    pub id: String,
}

impl Principal {
    pub fn new(scheme: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            id: id.into(),
        }
    }

    /// Every client, authenticated or not
    pub fn anyone() -> Self {
        Self::new("world", "anyone")
    }

    /// Whichever authenticated identity creates the node
    pub fn creator() -> Self {
        Self::new("auth", "")
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme, self.id)
    }
}

/// A (principal, permissions) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessControlEntry {
    pub principal: Principal,
    pub permissions: Permissions,
}

impl AccessControlEntry {
    pub fn new(principal: Principal, permissions: Permissions) -> Self {
        Self {
            principal,
            permissions,
        }
    }
}

/// Ordered access control entries applied to created nodes
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccessList(Vec<AccessControlEntry>);

impl AccessList {
    pub fn new(entries: Vec<AccessControlEntry>) -> Self {
        Self(entries)
    }

    /// Anyone may read; only the creating identity may modify
    pub fn everyone_read_creator_all() -> Self {
        Self(vec![
            AccessControlEntry::new(Principal::anyone(), Permissions::READ),
            AccessControlEntry::new(Principal::creator(), Permissions::ALL),
        ])
    }

    /// Anyone may do anything
    pub fn open_unsafe() -> Self {
        Self(vec![AccessControlEntry::new(Principal::anyone(), Permissions::ALL)])
    }

    pub fn entries(&self) -> &[AccessControlEntry] {
        &self.0
    }

    /// Check if unauthenticated clients get full control
    pub fn is_open(&self) -> bool {
        self.0.iter().any(|entry| {
            entry.principal == Principal::anyone() && entry.permissions.contains(Permissions::ALL)
        })
    }
}

/// Digest credentials used to authenticate to the coordination service
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub secret: String,
}

impl Credentials {
    /// Create digest-scheme credentials
    pub fn digest(user: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            secret: secret.into(),
        }
    }

    /// Authentication scheme name
    pub fn scheme(&self) -> &'static str {
        "digest"
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Pick the access list for nodes this process creates.
///
/// Without credentials every node is created world-writable and a warning
/// is logged; this mirrors the long-standing deployment default.
pub fn resolve(credentials: Option<&Credentials>) -> AccessList {
    match credentials {
        Some(credentials) => {
            tracing::debug!(
                "Using {} credentials for user {}; nodes are creator-owned",
                credentials.scheme(),
                credentials.user
            );
            AccessList::everyone_read_creator_all()
        }
        None => {
            tracing::warn!("Running without coordination digest credentials. ACLs are disabled.");
            AccessList::open_unsafe()
        }
    }
}
