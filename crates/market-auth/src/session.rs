//! Session data model

use std::fmt;
use std::str::FromStr;

use common::Secret;
use serde::{Deserialize, Serialize};

/// Marketplace role attached to a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Buyer,
    Seller,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Buyer => "buyer",
            Role::Seller => "seller",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "buyer" => Ok(Role::Buyer),
            "seller" => Ok(Role::Seller),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Credentials for the signed-in user.
///
/// Created by login, mutated in place when a refresh replaces the access
/// credential, destroyed on logout or refresh failure. Only the session store
/// hands these out; everything else works on clones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Short-lived bearer credential attached to every request
    pub access: Secret<String>,
    /// Long-lived credential used only against the refresh endpoint
    #[serde(default = "empty_secret")]
    pub refresh: Secret<String>,
    #[serde(default)]
    pub role: Role,
}

fn empty_secret() -> Secret<String> {
    Secret::from("")
}

impl Session {
    pub fn new(access: impl Into<String>, refresh: impl Into<String>, role: Role) -> Self {
        Self {
            access: Secret::new(access.into()),
            refresh: Secret::new(refresh.into()),
            role,
        }
    }

    pub fn access_token(&self) -> &str {
        self.access.expose()
    }

    /// The refresh credential, or `None` when the session never had one.
    pub fn refresh_token(&self) -> Option<&str> {
        if self.refresh.is_empty() {
            None
        } else {
            Some(self.refresh.expose())
        }
    }
}
