//! JWT claims types

use std::collections::HashMap;

use serde::Deserialize;

/// Claim value that can be a single string or array of strings
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn contains(&self, value: &str) -> bool {
        match self {
            Self::One(s) => s == value,
            Self::Many(v) => v.iter().any(|s| s == value),
        }
    }

    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::One(s) => vec![s.clone()],
            Self::Many(v) => v.clone(),
        }
    }
}

/// Role list nested under `realm_access` or `resource_access.<client>`
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RoleClaims {
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Access token payload.
///
/// Subject and expiry are optional here so that their absence surfaces as a
/// resolution error instead of an opaque parse failure.
#[derive(Debug, Clone, Deserialize)]
pub struct JwtClaims {
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub iss: Option<String>,
    #[serde(default)]
    pub aud: Option<OneOrMany>,
    #[serde(default)]
    pub exp: Option<i64>,
    #[serde(default)]
    pub nbf: Option<i64>,
    #[serde(default)]
    pub iat: Option<i64>,
    #[serde(default)]
    pub jti: Option<String>,
    #[serde(default)]
    pub sid: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// Flat role list used by providers without realm/resource nesting
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub realm_access: Option<RoleClaims>,
    #[serde(default)]
    pub resource_access: HashMap<String, RoleClaims>,
    /// Remaining claims, including the configurable tenant claim
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl JwtClaims {
    /// Realm-level roles: `realm_access.roles` plus the flat `roles` claim
    pub fn realm_roles(&self) -> impl Iterator<Item = &str> {
        self.realm_access
            .iter()
            .flat_map(|r| r.roles.iter())
            .chain(self.roles.iter())
            .map(String::as_str)
    }

    /// Roles scoped to one client under `resource_access`
    pub fn client_roles<'a>(&'a self, client_id: &str) -> impl Iterator<Item = &'a str> {
        self.resource_access
            .get(client_id)
            .into_iter()
            .flat_map(|r| r.roles.iter())
            .map(String::as_str)
    }

    /// Read a custom string or string-array claim by name
    pub fn string_claim(&self, name: &str) -> Option<OneOrMany> {
        self.extra
            .get(name)
            .and_then(|v| serde_json::from_value::<OneOrMany>(v.clone()).ok())
    }
}
