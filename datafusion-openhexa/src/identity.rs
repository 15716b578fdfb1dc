use std::fmt;
use std::sync::Arc;

/// Opaque key identifying the authenticated caller of a query
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallerIdentity(Arc<str>);

impl CallerIdentity {
    /// Identity used when the host application supplies no authenticated user
    pub const ANONYMOUS: &'static str = "default";

    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn anonymous() -> Self {
        Self::new(Self::ANONYMOUS)
    }

    /// Identity of an optional authenticated user, falling back to anonymous
    pub fn from_user(user: Option<&str>) -> Self {
        match user {
            Some(user) if !user.is_empty() => Self::new(user),
            _ => Self::anonymous(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallerIdentity {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for CallerIdentity {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}
