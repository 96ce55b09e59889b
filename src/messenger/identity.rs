use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::utils::error::IdentityError;

/// Stable name of this process, stamped on every outgoing envelope so the
/// process can recognise (and skip) its own publications.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(Arc<str>);

impl Identity {
    pub fn new(name: impl Into<String>) -> Result<Self, IdentityError> {
        let name = name.into();
        if !is_valid(&name) {
            return Err(IdentityError::Invalid(name));
        }
        Ok(Self(name.into()))
    }

    /// A throwaway identity, handy for tools and tests.
    pub fn random() -> Self {
        Self(format!("node-{}", Uuid::new_v4().simple()).into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_valid(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.len() < 2 || bytes[0] == b'-' || bytes[bytes.len() - 1] == b'-' {
        return false;
    }
    if name.contains("--") {
        return false;
    }
    bytes
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
