//! Name materialization for shared-memory objects
//!
//! Both sides of an attach must derive the exact same object name from the
//! same config, so materialization lives in one place and is pure: same
//! (role, base) in, same bytes out. Names are opaque to everything else.

use crate::conf::{NamingConfig, Role};
use crate::error::{Result, TransportError};

/// Policy deciding how a base name from config becomes an object name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamePolicy {
    prefix_with_role: bool,
    separator: String,
}

impl NamePolicy {
    pub fn new(prefix_with_role: bool, separator: impl Into<String>) -> Self {
        Self {
            prefix_with_role,
            separator: separator.into(),
        }
    }

    /// Materialize an object name for (role, base)
    pub fn materialize(&self, role: Role, base: &str) -> String {
        if self.prefix_with_role {
            format!("{}{}{}", role.as_str(), self.separator, base)
        } else {
            base.to_string()
        }
    }

    /// Materialize, rejecting empty or ill-formed base names
    pub fn materialize_checked(&self, role: Role, base: &str) -> Result<String> {
        validate_base(base)?;
        Ok(self.materialize(role, base))
    }
}

impl From<&NamingConfig> for NamePolicy {
    fn from(cfg: &NamingConfig) -> Self {
        Self::new(cfg.prefix_with_role, cfg.separator.clone())
    }
}

impl Default for NamePolicy {
    fn default() -> Self {
        Self::new(false, "_")
    }
}

/// A base name must be non-empty and must survive as a single path
/// component of the backing file.
pub fn validate_base(base: &str) -> Result<()> {
    if base.is_empty() {
        return Err(TransportError::invalid_name(base));
    }
    if base.contains(['/', '\0']) {
        return Err(TransportError::invalid_name(base));
    }
    Ok(())
}
