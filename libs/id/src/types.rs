//! Typed key definitions.

use crate::{impl_string_key, IdError};

/// Maximum length of a single name segment.
pub const MAX_NAME_LEN: usize = 253;

/// Validate a DNS-subdomain style name segment.
pub fn validate_name(kind: &str, s: &str) -> Result<(), IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }

    if s.len() > MAX_NAME_LEN {
        return Err(IdError::invalid(format!(
            "{kind} exceeds {MAX_NAME_LEN} characters"
        )));
    }

    let valid_char = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.';
    if let Some(bad) = s.chars().find(|c| !valid_char(*c)) {
        return Err(IdError::invalid(format!(
            "{kind} '{s}' contains invalid character {bad:?}"
        )));
    }

    let alnum = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric());
    if !alnum(s.chars().next()) || !alnum(s.chars().last()) {
        return Err(IdError::invalid(format!(
            "{kind} '{s}' must start and end with an alphanumeric character"
        )));
    }

    Ok(())
}

// =============================================================================
// Service Key
// =============================================================================

/// Owner key of a logical service: `namespace/name`.
///
/// This is the unit of allocation ownership; at most one allocation exists
/// per key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceKey {
    namespace: String,
    name: String,
}

impl ServiceKey {
    /// Creates a key from its two segments, validating both.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self, IdError> {
        let namespace = namespace.into();
        let name = name.into();
        validate_name("namespace", &namespace)?;
        validate_name("name", &name)?;
        Ok(Self { namespace, name })
    }

    /// Parses a key from `namespace/name`.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        let Some((namespace, name)) = s.split_once('/') else {
            return Err(IdError::MissingSeparator);
        };

        Self::new(namespace, name)
    }

    /// Returns the namespace segment.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns the name segment.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl_string_key!(ServiceKey);

// =============================================================================
// Tenant Key
// =============================================================================

/// Cluster/tenant identity under which a redundancy-identifier pair is held.
///
/// One pair per controller deployment. The key appears verbatim in the
/// appliance-side ledger, so it may not contain the `:` separator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TenantKey(String);

impl TenantKey {
    /// Parses and validates a tenant key.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        validate_name("tenant", s)?;
        Ok(Self(s.to_string()))
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TenantKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl_string_key!(TenantKey);

// =============================================================================
// Tests
// =============================================================================
