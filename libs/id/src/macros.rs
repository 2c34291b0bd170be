//! Macros for string-backed key types.

/// Implements the string plumbing shared by every key type.
///
/// The type must provide `parse(&str) -> Result<Self, IdError>` and a
/// `Display` implementation producing the canonical form. This generates:
/// - `FromStr` delegating to `parse`
/// - `Serialize` as the canonical string
/// - `Deserialize` through `parse`, so invalid keys are rejected at decode time
#[macro_export]
macro_rules! impl_string_key {
    ($name:ident) => {
        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}
