//! Partition key generation.

use std::fmt;

use super::identity::Identity;
use super::rules::RuleConfig;

/// Separator between key segments. Rule identifiers may not contain it.
pub const KEY_DELIMITER: char = ':';

/// A key that uniquely identifies one countable bucket.
///
/// Composed of the rule identifier, then either `user:<id>` or `ip:<addr>`
/// depending on the rule's partitioning and the resolved identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey(String);

impl PartitionKey {
    /// Build the key for a rule and an identity.
    ///
    /// A rule partitioning by both prefers the user when one is known.
    pub fn build(rule: &RuleConfig, identity: &Identity) -> Self {
        let mut parts: Vec<&str> = vec![rule.identifier.as_str()];

        match identity.user_id.as_deref() {
            Some(user) if rule.partition_by.by_user() => {
                parts.push("user");
                parts.push(user);
            }
            _ if rule.partition_by.by_ip() => {
                parts.push("ip");
                parts.push(&identity.client_ip);
            }
            _ => {}
        }

        let delimiter = KEY_DELIMITER.to_string();
        Self(parts.join(delimiter.as_str()))
    }

    /// Key for callers that need an explicit bucket name.
    pub fn raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PartitionKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
