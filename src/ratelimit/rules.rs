//! Rate limit rules and the named presets used by call sites.
//!
//! A [`RuleConfig`] is plain data: how many admissions per window, and how
//! callers are partitioned. Presets bundle the common call-site categories and
//! take their numbers from [`PresetSettings`], which is assembled once at
//! startup (see [`crate::config`]).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::key::KEY_DELIMITER;
use crate::error::{QuotaguardError, Result};

/// Longest accepted window: one year.
pub const MAX_WINDOW_SECS: u64 = 365 * 24 * 60 * 60;

/// How callers are split into independent buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionBy {
    /// One bucket per client address.
    Ip,
    /// One bucket per authenticated user; anonymous callers share the rule's bucket.
    User,
    /// Per user when authenticated, per client address otherwise.
    UserOrIp,
}

impl PartitionBy {
    /// Whether an authenticated identity selects the bucket.
    pub fn by_user(self) -> bool {
        matches!(self, PartitionBy::User | PartitionBy::UserOrIp)
    }

    /// Whether the client address selects the bucket.
    pub fn by_ip(self) -> bool {
        matches!(self, PartitionBy::Ip | PartitionBy::UserOrIp)
    }
}

/// A single rate limit rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Unique name of the rule, first segment of every partition key
    pub identifier: String,
    /// Admissions allowed per window
    pub limit: u64,
    /// Window length in seconds
    pub window_secs: u64,
    /// Partitioning mode
    #[serde(default = "default_partition")]
    pub partition_by: PartitionBy,
}

fn default_partition() -> PartitionBy {
    PartitionBy::Ip
}

impl RuleConfig {
    /// Build and validate a rule.
    pub fn new(
        identifier: impl Into<String>,
        limit: u64,
        window_secs: u64,
        partition_by: PartitionBy,
    ) -> Result<Self> {
        let rule = Self {
            identifier: identifier.into(),
            limit,
            window_secs,
            partition_by,
        };
        rule.validate()?;
        Ok(rule)
    }

    /// Reject rules that would admit unlimited traffic or produce ambiguous keys.
    pub fn validate(&self) -> Result<()> {
        if self.identifier.is_empty() {
            return Err(QuotaguardError::Config(
                "rule identifier must not be empty".to_string(),
            ));
        }
        if self.identifier.contains(KEY_DELIMITER) {
            return Err(QuotaguardError::Config(format!(
                "rule identifier '{}' must not contain '{}'",
                self.identifier, KEY_DELIMITER
            )));
        }
        if self.limit == 0 {
            return Err(QuotaguardError::Config(format!(
                "rule '{}' has a zero limit",
                self.identifier
            )));
        }
        if self.window_secs == 0 {
            return Err(QuotaguardError::Config(format!(
                "rule '{}' has a zero window",
                self.identifier
            )));
        }
        if self.window_secs > MAX_WINDOW_SECS {
            return Err(QuotaguardError::Config(format!(
                "rule '{}' window of {}s exceeds the maximum of {}s",
                self.identifier, self.window_secs, MAX_WINDOW_SECS
            )));
        }
        Ok(())
    }

    /// The same rule counted under a call-site specific identifier.
    pub fn named(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = identifier.into();
        self
    }

    /// The same rule with a different partitioning mode.
    pub fn partitioned_by(mut self, partition_by: PartitionBy) -> Self {
        self.partition_by = partition_by;
        self
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Limit and window for one preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresetLimit {
    pub limit: u64,
    pub window_secs: u64,
}

impl PresetLimit {
    pub const fn new(limit: u64, window_secs: u64) -> Self {
        Self { limit, window_secs }
    }
}

/// Numbers for every preset. Defaults match the stock deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresetSettings {
    #[serde(default = "default_auth")]
    pub auth: PresetLimit,
    #[serde(default = "default_public_api")]
    pub public_api: PresetLimit,
    #[serde(default = "default_payment")]
    pub payment: PresetLimit,
    #[serde(default = "default_create_resource")]
    pub create_resource: PresetLimit,
    #[serde(default = "default_admin")]
    pub admin: PresetLimit,
}

impl Default for PresetSettings {
    fn default() -> Self {
        Self {
            auth: default_auth(),
            public_api: default_public_api(),
            payment: default_payment(),
            create_resource: default_create_resource(),
            admin: default_admin(),
        }
    }
}

fn default_auth() -> PresetLimit {
    PresetLimit::new(5, 60)
}

fn default_public_api() -> PresetLimit {
    PresetLimit::new(100, 60)
}

fn default_payment() -> PresetLimit {
    PresetLimit::new(10, 60)
}

fn default_create_resource() -> PresetLimit {
    PresetLimit::new(5, 300)
}

fn default_admin() -> PresetLimit {
    PresetLimit::new(50, 60)
}

impl PresetSettings {
    /// Settings for one preset.
    pub fn get(&self, preset: Preset) -> PresetLimit {
        match preset {
            Preset::Auth => self.auth,
            Preset::PublicApi => self.public_api,
            Preset::Payment => self.payment,
            Preset::CreateResource => self.create_resource,
            Preset::Admin => self.admin,
        }
    }

    /// Mutable settings for one preset.
    pub fn get_mut(&mut self, preset: Preset) -> &mut PresetLimit {
        match preset {
            Preset::Auth => &mut self.auth,
            Preset::PublicApi => &mut self.public_api,
            Preset::Payment => &mut self.payment,
            Preset::CreateResource => &mut self.create_resource,
            Preset::Admin => &mut self.admin,
        }
    }

    /// Validate every preset as a rule.
    pub fn validate(&self) -> Result<()> {
        Preset::ALL
            .iter()
            .try_for_each(|preset| preset.rule(self).validate())
    }
}

/// Common call-site categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    /// Sign-in and sign-up attempts.
    Auth,
    /// Public read endpoints.
    PublicApi,
    /// Checkout, payment verification and booking.
    Payment,
    /// Event creation.
    CreateResource,
    /// Administrative actions.
    Admin,
}

impl Preset {
    pub const ALL: [Preset; 5] = [
        Preset::Auth,
        Preset::PublicApi,
        Preset::Payment,
        Preset::CreateResource,
        Preset::Admin,
    ];

    /// Identifier used as the first key segment.
    pub fn identifier(self) -> &'static str {
        match self {
            Preset::Auth => "auth",
            Preset::PublicApi => "public-api",
            Preset::Payment => "payment",
            Preset::CreateResource => "create-event",
            Preset::Admin => "admin",
        }
    }

    /// Environment variable prefix carrying overrides for this preset.
    pub fn env_name(self) -> &'static str {
        match self {
            Preset::Auth => "rate_limit_auth",
            Preset::PublicApi => "rate_limit_public_api",
            Preset::Payment => "rate_limit_payment",
            Preset::CreateResource => "rate_limit_create_event",
            Preset::Admin => "rate_limit_admin",
        }
    }

    /// Partitioning mode for this preset.
    pub fn partition_by(self) -> PartitionBy {
        match self {
            Preset::Auth | Preset::PublicApi => PartitionBy::Ip,
            Preset::Payment | Preset::CreateResource | Preset::Admin => PartitionBy::UserOrIp,
        }
    }

    /// Build the rule for this preset from the given settings.
    pub fn rule(self, settings: &PresetSettings) -> RuleConfig {
        let numbers = settings.get(self);
        RuleConfig {
            identifier: self.identifier().to_string(),
            limit: numbers.limit,
            window_secs: numbers.window_secs,
            partition_by: self.partition_by(),
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.identifier())
    }
}

impl FromStr for Preset {
    type Err = QuotaguardError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        match normalized.as_str() {
            "auth" => Ok(Preset::Auth),
            "public-api" => Ok(Preset::PublicApi),
            "payment" => Ok(Preset::Payment),
            "create-event" | "create-resource" => Ok(Preset::CreateResource),
            "admin" => Ok(Preset::Admin),
            other => Err(QuotaguardError::Config(format!("unknown preset '{}'", other))),
        }
    }
}
