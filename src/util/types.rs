//! Identifiers and value types shared by every scheduler component.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identifier of a node within a dependency graph.
pub type NodeId = String;

/// Identifier of a graph stored by a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GraphId(uuid::Uuid);

impl GraphId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Underlying UUID.
    pub const fn as_uuid(&self) -> uuid::Uuid {
        self.0
    }
}

impl Default for GraphId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of constrained resource tracked by a bucket.
///
/// Serialized as a snake_case string so it can key JSON maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ResourceType {
    /// Compute quota (GPU/CPU units).
    Compute,
    /// Memory quota.
    Memory,
    /// Request budget against an upstream provider.
    RequestBudget,
    /// Time budget.
    Time,
    /// Concurrency slots.
    Concurrency,
    /// Any other caller-defined resource. Build it with
    /// [`ResourceType::custom`] so a built-in name maps to its variant.
    Custom(String),
}

impl ResourceType {
    /// Resource called `name`. Built-in names resolve to their variant.
    pub fn custom(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::builtin(&name).unwrap_or(Self::Custom(name))
    }

    /// Fold a `Custom` spelling a built-in name onto that variant.
    #[must_use]
    pub fn normalized(self) -> Self {
        match self {
            Self::Custom(name) => Self::custom(name),
            other => other,
        }
    }

    fn builtin(name: &str) -> Option<Self> {
        match name {
            "compute" => Some(Self::Compute),
            "memory" => Some(Self::Memory),
            "request_budget" => Some(Self::RequestBudget),
            "time" => Some(Self::Time),
            "concurrency" => Some(Self::Concurrency),
            _ => None,
        }
    }

    /// Stable string name for this resource.
    pub fn name(&self) -> &str {
        match self {
            Self::Compute => "compute",
            Self::Memory => "memory",
            Self::RequestBudget => "request_budget",
            Self::Time => "time",
            Self::Concurrency => "concurrency",
            Self::Custom(name) => name,
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err("resource name must not be empty".into());
        }
        Ok(Self::custom(trimmed))
    }
}

impl From<ResourceType> for String {
    fn from(value: ResourceType) -> Self {
        value.name().to_string()
    }
}

impl TryFrom<String> for ResourceType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Scheduling priority on a 0-10 scale; higher runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    /// Lowest priority.
    pub const MIN: Self = Self(0);
    /// Default priority.
    pub const NORMAL: Self = Self(5);
    /// Highest priority.
    pub const MAX: Self = Self(10);

    /// Build a priority, clamping to the 0-10 scale.
    pub const fn new(value: u8) -> Self {
        if value > Self::MAX.0 {
            Self::MAX
        } else {
            Self(value)
        }
    }

    /// Numeric value.
    pub const fn value(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl From<u8> for Priority {
    fn from(value: u8) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
