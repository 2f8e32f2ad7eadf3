//! Capabilities a stage needs from its execution environment.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A permission granted by the deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    /// Publish events to the bus.
    EventPut,
    /// Read hierarchical parameters.
    ParameterRead,
    /// Read versioned schemas.
    SchemaRead,
    /// Launch the bounded container task.
    TaskRun,
    /// Query the metadata and fastq catalogue.
    MetadataRead,
    /// Read from object storage.
    StorageRead,
    /// Write to or delete from object storage.
    StorageWrite,
}

impl Capability {
    /// Every capability, in declaration order.
    pub const ALL: [Self; 7] = [
        Self::EventPut,
        Self::ParameterRead,
        Self::SchemaRead,
        Self::TaskRun,
        Self::MetadataRead,
        Self::StorageRead,
        Self::StorageWrite,
    ];

    /// Returns the wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::EventPut => "EVENT_PUT",
            Self::ParameterRead => "PARAMETER_READ",
            Self::SchemaRead => "SCHEMA_READ",
            Self::TaskRun => "TASK_RUN",
            Self::MetadataRead => "METADATA_READ",
            Self::StorageRead => "STORAGE_READ",
            Self::StorageWrite => "STORAGE_WRITE",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ordered set of capabilities.
pub type CapabilitySet = BTreeSet<Capability>;

/// Answers whether the environment grants a capability.
pub trait CapabilityProvider: Send + Sync {
    /// Returns true if the capability is granted.
    fn grants(&self, capability: Capability) -> bool;

    /// Returns the first capability of `required` that is not granted.
    fn first_missing(&self, required: &CapabilitySet) -> Option<Capability> {
        required.iter().copied().find(|c| !self.grants(*c))
    }
}

/// A fixed set of granted capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrantedCapabilities {
    granted: CapabilitySet,
}

impl GrantedCapabilities {
    /// Grants exactly the given capabilities.
    #[must_use]
    pub fn new(granted: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            granted: granted.into_iter().collect(),
        }
    }

    /// Grants everything.
    #[must_use]
    pub fn all() -> Self {
        Self::new(Capability::ALL)
    }

    /// Removes a grant.
    #[must_use]
    pub fn without(mut self, capability: Capability) -> Self {
        self.granted.remove(&capability);
        self
    }
}

impl CapabilityProvider for GrantedCapabilities {
    fn grants(&self, capability: Capability) -> bool {
        self.granted.contains(&capability)
    }
}
