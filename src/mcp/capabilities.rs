//! Capability set negotiated with the upstream peer

use std::collections::BTreeSet;

use serde_json::Value;

/// Capability categories that drive request forwarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Prompts,
    Resources,
    Tools,
    Logging,
}

impl Capability {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Prompts => "prompts",
            Self::Resources => "resources",
            Self::Tools => "tools",
            Self::Logging => "logging",
        }
    }
}

/// Immutable set of capability names declared by the upstream peer in its
/// `initialize` result. A capability is present when its key maps to a
/// non-null value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    names: BTreeSet<String>,
}

impl CapabilitySet {
    pub fn from_value(capabilities: &Value) -> Self {
        let names = capabilities
            .as_object()
            .map(|object| {
                object
                    .iter()
                    .filter(|(_, value)| !value.is_null())
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default();
        Self { names }
    }

    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            names: names.into_iter().map(str::to_string).collect(),
        }
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.names.contains(capability.as_str())
    }

    pub fn has(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
