//! What caused a job to be created.

use crate::{VigilError, VigilResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Trigger type of a describe job or compliance runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// Created by the periodic create phase.
    #[default]
    Scheduled,
    /// Requested by an operator.
    Manual,
    /// Full cost discovery requested by an operator.
    CostFullDiscovery,
}

impl TriggerType {
    /// Manual work travels on the dedicated manual topics and lane.
    #[must_use]
    pub const fn is_manual(self) -> bool {
        matches!(self, Self::Manual | Self::CostFullDiscovery)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
            Self::CostFullDiscovery => "cost_full_discovery",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerType {
    type Err = VigilError;

    fn from_str(s: &str) -> VigilResult<Self> {
        match s {
            // Older compliance rows carry an empty trigger.
            "scheduled" | "" => Ok(Self::Scheduled),
            "manual" => Ok(Self::Manual),
            "cost_full_discovery" => Ok(Self::CostFullDiscovery),
            other => Err(VigilError::data_integrity(format!("unknown trigger type: {other}"))),
        }
    }
}

/// Which half of the backlog a dispatch or publish pass drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    Manual,
    Scheduled,
}

impl Lane {
    #[must_use]
    pub const fn is_manual(self) -> bool {
        matches!(self, Self::Manual)
    }

    #[must_use]
    pub const fn of(trigger: TriggerType) -> Self {
        if trigger.is_manual() {
            Self::Manual
        } else {
            Self::Scheduled
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manual => f.write_str("manual"),
            Self::Scheduled => f.write_str("scheduled"),
        }
    }
}
