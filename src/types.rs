//! Core vocabulary types shared by every stage of the pipeline.
//!
//! These replace stringly-typed roles, risk levels and modes with enums that
//! provide exhaustive matching and fail-closed parsing.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Actor role.
///
/// The derived ordering is for display only. Authorization is always by
/// explicit set membership in `OperationSpec::allowed_roles`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Role {
    Viewer,
    Technician,
    Admin,
    Owner,
}

/// Risk classification of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    /// Always requires confirmation, whatever `requires_confirmation` says
    Destructive,
}

impl RiskLevel {
    /// Returns true if this risk level forces the confirmation gate
    #[inline]
    pub const fn forces_confirmation(self) -> bool {
        matches!(self, Self::Destructive)
    }
}

/// Whether a request really touches the target or only previews the outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum RequestMode {
    #[default]
    Execute,
    Simulate,
}

impl RequestMode {
    #[inline]
    pub const fn is_simulation(self) -> bool {
        matches!(self, Self::Simulate)
    }
}

/// An already-authenticated caller.
///
/// The engine never proves identity; it consumes the resolved pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.id, self.role)
    }
}
