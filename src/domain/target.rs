//! Target identifiers shared across manifests, builds, and deploys

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a resource as declared in the configuration file.
///
/// A newtype rather than a bare `String` so the reducer and scheduler can't
/// accidentally compare a manifest name against an unrelated string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ManifestName(pub String);

impl ManifestName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ManifestName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ManifestName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ManifestName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The kind of artifact a `TargetID` names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Image,
    K8s,
    DockerCompose,
    Local,
    Configs,
    Manifest,
}

/// `(Type, Name)` pair identifying any buildable/deployable target.
///
/// Equality is value equality per spec.md §3, which `derive(PartialEq, Eq, Hash)`
/// gives us directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetID {
    pub kind: TargetKind,
    pub name: String,
}

impl TargetID {
    pub fn new(kind: TargetKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    pub fn image(name: impl Into<String>) -> Self {
        Self::new(TargetKind::Image, name)
    }

    pub fn k8s(name: impl Into<String>) -> Self {
        Self::new(TargetKind::K8s, name)
    }
}

impl fmt::Display for TargetID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.kind, self.name)
    }
}
