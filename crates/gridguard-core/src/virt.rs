//! Virtualization client interface and guest selection.
//!
//! The core never speaks to a hypervisor API itself; it drives the
//! [`VirtClient`] trait. The daemon crate provides the concrete REST
//! adapter.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Kind of a managed guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuestKind {
    /// A full virtual machine.
    Vm,
    /// An OS container.
    Container,
}

impl fmt::Display for GuestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vm => write!(f, "vm"),
            Self::Container => write!(f, "ct"),
        }
    }
}

/// One guest as reported by the virtualization API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guest {
    /// Guest kind.
    pub kind: GuestKind,
    /// Numeric guest id, unique per cluster.
    pub id: u32,
    /// Guest name.
    pub name: String,
    /// Node the guest lives on.
    pub node: String,
    /// Raw status string (`running`, `stopped`, ...).
    pub status: String,
    /// Tags assigned to the guest.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Guest {
    /// True when the guest reports a running status.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}

/// Reference to a single guest: `vm:100`, `ct:web01`, `vm:backup`.
///
/// The identifier part is a numeric id when it parses as one, otherwise a
/// name to resolve against the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestRef {
    /// Guest kind.
    pub kind: GuestKind,
    /// Numeric id, when the reference used one.
    pub id: Option<u32>,
    /// Name, when the reference used one.
    pub name: Option<String>,
}

impl GuestRef {
    /// Parses a `kind:identifier` reference.
    ///
    /// # Errors
    ///
    /// Returns [`VirtError::BadGuestRef`] when the string is not of the form
    /// `vm:<id-or-name>` or `ct:<id-or-name>`.
    pub fn parse(raw: &str) -> Result<Self, VirtError> {
        let Some((kind, ident)) = raw.split_once(':') else {
            return Err(VirtError::BadGuestRef(raw.to_string()));
        };
        let kind = match kind {
            "vm" => GuestKind::Vm,
            "ct" | "lxc" => GuestKind::Container,
            _ => return Err(VirtError::BadGuestRef(raw.to_string())),
        };
        if ident.is_empty() {
            return Err(VirtError::BadGuestRef(raw.to_string()));
        }
        Ok(match ident.parse::<u32>() {
            Ok(id) => Self {
                kind,
                id: Some(id),
                name: None,
            },
            Err(_) => Self {
                kind,
                id: None,
                name: Some(ident.to_string()),
            },
        })
    }

    /// Resolves this reference against a guest catalog.
    #[must_use]
    pub fn resolve<'a>(&self, guests: &'a [Guest]) -> Option<&'a Guest> {
        guests.iter().find(|g| {
            g.kind == self.kind
                && match (&self.id, &self.name) {
                    (Some(id), _) => g.id == *id,
                    (None, Some(name)) => &g.name == name,
                    (None, None) => false,
                }
        })
    }
}

impl fmt::Display for GuestRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.id, &self.name) {
            (Some(id), _) => write!(f, "{}:{id}", self.kind),
            (None, Some(name)) => write!(f, "{}:{name}", self.kind),
            (None, None) => write!(f, "{}:?", self.kind),
        }
    }
}

/// Filter expression over the guest catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    /// Restrict to one guest kind; both kinds match when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<GuestKind>,

    /// Tags a guest must all carry.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Tags a guest must not carry.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_tags: Vec<String>,

    /// Regex the guest name must match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_regex: Option<String>,

    /// Inclusive `[min, max]` guest-id range.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_range: Option<(u32, u32)>,
}

impl Selector {
    /// Returns the guests matching this selector, preserving catalog order.
    ///
    /// # Errors
    ///
    /// Returns [`VirtError::BadSelector`] when `name_regex` does not compile.
    pub fn filter(&self, guests: &[Guest]) -> Result<Vec<Guest>, VirtError> {
        let name_re = match &self.name_regex {
            Some(pattern) => Some(
                regex::Regex::new(pattern)
                    .map_err(|e| VirtError::BadSelector(e.to_string()))?,
            ),
            None => None,
        };

        Ok(guests
            .iter()
            .filter(|g| {
                if self.kind.is_some_and(|k| k != g.kind) {
                    return false;
                }
                if !self.tags.iter().all(|t| g.tags.contains(t)) {
                    return false;
                }
                if self.exclude_tags.iter().any(|t| g.tags.contains(t)) {
                    return false;
                }
                if let Some(re) = &name_re {
                    if !re.is_match(&g.name) {
                        return false;
                    }
                }
                if let Some((min, max)) = self.id_range {
                    if g.id < min || g.id > max {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect())
    }
}

/// Errors from the virtualization client.
#[derive(Debug, thiserror::Error)]
pub enum VirtError {
    /// The API request failed at the transport level.
    #[error("virtualization API request failed: {0}")]
    Transport(String),

    /// The API answered with an error.
    #[error("virtualization API error: {0}")]
    Api(String),

    /// An async guest task ended in failure.
    #[error("guest task failed: {0}")]
    TaskFailed(String),

    /// The referenced guest does not exist.
    #[error("guest not found: {0}")]
    GuestNotFound(String),

    /// Malformed `kind:identifier` guest reference.
    #[error("invalid guest reference '{0}' (expected 'vm:<id|name>' or 'ct:<id|name>')")]
    BadGuestRef(String),

    /// Malformed selector.
    #[error("invalid guest selector: {0}")]
    BadSelector(String),

    /// The operation is not supported for this guest kind.
    #[error("{0}")]
    Unsupported(String),
}

/// Abstract guest-control capability consumed by the executors.
#[async_trait]
pub trait VirtClient: Send + Sync {
    /// Returns the API version string; used as a liveness probe.
    async fn version(&self) -> Result<String, VirtError>;

    /// Lists all guests across all nodes.
    async fn list_guests(&self) -> Result<Vec<Guest>, VirtError>;

    /// Gracefully shuts down one guest, waiting up to `timeout`.
    async fn shutdown_guest(
        &self,
        kind: GuestKind,
        id: u32,
        node: &str,
        timeout: Duration,
    ) -> Result<(), VirtError>;

    /// Hard-stops one guest.
    async fn stop_guest(&self, kind: GuestKind, id: u32, node: &str) -> Result<(), VirtError>;

    /// Starts one guest.
    async fn start_guest(&self, kind: GuestKind, id: u32, node: &str) -> Result<(), VirtError>;

    /// Runs a command inside a guest and returns its output.
    async fn exec_in_guest(
        &self,
        kind: GuestKind,
        id: u32,
        node: &str,
        command: &str,
    ) -> Result<String, VirtError>;
}
