use std::fmt;
use std::str::FromStr;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// Transport protocol of an advertised service
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseTransportError(pub String);

impl fmt::Display for ParseTransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown transport protocol: {:?}", self.0)
    }
}

impl std::error::Error for ParseTransportError {}

impl FromStr for Transport {
    type Err = ParseTransportError;

    /// Accepts both the bare token ("tcp") and the DNS-SD label form ("_tcp")
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim_start_matches('_').to_ascii_lowercase().as_str() {
            "tcp" => Ok(Transport::Tcp),
            "udp" => Ok(Transport::Udp),
            _ => Err(ParseTransportError(s.to_string())),
        }
    }
}

/// Caller-supplied part of a record identity. The owner is never part of
/// this: it always comes from the authenticated session.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    /// Service type token, e.g. "_afpovertcp"
    pub service_type: String,

    /// Hostname, e.g. "nas.local."
    pub hostname: String,

    /// DNS-SD instance name, e.g. "Office NAS"
    pub instance_name: String,

    /// Service port
    pub port: u16,

    pub transport: Transport,
}

/// One discoverable service instance belonging to one owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub owner_id: String,
    #[serde(flatten)]
    pub key: RecordKey,
}

impl ServiceRecord {
    pub fn new(owner_id: impl Into<String>, key: RecordKey) -> Self {
        Self {
            owner_id: owner_id.into(),
            key,
        }
    }
}

/// A service record with its catalog display name attached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceListing {
    #[serde(flatten)]
    pub record: ServiceRecord,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamePort {
    pub instance_name: String,
    pub port: u16,
    pub transport: Transport,
}

/// A user in the owner's social graph, as supplied by the friend source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Friend {
    pub friend_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture_url: Option<String>,
}

/// Owner's friends split by access to one record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationView {
    pub authorized_friends: Vec<Friend>,
    pub denied_friends: Vec<Friend>,
}

/// A queued change notification awaiting delivery to the advertisement daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingNotification {
    /// Strictly increasing; doubles as the delivery token
    pub id: i64,

    /// Network origin of the request that caused the change
    pub origin_address: String,

    /// Serialized change notification
    pub payload: String,

    pub enqueued_at: DateTime<Utc>,

    pub delivered: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
}

/// What a change notification reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Authorize,
    Deauthorize,
    Delete,
    DeleteAll,
}

/// Decoded form of a notification payload. One is produced per affected
/// record; `digest` covers the owner's whole advertisement state after the
/// change so the daemon can skip re-publishing when nothing moved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub method: String,
    pub action: ChangeAction,
    pub owner_id: String,
    pub record: RecordKey,
    pub friend_id: Option<String>,
    pub digest: String,
}
