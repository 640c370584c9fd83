//! Data models.

pub mod proto;

use std::fmt;
use std::net::SocketAddr;

/// The rank value used to indicate that no rank has been assigned.
pub const NIL_RANK: u32 = u32::MAX;

/// A system-wide unique identifier of a worker instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rank(pub u32);

impl Rank {
    /// Check if this rank is the nil rank.
    pub fn is_nil(&self) -> bool {
        self.0 == NIL_RANK
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            f.write_str("NilRank")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// The lifecycle state of a system member or local instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemberState {
    /// The instance has no identity record and is waiting for its storage to be formatted.
    AwaitFormat,
    /// The instance process has been spawned but is not yet responsive.
    Starting,
    /// The instance is responsive locally.
    Ready,
    /// The instance has been admitted into the system.
    Joined,
    /// The instance is preparing for a controlled shutdown.
    Stopping,
    /// The instance process is not running.
    Stopped,
    /// The instance has been excluded from the system.
    Evicted,
    /// The instance was observed in an unexpected state.
    Errored,
    /// The instance did not respond before the request deadline.
    Unresponsive,
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AwaitFormat => "AwaitFormat",
            Self::Starting => "Starting",
            Self::Ready => "Ready",
            Self::Joined => "Joined",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::Evicted => "Evicted",
            Self::Errored => "Errored",
            Self::Unresponsive => "Unresponsive",
        };
        f.write_str(name)
    }
}

/// A member of the system.
#[derive(Clone, Debug, PartialEq)]
pub struct Member {
    /// The rank of the member, immutable once assigned.
    pub rank: Rank,
    /// The UUID of the member's worker instance.
    pub uuid: String,
    /// The resolved address used to reach the member.
    pub addr: SocketAddr,
    /// The current state of the member.
    pub state: MemberState,
}

impl Member {
    /// Create a new instance.
    pub fn new(rank: Rank, uuid: impl Into<String>, addr: SocketAddr, state: MemberState) -> Self {
        Self {
            rank,
            uuid: uuid.into(),
            addr,
            state,
        }
    }
}

/// The outcome of an orchestration operation for a single rank.
#[derive(Clone, Debug, PartialEq)]
pub struct MemberResult {
    pub rank: Rank,
    /// The error encountered for the rank, if any.
    pub error: Option<String>,
    /// The state of the rank observed after the operation.
    pub state: MemberState,
}

impl MemberResult {
    /// Create a new instance.
    pub fn new(rank: Rank, error: Option<anyhow::Error>, state: MemberState) -> Self {
        Self {
            rank,
            error: error.map(|err| format!("{:#}", err)),
            state,
        }
    }

    /// Check if this result carries an error.
    pub fn errored(&self) -> bool {
        self.error.is_some()
    }
}

/// Details on the current system leader.
#[derive(Clone, Debug, PartialEq)]
pub struct LeaderInfo {
    /// The address of the current leader.
    pub current_leader: String,
    /// The addresses of all management replicas.
    pub replicas: Vec<String>,
}
