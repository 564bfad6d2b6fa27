//! Consensus configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Knobs accepted at replicated-log creation. Timing defaults follow the
/// usual Raft ratios: election and heartbeat timeouts well above the
/// replication tick so a healthy leader never loses its term.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Unique id of the local server. Required.
    pub local_id: String,

    /// Bootstrap a single-node cluster with the local id as the initial
    /// voter when no prior state exists.
    #[serde(default)]
    pub bootstrap: bool,

    /// How long a follower waits without leader contact before it
    /// considers the leader dead.
    #[serde(default = "default_heartbeat_timeout", with = "duration_ms")]
    pub heartbeat_timeout: Duration,

    /// Base election timeout; the actual deadline is randomized in
    /// `[election_timeout, 2 * election_timeout)`.
    #[serde(default = "default_election_timeout", with = "duration_ms")]
    pub election_timeout: Duration,

    /// A leader that cannot contact a quorum within this window steps
    /// down.
    #[serde(default = "default_leader_lease_timeout", with = "duration_ms")]
    pub leader_lease_timeout: Duration,

    /// Leader replication tick: heartbeats and commitment flow at this
    /// cadence.
    #[serde(default = "default_commit_timeout", with = "duration_ms")]
    pub commit_timeout: Duration,

    /// Take an FSM snapshot after this many applied commands. 0 disables
    /// periodic snapshots.
    #[serde(default = "default_snapshot_threshold")]
    pub snapshot_threshold: u64,

    /// Bounded wait for a submitted command to commit.
    #[serde(default = "default_apply_timeout", with = "duration_ms")]
    pub apply_timeout: Duration,
}

impl RaftConfig {
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            bootstrap: false,
            heartbeat_timeout: default_heartbeat_timeout(),
            election_timeout: default_election_timeout(),
            leader_lease_timeout: default_leader_lease_timeout(),
            commit_timeout: default_commit_timeout(),
            snapshot_threshold: default_snapshot_threshold(),
            apply_timeout: default_apply_timeout(),
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.local_id.is_empty() {
            return Err(crate::Error::Config("local_id is required".into()));
        }
        Ok(())
    }
}

fn default_heartbeat_timeout() -> Duration {
    Duration::from_millis(1000)
}

fn default_election_timeout() -> Duration {
    Duration::from_millis(1000)
}

fn default_leader_lease_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_commit_timeout() -> Duration {
    Duration::from_millis(50)
}

fn default_snapshot_threshold() -> u64 {
    8192
}

fn default_apply_timeout() -> Duration {
    Duration::from_secs(10)
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
