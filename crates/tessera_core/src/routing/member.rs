//! Cluster members known to this node.

use crate::error::{CoreError, CoreResult};
use crate::types::{wall_clock_micros, MemberId};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;

/// Liveness of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberStatus {
    /// Heartbeating normally.
    Running,
    /// Shut down cleanly.
    Stopped,
    /// Missed heartbeats.
    Unavailable,
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
            Self::Unavailable => "UNAVAILABLE",
        })
    }
}

/// A cluster participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Member id.
    pub id: MemberId,
    /// Address clients connect to.
    pub external_addr: String,
    /// Address used between members.
    pub internal_addr: String,
    /// Liveness.
    pub status: MemberStatus,
    /// Last heartbeat, microseconds since the Unix epoch.
    pub last_heartbeat: u64,
}

impl Member {
    /// Creates a running member with a fresh heartbeat.
    #[must_use]
    pub fn new(
        id: MemberId,
        external_addr: impl Into<String>,
        internal_addr: impl Into<String>,
    ) -> Self {
        Self {
            id,
            external_addr: external_addr.into(),
            internal_addr: internal_addr.into(),
            status: MemberStatus::Running,
            last_heartbeat: wall_clock_micros(),
        }
    }
}

/// Registry of known members.
#[derive(Debug, Default)]
pub struct MemberRegistry {
    members: RwLock<BTreeMap<MemberId, Member>>,
}

impl MemberRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a member.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is already registered.
    pub fn add(&self, member: Member) -> CoreResult<()> {
        let mut members = self.members.write();
        if members.contains_key(&member.id) {
            return Err(CoreError::invalid_operation(format!(
                "member already registered: {}",
                member.id
            )));
        }
        members.insert(member.id.clone(), member);
        Ok(())
    }

    /// Removes a member.
    pub fn remove(&self, id: &MemberId) -> Option<Member> {
        self.members.write().remove(id)
    }

    /// Looks a member up.
    #[must_use]
    pub fn get(&self, id: &MemberId) -> Option<Member> {
        self.members.read().get(id).cloned()
    }

    /// Returns true if the member is registered.
    #[must_use]
    pub fn contains(&self, id: &MemberId) -> bool {
        self.members.read().contains_key(id)
    }

    /// All members in id order.
    #[must_use]
    pub fn list(&self) -> Vec<Member> {
        self.members.read().values().cloned().collect()
    }

    /// Records a heartbeat and marks the member running.
    ///
    /// # Errors
    ///
    /// Returns `MemberNotFound` for unknown ids.
    pub fn heartbeat(&self, id: &MemberId) -> CoreResult<()> {
        let mut members = self.members.write();
        let member = members.get_mut(id).ok_or_else(|| CoreError::MemberNotFound {
            id: id.to_string(),
        })?;
        member.last_heartbeat = wall_clock_micros().max(member.last_heartbeat);
        member.status = MemberStatus::Running;
        Ok(())
    }

    /// Sets a member's status.
    ///
    /// # Errors
    ///
    /// Returns `MemberNotFound` for unknown ids.
    pub fn set_status(&self, id: &MemberId, status: MemberStatus) -> CoreResult<()> {
        let mut members = self.members.write();
        let member = members.get_mut(id).ok_or_else(|| CoreError::MemberNotFound {
            id: id.to_string(),
        })?;
        member.status = status;
        Ok(())
    }

    /// Marks running members whose last heartbeat is older than `cutoff`
    /// unavailable and returns them.
    pub fn mark_unavailable(&self, cutoff: u64) -> Vec<MemberId> {
        let mut members = self.members.write();
        members
            .values_mut()
            .filter(|m| m.status == MemberStatus::Running && m.last_heartbeat < cutoff)
            .map(|m| {
                m.status = MemberStatus::Unavailable;
                m.id.clone()
            })
            .collect()
    }

    /// Resolves an administrative member argument.
    ///
    /// A 4-character input is a prefix that must match exactly one member.
    /// Anything else must be a well-formed full id.
    ///
    /// # Errors
    ///
    /// Returns `MemberNotFound` or `AmbiguousMemberPrefix` for prefixes and
    /// `InvalidMemberId` for malformed full ids.
    pub fn resolve_member_id(&self, input: &str) -> CoreResult<MemberId> {
        if input.len() != MemberId::PREFIX_LEN {
            return MemberId::parse(input);
        }

        let members = self.members.read();
        let mut matches = members.keys().filter(|id| id.as_str().starts_with(input));
        match (matches.next(), matches.next()) {
            (Some(id), None) => Ok(id.clone()),
            (None, _) => Err(CoreError::MemberNotFound {
                id: input.to_string(),
            }),
            (Some(_), Some(_)) => Err(CoreError::AmbiguousMemberPrefix {
                prefix: input.to_string(),
                matches: 2 + matches.count(),
            }),
        }
    }
}
