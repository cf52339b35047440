//! Actor context supplied by the authorization collaborator.
//!
//! The core does not decide who may call an operation — that policy stays
//! with the caller. It consumes the resolved context for exactly one
//! purpose: deciding `Forbidden` outcomes when an operation touches a club
//! outside the actor's permitted scope.

use crate::booking::ClubId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of the caller as resolved by the authorization collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActorId(pub i64);

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Roles recognized by the surrounding system.
///
/// The core interprets only the global/club distinction; everything else is
/// carried through untouched for the caller's own checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    /// Venue owner; global scope.
    Owner,
    /// Platform administrator; global scope.
    GlobalAdmin,
    /// Administrator of specific clubs.
    ClubAdmin,
    /// Head manager of specific clubs.
    HeadManager,
    /// Floor manager.
    Manager,
    /// Door staff performing seat-by-scan.
    EntryManager,
    /// Promoter booking on behalf of guests.
    Promoter,
    /// Regular guest.
    Guest,
}

impl Role {
    /// Global roles are not limited to a club list.
    #[must_use]
    pub const fn is_global(self) -> bool {
        matches!(self, Self::Owner | Self::GlobalAdmin)
    }
}

/// Authorization context attached to every mutating request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorContext {
    /// Resolved caller identity.
    pub actor_id: ActorId,
    /// Roles granted to the caller.
    pub roles: Vec<Role>,
    /// Clubs the caller may act on; ignored for global roles.
    pub permitted_club_ids: Vec<ClubId>,
}

impl ActorContext {
    /// Scope check used by club-bound operations.
    #[must_use]
    pub fn may_access_club(&self, club_id: ClubId) -> bool {
        self.roles.iter().any(|role| role.is_global())
            || self.permitted_club_ids.contains(&club_id)
    }
}
