//! Bounty escrow record and its authorization-gated merge.
//!
//! ```text
//!   locked ──→ unlocked ──→ claimed
//!     │           │
//!     └─────┬─────┘
//!           ▼
//!        revoked
//! ```
//!
//! `claimed` and `revoked` are absorbing. Authorization is always checked
//! against the LOCAL record's owner/sender/receiver, never the incoming
//! record's, so an update cannot authorize itself by rewriting those fields.
//! A record naming neither owner nor sender cannot be revoked, removed or
//! replaced by anyone.
//!
//! | transition       | who may assert it          |
//! |------------------|----------------------------|
//! | locked → unlocked| owner, sender, receiver    |
//! | * → revoked      | owner, sender              |
//! | * → claimed      | anyone                     |
//! | bounty removed   | owner, sender              |

use serde::{Deserialize, Serialize};
use taskrelay_protocol::{BountyEnvelope, BountyScheme, Identity};
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::field::Field;
use crate::scope::Keyring;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BountyState {
    Locked,
    Unlocked,
    Revoked,
    Claimed,
}

impl BountyState {
    pub fn is_terminal(self) -> bool {
        matches!(self, BountyState::Revoked | BountyState::Claimed)
    }
}

/// Ecash escrow attached to a task.
///
/// Outside the terminal states exactly one of `token` and `enc` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bounty {
    pub id: String,
    pub state: BountyState,

    /// Task creator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    /// Funder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,

    /// Intended claimant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mint: Option<String>,

    /// Amount in sats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<u64>,

    /// Spending condition advertised by the token (e.g. a P2PK key).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<String>,

    /// Opaque ecash token, when visible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enc: Option<BountyEnvelope>,

    /// Unix seconds of the last content change.
    #[serde(default)]
    pub updated_at: u64,
}

impl Bounty {
    /// Lock a token end to end for `receiver`.
    pub fn lock_for_recipient(
        sender: &Identity,
        receiver: &str,
        token: &str,
        updated_at: u64,
    ) -> Result<Self> {
        let enc = BountyEnvelope::seal_for_recipient(sender, receiver, token)?;
        let mut bounty = Self::locked(sender.public_key(), enc, updated_at);
        bounty.receiver = Some(receiver.to_string());
        Ok(bounty)
    }

    /// Hide a token under the funder's own root secret.
    pub fn lock_for_funder(
        sender: &Identity,
        keyring: &Keyring,
        token: &str,
        updated_at: u64,
    ) -> Result<Self> {
        let enc = BountyEnvelope::seal_for_funder(keyring.root_secret(), token)?;
        Ok(Self::locked(sender.public_key(), enc, updated_at))
    }

    fn locked(funder: &str, enc: BountyEnvelope, updated_at: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            state: BountyState::Locked,
            owner: Some(funder.to_string()),
            sender: Some(funder.to_string()),
            receiver: None,
            mint: None,
            amount: None,
            lock: None,
            token: None,
            enc: Some(enc),
            updated_at,
        }
    }

    /// Publish the plaintext token and drop the envelope.
    pub fn unlocked(mut self, token: impl Into<String>, updated_at: u64) -> Self {
        self.state = BountyState::Unlocked;
        self.token = Some(token.into());
        self.enc = None;
        self.updated_at = updated_at;
        self
    }

    pub fn is_well_formed(&self) -> bool {
        self.state.is_terminal() || (self.token.is_some() != self.enc.is_some())
    }

    /// Decrypt the token using only the scheme the envelope advertises.
    ///
    /// Returns the plaintext token if already visible, `None` if the record
    /// carries neither form.
    pub fn reveal(&self, identity: &Identity, keyring: &Keyring) -> Result<Option<String>> {
        if let Some(token) = &self.token {
            return Ok(Some(token.clone()));
        }
        let Some(enc) = &self.enc else {
            return Ok(None);
        };
        let opened = match enc.scheme {
            BountyScheme::Funder => enc.open_as_funder(keyring.root_secret()),
            BountyScheme::Recipient => {
                let peer = if self.receiver.as_deref() == Some(identity.public_key()) {
                    self.sender.as_deref()
                } else {
                    self.receiver.as_deref()
                };
                let peer = peer.ok_or_else(|| {
                    SyncError::Decryption("recipient envelope without a peer key".into())
                })?;
                enc.open_with_peer(identity, peer)
            }
        };
        opened
            .map(Some)
            .map_err(|e| SyncError::Decryption(e.to_string()))
    }

    /// Owner or sender.
    fn can_revoke(&self, actor: &str) -> bool {
        self.owner.as_deref() == Some(actor) || self.sender.as_deref() == Some(actor)
    }

    fn is_participant(&self, actor: &str) -> bool {
        self.can_revoke(actor) || self.receiver.as_deref() == Some(actor)
    }
}

/// Whether `actor` may move `local` into state `to`.
pub fn transition_allowed(local: &Bounty, to: BountyState, actor: &str) -> bool {
    let from = local.state;
    if from == to {
        return true;
    }
    if from.is_terminal() {
        return false;
    }
    match to {
        BountyState::Claimed => true,
        BountyState::Revoked => local.can_revoke(actor),
        BountyState::Unlocked => from == BountyState::Locked && local.is_participant(actor),
        BountyState::Locked => false,
    }
}

/// Who asserted the incoming bounty, and when.
#[derive(Debug, Clone, Copy)]
pub struct BountyContext<'a> {
    /// Public key that signed the enclosing event.
    pub actor: &'a str,
    /// `created_at` of the enclosing event.
    pub event_at: u64,
    /// Entity clock before this event. Below `event_at` for an admitted
    /// event, above it for a late one.
    pub local_seen_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BountyMerge {
    pub bounty: Option<Bounty>,
    /// An unauthorized change was dropped.
    pub denied: bool,
}

impl BountyMerge {
    fn keep(local: Option<&Bounty>) -> Self {
        Self {
            bounty: local.cloned(),
            denied: false,
        }
    }

    fn deny(local: Option<&Bounty>) -> Self {
        Self {
            bounty: local.cloned(),
            denied: true,
        }
    }
}

/// Order by `updated_at`, then by event time. An admitted event wins ties;
/// a late event never does.
fn is_newer(local: &Bounty, incoming: &Bounty, ctx: &BountyContext<'_>) -> bool {
    match incoming.updated_at.cmp(&local.updated_at) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => ctx.event_at >= ctx.local_seen_at,
    }
}

/// Fold an incoming bounty field into the local record.
pub fn merge_bounty(
    local: Option<&Bounty>,
    incoming: Field<Bounty>,
    ctx: &BountyContext<'_>,
) -> BountyMerge {
    let incoming = match incoming {
        Field::Absent => return BountyMerge::keep(local),
        Field::Clear => {
            return match local {
                Some(current) if !current.can_revoke(ctx.actor) => {
                    debug!("Bounty {} removal by {} denied", current.id, ctx.actor);
                    BountyMerge::deny(local)
                }
                _ => BountyMerge {
                    bounty: None,
                    denied: false,
                },
            };
        }
        Field::Set(incoming) => incoming,
    };

    if !incoming.is_well_formed() {
        debug!("Ignoring malformed bounty {}", incoming.id);
        return BountyMerge::keep(local);
    }

    let Some(current) = local else {
        return BountyMerge {
            bounty: Some(incoming),
            denied: false,
        };
    };

    if current.id != incoming.id {
        if !is_newer(current, &incoming, ctx) {
            return BountyMerge::keep(local);
        }
        // Replacing a live bounty retires it, so it needs revoke rights.
        if !current.state.is_terminal() && !current.can_revoke(ctx.actor) {
            debug!(
                "Bounty {} replacement by {} denied",
                current.id, ctx.actor
            );
            return BountyMerge::deny(local);
        }
        return BountyMerge {
            bounty: Some(incoming),
            denied: false,
        };
    }

    if !transition_allowed(current, incoming.state, ctx.actor) {
        debug!(
            "Bounty {} transition {:?} -> {:?} by {} denied",
            current.id, current.state, incoming.state, ctx.actor
        );
        return BountyMerge::deny(local);
    }

    // Owner and sender are fixed by the first record seen for this id.
    let mut merged = current.clone();
    merged.state = incoming.state;

    if is_newer(current, &incoming, ctx) && current.is_participant(ctx.actor) {
        merged.token = incoming.token;
        merged.enc = incoming.enc;
        merged.mint = incoming.mint;
        merged.amount = incoming.amount;
        merged.lock = incoming.lock;
        merged.receiver = incoming.receiver;
        merged.updated_at = incoming.updated_at;
    }

    BountyMerge {
        bounty: Some(merged),
        denied: false,
    }
}

/// Fold the bounty carried by an event that lost task-level admission.
///
/// A later edit by someone who may not move the bounty can carry an
/// already-authorized state change and win the task clock first; the
/// authorized event then arrives late. Only a strictly newer record for the
/// bounty already held is considered, so a late event can neither resurrect
/// a removed bounty nor roll one back. Returns `None` when nothing changes.
pub fn merge_late_bounty(
    local: Option<&Bounty>,
    incoming: Field<Bounty>,
    ctx: &BountyContext<'_>,
) -> Option<BountyMerge> {
    let (Some(current), Field::Set(incoming)) = (local, incoming) else {
        return None;
    };
    if !is_newer(current, &incoming, ctx) {
        return None;
    }
    let merged = merge_bounty(local, Field::Set(incoming), ctx);
    (merged.denied || merged.bounty.as_ref() != local).then_some(merged)
}
