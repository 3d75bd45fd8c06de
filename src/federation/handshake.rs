//! Follow handshake
//!
//! Relationship state machine: `requested -> approved | rejected`, with
//! unfollow removing the relationship. The transition functions are pure
//! and return the next state plus the remote notifications it implies;
//! [`FollowCoordinator`] persists the state and enqueues the notifications.

use std::sync::Arc;

use super::delivery::{DeliveryService, build_undo_object, builder, new_activity_id};
use super::queue::EnqueueReceipt;
use crate::data::{Actor, Database, Follow, FollowState};
use crate::error::AppError;

/// Remote notification implied by a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowEffect {
    /// Local source asks a remote target
    SendFollow { follow_id: String },
    /// Local target answers a remote source
    SendAccept { follow_id: String },
    SendReject { follow_id: String },
    /// Local source withdraws from a remote target
    SendUndoFollow { follow_id: String },
}

/// Next relationship state (None: no relationship) and its effects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: Option<FollowState>,
    pub effects: Vec<FollowEffect>,
}

impl Transition {
    fn to(next: FollowState) -> Self {
        Self {
            next: Some(next),
            effects: Vec::new(),
        }
    }

    fn with(mut self, effect: FollowEffect) -> Self {
        self.effects.push(effect);
        self
    }
}

/// Who is on each side of a relationship
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parties {
    pub source_local: bool,
    pub target_local: bool,
    pub target_manually_approves: bool,
}

impl Parties {
    pub fn of(source: &Actor, target: &Actor) -> Self {
        Self {
            source_local: source.is_local,
            target_local: target.is_local,
            target_manually_approves: target.manually_approves_followers,
        }
    }
}

fn require_correlation(activity_id: Option<&str>) -> Result<String, AppError> {
    activity_id
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::MissingCorrelation("follow activity id".to_string()))
}

/// A follow request, new or repeated.
///
/// A remote request must carry its Follow activity id; a local request to a
/// remote target must carry the id minted for the outgoing Follow.
pub fn request(
    existing: Option<FollowState>,
    parties: Parties,
    activity_id: Option<&str>,
) -> Result<Transition, AppError> {
    if !parties.source_local && !parties.target_local {
        return Err(AppError::Validation(
            "Follow between two remote actors".to_string(),
        ));
    }
    let correlated = if parties.source_local && parties.target_local {
        None
    } else {
        Some(require_correlation(activity_id)?)
    };

    let transition = match (existing, correlated) {
        // A remote follower that lost our Accept gets it again
        (Some(FollowState::Approved), Some(follow_id)) if !parties.source_local => {
            Transition::to(FollowState::Approved).with(FollowEffect::SendAccept { follow_id })
        }
        (Some(FollowState::Approved), _) => Transition::to(FollowState::Approved),
        (Some(FollowState::Requested), _) => Transition::to(FollowState::Requested),
        (None | Some(FollowState::Rejected), correlated) => {
            let auto_approved = parties.target_local && !parties.target_manually_approves;
            let next = if auto_approved {
                FollowState::Approved
            } else {
                FollowState::Requested
            };
            let transition = Transition::to(next);
            match correlated {
                Some(follow_id) if parties.source_local => {
                    transition.with(FollowEffect::SendFollow { follow_id })
                }
                Some(follow_id) if auto_approved => {
                    transition.with(FollowEffect::SendAccept { follow_id })
                }
                _ => transition,
            }
        }
    };

    Ok(transition)
}

/// Local target approves a pending request.
pub fn approve(
    current: FollowState,
    source_local: bool,
    activity_id: Option<&str>,
) -> Result<Transition, AppError> {
    match current {
        FollowState::Approved => Ok(Transition::to(FollowState::Approved)),
        FollowState::Rejected => Err(AppError::Validation(
            "Follow request was already rejected".to_string(),
        )),
        FollowState::Requested if source_local => Ok(Transition::to(FollowState::Approved)),
        FollowState::Requested => {
            let follow_id = require_correlation(activity_id)?;
            Ok(Transition::to(FollowState::Approved).with(FollowEffect::SendAccept { follow_id }))
        }
    }
}

/// Local target rejects a request, or removes an approved follower.
pub fn reject(
    current: FollowState,
    source_local: bool,
    activity_id: Option<&str>,
) -> Result<Transition, AppError> {
    match current {
        FollowState::Rejected => Ok(Transition::to(FollowState::Rejected)),
        _ if source_local => Ok(Transition::to(FollowState::Rejected)),
        _ => {
            let follow_id = require_correlation(activity_id)?;
            Ok(Transition::to(FollowState::Rejected).with(FollowEffect::SendReject { follow_id }))
        }
    }
}

/// Source withdraws. The relationship is always removed; a remote target is
/// told when the original Follow id is known.
pub fn unfollow(target_local: bool, activity_id: Option<&str>) -> Transition {
    let transition = Transition {
        next: None,
        effects: Vec::new(),
    };
    match activity_id {
        Some(follow_id) if !target_local && !follow_id.is_empty() => {
            transition.with(FollowEffect::SendUndoFollow {
                follow_id: follow_id.to_string(),
            })
        }
        _ => transition,
    }
}

/// Remote target answered a local request.
pub fn remote_response(accepted: bool) -> Transition {
    if accepted {
        Transition::to(FollowState::Approved)
    } else {
        Transition::to(FollowState::Rejected)
    }
}

/// Ordering key shared by every delivery about one relationship
pub fn ordering_key(source: &Actor, target: &Actor) -> String {
    format!("follow:{}:{}", source.id, target.id)
}

/// Result of a coordinator operation
#[derive(Debug, Clone)]
pub struct HandshakeOutcome {
    /// Relationship after the operation; None once removed
    pub follow: Option<Follow>,
    pub deliveries: Vec<EnqueueReceipt>,
}

impl HandshakeOutcome {
    pub fn state(&self) -> Option<FollowState> {
        self.follow.as_ref().map(Follow::follow_state)
    }
}

/// Persists transitions and enqueues their effects
pub struct FollowCoordinator {
    db: Arc<Database>,
    delivery: DeliveryService,
}

impl FollowCoordinator {
    pub fn new(db: Arc<Database>, delivery: DeliveryService) -> Self {
        Self { db, delivery }
    }

    /// Local actor follows `target`.
    pub async fn follow(&self, source: &Actor, target: &Actor) -> Result<HandshakeOutcome, AppError> {
        if !source.is_local {
            return Err(AppError::Validation(
                "Only local actors can initiate a follow".to_string(),
            ));
        }
        if source.id == target.id {
            return Err(AppError::Validation("Actors cannot follow themselves".to_string()));
        }

        let activity_id = (!target.is_local).then(|| new_activity_id(self.delivery.base_url()));
        self.request(source, target, activity_id.as_deref()).await
    }

    /// A remote actor's Follow arrived for a local target.
    pub async fn receive_remote_follow(
        &self,
        source: &Actor,
        target: &Actor,
        activity_id: &str,
    ) -> Result<HandshakeOutcome, AppError> {
        if source.is_local || !target.is_local {
            return Err(AppError::Validation(
                "Remote follow must go from a remote actor to a local one".to_string(),
            ));
        }
        self.request(source, target, Some(activity_id)).await
    }

    async fn request(
        &self,
        source: &Actor,
        target: &Actor,
        activity_id: Option<&str>,
    ) -> Result<HandshakeOutcome, AppError> {
        let existing = self.db.get_follow(&source.id, &target.id).await?;
        let transition = request(
            existing.as_ref().map(Follow::follow_state),
            Parties::of(source, target),
            activity_id,
        )?;
        let next = transition.next.unwrap_or(FollowState::Requested);

        let follow = match existing {
            Some(follow) => {
                self.db
                    .update_follow_state(&follow.id, next, activity_id)
                    .await?;
                self.db.get_follow(&source.id, &target.id).await?
            }
            None => {
                let follow = Follow::new(
                    &source.id,
                    &target.id,
                    next,
                    activity_id.map(str::to_string),
                );
                self.db.insert_follow(&follow).await?;
                self.db.get_follow(&source.id, &target.id).await?
            }
        };

        tracing::info!(
            source = %source.uri,
            target = %target.uri,
            state = next.as_str(),
            "Follow requested"
        );

        let deliveries = self.perform(&transition.effects, source, target).await?;
        Ok(HandshakeOutcome { follow, deliveries })
    }

    /// `target` (local) approves `source`'s request.
    pub async fn approve(&self, target: &Actor, source: &Actor) -> Result<HandshakeOutcome, AppError> {
        let follow = self.pending(source, target).await?;
        let transition = approve(
            follow.follow_state(),
            source.is_local,
            follow.activity_id.as_deref(),
        )?;
        self.apply(follow, transition, source, target).await
    }

    /// `target` (local) rejects `source`'s request.
    pub async fn reject(&self, target: &Actor, source: &Actor) -> Result<HandshakeOutcome, AppError> {
        let follow = self.pending(source, target).await?;
        let transition = reject(
            follow.follow_state(),
            source.is_local,
            follow.activity_id.as_deref(),
        )?;
        self.apply(follow, transition, source, target).await
    }

    /// `source` stops following `target`.
    pub async fn unfollow(&self, source: &Actor, target: &Actor) -> Result<HandshakeOutcome, AppError> {
        let follow = self
            .db
            .get_follow(&source.id, &target.id)
            .await?
            .ok_or(AppError::NotFound)?;
        if !source.is_local {
            return Err(AppError::Validation(
                "Remote unfollows arrive as Undo activities".to_string(),
            ));
        }
        let transition = unfollow(target.is_local, follow.activity_id.as_deref());
        self.apply(follow, transition, source, target).await
    }

    /// A remote target accepted or rejected a local actor's request.
    pub async fn apply_remote_response(
        &self,
        follow: Follow,
        accepted: bool,
    ) -> Result<HandshakeOutcome, AppError> {
        let transition = remote_response(accepted);
        if let Some(next) = transition.next {
            self.db.update_follow_state(&follow.id, next, None).await?;
        }
        let follow = self
            .db
            .get_follow(&follow.source_actor_id, &follow.target_actor_id)
            .await?;

        Ok(HandshakeOutcome {
            follow,
            deliveries: Vec::new(),
        })
    }

    async fn pending(&self, source: &Actor, target: &Actor) -> Result<Follow, AppError> {
        if !target.is_local {
            return Err(AppError::Forbidden);
        }
        self.db
            .get_follow(&source.id, &target.id)
            .await?
            .ok_or(AppError::NotFound)
    }

    async fn apply(
        &self,
        follow: Follow,
        transition: Transition,
        source: &Actor,
        target: &Actor,
    ) -> Result<HandshakeOutcome, AppError> {
        let follow = match transition.next {
            Some(next) => {
                self.db.update_follow_state(&follow.id, next, None).await?;
                tracing::info!(
                    source = %source.uri,
                    target = %target.uri,
                    state = next.as_str(),
                    "Follow state changed"
                );
                self.db.get_follow(&source.id, &target.id).await?
            }
            None => {
                self.db.delete_follow(&follow.id).await?;
                tracing::info!(source = %source.uri, target = %target.uri, "Follow removed");
                None
            }
        };

        let deliveries = self.perform(&transition.effects, source, target).await?;
        Ok(HandshakeOutcome { follow, deliveries })
    }

    async fn perform(
        &self,
        effects: &[FollowEffect],
        source: &Actor,
        target: &Actor,
    ) -> Result<Vec<EnqueueReceipt>, AppError> {
        let key = ordering_key(source, target);
        let base_url = self.delivery.base_url();
        let mut receipts = Vec::new();

        for effect in effects {
            // (activity, destination inbox, signing actor)
            let (activity, inbox, signer) = match effect {
                FollowEffect::SendFollow { follow_id } => (
                    builder::follow(follow_id, &source.uri, &target.uri),
                    &target.inbox_uri,
                    source,
                ),
                FollowEffect::SendAccept { follow_id } => (
                    builder::accept(&new_activity_id(base_url), &target.uri, follow_id, &source.uri),
                    &source.inbox_uri,
                    target,
                ),
                FollowEffect::SendReject { follow_id } => (
                    builder::reject(&new_activity_id(base_url), &target.uri, follow_id, &source.uri),
                    &source.inbox_uri,
                    target,
                ),
                FollowEffect::SendUndoFollow { follow_id } => {
                    let mut object = build_undo_object(follow_id, Some("Follow"), Some(&target.uri));
                    object["actor"] = serde_json::json!(source.uri);
                    (
                        builder::undo(&new_activity_id(base_url), &source.uri, object),
                        &target.inbox_uri,
                        source,
                    )
                }
            };

            let enqueued = self
                .delivery
                .enqueue_delivery(&activity, vec![inbox.clone()], &signer.id, Some(&key))
                .await?;
            receipts.extend(enqueued);
        }

        Ok(receipts)
    }
}
