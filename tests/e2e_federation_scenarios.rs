//! E2E tests for federation scenarios
//!
//! These tests drive the inbound dispatcher, the activity processor and
//! the delivery engine through the durable queue, with the network
//! replaced by a fake actor fetcher and a recording transport:
//! - Follow handshake with remote and local parties
//! - Replay and signature checks on inbound activities
//! - Delivery retry, give-up and operator retry
//! - Inline queue mode

mod common;

use chrono::{Duration, Utc};
use common::{
    LOCAL_BASE, LOCAL_PUBLIC_KEY, REMOTE_PUBLIC_KEY, ROTATED_PRIVATE_KEY, ROTATED_PUBLIC_KEY,
    RemotePeer, TestContext, signed_headers,
};
use fediport::config::QueueDriver;
use fediport::data::{Actor, EntityId, FollowState, InteractionKind, RemoteActorProfile, Status};
use fediport::federation::delivery::{CORRELATION_HEADER, builder};
use fediport::federation::signature::{CapturedHeaders, SignedRequest};
use fediport::federation::{
    EnqueueReceipt, InboundEnvelope, InboxReceipt, JobState, ProcessingResult, generate_digest,
    verify_signature,
};
use serde_json::{Value, json};

const HOUR_MS: i64 = 3_600_000;

async fn envelope_of(ctx: &TestContext, receipt: &InboxReceipt) -> InboundEnvelope {
    let InboxReceipt::Accepted { job_id } = receipt else {
        panic!("expected queued activity, got {:?}", receipt);
    };
    let job = ctx.db().get_job(*job_id).await.unwrap().unwrap();
    serde_json::from_str(&job.payload).unwrap()
}

fn follow_activity(peer: &RemotePeer, id: &str, target: &str) -> Value {
    json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": id,
        "type": "Follow",
        "actor": peer.uri,
        "object": target
    })
}

fn note_activity(peer: &RemotePeer, n: u32, to: Vec<&str>) -> Value {
    let note = builder::note(
        &format!("{}/statuses/{}", peer.uri, n),
        &peer.uri,
        "<p>hello <script>alert(1)</script>world</p>",
        "2024-05-01T12:00:00Z",
        None,
        to.clone(),
        vec![],
    );
    builder::create(
        &format!("{}/statuses/{}/activity", peer.uri, n),
        &peer.uri,
        note,
        to,
        vec![],
    )
}

// =============================================================================
// Follow handshake
// =============================================================================

/// A remote Follow for an auto-approving actor yields exactly one Accept,
/// even when the same delivery arrives twice.
#[tokio::test]
async fn remote_follow_is_accepted_exactly_once() {
    let ctx = TestContext::new().await;
    let bob = ctx.peer("remote.example", "bob");
    let follow = follow_activity(&bob, "https://remote.example/follows/abc", &ctx.alice.uri);

    ctx.deliver_signed(&bob, "/actors/alice/inbox", &follow).await;
    ctx.deliver_signed(&bob, "/actors/alice/inbox", &follow).await;
    ctx.settle().await;

    let bob_actor = ctx.db().get_actor_by_uri(&bob.uri).await.unwrap().unwrap();
    let relation = ctx
        .db()
        .get_follow(&bob_actor.id, &ctx.alice.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(relation.follow_state(), FollowState::Approved);
    assert_eq!(
        relation.activity_id.as_deref(),
        Some("https://remote.example/follows/abc")
    );

    let accepts = ctx.transport.activities_of_type("Accept");
    assert_eq!(accepts.len(), 1);
    assert_eq!(accepts[0]["actor"], ctx.alice.uri);
    assert_eq!(accepts[0]["object"]["id"], "https://remote.example/follows/abc");
    assert!(
        accepts[0]["id"]
            .as_str()
            .unwrap()
            .starts_with(&format!("{}/activities/", LOCAL_BASE))
    );

    let requests = ctx.transport.requests();
    assert_eq!(requests[0].inbox, bob.inbox);
}

/// Outbound requests carry a signature the receiver can verify with the
/// local actor's published key.
#[tokio::test]
async fn outbound_accept_is_signed_by_local_actor() {
    let ctx = TestContext::new().await;
    let bob = ctx.peer("remote.example", "bob");
    let follow = follow_activity(&bob, "https://remote.example/follows/1", &ctx.alice.uri);

    ctx.deliver_signed(&bob, "/actors/alice/inbox", &follow).await;
    ctx.settle().await;

    let request = ctx.transport.requests().pop().unwrap();
    let mut headers: CapturedHeaders = request
        .headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
        .collect();
    headers.insert("host".to_string(), "remote.example".to_string());
    assert!(headers.contains_key(&CORRELATION_HEADER.to_ascii_lowercase()));
    assert!(headers["signature"].contains(&ctx.alice.key_id));

    let digest = generate_digest(&request.body);
    let signed = SignedRequest {
        method: "POST",
        path: "/users/bob/inbox",
        headers: &headers,
        body_digest: Some(&digest),
    };
    verify_signature(&signed, LOCAL_PUBLIC_KEY, Utc::now(), 300).unwrap();
}

#[tokio::test]
async fn manual_approval_waits_for_local_decision() {
    let ctx = TestContext::new().await;
    let bob = ctx.peer("remote.example", "bob");
    let follow = follow_activity(&bob, "https://remote.example/follows/2", &ctx.carol.uri);

    ctx.deliver_signed(&bob, "/actors/carol/inbox", &follow).await;
    ctx.settle().await;

    let bob_actor = ctx.db().get_actor_by_uri(&bob.uri).await.unwrap().unwrap();
    let relation = ctx
        .db()
        .get_follow(&bob_actor.id, &ctx.carol.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(relation.follow_state(), FollowState::Requested);
    assert!(ctx.transport.requests().is_empty());

    let outcome = ctx
        .state
        .coordinator
        .approve(&ctx.carol, &bob_actor)
        .await
        .unwrap();
    assert_eq!(outcome.state(), Some(FollowState::Approved));
    ctx.settle().await;

    let accepts = ctx.transport.activities_of_type("Accept");
    assert_eq!(accepts.len(), 1);
    assert_eq!(accepts[0]["object"]["id"], "https://remote.example/follows/2");
}

/// A manual-approval target sees the same Follow twice before deciding.
/// The repeat changes nothing; approval then sends exactly one Accept.
#[tokio::test]
async fn duplicate_follow_before_approval_is_a_noop() {
    let ctx = TestContext::new().await;
    let bob = ctx.peer("remote.example", "bob");
    let follow = follow_activity(&bob, "https://remote.example/follows/req-1", &ctx.carol.uri);

    let first = ctx.deliver_signed(&bob, "/actors/carol/inbox", &follow).await;
    ctx.settle().await;
    let second = ctx.deliver_signed(&bob, "/actors/carol/inbox", &follow).await;
    let replay = ctx
        .state
        .processor
        .process(&envelope_of(&ctx, &second).await)
        .await
        .unwrap();
    assert_eq!(replay, ProcessingResult::Duplicate);
    ctx.settle().await;

    let first_job = match first {
        InboxReceipt::Accepted { job_id } => job_id,
        other => panic!("expected queued activity, got {:?}", other),
    };
    assert_eq!(
        ctx.db().get_job(first_job).await.unwrap().unwrap().state,
        "done"
    );

    let bob_actor = ctx.db().get_actor_by_uri(&bob.uri).await.unwrap().unwrap();
    let relation = ctx
        .db()
        .get_follow(&bob_actor.id, &ctx.carol.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(relation.follow_state(), FollowState::Requested);
    assert_eq!(
        relation.activity_id.as_deref(),
        Some("https://remote.example/follows/req-1")
    );
    assert!(ctx.transport.requests().is_empty());
    assert_eq!(ctx.db().count_jobs("deliver", "pending").await.unwrap(), 0);

    ctx.state
        .coordinator
        .approve(&ctx.carol, &bob_actor)
        .await
        .unwrap();
    ctx.settle().await;

    assert_eq!(ctx.db().count_jobs("deliver", "done").await.unwrap(), 1);
    let requests = ctx.transport.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].inbox, bob.inbox);
    let accepts = ctx.transport.activities_of_type("Accept");
    assert_eq!(accepts.len(), 1);
    assert_eq!(accepts[0]["actor"], ctx.carol.uri);
    assert_eq!(accepts[0]["object"]["id"], "https://remote.example/follows/req-1");
}

/// Workers racing on one envelope apply it once, whatever the interleaving.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_processing_applies_follow_once() {
    const ROUNDS: usize = 10;
    const WORKERS: usize = 8;

    let ctx = TestContext::new().await;

    for round in 0..ROUNDS {
        let peer = ctx.peer("remote.example", &format!("racer{}", round));
        let follow = follow_activity(
            &peer,
            &format!("https://remote.example/follows/race-{}", round),
            &ctx.alice.uri,
        );
        let receipt = ctx.deliver_signed(&peer, "/actors/alice/inbox", &follow).await;
        let envelope = std::sync::Arc::new(envelope_of(&ctx, &receipt).await);

        let tasks: Vec<_> = (0..WORKERS)
            .map(|_| {
                let processor = ctx.state.processor.clone();
                let envelope = envelope.clone();
                tokio::spawn(async move { processor.process(&envelope).await.unwrap() })
            })
            .collect();

        let mut applied = 0;
        for task in tasks {
            match task.await.unwrap() {
                ProcessingResult::Applied { .. } => applied += 1,
                ProcessingResult::Duplicate | ProcessingResult::InFlight => {}
                other => panic!("round {}: unexpected result {:?}", round, other),
            }
        }
        assert_eq!(applied, 1, "round {} applied the follow {} times", round, applied);

        // A late worker sees the record, not an empty slot
        assert_eq!(
            ctx.state.processor.process(&envelope).await.unwrap(),
            ProcessingResult::Duplicate
        );
    }

    assert_eq!(
        ctx.db().count_jobs("deliver", "pending").await.unwrap(),
        ROUNDS as i64
    );
}

#[tokio::test]
async fn rejected_request_sends_reject() {
    let ctx = TestContext::new().await;
    let bob = ctx.peer("remote.example", "bob");
    let follow = follow_activity(&bob, "https://remote.example/follows/3", &ctx.carol.uri);

    ctx.deliver_signed(&bob, "/actors/carol/inbox", &follow).await;
    ctx.settle().await;

    let bob_actor = ctx.db().get_actor_by_uri(&bob.uri).await.unwrap().unwrap();
    let outcome = ctx
        .state
        .coordinator
        .reject(&ctx.carol, &bob_actor)
        .await
        .unwrap();
    assert_eq!(outcome.state(), Some(FollowState::Rejected));
    ctx.settle().await;

    let rejects = ctx.transport.activities_of_type("Reject");
    assert_eq!(rejects.len(), 1);
    assert_eq!(rejects[0]["object"]["id"], "https://remote.example/follows/3");
    assert!(ctx.transport.activities_of_type("Accept").is_empty());
}

/// Local follow of a remote actor: Follow goes out, the remote Accept
/// approves the relationship.
#[tokio::test]
async fn local_follow_is_approved_by_remote_accept() {
    let ctx = TestContext::new().await;
    let bob = ctx.peer("remote.example", "bob");
    let bob_actor = ctx.state.resolver.resolve_actor(&bob.uri).await.unwrap();

    let outcome = ctx
        .state
        .coordinator
        .follow(&ctx.alice, &bob_actor)
        .await
        .unwrap();
    assert_eq!(outcome.state(), Some(FollowState::Requested));
    ctx.settle().await;

    let follows = ctx.transport.activities_of_type("Follow");
    assert_eq!(follows.len(), 1);
    let follow_id = follows[0]["id"].as_str().unwrap().to_string();
    assert_eq!(follows[0]["object"], bob.uri);

    let accept = json!({
        "id": "https://remote.example/accepts/1",
        "type": "Accept",
        "actor": bob.uri,
        "object": {
            "id": follow_id,
            "type": "Follow",
            "actor": ctx.alice.uri,
            "object": bob.uri
        }
    });
    ctx.deliver_signed(&bob, "/actors/alice/inbox", &accept)
        .await;
    ctx.settle().await;

    let relation = ctx
        .db()
        .get_follow(&ctx.alice.id, &bob_actor.id)
        .await
        .unwrap()
        .unwrap();
    assert!(relation.is_approved());
}

/// A third party cannot accept a follow addressed to someone else.
#[tokio::test]
async fn accept_from_wrong_actor_is_refused() {
    let ctx = TestContext::new().await;
    let bob = ctx.peer("remote.example", "bob");
    let mallory = ctx.peer("evil.example", "mallory");
    let bob_actor = ctx.state.resolver.resolve_actor(&bob.uri).await.unwrap();

    let outcome = ctx
        .state
        .coordinator
        .follow(&ctx.alice, &bob_actor)
        .await
        .unwrap();
    let follow_id = outcome.follow.unwrap().activity_id.unwrap();

    let accept = json!({
        "id": "https://evil.example/accepts/1",
        "type": "Accept",
        "actor": mallory.uri,
        "object": follow_id
    });
    let receipt = ctx
        .deliver_signed(&mallory, "/actors/alice/inbox", &accept)
        .await;
    let result = ctx
        .state
        .processor
        .process(&envelope_of(&ctx, &receipt).await)
        .await
        .unwrap();
    assert!(matches!(result, ProcessingResult::Invalid { .. }));

    let relation = ctx
        .db()
        .get_follow(&ctx.alice.id, &bob_actor.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(relation.follow_state(), FollowState::Requested);
}

/// Follow and Undo for one pair are delivered in submission order: the
/// Undo waits while the Follow is still being retried.
#[tokio::test]
async fn undo_waits_for_pending_follow_delivery() {
    let ctx = TestContext::new().await;
    let bob = ctx.peer("remote.example", "bob");
    let bob_actor = ctx.state.resolver.resolve_actor(&bob.uri).await.unwrap();
    ctx.transport.answer(503);

    ctx.state
        .coordinator
        .follow(&ctx.alice, &bob_actor)
        .await
        .unwrap();
    ctx.state
        .coordinator
        .unfollow(&ctx.alice, &bob_actor)
        .await
        .unwrap();

    let worker = ctx.delivery_worker();
    let now = Utc::now().timestamp_millis();
    let reports = ctx.drain(&worker, now).await;
    assert_eq!(reports.len(), 1);
    assert_eq!(ctx.transport.activities_of_type("Undo").len(), 0);

    ctx.transport.answer(202);
    let reports = ctx.drain(&worker, now + HOUR_MS).await;
    assert_eq!(reports.len(), 2);

    let sent: Vec<String> = ctx
        .transport
        .activities()
        .iter()
        .map(|activity| activity["type"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(sent, vec!["Follow", "Follow", "Undo"]);
    assert!(
        ctx.db()
            .get_follow(&ctx.alice.id, &bob_actor.id)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn remote_undo_follow_removes_relationship() {
    let ctx = TestContext::new().await;
    let bob = ctx.peer("remote.example", "bob");
    let follow = follow_activity(&bob, "https://remote.example/follows/4", &ctx.alice.uri);
    ctx.deliver_signed(&bob, "/actors/alice/inbox", &follow).await;
    ctx.settle().await;

    let undo = json!({
        "id": "https://remote.example/follows/4/undo",
        "type": "Undo",
        "actor": bob.uri,
        "object": follow
    });
    ctx.deliver_signed(&bob, "/actors/alice/inbox", &undo).await;
    ctx.settle().await;

    let bob_actor = ctx.db().get_actor_by_uri(&bob.uri).await.unwrap().unwrap();
    assert!(
        ctx.db()
            .get_follow(&bob_actor.id, &ctx.alice.id)
            .await
            .unwrap()
            .is_none()
    );
}

// =============================================================================
// Inbound checks
// =============================================================================

#[tokio::test]
async fn replayed_activity_is_a_noop() {
    let ctx = TestContext::new().await;
    let bob = ctx.peer("remote.example", "bob");
    let create = note_activity(&bob, 1, vec![ctx.alice.uri.as_str()]);

    let receipt = ctx
        .deliver_signed(&bob, "/actors/alice/inbox", &create)
        .await;
    let envelope = envelope_of(&ctx, &receipt).await;

    let first = ctx.state.processor.process(&envelope).await.unwrap();
    assert!(matches!(
        first,
        ProcessingResult::Applied {
            activity_type: "Create"
        }
    ));
    let second = ctx.state.processor.process(&envelope).await.unwrap();
    assert_eq!(second, ProcessingResult::Duplicate);

    let status = ctx
        .db()
        .get_status_by_uri("https://remote.example/users/bob/statuses/1")
        .await
        .unwrap()
        .unwrap();
    assert!(!status.content.contains("<script"));
    assert!(status.content.contains("world"));
    assert_eq!(status.visibility, "private");
}

#[tokio::test]
async fn stale_signature_is_rejected() {
    let ctx = TestContext::new().await;
    let bob = ctx.peer("remote.example", "bob");
    let create = note_activity(&bob, 2, vec![ctx.alice.uri.as_str()]);
    let body = serde_json::to_vec(&create).unwrap();

    let receipt = ctx
        .deliver_raw(
            &bob,
            "/actors/alice/inbox",
            &body,
            Utc::now() - Duration::hours(25),
        )
        .await;
    let envelope = envelope_of(&ctx, &receipt).await;
    let result = ctx.state.processor.process(&envelope).await.unwrap();

    assert!(matches!(result, ProcessingResult::Rejected { .. }));
    let record = ctx
        .db()
        .get_processed_activity(&envelope.digest, envelope.activity_id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.outcome, "rejected");
    assert!(
        ctx.db()
            .get_status_by_uri("https://remote.example/users/bob/statuses/2")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn signature_inside_skew_window_is_accepted() {
    let ctx = TestContext::new().await;
    let bob = ctx.peer("remote.example", "bob");
    let create = note_activity(&bob, 3, vec![ctx.alice.uri.as_str()]);
    let body = serde_json::to_vec(&create).unwrap();

    let receipt = ctx
        .deliver_raw(
            &bob,
            "/actors/alice/inbox",
            &body,
            Utc::now() - Duration::hours(11),
        )
        .await;
    let result = ctx
        .state
        .processor
        .process(&envelope_of(&ctx, &receipt).await)
        .await
        .unwrap();

    assert!(matches!(result, ProcessingResult::Applied { .. }));
}

/// The signature covers the Digest header; a body swapped under valid
/// headers is rejected.
#[tokio::test]
async fn body_must_match_signed_digest() {
    let ctx = TestContext::new().await;
    let bob = ctx.peer("remote.example", "bob");
    let signed_body = serde_json::to_vec(&note_activity(&bob, 4, vec![ctx.alice.uri.as_str()])).unwrap();
    let tampered = serde_json::to_vec(&note_activity(&bob, 5, vec![ctx.alice.uri.as_str()])).unwrap();

    let headers = signed_headers(
        &format!("{}/actors/alice/inbox", LOCAL_BASE),
        &signed_body,
        bob.private_key_pem,
        &bob.key_id,
        Utc::now(),
    );
    let receipt = ctx.receive("/actors/alice/inbox", &tampered, &headers).await;
    let result = ctx
        .state
        .processor
        .process(&envelope_of(&ctx, &receipt).await)
        .await
        .unwrap();

    let ProcessingResult::Rejected { reason } = result else {
        panic!("expected rejection, got {:?}", result);
    };
    assert!(reason.contains("digest"));
}

#[tokio::test]
async fn unsigned_activity_is_rejected() {
    let ctx = TestContext::new().await;
    let bob = ctx.peer("remote.example", "bob");
    let body = serde_json::to_vec(&note_activity(&bob, 6, vec![ctx.alice.uri.as_str()])).unwrap();

    let receipt = ctx
        .receive("/actors/alice/inbox", &body, &http::HeaderMap::new())
        .await;
    let result = ctx
        .state
        .processor
        .process(&envelope_of(&ctx, &receipt).await)
        .await
        .unwrap();

    assert!(matches!(result, ProcessingResult::Rejected { .. }));
}

/// Signing as bob with someone else's key fails even after refetching
/// bob's actor document.
#[tokio::test]
async fn forged_signature_is_rejected_after_one_refetch() {
    let ctx = TestContext::new().await;
    let bob = ctx.peer("remote.example", "bob");
    let forger = RemotePeer {
        private_key_pem: ROTATED_PRIVATE_KEY,
        ..bob.clone()
    };

    let receipt = ctx
        .deliver_signed(
            &forger,
            "/actors/alice/inbox",
            &note_activity(&bob, 7, vec![ctx.alice.uri.as_str()]),
        )
        .await;
    let result = ctx
        .state
        .processor
        .process(&envelope_of(&ctx, &receipt).await)
        .await
        .unwrap();

    assert!(matches!(result, ProcessingResult::Rejected { .. }));
    // first lookup plus one refresh
    assert_eq!(ctx.fetcher.fetch_count(&bob.uri), 2);
}

#[tokio::test]
async fn rotated_key_is_picked_up() {
    let ctx = TestContext::new().await;
    let bob = ctx.peer("remote.example", "bob");

    // bob becomes known with his original key
    let receipt = ctx
        .deliver_signed(&bob, "/actors/alice/inbox", &note_activity(&bob, 8, vec![ctx.alice.uri.as_str()]))
        .await;
    let first = ctx
        .state
        .processor
        .process(&envelope_of(&ctx, &receipt).await)
        .await
        .unwrap();
    assert!(matches!(first, ProcessingResult::Applied { .. }));

    // bob rotates
    ctx.fetcher.serve_peer(&bob, ROTATED_PUBLIC_KEY);
    let rotated = RemotePeer {
        private_key_pem: ROTATED_PRIVATE_KEY,
        ..bob.clone()
    };
    let receipt = ctx
        .deliver_signed(
            &rotated,
            "/actors/alice/inbox",
            &note_activity(&bob, 9, vec![ctx.alice.uri.as_str()]),
        )
        .await;
    let second = ctx
        .state
        .processor
        .process(&envelope_of(&ctx, &receipt).await)
        .await
        .unwrap();
    assert!(matches!(second, ProcessingResult::Applied { .. }));

    let stored = ctx.db().get_actor_by_uri(&bob.uri).await.unwrap().unwrap();
    assert_eq!(stored.public_key_pem, ROTATED_PUBLIC_KEY);
}

/// A key owner that cannot be fetched rejects the activity rather than
/// retrying it.
/// A key first seen on another actor's row is attributed to whoever the
/// refetched document says owns it.
#[tokio::test]
async fn refreshed_key_owner_is_checked_against_sender() {
    let ctx = TestContext::new().await;
    let bob = ctx.peer("remote.example", "bob");

    // mallory's stored row claims bob's key id with a stale key
    let mallory = RemotePeer::new("remote.example", "mallory");
    ctx.db()
        .upsert_remote_actor(&Actor::new_remote(RemoteActorProfile {
            uri: mallory.uri.clone(),
            username: "mallory".to_string(),
            domain: "remote.example".to_string(),
            inbox_uri: mallory.inbox.clone(),
            shared_inbox_uri: None,
            followers_uri: None,
            key_id: bob.key_id.clone(),
            public_key_pem: ROTATED_PUBLIC_KEY.to_string(),
            manually_approves_followers: false,
        }))
        .await
        .unwrap();

    let receipt = ctx
        .deliver_signed(
            &bob,
            "/actors/alice/inbox",
            &note_activity(&bob, 13, vec![ctx.alice.uri.as_str()]),
        )
        .await;
    let result = ctx
        .state
        .processor
        .process(&envelope_of(&ctx, &receipt).await)
        .await
        .unwrap();
    assert!(matches!(result, ProcessingResult::Applied { .. }), "{:?}", result);
    assert_eq!(ctx.fetcher.fetch_count(&bob.uri), 1);

    let key = ctx.state.keys.public_key(&bob.key_id).await.unwrap();
    assert_eq!(key.owner, bob.uri);
    assert_eq!(key.public_key_pem, REMOTE_PUBLIC_KEY);
}

#[tokio::test]
async fn unreachable_key_owner_is_rejected() {
    let ctx = TestContext::new().await;
    let ghost = RemotePeer::new("gone.example", "ghost");

    let receipt = ctx
        .deliver_signed(
            &ghost,
            "/actors/alice/inbox",
            &note_activity(&ghost, 1, vec![ctx.alice.uri.as_str()]),
        )
        .await;
    let result = ctx
        .state
        .processor
        .process(&envelope_of(&ctx, &receipt).await)
        .await
        .unwrap();

    let ProcessingResult::Rejected { reason } = result else {
        panic!("expected rejection, got {:?}", result);
    };
    assert!(reason.contains("public key unavailable"));
}

#[tokio::test]
async fn shared_inbox_ignores_statuses_not_for_local_actors() {
    let ctx = TestContext::new().await;
    let bob = ctx.peer("remote.example", "bob");

    let unrelated = note_activity(&bob, 10, vec!["https://elsewhere.example/users/zed"]);
    let addressed = note_activity(&bob, 11, vec![ctx.alice.uri.as_str()]);

    let receipt = ctx.deliver_signed(&bob, "/shared/inbox", &unrelated).await;
    let result = ctx
        .state
        .processor
        .process(&envelope_of(&ctx, &receipt).await)
        .await
        .unwrap();
    assert!(matches!(result, ProcessingResult::Ignored { .. }));

    let receipt = ctx.deliver_signed(&bob, "/shared/inbox", &addressed).await;
    let result = ctx
        .state
        .processor
        .process(&envelope_of(&ctx, &receipt).await)
        .await
        .unwrap();
    assert!(matches!(result, ProcessingResult::Applied { .. }));
}

#[tokio::test]
async fn like_and_undo_like_on_local_status() {
    let ctx = TestContext::new().await;
    let bob = ctx.peer("remote.example", "bob");
    let status_uri = format!("{}/statuses/1", ctx.alice.uri);

    let like = json!({
        "id": "https://remote.example/likes/1",
        "type": "Like",
        "actor": bob.uri,
        "object": status_uri
    });
    ctx.deliver_signed(&bob, "/shared/inbox", &like).await;
    ctx.settle().await;
    assert_eq!(
        ctx.db()
            .count_interactions(InteractionKind::Like, &status_uri)
            .await
            .unwrap(),
        1
    );

    let undo = json!({
        "id": "https://remote.example/likes/1/undo",
        "type": "Undo",
        "actor": bob.uri,
        "object": "https://remote.example/likes/1"
    });
    ctx.deliver_signed(&bob, "/shared/inbox", &undo).await;
    ctx.settle().await;
    assert_eq!(
        ctx.db()
            .count_interactions(InteractionKind::Like, &status_uri)
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn actor_delete_removes_remote_actor() {
    let ctx = TestContext::new().await;
    let bob = ctx.peer("remote.example", "bob");
    ctx.deliver_signed(&bob, "/actors/alice/inbox", &note_activity(&bob, 12, vec![ctx.alice.uri.as_str()]))
        .await;
    ctx.settle().await;
    assert!(ctx.db().get_actor_by_uri(&bob.uri).await.unwrap().is_some());

    let delete = json!({
        "id": "https://remote.example/users/bob#delete",
        "type": "Delete",
        "actor": bob.uri,
        "object": bob.uri
    });
    ctx.deliver_signed(&bob, "/shared/inbox", &delete).await;
    ctx.settle().await;

    assert!(ctx.db().get_actor_by_uri(&bob.uri).await.unwrap().is_none());
    assert!(
        ctx.db()
            .get_status_by_uri("https://remote.example/users/bob/statuses/12")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn blocked_domain_activity_is_ignored() {
    let ctx = TestContext::new().await;
    let bob = ctx.peer("remote.example", "bob");
    ctx.db().block_domain("remote.example").await.unwrap();

    let follow = follow_activity(&bob, "https://remote.example/follows/5", &ctx.alice.uri);
    let receipt = ctx.deliver_signed(&bob, "/actors/alice/inbox", &follow).await;
    let result = ctx
        .state
        .processor
        .process(&envelope_of(&ctx, &receipt).await)
        .await
        .unwrap();

    assert!(matches!(result, ProcessingResult::Ignored { .. }));
    assert_eq!(ctx.fetcher.fetch_count(&bob.uri), 0);
}

// =============================================================================
// Delivery retry
// =============================================================================

async fn queue_follow_delivery(ctx: &TestContext) -> i64 {
    let bob = ctx.peer("remote.example", "bob");
    let bob_actor = ctx.state.resolver.resolve_actor(&bob.uri).await.unwrap();
    let outcome = ctx
        .state
        .coordinator
        .follow(&ctx.alice, &bob_actor)
        .await
        .unwrap();

    match outcome.deliveries.as_slice() {
        [EnqueueReceipt::Queued { job_id }] => *job_id,
        other => panic!("expected one queued delivery, got {:?}", other),
    }
}

#[tokio::test]
async fn unavailable_inbox_is_retried_until_attempts_run_out() {
    let ctx = TestContext::new().await;
    let job_id = queue_follow_delivery(&ctx).await;
    ctx.transport.answer(503);

    let worker = ctx.delivery_worker();
    let start = Utc::now().timestamp_millis();
    let mut states = Vec::new();
    for step in 0..4 {
        for report in ctx.drain(&worker, start + step * 7 * HOUR_MS).await {
            states.push(report.state);
        }
    }

    assert_eq!(states, vec![JobState::Pending, JobState::Pending, JobState::Failed]);
    assert_eq!(ctx.transport.requests().len(), 3);

    let job = ctx.db().get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, "failed");
    assert_eq!(job.attempts, 3);
    assert_eq!(job.last_status, Some(503));
}

#[tokio::test]
async fn not_found_inbox_fails_without_retry() {
    let ctx = TestContext::new().await;
    let job_id = queue_follow_delivery(&ctx).await;
    ctx.transport.answer(404);

    let worker = ctx.delivery_worker();
    let now = Utc::now().timestamp_millis();
    let reports = ctx.drain(&worker, now).await;
    let later = ctx.drain(&worker, now + 7 * HOUR_MS).await;

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].state, JobState::Failed);
    assert!(later.is_empty());
    assert_eq!(ctx.transport.requests().len(), 1);
    assert_eq!(
        ctx.db().get_job(job_id).await.unwrap().unwrap().last_status,
        Some(404)
    );
}

#[tokio::test]
async fn gone_inbox_is_permanent() {
    let ctx = TestContext::new().await;
    queue_follow_delivery(&ctx).await;
    ctx.transport.answer(410);

    let reports = ctx
        .drain(&ctx.delivery_worker(), Utc::now().timestamp_millis())
        .await;
    assert_eq!(reports[0].state, JobState::Failed);
}

#[tokio::test]
async fn server_error_then_success() {
    let ctx = TestContext::new().await;
    let job_id = queue_follow_delivery(&ctx).await;
    ctx.transport.script(&[500]);

    let worker = ctx.delivery_worker();
    let now = Utc::now().timestamp_millis();
    let first = ctx.drain(&worker, now).await;
    assert_eq!(first[0].state, JobState::Pending);

    // not due yet
    assert!(ctx.drain(&worker, now + 1_000).await.is_empty());

    let second = ctx.drain(&worker, now + HOUR_MS).await;
    assert_eq!(second[0].state, JobState::Done);
    assert_eq!(second[0].attempts, 2);

    let job = ctx.db().get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, "done");
}

#[tokio::test]
async fn operator_retry_gives_failed_delivery_new_budget() {
    let ctx = TestContext::new().await;
    let job_id = queue_follow_delivery(&ctx).await;
    ctx.transport.answer(404);

    let worker = ctx.delivery_worker();
    ctx.drain(&worker, Utc::now().timestamp_millis()).await;

    ctx.transport.answer(202);
    let receipt = ctx.state.queue.retry(job_id).await.unwrap();
    assert!(matches!(receipt, Some(EnqueueReceipt::Queued { .. })));

    let reports = ctx
        .drain(&worker, Utc::now().timestamp_millis() + 1)
        .await;
    assert_eq!(reports[0].state, JobState::Done);
    assert_eq!(reports[0].attempts, 1);

    // done jobs are not retryable
    assert!(ctx.state.queue.retry(job_id).await.unwrap().is_none());
}

#[tokio::test]
async fn blocking_a_domain_drops_pending_deliveries() {
    let ctx = TestContext::new().await;
    let job_id = queue_follow_delivery(&ctx).await;

    ctx.db().block_domain("remote.example").await.unwrap();
    let dropped = ctx
        .db()
        .drop_pending_jobs_for_domain("remote.example", Utc::now().timestamp_millis())
        .await
        .unwrap();

    assert_eq!(dropped, 1);
    assert_eq!(ctx.db().get_job(job_id).await.unwrap().unwrap().state, "dropped");
    assert!(
        ctx.drain(&ctx.delivery_worker(), Utc::now().timestamp_millis())
            .await
            .is_empty()
    );
    assert!(ctx.transport.requests().is_empty());
}

#[tokio::test]
async fn status_fan_out_uses_one_job_per_shared_inbox() {
    let ctx = TestContext::new().await;
    for name in ["bob", "dave"] {
        let peer = ctx.peer("remote.example", name);
        let follow = follow_activity(
            &peer,
            &format!("https://remote.example/follows/{}", name),
            &ctx.alice.uri,
        );
        ctx.deliver_signed(&peer, "/actors/alice/inbox", &follow).await;
    }
    let eve = ctx.peer("other.example", "eve");
    ctx.deliver_signed(
        &eve,
        "/actors/alice/inbox",
        &follow_activity(&eve, "https://other.example/follows/eve", &ctx.alice.uri),
    )
    .await;
    ctx.settle().await;

    let status = local_status(&ctx, 1);
    let receipts = ctx
        .state
        .delivery
        .publish_status(&ctx.alice, &status)
        .await
        .unwrap();
    assert_eq!(receipts.len(), 2);

    ctx.settle().await;
    let creates: Vec<_> = ctx
        .transport
        .requests()
        .into_iter()
        .filter(|request| {
            serde_json::from_slice::<Value>(&request.body).unwrap()["type"] == "Create"
        })
        .map(|request| request.inbox)
        .collect();
    assert_eq!(creates.len(), 2);
    assert!(creates.contains(&"https://remote.example/inbox".to_string()));
    assert!(creates.contains(&"https://other.example/inbox".to_string()));
}

fn local_status(ctx: &TestContext, n: u32) -> Status {
    Status {
        id: EntityId::new().0,
        uri: format!("{}/statuses/{}", ctx.alice.uri, n),
        actor_id: ctx.alice.id.clone(),
        content: "<p>hi</p>".to_string(),
        in_reply_to_uri: None,
        visibility: "public".to_string(),
        is_local: true,
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn deleting_a_status_notifies_followers() {
    let ctx = TestContext::new().await;
    let bob = ctx.peer("remote.example", "bob");
    ctx.deliver_signed(
        &bob,
        "/actors/alice/inbox",
        &follow_activity(&bob, "https://remote.example/follows/del", &ctx.alice.uri),
    )
    .await;
    ctx.settle().await;

    let status = local_status(&ctx, 2);
    let receipts = ctx
        .state
        .delivery
        .publish_delete(&ctx.alice, &status)
        .await
        .unwrap();
    assert_eq!(receipts.len(), 1);
    ctx.settle().await;

    let deletes = ctx.transport.activities_of_type("Delete");
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0]["actor"], ctx.alice.uri);
    assert_eq!(deletes[0]["object"]["type"], "Tombstone");
    assert_eq!(deletes[0]["object"]["id"], status.uri);
    let last = ctx.transport.requests().pop().unwrap();
    assert_eq!(last.inbox, "https://remote.example/inbox");
}

#[tokio::test]
async fn local_like_and_undo_reach_status_author() {
    let ctx = TestContext::new().await;
    let bob = ctx.peer("remote.example", "bob");
    let author = ctx.state.resolver.resolve_actor(&bob.uri).await.unwrap();
    let status_uri = format!("{}/statuses/77", bob.uri);

    let like_id = ctx
        .state
        .delivery
        .send_like(&ctx.alice, &status_uri, &author)
        .await
        .unwrap();
    ctx.settle().await;

    let likes = ctx.transport.activities_of_type("Like");
    assert_eq!(likes.len(), 1);
    assert_eq!(likes[0]["id"], like_id);
    assert_eq!(likes[0]["object"], status_uri);
    assert_eq!(ctx.transport.requests()[0].inbox, bob.inbox);

    ctx.state
        .delivery
        .send_undo(
            &ctx.alice,
            &like_id,
            "Like",
            Some(&status_uri),
            vec![author.inbox_uri.clone()],
        )
        .await
        .unwrap();
    ctx.settle().await;

    let undos = ctx.transport.activities_of_type("Undo");
    assert_eq!(undos.len(), 1);
    assert_eq!(undos[0]["actor"], ctx.alice.uri);
    assert_eq!(undos[0]["object"]["id"], like_id);
    assert_eq!(undos[0]["object"]["type"], "Like");
    assert_eq!(undos[0]["object"]["object"], status_uri);
}

#[tokio::test]
async fn announce_goes_to_followers_and_author() {
    let ctx = TestContext::new().await;
    let dave = ctx.peer("other.example", "dave");
    ctx.deliver_signed(
        &dave,
        "/actors/alice/inbox",
        &follow_activity(&dave, "https://other.example/follows/dave", &ctx.alice.uri),
    )
    .await;
    ctx.settle().await;

    let bob = ctx.peer("remote.example", "bob");
    let author = ctx.state.resolver.resolve_actor(&bob.uri).await.unwrap();
    let status_uri = format!("{}/statuses/78", bob.uri);

    let announce_id = ctx
        .state
        .delivery
        .send_announce(&ctx.alice, &status_uri, "public", &author)
        .await
        .unwrap();
    ctx.settle().await;

    let announces: Vec<_> = ctx
        .transport
        .requests()
        .into_iter()
        .filter(|request| {
            serde_json::from_slice::<Value>(&request.body).unwrap()["type"] == "Announce"
        })
        .collect();
    assert_eq!(announces.len(), 2);
    let inboxes: Vec<_> = announces.iter().map(|request| request.inbox.as_str()).collect();
    assert!(inboxes.contains(&"https://other.example/inbox"));
    assert!(inboxes.contains(&"https://remote.example/inbox"));

    let body: Value = serde_json::from_slice(&announces[0].body).unwrap();
    assert_eq!(body["id"], announce_id);
    assert_eq!(body["object"], status_uri);
}

// =============================================================================
// Inline queue
// =============================================================================

#[tokio::test]
async fn inline_mode_processes_during_receipt() {
    let ctx = TestContext::with_driver(QueueDriver::Inline).await;
    let bob = ctx.peer("remote.example", "bob");
    let follow = follow_activity(&bob, "https://remote.example/follows/6", &ctx.alice.uri);

    let receipt = ctx.deliver_signed(&bob, "/actors/alice/inbox", &follow).await;

    let InboxReceipt::Processed(report) = receipt else {
        panic!("expected inline processing, got {:?}", receipt);
    };
    assert_eq!(report.state, JobState::Done);
    assert_eq!(ctx.transport.activities_of_type("Accept").len(), 1);
    assert!(ctx.db().list_jobs(None, None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn inline_mode_records_failed_delivery() {
    let ctx = TestContext::with_driver(QueueDriver::Inline).await;
    ctx.transport.answer(503);
    let bob = ctx.peer("remote.example", "bob");
    let bob_actor = ctx.state.resolver.resolve_actor(&bob.uri).await.unwrap();

    let outcome = ctx
        .state
        .coordinator
        .follow(&ctx.alice, &bob_actor)
        .await
        .unwrap();
    let [EnqueueReceipt::Completed(report)] = outcome.deliveries.as_slice() else {
        panic!("expected inline delivery");
    };
    assert_eq!(report.state, JobState::Failed);
    assert_eq!(report.attempts, 3);
    assert_eq!(ctx.transport.requests().len(), 3);

    let failed = ctx
        .db()
        .list_jobs(Some("deliver"), Some("failed"), 10)
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);

    ctx.transport.answer(202);
    let retried = ctx.state.queue.retry(failed[0].id).await.unwrap();
    let Some(EnqueueReceipt::Completed(report)) = retried else {
        panic!("expected inline retry");
    };
    assert_eq!(report.state, JobState::Done);
    assert_eq!(
        ctx.db().get_job(failed[0].id).await.unwrap().unwrap().state,
        "done"
    );
}

#[tokio::test]
async fn remote_peer_document_shape_is_parsed() {
    // guard for the fake's document shape
    let peer = RemotePeer::new("remote.example", "bob");
    let profile = fediport::federation::resolver::parse_actor_document(
        &peer.document(REMOTE_PUBLIC_KEY),
        &peer.uri,
    )
    .unwrap();
    assert_eq!(profile.shared_inbox_uri.as_deref(), Some("https://remote.example/inbox"));
    assert_eq!(profile.key_id, peer.key_id);
}
