//! Dispatch pipeline tests: authorization, transactions and notification
//! ordering, driven through `RequestDispatcher` over in-memory storage.

mod common;

use common::{Harness, ALICE, ALICE_CHANNEL, ALICE_ID, BOB, BOB_ID, CAROL};
use waddle_pubsub::{
    Affiliation, ErrorCondition, FrontendEvent, HookName, OperationResult, PubSubError, Request,
    Subscription,
};

// =============================================================================
// Resolution and error delivery
// =============================================================================

#[tokio::test]
async fn test_unknown_feature_is_not_implemented() {
    let harness = Harness::new();

    let err = harness
        .dispatcher
        .handle(Request::new(ALICE, "purge-nodes", "purge").with_node(ALICE_CHANNEL))
        .await
        .unwrap_err();

    assert!(matches!(err.error, PubSubError::FeatureNotImplemented(_)));
    assert_eq!(err.condition(), ErrorCondition::FeatureNotImplemented);
    assert!(err.trace.ends_with(" @ purge-nodes/purge"));
}

#[tokio::test]
async fn test_error_trace_names_operation() {
    let harness = Harness::new();
    harness.create(ALICE, ALICE_CHANNEL).await;

    let err = harness
        .dispatcher
        .handle(
            Request::new(BOB, "publish", "publish")
                .with_node(ALICE_CHANNEL)
                .with_item(Some("1"), common::entry("hi")),
        )
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "publisher required");
    assert_eq!(err.trace, "publisher required @ publish/publish");
}

// =============================================================================
// Authorization
// =============================================================================

#[tokio::test]
async fn test_publish_without_publisher_is_forbidden() {
    let harness = Harness::new();
    harness.create(ALICE, ALICE_CHANNEL).await;

    // Bob is a member of the open node, which is not enough to publish
    let err = harness
        .dispatcher
        .handle(
            Request::new(BOB, "publish", "publish")
                .with_node(ALICE_CHANNEL)
                .with_item(Some("1"), common::entry("hi")),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err.error,
        PubSubError::AffiliationRequired {
            required: Affiliation::Publisher
        }
    ));
    assert_eq!(err.condition(), ErrorCondition::Forbidden);
    assert!(harness.item_ids(ALICE_CHANNEL).await.is_empty());
    assert!(harness.frontend.calls_for(HookName::Notify).is_empty());
}

#[tokio::test]
async fn test_subscribed_member_may_publish_to_publishers_node() {
    let harness = Harness::new();
    harness.create(ALICE, ALICE_CHANNEL).await;
    harness
        .configure(ALICE, ALICE_CHANNEL, "open", "publishers")
        .await;
    harness
        .dispatcher
        .handle(
            Request::new(ALICE, "modify-affiliations", "modify")
                .with_node(ALICE_CHANNEL)
                .with_affiliation(BOB, "member"),
        )
        .await
        .expect("should set affiliation");

    // Not yet subscribed: still only a member
    let err = harness
        .dispatcher
        .handle(
            Request::new(BOB, "publish", "publish")
                .with_node(ALICE_CHANNEL)
                .with_item(Some("1"), common::entry("early")),
        )
        .await
        .unwrap_err();
    assert_eq!(err.condition(), ErrorCondition::Forbidden);

    assert_eq!(
        harness.subscribe(BOB, ALICE_CHANNEL).await,
        Subscription::Subscribed
    );
    harness.publish(BOB, ALICE_CHANNEL, "1", "from bob").await;
    assert_eq!(harness.item_ids(ALICE_CHANNEL).await, vec!["1"]);
}

#[tokio::test]
async fn test_closed_node_requires_membership() {
    let harness = Harness::new();
    harness.create(ALICE, ALICE_CHANNEL).await;
    harness
        .configure(ALICE, ALICE_CHANNEL, "authorize", "subscribers")
        .await;

    let err = harness
        .dispatcher
        .handle(Request::new(BOB, "retrieve-items", "retrieve").with_node(ALICE_CHANNEL))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "member required");

    // The owner is never asked
    harness
        .dispatcher
        .handle(Request::new(ALICE, "retrieve-items", "retrieve").with_node(ALICE_CHANNEL))
        .await
        .expect("owner should retrieve");
}

#[tokio::test]
async fn test_authorization_on_missing_node() {
    let harness = Harness::new();

    let err = harness
        .dispatcher
        .handle(
            Request::new(BOB, "retrieve-items", "retrieve")
                .with_node("/user/nobody@example.com/channel"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.condition(), ErrorCondition::ItemNotFound);
}

#[tokio::test]
async fn test_owner_operations_need_owner() {
    let harness = Harness::new();
    harness.create(ALICE, ALICE_CHANNEL).await;

    let err = harness
        .dispatcher
        .handle(
            Request::new(BOB, "config-node", "modify")
                .with_node(ALICE_CHANNEL)
                .with_config(waddle_pubsub::ConfigUpdate {
                    title: Some("Hijacked".to_string()),
                    ..Default::default()
                }),
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "owner required");

    // A stored owner affiliation works outside the owner's namespace too
    harness
        .dispatcher
        .handle(
            Request::new(ALICE, "modify-affiliations", "modify")
                .with_node(ALICE_CHANNEL)
                .with_affiliation(BOB, "owner"),
        )
        .await
        .expect("should add owner");
    harness
        .dispatcher
        .handle(
            Request::new(BOB, "config-node", "modify")
                .with_node(ALICE_CHANNEL)
                .with_config(waddle_pubsub::ConfigUpdate {
                    title: Some("Shared".to_string()),
                    ..Default::default()
                }),
        )
        .await
        .expect("stored owner should configure");
}

// =============================================================================
// Transactions
// =============================================================================

#[tokio::test]
async fn test_create_existing_node_conflicts_without_side_effects() {
    let harness = Harness::new();
    harness.create(ALICE, ALICE_CHANNEL).await;
    harness
        .configure(ALICE, ALICE_CHANNEL, "authorize", "publishers")
        .await;

    let err = harness
        .dispatcher
        .handle(Request::new(ALICE, "create-nodes", "create").with_node(ALICE_CHANNEL))
        .await
        .unwrap_err();
    assert_eq!(err.condition(), ErrorCondition::Conflict);

    assert_eq!(
        harness.affiliation(ALICE_CHANNEL, ALICE).await,
        Affiliation::Owner
    );
    let config = harness
        .dispatcher
        .handle(Request::new(ALICE, "config-node", "retrieve").with_node(ALICE_CHANNEL))
        .await
        .expect("should retrieve config");
    match config {
        OperationResult::Config(config) => {
            assert_eq!(
                config.access_model,
                Some(waddle_pubsub::AccessModel::Authorize)
            );
        }
        other => panic!("unexpected result {other:?}"),
    }
}

#[tokio::test]
async fn test_failed_register_rolls_back_every_node() {
    let harness = Harness::new();
    harness.create(ALICE, "/user/alice@example.com/mood").await;

    let err = harness
        .dispatcher
        .handle(Request::new(ALICE, "register", "register"))
        .await
        .unwrap_err();
    assert_eq!(err.condition(), ErrorCondition::Conflict);

    // channel was created before mood failed and must be gone again
    let err = harness
        .dispatcher
        .handle(Request::new(BOB, "subscribe", "subscribe").with_node(ALICE_CHANNEL))
        .await
        .unwrap_err();
    assert_eq!(err.condition(), ErrorCondition::ItemNotFound);
}

#[tokio::test]
async fn test_retract_missing_item_aborts_everything() {
    let harness = Harness::new();
    harness.create(ALICE, ALICE_CHANNEL).await;
    harness.publish(ALICE, ALICE_CHANNEL, "1", "one").await;
    harness.publish(ALICE, ALICE_CHANNEL, "2", "two").await;
    harness.frontend.clear();

    let err = harness
        .dispatcher
        .handle(
            Request::new(ALICE, "retract-items", "retract")
                .with_node(ALICE_CHANNEL)
                .with_item_id("1")
                .with_item_id("missing"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.condition(), ErrorCondition::ItemNotFound);
    assert_eq!(harness.item_ids(ALICE_CHANNEL).await, vec!["2", "1"]);
    assert!(harness.frontend.calls().is_empty());
}

#[tokio::test]
async fn test_requests_after_failure_see_committed_state() {
    let harness = Harness::new();
    harness.create(ALICE, ALICE_CHANNEL).await;

    let _ = harness
        .dispatcher
        .handle(Request::new(ALICE, "create-nodes", "create").with_node(ALICE_CHANNEL))
        .await;

    // The failed request released its transaction
    assert_eq!(
        harness.subscribe(BOB, ALICE_CHANNEL).await,
        Subscription::Subscribed
    );
}

#[tokio::test]
async fn test_rollback_failure_keeps_original_error() {
    let harness = Harness::new();
    harness.create(ALICE, ALICE_CHANNEL).await;
    harness.spy.fail_rollbacks();

    let err = harness
        .dispatcher
        .handle(Request::new(ALICE, "create-nodes", "create").with_node(ALICE_CHANNEL))
        .await
        .unwrap_err();

    assert!(matches!(err.error, PubSubError::Conflict(_)));
    assert_eq!(err.condition(), ErrorCondition::Conflict);
}

#[tokio::test]
async fn test_commit_failure_skips_hooks_and_notifications() {
    let harness = Harness::new();
    harness.create(ALICE, ALICE_CHANNEL).await;
    harness.subscribe(BOB, ALICE_CHANNEL).await;
    harness
        .configure(ALICE, ALICE_CHANNEL, "authorize", "subscribers")
        .await;
    harness.frontend.clear();
    harness.spy.fail_commits();

    let err = harness
        .dispatcher
        .handle(
            Request::new(ALICE, "publish", "publish")
                .with_node(ALICE_CHANNEL)
                .with_item(Some("1"), common::entry("one")),
        )
        .await
        .unwrap_err();
    assert!(matches!(err.error, PubSubError::Storage(_)));

    // Would have asked ALICE to approve CAROL after a successful commit
    let err = harness
        .dispatcher
        .handle(Request::new(CAROL, "subscribe", "subscribe").with_node(ALICE_CHANNEL))
        .await
        .unwrap_err();
    assert_eq!(err.condition(), ErrorCondition::InternalServerError);

    assert!(harness.frontend.calls().is_empty());
    assert!(harness.item_ids(ALICE_CHANNEL).await.is_empty());
    assert_eq!(
        harness.subscription(ALICE_CHANNEL, CAROL).await,
        Subscription::None
    );
}

#[tokio::test]
async fn test_open_node_subscribe_skips_subscription_lookup() {
    let harness = Harness::new();
    harness.create(ALICE, ALICE_CHANNEL).await;
    harness.spy.reset_counts();

    assert_eq!(
        harness.subscribe(BOB, ALICE_CHANNEL).await,
        Subscription::Subscribed
    );
    assert_eq!(harness.spy.subscription_reads(), 0);

    harness
        .configure(ALICE, ALICE_CHANNEL, "authorize", "subscribers")
        .await;
    harness.spy.reset_counts();
    assert_eq!(
        harness.subscribe(CAROL, ALICE_CHANNEL).await,
        Subscription::Pending
    );
    assert_eq!(harness.spy.subscription_reads(), 1);
}

// =============================================================================
// Notifications
// =============================================================================

#[tokio::test]
async fn test_publish_notifies_subscribed_users_only() {
    let harness = Harness::new();
    harness.create(ALICE, ALICE_CHANNEL).await;
    harness.subscribe(BOB, ALICE_CHANNEL).await;
    harness
        .configure(ALICE, ALICE_CHANNEL, "authorize", "subscribers")
        .await;
    assert_eq!(
        harness.subscribe(CAROL, ALICE_CHANNEL).await,
        Subscription::Pending
    );
    harness.frontend.clear();

    harness.publish(ALICE, ALICE_CHANNEL, "1", "hello").await;

    let notified: Vec<String> = harness
        .frontend
        .calls_for(HookName::Notify)
        .into_iter()
        .map(|c| c.target)
        .collect();
    assert_eq!(notified, vec![ALICE_ID.to_string(), BOB_ID.to_string()]);
}

#[tokio::test]
async fn test_publish_notification_carries_normalized_items() {
    let harness = Harness::new();
    harness.create(ALICE, ALICE_CHANNEL).await;
    harness.frontend.clear();

    let result = harness
        .dispatcher
        .handle(
            Request::new(ALICE, "publish", "publish")
                .with_node(ALICE_CHANNEL)
                .with_item(None, common::entry("no id")),
        )
        .await
        .expect("should publish");
    let ids = match result {
        OperationResult::Published(ids) => ids,
        other => panic!("unexpected result {other:?}"),
    };
    assert_eq!(ids.len(), 1);

    let calls = harness.frontend.calls_for(HookName::Notify);
    assert_eq!(calls.len(), 1);
    match &calls[0].event {
        FrontendEvent::Notify { node, items } => {
            assert_eq!(node, ALICE_CHANNEL);
            assert_eq!(items[0].id.as_deref(), Some(ids[0].as_str()));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_unregistered_scheme_is_skipped() {
    let harness = Harness::new();
    harness.create(ALICE, ALICE_CHANNEL).await;
    harness.subscribe("mailto:dave@example.com", ALICE_CHANNEL).await;
    harness.frontend.clear();

    harness.publish(ALICE, ALICE_CHANNEL, "1", "hello").await;

    let calls = harness.frontend.calls_for(HookName::Notify);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].target, ALICE_ID);
}

#[tokio::test]
async fn test_retract_notifies_subscribers() {
    let harness = Harness::new();
    harness.create(ALICE, ALICE_CHANNEL).await;
    harness.subscribe(BOB, ALICE_CHANNEL).await;
    harness.publish(ALICE, ALICE_CHANNEL, "1", "one").await;
    harness.frontend.clear();

    harness
        .dispatcher
        .handle(
            Request::new(ALICE, "retract-items", "retract")
                .with_node(ALICE_CHANNEL)
                .with_item_id("1"),
        )
        .await
        .expect("should retract");

    let calls = harness.frontend.calls_for(HookName::Retracted);
    assert_eq!(calls.len(), 2);
    assert_eq!(
        calls[1].event,
        FrontendEvent::Retracted {
            node: ALICE_CHANNEL.to_string(),
            item_ids: vec!["1".to_string()],
        }
    );
    assert!(harness.item_ids(ALICE_CHANNEL).await.is_empty());
}

#[tokio::test]
async fn test_failed_requests_notify_nobody() {
    let harness = Harness::new();
    harness.create(ALICE, ALICE_CHANNEL).await;
    harness
        .configure(ALICE, ALICE_CHANNEL, "authorize", "subscribers")
        .await;
    harness.frontend.clear();

    let _ = harness
        .dispatcher
        .handle(
            Request::new(ALICE, "config-node", "modify")
                .with_node(ALICE_CHANNEL)
                .with_config(waddle_pubsub::ConfigUpdate {
                    access_model: Some("everyone".to_string()),
                    ..Default::default()
                }),
        )
        .await
        .unwrap_err();

    assert!(harness.frontend.calls().is_empty());
}

#[tokio::test]
async fn test_all_subscribers() {
    let harness = Harness::new();
    harness.create(ALICE, ALICE_CHANNEL).await;
    harness.subscribe(BOB, ALICE_CHANNEL).await;
    harness.create(BOB, "/user/bob@example.com/channel").await;

    let subscribers = harness
        .dispatcher
        .all_subscribers()
        .await
        .expect("should list subscribers");
    assert_eq!(subscribers, vec![ALICE.to_string(), BOB.to_string()]);
}
