//! End-to-end bracket placement against the scripted mock exchange.

use std::sync::Arc;
use std::time::Duration;

use keel_core::{
    BracketLabel, BracketOutcome, OrderRole, OrderState, RollbackTrigger, Side, StrategyId,
};
use keel_execution::{BracketConfig, BracketError, BracketIntent, BracketManager};
use keel_test_utils::{FailureTrigger, MockExchangeApi};
use keel_transport::TransportError;
use rust_decimal_macros::dec;

fn fast_config() -> BracketConfig {
    BracketConfig {
        fill_poll_attempts: 3,
        fill_poll_interval: Duration::from_millis(10),
        position_confirm_attempts: 3,
        position_confirm_interval: Duration::from_millis(10),
        cancel_verify_attempts: 3,
    }
}

fn intent() -> BracketIntent {
    BracketIntent {
        strategy: StrategyId::from("btc-breakout"),
        instrument: "BTC-PERPETUAL".into(),
        side: Side::Buy,
        quantity: dec!(0.2),
        entry_price: dec!(50000),
        stop_price: dec!(49500),
        target_price: dec!(51000),
    }
}

fn setup() -> (MockExchangeApi, BracketManager) {
    let _ = tracing_subscriber::fmt::try_init();
    let api = MockExchangeApi::new();
    let manager = BracketManager::new(Arc::new(api.clone()), fast_config());
    (api, manager)
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_leaves_a_fully_protected_position() {
    let (api, manager) = setup();
    api.set_fill_after_polls(1);

    let transaction = manager.place(intent()).await.unwrap();
    let Some(BracketOutcome::Confirmed {
        entry_id,
        stop_id,
        target_id,
    }) = transaction.outcome
    else {
        panic!("expected confirmed outcome, got {:?}", transaction.outcome);
    };

    let entry = api.order(&entry_id).unwrap();
    assert_eq!(entry.state, OrderState::Filled);
    assert_eq!(entry.filled_quantity, dec!(0.2));

    let stop = api.order(&stop_id).unwrap();
    assert!(stop.reduce_only);
    assert_eq!(stop.quantity, dec!(0.2));
    let stop_label: BracketLabel = stop.label.as_deref().unwrap().parse().unwrap();
    assert_eq!(stop_label.role, OrderRole::StopLoss);
    assert_eq!(stop_label.transaction, transaction.id);

    let target = api.order(&target_id).unwrap();
    assert!(target.reduce_only);
    assert_eq!(target.price, Some(dec!(51000)));

    assert_eq!(api.position_size("BTC-PERPETUAL"), dec!(0.2));
    assert_eq!(api.live_orders("BTC-PERPETUAL").len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn unfilled_entry_is_cancelled_and_rolled_back() {
    let (api, manager) = setup();
    api.set_fill_after_polls(u32::MAX);

    let transaction = manager.place(intent()).await.unwrap();
    assert!(matches!(
        transaction.outcome,
        Some(BracketOutcome::RolledBack {
            trigger: RollbackTrigger::FillTimeout,
            ..
        })
    ));

    let entry_id = &transaction.placed_orders[0];
    assert_eq!(api.order(entry_id).unwrap().state, OrderState::Cancelled);
    assert!(api.live_orders("BTC-PERPETUAL").is_empty());
    assert_eq!(api.position_size("BTC-PERPETUAL"), dec!(0));
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_stop_unwinds_cleanly() {
    let (api, manager) = setup();
    api.script_failure(
        FailureTrigger::PlaceRole(OrderRole::StopLoss),
        TransportError::InvalidParams("price out of range".into()),
        1,
    );

    let transaction = manager.place(intent()).await.unwrap();
    let Some(BracketOutcome::RolledBack { reason, trigger }) = transaction.outcome else {
        panic!("expected rollback, got {:?}", transaction.outcome);
    };
    assert!(reason.contains("stop placement failed"));
    assert_eq!(trigger, RollbackTrigger::OrderRejected);
    assert!(api.live_orders("BTC-PERPETUAL").is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_entry_needs_no_cleanup() {
    let (api, manager) = setup();
    api.script_failure(
        FailureTrigger::PlaceRole(OrderRole::Entry),
        TransportError::InsufficientFunds("not enough margin".into()),
        1,
    );

    let transaction = manager.place(intent()).await.unwrap();
    let Some(BracketOutcome::RolledBack { trigger, .. }) = transaction.outcome else {
        panic!("expected rollback, got {:?}", transaction.outcome);
    };
    assert_eq!(trigger, RollbackTrigger::OrderRejected);
    assert!(transaction.placed_orders.is_empty());
    assert!(api.live_orders("BTC-PERPETUAL").is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn unremovable_order_is_reported_not_forgotten() {
    let (api, manager) = setup();
    // Target placement fails, then every cancel of the resting stop fails
    // too; the stop must surface in the unrecoverable set.
    api.script_failure(
        FailureTrigger::PlaceRole(OrderRole::TakeProfit),
        TransportError::InvalidParams("bad target".into()),
        1,
    );
    api.script_failure(
        FailureTrigger::CancelAny,
        TransportError::ServerError {
            code: -32000,
            message: "cancel desk offline".into(),
        },
        100,
    );

    let transaction = manager.place(intent()).await.unwrap();
    let Some(BracketOutcome::Unrecoverable { remaining }) = transaction.outcome else {
        panic!("expected unrecoverable, got {:?}", transaction.outcome);
    };
    let stop = api
        .live_orders("BTC-PERPETUAL")
        .into_iter()
        .find(|order| {
            order
                .bracket_role()
                .map_or(false, |role| role == OrderRole::StopLoss)
        })
        .unwrap();
    assert!(remaining.contains(&stop.order_id));
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_attempt_is_rejected_not_queued() {
    let (api, manager) = setup();
    api.set_fill_after_polls(2);
    let manager = Arc::new(manager);

    let first = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.place(intent()).await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;

    let second = manager.place(intent()).await;
    assert!(matches!(
        second,
        Err(BracketError::AlreadyInFlight { .. })
    ));

    let transaction = first.await.unwrap().unwrap();
    assert!(transaction.outcome.unwrap().is_confirmed());
}

#[tokio::test(flavor = "multi_thread")]
async fn preexisting_labeled_orders_block_entry() {
    let (api, manager) = setup();
    let stale = keel_core::OrderRecord {
        order_id: "stale-1".into(),
        label: Some(
            BracketLabel::new(keel_core::TransactionId::generate(), OrderRole::StopLoss)
                .to_string(),
        ),
        instrument: "BTC-PERPETUAL".into(),
        side: Side::Sell,
        quantity: dec!(0.1),
        filled_quantity: dec!(0),
        price: Some(dec!(49000)),
        state: OrderState::Untriggered,
        reduce_only: true,
        updated_at: chrono::Utc::now(),
    };
    api.seed_open_order(stale);

    let outcome = manager.place(intent()).await;
    let Err(BracketError::OrphansPresent { orders, .. }) = outcome else {
        panic!("expected orphan rejection");
    };
    assert_eq!(orders, vec!["stale-1".to_string()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn protective_orders_for_a_live_position_do_not_block_entry() {
    let (api, manager) = setup();
    // Another strategy's position is guarded by its own stop; those orders
    // are protection, not orphans.
    api.seed_position("BTC-PERPETUAL", dec!(0.1), dec!(50000));
    api.seed_open_order(keel_core::OrderRecord {
        order_id: "guard-1".into(),
        label: Some(
            BracketLabel::new(keel_core::TransactionId::generate(), OrderRole::StopLoss)
                .to_string(),
        ),
        instrument: "BTC-PERPETUAL".into(),
        side: Side::Sell,
        quantity: dec!(0.1),
        filled_quantity: dec!(0),
        price: Some(dec!(49000)),
        state: OrderState::Untriggered,
        reduce_only: true,
        updated_at: chrono::Utc::now(),
    });

    let transaction = manager.place(intent()).await.unwrap();
    assert!(transaction.outcome.unwrap().is_confirmed());
    assert_eq!(api.position_size("BTC-PERPETUAL"), dec!(0.3));
}
