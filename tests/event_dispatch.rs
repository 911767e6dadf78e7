//! Event Dispatch Tests
//!
//! Tests for:
//! - History bounded to the most recent 1000 events, in emission order
//! - Exactly-once delivery per subscription, wildcard included
//! - A failing handler never stops delivery to the others

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::json;
use storefront_realtime::realtime::event::{NotificationLevel, NotificationPayload, StockPayload};
use storefront_realtime::realtime::{
    Dispatcher, EventPayload, RealtimeEvent, Topic, TopicFilter, WireMessage,
};

fn stock(product: &str, stock: i64) -> RealtimeEvent {
    RealtimeEvent::new(EventPayload::ProductStockChanged(StockPayload {
        product_id: product.to_string(),
        stock,
        previous_stock: None,
    }))
}

// =============================================================================
// History
// =============================================================================

#[test]
fn test_history_keeps_most_recent_thousand() {
    let dispatcher = Dispatcher::default();

    let ids: Vec<String> = (0..1005)
        .map(|n| {
            let event = stock("p-1", n);
            let id = event.id.clone();
            dispatcher.emit(event);
            id
        })
        .collect();

    let history = dispatcher.history(None, None);
    assert_eq!(history.len(), 1000);
    assert_eq!(history[0].id, ids[5]);
    assert_eq!(history[999].id, ids[1004]);

    let last_three: Vec<String> = dispatcher
        .history(Some(Topic::Product), Some(3))
        .into_iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(last_three, ids[1002..].to_vec());

    dispatcher.clear_history();
    assert!(dispatcher.history(None, None).is_empty());
}

// =============================================================================
// Delivery
// =============================================================================

#[test]
fn test_wildcard_and_topic_subscribers_each_called_once() {
    let dispatcher = Dispatcher::default();
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    for label in ["product", "all"] {
        let seen = Arc::clone(&seen);
        let filter = if label == "all" {
            TopicFilter::All
        } else {
            TopicFilter::Topic(Topic::Product)
        };
        dispatcher.subscribe(filter, move |_| seen.lock().unwrap().push(label.to_string()));
    }

    dispatcher.emit(stock("p-1", 4));
    dispatcher.emit(RealtimeEvent::new(EventPayload::Notification(NotificationPayload {
        title: "Shipped".into(),
        message: String::new(),
        level: NotificationLevel::Success,
        link: None,
    })));

    assert_eq!(*seen.lock().unwrap(), vec!["product", "all", "all"]);
}

#[test]
fn test_failing_handler_does_not_block_others() {
    let dispatcher = Dispatcher::default();
    let delivered = Arc::new(AtomicUsize::new(0));

    dispatcher.subscribe(TopicFilter::All, |_| panic!("render crashed"));
    dispatcher.subscribe_fallible(Topic::Product, |_| Err("store rejected update".into()));
    let d = Arc::clone(&delivered);
    dispatcher.subscribe(Topic::Product, move |_| {
        d.fetch_add(1, Ordering::SeqCst);
    });

    for n in 0..3 {
        let result = dispatcher.emit(stock("p-1", n));
        assert_eq!(result.failed, 2);
    }

    assert_eq!(delivered.load(Ordering::SeqCst), 3);
    assert_eq!(dispatcher.metrics().snapshot().handler_failures, 6);
    assert_eq!(dispatcher.history(None, None).len(), 3);
}

#[test]
fn test_wire_events_keep_identity() {
    let dispatcher = Dispatcher::default();

    let message = WireMessage::new(
        "product",
        "product.price_changed",
        json!({"productId": "p-9", "price": 19.5, "previousPrice": 24.0}),
    )
    .with_identity(Some("admin".into()), Some("s-admin".into()));
    let id = message.id.clone();

    dispatcher.handle_wire_message(message).unwrap();

    let event = dispatcher.history(None, None).pop().unwrap();
    assert_eq!(event.id, id);
    assert_eq!(event.user_id.as_deref(), Some("admin"));
    match event.payload {
        EventPayload::ProductPriceChanged(p) => {
            assert_eq!(p.product_id, "p-9");
            assert_eq!(p.previous_price, Some(24.0));
        }
        other => panic!("unexpected payload: {:?}", other),
    }
}

#[test]
fn test_unknown_topic_dropped() {
    let dispatcher = Dispatcher::default();
    let result = dispatcher.handle_raw_message(r#"{"type":"basket","event":"basket.updated","data":{}}"#);

    assert!(result.is_none());
    assert!(dispatcher.history(None, None).is_empty());
    assert_eq!(dispatcher.metrics().snapshot().parse_failures, 1);
}
