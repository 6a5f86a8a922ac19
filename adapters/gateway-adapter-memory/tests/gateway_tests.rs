use boardsync::error::Error;
use boardsync::gateway_adapter::{
	ChangeEvent, GatewayAdapter, QueryFilter, QueryOptions, SortField, SubscriptionOptions,
};
use boardsync::types::Collection;
use boardsync_gateway_adapter_memory::{Fault, GatewayConfig, MemoryGateway};
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn task(id: &str, column: &str, position: f64) -> serde_json::Value {
	json!({"id": id, "title": format!("Task {}", id), "columnId": column, "position": position})
}

#[tokio::test]
async fn test_create_stamps_server_fields() {
	let gateway = MemoryGateway::default();

	let row = gateway
		.create(&Collection::Tasks, task("t1", "todo", 1.0))
		.await
		.expect("Failed to create task");

	assert_eq!(row["id"], "t1");
	assert!(row.get("createdAt").is_some_and(serde_json::Value::is_string));
	assert_eq!(gateway.row(&Collection::Tasks, "t1").await, Some(row));
}

#[tokio::test]
async fn test_create_assigns_ids() {
	let gateway = MemoryGateway::new(GatewayConfig { assign_ids: true, ..GatewayConfig::default() });

	let row = gateway
		.create(&Collection::Tasks, json!({"id": "tmp-local", "title": "Draft"}))
		.await
		.expect("Failed to create task");

	let id = row["id"].as_str().expect("id should be a string");
	assert_ne!(id, "tmp-local");
	assert!(gateway.row(&Collection::Tasks, id).await.is_some());
	assert!(gateway.row(&Collection::Tasks, "tmp-local").await.is_none());
}

#[tokio::test]
async fn test_create_rejects_invalid_rows() {
	let gateway = MemoryGateway::default();

	// Tasks require a title
	let res = gateway.create(&Collection::Tasks, json!({"id": "t1"})).await;
	assert!(matches!(res, Err(Error::RejectedChange(_))));

	gateway.create(&Collection::Tasks, task("t1", "todo", 1.0)).await.expect("Failed to create");
	let res = gateway.create(&Collection::Tasks, task("t1", "todo", 2.0)).await;
	assert!(matches!(res, Err(Error::RejectedChange(_))), "duplicate ids are rejected");
}

#[tokio::test]
async fn test_update_and_delete() {
	let gateway = MemoryGateway::default();
	gateway.seed(&Collection::Tasks, vec![task("t1", "todo", 1.0)]).await;

	let row = gateway
		.update(&Collection::Tasks, "t1", json!({"columnId": "done", "description": null}))
		.await
		.expect("Failed to update task");
	assert_eq!(row["columnId"], "done");
	assert_eq!(row["title"], "Task t1");
	assert!(row.get("updatedAt").is_some());

	let res = gateway.update(&Collection::Tasks, "missing", json!({"title": "x"})).await;
	assert_eq!(res, Err(Error::NotFound));

	gateway.delete(&Collection::Tasks, "t1").await.expect("Failed to delete task");
	assert_eq!(gateway.row_count(&Collection::Tasks).await, 0);
	assert_eq!(gateway.delete(&Collection::Tasks, "t1").await, Err(Error::NotFound));
}

#[tokio::test]
async fn test_query_filter_sort_limit() {
	let gateway = MemoryGateway::default();
	gateway
		.seed(
			&Collection::Tasks,
			vec![
				task("a", "todo", 3.0),
				task("b", "done", 1.0),
				task("c", "todo", 1.0),
				task("d", "todo", 2.0),
			],
		)
		.await;

	let rows = gateway
		.query(
			&Collection::Tasks,
			QueryOptions::new()
				.with_filter(QueryFilter::equals_one("columnId", json!("todo")))
				.with_sort(vec![SortField::desc("position")])
				.with_limit(2),
		)
		.await
		.expect("Failed to query");

	let ids: Vec<&str> = rows.iter().filter_map(|row| row["id"].as_str()).collect();
	assert_eq!(ids, vec!["a", "d"]);
}

#[tokio::test]
async fn test_injected_faults_are_consumed_in_order() {
	let gateway = MemoryGateway::default();
	gateway.fail_next(Fault::Unavailable("connection reset".into())).await;
	gateway.fail_next(Fault::Reject("permission denied".into())).await;
	gateway.fail_next(Fault::Malformed(json!({"unexpected": true}))).await;

	let res = gateway.create(&Collection::Tasks, task("t1", "todo", 1.0)).await;
	assert!(matches!(res, Err(Error::TransientFailure(_))));

	let res = gateway.create(&Collection::Tasks, task("t1", "todo", 1.0)).await;
	assert!(matches!(res, Err(Error::RejectedChange(_))));

	let res = gateway.create(&Collection::Tasks, task("t1", "todo", 1.0)).await;
	assert_eq!(res, Ok(json!({"unexpected": true})));
	assert!(gateway.row(&Collection::Tasks, "t1").await.is_none(), "malformed fault applies nothing");

	gateway.create(&Collection::Tasks, task("t1", "todo", 1.0)).await.expect("Failed to create");
}

#[tokio::test]
async fn test_hold_parks_requests_until_release() {
	let gateway = Arc::new(MemoryGateway::default());
	gateway.hold();

	let pending = tokio::spawn({
		let gateway = gateway.clone();
		async move { gateway.create(&Collection::Tasks, task("t1", "todo", 1.0)).await }
	});

	while gateway.held_requests() == 0 {
		tokio::task::yield_now().await;
	}
	assert!(gateway.row(&Collection::Tasks, "t1").await.is_none());

	gateway.release();
	let row = pending.await.expect("task panicked").expect("Failed to create");
	assert_eq!(row["id"], "t1");
	assert_eq!(gateway.held_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_latency_delays_requests() {
	let gateway = MemoryGateway::new(GatewayConfig {
		latency: Duration::from_millis(500),
		..GatewayConfig::default()
	});

	let started = tokio::time::Instant::now();
	gateway.create(&Collection::Tasks, task("t1", "todo", 1.0)).await.expect("Failed to create");
	assert!(started.elapsed() >= Duration::from_millis(500));
}

#[tokio::test]
async fn test_subscribe_replays_rows_then_ready() {
	let gateway = MemoryGateway::default();
	gateway.seed(&Collection::Tasks, vec![task("t1", "todo", 1.0), task("t2", "done", 2.0)]).await;

	let mut stream = gateway
		.subscribe(SubscriptionOptions::all(Collection::Tasks))
		.await
		.expect("Failed to subscribe");

	let first = stream.next().await.expect("stream ended").expect("stream error");
	assert_eq!(first, ChangeEvent::create(&Collection::Tasks, "t1", task("t1", "todo", 1.0)));
	let second = stream.next().await.expect("stream ended").expect("stream error");
	assert_eq!(second.id(), Some("t2"));
	let ready = stream.next().await.expect("stream ended").expect("stream error");
	assert_eq!(ready, ChangeEvent::ready(&Collection::Tasks));

	gateway.remote_delete(&Collection::Tasks, "t1").await.expect("Failed to delete");
	let deleted = stream.next().await.expect("stream ended").expect("stream error");
	assert_eq!(deleted, ChangeEvent::delete(&Collection::Tasks, "t1"));
}

#[tokio::test]
async fn test_filtered_subscription_sees_rows_leaving_the_filter() {
	let gateway = MemoryGateway::default();
	gateway.seed(&Collection::Tasks, vec![task("t1", "todo", 1.0), task("t2", "done", 1.0)]).await;

	let mut stream = gateway
		.subscribe(SubscriptionOptions::filtered(
			Collection::Tasks,
			QueryFilter::equals_one("columnId", json!("todo")),
		))
		.await
		.expect("Failed to subscribe");

	let first = stream.next().await.expect("stream ended").expect("stream error");
	assert_eq!(first.id(), Some("t1"));
	let ready = stream.next().await.expect("stream ended").expect("stream error");
	assert!(matches!(ready, ChangeEvent::Ready { .. }));

	// Not matching before or after: not delivered
	gateway
		.remote_update(&Collection::Tasks, "t2", json!({"title": "Renamed"}))
		.await
		.expect("Failed to update");
	// Leaves the filter: still delivered
	gateway
		.remote_update(&Collection::Tasks, "t1", json!({"columnId": "done"}))
		.await
		.expect("Failed to update");

	let moved = stream.next().await.expect("stream ended").expect("stream error");
	assert!(matches!(moved, ChangeEvent::Update { .. }));
	assert_eq!(moved.id(), Some("t1"));
}

#[tokio::test]
async fn test_disconnect_ends_streams_and_subscribe_failures() {
	let gateway = MemoryGateway::default();
	let mut stream = gateway
		.subscribe(SubscriptionOptions::all(Collection::Messages))
		.await
		.expect("Failed to subscribe");
	assert_eq!(gateway.subscriber_count().await, 1);

	let ready = stream.next().await.expect("stream ended").expect("stream error");
	assert!(matches!(ready, ChangeEvent::Ready { .. }));

	gateway.disconnect_all().await;
	assert!(stream.next().await.is_none());
	assert_eq!(gateway.subscriber_count().await, 0);

	gateway.fail_subscribes(1).await;
	let res = gateway.subscribe(SubscriptionOptions::all(Collection::Messages)).await;
	assert!(matches!(res, Err(Error::TransientFailure(_))));
	assert!(gateway.subscribe(SubscriptionOptions::all(Collection::Messages)).await.is_ok());
}

#[tokio::test]
async fn test_inject_bypasses_tables() {
	let gateway = MemoryGateway::default();
	let mut stream = gateway
		.subscribe(SubscriptionOptions::all(Collection::Tasks))
		.await
		.expect("Failed to subscribe");
	let _ready = stream.next().await;

	gateway.inject(&Collection::Tasks, Err(Error::MalformedResponse("garbled frame".into()))).await;
	let item = stream.next().await.expect("stream ended");
	assert!(matches!(item, Err(Error::MalformedResponse(_))));
	assert_eq!(gateway.row_count(&Collection::Tasks).await, 0);
}

// vim: ts=4
