use boardsync::error::Error;
use boardsync::model::PresenceStatus;
use boardsync::types::Collection;
use boardsync::store::SubscriptionState;
use boardsync::{Session, SessionBuilder, SessionConfig};
use boardsync_gateway_adapter_memory::{Fault, GatewayConfig, MemoryGateway};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn start_session(gateway: &Arc<MemoryGateway>) -> Session {
	let mut builder = SessionBuilder::new();
	builder.gateway(gateway.clone()).config(SessionConfig {
		reconnect_initial_delay: Duration::from_millis(10),
		reconnect_max_delay: Duration::from_millis(50),
		..SessionConfig::default()
	});
	builder.build().expect("Failed to build session")
}

async fn seeded_gateway() -> Arc<MemoryGateway> {
	let gateway = Arc::new(MemoryGateway::new(GatewayConfig::default()));
	gateway
		.seed(
			&Collection::Messages,
			vec![
				json!({"id": "m2", "channelId": "general", "userId": "bob", "content": "hi alice",
					"createdAt": "2024-01-01T10:01:00Z"}),
				json!({"id": "m1", "channelId": "general", "userId": "alice", "content": "hi",
					"createdAt": "2024-01-01T10:00:00Z"}),
				json!({"id": "m3", "channelId": "random", "userId": "bob", "content": "lunch?",
					"createdAt": "2024-01-01T09:00:00Z"}),
			],
		)
		.await;
	gateway
}

/// Poll until `cond` holds, failing the test after a few seconds.
async fn eventually(cond: impl Fn() -> bool) {
	tokio::time::timeout(Duration::from_secs(5), async {
		while !cond() {
			tokio::time::sleep(Duration::from_millis(1)).await;
		}
	})
	.await
	.expect("condition not reached in time");
}

fn contents(chat: &boardsync::ChatStore, channel: &str) -> Vec<String> {
	chat.messages(channel)
		.expect("Failed to read messages")
		.into_iter()
		.map(|message| message.content)
		.collect()
}

#[tokio::test]
async fn test_open_channel_loads_history_in_order() {
	let gateway = seeded_gateway().await;
	let session = start_session(&gateway);
	let chat = session.chat("alice");

	chat.open_channel("general").await.expect("Failed to open channel");
	assert_eq!(contents(&chat, "general"), vec!["hi", "hi alice"]);
	assert!(contents(&chat, "random").is_empty(), "other channels are not loaded");
	assert_eq!(chat.open_channels(), vec![Box::from("general")]);
}

#[tokio::test]
async fn test_open_channel_twice_reuses_subscription() {
	let gateway = seeded_gateway().await;
	let session = start_session(&gateway);
	let chat = session.chat("alice");

	let first = chat.open_channel("general").await.expect("Failed to open channel");
	let second = chat.open_channel("general").await.expect("Failed to open channel");
	assert!(Arc::ptr_eq(&first, &second));
	assert_eq!(gateway.subscriber_count().await, 1);
}

#[tokio::test]
async fn test_send_message() {
	let gateway = seeded_gateway().await;
	let session = start_session(&gateway);
	let chat = session.chat("alice");
	chat.open_channel("general").await.expect("Failed to open channel");

	assert!(matches!(chat.send_message("general", "   "), Err(Error::RejectedChange(_))));
	assert_eq!(session.engine().pending_count(), 0);

	let handle = chat.send_message("general", " how are you? ").expect("Failed to send");
	assert_eq!(contents(&chat, "general"), vec!["hi", "hi alice", "how are you?"]);

	let entity = handle.settle().await.expect("Failed to settle").expect("row");
	assert!(gateway.row(&Collection::Messages, entity.id().as_str()).await.is_some());
	eventually(|| chat.messages("general").is_ok_and(|messages| messages.len() == 3)).await;
}

#[tokio::test]
async fn test_failed_send_is_removed() {
	let gateway = seeded_gateway().await;
	let session = start_session(&gateway);
	let chat = session.chat("alice");
	chat.open_channel("general").await.expect("Failed to open channel");

	gateway.fail_next(Fault::Unavailable("offline".into())).await;
	let handle = chat.send_message("general", "are you there?").expect("Failed to send");
	assert_eq!(contents(&chat, "general").len(), 3);

	let err = handle.settle().await.expect_err("send should fail");
	assert!(err.is_retryable());
	assert_eq!(contents(&chat, "general"), vec!["hi", "hi alice"]);
}

#[tokio::test]
async fn test_edit_and_delete_own_messages_only() {
	let gateway = seeded_gateway().await;
	let session = start_session(&gateway);
	let chat = session.chat("alice");
	chat.open_channel("general").await.expect("Failed to open channel");

	assert!(matches!(chat.edit_message("m2", "hijacked"), Err(Error::RejectedChange(_))));
	assert!(matches!(chat.delete_message("m2"), Err(Error::RejectedChange(_))));
	assert!(matches!(chat.edit_message("m1", ""), Err(Error::RejectedChange(_))));

	chat.edit_message("m1", "hello").expect("Failed to edit").settle().await.expect("Failed to settle");
	let messages = chat.messages("general").expect("messages");
	assert_eq!(messages[0].content, "hello");
	assert!(messages[0].edited_at.is_some());

	chat.delete_message("m1").expect("Failed to delete").settle().await.expect("Failed to settle");
	assert_eq!(contents(&chat, "general"), vec!["hi alice"]);
	assert!(gateway.row(&Collection::Messages, "m1").await.is_none());
}

#[tokio::test]
async fn test_close_channel_stops_updates() {
	let gateway = seeded_gateway().await;
	let session = start_session(&gateway);
	let chat = session.chat("alice");
	let handle = chat.open_channel("general").await.expect("Failed to open channel");

	gateway
		.remote_create(
			&Collection::Messages,
			json!({"id": "m4", "channelId": "general", "userId": "bob", "content": "still here?"}),
		)
		.await
		.expect("Failed to create");
	eventually(|| chat.messages("general").is_ok_and(|messages| messages.len() == 3)).await;

	chat.close_channel("general");
	assert!(chat.open_channels().is_empty());
	assert_eq!(session.feed().active_handles(), 0);
	handle.wait_for(SubscriptionState::Closed).await.expect("handle did not close");

	gateway
		.remote_create(
			&Collection::Messages,
			json!({"id": "m5", "channelId": "general", "userId": "bob", "content": "bye"}),
		)
		.await
		.expect("Failed to create");
	tokio::time::sleep(Duration::from_millis(20)).await;
	assert_eq!(contents(&chat, "general").len(), 3, "cached history stays, new messages do not arrive");
}

#[tokio::test]
async fn test_closing_shared_channel_keeps_it_open_for_others() {
	let gateway = seeded_gateway().await;
	let session = start_session(&gateway);
	let alice = session.chat("alice");
	let bob = session.chat("bob");
	let first = alice.open_channel("general").await.expect("Failed to open channel");
	let second = bob.open_channel("general").await.expect("Failed to open channel");
	assert!(Arc::ptr_eq(&first, &second));

	alice.close_channel("general");
	assert!(alice.open_channels().is_empty());
	assert_eq!(bob.open_channels(), vec![Box::from("general")]);
	assert_eq!(session.feed().active_handles(), 1);
	assert_eq!(second.state(), SubscriptionState::Active);

	gateway
		.remote_create(
			&Collection::Messages,
			json!({"id": "m4", "channelId": "general", "userId": "carol", "content": "anyone?",
				"createdAt": "2024-01-01T10:02:00Z"}),
		)
		.await
		.expect("Failed to create");
	eventually(|| bob.messages("general").is_ok_and(|messages| messages.len() == 3)).await;

	bob.close_channel("general");
	second.wait_for(SubscriptionState::Closed).await.expect("handle did not close");
	assert_eq!(session.feed().active_handles(), 0);
}

#[tokio::test]
async fn test_presence() {
	let gateway = seeded_gateway().await;
	gateway
		.seed(&Collection::Presence, vec![json!({"id": "bob", "status": "away"})])
		.await;
	let session = start_session(&gateway);
	let presence = session.presence("alice");
	presence.load().await.expect("Failed to load presence");

	assert_eq!(presence.status_of("bob"), Ok(PresenceStatus::Away));
	assert_eq!(presence.status_of("alice"), Ok(PresenceStatus::Offline));
	assert_eq!(presence.online_users(), Ok(Vec::new()));

	// First use creates the row
	let handle = presence.set_typing(Some("general")).expect("Failed to set typing");
	assert_eq!(presence.status_of("alice"), Ok(PresenceStatus::Online));
	handle.settle().await.expect("Failed to settle");
	let row = gateway.row(&Collection::Presence, "alice").await.expect("row");
	assert_eq!(row["typingIn"], "general");

	presence.set_typing(None).expect("Failed to clear typing").settle().await.expect("Failed to settle");
	let row = gateway.row(&Collection::Presence, "alice").await.expect("row");
	assert!(row.get("typingIn").is_none());

	gateway
		.remote_update(&Collection::Presence, "bob", json!({"status": "online"}))
		.await
		.expect("Failed to update");
	eventually(|| presence.online_users().is_ok_and(|users| users.len() == 2)).await;
	assert_eq!(presence.online_users(), Ok(vec!["alice".to_string(), "bob".to_string()]));

	presence.set_status(PresenceStatus::Offline).expect("Failed to set status").settle().await.expect("Failed to settle");
	assert_eq!(presence.online_users(), Ok(vec!["bob".to_string()]));
}

// vim: ts=4
