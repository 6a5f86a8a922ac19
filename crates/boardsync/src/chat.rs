//! Chat messages, grouped by channel.

use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;

use boardsync_types::gateway_adapter::{QueryFilter, SubscriptionOptions};
use boardsync_types::model::Message;

use crate::prelude::*;
use crate::session::{MESSAGES_BY_CHANNEL, Session};

/// Chat as seen by one user: messages are sent, edited and deleted on their behalf.
#[derive(Debug, Clone)]
pub struct ChatStore {
	session: Session,
	user_id: Box<str>,
	channels: Arc<Mutex<HashMap<Box<str>, Arc<SubscriptionHandle>>>>,
}

impl ChatStore {
	pub fn new(session: Session, user_id: impl Into<Box<str>>) -> Self {
		Self { session, user_id: user_id.into(), channels: Arc::new(Mutex::new(HashMap::new())) }
	}

	pub fn user_id(&self) -> &str {
		&self.user_id
	}

	/// Subscribe to a channel's messages and wait for the history to load. Opening a
	/// channel twice reuses the subscription; other stores sharing it keep it open.
	pub async fn open_channel(&self, channel_id: &str) -> SyncResult<Arc<SubscriptionHandle>> {
		let handle = {
			let mut channels = self.channels.lock();
			let open = channels.get(channel_id).filter(|handle| !handle.is_closed()).cloned();
			match open {
				Some(handle) => handle,
				None => {
					let opts = SubscriptionOptions::filtered(
						Collection::Messages,
						QueryFilter::equals_one("channelId", Value::from(channel_id)),
					);
					let handle = self.session.feed().subscribe(opts);
					channels.insert(channel_id.into(), Arc::clone(&handle));
					handle
				}
			}
		};
		if let Err(err) = self.session.wait_ready(&handle).await {
			self.close_channel(channel_id);
			return Err(err);
		}
		debug!("channel {} open for {}", channel_id, self.user_id);
		Ok(handle)
	}

	/// Stop receiving a channel's messages. Cached messages stay readable.
	pub fn close_channel(&self, channel_id: &str) {
		let handle = self.channels.lock().remove(channel_id);
		if let Some(handle) = handle {
			self.session.feed().unsubscribe(&handle);
			debug!("channel {} closed for {}", channel_id, self.user_id);
		}
	}

	pub fn open_channels(&self) -> Vec<Box<str>> {
		let mut channels: Vec<Box<str>> = self.channels.lock().keys().cloned().collect();
		channels.sort();
		channels
	}

	/// Messages of a channel, oldest first (by `createdAt`, then id).
	pub fn messages(&self, channel_id: &str) -> SyncResult<Vec<Message>> {
		let mut messages: Vec<Message> =
			self.session.indexed(&Collection::Messages, MESSAGES_BY_CHANNEL, channel_id)?;
		messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
		Ok(messages)
	}

	pub fn send_message(&self, channel_id: &str, content: &str) -> SyncResult<MutationHandle> {
		let content = non_empty(content)?;
		self.session.engine().create(
			Collection::Messages,
			json!({
				"channelId": channel_id,
				"userId": &*self.user_id,
				"content": content,
				"createdAt": now(),
			}),
		)
	}

	pub fn edit_message(&self, id: &str, content: &str) -> SyncResult<MutationHandle> {
		let content = non_empty(content)?;
		self.check_author(id)?;
		self.session.engine().patch(
			Collection::Messages,
			id,
			json!({"content": content, "editedAt": now()}),
		)
	}

	pub fn delete_message(&self, id: &str) -> SyncResult<MutationHandle> {
		self.check_author(id)?;
		self.session.engine().delete(Collection::Messages, id)
	}

	/// Only the author may change a message. Unknown messages are left to the engine.
	fn check_author(&self, id: &str) -> SyncResult<()> {
		match self.session.record::<Message>(&Collection::Messages, &EntityId::from(id)) {
			Ok(message) if message.user_id != *self.user_id => Err(Error::RejectedChange(format!(
				"message {} belongs to {}",
				id, message.user_id
			))),
			Ok(_) | Err(Error::NotFound) => Ok(()),
			Err(err) => Err(err),
		}
	}
}

fn non_empty(content: &str) -> SyncResult<&str> {
	let content = content.trim();
	if content.is_empty() {
		return Err(Error::RejectedChange("message content is empty".into()));
	}
	Ok(content)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_non_empty() {
		assert_eq!(non_empty("  hi ").ok(), Some("hi"));
		assert!(matches!(non_empty(" \n\t"), Err(Error::RejectedChange(_))));
	}
}

// vim: ts=4
