//! Online status and typing indicators, one row per user.

use serde_json::{Value, json};

use boardsync_types::gateway_adapter::SubscriptionOptions;
use boardsync_types::model::{Presence, PresenceStatus};

use crate::prelude::*;
use crate::session::Session;

#[derive(Debug, Clone)]
pub struct PresenceStore {
	session: Session,
	user_id: Box<str>,
}

impl PresenceStore {
	pub fn new(session: Session, user_id: impl Into<Box<str>>) -> Self {
		Self { session, user_id: user_id.into() }
	}

	/// Subscribe to everyone's presence and wait for the initial rows.
	pub async fn load(&self) -> SyncResult<()> {
		self.session.subscribe_ready(SubscriptionOptions::all(Collection::Presence)).await?;
		Ok(())
	}

	pub fn set_status(&self, status: PresenceStatus) -> SyncResult<MutationHandle> {
		self.upsert(json!({"status": status, "lastSeen": now()}))
	}

	/// Mark the user as typing in `channel_id`, or clear the indicator with `None`.
	pub fn set_typing(&self, channel_id: Option<&str>) -> SyncResult<MutationHandle> {
		self.upsert(json!({"typingIn": channel_id, "lastSeen": now()}))
	}

	/// Users currently online, sorted.
	pub fn online_users(&self) -> SyncResult<Vec<String>> {
		let mut users = Vec::new();
		for entity in self.session.cache().snapshot(&Collection::Presence) {
			let presence: Presence = entity.decode()?;
			if presence.status == PresenceStatus::Online {
				users.push(presence.id);
			}
		}
		users.sort();
		Ok(users)
	}

	/// A user with no presence row is offline.
	pub fn status_of(&self, user_id: &str) -> SyncResult<PresenceStatus> {
		match self.session.record::<Presence>(&Collection::Presence, &EntityId::from(user_id)) {
			Ok(presence) => Ok(presence.status),
			Err(Error::NotFound) => Ok(PresenceStatus::Offline),
			Err(err) => Err(err),
		}
	}

	/// Patch the user's row, creating it (online) on first use.
	fn upsert(&self, fields: Value) -> SyncResult<MutationHandle> {
		let id = EntityId::from(&*self.user_id);
		let engine = self.session.engine();
		if self.session.cache().contains(&Collection::Presence, &id) {
			return engine.patch(Collection::Presence, id, fields);
		}

		let mut row = json!({"id": &*self.user_id, "status": PresenceStatus::Online});
		if let (Some(row), Value::Object(fields)) = (row.as_object_mut(), fields) {
			for (key, value) in fields {
				if !value.is_null() {
					row.insert(key, value);
				}
			}
		}
		engine.create(Collection::Presence, row)
	}
}

// vim: ts=4
