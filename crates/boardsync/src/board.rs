//! Kanban board: columns of one board and the tasks in them.

use serde_json::{Value, json};
use std::cmp::Ordering;

use boardsync_types::gateway_adapter::{QueryFilter, SubscriptionOptions};
use boardsync_types::model::{Column, Task};

use crate::prelude::*;
use crate::session::{COLUMNS_BY_BOARD, Session, TASKS_BY_COLUMN};

#[derive(Debug, Clone)]
pub struct BoardStore {
	session: Session,
	board_id: Box<str>,
}

impl BoardStore {
	pub fn new(session: Session, board_id: impl Into<Box<str>>) -> Self {
		Self { session, board_id: board_id.into() }
	}

	pub fn board_id(&self) -> &str {
		&self.board_id
	}

	/// Subscribe to the board's columns and to tasks, and wait for the initial rows.
	pub async fn load(&self) -> SyncResult<()> {
		// Tasks carry no board id, only their column's
		let columns = SubscriptionOptions::filtered(
			Collection::Columns,
			QueryFilter::equals_one("boardId", Value::from(&*self.board_id)),
		);
		self.session.subscribe_ready(columns).await?;
		self.session.subscribe_ready(SubscriptionOptions::all(Collection::Tasks)).await?;
		info!(
			"board {} loaded: {} columns",
			self.board_id,
			self.session.cache().index_members(COLUMNS_BY_BOARD, &self.board_id).len()
		);
		Ok(())
	}

	/// Columns of this board, ordered by position.
	pub fn columns(&self) -> SyncResult<Vec<Column>> {
		let mut columns: Vec<Column> =
			self.session.indexed(&Collection::Columns, COLUMNS_BY_BOARD, &self.board_id)?;
		columns.sort_by(|a, b| by_position(a.position, &a.id, b.position, &b.id));
		Ok(columns)
	}

	/// Tasks of a column, ordered by position.
	pub fn tasks_in_column(&self, column_id: &str) -> SyncResult<Vec<Task>> {
		let column_id = self.session.cache().resolve(&Collection::Columns, &EntityId::from(column_id));
		let mut tasks: Vec<Task> =
			self.session.indexed(&Collection::Tasks, TASKS_BY_COLUMN, column_id.as_str())?;
		tasks.sort_by(|a, b| by_position(a.position, &a.id, b.position, &b.id));
		Ok(tasks)
	}

	pub fn task(&self, id: &str) -> SyncResult<Task> {
		self.session.record(&Collection::Tasks, &EntityId::from(id))
	}

	pub fn column(&self, id: &str) -> SyncResult<Column> {
		self.session.record(&Collection::Columns, &EntityId::from(id))
	}

	// Columns

	/// Append a column after the last one.
	pub fn create_column(&self, title: &str) -> SyncResult<MutationHandle> {
		let position = next_position(self.columns()?.iter().map(|column| column.position));
		self.session.engine().create(
			Collection::Columns,
			json!({"title": title, "boardId": &*self.board_id, "position": position}),
		)
	}

	pub fn rename_column(&self, id: &str, title: &str) -> SyncResult<MutationHandle> {
		self.session.engine().patch(Collection::Columns, id, json!({"title": title}))
	}

	/// Delete an empty column. A column that still holds tasks is rejected locally.
	pub fn delete_column(&self, id: &str) -> SyncResult<MutationHandle> {
		let column_id = self.confirmed_column(id)?;
		let tasks = self.session.cache().index_members(TASKS_BY_COLUMN, column_id.as_str());
		if !tasks.is_empty() {
			return Err(Error::RejectedChange(format!(
				"column {} still holds {} tasks",
				column_id,
				tasks.len()
			)));
		}
		self.session.engine().delete(Collection::Columns, column_id)
	}

	// Tasks

	/// Append a task at the bottom of a column.
	pub fn create_task(&self, column_id: &str, title: &str) -> SyncResult<MutationHandle> {
		let column_id = self.confirmed_column(column_id)?;
		let position =
			next_position(self.tasks_in_column(column_id.as_str())?.iter().map(|task| task.position));
		self.session.engine().create(
			Collection::Tasks,
			json!({"title": title, "columnId": column_id.as_str(), "position": position}),
		)
	}

	/// Patch task fields (`title`, `description`, `assigneeId`, ...). `null` clears.
	pub fn update_task(&self, id: &str, fields: Value) -> SyncResult<MutationHandle> {
		self.session.engine().patch(Collection::Tasks, id, fields)
	}

	/// Move a task to `position` in `column_id` (possibly the column it is in).
	pub fn move_task(&self, id: &str, column_id: &str, position: f64) -> SyncResult<MutationHandle> {
		let column_id = self.confirmed_column(column_id)?;
		self.session.engine().patch(
			Collection::Tasks,
			id,
			json!({"columnId": column_id.as_str(), "position": position}),
		)
	}

	pub fn delete_task(&self, id: &str) -> SyncResult<MutationHandle> {
		self.session.engine().delete(Collection::Tasks, id)
	}

	/// Resolve a column id that tasks can reference: cached, and known to the server.
	fn confirmed_column(&self, id: &str) -> SyncResult<EntityId> {
		let cache = self.session.cache();
		let id = cache.resolve(&Collection::Columns, &EntityId::from(id));
		if id.is_temporary() || !cache.contains(&Collection::Columns, &id) {
			return Err(Error::StaleEntity { collection: Collection::Columns, id });
		}
		Ok(id)
	}
}

fn by_position(a_pos: f64, a_id: &str, b_pos: f64, b_id: &str) -> Ordering {
	a_pos.total_cmp(&b_pos).then_with(|| a_id.cmp(b_id))
}

fn next_position(positions: impl Iterator<Item = f64>) -> f64 {
	positions.fold(0.0, f64::max) + 1.0
}


// vim: ts=4
