//! Structured task scoping.
//!
//! A scope ties the lifetimes of related tasks together: if any spawned task fails or
//! panics, every other task in the scope is cancelled and the error is propagated to the
//! caller of [task_scope]. When the scoped future itself completes, outstanding tasks are
//! cancelled and its result is returned.

use std::future::Future;

use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use tokio::{
	sync::mpsc,
	task::{JoinError, JoinSet},
};

type TaskFuture = BoxFuture<'static, Result<()>>;

/// Handle through which tasks are spawned into a scope.
#[derive(Clone)]
pub struct Scope {
	spawner: mpsc::UnboundedSender<TaskFuture>,
}

impl Scope {
	/// Spawn a task into the scope. The task's error, if any, tears the whole scope down.
	///
	/// Tasks spawned after the scope has begun shutting down are silently dropped.
	pub fn spawn(&self, task: impl Future<Output = Result<()>> + Send + 'static) {
		let _ = self.spawner.send(Box::pin(task));
	}
}

fn into_scope_error(join_error: JoinError) -> anyhow::Error {
	if join_error.is_panic() {
		anyhow!("scoped task panicked: {join_error}")
	} else {
		anyhow!("scoped task cancelled: {join_error}")
	}
}

/// Run `scoped_fn` with a [Scope] it can spawn tasks into, driving those tasks alongside
/// the returned future until either completes the scope.
pub async fn task_scope<T, Fut, F>(scoped_fn: F) -> Result<T>
where
	Fut: Future<Output = Result<T>> + Send,
	F: FnOnce(Scope) -> Fut,
{
	let (spawner, mut new_tasks) = mpsc::unbounded_channel::<TaskFuture>();
	let scope = Scope { spawner };

	let mut join_set: JoinSet<Result<()>> = JoinSet::new();
	let root = scoped_fn(scope);
	tokio::pin!(root);

	let result = loop {
		tokio::select! {
			root_result = &mut root => break root_result,
			Some(task) = new_tasks.recv() => {
				join_set.spawn(task);
			},
			Some(task_result) = join_set.join_next() => {
				match task_result {
					Ok(Ok(())) => {},
					Ok(Err(error)) => break Err(error),
					Err(join_error) => break Err(into_scope_error(join_error)),
				}
			},
		}
	};

	join_set.shutdown().await;
	result
}
