//! Logger plumbing for embedding the engine.
//!
//! The engine logs through `tracing` macros. Callers that run more than one
//! engine in a process can give each its own [`Dispatch`] and route every
//! operation of that engine through it.

use tracing::subscriber::NoSubscriber;
use tracing::Dispatch;

/// A dispatcher that drops every event.
pub fn discard() -> Dispatch {
    Dispatch::new(NoSubscriber::default())
}

/// The dispatcher currently in effect on this thread.
pub fn current() -> Dispatch {
    tracing::dispatcher::get_default(|d| d.clone())
}

/// Run `f` with `dispatch` as the thread's default dispatcher.
pub fn scoped<T>(dispatch: &Dispatch, f: impl FnOnce() -> T) -> T {
    tracing::dispatcher::with_default(dispatch, f)
}
