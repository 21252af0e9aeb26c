// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lookup of the request being tracked by the current unit of work.
//!
//! Inside [`scope`] the current request is task-local, so concurrent tasks on
//! one worker thread never share it. Everywhere else it is thread-local.
//! Either way the slot is only touched by its own thread or task, which is
//! what lets [`TrackedRequest`] go without locks.

use crate::agent::AgentContext;
use crate::layer::LayerName;
use crate::tracked_request::TrackedRequest;
use std::cell::RefCell;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

type Slot = RefCell<Option<TrackedRequest>>;

thread_local! {
    static CURRENT: Slot = const { RefCell::new(None) };
}

tokio::task_local! {
    static TASK_CURRENT: Slot;
}

/// Run `fut` with its own current request.
pub async fn scope<F: Future>(fut: F) -> F::Output {
    TASK_CURRENT.scope(RefCell::new(None), fut).await
}

fn with_slot<R>(f: impl FnOnce(&Slot) -> R) -> R {
    if TASK_CURRENT.try_with(|_| ()).is_ok() {
        TASK_CURRENT.with(f)
    } else {
        CURRENT.with(f)
    }
}

fn access<R>(
    agent: Option<&Arc<AgentContext>>,
    f: impl FnOnce(&mut TrackedRequest) -> R,
) -> Option<R> {
    with_slot(|slot| {
        let Ok(mut current) = slot.try_borrow_mut() else {
            debug!("Current request is already borrowed, skipping");
            return None;
        };
        if let Some(request) = current.as_mut() {
            if request.is_stopping() && !request.is_recorded() && !std::thread::panicking() {
                request.record();
            }
        }
        if let Some(agent) = agent {
            let stale = current
                .as_ref()
                .map_or(true, |request| request.is_stopping() || request.is_recorded());
            if stale {
                *current = Some(TrackedRequest::new(Arc::clone(agent)));
            }
        }
        current.as_mut().map(f)
    })
}

/// Run `f` against the current request, starting a new one when there is
/// none or the previous one has finished.
///
/// Returns `None` when called from inside another `with_current` on the same
/// thread or task.
pub fn with_current<R>(
    agent: &Arc<AgentContext>,
    f: impl FnOnce(&mut TrackedRequest) -> R,
) -> Option<R> {
    access(Some(agent), f)
}

/// Like [`with_current`], without starting a new request.
pub fn with_existing<R>(f: impl FnOnce(&mut TrackedRequest) -> R) -> Option<R> {
    access(None, f)
}

/// Detach the current request, finished or not.
pub fn take() -> Option<TrackedRequest> {
    with_slot(|slot| slot.try_borrow_mut().ok().and_then(|mut current| current.take()))
}

/// Closes the layer opened by [`instrument`] on every exit path.
///
/// While unwinding the layer is only closed; recording runs the converters,
/// so a request finished by a panic is recorded on the next access instead.
struct LayerGuard;

impl Drop for LayerGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            with_existing(|request| {
                request.set_error();
                request.stop_layer_without_recording();
            });
        } else {
            with_existing(TrackedRequest::stop_layer);
        }
    }
}

/// Run `f` inside a new layer of the current request.
///
/// Unlike [`TrackedRequest::instrument`], the request is not borrowed while
/// `f` runs, so `f` may open nested layers through this module.
pub fn instrument<T, E>(
    agent: &Arc<AgentContext>,
    layer_type: &str,
    name: impl Into<LayerName>,
    f: impl FnOnce() -> Result<T, E>,
) -> Result<T, E> {
    let guard = with_current(agent, |request| {
        request.start_layer(layer_type, name);
        LayerGuard
    });
    let result = f();
    if result.is_err() {
        with_existing(TrackedRequest::set_error);
    }
    drop(guard);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::metric::MetricMeta;
    use crate::test_support::agent_with;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::time::Duration;

    #[test]
    fn test_same_request_until_finished() {
        let (agent, store) = agent_with(AgentConfig::default());
        with_current(&agent, |request| {
            request.web();
            request.start_layer("Controller", "users#index");
        });
        let depth = with_current(&agent, |request| {
            request.start_layer("ActiveRecord", "User/find");
            request.stop_layer();
            request.layer_count()
        });
        assert_eq!(depth, Some(1));

        with_current(&agent, TrackedRequest::stop_layer);
        assert_eq!(store.track_count(), 1);

        let fresh = with_current(&agent, |request| request.layer_count() == 0 && !request.is_recorded());
        assert_eq!(fresh, Some(true));
    }

    #[test]
    fn test_reentrant_access_is_refused() {
        let (agent, _) = agent_with(AgentConfig::default());
        let inner = with_current(&agent, |_| with_current(&agent, |_| ()));
        assert_eq!(inner, Some(None));
    }

    #[test]
    fn test_nested_instrument_builds_tree() {
        let (agent, store) = agent_with(AgentConfig::default());
        with_current(&agent, TrackedRequest::web);
        let result: Result<u32, String> = instrument(&agent, "Controller", "users#index", || {
            instrument(&agent, "ActiveRecord", "User/find", || {
                std::thread::sleep(Duration::from_millis(2));
                Ok::<_, String>(())
            })?;
            Ok(7)
        });

        assert_eq!(result, Ok(7));
        assert!(take().is_some_and(|request| request.is_recorded()));
        let metrics = store.merged_metrics();
        assert!(metrics.contains_key(&MetricMeta::new("Controller/users#index")));
        assert!(metrics.contains_key(&MetricMeta::scoped(
            "ActiveRecord/User/find",
            "Controller/users#index"
        )));
    }

    #[test]
    fn test_instrument_panic_marks_error() {
        let (agent, store) = agent_with(AgentConfig::default());
        with_current(&agent, TrackedRequest::web);
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            instrument(&agent, "Controller", "users#show", || -> Result<(), ()> {
                panic!("boom")
            })
        }));

        let payload = outcome.expect_err("panic was swallowed");
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));
        assert_eq!(store.track_count(), 0);
        assert_eq!(
            with_existing(|request| (request.is_stopping(), request.has_error())),
            Some((true, true))
        );

        with_current(&agent, |_| ());
        assert_eq!(store.track_count(), 1);
        assert!(store
            .merged_metrics()
            .contains_key(&MetricMeta::new("Errors/Controller/users#show")));
    }

    #[test]
    fn test_panic_in_nested_instrument_unwinds_through_every_layer() {
        let (agent, store) = agent_with(AgentConfig::default());
        with_current(&agent, TrackedRequest::web);
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            instrument(&agent, "Controller", "users#show", || {
                instrument(&agent, "ActiveRecord", "User/find", || -> Result<(), ()> {
                    panic!("boom")
                })
            })
        }));

        assert!(outcome.is_err());
        assert_eq!(with_existing(|request| request.layer_count()), Some(0));
        assert!(take().is_some_and(|mut request| {
            request.record();
            request.is_recorded()
        }));
        assert_eq!(store.track_count(), 1);
    }

    #[tokio::test]
    async fn test_tasks_have_their_own_request() {
        let (agent, _) = agent_with(AgentConfig::default());
        with_current(&agent, |request| {
            request.start_layer("Controller", "outside");
        });

        let task_agent = Arc::clone(&agent);
        let depth = scope(async move {
            with_current(&task_agent, |request| {
                request.start_layer("Job", "inside");
                request.start_layer("HTTP", "request");
            });
            tokio::task::yield_now().await;
            with_current(&task_agent, |request| request.layer_count())
        })
        .await;

        assert_eq!(depth, Some(2));
        assert_eq!(with_existing(|request| request.layer_count()), Some(1));
        assert!(take().is_some());
    }
}
