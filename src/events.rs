//! In-process event bus: typed events, synchronous fan-out, panic isolation.
//!
//! Delivery is synchronous to all current subscribers in subscription order.
//! A panicking handler must not abort delivery to the rest and must not
//! propagate to the emitter. No back-pressure, no persistence: handlers are
//! expected to be non-blocking, and late subscribers miss prior events.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use crate::model::{MessageRole, TaskStatus};

/// The closed set of runner events. Every payload carries the workspace id.
#[derive(Debug, Clone)]
pub enum RunnerEvent {
    TaskStatusChanged {
        workspace_id: String,
        task_id: String,
        task_summary: String,
        old_status: TaskStatus,
        new_status: TaskStatus,
    },
    TaskCommentAdded {
        workspace_id: String,
        task_id: String,
        task_summary: String,
        author_name: String,
    },
    TaskErrorOccurred {
        workspace_id: String,
        task_id: String,
        task_summary: String,
        error_message: String,
    },
    AgentExecutionStarted {
        workspace_id: String,
        task_id: String,
        task_summary: String,
        agent_name: String,
    },
    AgentExecutionFinished {
        workspace_id: String,
        task_id: String,
        task_summary: String,
        agent_name: String,
    },
    ChatMessageAdded {
        workspace_id: String,
        chat_id: String,
        chat_title: String,
        author_type: MessageRole,
    },
    ChatProcessingStarted {
        workspace_id: String,
        chat_id: String,
        chat_title: String,
        agent_name: String,
    },
    ChatProcessingFinished {
        workspace_id: String,
        chat_id: String,
        chat_title: String,
        agent_name: String,
    },
}

impl RunnerEvent {
    /// Wire name, as carried in the SSE `event:` field.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TaskStatusChanged { .. } => "task.status_changed",
            Self::TaskCommentAdded { .. } => "task.comment_added",
            Self::TaskErrorOccurred { .. } => "task.error_occurred",
            Self::AgentExecutionStarted { .. } => "agent.execution_started",
            Self::AgentExecutionFinished { .. } => "agent.execution_finished",
            Self::ChatMessageAdded { .. } => "chat.message_added",
            Self::ChatProcessingStarted { .. } => "chat.processing_started",
            Self::ChatProcessingFinished { .. } => "chat.processing_finished",
        }
    }

    /// JSON payload, camelCase keys, as carried in the SSE `data:` field.
    pub fn payload(&self) -> Value {
        match self {
            Self::TaskStatusChanged {
                workspace_id,
                task_id,
                task_summary,
                old_status,
                new_status,
            } => json!({
                "workspaceId": workspace_id,
                "taskId": task_id,
                "taskSummary": task_summary,
                "oldStatus": old_status.as_str(),
                "newStatus": new_status.as_str(),
            }),
            Self::TaskCommentAdded {
                workspace_id,
                task_id,
                task_summary,
                author_name,
            } => json!({
                "workspaceId": workspace_id,
                "taskId": task_id,
                "taskSummary": task_summary,
                "authorName": author_name,
            }),
            Self::TaskErrorOccurred {
                workspace_id,
                task_id,
                task_summary,
                error_message,
            } => json!({
                "workspaceId": workspace_id,
                "taskId": task_id,
                "taskSummary": task_summary,
                "errorMessage": error_message,
            }),
            Self::AgentExecutionStarted {
                workspace_id,
                task_id,
                task_summary,
                agent_name,
            }
            | Self::AgentExecutionFinished {
                workspace_id,
                task_id,
                task_summary,
                agent_name,
            } => json!({
                "workspaceId": workspace_id,
                "taskId": task_id,
                "taskSummary": task_summary,
                "agentName": agent_name,
            }),
            Self::ChatMessageAdded {
                workspace_id,
                chat_id,
                chat_title,
                author_type,
            } => json!({
                "workspaceId": workspace_id,
                "chatId": chat_id,
                "chatTitle": chat_title,
                "authorType": author_type.as_str(),
            }),
            Self::ChatProcessingStarted {
                workspace_id,
                chat_id,
                chat_title,
                agent_name,
            }
            | Self::ChatProcessingFinished {
                workspace_id,
                chat_id,
                chat_title,
                agent_name,
            } => json!({
                "workspaceId": workspace_id,
                "chatId": chat_id,
                "chatTitle": chat_title,
                "agentName": agent_name,
            }),
        }
    }
}

type Handler = Arc<dyn Fn(&RunnerEvent) + Send + Sync>;

struct BusState {
    next_id: u64,
    subscribers: Vec<(u64, Handler)>,
}

/// Process-wide publisher. Cheap to share via `Arc<EventBus>`; the
/// subscriber list lives behind one mutex with short lock scopes.
pub struct EventBus {
    state: Mutex<BusState>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BusState {
                next_id: 1,
                subscribers: Vec::new(),
            }),
        }
    }

    /// Register a handler; returns the id to pass to [`unsubscribe`].
    ///
    /// [`unsubscribe`]: EventBus::unsubscribe
    pub fn subscribe<F>(&self, handler: F) -> u64
    where
        F: Fn(&RunnerEvent) + Send + Sync + 'static,
    {
        let mut st = self.state.lock().expect("event bus lock");
        let id = st.next_id;
        st.next_id += 1;
        st.subscribers.push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: u64) {
        let mut st = self.state.lock().expect("event bus lock");
        st.subscribers.retain(|(sid, _)| *sid != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().expect("event bus lock").subscribers.len()
    }

    /// Deliver `event` to every current subscriber, in subscription order.
    /// The lock is released before delivery so handlers may re-enter the bus.
    pub fn emit(&self, event: RunnerEvent) {
        let handlers: Vec<Handler> = {
            let st = self.state.lock().expect("event bus lock");
            st.subscribers.iter().map(|(_, h)| Arc::clone(h)).collect()
        };
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                tracing::warn!(event = event.event_type(), "event handler panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_event() -> RunnerEvent {
        RunnerEvent::TaskCommentAdded {
            workspace_id: "ws-1".into(),
            task_id: "t-1".into(),
            task_summary: "Fix bug".into(),
            author_name: "Planner".into(),
        }
    }

    // ── Delivery order & unsubscribe ─────────────────────────────────────────

    #[test]
    fn delivers_in_subscription_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let order = Arc::clone(&order);
            bus.subscribe(move |_| order.lock().unwrap().push(tag));
        }
        bus.emit(sample_event());
        assert_eq!(*order.lock().unwrap(), ["a", "b", "c"]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let id = bus.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(sample_event());
        bus.unsubscribe(id);
        bus.emit(sample_event());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_unknown_id_is_noop() {
        let bus = EventBus::new();
        bus.unsubscribe(999);
    }

    // ── Panic isolation ──────────────────────────────────────────────────────

    #[test]
    fn panicking_handler_does_not_block_others() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        bus.subscribe(|_| panic!("boom"));
        let c = Arc::clone(&count);
        bus.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(sample_event());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        // Subscriber count unchanged by the panic.
        assert_eq!(bus.subscriber_count(), 2);
    }

    // ── Wire names & payloads ────────────────────────────────────────────────

    #[test]
    fn event_types_are_the_closed_set() {
        let event = RunnerEvent::TaskStatusChanged {
            workspace_id: "w".into(),
            task_id: "t".into(),
            task_summary: "s".into(),
            old_status: TaskStatus::Todo,
            new_status: TaskStatus::InProgress,
        };
        assert_eq!(event.event_type(), "task.status_changed");

        let event = RunnerEvent::ChatProcessingFinished {
            workspace_id: "w".into(),
            chat_id: "c".into(),
            chat_title: "t".into(),
            agent_name: "Malamar".into(),
        };
        assert_eq!(event.event_type(), "chat.processing_finished");
    }

    #[test]
    fn payloads_use_camel_case_and_carry_workspace() {
        let payload = sample_event().payload();
        assert_eq!(payload["workspaceId"], "ws-1");
        assert_eq!(payload["taskSummary"], "Fix bug");
        assert_eq!(payload["authorName"], "Planner");

        let payload = RunnerEvent::TaskStatusChanged {
            workspace_id: "w".into(),
            task_id: "t".into(),
            task_summary: "s".into(),
            old_status: TaskStatus::Todo,
            new_status: TaskStatus::InReview,
        }
        .payload();
        assert_eq!(payload["oldStatus"], "todo");
        assert_eq!(payload["newStatus"], "in_review");

        let payload = RunnerEvent::ChatMessageAdded {
            workspace_id: "w".into(),
            chat_id: "c".into(),
            chat_title: "t".into(),
            author_type: MessageRole::Agent,
        }
        .payload();
        assert_eq!(payload["authorType"], "agent");
    }

    // ── Re-entrancy ──────────────────────────────────────────────────────────

    #[test]
    fn handler_may_subscribe_during_emit() {
        let bus = Arc::new(EventBus::new());
        let b = Arc::clone(&bus);
        bus.subscribe(move |_| {
            b.subscribe(|_| {});
        });
        bus.emit(sample_event());
        assert_eq!(bus.subscriber_count(), 2);
    }
}
