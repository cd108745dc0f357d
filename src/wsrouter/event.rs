//! Event schema: the closed `EventType` set, [`BusinessEvent`] variants, and
//! envelope construction.
//!
//! Runtime type-string switching is replaced with a tagged variant:
//! [`BusinessEvent`] is a closed enum and its
//! [`fields`](BusinessEvent::fields) method is the only place that knows
//! each variant's required business fields. This mirrors the
//! `AgentEvent`/`OrchestrationEvent` shape in `cloudllm::event` — one enum
//! per family, every variant self-describing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The closed set of event types this core ever routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AgentStarted,
    AgentThinking,
    ToolExecuting,
    ToolCompleted,
    AgentCompleted,
    ProgressUpdate,
    Error,
    /// Transport-level, not part of the five-type critical golden set.
    ConnectionStatus,
}

/// A single business event an agent emits, carrying exactly the fields its
/// event type requires.
///
/// The five non-`Error`/`ConnectionStatus` variants make up the critical
/// event set: reliable delivery of these is what
/// [`Bridge`](crate::wsrouter::bridge::Bridge) and
/// [`ConnectionManager`](crate::wsrouter::connection_manager::ConnectionManager)
/// exist to guarantee.
#[derive(Debug, Clone)]
pub enum BusinessEvent {
    AgentStarted {
        user_id: String,
        thread_id: String,
        agent_name: String,
    },
    AgentThinking {
        reasoning: String,
        agent_name: String,
        step_number: Option<u64>,
    },
    ToolExecuting {
        tool_name: String,
        tool_args: Value,
        execution_id: String,
    },
    ToolCompleted {
        tool_name: String,
        results: Value,
        execution_time: f64,
    },
    AgentCompleted {
        status: String,
        final_response: String,
        duration_ms: Option<u64>,
    },
    ProgressUpdate {
        percentage: f64,
        message: String,
    },
    Error {
        error_code: String,
        message: String,
    },
    ConnectionStatus {
        status: String,
    },
}

impl BusinessEvent {
    /// The `EventType` tag for this variant.
    pub fn event_type(&self) -> EventType {
        match self {
            BusinessEvent::AgentStarted { .. } => EventType::AgentStarted,
            BusinessEvent::AgentThinking { .. } => EventType::AgentThinking,
            BusinessEvent::ToolExecuting { .. } => EventType::ToolExecuting,
            BusinessEvent::ToolCompleted { .. } => EventType::ToolCompleted,
            BusinessEvent::AgentCompleted { .. } => EventType::AgentCompleted,
            BusinessEvent::ProgressUpdate { .. } => EventType::ProgressUpdate,
            BusinessEvent::Error { .. } => EventType::Error,
            BusinessEvent::ConnectionStatus { .. } => EventType::ConnectionStatus,
        }
    }

    /// Whether this event belongs to the five-type critical golden set.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            BusinessEvent::AgentStarted { .. }
                | BusinessEvent::AgentThinking { .. }
                | BusinessEvent::ToolExecuting { .. }
                | BusinessEvent::ToolCompleted { .. }
                | BusinessEvent::AgentCompleted { .. }
        )
    }

    /// Required business fields for this variant, hoisted to the envelope
    /// root. This is the only function in the crate that knows each event
    /// type's field names.
    fn fields(&self) -> Map<String, Value> {
        let mut map = Map::new();
        match self {
            BusinessEvent::AgentStarted { user_id, thread_id, agent_name } => {
                map.insert("user_id".into(), Value::String(user_id.clone()));
                map.insert("thread_id".into(), Value::String(thread_id.clone()));
                map.insert("agent_name".into(), Value::String(agent_name.clone()));
            }
            BusinessEvent::AgentThinking { reasoning, agent_name, step_number } => {
                map.insert("reasoning".into(), Value::String(reasoning.clone()));
                map.insert("agent_name".into(), Value::String(agent_name.clone()));
                if let Some(step) = step_number {
                    map.insert("step_number".into(), Value::from(*step));
                }
            }
            BusinessEvent::ToolExecuting { tool_name, tool_args, execution_id } => {
                map.insert("tool_name".into(), Value::String(tool_name.clone()));
                map.insert("tool_args".into(), tool_args.clone());
                map.insert("execution_id".into(), Value::String(execution_id.clone()));
            }
            BusinessEvent::ToolCompleted { tool_name, results, execution_time } => {
                map.insert("tool_name".into(), Value::String(tool_name.clone()));
                map.insert("results".into(), results.clone());
                map.insert(
                    "execution_time".into(),
                    Value::from(*execution_time),
                );
            }
            BusinessEvent::AgentCompleted { status, final_response, duration_ms } => {
                map.insert("status".into(), Value::String(status.clone()));
                map.insert("final_response".into(), Value::String(final_response.clone()));
                if let Some(duration) = duration_ms {
                    map.insert("duration_ms".into(), Value::from(*duration));
                }
            }
            BusinessEvent::ProgressUpdate { percentage, message } => {
                let mut progress = Map::new();
                progress.insert("percentage".into(), Value::from(*percentage));
                progress.insert("message".into(), Value::String(message.clone()));
                map.insert("progress".into(), Value::Object(progress));
            }
            BusinessEvent::Error { error_code, message } => {
                map.insert("error_code".into(), Value::String(error_code.clone()));
                map.insert("message".into(), Value::String(message.clone()));
            }
            BusinessEvent::ConnectionStatus { status } => {
                map.insert("status".into(), Value::String(status.clone()));
            }
        }
        map
    }
}

/// The JSON object actually sent to a connection.
///
/// `type`, `timestamp`, and the event's business fields all live at the
/// root — `#[serde(flatten)]` is what enforces that at the type level,
/// since there is no `data`/`payload` field to wrap them in.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub critical: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Routing identifiers to stamp onto an envelope. All optional: a
/// `ConnectionStatus` event, for instance, may carry none of them.
#[derive(Debug, Clone, Default)]
pub struct RoutingIds {
    pub run_id: Option<String>,
    pub thread_id: Option<String>,
    pub user_id: Option<String>,
}

/// Build the outbound envelope for `event`, stamping the supplied routing
/// identifiers at the root.
pub fn build_envelope(event: BusinessEvent, routing: RoutingIds) -> Envelope {
    let critical = event.is_critical();
    let event_type = event.event_type();
    let fields = event.fields();
    Envelope {
        event_type,
        timestamp: Utc::now(),
        critical,
        run_id: routing.run_id,
        thread_id: routing.thread_id,
        user_id: routing.user_id,
        fields,
    }
}
