//! Typed task kinds dispatched through the bridge.
//!
//! Each task kind carries its own payload type. On the wire a task is a name
//! plus a JSON payload; [`Task::from_parts`] is the only way back from that
//! form, and it rejects unknown names with [`BridgeError::UnknownTask`].
//!
//! The bridge never interprets payloads or results beyond this mapping.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::BridgeError;

// =============================================================================
// Task Kind
// =============================================================================

/// Name-level identity of a task, independent of its payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskKind {
    LoadModel,
    Summarize,
    Translate,
    Classify,
    Embed,
    Transcribe,
}

impl TaskKind {
    /// All task kinds, in declaration order.
    pub const ALL: [TaskKind; 6] = [
        TaskKind::LoadModel,
        TaskKind::Summarize,
        TaskKind::Translate,
        TaskKind::Classify,
        TaskKind::Embed,
        TaskKind::Transcribe,
    ];

    /// Wire name of the task.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::LoadModel => "load_model",
            TaskKind::Summarize => "summarize",
            TaskKind::Translate => "translate",
            TaskKind::Classify => "classify",
            TaskKind::Embed => "embed",
            TaskKind::Transcribe => "transcribe",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| BridgeError::UnknownTask(s.to_string()))
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// Execution backend chosen by the capability prober.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Cpu,
    Gpu,
}

/// Loads a model into the worker ahead of the first task that needs it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoadModelInput {
    pub model_id: String,
    pub tier: String,
    #[serde(default)]
    pub backend: Backend,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SummarizeInput {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TranslateInput {
    pub text: String,
    pub source_language: String,
    pub target_language: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClassifyInput {
    pub text: String,
    pub labels: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmbedInput {
    pub texts: Vec<String>,
}

/// Mono PCM samples.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TranscribeInput {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

// =============================================================================
// Task
// =============================================================================

/// A task together with its typed payload.
#[derive(Clone, Debug, PartialEq)]
pub enum Task {
    LoadModel(LoadModelInput),
    Summarize(SummarizeInput),
    Translate(TranslateInput),
    Classify(ClassifyInput),
    Embed(EmbedInput),
    Transcribe(TranscribeInput),
}

impl Task {
    /// Shorthand for a summarize task with no length limit.
    pub fn summarize(text: impl Into<String>) -> Self {
        Task::Summarize(SummarizeInput {
            text: text.into(),
            max_length: None,
        })
    }

    /// Shorthand for a model load on the default backend.
    pub fn load_model(model_id: impl Into<String>, tier: impl Into<String>) -> Self {
        Task::LoadModel(LoadModelInput {
            model_id: model_id.into(),
            tier: tier.into(),
            backend: Backend::default(),
        })
    }

    /// Returns the task kind.
    pub fn kind(&self) -> TaskKind {
        match self {
            Task::LoadModel(_) => TaskKind::LoadModel,
            Task::Summarize(_) => TaskKind::Summarize,
            Task::Translate(_) => TaskKind::Translate,
            Task::Classify(_) => TaskKind::Classify,
            Task::Embed(_) => TaskKind::Embed,
            Task::Transcribe(_) => TaskKind::Transcribe,
        }
    }

    /// Wire name of the task.
    pub fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Serializes the payload for the wire.
    pub fn payload(&self) -> Result<Value, BridgeError> {
        let encoded = match self {
            Task::LoadModel(input) => serde_json::to_value(input),
            Task::Summarize(input) => serde_json::to_value(input),
            Task::Translate(input) => serde_json::to_value(input),
            Task::Classify(input) => serde_json::to_value(input),
            Task::Embed(input) => serde_json::to_value(input),
            Task::Transcribe(input) => serde_json::to_value(input),
        };
        encoded.map_err(|e| BridgeError::InvalidPayload {
            task: self.name().to_string(),
            reason: e.to_string(),
        })
    }

    /// Rebuilds a task from its wire name and payload.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::UnknownTask`] if `name` is not a known task kind
    /// - [`BridgeError::InvalidPayload`] if `payload` does not decode
    pub fn from_parts(name: &str, payload: Value) -> Result<Self, BridgeError> {
        let kind: TaskKind = name.parse()?;
        let invalid = |e: serde_json::Error| BridgeError::InvalidPayload {
            task: name.to_string(),
            reason: e.to_string(),
        };

        let task = match kind {
            TaskKind::LoadModel => Task::LoadModel(serde_json::from_value(payload).map_err(invalid)?),
            TaskKind::Summarize => Task::Summarize(serde_json::from_value(payload).map_err(invalid)?),
            TaskKind::Translate => Task::Translate(serde_json::from_value(payload).map_err(invalid)?),
            TaskKind::Classify => Task::Classify(serde_json::from_value(payload).map_err(invalid)?),
            TaskKind::Embed => Task::Embed(serde_json::from_value(payload).map_err(invalid)?),
            TaskKind::Transcribe => {
                Task::Transcribe(serde_json::from_value(payload).map_err(invalid)?)
            }
        };
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_names_parse_back() {
        for kind in TaskKind::ALL {
            assert_eq!(kind.as_str().parse::<TaskKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_unknown_task_name() {
        let err = "paint".parse::<TaskKind>().unwrap_err();
        assert_eq!(err, BridgeError::UnknownTask("paint".to_string()));

        let err = Task::from_parts("paint", json!({})).unwrap_err();
        assert!(matches!(err, BridgeError::UnknownTask(name) if name == "paint"));
    }

    #[test]
    fn test_from_parts_decodes_typed_payload() {
        let task = Task::from_parts(
            "translate",
            json!({"text": "hallo", "source_language": "de", "target_language": "en"}),
        )
        .unwrap();

        match task {
            Task::Translate(input) => {
                assert_eq!(input.text, "hallo");
                assert_eq!(input.target_language, "en");
            }
            other => panic!("expected translate, got {:?}", other),
        }
    }

    #[test]
    fn test_from_parts_rejects_wrong_shape() {
        let err = Task::from_parts("classify", json!({"text": "x"})).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidPayload { ref task, .. } if task == "classify"));
    }

    #[test]
    fn test_load_model_backend_defaults_to_cpu() {
        let task = Task::from_parts("load_model", json!({"model_id": "m", "tier": "small"})).unwrap();
        assert_eq!(task, Task::load_model("m", "small"));
    }

    #[test]
    fn test_payload_matches_name() {
        let task = Task::summarize("a long article");
        assert_eq!(task.name(), "summarize");
        assert_eq!(task.payload().unwrap(), json!({"text": "a long article"}));
    }

    #[test]
    fn test_backend_wire_names() {
        assert_eq!(serde_json::to_value(Backend::Gpu).unwrap(), json!("gpu"));
        assert_eq!(serde_json::to_value(Backend::Cpu).unwrap(), json!("cpu"));
    }
}
