//! Lightweight in-process task handler used by `sidecar run`.
//!
//! Produces deterministic stand-in results for every task kind so the
//! bridge (queueing, progress, timeouts, cancellation) can be exercised
//! end to end without model weights.

use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use sidecar::bridge::{ProgressReporter, Task, TaskHandler};
use tokio_util::sync::CancellationToken;

/// Simulated model size streamed by `load_model`.
const SIMULATED_MODEL_BYTES: u64 = 64 * 1024 * 1024;
const LOAD_STEPS: u64 = 16;
const STEP_DELAY: Duration = Duration::from_millis(60);

/// Dimensions of demo embeddings.
const EMBEDDING_DIMS: usize = 8;

#[derive(Debug, Default)]
pub struct DemoHandler;

impl TaskHandler for DemoHandler {
    fn handle<'a>(
        &'a self,
        task: Task,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<Value, String>> {
        Box::pin(async move {
            match task {
                Task::LoadModel(input) => {
                    let chunk = SIMULATED_MODEL_BYTES / LOAD_STEPS;
                    for step in 1..=LOAD_STEPS {
                        tokio::select! {
                            _ = tokio::time::sleep(STEP_DELAY) => {}
                            _ = cancel.cancelled() => return Err("load cancelled".to_string()),
                        }
                        progress.report_bytes(
                            step * chunk,
                            SIMULATED_MODEL_BYTES,
                            "downloading",
                            &input.model_id,
                        );
                    }
                    Ok(json!({
                        "model_id": input.model_id,
                        "tier": input.tier,
                        "backend": input.backend,
                    }))
                }
                Task::Summarize(input) => {
                    progress.report(50.0, "summarizing", "");
                    let limit = input.max_length.unwrap_or(24) as usize;
                    let summary: Vec<&str> = input.text.split_whitespace().take(limit).collect();
                    Ok(json!({ "summary": summary.join(" ") }))
                }
                Task::Translate(input) => Ok(json!({
                    "translation": input.text,
                    "source_language": input.source_language,
                    "target_language": input.target_language,
                })),
                Task::Classify(input) => {
                    if input.labels.is_empty() {
                        return Err("at least one label is required".to_string());
                    }
                    let text = input.text.to_lowercase();
                    let scores: Vec<Value> = input
                        .labels
                        .iter()
                        .map(|label| {
                            let hits = text.matches(&label.to_lowercase()).count();
                            json!({ "label": label, "score": hits })
                        })
                        .collect();
                    Ok(json!({ "scores": scores }))
                }
                Task::Embed(input) => {
                    let vectors: Vec<Vec<f32>> =
                        input.texts.iter().map(|text| embed(text)).collect();
                    Ok(json!({ "embeddings": vectors }))
                }
                Task::Transcribe(input) => {
                    if input.sample_rate == 0 {
                        return Err("sample_rate must be positive".to_string());
                    }
                    let seconds = input.samples.len() as f64 / input.sample_rate as f64;
                    Ok(json!({ "text": "", "duration_secs": seconds }))
                }
            }
        })
    }
}

/// Bag-of-bytes embedding, normalized to unit length.
fn embed(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; EMBEDDING_DIMS];
    for (i, byte) in text.bytes().enumerate() {
        vector[(byte as usize + i) % EMBEDDING_DIMS] += 1.0;
    }
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|v| *v /= norm);
    }
    vector
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embed_is_unit_length() {
        let vector = embed("hello world");
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert_eq!(embed(""), vec![0.0; EMBEDDING_DIMS]);
    }
}
