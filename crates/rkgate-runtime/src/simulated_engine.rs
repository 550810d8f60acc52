//! In-process stand-in for the RKLLM/RKNN native libraries.
//!
//! Keeps handle bookkeeping and produces deterministic output so the server
//! can be exercised end to end on machines without an NPU.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use crate::native_engine::{ChunkSink, EngineChunk, EngineError, NativeEngine};

const VISION_EMBEDDING_DIM: usize = 8;

#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedEngineConfig {
    /// Pause between generated tokens.
    pub token_delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModelFamily {
    Llm,
    Rknn,
}

#[derive(Debug, Default)]
struct GenerationControl {
    running: AtomicBool,
    abort_requested: AtomicBool,
}

#[derive(Debug)]
struct SimulatedModel {
    family: ModelFamily,
    model_path: String,
    inputs: Option<Vec<Value>>,
    outputs: Option<Vec<Value>>,
    generation: Arc<GenerationControl>,
}

#[derive(Debug, Default)]
pub struct SimulatedEngine {
    config: SimulatedEngineConfig,
    next_handle: AtomicU64,
    models: Mutex<HashMap<String, SimulatedModel>>,
}

impl SimulatedEngine {
    pub fn new(config: SimulatedEngineConfig) -> Self {
        Self {
            config,
            next_handle: AtomicU64::new(1),
            models: Mutex::new(HashMap::new()),
        }
    }

    pub fn loaded_model_count(&self) -> usize {
        self.models.lock().map(|models| models.len()).unwrap_or(0)
    }

    fn with_models<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, SimulatedModel>) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let mut models = self
            .models
            .lock()
            .map_err(|_| EngineError::Failed("simulated engine state lock poisoned".to_string()))?;
        f(&mut models)
    }

    fn init_model(&self, family: ModelFamily, params: &Value) -> Result<Value, EngineError> {
        let model_path = required_str(params, "model_path", 0)?;
        let prefix = match family {
            ModelFamily::Llm => "rkllm",
            ModelFamily::Rknn => "rknn",
        };
        let handle = format!(
            "{prefix}-{}",
            self.next_handle.fetch_add(1, Ordering::SeqCst)
        );
        self.with_models(|models| {
            models.insert(
                handle.clone(),
                SimulatedModel {
                    family,
                    model_path: model_path.clone(),
                    inputs: None,
                    outputs: None,
                    generation: Arc::default(),
                },
            );
            Ok(json!({ "handle": handle, "model_path": model_path }))
        })
    }

    fn destroy_model(&self, family: ModelFamily, params: &Value) -> Result<Value, EngineError> {
        let handle = required_str(params, "handle", 0)?;
        self.with_models(|models| {
            let owned = models
                .get(&handle)
                .map(|model| model.family == family)
                .unwrap_or(false);
            if !owned {
                return Err(EngineError::UnknownHandle(handle.clone()));
            }
            let model_path = models
                .remove(&handle)
                .map(|model| model.model_path)
                .unwrap_or_default();
            Ok(json!({ "handle": handle, "model_path": model_path, "destroyed": true }))
        })
    }

    fn generate(
        &self,
        prompt: &str,
        generation: &GenerationControl,
        sink: &ChunkSink,
    ) -> Result<(), EngineError> {
        for (index, token) in prompt.split_inclusive(' ').enumerate() {
            if index > 0 && !self.config.token_delay.is_zero() {
                std::thread::sleep(self.config.token_delay);
            }
            if generation.abort_requested.load(Ordering::SeqCst) {
                sink.emit(EngineChunk::done().with_data(json!({ "aborted": true })));
                return Ok(());
            }
            let token_id = checksum(token.as_bytes()) % 32_000;
            let chunk = if index == 0 {
                EngineChunk::begin(token, token_id)
            } else {
                EngineChunk::running(token, token_id)
            };
            if !sink.emit(chunk) {
                return Err(EngineError::Failed("chunk sink closed".to_string()));
            }
        }
        sink.emit(EngineChunk::done());
        Ok(())
    }

    fn generation_control(&self, handle: &str) -> Result<Arc<GenerationControl>, EngineError> {
        self.with_models(|models| match models.get(handle) {
            Some(model) if model.family == ModelFamily::Llm => Ok(model.generation.clone()),
            _ => Err(EngineError::UnknownHandle(handle.to_string())),
        })
    }

    /// Flags the handle's in-flight generation to stop at the next token.
    fn rkllm_abort(&self, params: &Value) -> Result<Value, EngineError> {
        let handle = required_str(params, "handle", 0)?;
        let generation = self.generation_control(&handle)?;
        let running = generation.running.load(Ordering::SeqCst);
        if running {
            generation.abort_requested.store(true, Ordering::SeqCst);
        }
        Ok(json!({ "handle": handle, "aborted": running }))
    }

    fn rknn_inputs_set(&self, params: &Value) -> Result<Value, EngineError> {
        let handle = required_str(params, "handle", 0)?;
        let inputs = param(params, "inputs", 1)
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| EngineError::InvalidParams("'inputs' must be an array".to_string()))?;
        self.with_models(|models| match models.get_mut(&handle) {
            Some(model) if model.family == ModelFamily::Rknn => {
                let count = inputs.len();
                model.inputs = Some(inputs);
                model.outputs = None;
                Ok(json!({ "handle": handle, "inputs": count }))
            }
            _ => Err(EngineError::UnknownHandle(handle.clone())),
        })
    }

    fn rknn_run(&self, params: &Value) -> Result<Value, EngineError> {
        let handle = required_str(params, "handle", 0)?;
        self.with_models(|models| match models.get_mut(&handle) {
            Some(model) if model.family == ModelFamily::Rknn => {
                let inputs = model.inputs.as_ref().ok_or_else(|| {
                    EngineError::InvalidParams(format!("no inputs set for handle '{handle}'"))
                })?;
                let outputs = inputs
                    .iter()
                    .enumerate()
                    .map(|(index, input)| {
                        json!({
                            "index": index,
                            "size": input.to_string().len(),
                            "checksum": checksum(input.to_string().as_bytes()),
                        })
                    })
                    .collect::<Vec<_>>();
                let count = outputs.len();
                model.outputs = Some(outputs);
                Ok(json!({ "handle": handle, "outputs": count }))
            }
            _ => Err(EngineError::UnknownHandle(handle.clone())),
        })
    }

    fn rknn_outputs_get(&self, params: &Value) -> Result<Value, EngineError> {
        let handle = required_str(params, "handle", 0)?;
        self.with_models(|models| match models.get(&handle) {
            Some(model) if model.family == ModelFamily::Rknn => {
                let outputs = model.outputs.clone().ok_or_else(|| {
                    EngineError::InvalidParams(format!("rknn.run has not produced outputs for '{handle}'"))
                })?;
                Ok(json!({ "handle": handle, "outputs": outputs }))
            }
            _ => Err(EngineError::UnknownHandle(handle.clone())),
        })
    }

    fn vision_encode(&self, params: &Value) -> Result<Value, EngineError> {
        let image = required_str(params, "image", 0)?;
        let bytes = image.as_bytes();
        let embedding = (0..VISION_EMBEDDING_DIM)
            .map(|lane| {
                let lane_sum = bytes
                    .iter()
                    .skip(lane)
                    .step_by(VISION_EMBEDDING_DIM)
                    .map(|byte| u64::from(*byte))
                    .sum::<u64>();
                (lane_sum % 1_000) as f64 / 1_000.0
            })
            .collect::<Vec<_>>();
        Ok(json!({
            "embedding_dim": VISION_EMBEDDING_DIM,
            "embedding": embedding,
        }))
    }
}

impl NativeEngine for SimulatedEngine {
    fn call(&self, method: &str, params: &Value) -> Result<Value, EngineError> {
        match method {
            "rkllm.init" => self.init_model(ModelFamily::Llm, params),
            "rkllm.destroy" => self.destroy_model(ModelFamily::Llm, params),
            "rkllm.abort" => self.rkllm_abort(params),
            "rknn.init" => self.init_model(ModelFamily::Rknn, params),
            "rknn.inputs_set" => self.rknn_inputs_set(params),
            "rknn.run" => self.rknn_run(params),
            "rknn.outputs_get" => self.rknn_outputs_get(params),
            "rknn.destroy" => self.destroy_model(ModelFamily::Rknn, params),
            "vision.encode" => self.vision_encode(params),
            other => Err(EngineError::UnsupportedMethod(other.to_string())),
        }
    }

    fn run_streaming(
        &self,
        method: &str,
        params: &Value,
        sink: &ChunkSink,
    ) -> Result<(), EngineError> {
        if !matches!(method, "rkllm.run" | "rkllm.run_async") {
            return Err(EngineError::UnsupportedMethod(method.to_string()));
        }
        let handle = required_str(params, "handle", 0)?;
        let prompt = required_str(params, "prompt", 1)?;
        if prompt.trim().is_empty() {
            return Err(EngineError::InvalidParams(
                "'prompt' must be non-empty".to_string(),
            ));
        }
        let generation = self.generation_control(&handle)?;
        if generation.running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::Failed(format!(
                "handle '{handle}' is already generating"
            )));
        }
        generation.abort_requested.store(false, Ordering::SeqCst);
        let outcome = self.generate(&prompt, &generation, sink);
        generation.running.store(false, Ordering::SeqCst);
        generation.abort_requested.store(false, Ordering::SeqCst);
        outcome
    }
}

fn param<'a>(params: &'a Value, name: &str, position: usize) -> Option<&'a Value> {
    match params {
        Value::Object(object) => object.get(name),
        Value::Array(items) => items.get(position),
        _ => None,
    }
}

fn required_str(params: &Value, name: &str, position: usize) -> Result<String, EngineError> {
    param(params, name, position)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| EngineError::InvalidParams(format!("'{name}' must be a string")))
}

fn checksum(bytes: &[u8]) -> i64 {
    bytes
        .iter()
        .fold(0_i64, |acc, byte| (acc * 31 + i64::from(*byte)) % 1_000_000_007)
}
