use serde_json::{Map, Value};
use std::fmt;

/// Ordered stack of log attribute frames, one frame per pipeline stage.
/// The effective attribute set is the union of all frames; later frames win
/// on key collision. Purely observational — control flow never reads it.
#[derive(Debug, Default, Clone)]
pub struct LogScope {
    frames: Vec<Map<String, Value>>,
}

impl LogScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new frame. Subsequent `push` calls land in it.
    pub fn begin_frame(&mut self) -> &mut Self {
        self.frames.push(Map::new());
        self
    }

    /// Attach an attribute to the current frame.
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        if self.frames.is_empty() {
            self.frames.push(Map::new());
        }
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(key.into(), value.into());
        }
        self
    }

    /// Union of all frames, in stack order.
    pub fn effective(&self) -> Map<String, Value> {
        let mut merged = Map::new();
        for frame in &self.frames {
            for (k, v) in frame {
                merged.insert(k.clone(), v.clone());
            }
        }
        merged
    }

    pub fn contains(&self, key: &str) -> bool {
        self.frames.iter().any(|f| f.contains_key(key))
    }
}

/// Renders the effective attributes as compact JSON so the whole scope can be
/// emitted as a single field on a tracing event.
impl fmt::Display for LogScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Value::Object(self.effective()))
    }
}
