//! Suspended program state of a run
//!
//! A [`Continuation`] is everything the interpreter needs to carry on from a
//! suspension point without replaying finished steps:
//!
//! ```text
//! Continuation
//! ├── definition_digest   script the frames index into
//! ├── frames              one per statement list being executed
//! │   ├── path            block indexes leading to the list
//! │   ├── next            next statement to run
//! │   └── block           start / body-start node of the enclosing block
//! ├── pending             the step the run is suspended in, and its wait
//! └── bindings            values bound by earlier steps
//! ```
//!
//! It travels as JSON bytes through the opaque continuation store.

use crate::definition::Script;
use crate::error::{FlowError, Result};
use crate::steps::Wait;
use flow_storage::{JsonSerializer, NodeId, SerializerProtocol};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Nodes opened for a block step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenBlock {
    pub function: String,
    pub start: NodeId,
    pub body_start: NodeId,
}

/// Position within one statement list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub path: Vec<usize>,
    pub next: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block: Option<OpenBlock>,
}

/// The step a run is suspended in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingStep {
    pub node: NodeId,
    pub function: String,
    pub wait: Wait,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
}

/// Serializable interpreter state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Continuation {
    pub definition_digest: String,
    pub frames: Vec<Frame>,
    #[serde(default)]
    pub pending: Option<PendingStep>,
    #[serde(default)]
    pub bindings: BTreeMap<String, Value>,
}

impl Continuation {
    /// State of a run that has not executed any statement yet
    pub fn new(script: &Script) -> Self {
        Self {
            definition_digest: script.digest().to_string(),
            frames: vec![Frame {
                path: Vec::new(),
                next: 0,
                block: None,
            }],
            pending: None,
            bindings: BTreeMap::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        JsonSerializer::new()
            .dumps(self)
            .map_err(|e| FlowError::CorruptContinuation(format!("encode failed: {}", e)))
    }

    /// Decode bytes taken for `script`
    pub fn decode(bytes: &[u8], script: &Script) -> Result<Self> {
        let continuation: Self = JsonSerializer::new()
            .loads(bytes)
            .map_err(|e| FlowError::CorruptContinuation(format!("decode failed: {}", e)))?;

        if continuation.definition_digest != script.digest() {
            return Err(FlowError::CorruptContinuation(
                "continuation was taken from a different script".to_string(),
            ));
        }
        for frame in &continuation.frames {
            script.statements(&frame.path).map_err(|_| {
                FlowError::CorruptContinuation(format!(
                    "frame path {:?} does not exist in the script",
                    frame.path
                ))
            })?;
        }
        Ok(continuation)
    }

    /// Blocks opened by the frames, outermost first
    pub fn open_blocks(&self) -> impl Iterator<Item = &OpenBlock> {
        self.frames.iter().filter_map(|f| f.block.as_ref())
    }
}
