//! YAML workflow definitions
//!
//! A definition is an ordered list of statements. A statement either invokes a
//! step, or opens a block step whose body is itself a list of statements:
//!
//! ```yaml
//! name: basic
//! durability: fully_durable
//! steps:
//!   - block: node
//!     body:
//!       - step: semaphore
//!         args: { name: halt }
//!   - step: echo
//!     args: { message: "done" }
//! ```
//!
//! The YAML text is kept verbatim as the run's script, and its SHA-256 digest
//! ties a persisted continuation to the exact script it was taken from.

use crate::durability::DurabilityLevel;
use crate::error::{FlowError, Result};
use crate::steps::StepRegistry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::Path;

/// Top-level workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow name
    pub name: String,

    /// Durability requested by the definition, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub durability: Option<DurabilityLevel>,

    /// Statements executed in order
    pub steps: Vec<Statement>,
}

/// One statement of a definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Statement {
    /// Block step wrapping a body
    Block {
        block: String,
        #[serde(default)]
        args: Value,
        #[serde(default)]
        body: Vec<Statement>,
    },

    /// Plain step invocation
    Step {
        step: String,
        #[serde(default)]
        args: Value,
        /// Binding that receives the step's result
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bind: Option<String>,
    },
}

/// A parsed definition together with its source text
#[derive(Debug, Clone)]
pub struct Script {
    source: String,
    digest: String,
    definition: WorkflowDefinition,
}

impl Script {
    /// Parse a YAML definition
    pub fn parse(source: &str) -> Result<Self> {
        let definition: WorkflowDefinition = serde_yaml::from_str(source)
            .map_err(|e| FlowError::Definition(format!("Failed to parse YAML: {}", e)))?;
        Ok(Self {
            source: source.to_string(),
            digest: format!("{:x}", Sha256::digest(source.as_bytes())),
            definition,
        })
    }

    /// Read and parse a YAML definition file
    pub async fn from_file(path: &Path) -> Result<Self> {
        let source = tokio::fs::read_to_string(path).await.map_err(|e| {
            FlowError::Definition(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&source)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Hex SHA-256 of the source text
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Statement list reached by following `path` through nested block bodies
    pub fn statements(&self, path: &[usize]) -> Result<&[Statement]> {
        let mut list: &[Statement] = &self.definition.steps;
        for &index in path {
            list = match list.get(index) {
                Some(Statement::Block { body, .. }) => body,
                _ => {
                    return Err(FlowError::Definition(format!(
                        "path {:?} does not lead to a block body",
                        path
                    )))
                }
            };
        }
        Ok(list)
    }

    /// Check that every name in the definition is registered
    pub fn validate(&self, steps: &StepRegistry) -> Result<()> {
        if self.definition.name.trim().is_empty() {
            return Err(FlowError::Definition("workflow name is empty".to_string()));
        }
        Self::validate_list(&self.definition.steps, steps)
    }

    fn validate_list(list: &[Statement], steps: &StepRegistry) -> Result<()> {
        for statement in list {
            match statement {
                Statement::Block { block, body, .. } => {
                    if !steps.is_block(block) {
                        return Err(FlowError::UnknownStep(block.clone()));
                    }
                    Self::validate_list(body, steps)?;
                }
                Statement::Step { step, .. } => {
                    if !steps.contains(step) {
                        return Err(FlowError::UnknownStep(step.clone()));
                    }
                }
            }
        }
        Ok(())
    }
}
