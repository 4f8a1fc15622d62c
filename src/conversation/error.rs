use std::{error::Error as StdError, fmt};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStage {
    Validate,
    Parse,
    Contextualize,
    Workflow,
    Generate,
    Transform,
}

impl TurnStage {
    pub fn as_str(self) -> &'static str {
        match self {
            TurnStage::Validate => "validate",
            TurnStage::Parse => "parse",
            TurnStage::Contextualize => "contextualize",
            TurnStage::Workflow => "workflow",
            TurnStage::Generate => "generate",
            TurnStage::Transform => "transform",
        }
    }
}

impl fmt::Display for TurnStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by an injected collaborator (stage port or state emitter).
#[derive(Debug)]
pub struct StageError {
    pub message: String,
    pub source: Option<Box<dyn StdError + Send + Sync>>,
}

impl StageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl Into<Box<dyn StdError + Send + Sync>>,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl StdError for StageError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|source| source as &(dyn StdError + 'static))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("invalid turn input: {message}")]
    InvalidInput { message: String },
    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: TurnStage,
        #[source]
        source: StageError,
    },
    #[error("invalid workflow response: {message}")]
    InvalidWorkflowResponse { message: String },
}

impl TurnError {
    pub fn stage(&self) -> TurnStage {
        match self {
            TurnError::InvalidInput { .. } => TurnStage::Validate,
            TurnError::Stage { stage, .. } => *stage,
            TurnError::InvalidWorkflowResponse { .. } => TurnStage::Workflow,
        }
    }
}

pub fn invalid_input(message: impl Into<String>) -> TurnError {
    TurnError::InvalidInput {
        message: message.into(),
    }
}

pub fn stage_failed(stage: TurnStage, source: StageError) -> TurnError {
    TurnError::Stage { stage, source }
}

pub fn invalid_workflow_response(message: impl Into<String>) -> TurnError {
    TurnError::InvalidWorkflowResponse {
        message: message.into(),
    }
}
