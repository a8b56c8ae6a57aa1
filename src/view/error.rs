//! Construction and runtime errors of a view publication

use crate::store::StoreError;

/// Malformed pipeline or options, detected while (re)building a publication
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstructionError {
    /// Single-value detection needs a grouping stage to inspect
    MissingGroupStage,

    /// Forced single-value field is not an output of the grouping stage
    UnknownSingleValueField(String),

    InvalidWindow(String),
}

impl std::fmt::Display for ConstructionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConstructionError::MissingGroupStage => {
                write!(f, "pipeline has no grouping stage")
            }
            ConstructionError::UnknownSingleValueField(field) => {
                write!(f, "single value field '{}' is not a grouping output", field)
            }
            ConstructionError::InvalidWindow(reason) => write!(f, "invalid window: {}", reason),
        }
    }
}

impl std::error::Error for ConstructionError {}

#[derive(Debug)]
pub enum ViewError {
    Construction(ConstructionError),
    Execution(StoreError),

    /// The publication task is gone
    Stopped,
}

impl From<ConstructionError> for ViewError {
    fn from(err: ConstructionError) -> Self {
        ViewError::Construction(err)
    }
}

impl From<StoreError> for ViewError {
    fn from(err: StoreError) -> Self {
        ViewError::Execution(err)
    }
}

impl std::fmt::Display for ViewError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViewError::Construction(e) => write!(f, "Construction error: {}", e),
            ViewError::Execution(e) => write!(f, "Execution error: {}", e),
            ViewError::Stopped => write!(f, "Publication stopped"),
        }
    }
}

impl std::error::Error for ViewError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ViewError::Construction(e) => Some(e),
            ViewError::Execution(e) => Some(e),
            ViewError::Stopped => None,
        }
    }
}
