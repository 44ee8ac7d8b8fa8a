/*
 * Council Analyzer CLI - Error Taxonomy
 * Copyright (c) 2025 Council Analyzer Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use thiserror::Error;

/// Classified pipeline failures. Stage workers absorb everything except
/// `Fatal`, record the failure in the ledger, and return `ok = false`;
/// `Fatal` aborts the process with exit code 2.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Missing meeting row or upstream artifact required by a stage.
    #[error("not found: {0}")]
    NotFound(String),

    /// Timeout or nonzero exit from an external collaborator.
    #[error("transient external failure: {0}")]
    TransientExternal(String),

    /// Unusable payload from a capability.
    #[error("parse error: {0}")]
    ParseError(String),

    /// A ledger write against state that should exist but does not.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Ledger unreachable or corrupt. Not recoverable in-process.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl PipelineError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::Fatal(_))
    }
}
