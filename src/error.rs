//! Error taxonomy for the provisioning engine.
//!
//! Engine modules return [`Error`]; command handlers wrap it in `anyhow` with
//! context. Every variant aborts the current operation. Orphaned resources are
//! not errors and are reported through logging instead.
use crate::state::ResourceUid;
use std::fmt;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad placeholder, unresolved reference, or malformed registration.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error("no provisioner matches resource '{uid}' (type={res_type} class={class} id={id})")]
    NoProvisioner {
        uid: ResourceUid,
        res_type: String,
        class: String,
        id: String,
    },

    #[error("{uid}: provisioner '{provisioner}' failed: {message}")]
    Provision {
        uid: ResourceUid,
        provisioner: String,
        message: String,
    },

    #[error("failed to persist state to {path}: {message}{}", unwinding_suffix(.unwinding))]
    Persist {
        path: String,
        message: String,
        /// The failure that was being propagated when the write failed.
        unwinding: Option<Box<Error>>,
    },
}

fn unwinding_suffix(unwinding: &Option<Box<Error>>) -> String {
    match unwinding {
        Some(err) => format!(" (while reporting: {err})"),
        None => String::new(),
    }
}

impl Error {
    pub fn provision(
        uid: &ResourceUid,
        provisioner: &str,
        message: impl Into<String>,
    ) -> Self {
        Error::Provision {
            uid: uid.clone(),
            provisioner: provisioner.to_string(),
            message: message.into(),
        }
    }

    /// Wrap a persistence failure, keeping the error that was in flight.
    pub fn persist(path: &std::path::Path, message: impl Into<String>, unwinding: Option<Error>) -> Self {
        Error::Persist {
            path: path.display().to_string(),
            message: message.into(),
            unwinding: unwinding.map(Box::new),
        }
    }
}

/// One or more problems found in a single pass.
///
/// Substitution collects every bad reference in a template before failing so
/// the operator sees all of them at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub problems: Vec<String>,
}

impl ValidationError {
    pub fn new(problem: impl Into<String>) -> Self {
        ValidationError {
            problems: vec![problem.into()],
        }
    }

    /// Prefix every problem, e.g. with the field or resource being resolved.
    pub fn within(mut self, scope: &str) -> Self {
        for problem in &mut self.problems {
            *problem = format!("{scope}: {problem}");
        }
        self
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.problems.join("; "))
    }
}

impl std::error::Error for ValidationError {}

/// Dependency cycle among resources; every member of the cycle is listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleError {
    pub members: Vec<ResourceUid>,
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self
            .members
            .iter()
            .map(|uid| uid.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "resource dependency cycle detected between: {names}")
    }
}

impl std::error::Error for CycleError {}
