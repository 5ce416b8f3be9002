//! Error types shared by meshcheck crates
//!
//! Errors carry enough context (command, service, namespace) to tell a
//! misconfigured run apart from a system that simply has not converged yet.

use thiserror::Error;

/// Main error type for meshcheck operations
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid input or configuration
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
    },

    /// An external command (kubectl, helm) failed or could not be spawned
    #[error("command `{command}` failed: {message}")]
    Command {
        /// Program name
        command: String,
        /// stderr or spawn failure
        message: String,
    },

    /// HTTP request to a control plane API failed
    #[error("http error [{context}]: {message}")]
    Http {
        /// Which API call was being made (e.g. "catalog", "intentions")
        context: String,
        /// Description of what failed
        message: String,
    },

    /// Service directory query failed
    #[error("directory query for {service} in namespace {namespace} failed: {message}")]
    Directory {
        /// Service being queried
        service: String,
        /// Namespace the query was scoped to
        namespace: String,
        /// Underlying failure
        message: String,
    },

    /// A convergence check used its whole budget without the probe succeeding
    #[error("{description}: not converged after {attempts} attempt(s): {last_diagnostic}")]
    ExhaustedRetries {
        /// What was being waited for
        description: String,
        /// Probe invocations made
        attempts: u32,
        /// Diagnostic from the last failed attempt
        last_diagnostic: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a command error for the given program
    pub fn command(command: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            message: msg.into(),
        }
    }

    /// Create an HTTP error with the API context
    pub fn http(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Http {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a directory query error
    pub fn directory(
        service: impl Into<String>,
        namespace: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Directory {
            service: service.into(),
            namespace: namespace.into(),
            message: msg.into(),
        }
    }

    /// Whether this error reports a timing problem rather than a broken setup
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::ExhaustedRetries { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: what a failed scenario tells the operator
    // ==========================================================================

    /// Story: a registration that never showed up reports the last mismatch
    #[test]
    fn story_exhausted_retries_carry_last_diagnostic() {
        let err = Error::ExhaustedRetries {
            description: "static-server registration".to_string(),
            attempts: 30,
            last_diagnostic: "expected 1 instance of static-server in ns1, found 0".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("static-server registration"));
        assert!(msg.contains("30 attempt(s)"));
        assert!(msg.contains("found 0"));
        assert!(err.is_exhausted());
    }

    /// Story: a broken directory query surfaces verbatim with its scope
    #[test]
    fn story_directory_errors_name_service_and_namespace() {
        let err = Error::directory("static-client", "consul-dest", "403 ACL not found");
        let msg = err.to_string();
        assert!(msg.contains("static-client"));
        assert!(msg.contains("consul-dest"));
        assert!(msg.contains("403 ACL not found"));
        assert!(!err.is_exhausted());
    }

    #[test]
    fn command_errors_name_the_program() {
        let err = Error::command("kubectl", "Error from server (NotFound)");
        assert_eq!(
            err.to_string(),
            "command `kubectl` failed: Error from server (NotFound)"
        );
    }

    #[test]
    fn validation_and_http_constructors() {
        match Error::validation("max_attempts must be at least 1") {
            Error::Validation { message } => assert_eq!(message, "max_attempts must be at least 1"),
            _ => panic!("Expected Validation variant"),
        }
        let err = Error::http("intentions", "connection refused");
        assert!(err.to_string().starts_with("http error [intentions]"));
    }
}
