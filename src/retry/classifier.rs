//! Retry eligibility by SQLSTATE and operation class.
//!
//! Reads are idempotent and retried for any transient failure. Writes are
//! retried only when the server guarantees nothing was applied
//! (serialization failure, deadlock). Loosening the write side double-applies
//! mutations.

use std::borrow::Cow;
use std::fmt;
use std::sync::LazyLock;

use crate::error::DbError;

/// SQLSTATE codes the default policy knows about.
pub mod sqlstate {
    pub const SERIALIZATION_FAILURE: &str = "40001";
    pub const DEADLOCK_DETECTED: &str = "40P01";

    pub const CONNECTION_EXCEPTION: &str = "08000";
    pub const CONNECTION_DOES_NOT_EXIST: &str = "08003";
    pub const CONNECTION_FAILURE: &str = "08006";
    pub const UNABLE_TO_ESTABLISH_CONNECTION: &str = "08001";
    pub const CONNECTION_REJECTED: &str = "08004";

    pub const INSUFFICIENT_RESOURCES: &str = "53000";
    pub const DISK_FULL: &str = "53100";
    pub const OUT_OF_MEMORY: &str = "53200";
    pub const TOO_MANY_CONNECTIONS: &str = "53300";

    pub const ADMIN_SHUTDOWN: &str = "57P01";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationClass {
    Read,
    Write,
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationClass::Read => f.write_str("read"),
            OperationClass::Write => f.write_str("write"),
        }
    }
}

/// Which operation classes a SQLSTATE rule allows to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryScope {
    /// The server guarantees no partial effect: safe for reads and writes.
    ReadsAndWrites,
    ReadsOnly,
}

impl RetryScope {
    fn allows(self, class: OperationClass) -> bool {
        match self {
            RetryScope::ReadsAndWrites => true,
            RetryScope::ReadsOnly => class == OperationClass::Read,
        }
    }
}

/// The part of an error the classifier looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure<'a> {
    Cancelled,
    DeadlineExceeded,
    SqlState(&'a str),
    Other,
}

/// SQLSTATE retry table. Cancellation is never retried and a missed deadline
/// is retried for reads only; both are fixed and sit outside the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    rules: Vec<(Cow<'static, str>, RetryScope)>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        use sqlstate::*;

        let mut policy = Self::empty();
        for code in [SERIALIZATION_FAILURE, DEADLOCK_DETECTED] {
            policy = policy.with_rule(code, RetryScope::ReadsAndWrites);
        }
        for code in [
            CONNECTION_EXCEPTION,
            CONNECTION_DOES_NOT_EXIST,
            CONNECTION_FAILURE,
            UNABLE_TO_ESTABLISH_CONNECTION,
            CONNECTION_REJECTED,
            INSUFFICIENT_RESOURCES,
            DISK_FULL,
            OUT_OF_MEMORY,
            TOO_MANY_CONNECTIONS,
            ADMIN_SHUTDOWN,
        ] {
            policy = policy.with_rule(code, RetryScope::ReadsOnly);
        }
        policy
    }
}

static DEFAULT_POLICY: LazyLock<RetryPolicy> = LazyLock::new(RetryPolicy::default);

impl RetryPolicy {
    /// A table with no SQLSTATE rules.
    #[must_use]
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Add or replace the rule for `code`.
    #[must_use]
    pub fn with_rule(mut self, code: impl Into<Cow<'static, str>>, scope: RetryScope) -> Self {
        let code = code.into();
        match self.rules.iter_mut().find(|(existing, _)| *existing == code) {
            Some(rule) => rule.1 = scope,
            None => self.rules.push((code, scope)),
        }
        self
    }

    #[must_use]
    pub fn without_rule(mut self, code: &str) -> Self {
        self.rules.retain(|(existing, _)| existing != code);
        self
    }

    #[must_use]
    pub fn scope_for(&self, code: &str) -> Option<RetryScope> {
        self.rules
            .iter()
            .find(|(existing, _)| existing == code)
            .map(|(_, scope)| *scope)
    }

    #[must_use]
    pub fn is_retryable(&self, err: Option<&DbError>, class: OperationClass) -> bool {
        match err {
            None => false,
            Some(err) => self.classify(err.failure(), class),
        }
    }

    #[must_use]
    pub fn classify(&self, failure: Failure<'_>, class: OperationClass) -> bool {
        match failure {
            Failure::Cancelled => false,
            Failure::SqlState(code) => self
                .scope_for(code)
                .is_some_and(|scope| scope.allows(class)),
            Failure::DeadlineExceeded => class == OperationClass::Read,
            Failure::Other => false,
        }
    }
}

/// Classify `err` with the default policy.
#[must_use]
pub fn is_retryable(err: Option<&DbError>, class: OperationClass) -> bool {
    DEFAULT_POLICY.is_retryable(err, class)
}
