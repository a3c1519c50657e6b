//! Task adapters: one per workflow step that talks to the outside world.
//!
//! Each adapter is a plain synchronous call that either succeeds or returns a
//! [`CbcError`](crate::error::CbcError) whose [`ErrorKind`](crate::error::ErrorKind)
//! decides whether the engine retries, catches or fails.

pub mod poll;
pub mod publish;
pub mod submit;
pub mod verify;

#[cfg(test)]
pub(crate) mod testing;

pub use poll::{ExistencePoller, ReportFetcher, ReportSource, ResultsReport};
pub use publish::{EvaluationPublisher, OrderingTimestamp};
pub use submit::{InputMode, SubmissionAck, Submitter};
pub use verify::{ComplianceStatus, ComplianceVerifier, VerifyRequest};
