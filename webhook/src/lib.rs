//! GitHub webhook dispatch: HMAC verification, event normalization,
//! delivery dedupe and workflow enqueue.

#![deny(clippy::print_stdout, clippy::print_stderr)]

mod dedupe;
mod dispatch;
mod envelope;
mod signature;

pub use dedupe::DedupeSet;
pub use dispatch::StartOutcome;
pub use dispatch::WebhookState;
pub use dispatch::WorkflowStarter;
pub use dispatch::router;
pub use envelope::GithubEventEnvelope;
pub use envelope::PullRequestInfo;
pub use envelope::Repository;
pub use envelope::normalize;
pub use envelope::workflow_id_for;
pub use signature::sign;
pub use signature::verify;
