pub(crate) mod azure;
pub(crate) mod classify;

pub use azure::{AzureChatApi, CompletionApi};
pub use classify::{BatchClassifier, BatchVerdict, SoftFailure};
