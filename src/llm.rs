//! Chat-completion provider access.

pub mod completion;

pub use completion::{
    ChatRequest, Completer, CompletionApi, CompletionOutcome, OpenAiClient, apology_for,
};
