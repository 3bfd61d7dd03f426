pub mod agent;
pub mod backoff;
pub mod chunker;
pub mod directive;
pub mod heartbeat;
pub mod media;
pub mod queue;
pub mod reply;
pub mod runner;
pub mod session;
pub mod template;
pub mod transcribe;

#[derive(Debug, thiserror::Error)]
#[error("autoclaw error: {message}")]
pub struct AutoclawError {
    message: String,
}

impl AutoclawError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
