//! Bounded channel between the input reader and the scheduler.

use tokio::sync::mpsc;

use crate::config::LimitsConfig;

/// Create a bounded channel pair with the configured buffer size.
///
/// When the buffer is full the reader blocks, so a slow scan never pulls the
/// whole input table into memory.
pub fn bounded_channel<T>(limits: &LimitsConfig) -> (mpsc::Sender<T>, mpsc::Receiver<T>) {
    mpsc::channel(limits.input_buffer.max(1))
}
