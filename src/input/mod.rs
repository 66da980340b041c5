pub mod file_tailer;

pub use file_tailer::{read_events, read_lines, InputError};

// Async version
pub use file_tailer::AsyncFileTailer;
