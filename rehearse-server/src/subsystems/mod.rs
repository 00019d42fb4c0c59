pub mod interview;
pub mod transcribe;
