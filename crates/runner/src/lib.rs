//! Runs submitted code with a language toolchain and ships the files it produces.

pub mod exec;
pub mod files;

pub use exec::{CommandExecutor, ExecConfig, ExecError, ExecOutput, Executor, Toolchain};
pub use files::{CollectedFile, UploadError, UploadedFile, Uploader};
