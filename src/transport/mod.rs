//! Adapters to the outside world: job launchers and attachment storage.

pub mod files;
pub mod submit;

pub use files::{FileTransport, LocalDirTransport, WebDavTransport};
pub use submit::{
    BatchState, BatchStatus, HttpLauncher, JOB_ID_ENV, LocalTransport, SubmissionTransport,
};
