// Run and build execution: the dispatch engine, the two executors, and the
// process/SSH/git plumbing they share.

pub mod cluster;
mod engine;
pub mod freestyle;
pub mod git;
pub mod local;
pub mod ssh;

pub use cluster::{ClusterClient, WorkloadHandle, WorkloadPhase, WorkloadSpec};
pub use engine::Engine;
pub use ssh::{RemoteShellClient, Ssh2ShellClient, SshAuth, SshTarget, UploadSource};
