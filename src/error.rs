//! Errors raised by the installers themselves.
//!
//! Failures of remote commands are not wrapped: they come out of `spurs` as `SshError` and are
//! propagated as is, so that whoever called `Plugin::run` sees exactly what the transport saw.

use failure_derive::Fail;

#[derive(Debug, Fail)]
pub enum InstallError {
    /// Something the installer needs to find on a node is not there (e.g. a JDK).
    #[fail(display = "{}: unable to find {}", node, what)]
    MissingResource { node: String, what: String },

    /// A job panicked instead of returning an error.
    #[fail(display = "job {} panicked: {}", job, msg)]
    JobPanicked { job: String, msg: String },

    /// A job ran longer than the configured per-job timeout.
    #[fail(display = "job {} did not finish within {}s", job, secs)]
    JobTimedOut { job: String, secs: u64 },

    /// All pool workers went away while jobs were still outstanding.
    #[fail(display = "worker pool closed with {} jobs outstanding", outstanding)]
    PoolClosed { outstanding: usize },

    /// A host on the command line could not be parsed.
    #[fail(display = "invalid host \"{}\": expected `alias=host:port` or `host:port`", spec)]
    BadHostSpec { spec: String },

    /// Two hosts on the command line ended up with the same alias.
    #[fail(display = "alias \"{}\" is used by more than one host", alias)]
    DuplicateAlias { alias: String },

    /// The cloud API tool returned an error.
    #[fail(display = "`{}` failed: {}", cmd, stderr)]
    CloudApi { cmd: String, stderr: String },

    /// The settings file could not be loaded.
    #[fail(display = "unable to load settings from {}: {}", path, cause)]
    BadSettings { path: String, cause: String },
}
