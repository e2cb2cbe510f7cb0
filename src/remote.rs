//! The channel to one remote machine: run a command, read a file, write a file.
//!
//! Everything the installers do to a node goes through `Remote`, so that the SSH transport
//! (`spurs`) can be swapped for a recording stub in tests.

use std::io::Write;
use std::sync::{Mutex, MutexGuard};

use log::error;

use spurs::{cmd, Execute, SshShell};

use crate::common::shell_quote;

/// How to open a remote file for writing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FileMode {
    /// Truncate the file first.
    Write,
    /// Add to the end of the file.
    Append,
}

impl FileMode {
    fn redirect(self) -> &'static str {
        match self {
            FileMode::Write => ">",
            FileMode::Append => ">>",
        }
    }
}

pub trait Remote: Send + Sync {
    /// Run `cmd` in a shell on the remote and return its stdout. A non-zero exit status is an
    /// error.
    fn execute(&self, cmd: &str) -> Result<String, failure::Error>;

    /// Return the contents of the remote file at `path`.
    fn read_file(&self, path: &str) -> Result<String, failure::Error>;

    /// Write `contents` to the remote file at `path`. The write has completed on the remote when
    /// this returns.
    fn write_file(&self, path: &str, contents: &str, mode: FileMode) -> Result<(), failure::Error>;

    fn path_exists(&self, path: &str) -> Result<bool, failure::Error> {
        let out = self.execute(&format!("test -e {} && echo yes || echo no", path))?;
        Ok(out.trim() == "yes")
    }

    fn is_dir(&self, path: &str) -> Result<bool, failure::Error> {
        let out = self.execute(&format!("test -d {} && echo yes || echo no", path))?;
        Ok(out.trim() == "yes")
    }
}

/// A remote file opened for writing. Writes are buffered locally and sent in one go when the file
/// is closed. A `RemoteFile` that is dropped without `close` is still sent, but errors can then
/// only be logged.
pub struct RemoteFile<'r> {
    remote: &'r dyn Remote,
    path: String,
    mode: FileMode,
    buf: Vec<u8>,
    closed: bool,
}

impl<'r> RemoteFile<'r> {
    pub fn open(remote: &'r dyn Remote, path: &str, mode: FileMode) -> Self {
        RemoteFile {
            remote,
            path: path.to_owned(),
            mode,
            buf: Vec::new(),
            closed: false,
        }
    }

    /// Send the buffered contents to the remote.
    pub fn close(mut self) -> Result<(), failure::Error> {
        self.upload()
    }

    fn upload(&mut self) -> Result<(), failure::Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let contents = String::from_utf8(std::mem::take(&mut self.buf))?;
        self.remote.write_file(&self.path, &contents, self.mode)
    }
}

impl Write for RemoteFile<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for RemoteFile<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.upload() {
            error!("Unable to write remote file {}: {}", self.path, err);
        }
    }
}

/// A `Remote` over an SSH session. Commands on one session are serialized.
pub struct SshRemote {
    shell: Mutex<SshShell>,
}

impl SshRemote {
    /// Connect to `host` (e.g. `10.0.0.4:22`) as `login` with the default key.
    pub fn connect(login: &str, host: &str) -> Result<Self, failure::Error> {
        let shell = SshShell::with_default_key(login, host)?;

        Ok(SshRemote {
            shell: Mutex::new(shell),
        })
    }

    fn shell(&self) -> Result<MutexGuard<'_, SshShell>, failure::Error> {
        self.shell
            .lock()
            .map_err(|_| failure::format_err!("SSH session poisoned by an earlier panic"))
    }
}

impl Remote for SshRemote {
    fn execute(&self, command: &str) -> Result<String, failure::Error> {
        let out = self.shell()?.run(cmd!("{}", command))?;
        Ok(out.stdout)
    }

    fn read_file(&self, path: &str) -> Result<String, failure::Error> {
        // No pty, so that line endings come back untouched.
        let out = self.shell()?.run(cmd!("cat {}", path).no_pty())?;
        Ok(out.stdout)
    }

    fn write_file(&self, path: &str, contents: &str, mode: FileMode) -> Result<(), failure::Error> {
        self.shell()?.run(cmd!(
            "printf '%s' {} {} {}",
            shell_quote(contents),
            mode.redirect(),
            path
        ))?;
        Ok(())
    }
}
