//! Control pipe for the supervisor/init bootstrap handshake.
//!
//! A socketpair with both ends close-on-exec; the supervisor keeps one end,
//! the other is inherited by the spawned child at a well-known descriptor.
//! The pipe carries newline-delimited JSON records ([`ProcessArgs`],
//! [`PidRecord`], [`InitError`], and the configuration itself). The
//! supervisor half-closes its write direction once the last record is sent,
//! letting the child distinguish "configuration complete" from "supervisor
//! died mid-send".

use std::io::{BufRead, BufReader, Read, Write};
use std::net::Shutdown;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use berth_common::error::{BerthError, Result};
use berth_core::config::Config;
use berth_core::network::NetworkState;

/// Bootstrap payload sent to the child: the program to exec, the full
/// configuration, and the network state accumulated during start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessArgs {
    /// Argument vector of the program the init will exec.
    #[serde(rename = "Args")]
    pub args: Vec<String>,
    /// Container configuration snapshot.
    #[serde(rename = "Config")]
    pub config: Config,
    /// Per-network state records, in configured order.
    #[serde(rename = "NetworkState", default)]
    pub network_state: Vec<NetworkState>,
}

/// Pid announcement from a re-invoked child.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PidRecord {
    /// Pid of the process that will run the requested program.
    #[serde(rename = "Pid")]
    pub pid: i32,
}

/// Structured pre-exec failure reported by the child.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitError {
    /// Human-readable failure description.
    pub message: String,
}

/// Supervisor end of the control pipe.
pub struct ControlPipe {
    writer: UnixStream,
    reader: BufReader<UnixStream>,
}

impl ControlPipe {
    /// Creates the pipe, returning the supervisor end and the descriptor to
    /// hand to the child.
    ///
    /// Both ends are close-on-exec; the launcher re-installs the child end
    /// at the inherited descriptor number.
    ///
    /// # Errors
    ///
    /// Returns an error if the socketpair cannot be created.
    pub fn new() -> Result<(Self, OwnedFd)> {
        let (parent, child) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .map_err(|e| BerthError::system("socketpair", e))?;

        let writer = UnixStream::from(parent);
        let reader = BufReader::new(
            writer
                .try_clone()
                .map_err(|e| BerthError::io("control pipe", e))?,
        );
        Ok((Self { writer, reader }, child))
    }

    /// Writes one record to the child.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the socket write fails.
    pub fn send<T: Serialize>(&mut self, record: &T) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .map_err(|e| BerthError::io("control pipe", e))
    }

    /// Half-closes the write direction, signalling "no more records".
    ///
    /// # Errors
    ///
    /// Returns an error if the socket shutdown fails.
    pub fn shutdown_write(&self) -> Result<()> {
        self.writer
            .shutdown(Shutdown::Write)
            .map_err(|e| BerthError::io("control pipe", e))
    }

    /// Reads one record from the child; `None` on clean EOF.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket read or record parsing fails.
    pub fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .map_err(|e| BerthError::io("control pipe", e))?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(line.trim_end())?))
    }
}

/// Child end of the control pipe, reconstructed from the inherited
/// descriptor in a re-invoked binary.
pub struct ChildPipe {
    writer: UnixStream,
    reader: BufReader<UnixStream>,
}

impl ChildPipe {
    /// Wraps the inherited descriptor.
    ///
    /// Close-on-exec was necessarily cleared so the descriptor survived
    /// the exec into this binary; it is restored here so the final
    /// `execve` into the container program closes the pipe, which is what
    /// signals success to the supervisor.
    ///
    /// # Errors
    ///
    /// Returns an error if the close-on-exec flag cannot be restored or
    /// the descriptor cannot be duplicated for buffered reading.
    pub fn from_fd(fd: OwnedFd) -> Result<Self> {
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
            .map_err(|e| BerthError::system("fcntl(F_SETFD)", e))?;
        let writer = UnixStream::from(fd);
        let reader = BufReader::new(
            writer
                .try_clone()
                .map_err(|e| BerthError::io("control pipe", e))?,
        );
        Ok(Self { writer, reader })
    }

    /// Reads one record from the supervisor; `None` on EOF.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket read or record parsing fails.
    pub fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .map_err(|e| BerthError::io("control pipe", e))?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(line.trim_end())?))
    }

    /// Writes one record to the supervisor.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the socket write fails.
    pub fn send<T: Serialize>(&mut self, record: &T) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .map_err(|e| BerthError::io("control pipe", e))
    }

    /// Reports a pre-exec failure back to the supervisor.
    ///
    /// Drains any unread configuration first so the supervisor's writes do
    /// not fail with a connection reset, then sends an [`InitError`].
    pub fn report_error(&mut self, err: &BerthError) {
        let mut sink = Vec::new();
        let _ = self.reader.read_to_end(&mut sink);
        let _ = self.send(&InitError {
            message: err.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_cross_the_pipe_in_order() {
        let (mut parent, child_fd) = ControlPipe::new().expect("create pipe");
        let mut child = ChildPipe::from_fd(child_fd).expect("wrap child end");

        parent.send(&PidRecord { pid: 99 }).expect("send pid");
        parent
            .send(&InitError {
                message: "boom".into(),
            })
            .expect("send error");

        let pid: PidRecord = child.recv().expect("recv").expect("record present");
        assert_eq!(pid.pid, 99);
        let err: InitError = child.recv().expect("recv").expect("record present");
        assert_eq!(err.message, "boom");
    }

    #[test]
    fn half_close_yields_eof_after_last_record() {
        let (mut parent, child_fd) = ControlPipe::new().expect("create pipe");
        let mut child = ChildPipe::from_fd(child_fd).expect("wrap child end");

        parent.send(&PidRecord { pid: 1 }).expect("send");
        parent.shutdown_write().expect("half-close");

        let _: PidRecord = child.recv().expect("recv").expect("record present");
        let eof: Option<PidRecord> = child.recv().expect("recv at eof");
        assert!(eof.is_none(), "EOF must follow the half-close");
    }

    #[test]
    fn child_error_report_reaches_supervisor() {
        let (mut parent, child_fd) = ControlPipe::new().expect("create pipe");
        let mut child = ChildPipe::from_fd(child_fd).expect("wrap child end");

        parent.send(&PidRecord { pid: 7 }).expect("send");
        parent.shutdown_write().expect("half-close");

        child.report_error(&BerthError::InitFailed {
            message: "exec failed".into(),
        });
        drop(child);

        let err: InitError = parent.recv().expect("recv").expect("record present");
        assert!(err.message.contains("exec failed"));
        let eof: Option<InitError> = parent.recv().expect("recv at eof");
        assert!(eof.is_none());
    }

    #[test]
    fn pid_record_uses_wire_field_name() {
        let json = serde_json::to_string(&PidRecord { pid: 42 }).expect("serialize");
        assert_eq!(json, r#"{"Pid":42}"#);
    }

    #[test]
    fn unparseable_record_is_an_error() {
        let (parent, child_fd) = ControlPipe::new().expect("create pipe");
        let mut child = ChildPipe::from_fd(child_fd).expect("wrap child end");

        use std::io::Write;
        let mut raw = &parent.writer;
        raw.write_all(b"not json\n").expect("write garbage");
        parent.shutdown_write().expect("half-close");

        let result: Result<Option<PidRecord>> = child.recv();
        assert!(matches!(result, Err(BerthError::Serialization { .. })));
    }
}
