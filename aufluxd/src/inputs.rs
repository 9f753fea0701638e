use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

/// Accepts collector connections on the input socket and hands their bytes
/// to the audit input loop.
///
/// The listener and all connections are non-blocking; `handle_data` polls
/// them with a short timeout so the caller can flush the parser on idle and
/// observe shutdown.
pub struct Inputs {
    path: PathBuf,
    listener: UnixListener,
    conns: Vec<UnixStream>,
    buf: Vec<u8>,
}

impl Inputs {
    pub fn new(path: &Path) -> anyhow::Result<Inputs> {
        if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("cannot remove stale socket {}", path.display()))?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }
        let listener = UnixListener::bind(path)
            .with_context(|| format!("cannot bind input socket {}", path.display()))?;
        listener
            .set_nonblocking(true)
            .context("cannot make input socket non-blocking")?;
        Ok(Inputs {
            path: path.to_path_buf(),
            listener,
            conns: Vec::new(),
            buf: vec![0u8; 64 * 1024],
        })
    }

    /// Wait up to `timeout` for input; feed each received chunk to `sink`.
    /// Returns the number of chunks delivered.
    pub fn handle_data<F>(&mut self, timeout: Duration, mut sink: F) -> io::Result<usize>
    where
        F: FnMut(&[u8]),
    {
        let mut fds = Vec::with_capacity(self.conns.len() + 1);
        fds.push(PollFd::new(self.listener.as_fd(), PollFlags::POLLIN));
        for conn in &self.conns {
            fds.push(PollFd::new(conn.as_fd(), PollFlags::POLLIN));
        }
        let timeout = PollTimeout::try_from(timeout.as_millis().min(60_000) as u16)
            .unwrap_or(PollTimeout::MAX);
        match poll(&mut fds, timeout) {
            Ok(0) => return Ok(0),
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => return Ok(0),
            Err(err) => return Err(io::Error::from_raw_os_error(err as i32)),
        }
        drop(fds);

        // new connections
        loop {
            match self.listener.accept() {
                Ok((conn, _)) => {
                    conn.set_nonblocking(true)?;
                    log::info!("input connection accepted");
                    self.conns.push(conn);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err),
            }
        }

        // drain readable connections; closed ones drop out
        let mut chunks = 0usize;
        let mut idx = 0;
        while idx < self.conns.len() {
            match self.conns[idx].read(&mut self.buf) {
                Ok(0) => {
                    log::info!("input connection closed");
                    self.conns.swap_remove(idx);
                }
                Ok(n) => {
                    sink(&self.buf[..n]);
                    chunks += 1;
                    idx += 1;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    idx += 1;
                }
                Err(err) => {
                    log::warn!("input connection error: {err}");
                    self.conns.swap_remove(idx);
                }
            }
        }
        Ok(chunks)
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    pub fn socket_fd(&self) -> i32 {
        self.listener.as_raw_fd()
    }
}

impl Drop for Inputs {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
