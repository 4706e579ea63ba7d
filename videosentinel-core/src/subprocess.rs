//! Subprocess wrapper that consumes stderr on a dedicated thread.
//!
//! If stdout and stderr are both piped but only one is read, the OS pipe
//! buffer for the unread stream fills and the child blocks writing to it,
//! which in turn blocks the parent reading the other stream. Stderr is
//! consumed line-by-line from a dedicated reader thread to avoid that
//! deadlock.

use std::io::{BufRead, BufReader};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};

use tracing::info;

pub struct ManagedProcess {
    child: Child,
    stderr_thread: Option<JoinHandle<String>>,
}

impl ManagedProcess {
    pub fn spawn(cmd: &mut Command) -> std::io::Result<Self> {
        info!(command = ?cmd, "spawning subprocess");
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = cmd.spawn()?;

        let stderr = child.stderr.take().expect("stderr was requested as piped");
        let stderr_thread = thread::spawn(move || {
            let mut buf = String::new();
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                buf.push_str(&line);
                buf.push('\n');
            }
            buf
        });

        Ok(Self {
            child,
            stderr_thread: Some(stderr_thread),
        })
    }

    /// Feeds each stderr line to `on_line` as it arrives, instead of
    /// buffering silently until exit. Used to drive progress parsing.
    pub fn spawn_with_progress(
        cmd: &mut Command,
        mut on_line: impl FnMut(&str) + Send + 'static,
    ) -> std::io::Result<Self> {
        info!(command = ?cmd, "spawning subprocess with progress tracking");
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = cmd.spawn()?;

        let stderr = child.stderr.take().expect("stderr was requested as piped");
        let stderr_thread = thread::spawn(move || {
            let mut buf = String::new();
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                on_line(&line);
                buf.push_str(&line);
                buf.push('\n');
            }
            buf
        });

        Ok(Self {
            child,
            stderr_thread: Some(stderr_thread),
        })
    }

    pub fn wait_with_output(mut self) -> std::io::Result<(ExitStatus, String)> {
        let status = self.child.wait()?;
        let stderr = self
            .stderr_thread
            .take()
            .map(|t| t.join().unwrap_or_default())
            .unwrap_or_default();
        Ok((status, stderr))
    }
}
