//! Transport layer.
//!
//! A transport carries newline-delimited frames to and from a tool server.
//! Because a connection has exactly one reader (the dispatcher), every
//! transport splits into a sink half and a source half at establishment;
//! the source moves into the reader task while the dispatcher keeps the
//! sink.
//!
//! The primary transport spawns a child process and speaks over its
//! stdin/stdout. [`StreamTransport`] covers anything that is a plain byte
//! stream: TCP sockets via [`connect_tcp`], or in-memory duplex pipes in
//! tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use crate::codec::MAX_FRAME_LEN;
use crate::error::TransportError;

/// Write half of a transport. Owned by the dispatcher.
#[async_trait]
pub trait FrameSink: Send {
    /// Send one frame (a single line, newline appended here).
    async fn send(&mut self, frame: &str) -> Result<(), TransportError>;

    /// Close the transport, releasing any underlying resources. For
    /// process-backed transports this terminates and reaps the child.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read half of a transport. Owned by the reader task.
#[async_trait]
pub trait FrameSource: Send {
    /// Receive the next frame. `Ok(None)` signals clean EOF.
    async fn receive(&mut self) -> Result<Option<String>, TransportError>;
}

/// A bidirectional channel to a tool server, not yet split.
pub trait Transport: Send {
    /// Split into the two halves a connection needs.
    fn split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameSource>);
}

/// Line-oriented source over any buffered reader.
pub struct ReadSource<R> {
    reader: R,
}

impl<R> ReadSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> FrameSource for ReadSource<R> {
    async fn receive(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            let mut line = String::new();
            let bytes_read = self
                .reader
                .read_line(&mut line)
                .await
                .map_err(TransportError::Read)?;

            if bytes_read == 0 {
                return Ok(None);
            }
            if bytes_read > MAX_FRAME_LEN {
                // Surface via the codec's length check so the caller gets a
                // DecodeError rather than a truncated parse.
                return Ok(Some(line));
            }

            let frame = line.trim_end();
            if frame.is_empty() {
                continue; // tolerate blank lines between frames
            }
            return Ok(Some(frame.to_string()));
        }
    }
}

/// Line-oriented sink over any writer.
pub struct WriteSink<W> {
    writer: W,
    connected: bool,
}

impl<W> WriteSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            connected: true,
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameSink for WriteSink<W> {
    async fn send(&mut self, frame: &str) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }

        self.writer
            .write_all(frame.as_bytes())
            .await
            .map_err(TransportError::Write)?;
        self.writer
            .write_all(b"\n")
            .await
            .map_err(TransportError::Write)?;
        self.writer.flush().await.map_err(TransportError::Write)?;

        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        self.writer.shutdown().await.map_err(TransportError::Write)?;
        Ok(())
    }
}

/// Transport over an arbitrary byte stream pair.
pub struct StreamTransport<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }
}

impl<R, W> Transport for StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameSource>) {
        (
            Box::new(WriteSink::new(self.writer)),
            Box::new(ReadSource::new(BufReader::new(self.reader))),
        )
    }
}

/// Connect to a tool server listening on a TCP socket.
pub async fn connect_tcp(
    addr: impl ToSocketAddrs,
) -> Result<StreamTransport<OwnedReadHalf, OwnedWriteHalf>, TransportError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(TransportError::ConnectFailed)?;
    let (read, write) = stream.into_split();
    Ok(StreamTransport::new(read, write))
}

/// Standard I/O transport: spawns a child process and frames messages over
/// its stdin/stdout.
pub struct StdioTransport {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl StdioTransport {
    /// Spawn a new server process.
    ///
    /// Stderr passes through for server-side diagnostics. The child is
    /// killed if the handle is dropped without an explicit close.
    pub async fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        working_dir: Option<&PathBuf>,
    ) -> Result<Self, TransportError> {
        debug!(command, ?args, "spawning tool server process");

        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        for (key, value) in env {
            cmd.env(key, value);
        }
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(TransportError::SpawnFailed)?;

        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::SpawnFailed(std::io::Error::other("failed to capture stdin"))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::SpawnFailed(std::io::Error::other("failed to capture stdout"))
        })?;

        debug!(pid = child.id(), "tool server process spawned");

        Ok(Self {
            child,
            stdin,
            stdout,
        })
    }

    /// Process ID of the spawned server, while running.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

impl Transport for StdioTransport {
    fn split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameSource>) {
        (
            Box::new(StdioSink {
                stdin: Some(self.stdin),
                child: self.child,
                connected: true,
            }),
            Box::new(ReadSource::new(BufReader::new(self.stdout))),
        )
    }
}

/// Sink half for a spawned process. Owns the child handle so that closing
/// the connection terminates and reaps the server.
pub struct StdioSink {
    stdin: Option<ChildStdin>,
    child: Child,
    connected: bool,
}

#[async_trait]
impl FrameSink for StdioSink {
    async fn send(&mut self, frame: &str) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        let stdin = self.stdin.as_mut().ok_or(TransportError::NotConnected)?;

        stdin
            .write_all(frame.as_bytes())
            .await
            .map_err(TransportError::Write)?;
        stdin.write_all(b"\n").await.map_err(TransportError::Write)?;
        stdin.flush().await.map_err(TransportError::Write)?;

        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;

        // Dropping stdin signals EOF; well-behaved servers exit on it.
        drop(self.stdin.take());

        if let Some(pid) = self.child.id() {
            debug!(pid, "terminating tool server");

            #[cfg(unix)]
            {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;

                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);

                tokio::select! {
                    _ = self.child.wait() => {
                        debug!("tool server exited gracefully");
                    }
                    _ = tokio::time::sleep(std::time::Duration::from_secs(2)) => {
                        warn!("tool server did not exit after SIGTERM, killing");
                        let _ = self.child.kill().await;
                    }
                }
            }

            #[cfg(not(unix))]
            {
                let _ = self.child.kill().await;
            }
        } else {
            // Already exited; reap it.
            let _ = self.child.wait().await;
        }

        Ok(())
    }
}
