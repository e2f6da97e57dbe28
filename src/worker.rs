//! One worker subprocess: spawn, handshake, call, exit.
//!
//! A handle owns the process plus three background tasks: a stdout
//! frame producer, a stderr diagnostic producer, and an exit waiter.
//! Calls serialize through the handle; the N-th reply frame always
//! answers the N-th request frame.

use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::call::Call;
use crate::catalog::Catalog;
use crate::diag::{DiagnosticScanner, WorkerError};
use crate::error::{Error, Result};
use crate::frame::{self, FrameWriter};
use crate::payload;

/// The dispatcher's view of a worker. Implemented by [`StdioWorker`]
/// and by scripted doubles in the dispatcher tests.
#[async_trait]
pub(crate) trait Worker: Send + Sync {
    async fn call(&self, call: &Call) -> Result<Bytes>;
    async fn exit(&self) -> Result<()>;
}

#[derive(Clone, Debug)]
enum WaitState {
    Running,
    Exited(Option<String>),
}

impl WaitState {
    fn exited(&self) -> bool {
        matches!(self, WaitState::Exited(_))
    }
}

enum Event {
    Frame(Bytes),
    Panic(WorkerError),
    Exited,
}

type CopyErr = Arc<StdMutex<Option<String>>>;

/// A worker subprocess driven over its standard streams.
pub(crate) struct StdioWorker {
    stdin: Mutex<FrameWriter<ChildStdin>>,
    out: Mutex<mpsc::Receiver<Bytes>>,
    err: Mutex<mpsc::Receiver<WorkerError>>,
    waited: watch::Receiver<WaitState>,
}

impl StdioWorker {
    /// Spawns the worker binary and completes the handshake: the first
    /// stdout frame must decode as the function catalog. A panic or
    /// exit before that frame fails with [`Error::NoFuncs`].
    pub(crate) async fn spawn(path: &str, args: &[String]) -> Result<(Arc<Self>, Catalog)> {
        let mut child = Command::new(path)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdin = take_pipe(child.stdin.take())?;
        let stdout = take_pipe(child.stdout.take())?;
        let stderr = take_pipe(child.stderr.take())?;

        let (out_tx, out_rx) = mpsc::channel(1);
        let (err_tx, err_rx) = mpsc::channel(1);
        let (waited_tx, waited_rx) = watch::channel(WaitState::Running);
        let copy_err: CopyErr = Arc::new(StdMutex::new(None));

        let out_task = tokio::spawn(read_stdout(stdout, out_tx, Arc::clone(&copy_err)));
        let err_task = tokio::spawn(read_stderr(stderr, err_tx, Arc::clone(&copy_err)));
        tokio::spawn(wait_for_exit(child, out_task, err_task, waited_tx, copy_err));

        let worker = Arc::new(Self {
            stdin: Mutex::new(FrameWriter::new(stdin)),
            out: Mutex::new(out_rx),
            err: Mutex::new(err_rx),
            waited: waited_rx,
        });

        let catalog = worker.handshake().await?;
        Ok((worker, catalog))
    }

    async fn handshake(&self) -> Result<Catalog> {
        let data = match self.next_event().await {
            Event::Frame(data) => data,
            Event::Panic(rec) => {
                self.wait().await;
                return Err(Error::NoFuncs(Box::new(Error::Worker(rec))));
            }
            Event::Exited => {
                let cause = match self.wait_error() {
                    Some(msg) => Error::WorkerExit(msg),
                    None => Error::ProcessExited,
                };
                return Err(Error::NoFuncs(Box::new(cause)));
            }
        };

        let names = payload::decode_funcs(&data).map_err(|e| Error::NoFuncs(Box::new(e)))?;
        Catalog::new(names).map_err(|e| Error::NoFuncs(Box::new(e)))
    }

    /// One step of the three-stream select. Biased so that a buffered
    /// panic record always wins over the exit signal; the exit waiter
    /// joins the stream tasks first, so pending diagnostics are
    /// published before the exit state is.
    async fn next_event(&self) -> Event {
        let mut out = self.out.lock().await;
        let mut err = self.err.lock().await;
        let mut waited = self.waited.clone();

        let mut out_open = true;
        let mut err_open = true;
        loop {
            tokio::select! {
                biased;

                frame = out.recv(), if out_open => match frame {
                    Some(data) => return Event::Frame(data),
                    None => out_open = false,
                },
                rec = err.recv(), if err_open => match rec {
                    Some(rec) => return Event::Panic(rec),
                    None => err_open = false,
                },
                _ = waited.wait_for(WaitState::exited) => return Event::Exited,
            }
        }
    }

    async fn wait(&self) {
        let mut waited = self.waited.clone();
        let _ = waited.wait_for(WaitState::exited).await;
    }

    fn exited(&self) -> bool {
        self.waited.borrow().exited()
    }

    fn wait_error(&self) -> Option<String> {
        match &*self.waited.borrow() {
            WaitState::Exited(err) => err.clone(),
            WaitState::Running => None,
        }
    }
}

#[async_trait]
impl Worker for StdioWorker {
    async fn call(&self, call: &Call) -> Result<Bytes> {
        if self.exited() {
            return Err(Error::ProcessExited);
        }

        let data = call.encode()?;
        self.stdin.lock().await.write_frame(&data).await?;

        match self.next_event().await {
            Event::Frame(reply) => {
                if payload::is_map(&reply) {
                    Err(Error::Worker(payload::decode_error_map(&reply)?))
                } else {
                    Ok(reply)
                }
            }
            Event::Panic(rec) => {
                // A panic implies process death; don't report back
                // before the process is actually gone.
                self.wait().await;
                Err(Error::Worker(rec))
            }
            Event::Exited => Err(Error::UnexpectedExit {
                cause: self
                    .wait_error()
                    .unwrap_or_else(|| "process exited cleanly".to_string()),
            }),
        }
    }

    async fn exit(&self) -> Result<()> {
        if !self.exited() {
            // The worker reads a bare newline (an unreadable frame
            // length) as the request to exit cleanly. Write errors are
            // ignored; the process may already be going down.
            let mut stdin = self.stdin.lock().await;
            let _ = stdin.write_newline().await;
            drop(stdin);

            self.wait().await;
        }

        match self.wait_error() {
            None => Ok(()),
            Some(msg) => Err(Error::WorkerExit(msg)),
        }
    }
}

fn take_pipe<T>(pipe: Option<T>) -> Result<T> {
    pipe.ok_or_else(|| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "subprocess pipe not captured",
        ))
    })
}

async fn read_stdout(stdout: ChildStdout, tx: mpsc::Sender<Bytes>, copy_err: CopyErr) {
    let mut r = BufReader::new(stdout);

    loop {
        // Distinguish clean end-of-stream from a truncated frame.
        let at_eof = match r.fill_buf().await {
            Ok(buf) => buf.is_empty(),
            Err(e) => {
                set_copy_err(&copy_err, e.to_string());
                return;
            }
        };
        if at_eof {
            return;
        }

        match frame::read_frame(&mut r).await {
            Ok(payload) => {
                if tx.send(Bytes::from(payload)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                // Returning drops the pipe; the worker dies on its next
                // write and the exit waiter reports this error.
                warn!(error = %e, "worker stdout framing failed");
                set_copy_err(&copy_err, e.to_string());
                return;
            }
        }
    }
}

async fn read_stderr(mut stderr: ChildStderr, tx: mpsc::Sender<WorkerError>, copy_err: CopyErr) {
    let mut scanner = DiagnosticScanner::new();
    let mut buf = [0u8; 4096];

    loop {
        match stderr.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => {
                for rec in scanner.feed(&buf[..n]) {
                    if tx.send(rec).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                set_copy_err(&copy_err, e.to_string());
                return;
            }
        }
    }
}

async fn wait_for_exit(
    mut child: Child,
    out_task: JoinHandle<()>,
    err_task: JoinHandle<()>,
    waited_tx: watch::Sender<WaitState>,
    copy_err: CopyErr,
) {
    let status = child.wait().await;

    // Pending frames and panic records must be published before the
    // exit signal fires.
    let _ = out_task.await;
    let _ = err_task.await;

    let err = match status {
        Ok(status) if status.success() => take_copy_err(&copy_err),
        Ok(status) => Some(status.to_string()),
        Err(e) => Some(e.to_string()),
    };

    let _ = waited_tx.send(WaitState::Exited(err));
}

fn set_copy_err(slot: &StdMutex<Option<String>>, msg: String) {
    let mut slot = slot.lock().unwrap();
    if slot.is_none() {
        *slot = Some(msg);
    }
}

fn take_copy_err(slot: &StdMutex<Option<String>>) -> Option<String> {
    slot.lock().unwrap().take()
}
