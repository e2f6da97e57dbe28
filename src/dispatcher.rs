//! The pool dispatcher: fans a call stream across identical worker
//! subprocesses and replaces crashed workers transparently.

use std::future::Future;
use std::path::MAIN_SEPARATOR;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::call::Call;
use crate::catalog::Catalog;
use crate::error::{Error, Result};
use crate::payload;
use crate::worker::{StdioWorker, Worker};

const FN_SET_EPHE_PATH: &str = "swe_set_ephe_path";
const FN_CLOSE: &str = "swe_close";
const FN_VERSION: &str = "swe_version";

const LIST_SEPARATOR: &str = if cfg!(windows) { ";" } else { ":" };

type ErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;
type SpawnFuture = Pin<Box<dyn Future<Output = Result<(Arc<dyn Worker>, Catalog)>> + Send>>;
type WorkerFactory = Arc<dyn Fn(String, Vec<String>) -> SpawnFuture + Send + Sync>;

fn stdio_factory() -> WorkerFactory {
    Arc::new(|path, args| {
        Box::pin(async move {
            let (worker, catalog) = StdioWorker::spawn(&path, &args).await?;
            Ok((worker as Arc<dyn Worker>, catalog))
        })
    })
}

struct Task {
    call: Call,
    result: oneshot::Sender<Result<Bytes>>,
}

struct Shared {
    path: String,
    data: String,
    worker_args: Vec<String>,
    catalog: Catalog,
    workers: RwLock<Vec<Arc<dyn Worker>>>,
    queue_rx: Arc<Mutex<mpsc::Receiver<Task>>>,
    crashed_tx: mpsc::Sender<Arc<dyn Worker>>,
    consumers: StdMutex<Vec<JoinHandle<()>>>,
    on_new_error: Option<ErrorCallback>,
    on_exit_error: Option<ErrorCallback>,
    factory: WorkerFactory,
}

/// Configures a [`Dispatcher`] before it starts its worker pool.
pub struct Builder {
    path: String,
    workers: usize,
    data: String,
    worker_args: Vec<String>,
    on_new_error: Option<ErrorCallback>,
    on_exit_error: Option<ErrorCallback>,
    factory: WorkerFactory,
}

impl Builder {
    fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            workers: 0,
            data: String::new(),
            worker_args: Vec::new(),
            on_new_error: None,
            on_exit_error: None,
            factory: stdio_factory(),
        }
    }

    /// Number of worker processes to start. Zero means the number of
    /// logical processors usable by the current process.
    pub fn num_workers(mut self, num: usize) -> Self {
        self.workers = num;
        self
    }

    /// Ephemeris data paths passed to each worker through
    /// `swe_set_ephe_path` before it accepts tasks. The paths are
    /// combined into one separator-joined list.
    pub fn data_path<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.data = combine_data_paths(paths);
        self
    }

    /// Extra command-line arguments for the worker binary, e.g. the
    /// flag gating its dangerous test functions.
    pub fn worker_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.worker_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Called when a crashed worker could not be replaced. For
    /// observability only; it does not influence control flow.
    pub fn on_new_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.on_new_error = Some(Arc::new(f));
        self
    }

    /// Called with the exit error of a crashed worker.
    pub fn on_exit_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.on_exit_error = Some(Arc::new(f));
        self
    }

    #[cfg(test)]
    fn factory(mut self, factory: WorkerFactory) -> Self {
        self.factory = factory;
        self
    }

    /// Starts the worker pool and the crash supervisor. If any worker
    /// fails to start, the ones already running are shut down and the
    /// error is returned.
    pub async fn build(self) -> Result<Dispatcher> {
        let procs = if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        };

        let (queue_tx, queue_rx) = mpsc::channel(1);
        let (crashed_tx, crashed_rx) = mpsc::channel(1);

        // The first worker fixes the catalog for the whole pool.
        let (first, catalog) =
            (self.factory)(self.path.clone(), self.worker_args.clone()).await?;

        let shared = Arc::new(Shared {
            path: self.path,
            data: self.data,
            worker_args: self.worker_args,
            catalog,
            workers: RwLock::new(Vec::with_capacity(procs)),
            queue_rx: Arc::new(Mutex::new(queue_rx)),
            crashed_tx,
            consumers: StdMutex::new(Vec::new()),
            on_new_error: self.on_new_error,
            on_exit_error: self.on_exit_error,
            factory: self.factory,
        });

        let dispatcher = Dispatcher {
            shared: Arc::clone(&shared),
            queue_tx: StdMutex::new(Some(queue_tx)),
            done_tx: StdMutex::new(None),
            closed_rx: Mutex::new(None),
        };

        init_worker(&shared, &first).await;
        install_worker(&shared, first).await;

        for _ in 1..procs {
            match start_worker(&shared).await {
                Ok(worker) => install_worker(&shared, worker).await,
                Err(e) => {
                    let _ = dispatcher.close().await;
                    return Err(e);
                }
            }
        }

        let (done_tx, done_rx) = oneshot::channel();
        let (closed_tx, closed_rx) = oneshot::channel();
        tokio::spawn(supervise(Arc::clone(&shared), crashed_rx, done_rx, closed_tx));
        *dispatcher.done_tx.lock().unwrap() = Some(done_tx);
        *dispatcher.closed_rx.lock().await = Some(closed_rx);

        Ok(dispatcher)
    }
}

/// Routes calls to a pool of identical worker subprocesses.
///
/// Each worker is used exclusively for the duration of one call; a
/// crashed worker is retired and a replacement started in its slot
/// without stalling the other workers. Dispatching applies no timeouts
/// and no retries.
pub struct Dispatcher {
    shared: Arc<Shared>,
    queue_tx: StdMutex<Option<mpsc::Sender<Task>>>,
    done_tx: StdMutex<Option<oneshot::Sender<()>>>,
    closed_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl Dispatcher {
    /// Starts a dispatcher with default options for the worker binary
    /// at `path`.
    pub async fn new(path: impl Into<String>) -> Result<Self> {
        Self::builder(path).build().await
    }

    pub fn builder(path: impl Into<String>) -> Builder {
        Builder::new(path)
    }

    /// Sends `call` to an idle worker and waits for its reply payload.
    ///
    /// Fails with [`Error::Unimplemented`] before touching any worker
    /// if the function index is outside the catalog. The task queue is
    /// unbuffered; submitting faster than the pool drains blocks here.
    pub async fn dispatch(&self, call: Call) -> Result<Bytes> {
        if call.func > self.shared.catalog.last_idx() {
            return Err(Error::Unimplemented(call.func));
        }

        let queue_tx = self
            .queue_tx
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::Closed)?;

        let (result_tx, result_rx) = oneshot::channel();
        queue_tx
            .send(Task {
                call,
                result: result_tx,
            })
            .await
            .map_err(|_| Error::Closed)?;

        result_rx.await.map_err(|_| Error::Closed)?
    }

    /// Looks up a function index by name. The mapping is specific to
    /// the worker binary and version and must not be cached by clients.
    pub fn index_for_name(&self, name: &str) -> Option<u8> {
        self.shared.catalog.lookup(name)
    }

    /// The function catalog reported by the pool's workers.
    pub fn catalog(&self) -> &Catalog {
        &self.shared.catalog
    }

    /// The file system path of the worker binary.
    pub fn path(&self) -> &str {
        &self.shared.path
    }

    /// The combined ephemeris data path list sent to the workers.
    pub fn data_path(&self) -> &str {
        &self.shared.data
    }

    /// The configured ephemeris data paths, one per entry.
    pub fn data_paths(&self) -> Vec<String> {
        if self.shared.data.is_empty() {
            return Vec::new();
        }

        self.shared
            .data
            .split(LIST_SEPARATOR)
            .map(|p| p.strip_suffix(MAIN_SEPARATOR).unwrap_or(p).to_string())
            .collect()
    }

    /// Shuts the pool down: drains the task queue, stops the
    /// supervisor, and waits until every worker has been asked to
    /// close. Safe to call more than once.
    pub async fn close(&self) -> Result<()> {
        self.queue_tx.lock().unwrap().take();

        if let Some(done) = self.done_tx.lock().unwrap().take() {
            let _ = done.send(());
        }

        let closed_rx = self.closed_rx.lock().await.take();
        if let Some(closed_rx) = closed_rx {
            let _ = closed_rx.await;
        }

        let consumers: Vec<_> = {
            let mut consumers = self.shared.consumers.lock().unwrap();
            consumers.drain(..).collect()
        };
        for consumer in consumers {
            let _ = consumer.await;
        }

        Ok(())
    }
}

/// Returns the Swiss Ephemeris version linked into the worker binary at
/// `path`, using a short-lived worker of its own.
pub async fn version(path: &str) -> Result<String> {
    let (worker, catalog) = StdioWorker::spawn(path, &[]).await?;

    let result = version_call(&*worker, &catalog).await;
    let exit_result = worker.exit().await;

    match result {
        Ok(v) => exit_result.map(|_| v),
        Err(e) => Err(e),
    }
}

async fn version_call(worker: &dyn Worker, catalog: &Catalog) -> Result<String> {
    let func = catalog
        .lookup(FN_VERSION)
        .ok_or_else(|| Error::FunctionNotFound(FN_VERSION.to_string()))?;

    let reply = worker.call(&Call::new(func)).await?;

    let mut values: Vec<String> = rmp_serde::from_slice(&reply)
        .map_err(|_| Error::UnexpectedReply("version is not an array of strings"))?;
    if values.len() != 1 {
        return Err(Error::UnexpectedReply("version array must hold one element"));
    }

    Ok(values.remove(0))
}

async fn start_worker(shared: &Arc<Shared>) -> Result<Arc<dyn Worker>> {
    let (worker, catalog) =
        (shared.factory)(shared.path.clone(), shared.worker_args.clone()).await?;

    // All slots must run the same binary and version; a diverging
    // catalog is a deployment error worth surfacing.
    if catalog != shared.catalog {
        warn!(path = %shared.path, "worker reported a different function catalog");
    }

    init_worker(shared, &worker).await;
    Ok(worker)
}

async fn init_worker(shared: &Shared, worker: &Arc<dyn Worker>) {
    if shared.data.is_empty() {
        return;
    }
    let Some(func) = shared.catalog.lookup(FN_SET_EPHE_PATH) else {
        return;
    };

    match payload::encode_str_args(&shared.data) {
        Ok(args) => {
            if let Err(e) = worker.call(&Call::with_args(func, args)).await {
                warn!(error = %e, "failed to set worker data path");
            }
        }
        Err(e) => warn!(error = %e, "failed to encode data path arguments"),
    }
}

async fn install_worker(shared: &Arc<Shared>, worker: Arc<dyn Worker>) {
    shared.workers.write().await.push(Arc::clone(&worker));
    spawn_consumer(shared, worker);
}

fn spawn_consumer(shared: &Arc<Shared>, worker: Arc<dyn Worker>) {
    let handle = tokio::spawn(run_worker(Arc::clone(shared), worker));
    shared.consumers.lock().unwrap().push(handle);
}

/// Per-worker task consumer. Holds a shared lock on the slot table for
/// the duration of each call so a crashing neighbor can be replaced
/// without stalling this worker.
async fn run_worker(shared: Arc<Shared>, worker: Arc<dyn Worker>) {
    loop {
        let task = { shared.queue_rx.lock().await.recv().await };
        let Some(task) = task else { break };

        let slots = shared.workers.read().await;

        let result = worker.call(&task.call).await;
        let crashed = result.as_ref().err().map_or(false, Error::is_crash);
        let _ = task.result.send(result);

        if crashed {
            if let Err(e) = worker.exit().await {
                if let Some(cb) = &shared.on_exit_error {
                    cb(&e);
                }
            }

            let _ = shared.crashed_tx.send(Arc::clone(&worker)).await;
            drop(slots);
            return;
        }

        drop(slots);
    }

    // Queue closed: say goodbye, then shut the subprocess down.
    if let Some(func) = shared.catalog.lookup(FN_CLOSE) {
        let _ = worker.call(&Call::new(func)).await;
    }
    let _ = worker.exit().await;
}

async fn supervise(
    shared: Arc<Shared>,
    mut crashed_rx: mpsc::Receiver<Arc<dyn Worker>>,
    mut done_rx: oneshot::Receiver<()>,
    closed_tx: oneshot::Sender<()>,
) {
    loop {
        tokio::select! {
            Some(crashed) = crashed_rx.recv() => {
                replace_worker(&shared, crashed).await;
            }
            _ = &mut done_rx => {
                let _ = closed_tx.send(());
                return;
            }
        }
    }
}

async fn replace_worker(shared: &Arc<Shared>, crashed: Arc<dyn Worker>) {
    let mut slots = shared.workers.write().await;

    let Some(slot) = slots.iter().position(|w| Arc::ptr_eq(w, &crashed)) else {
        return;
    };

    match start_worker(shared).await {
        Ok(worker) => {
            debug!(slot, "replaced crashed worker");
            slots[slot] = Arc::clone(&worker);
            spawn_consumer(shared, worker);
        }
        Err(e) => {
            warn!(slot, error = %e, "failed to start a replacement worker");
            if let Some(cb) = &shared.on_new_error {
                cb(&e);
            }
        }
    }
}

fn combine_data_paths<I, S>(paths: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut combined = Vec::new();

    for path in paths {
        let mut path = path.as_ref().to_string();
        if !path.ends_with(MAIN_SEPARATOR) {
            path.push(MAIN_SEPARATOR);
        }

        combined.push(path);
    }

    combined.join(LIST_SEPARATOR)
}
