use crate::bulk::{settle, ExportQuery, ImportQuery, TransferOptions, TransferReport};
use crate::session::Session;
use exaconn_core::error::{ExaError, Result};
use exaconn_protocol::tunnel::ProxyAddress;
use exaconn_transport::endpoint::{TransferStats, TunnelEndpoint, TunnelMode};
use exaconn_transport::process::{ProcessWorker, ProcessWorkerConfig};
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use metrics::counter;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tracing::{debug, info, warn};

pub type BoxedSink = Box<dyn AsyncWrite + Unpin + Send>;
pub type BoxedSource = Box<dyn AsyncRead + Unpin + Send>;

/// Where a worker runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerMode {
    /// A tokio task in this process.
    Task,
    /// A child `exaconn-tunnel` process exchanging data through files.
    Process { program: PathBuf },
}

#[derive(Debug, Clone)]
pub struct ParallelOptions {
    pub workers: usize,
    pub transfer: TransferOptions,
    pub mode: WorkerMode,
    /// How long a child process may take to report its proxy address.
    pub startup_timeout: Duration,
}

impl ParallelOptions {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            transfer: TransferOptions::default(),
            mode: WorkerMode::Task,
            startup_timeout: Duration::from_secs(30),
        }
    }

    pub fn transfer(mut self, transfer: TransferOptions) -> Self {
        self.transfer = transfer;
        self
    }

    pub fn processes(mut self, program: impl Into<PathBuf>) -> Self {
        self.mode = WorkerMode::Process {
            program: program.into(),
        };
        self
    }
}

enum WorkerIo {
    Sink(BoxedSink),
    Source(BoxedSource),
    File(PathBuf),
}

type Joined = (usize, std::result::Result<Result<TransferStats>, JoinError>);

/// Running workers of one bulk job. Dropping the job aborts every worker
/// that has not finished; child processes die with their task.
struct BulkJob {
    pending: FuturesUnordered<BoxFuture<'static, Joined>>,
    aborts: Vec<AbortHandle>,
    stats: Vec<TransferStats>,
}

impl BulkJob {
    fn new(handles: Vec<JoinHandle<Result<TransferStats>>>) -> Self {
        let aborts = handles.iter().map(JoinHandle::abort_handle).collect();
        let stats = vec![TransferStats::default(); handles.len()];
        let pending = handles
            .into_iter()
            .enumerate()
            .map(|(index, handle)| handle.map(move |joined| (index, joined)).boxed())
            .collect();
        Self {
            pending,
            aborts,
            stats,
        }
    }

    /// Waits for every worker. The first failure stops the others.
    async fn wait_all(&mut self) -> Result<()> {
        while let Some((index, joined)) = self.pending.next().await {
            let outcome = joined.unwrap_or_else(|e| {
                Err(ExaError::Worker {
                    index,
                    message: e.to_string(),
                })
            });
            match outcome {
                Ok(stats) => {
                    debug!(worker = index, ?stats, "worker finished");
                    self.stats[index] = stats;
                }
                Err(err) => {
                    warn!(worker = index, "worker failed: {err}");
                    counter!("exaconn_worker_failures_total").increment(1);
                    self.abort_all();
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Stops every worker after the statement failed. Reports a failure a
    /// worker hit before the stop; cancelled workers are not failures.
    async fn cancel(&mut self) -> Result<()> {
        self.abort_all();
        let mut first = None;
        while let Some((index, joined)) = self.pending.next().await {
            let err = match joined {
                Ok(Ok(stats)) => {
                    self.stats[index] = stats;
                    continue;
                }
                Ok(Err(err)) => err,
                Err(join) if join.is_cancelled() => continue,
                Err(join) => ExaError::Worker {
                    index,
                    message: join.to_string(),
                },
            };
            debug!(worker = index, "worker failed before cancellation: {err}");
            first.get_or_insert(err);
        }
        first.map_or(Ok(()), Err)
    }

    fn abort_all(&mut self) {
        for abort in &self.aborts {
            abort.abort();
        }
    }
}

impl Drop for BulkJob {
    fn drop(&mut self) {
        self.abort_all();
    }
}

async fn task_worker(
    index: usize,
    address: SocketAddr,
    mode: TunnelMode,
    transfer: TransferOptions,
    io: WorkerIo,
    proxy_tx: oneshot::Sender<ProxyAddress>,
) -> Result<TransferStats> {
    let endpoint = TunnelEndpoint::connect(transfer.tunnel(address)).await?;
    debug!(worker = index, proxy = %endpoint.proxy(), "worker ready");
    let _ = proxy_tx.send(endpoint.proxy().clone());
    match (mode, io) {
        (TunnelMode::Export, WorkerIo::Sink(mut sink)) => endpoint.export_to(&mut sink).await,
        (TunnelMode::Import, WorkerIo::Source(mut source)) => endpoint.import_from(&mut source).await,
        (TunnelMode::Export, WorkerIo::File(path)) => {
            let mut file = tokio::fs::File::create(&path).await.map_err(callback_error)?;
            endpoint.export_to(&mut file).await
        }
        (TunnelMode::Import, WorkerIo::File(path)) => {
            let mut file = tokio::fs::File::open(&path).await.map_err(callback_error)?;
            endpoint.import_from(&mut file).await
        }
        (mode, _) => Err(ExaError::Runtime(format!(
            "worker {index} got data of the wrong direction for {}",
            mode.as_str()
        ))),
    }
}

fn callback_error(err: std::io::Error) -> ExaError {
    ExaError::Callback(err.to_string())
}

async fn process_worker(
    index: usize,
    config: ProcessWorkerConfig,
    proxy_tx: oneshot::Sender<ProxyAddress>,
) -> Result<TransferStats> {
    let mut worker = ProcessWorker::spawn(index, &config).await?;
    let _ = proxy_tx.send(worker.proxy().clone());
    worker.wait().await
}

/// Starts one worker per `io` entry and collects their proxy addresses in order.
async fn start_workers(
    session: &Session,
    mode: TunnelMode,
    options: &ParallelOptions,
    io: Vec<WorkerIo>,
) -> Result<(BulkJob, Vec<ProxyAddress>)> {
    let nodes = session.get_nodes(io.len()).await?;
    let mut handles = Vec::with_capacity(io.len());
    let mut receivers = Vec::with_capacity(io.len());
    for (index, (io, node)) in io.into_iter().zip(nodes).enumerate() {
        let (tx, rx) = oneshot::channel();
        let handle = match (&options.mode, io) {
            (WorkerMode::Process { program }, WorkerIo::File(file)) => {
                let mut config = ProcessWorkerConfig::new(node, mode, file);
                config.program = program.clone();
                config.compression = options.transfer.compression;
                config.encryption = options.transfer.encryption;
                config.startup_timeout = options.startup_timeout;
                tokio::spawn(process_worker(index, config, tx))
            }
            (WorkerMode::Process { .. }, _) => {
                return Err(ExaError::Runtime(
                    "process workers exchange data through files only".into(),
                ));
            }
            (WorkerMode::Task, io) => {
                tokio::spawn(task_worker(index, node, mode, options.transfer, io, tx))
            }
        };
        handles.push(handle);
        receivers.push(rx);
    }

    let mut proxies = Vec::with_capacity(receivers.len());
    for (index, rx) in receivers.into_iter().enumerate() {
        match rx.await {
            Ok(proxy) => proxies.push(proxy),
            Err(_) => {
                let err = match (&mut handles[index]).await {
                    Ok(Err(err)) => err,
                    Ok(Ok(_)) => ExaError::Worker {
                        index,
                        message: "worker finished without reporting a proxy address".into(),
                    },
                    Err(join) => ExaError::Worker {
                        index,
                        message: join.to_string(),
                    },
                };
                for handle in &handles {
                    handle.abort();
                }
                return Err(err);
            }
        }
    }
    Ok((BulkJob::new(handles), proxies))
}

/// Runs the statement while the workers move data. A failed worker aborts
/// the statement and a failed statement stops the workers; either way both
/// sides are settled before the error is picked.
async fn run_job(session: &Session, sql: String, mut job: BulkJob) -> Result<TransferReport> {
    let workers = job.aborts.len();
    info!(workers, "bulk job started");
    let execute = session.execute(sql);
    tokio::pin!(execute);
    let (statement, finished) = tokio::select! {
        biased;
        finished = job.wait_all() => {
            if let Err(err) = &finished {
                warn!("worker failed, aborting statement: {err}");
                if let Err(err) = session.abort_query().await {
                    warn!("abort failed: {err}");
                }
            }
            (execute.await, finished)
        }
        statement = &mut execute => {
            let finished = match &statement {
                Ok(_) => job.wait_all().await,
                Err(_) => job.cancel().await,
            };
            (statement, finished)
        }
    };
    let (statement, ()) = settle(statement, finished)?;
    let row_count = statement.rowcount();
    info!(workers, rows = row_count, "bulk job finished");
    Ok(TransferReport {
        row_count,
        stats: std::mem::take(&mut job.stats),
    })
}

/// EXPORT over `options.workers` in-process tunnels, one sink per worker.
pub async fn export_parallel<F, W>(
    session: &Session,
    query: &ExportQuery,
    options: &ParallelOptions,
    mut make_sink: F,
) -> Result<TransferReport>
where
    F: FnMut(usize) -> W,
    W: AsyncWrite + Unpin + Send + 'static,
{
    if options.mode != WorkerMode::Task {
        return Err(ExaError::Runtime(
            "sinks need task workers; use export_parallel_to_files for processes".into(),
        ));
    }
    let io = (0..options.workers)
        .map(|index| WorkerIo::Sink(Box::new(make_sink(index)) as BoxedSink))
        .collect();
    let (job, proxies) = start_workers(session, TunnelMode::Export, options, io).await?;
    let sql = query.build(&proxies, &options.transfer);
    run_job(session, sql, job).await
}

/// IMPORT over in-process tunnels, one source per worker.
pub async fn import_parallel<F, R>(
    session: &Session,
    query: &ImportQuery,
    options: &ParallelOptions,
    mut make_source: F,
) -> Result<TransferReport>
where
    F: FnMut(usize) -> R,
    R: AsyncRead + Unpin + Send + 'static,
{
    if options.mode != WorkerMode::Task {
        return Err(ExaError::Runtime(
            "sources need task workers; use import_parallel_from_files for processes".into(),
        ));
    }
    let io = (0..options.workers)
        .map(|index| WorkerIo::Source(Box::new(make_source(index)) as BoxedSource))
        .collect();
    let (job, proxies) = start_workers(session, TunnelMode::Import, options, io).await?;
    let sql = query.build(&proxies, &options.transfer);
    run_job(session, sql, job).await
}

/// EXPORT into `dir/NNN.<ext>`, one file per worker, named like the `FILE`
/// clauses of the statement.
pub async fn export_parallel_to_files(
    session: &Session,
    query: &ExportQuery,
    options: &ParallelOptions,
    dir: &Path,
) -> Result<(TransferReport, Vec<PathBuf>)> {
    let ext = query.file_extension(&options.transfer);
    let files: Vec<PathBuf> = (0..options.workers)
        .map(|index| dir.join(format!("{index:03}.{ext}")))
        .collect();
    let io = files.iter().cloned().map(WorkerIo::File).collect();
    let (job, proxies) = start_workers(session, TunnelMode::Export, options, io).await?;
    let sql = query.build(&proxies, &options.transfer);
    let report = run_job(session, sql, job).await?;
    Ok((report, files))
}

/// IMPORT from the given files, one worker per file.
pub async fn import_parallel_from_files(
    session: &Session,
    query: &ImportQuery,
    options: &ParallelOptions,
    files: &[PathBuf],
) -> Result<TransferReport> {
    if files.is_empty() {
        return Err(ExaError::Runtime("no files to import".into()));
    }
    let io = files.iter().cloned().map(WorkerIo::File).collect();
    let (job, proxies) = start_workers(session, TunnelMode::Import, options, io).await?;
    let sql = query.build(&proxies, &options.transfer);
    run_job(session, sql, job).await
}
