use crate::config::{TimestampSource, WorkerOptions};
use crate::metrics::backend::MetricsBackend;
use crate::metrics::point::{BatchPoints, Point};
use crate::trace::info::TraceInfo;
use chrono::Utc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Producer end of the delivery queue.
///
/// Delivery never waits: when the queue is full or the worker is gone the
/// record is dropped with a log line.
#[derive(Clone, Debug)]
pub struct TraceSink {
    tx: mpsc::Sender<TraceInfo>,
}

impl TraceSink {
    pub fn new(tx: mpsc::Sender<TraceInfo>) -> Self {
        Self { tx }
    }

    pub fn deliver(&self, info: TraceInfo) -> bool {
        match self.tx.try_send(info) {
            Ok(()) => true,
            Err(TrySendError::Full(info)) => {
                warn!("trace queue is full, dropping trace for [{}]", info.hostname);
                false
            }
            Err(TrySendError::Closed(info)) => {
                debug!("trace worker stopped, dropping trace for [{}]", info.hostname);
                false
            }
        }
    }
}

/// Single consumer of the delivery queue. Each record becomes one point,
/// written on its own.
pub struct TraceWorker<B> {
    rx: mpsc::Receiver<TraceInfo>,
    backend: B,
    options: WorkerOptions,
}

impl<B> TraceWorker<B>
where
    B: MetricsBackend,
{
    pub fn new(rx: mpsc::Receiver<TraceInfo>, backend: B, options: WorkerOptions) -> Self {
        Self {
            rx,
            backend,
            options,
        }
    }

    /// Creates the bounded queue and the worker that drains it.
    pub fn channel(backend: B, options: WorkerOptions) -> (TraceSink, Self) {
        let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));
        (TraceSink::new(tx), Self::new(rx, backend, options))
    }

    pub async fn report(&self, info: TraceInfo) {
        let timestamp = match self.options.timestamp_source {
            TimestampSource::Delivery => Utc::now(),
            TimestampSource::Capture => info.finished_at.unwrap_or_else(Utc::now),
        };
        let mut batch = BatchPoints::new(self.options.database.as_str());
        batch.add_point(Point::from_trace(&self.options.measurement, &info, timestamp));
        if let Err(e) = self.backend.write(batch).await {
            error!("post data to influxdb failed : {}", e);
        }
    }

    /// Reports records until `shutdown` fires or every sink is dropped, then
    /// drains what is left within the grace period.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            "trace worker started, database : [{}] capacity : [{}]",
            self.options.database, self.options.queue_capacity
        );
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = self.rx.recv() => match received {
                    Some(info) => self.report(info).await,
                    None => {
                        debug!("all trace sinks dropped, trace worker exits");
                        return;
                    }
                },
            }
        }
        self.drain().await;
    }

    async fn drain(&mut self) {
        self.rx.close();
        let grace = self.options.shutdown_grace();
        let mut drained = 0usize;
        let finished = timeout(grace, async {
            while let Some(info) = self.rx.recv().await {
                self.report(info).await;
                drained += 1;
            }
        })
        .await;
        match finished {
            Ok(()) => info!("trace worker stopped after draining {} trace(s)", drained),
            Err(_) => warn!(
                "trace worker grace period {:?} elapsed, {} trace(s) drained, the rest are dropped",
                grace, drained
            ),
        }
    }
}

/// Running worker task plus its shutdown signal.
pub struct TraceWorkerHandle {
    shutdown: CancellationToken,
    join: JoinHandle<()>,
}

impl TraceWorkerHandle {
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Signals shutdown and waits for the drain to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.join.await {
            error!("trace worker task failed : {}", e);
        }
    }
}

pub fn spawn_trace_worker<B>(backend: B, options: WorkerOptions) -> (TraceSink, TraceWorkerHandle)
where
    B: MetricsBackend + 'static,
{
    let (sink, worker) = TraceWorker::channel(backend, options);
    let shutdown = CancellationToken::new();
    let join = tokio::spawn(worker.run(shutdown.clone()));
    (sink, TraceWorkerHandle { shutdown, join })
}
