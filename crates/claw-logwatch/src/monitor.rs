//! Monitoring control.
//!
//! [`LogMonitor`] wires the pipeline together:
//!
//! ```text
//! LineSource -> LogParser -> ContextBuffer -> ErrorDetector
//!                                 |                |
//!                                 +-- ContextAssembler (task per error)
//!                                                  |
//!                             DispatchQueue -> Analyzer -> ResultSink
//! ```
//!
//! One producer task reads, parses, buffers and detects. Each detection
//! leases its window immediately and spawns an assembler task owned by the
//! producer. A dispatcher task drains
//! the queue into the analyzer under a timeout and a concurrency limit.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::analyzer::{AnalysisFailure, Analyzer};
use crate::assembler::ContextAssembler;
use crate::buffer::ContextBuffer;
use crate::config::{DispatchConfig, LogwatchConfig};
use crate::detector::ErrorDetector;
use crate::dispatch::DispatchQueue;
use crate::error::{LogwatchError, Result};
use crate::parser::LogParser;
use crate::rules::RuleSet;
use crate::sink::{AnalysisOutcome, ResultSink};
use crate::source::LineSource;
use crate::stats::{PipelineStats, StatsSnapshot};
use crate::types::{ContextBundle, DetectedError, LogRecord, RawLine};

/// The synchronous part of the producer: parse, buffer, detect.
#[derive(Debug)]
pub struct IngestPipeline {
    parser: LogParser,
    buffer: Arc<ContextBuffer>,
    detector: ErrorDetector,
    stats: Arc<PipelineStats>,
}

impl IngestPipeline {
    /// Creates a pipeline feeding the given buffer.
    #[must_use]
    pub const fn new(
        parser: LogParser,
        buffer: Arc<ContextBuffer>,
        detector: ErrorDetector,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            parser,
            buffer,
            detector,
            stats,
        }
    }

    /// Parses a line, appends the record, and inspects it.
    ///
    /// The record is resident in the buffer before detection so an assembler
    /// leasing around it always finds its trigger.
    ///
    /// # Errors
    ///
    /// Returns `LogwatchError::OutOfOrder` if the buffer was fed by another
    /// writer.
    pub fn ingest(&mut self, line: &RawLine) -> Result<(Arc<LogRecord>, Option<DetectedError>)> {
        let record = Arc::new(self.parser.parse(line));
        self.stats.record_parsed(record.level);
        self.buffer.append(Arc::clone(&record))?;

        let detected = self.detector.inspect(&record);
        if let Some(detected) = &detected {
            self.stats.record_detection(&detected.matched_rule);
        }
        Ok((record, detected))
    }

    /// Sequence number the next record will receive.
    #[must_use]
    pub const fn next_sequence(&self) -> u64 {
        self.parser.next_sequence()
    }

    /// Error id the next detection will receive.
    #[must_use]
    pub const fn next_error_id(&self) -> u64 {
        self.detector.next_error_id()
    }
}

/// State carried across stop and start.
#[derive(Debug)]
struct Idle {
    source: LineSource,
    pipeline: IngestPipeline,
}

#[derive(Debug)]
struct Running {
    shutdown: CancellationToken,
    producer: JoinHandle<Idle>,
    dispatcher: JoinHandle<()>,
}

/// Monitors one log file until stopped.
#[derive(Debug)]
pub struct LogMonitor<A, S> {
    config: LogwatchConfig,
    rules: RuleSet,
    buffer: Arc<ContextBuffer>,
    queue: Arc<DispatchQueue>,
    stats: Arc<PipelineStats>,
    analyzer: Arc<A>,
    sink: Arc<S>,
    idle: Option<Idle>,
    running: Option<Running>,
}

impl<A: Analyzer, S: ResultSink> LogMonitor<A, S> {
    /// Validates the configuration and builds a stopped monitor.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a rule does not
    /// compile.
    pub fn new(config: LogwatchConfig, analyzer: A, sink: S) -> Result<Self> {
        config.validate()?;
        let rules = RuleSet::compile(&config.rules)?;
        let stats = Arc::new(PipelineStats::new());
        let buffer = Arc::new(ContextBuffer::new(config.buffer.clone()));
        let queue = Arc::new(DispatchQueue::new(config.dispatch.queue_capacity));

        let mut monitor = Self {
            config,
            rules,
            buffer,
            queue,
            stats,
            analyzer: Arc::new(analyzer),
            sink: Arc::new(sink),
            idle: None,
            running: None,
        };
        monitor.idle = Some(monitor.fresh_idle(1, 1));
        Ok(monitor)
    }

    fn fresh_idle(&self, next_sequence: u64, next_error_id: u64) -> Idle {
        let source = LineSource::new(&self.config.log_file, self.config.source.clone())
            .with_stats(Arc::clone(&self.stats));
        let pipeline = IngestPipeline::new(
            LogParser::starting_at(next_sequence),
            Arc::clone(&self.buffer),
            ErrorDetector::starting_at(self.rules.clone(), next_error_id),
            Arc::clone(&self.stats),
        );
        Idle { source, pipeline }
    }

    /// Starts monitoring. Calling it while running does nothing.
    pub fn start(&mut self) {
        if self.running.is_some() {
            debug!("monitor already running");
            return;
        }

        let idle = match self.idle.take() {
            Some(idle) => idle,
            None => {
                let next_sequence = self.buffer.last_sequence().map_or(1, |seq| seq + 1);
                let next_error_id = self.stats.snapshot(0).errors_detected() + 1;
                self.fresh_idle(next_sequence, next_error_id)
            }
        };

        info!(
            path = %self.config.log_file.display(),
            next_sequence = idle.pipeline.next_sequence(),
            rules = self.rules.len(),
            "starting log monitor"
        );

        let shutdown = CancellationToken::new();
        self.queue.reopen();

        let dispatcher = tokio::spawn(run_dispatcher(
            Arc::clone(&self.queue),
            Arc::clone(&self.analyzer),
            Arc::clone(&self.sink),
            Arc::clone(&self.stats),
            self.config.dispatch.clone(),
        ));

        let assembler = ContextAssembler::new(Arc::clone(&self.buffer), self.config.assembly.clone())
            .with_stats(Arc::clone(&self.stats));
        let producer = tokio::spawn(run_producer(
            idle,
            assembler,
            Arc::clone(&self.queue),
            Arc::clone(&self.stats),
            shutdown.clone(),
        ));

        self.running = Some(Running {
            shutdown,
            producer,
            dispatcher,
        });
    }

    /// Stops monitoring and waits until every detected error has been sealed,
    /// analyzed and emitted. Calling it while stopped does nothing.
    ///
    /// # Errors
    ///
    /// Returns `LogwatchError::Task` if a pipeline task panicked. The monitor
    /// is stopped either way and can be started again.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            debug!("monitor already stopped");
            return Ok(());
        };

        info!("stopping log monitor");
        running.shutdown.cancel();

        let producer = running.producer.await;
        self.queue.close();
        let dispatcher = running.dispatcher.await;

        let result = match producer {
            Ok(idle) => {
                self.idle = Some(idle);
                Ok(())
            }
            Err(e) => Err(LogwatchError::Task(format!("producer: {e}"))),
        };
        let result = result.and(
            dispatcher.map_err(|e| LogwatchError::Task(format!("dispatcher: {e}"))),
        );

        info!(stats = ?self.stats(), "log monitor stopped");
        result
    }

    /// Returns true between `start` and `stop`.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(self.queue.len())
    }

    /// The shared context buffer.
    #[must_use]
    pub const fn buffer(&self) -> &Arc<ContextBuffer> {
        &self.buffer
    }

    /// The dispatch queue.
    #[must_use]
    pub const fn queue(&self) -> &Arc<DispatchQueue> {
        &self.queue
    }

    /// The result sink.
    #[must_use]
    pub const fn sink(&self) -> &Arc<S> {
        &self.sink
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &LogwatchConfig {
        &self.config
    }
}

fn enqueue_sealed(
    joined: std::result::Result<ContextBundle, JoinError>,
    queue: &DispatchQueue,
    stats: &PipelineStats,
) {
    match joined {
        Ok(bundle) => {
            if queue.enqueue(bundle).is_some() {
                stats.record_dropped();
            }
        }
        Err(e) => warn!(error = %e, "assembler task failed"),
    }
}

async fn run_producer(
    idle: Idle,
    assembler: ContextAssembler,
    queue: Arc<DispatchQueue>,
    stats: Arc<PipelineStats>,
    shutdown: CancellationToken,
) -> Idle {
    let Idle {
        mut source,
        mut pipeline,
    } = idle;
    let mut assemblers = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            Some(joined) = assemblers.join_next(), if !assemblers.is_empty() => {
                enqueue_sealed(joined, &queue, &stats);
            }
            line = source.next_line() => match pipeline.ingest(&line) {
                Ok((_, Some(detected))) => {
                    let lease = assembler.lease(&detected);
                    let assembler = assembler.clone();
                    let shutdown = shutdown.clone();
                    assemblers.spawn(async move {
                        assembler.assemble(detected, lease, shutdown).await
                    });
                }
                Ok((_, None)) => {}
                Err(e) => warn!(error = %e, "dropping record"),
            },
        }
    }

    debug!(in_flight = assemblers.len(), "sealing in-flight assemblers");
    while let Some(joined) = assemblers.join_next().await {
        enqueue_sealed(joined, &queue, &stats);
    }

    Idle { source, pipeline }
}

async fn run_dispatcher<A: Analyzer, S: ResultSink>(
    queue: Arc<DispatchQueue>,
    analyzer: Arc<A>,
    sink: Arc<S>,
    stats: Arc<PipelineStats>,
    config: DispatchConfig,
) {
    let permits = Arc::new(Semaphore::new(config.max_concurrent_analyses));
    let timeout = config.analysis_timeout();
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    warn!(error = %e, "analysis task failed");
                }
            }
            next = queue.dequeue() => {
                let Some(bundle) = next else { break };
                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                    break;
                };

                let analyzer = Arc::clone(&analyzer);
                let sink = Arc::clone(&sink);
                let stats = Arc::clone(&stats);
                in_flight.spawn(async move {
                    let _permit = permit;
                    let result = match tokio::time::timeout(timeout, analyzer.analyze(&bundle)).await {
                        Ok(result) => result,
                        Err(_) => Err(AnalysisFailure::Timeout(timeout)),
                    };

                    stats.record_analysis(result.is_ok());
                    match &result {
                        Ok(analysis) => debug!(
                            error_id = %bundle.error_id,
                            analyzer = analyzer.name(),
                            error_type = %analysis.error_type,
                            "analysis complete"
                        ),
                        Err(e) => warn!(
                            error_id = %bundle.error_id,
                            analyzer = analyzer.name(),
                            error = %e,
                            "analysis failed"
                        ),
                    }
                    sink.emit(AnalysisOutcome::new(bundle, result));
                });
            }
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "analysis task failed");
        }
    }
}
