//! docsweep - Resumable Document Extraction Pipeline
//!
//! Entry point for the CLI application.

use anyhow::{Context, Result};
use clap::Parser;
use docsweep::config::{CliArgs, RunCommand, RunConfig};
use docsweep::consumer::{ConsumerOptions, DocumentConsumer};
use docsweep::document::DocumentFactory;
use docsweep::drainer::QueueDrainer;
use docsweep::extraction::{PlainTextExtractor, PrintSpewer};
use docsweep::latch::{LocalLatch, RedisLatch, RedisLatchConfig, SealableLatch};
use docsweep::progress::{
    print_header, print_reports, print_scan_summary, print_spew_summary, PipelineProgress, ProgressReporter,
};
use docsweep::queue::{open_distributed, open_queue, DistributedQueue, DocumentQueue};
use docsweep::report::{open_report_map, ReportMap, Reporter};
use docsweep::scanner::{ScanOptions, ScanState, ScanStats, Scanner};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// How often the progress line is redrawn
const PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

/// How long to wait for in-flight documents after the drain ends
const TERMINATION_TIMEOUT: Duration = Duration::from_secs(60);

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args = CliArgs::parse();

    setup_logging(args.verbose)?;

    let config = RunConfig::from_args(args).context("Invalid configuration")?;

    // Shared by every component that can be interrupted
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupt received, shutting down...");
        flag.store(true, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")?;

    match config.command.clone() {
        RunCommand::Scan {
            root,
            scan,
            signal_latch,
        } => run_scan(&config, root, scan, signal_latch, shutdown),
        RunCommand::Spew {
            root,
            scan,
            consumer,
            poll_timeout,
            follow,
            max_bytes,
        } => run_spew(
            &config,
            SpewPlan {
                root,
                scan,
                consumer,
                poll_timeout,
                follow,
                max_bytes,
            },
            shutdown,
        ),
        RunCommand::Report { status } => {
            let map = open_report_map(&config.report)
                .context("Failed to open report map")?
                .context("No report backend configured")?;
            let entries = map.entries().context("Failed to read reports")?;
            let shown = print_reports(&entries, status);
            info!(shown, total = entries.len(), "Reports printed");
            map.close().context("Failed to close report map")?;
            Ok(())
        }
        RunCommand::WipeQueue => {
            let factory = DocumentFactory::new(config.identity.build());
            let queue = open_distributed(&config.queue, &factory).context("Failed to open queue")?;
            let size = queue.size().unwrap_or(0);
            queue.delete().context("Failed to delete queue")?;
            info!(queue = %config.queue.name, discarded = size, "Queue deleted");
            queue.close().context("Failed to close queue")?;
            Ok(())
        }
    }
}

fn queue_label(config: &RunConfig) -> String {
    format!("{} ({})", config.queue.name, config.queue.queue_type)
}

fn latch_for(config: &RunConfig) -> Result<Arc<dyn SealableLatch>> {
    let latch = RedisLatch::new(RedisLatchConfig {
        url: config.queue.redis_url.clone(),
        name: format!("{}:latch", config.queue.name),
    })
    .context("Failed to connect latch")?;
    Ok(Arc::new(latch))
}

fn progress_for(config: &RunConfig) -> ProgressReporter {
    if config.show_progress {
        ProgressReporter::new()
    } else {
        ProgressReporter::hidden()
    }
}

/// Walk a tree into a shared queue, then exit
fn run_scan(
    config: &RunConfig,
    root: PathBuf,
    scan: ScanOptions,
    signal_latch: bool,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    if config.show_progress {
        print_header("scan", &queue_label(config), None);
    }

    let factory = DocumentFactory::new(config.identity.build());
    let queue = open_queue(&config.queue, &factory).context("Failed to open queue")?;

    let mut scanner = Scanner::new(scan, Arc::clone(&queue), factory)?.with_shutdown(Arc::clone(&shutdown));
    if signal_latch {
        scanner = scanner.with_latch(latch_for(config)?);
    }
    let scanner = Arc::new(scanner);

    let progress = progress_for(config);
    progress.set_status("Scanning...");
    let handle = Arc::clone(&scanner)
        .spawn(root)
        .context("Failed to start scanner thread")?;

    let start = Instant::now();
    while !handle.is_finished() {
        progress.update(&snapshot(Some(scanner.stats()), queue.as_ref(), None, start));
        thread::sleep(PROGRESS_INTERVAL);
    }

    let summary = handle
        .join()
        .map_err(|_| anyhow::anyhow!("Scanner thread panicked"))?
        .context("Scan failed")?;
    progress.finish_and_clear();
    queue.close().context("Failed to close queue")?;

    if config.show_progress {
        print_scan_summary(&summary);
    }
    if summary.state == ScanState::Terminated {
        info!("Scan was interrupted before completion");
    }
    Ok(())
}

struct SpewPlan {
    root: Option<PathBuf>,
    scan: ScanOptions,
    consumer: ConsumerOptions,
    poll_timeout: Option<Duration>,
    follow: bool,
    max_bytes: Option<u64>,
}

/// Drain the queue through the consumer pool, optionally scanning alongside
fn run_spew(config: &RunConfig, plan: SpewPlan, shutdown: Arc<AtomicBool>) -> Result<()> {
    if config.show_progress {
        print_header("spew", &queue_label(config), Some(plan.consumer.workers));
    }

    let factory = DocumentFactory::new(config.identity.build());
    let queue = open_queue(&config.queue, &factory).context("Failed to open queue")?;

    let reporter = open_report_map(&config.report)
        .context("Failed to open report map")?
        .map(|map| Arc::new(Reporter::new(map)));

    let mut extractor = PlainTextExtractor::new(config.identity.algorithm);
    if let Some(max) = plan.max_bytes {
        extractor = extractor.with_max_bytes(max);
    }
    let consumer = Arc::new(
        DocumentConsumer::new(
            &plan.consumer,
            Arc::new(extractor),
            Arc::new(PrintSpewer::stdout()),
            reporter.clone(),
        )
        .context("Failed to start consumer pool")?,
    );

    let mut drainer = QueueDrainer::new(Arc::clone(&queue))
        .with_poll_timeout(plan.poll_timeout)
        .with_shutdown(Arc::clone(&shutdown));

    // A co-located scanner shares a local latch; a remote one a Redis latch
    let mut scanner = None;
    if let Some(root) = plan.root {
        let latch: Arc<dyn SealableLatch> = Arc::new(LocalLatch::new());
        drainer = drainer.with_latch(Arc::clone(&latch));
        let s = Arc::new(
            Scanner::new(plan.scan, Arc::clone(&queue), factory)?
                .with_latch(latch)
                .with_shutdown(Arc::clone(&shutdown)),
        );
        let handle = Arc::clone(&s).spawn(root).context("Failed to start scanner thread")?;
        scanner = Some((s, handle));
    } else if plan.follow {
        drainer = drainer.with_latch(latch_for(config)?);
    }

    let progress = progress_for(config);
    progress.set_status("Draining queue...");
    let start = Instant::now();
    let drain_done = Arc::new(AtomicBool::new(false));

    let drained = thread::scope(|scope| {
        scope.spawn(|| {
            while !drain_done.load(Ordering::Relaxed) {
                let stats = scanner.as_ref().map(|(s, _)| s.stats());
                progress.update(&snapshot(stats, queue.as_ref(), Some((consumer.as_ref(), &reporter)), start));
                thread::sleep(PROGRESS_INTERVAL);
            }
        });

        let result = drainer.drain(|doc| {
            let path = doc.path().to_path_buf();
            if let Err(e) = consumer.accept(doc) {
                warn!(path = %path.display(), error = %e, "Consumer rejected document, stopping drain");
                shutdown.store(true, Ordering::SeqCst);
            }
        });
        consumer.await_idle();
        drain_done.store(true, Ordering::Relaxed);
        result
    })
    .context("Drain failed")?;

    consumer.shutdown();
    if !consumer.await_termination(TERMINATION_TIMEOUT) {
        warn!("Consumer workers did not stop in time");
    }

    if let Some((s, handle)) = scanner {
        // Unblock a scanner still waiting on a full queue
        if !handle.is_finished() {
            s.shutdown_flag().store(true, Ordering::SeqCst);
        }
        match handle.join() {
            Ok(Ok(summary)) if config.show_progress => print_scan_summary(&summary),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, "Scan failed"),
            Err(_) => warn!("Scanner thread panicked"),
        }
    }

    let final_progress = snapshot(None, queue.as_ref(), Some((consumer.as_ref(), &reporter)), start);
    progress.finish_and_clear();

    if let Some(reporter) = &reporter {
        reporter.close().context("Failed to close report map")?;
    }
    queue.close().context("Failed to close queue")?;

    if config.show_progress {
        print_spew_summary(&final_progress, drained);
    }
    Ok(())
}

fn snapshot(
    scan: Option<&ScanStats>,
    queue: &dyn DocumentQueue,
    consumer: Option<(&DocumentConsumer, &Option<Arc<Reporter>>)>,
    start: Instant,
) -> PipelineProgress {
    let mut progress = PipelineProgress {
        queued: queue.size().unwrap_or(0),
        elapsed: start.elapsed(),
        ..Default::default()
    };
    if let Some(stats) = scan {
        progress.enqueued = stats.enqueued();
        progress.bytes = stats.bytes();
    }
    if let Some((consumer, reporter)) = consumer {
        progress.processed = consumer.stats().processed();
        progress.failed = consumer.stats().failed();
        progress.journaled = reporter.as_ref().map_or(0, |r| r.journal_len());
    }
    progress
}

fn setup_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("docsweep=debug,warn")
    } else {
        EnvFilter::new("docsweep=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}
