//! Configuration types for docsweep
//!
//! This module defines:
//! - CLI argument parsing using clap derive macros
//! - Runtime configuration with validation
//!
//! Everything that can be wrong with a configuration (unknown backends,
//! bad patterns, unsupported digests, unsafe SQL identifiers) is rejected in
//! [`RunConfig::from_args`], before a single document is scheduled.

use crate::consumer::ConsumerOptions;
use crate::error::ConfigError;
use crate::identity::IdentityOptions;
use crate::queue::{QueueOptions, QueueType, DEFAULT_QUEUE_NAME, DEFAULT_QUEUE_TABLE, DEFAULT_REDIS_URL};
use crate::report::{ExtractionStatus, ReportOptions, ReportType, DEFAULT_REPORT_TABLE};
use crate::scanner::{FullQueuePolicy, PathMatcher, ScanOptions};
use crate::sql::validate_identifier;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// Maximum reasonable worker count
const MAX_WORKERS: usize = 512;

/// Resumable document extraction pipeline
#[derive(Parser, Debug, Clone)]
#[command(
    name = "docsweep",
    version,
    about = "Walk file trees, queue documents, extract and spew them, and record every outcome",
    long_about = "Walks file trees into a bounded document queue, then drains the queue through a \
                  worker pool that extracts text, spews it to a sink and records a status per \
                  document.\n\n\
                  Queues and status reports can live in memory, in a SQLite file, or in Redis, so \
                  scanning and spewing can run in separate processes or on separate hosts.",
    after_help = "EXAMPLES:\n    \
        docsweep spew ./corpus -w 8\n    \
        docsweep --queue-type sql --sql-path jobs.db scan ./corpus --exclude '*.bak'\n    \
        docsweep --queue-type sql --sql-path jobs.db --report-type sql spew\n    \
        docsweep --queue-type redis --report-type redis report --status not-parsed\n    \
        docsweep --queue-type redis wipe-queue"
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Queue backend: memory, sql or redis
    #[arg(long, global = true, default_value = "memory", value_name = "TYPE")]
    pub queue_type: String,

    /// Queue name (also the key prefix for Redis reports and latches)
    #[arg(long, global = true, default_value = DEFAULT_QUEUE_NAME, value_name = "NAME")]
    pub queue_name: String,

    /// Maximum number of queued documents
    #[arg(long, global = true, default_value = "10000", value_name = "NUM")]
    pub queue_buffer_size: usize,

    /// SQLite database for the sql queue and report backends
    #[arg(long, global = true, value_name = "FILE")]
    pub sql_path: Option<PathBuf>,

    /// Table holding the sql queue
    #[arg(long, global = true, default_value = DEFAULT_QUEUE_TABLE, value_name = "TABLE")]
    pub sql_table: String,

    /// Table holding sql reports
    #[arg(long, global = true, default_value = DEFAULT_REPORT_TABLE, value_name = "TABLE")]
    pub report_table: String,

    /// Redis connection URL
    #[arg(long, global = true, env = "REDIS_URL", default_value = DEFAULT_REDIS_URL, value_name = "URL")]
    pub redis_url: String,

    /// Report backend: none, memory, sql or redis
    #[arg(long, global = true, default_value = "none", value_name = "TYPE")]
    pub report_type: String,

    /// Document id method: path, path-digest or digest
    #[arg(long, global = true, default_value = "path", value_name = "METHOD")]
    pub id_method: String,

    /// Digest algorithm: sha256, sha384, sha512 or blake3
    #[arg(long, global = true, default_value = "sha256", value_name = "ALG")]
    pub digest_algorithm: String,

    /// Quiet mode - suppress progress output
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Verbose output (debug logging)
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,
}

/// Subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Walk a directory tree and enqueue every eligible file
    Scan {
        /// Directory to walk
        #[arg(value_name = "ROOT")]
        root: PathBuf,

        #[command(flatten)]
        walk: WalkArgs,

        /// Signal a Redis latch named after the queue so remote spewers wake up
        #[arg(long)]
        signal_latch: bool,
    },

    /// Drain the queue through the extractor and spewer
    Spew {
        /// Also scan ROOT in this process, feeding the queue while it drains
        #[arg(value_name = "ROOT")]
        root: Option<PathBuf>,

        #[command(flatten)]
        walk: WalkArgs,

        /// Number of worker threads
        #[arg(short = 'w', long, default_value_t = default_workers(), value_name = "NUM")]
        workers: usize,

        /// Seconds to wait for a document before stopping (0 = don't wait)
        #[arg(long, default_value = "5", value_name = "SECS", conflicts_with = "block")]
        poll_timeout: u64,

        /// Wait for documents forever (stop with Ctrl-C)
        #[arg(long)]
        block: bool,

        /// Keep draining until a remote scanner seals the queue's Redis latch
        #[arg(long)]
        follow: bool,

        /// Also spew each document's metadata
        #[arg(long)]
        write_metadata: bool,

        /// Skip files larger than this many bytes
        #[arg(long, value_name = "BYTES")]
        max_bytes: Option<u64>,
    },

    /// Print stored statuses
    Report {
        /// Only show documents with this status (name or code)
        #[arg(long, value_name = "STATUS")]
        status: Option<String>,
    },

    /// Delete the distributed queue's backing collection
    WipeQueue,
}

/// File-tree walk options shared by `scan` and `spew`
#[derive(Args, Debug, Clone, Default)]
pub struct WalkArgs {
    /// Only enqueue files matching pattern (glob, or regex: prefix; repeatable)
    #[arg(long = "include", value_name = "PATTERN", action = clap::ArgAction::Append)]
    pub include_patterns: Vec<String>,

    /// Skip paths matching pattern; matching directories are pruned (repeatable)
    #[arg(long = "exclude", value_name = "PATTERN", action = clap::ArgAction::Append)]
    pub exclude_patterns: Vec<String>,

    /// Follow symbolic links
    #[arg(short = 'L', long)]
    pub follow_links: bool,

    /// Maximum directory depth (unlimited if not set)
    #[arg(short = 'd', long, value_name = "NUM")]
    pub max_depth: Option<usize>,

    /// What to do when the queue stays full: block, hook or fail
    #[arg(long, default_value = "block", value_name = "POLICY")]
    pub full_queue: String,

    /// Seconds to wait on a full queue before the hook or failure kicks in
    #[arg(long, default_value = "30", value_name = "SECS")]
    pub full_queue_timeout: u64,
}

fn default_workers() -> usize {
    num_cpus::get()
}

/// Validated subcommand
#[derive(Debug, Clone)]
pub enum RunCommand {
    Scan {
        root: PathBuf,
        scan: ScanOptions,
        signal_latch: bool,
    },
    Spew {
        root: Option<PathBuf>,
        scan: ScanOptions,
        consumer: ConsumerOptions,
        /// `None` blocks until a document arrives
        poll_timeout: Option<Duration>,
        follow: bool,
        max_bytes: Option<u64>,
    },
    Report {
        status: Option<ExtractionStatus>,
    },
    WipeQueue,
}

/// Validated runtime configuration
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub command: RunCommand,

    pub queue: QueueOptions,

    pub report: ReportOptions,

    pub identity: IdentityOptions,

    /// Show progress indicator
    pub show_progress: bool,

    /// Verbose logging
    pub verbose: bool,
}

impl RunConfig {
    /// Create and validate configuration from CLI arguments
    pub fn from_args(args: CliArgs) -> Result<Self, ConfigError> {
        let identity = IdentityOptions::parse(&args.id_method, &args.digest_algorithm)?;

        let queue_type: QueueType = args.queue_type.parse()?;
        if args.queue_buffer_size == 0 {
            return Err(ConfigError::InvalidBufferSize {
                size: args.queue_buffer_size,
            });
        }

        let report_type: ReportType = args.report_type.parse()?;

        let needs_sql = queue_type == QueueType::Sql || report_type == ReportType::Sql;
        if needs_sql && args.sql_path.is_none() {
            return Err(ConfigError::MissingRequired(
                "--sql-path is required for sql queues and reports".into(),
            ));
        }
        if queue_type == QueueType::Sql {
            validate_identifier(&args.sql_table)?;
        }
        if report_type == ReportType::Sql {
            validate_identifier(&args.report_table)?;
        }

        let queue = QueueOptions {
            queue_type,
            name: args.queue_name.clone(),
            capacity: args.queue_buffer_size,
            sql_path: args.sql_path.clone(),
            sql_table: args.sql_table.clone(),
            redis_url: args.redis_url.clone(),
            ..Default::default()
        };

        let report = ReportOptions {
            report_type,
            name: args.queue_name.clone(),
            sql_path: args.sql_path.clone(),
            sql_table: args.report_table.clone(),
            redis_url: args.redis_url.clone(),
        };

        let command = match args.command {
            Command::Scan {
                root,
                walk,
                signal_latch,
            } => {
                validate_root(&root)?;
                if queue_type == QueueType::Memory {
                    return Err(ConfigError::InvalidQueueType(
                        "memory (a standalone scan needs a shared sql or redis queue)".into(),
                    ));
                }
                RunCommand::Scan {
                    root,
                    scan: scan_options(walk)?,
                    signal_latch,
                }
            }
            Command::Spew {
                root,
                walk,
                workers,
                poll_timeout,
                block,
                follow,
                write_metadata,
                max_bytes,
            } => {
                if workers == 0 || workers > MAX_WORKERS {
                    return Err(ConfigError::InvalidWorkerCount {
                        count: workers,
                        max: MAX_WORKERS,
                    });
                }
                if let Some(root) = &root {
                    validate_root(root)?;
                }
                if root.is_none() && queue_type == QueueType::Memory {
                    return Err(ConfigError::MissingRequired(
                        "ROOT is required when spewing from a memory queue".into(),
                    ));
                }
                RunCommand::Spew {
                    root,
                    scan: scan_options(walk)?,
                    consumer: ConsumerOptions {
                        workers,
                        write_metadata,
                        ..Default::default()
                    },
                    poll_timeout: (!block).then(|| Duration::from_secs(poll_timeout)),
                    follow,
                    max_bytes,
                }
            }
            Command::Report { status } => {
                if report_type == ReportType::None {
                    return Err(ConfigError::MissingRequired(
                        "--report-type is required to print reports".into(),
                    ));
                }
                let status = status
                    .map(|s| {
                        s.parse::<ExtractionStatus>()
                            .map_err(|reason| ConfigError::InvalidStatus { status: s, reason })
                    })
                    .transpose()?;
                RunCommand::Report { status }
            }
            Command::WipeQueue => {
                if queue_type == QueueType::Memory {
                    return Err(ConfigError::InvalidQueueType(
                        "memory (only distributed queues can be wiped)".into(),
                    ));
                }
                RunCommand::WipeQueue
            }
        };

        Ok(Self {
            command,
            queue,
            report,
            identity,
            show_progress: !args.quiet,
            verbose: args.verbose,
        })
    }
}

fn validate_root(root: &std::path::Path) -> Result<(), ConfigError> {
    if !root.is_dir() {
        return Err(ConfigError::InvalidPath {
            path: root.to_path_buf(),
            reason: "not a directory".into(),
        });
    }
    Ok(())
}

/// Compile patterns up front so a typo fails before the walk starts
fn scan_options(walk: WalkArgs) -> Result<ScanOptions, ConfigError> {
    for pattern in walk.include_patterns.iter().chain(&walk.exclude_patterns) {
        pattern.parse::<PathMatcher>()?;
    }

    Ok(ScanOptions {
        includes: walk.include_patterns,
        excludes: walk.exclude_patterns,
        follow_links: walk.follow_links,
        max_depth: walk.max_depth,
        full_queue: FullQueuePolicy::parse(&walk.full_queue, Duration::from_secs(walk.full_queue_timeout))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{DigestAlgorithm, IdMethod};
    use tempfile::TempDir;

    fn parse(args: &[&str]) -> Result<RunConfig, ConfigError> {
        let mut argv = vec!["docsweep"];
        argv.extend_from_slice(args);
        RunConfig::from_args(CliArgs::try_parse_from(argv).unwrap())
    }

    #[test]
    fn test_spew_defaults() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_str().unwrap();
        let config = parse(&["spew", root, "-w", "3"]).unwrap();

        assert_eq!(config.queue.queue_type, QueueType::Memory);
        assert_eq!(config.queue.capacity, 10_000);
        assert_eq!(config.report.report_type, ReportType::None);
        assert_eq!(config.identity.method, IdMethod::Path);
        match config.command {
            RunCommand::Spew {
                consumer,
                poll_timeout,
                ..
            } => {
                assert_eq!(consumer.workers, 3);
                assert_eq!(poll_timeout, Some(Duration::from_secs(5)));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_global_options_after_subcommand() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("jobs.db");
        let config = parse(&[
            "scan",
            dir.path().to_str().unwrap(),
            "--queue-type",
            "sql",
            "--sql-path",
            db.to_str().unwrap(),
            "--id-method",
            "digest",
            "--digest-algorithm",
            "blake3",
            "--exclude",
            "*.bak",
            "--full-queue",
            "fail",
            "--full-queue-timeout",
            "2",
        ])
        .unwrap();

        assert_eq!(config.queue.sql_path.as_deref(), Some(db.as_path()));
        assert_eq!(config.identity.algorithm, DigestAlgorithm::Blake3);
        match config.command {
            RunCommand::Scan { scan, .. } => {
                assert_eq!(scan.excludes, vec!["*.bak".to_string()]);
                assert_eq!(scan.full_queue, FullQueuePolicy::Fail(Duration::from_secs(2)));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_fatal_configuration_errors() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_str().unwrap();

        assert!(matches!(
            parse(&["spew", root, "--queue-type", "kafka"]),
            Err(ConfigError::InvalidQueueType(_))
        ));
        assert!(matches!(
            parse(&["spew", root, "--digest-algorithm", "md4"]),
            Err(ConfigError::Identity(_))
        ));
        assert!(matches!(
            parse(&["spew", root, "-w", "0"]),
            Err(ConfigError::InvalidWorkerCount { .. })
        ));
        assert!(matches!(
            parse(&["spew", root, "--queue-buffer-size", "0"]),
            Err(ConfigError::InvalidBufferSize { .. })
        ));
        assert!(matches!(
            parse(&["spew", root, "--queue-type", "sql"]),
            Err(ConfigError::MissingRequired(_))
        ));
        assert!(matches!(
            parse(&["spew", root, "--exclude", "regex:[unclosed"]),
            Err(ConfigError::InvalidPattern { .. })
        ));
        assert!(matches!(
            parse(&["spew", root, "--full-queue", "drop"]),
            Err(ConfigError::InvalidQueuePolicy(_))
        ));
        assert!(matches!(
            parse(&[
                "spew",
                root,
                "--queue-type",
                "sql",
                "--sql-path",
                "x.db",
                "--sql-table",
                "jobs; DROP TABLE x"
            ]),
            Err(ConfigError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn test_subcommand_requirements() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_str().unwrap();

        assert!(matches!(parse(&["spew"]), Err(ConfigError::MissingRequired(_))));
        assert!(matches!(parse(&["scan", root]), Err(ConfigError::InvalidQueueType(_))));
        assert!(matches!(parse(&["wipe-queue"]), Err(ConfigError::InvalidQueueType(_))));
        assert!(matches!(parse(&["report"]), Err(ConfigError::MissingRequired(_))));
        assert!(matches!(
            parse(&["spew", "/definitely/not/here"]),
            Err(ConfigError::InvalidPath { .. })
        ));
    }

    #[test]
    fn test_report_status_filter() {
        let config = parse(&["report", "--report-type", "memory", "--status", "not-parsed"]).unwrap();
        assert!(matches!(
            config.command,
            RunCommand::Report {
                status: Some(ExtractionStatus::NotParsed)
            }
        ));

        assert!(matches!(
            parse(&["report", "--report-type", "memory", "--status", "meh"]),
            Err(ConfigError::InvalidStatus { .. })
        ));
    }

    #[test]
    fn test_block_disables_poll_timeout() {
        let dir = TempDir::new().unwrap();
        let config = parse(&["spew", dir.path().to_str().unwrap(), "--block"]).unwrap();
        assert!(matches!(config.command, RunCommand::Spew { poll_timeout: None, .. }));
    }
}
