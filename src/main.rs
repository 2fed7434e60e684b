use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;
use uuid::Uuid;

use conductor::config::OrchestratorConfig;
use conductor::error::{DatabaseError, Error, ValidationError};
use conductor::escalation::{EscalationFilter, EscalationRecorder, EscalationStatus, EscalationType};
use conductor::faults::FaultDetector;
use conductor::locks::LockManager;
use conductor::model::{EntityType, Role};
use conductor::safety::{check_worker_safety, require_worker_safety};
use conductor::scheduler::{Launcher, ProcessWorkerRunner, spawn_launch_loop};
use conductor::store::migrations;
use conductor::store::{Database, LibSqlBackend, LockPolicy, TransitionRequest};
use conductor::transitions::TransitionEngine;

const EXIT_FOUND: u8 = 1;
const EXIT_ERROR: u8 = 2;

#[derive(Parser)]
#[command(name = "conductor", version, about = "Coordinate parallel coding-agent workers")]
struct Cli {
    /// Shared database file (overrides CONDUCTOR_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Emit JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List held file locks
    Locks {
        #[arg(long)]
        project: Option<String>,
    },
    /// Force-release one lock row
    ReleaseLock { project: String, path: String },
    /// Run the fault detectors
    Detect {
        #[arg(long)]
        project: Option<String>,
        /// Record an escalation for each new fault
        #[arg(long)]
        escalate: bool,
        /// Idle minutes before an IN_PROGRESS task counts as stuck
        #[arg(long)]
        stuck_minutes: Option<u64>,
    },
    /// Claim and start the next batch of an order
    Launch {
        project: String,
        order: String,
        /// Report what would launch without claiming anything
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        max_workers: Option<usize>,
        /// Keep launching every CONDUCTOR launch interval until interrupted
        #[arg(long, conflicts_with = "dry_run")]
        watch: bool,
    },
    /// Return an IN_PROGRESS task to the queue and drop its locks
    Requeue { project: String, task: String },
    /// Request a status transition on a task or order
    Transition {
        #[arg(value_parser = parse_arg::<EntityType>)]
        entity: EntityType,
        project: String,
        id: String,
        to: String,
        #[arg(long, value_parser = parse_arg::<Role>)]
        role: Role,
        #[arg(long, default_value = "cli")]
        actor: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Query the escalation log
    Escalations {
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        task: Option<String>,
        #[arg(long = "type", value_parser = parse_arg::<EscalationType>)]
        escalation_type: Option<EscalationType>,
        #[arg(long, value_parser = parse_arg::<EscalationStatus>)]
        status: Option<EscalationStatus>,
        #[arg(long)]
        limit: Option<usize>,
        /// Print totals by type and status instead of rows
        #[arg(long)]
        stats: bool,
    },
    /// Acknowledge an open escalation
    Ack { id: Uuid },
    /// Resolve an escalation
    Resolve { id: Uuid },
    /// Report tasks with running workers
    SafetyCheck {
        #[arg(long)]
        project: Option<String>,
    },
    /// Apply pending schema migrations
    Migrate {
        /// Migrate even while workers are running
        #[arg(long)]
        force: bool,
    },
}

fn parse_arg<T>(raw: &str) -> Result<T, String>
where
    T: std::str::FromStr<Err = ValidationError>,
{
    raw.parse().map_err(|e: ValidationError| e.to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let json = cli.json;

    let mut config = match OrchestratorConfig::from_env() {
        Ok(config) => config,
        Err(e) => return report_error(&Error::from(e), json),
    };
    if let Some(db) = &cli.db {
        config.db_path = db.clone();
    }

    let _guard = init_tracing(config.log_dir.as_deref());

    match run(cli, config).await {
        Ok(code) => code,
        Err(e) => report_error(&e, json),
    }
}

/// Log to stderr, plus a daily-rolling file when a log directory is set.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "conductor.log"));
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

fn report_error(err: &Error, json: bool) -> ExitCode {
    if json {
        let body = serde_json::json!({ "error": err.kind(), "message": err.to_string() });
        println!("{body}");
    } else {
        eprintln!("{}: {err}", err.kind());
    }
    ExitCode::from(EXIT_ERROR)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Error> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    println!("{text}");
    Ok(())
}

fn exit_for(found: bool) -> ExitCode {
    if found {
        ExitCode::from(EXIT_FOUND)
    } else {
        ExitCode::SUCCESS
    }
}

/// Open the shared database. A brand-new file gets the schema created;
/// a partially migrated one must go through `migrate` first.
async fn open_store(path: &Path) -> Result<Arc<dyn Database>, Error> {
    let backend = LibSqlBackend::open_local(path).await?;
    let pending = backend.pending_migrations().await?;
    if pending as i64 >= migrations::latest_version() {
        backend.init_schema().await?;
    } else if pending > 0 {
        return Err(DatabaseError::Migration(format!(
            "{pending} migration(s) pending; run `conductor migrate`"
        ))
        .into());
    }
    Ok(Arc::new(backend))
}

async fn run(cli: Cli, config: OrchestratorConfig) -> Result<ExitCode, Error> {
    let json = cli.json;

    if let Command::Migrate { force } = cli.command {
        return migrate(&config.db_path, force, json).await;
    }

    let db = open_store(&config.db_path).await?;

    match cli.command {
        Command::Locks { project } => {
            let locks = LockManager::new(db).list_locks(project.as_deref()).await?;
            if json {
                print_json(&locks)?;
            } else if locks.is_empty() {
                println!("No locks held");
            } else {
                for lock in &locks {
                    println!(
                        "{}  {}  held by {} since {}",
                        lock.project_id,
                        lock.file_path,
                        lock.task_id,
                        lock.acquired_at.to_rfc3339()
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::ReleaseLock { project, path } => {
            let released = LockManager::new(db).force_release(&project, &path).await?;
            if json {
                print_json(&serde_json::json!({ "project_id": project, "path": path, "released": released }))?;
            } else if released {
                println!("Released {path} in {project}");
            } else {
                println!("No lock on {path} in {project}");
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Detect {
            project,
            escalate,
            stuck_minutes,
        } => {
            let rules = Arc::new(conductor::transitions::RuleStore::load(db.as_ref()).await?);
            let threshold = match stuck_minutes {
                Some(m) => conductor::config::minutes_to_duration("--stuck-minutes", m)?,
                None => config.stuck_threshold,
            };
            let detector = FaultDetector::new(Arc::clone(&db), rules, config.worker_log_dir.clone())
                .with_stuck_threshold(threshold);

            let reports = detector.detect_all(project.as_deref()).await?;
            let escalated = if escalate {
                detector.escalate(&reports).await?
            } else {
                Vec::new()
            };

            if json {
                print_json(&serde_json::json!({ "faults": reports, "escalated": escalated }))?;
            } else if reports.is_empty() {
                println!("No faults detected");
            } else {
                for report in &reports {
                    println!(
                        "[{}] {} {}: {}",
                        report.kind.escalation_type(),
                        report.project_id,
                        report.task_id.as_deref().unwrap_or("-"),
                        report.summary
                    );
                }
                if escalate {
                    println!("{} escalation(s) recorded", escalated.len());
                }
            }
            Ok(exit_for(!reports.is_empty()))
        }

        Command::Launch {
            project,
            order,
            dry_run,
            max_workers,
            watch,
        } => {
            let max_workers = max_workers.unwrap_or(config.max_workers);
            let engine = Arc::new(
                TransitionEngine::load(Arc::clone(&db))
                    .await?
                    .with_reject_threshold(config.reject_escalation_threshold),
            );

            if !dry_run && config.worker_command.is_empty() {
                return Err(conductor::error::ConfigError::InvalidValue {
                    key: "CONDUCTOR_WORKER_CMD".into(),
                    message: "a worker command is required to launch".into(),
                }
                .into());
            }

            let runner = ProcessWorkerRunner::new(
                Arc::clone(&db),
                config.worker_command.clone(),
                config.worker_log_dir.clone(),
            )
            .with_timeout(config.worker_timeout)
            .with_heartbeat_interval(config.heartbeat_interval);
            let launcher = Arc::new(Launcher::new(Arc::clone(&db), engine, Arc::new(runner)));

            if watch {
                let handle = spawn_launch_loop(
                    Arc::clone(&launcher),
                    project,
                    order,
                    max_workers,
                    config.launch_interval,
                );
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "Failed to listen for interrupt");
                }
                handle.abort();
                info!(running = launcher.running_count().await, "Waiting for workers");
                launcher.wait_all().await;
                return Ok(ExitCode::SUCCESS);
            }

            let report = launcher.launch(&project, &order, max_workers, dry_run).await?;
            if json {
                print_json(&report)?;
            } else {
                println!("{}", report.message);
                for id in &report.launched_tasks {
                    println!("  + {id}");
                }
                for skipped in &report.skipped {
                    println!("  - {}: {}", skipped.task_id, skipped.reason);
                }
            }

            // Worker completion is recorded by background tasks.
            launcher.wait_all().await;
            Ok(exit_for(report.has_conflicts()))
        }

        Command::Requeue { project, task } => {
            let engine = Arc::new(TransitionEngine::load(Arc::clone(&db)).await?);
            let runner = ProcessWorkerRunner::new(
                Arc::clone(&db),
                config.worker_command.clone(),
                config.worker_log_dir.clone(),
            );
            let launcher = Launcher::new(Arc::clone(&db), engine, Arc::new(runner));
            let task = launcher.requeue(&project, &task).await?;
            if json {
                print_json(&task)?;
            } else {
                println!("{} is {}", task.id, task.status);
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Transition {
            entity,
            project,
            id,
            to,
            role,
            actor,
            reason,
        } => {
            let engine = TransitionEngine::load(Arc::clone(&db))
                .await?
                .with_reject_threshold(config.reject_escalation_threshold);
            let applied = engine
                .apply(&TransitionRequest {
                    entity_type: entity,
                    project_id: project,
                    entity_id: id.clone(),
                    to_status: to.to_ascii_uppercase(),
                    role,
                    actor,
                    reason,
                    locks: LockPolicy::Acquire,
                })
                .await?;
            if json {
                print_json(&applied)?;
            } else {
                println!(
                    "{entity} {id}: {} -> {}",
                    applied.from_status,
                    applied.entity.status_str()
                );
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Escalations {
            project,
            task,
            escalation_type,
            status,
            limit,
            stats,
        } => {
            let recorder = EscalationRecorder::new(db);
            let filter = EscalationFilter {
                project_id: project,
                task_id: task,
                escalation_type,
                status,
                fingerprint: None,
                limit,
            };

            if stats {
                let stats = recorder.statistics(&filter).await?;
                if json {
                    print_json(&stats)?;
                } else {
                    println!("Total: {}", stats.total);
                    for (ty, count) in &stats.by_type {
                        println!("  {ty}: {count}");
                    }
                    for (status, count) in &stats.by_status {
                        println!("  {status}: {count}");
                    }
                }
                return Ok(ExitCode::SUCCESS);
            }

            let rows = recorder.history(&filter).await?;
            if json {
                print_json(&rows)?;
            } else if rows.is_empty() {
                println!("No escalations");
            } else {
                for e in &rows {
                    println!(
                        "{}  {}  {}  {} {}: {}",
                        e.id,
                        e.created_at.to_rfc3339(),
                        e.status,
                        e.escalation_type,
                        e.entity.task_id.as_deref().unwrap_or(&e.entity.project_id),
                        e.title
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Ack { id } => {
            let escalation = EscalationRecorder::new(db).acknowledge(id).await?;
            if json {
                print_json(&escalation)?;
            } else {
                println!("{} is {}", escalation.id, escalation.status);
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Resolve { id } => {
            let escalation = EscalationRecorder::new(db).resolve(id).await?;
            if json {
                print_json(&escalation)?;
            } else {
                println!("{} is {}", escalation.id, escalation.status);
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::SafetyCheck { project } => {
            let report = check_worker_safety(db.as_ref(), project.as_deref()).await?;
            if json {
                print_json(&report)?;
            } else if report.safe {
                println!("Safe: no workers running");
            } else {
                println!("Unsafe: {} task(s) in progress", report.running_tasks.len());
                for t in &report.running_tasks {
                    println!("  {}/{}/{}  {}", t.project_id, t.order_id, t.task_id, t.title);
                }
            }
            Ok(exit_for(!report.safe))
        }

        Command::Migrate { .. } => Ok(ExitCode::SUCCESS),
    }
}

async fn migrate(path: &Path, force: bool, json: bool) -> Result<ExitCode, Error> {
    let backend = LibSqlBackend::open_local(path).await?;
    let pending = backend.pending_migrations().await?;

    if pending == 0 {
        if json {
            print_json(&serde_json::json!({ "applied": 0 }))?;
        } else {
            println!("Schema is up to date");
        }
        return Ok(ExitCode::SUCCESS);
    }

    // Without a tasks table there can be no running workers.
    if (pending as i64) < migrations::latest_version() {
        require_worker_safety(&backend, force).await?;
    }

    backend.init_schema().await?;
    info!(applied = pending, path = %path.display(), "Migrations applied");
    if json {
        print_json(&serde_json::json!({ "applied": pending }))?;
    } else {
        println!("Applied {pending} migration(s)");
    }
    Ok(ExitCode::SUCCESS)
}
