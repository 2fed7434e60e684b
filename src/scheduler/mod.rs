//! Scheduling: batch selection, claiming, and worker execution.

pub mod detector;
pub mod launcher;
pub mod runner;

pub use detector::{DependencyBlock, Detector, LaunchPlan, LockBlock, LockHolder};
pub use launcher::{LaunchReport, Launcher, SkippedTask, spawn_launch_loop};
pub use runner::{ProcessWorkerRunner, WorkerExit, WorkerJob, WorkerRunner};
