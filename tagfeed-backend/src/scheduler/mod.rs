pub mod runner;

pub use runner::{run_cycle, CompletedRun, CycleReport, Scheduler, SchedulerConfig};
