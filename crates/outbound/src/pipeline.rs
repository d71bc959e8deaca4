//! Producer-facing pipeline handle.
//!
//! `Pipeline::start` spawns a supervisor thread that runs one scheduler
//! generation at a time together with its completion workers. A reconfigure
//! request ends the current generation once it has drained and starts the
//! next one with the new configuration; a shutdown ends the last one. The
//! destination table and limiter counters outlive generations.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{error, info};

use crate::backend::Backend;
use crate::completion::spawn_workers;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::job::DeliveryJob;
use crate::scheduler::{Scheduler, SchedulerExit};
use crate::shared::{PipelineStats, PipelineStatus, Shared};

/// Running outbound pipeline. Dropping it performs a graceful shutdown.
pub struct Pipeline<B: Backend> {
    name: String,
    shared: Arc<Shared<B>>,
    supervisor: Option<JoinHandle<()>>,
}

impl<B: Backend> Pipeline<B> {
    #[tracing::instrument(skip_all, fields(pipeline = %config.name))]
    pub fn start(config: PipelineConfig, backend: B) -> PipelineResult<Self> {
        config.validate()?;

        let name = config.name.clone();
        let shared = Arc::new(Shared::new(&config));
        let backend = Arc::new(backend);

        let thread_name = format!("{name}-scheduler");
        let supervisor = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || supervise(config, shared, backend))
                .map_err(|source| PipelineError::Spawn {
                    name: thread_name,
                    source,
                })?
        };

        info!("pipeline started");
        Ok(Self {
            name,
            shared,
            supervisor: Some(supervisor),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue one job. Never blocks beyond the intake lock; dropped silently
    /// once the pipeline is stopping.
    pub fn submit(&self, job: DeliveryJob<B>) {
        self.shared.submit(vec![job]);
    }

    /// Queue several jobs under a single lock acquisition.
    pub fn submit_batch<I>(&self, jobs: I)
    where
        I: IntoIterator<Item = DeliveryJob<B>>,
    {
        self.shared.submit(jobs.into_iter().collect());
    }

    /// Cloneable submission handle for producer threads.
    pub fn submitter(&self) -> Submitter<B> {
        Submitter {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Ask for a restart with `config`.
    ///
    /// The current generation finishes every job it already holds, then the
    /// next one starts with the new settings. Per-destination send counters
    /// and their pending decrements carry over, so rate limits hold across
    /// the restart. Submissions keep flowing into the intake buffer meanwhile.
    pub fn request_reconfigure(&self, config: PipelineConfig) -> PipelineResult<()> {
        config.validate()?;

        let mut state = self.shared.lock();
        if state.status != PipelineStatus::Running {
            return Err(PipelineError::NotRunning);
        }
        if state.restart.is_some() {
            return Err(PipelineError::RestartPending);
        }
        info!(pipeline = %self.name, next = %config.name, "reconfigure requested");
        state.restart = Some(config);
        Ok(())
    }

    pub fn stats(&self) -> PipelineStats {
        self.shared.stats()
    }

    pub fn status(&self) -> PipelineStatus {
        self.shared.status()
    }

    /// Stop accepting jobs, deliver everything already queued, run the
    /// remaining callbacks and wait for all pipeline threads.
    #[tracing::instrument(skip_all, fields(pipeline = %self.name))]
    pub fn shutdown(mut self) -> PipelineResult<PipelineStats> {
        info!("initiating pipeline shutdown");
        self.request_stop();

        if let Some(handle) = self.supervisor.take() {
            handle.join().map_err(|_| PipelineError::SchedulerPanicked)?;
        }

        let stats = self.shared.stats();
        info!(
            delivered = stats.delivered,
            failed = stats.failed,
            dropped = stats.dropped,
            "pipeline shutdown complete"
        );
        Ok(stats)
    }

    fn request_stop(&self) {
        let mut state = self.shared.lock();
        if state.status == PipelineStatus::Running {
            state.status = PipelineStatus::Stopping;
        }
    }
}

impl<B: Backend> Drop for Pipeline<B> {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor.take() {
            self.request_stop();
            let _ = handle.join();
        }
    }
}

/// Submission-only handle, cheap to clone across producer threads.
pub struct Submitter<B: Backend> {
    shared: Arc<Shared<B>>,
}

impl<B: Backend> Clone for Submitter<B> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<B: Backend> Submitter<B> {
    pub fn submit(&self, job: DeliveryJob<B>) {
        self.shared.submit(vec![job]);
    }

    pub fn submit_batch<I>(&self, jobs: I)
    where
        I: IntoIterator<Item = DeliveryJob<B>>,
    {
        self.shared.submit(jobs.into_iter().collect());
    }

    pub fn status(&self) -> PipelineStatus {
        self.shared.status()
    }

    pub fn stats(&self) -> PipelineStats {
        self.shared.stats()
    }
}

/// Marks the pipeline stopped when the supervisor exits, panics included,
/// and releases any workers still waiting.
struct StopOnExit<'a, B: Backend>(&'a Shared<B>);

impl<B: Backend> Drop for StopOnExit<'_, B> {
    fn drop(&mut self) {
        {
            let mut state = self.0.lock();
            state.status = PipelineStatus::Stopped;
            state.workers_exit = true;
        }
        self.0.notify_all_workers();
    }
}

fn supervise<B: Backend>(mut config: PipelineConfig, shared: Arc<Shared<B>>, backend: Arc<B>) {
    let _stopped = StopOnExit(&shared);
    let mut scheduler = Scheduler::new(config.clone(), Arc::clone(&shared), Arc::clone(&backend));

    loop {
        shared.lock().workers_exit = false;
        let workers = spawn_workers(
            &config.name,
            config.completion_workers,
            config.completion_batch_size,
            &shared,
            &backend,
        );

        let exit = scheduler.run();

        shared.lock().workers_exit = true;
        shared.notify_all_workers();
        for handle in workers {
            if handle.join().is_err() {
                error!(pipeline = %config.name, "completion worker panicked");
            }
        }

        match exit {
            SchedulerExit::Stop => break,
            SchedulerExit::Restart(next) => {
                info!(pipeline = %config.name, next = %next.name, "restarting pipeline");
                shared.lock().stats.restarts += 1;
                scheduler.reconfigure(next.clone());
                config = next;
            }
        }
    }
}
