//! Completion workers.
//!
//! Each worker pulls a bounded batch of finished jobs off the completion
//! queue, runs the job's callbacks outside the lock, then closes the job's
//! transactional scopes.
//!
//! A guarded job has every callback isolated on its own. For an unguarded job
//! the first panic abandons the rest of that job (remaining callbacks and
//! transaction closes); the worker and the rest of its batch carry on.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::backend::{Backend, ContextFormat, TransactionScope};
use crate::job::{DeliveryJob, Outcome};
use crate::shared::{PipelineStats, Shared};

/// Upper bound on a single condvar wait before the exit flag is rechecked.
const WAIT_TICK: Duration = Duration::from_millis(250);

/// Spawn `count` workers. Spawn failures are logged and the remaining
/// workers keep running.
pub(crate) fn spawn_workers<B: Backend>(
    pipeline: &str,
    count: usize,
    batch_size: usize,
    shared: &Arc<Shared<B>>,
    backend: &Arc<B>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::with_capacity(count);

    for index in 0..count {
        let name = format!("{pipeline}-completion-{index}");
        shared.lock().live_workers += 1;

        let worker = Worker {
            name: name.clone(),
            batch_size,
            shared: Arc::clone(shared),
            backend: Arc::clone(backend),
        };
        match thread::Builder::new().name(name.clone()).spawn(move || worker.run()) {
            Ok(handle) => handles.push(handle),
            Err(err) => {
                shared.lock().live_workers -= 1;
                error!(worker = %name, error = %err, "failed to spawn completion worker");
            }
        }
    }

    handles
}

struct Worker<B: Backend> {
    name: String,
    batch_size: usize,
    shared: Arc<Shared<B>>,
    backend: Arc<B>,
}

/// Decrements the live worker count when a worker exits, unwinding included.
struct LiveWorker<'a, B: Backend>(&'a Shared<B>);

impl<B: Backend> Drop for LiveWorker<'_, B> {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        state.live_workers = state.live_workers.saturating_sub(1);
    }
}

impl<B: Backend> Worker<B> {
    fn run(self) {
        let _live = LiveWorker(&self.shared);
        let mut batch = Vec::with_capacity(self.batch_size);
        let mut stats = PipelineStats::default();

        debug!(worker = %self.name, "completion worker started");
        loop {
            {
                let mut state = self.shared.lock();
                state.stats.absorb(&mut stats);
                while state.completions.is_empty() {
                    if state.workers_exit {
                        debug!(worker = %self.name, "completion worker stopped");
                        return;
                    }
                    state = self.shared.wait_for_completions(state, WAIT_TICK);
                }
                state.completions.drain_front_into(&mut batch, self.batch_size);
            }

            for job in batch.drain(..) {
                let (job_id, destination) = (job.id, job.destination);
                let completed =
                    panic::catch_unwind(AssertUnwindSafe(|| self.complete(job, &mut stats)));
                if let Err(payload) = completed {
                    stats.callback_failures += 1;
                    error!(
                        worker = %self.name,
                        %job_id,
                        %destination,
                        panic = %panic_message(payload.as_ref()),
                        "unguarded completion callback panicked; job abandoned"
                    );
                }
            }
        }
    }

    fn complete(&self, job: DeliveryJob<B>, stats: &mut PipelineStats) {
        let guard = job.guards_panics();

        match job.outcome() {
            Outcome::Delivered(output) => {
                for callback in job.success_callbacks() {
                    self.invoke(&job, guard, stats, || callback(&*job.context, output));
                }
            }
            Outcome::Failed(err) => {
                for callback in job.error_callbacks() {
                    self.invoke(&job, guard, stats, || callback(&*job.context, err));
                }
            }
            Outcome::Pending => {}
        }

        if job.is_transactional() {
            self.close_transactions(&job, stats);
        }

        debug!(
            worker = %self.name,
            job_id = %job.id,
            destination = %job.destination,
            latency_ms = (chrono::Utc::now() - job.created_at).num_milliseconds(),
            "job completed"
        );
    }

    /// Run one callback. With `guard` set a panic is caught and logged; an
    /// `Err` return is always logged. Neither reaches sibling callbacks.
    fn invoke<F>(&self, job: &DeliveryJob<B>, guard: bool, stats: &mut PipelineStats, callback: F)
    where
        F: FnOnce() -> anyhow::Result<()>,
    {
        let result = if guard {
            match panic::catch_unwind(AssertUnwindSafe(callback)) {
                Ok(result) => result,
                Err(payload) => {
                    stats.callback_failures += 1;
                    error!(
                        worker = %self.name,
                        job_id = %job.id,
                        destination = %job.destination,
                        panic = %panic_message(payload.as_ref()),
                        context = %self.backend.describe_context(&job.context, true, ContextFormat::Json),
                        "completion callback panicked"
                    );
                    return;
                }
            }
        } else {
            callback()
        };

        if let Err(err) = result {
            stats.callback_failures += 1;
            warn!(
                worker = %self.name,
                job_id = %job.id,
                destination = %job.destination,
                error = %format!("{err:#}"),
                context = %self.backend.describe_context(&job.context, false, ContextFormat::Text),
                "completion callback failed"
            );
        }
    }

    /// Close the session scope, then the destination scope. The destination
    /// scope stays open when the session close fails.
    fn close_transactions(&self, job: &DeliveryJob<B>, stats: &mut PipelineStats) {
        for scope in [TransactionScope::Session, TransactionScope::Destination] {
            if let Err(err) = self.backend.close_transaction(&job.context, scope) {
                stats.transaction_failures += 1;
                warn!(
                    worker = %self.name,
                    job_id = %job.id,
                    destination = %job.destination,
                    %scope,
                    error = %err,
                    "failed to close transaction"
                );
                return;
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
