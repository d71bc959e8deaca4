//! Integration tests for the full outbound pipeline.
//!
//! Tests: submit → intake → scheduler → backend → completion workers
//!
//! Verifies:
//! - Per-destination rate limits space out sends
//! - Retry budgets, final failures and FIFO order of retried jobs
//! - Callback failures stay isolated; transactional scopes close in order
//! - Reconfigure and shutdown drain what is already queued
//! - Rate limits survive a reconfigure

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use courier_core::{DestinationKey, DestinationType};

    use crate::backend::{Backend, ContextFormat, SendFailure, TransactionScope};
    use crate::config::{LimiterConfig, PipelineConfig};
    use crate::error::PipelineError;
    use crate::job::{DeliveryJob, RetryBudget};
    use crate::pipeline::Pipeline;
    use crate::shared::PipelineStatus;

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Debug, Clone)]
    struct Msg {
        to: DestinationKey,
        text: String,
    }

    /// Decides the result of the `nth` (0-based) send of a given text.
    type Script = dyn Fn(&str, usize) -> Result<(), SendFailure<String>> + Send + Sync;

    #[derive(Default)]
    struct Recorder {
        sends: Mutex<Vec<(Instant, DestinationKey, String)>>,
        closes: Mutex<Vec<TransactionScope>>,
        notified_ok: AtomicUsize,
        notified_err: AtomicUsize,
    }

    impl Recorder {
        fn sent_texts(&self) -> Vec<String> {
            self.sends.lock().unwrap().iter().map(|(_, _, t)| t.clone()).collect()
        }

        fn sent_at(&self, text: &str) -> Vec<Instant> {
            self.sends
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, _, t)| t == text)
                .map(|(at, _, _)| *at)
                .collect()
        }
    }

    struct ScriptedBackend {
        recorder: Arc<Recorder>,
        script: Box<Script>,
        failing_scope: Option<TransactionScope>,
    }

    impl ScriptedBackend {
        fn accepting() -> (Self, Arc<Recorder>) {
            Self::scripted(|_, _| Ok(()))
        }

        fn scripted<F>(script: F) -> (Self, Arc<Recorder>)
        where
            F: Fn(&str, usize) -> Result<(), SendFailure<String>> + Send + Sync + 'static,
        {
            let recorder = Arc::new(Recorder::default());
            let backend = Self {
                recorder: Arc::clone(&recorder),
                script: Box::new(script),
                failing_scope: None,
            };
            (backend, recorder)
        }

        fn failing_close(mut self, scope: TransactionScope) -> Self {
            self.failing_scope = Some(scope);
            self
        }
    }

    impl Backend for ScriptedBackend {
        type Payload = Msg;
        type Output = String;
        type Error = String;
        type Context = &'static str;

        fn send(&self, msg: &Msg) -> Result<String, SendFailure<String>> {
            let nth = {
                let mut sends = self.recorder.sends.lock().unwrap();
                let nth = sends.iter().filter(|(_, _, t)| *t == msg.text).count();
                sends.push((Instant::now(), msg.to, msg.text.clone()));
                nth
            };
            (self.script)(&msg.text, nth).map(|()| format!("sent:{}", msg.text))
        }

        fn notify_send_ok(&self, _ctx: &&'static str, _output: &String) {
            self.recorder.notified_ok.fetch_add(1, Ordering::SeqCst);
        }

        fn notify_send_err(&self, _ctx: &&'static str, _error: &String) {
            self.recorder.notified_err.fetch_add(1, Ordering::SeqCst);
        }

        fn close_transaction(&self, _ctx: &&'static str, scope: TransactionScope) -> Result<(), String> {
            self.recorder.closes.lock().unwrap().push(scope);
            if self.failing_scope == Some(scope) {
                return Err(format!("{scope} close refused"));
            }
            Ok(())
        }

        fn describe_context(&self, ctx: &&'static str, _verbose: bool, _format: ContextFormat) -> String {
            ctx.to_string()
        }
    }

    fn user(id: i64) -> DestinationKey {
        DestinationKey::user(id).unwrap()
    }

    fn job(to: DestinationKey, text: &str) -> DeliveryJob<ScriptedBackend> {
        DeliveryJob::new(
            to,
            Msg {
                to,
                text: text.to_string(),
            },
            Arc::new("test-origin"),
        )
    }

    fn fast_config() -> PipelineConfig {
        PipelineConfig::default()
            .with_name("test")
            .with_pacing_interval(Duration::from_millis(1))
            .with_limiter(LimiterConfig::disabled())
    }

    fn limited_config(budget: u32, window: Duration) -> PipelineConfig {
        fast_config().with_limiter(LimiterConfig::default().with_limit(DestinationType::USER, budget, window))
    }

    fn wait_until(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn second_send_to_limited_destination_waits_one_window() {
        let window = Duration::from_millis(300);
        let (backend, recorder) = ScriptedBackend::accepting();
        let pipeline = Pipeline::start(limited_config(1, window), backend).unwrap();
        let (tx, rx) = mpsc::channel();

        for text in ["first", "second"] {
            let tx = tx.clone();
            pipeline.submit(job(user(7), text).on_success(move |_, out: &String| {
                tx.send(out.clone())?;
                Ok(())
            }));
        }

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "sent:first");
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "sent:second");

        let first = recorder.sent_at("first")[0];
        let second = recorder.sent_at("second")[0];
        assert!(second.duration_since(first) >= window);

        let stats = pipeline.shutdown().unwrap();
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.attempts, 2);
    }

    #[test]
    fn limited_destination_does_not_block_others() {
        let (backend, recorder) = ScriptedBackend::accepting();
        let pipeline = Pipeline::start(limited_config(1, Duration::from_millis(300)), backend).unwrap();

        pipeline.submit_batch([job(user(1), "a1"), job(user(1), "a2"), job(user(2), "b1")]);

        assert!(wait_until(|| recorder.sent_texts().len() == 3));
        assert_eq!(recorder.sent_texts(), vec!["a1", "b1", "a2"]);
        pipeline.shutdown().unwrap();
    }

    #[test]
    fn busy_destination_does_not_shadow_the_next_one() {
        let (backend, recorder) = ScriptedBackend::accepting();
        let pipeline = Pipeline::start(fast_config(), backend).unwrap();

        let mut batch: Vec<_> = (0..5).map(|i| job(user(1), &format!("a{i}"))).collect();
        batch.push(job(user(2), "b0"));
        pipeline.submit_batch(batch);

        pipeline.shutdown().unwrap();
        let sent = recorder.sent_texts();
        assert_eq!(sent.len(), 6);
        assert_eq!(sent.iter().position(|t| t == "b0"), Some(1));
    }

    #[test]
    fn final_failure_goes_straight_to_error_callbacks() {
        let (backend, recorder) =
            ScriptedBackend::scripted(|_, _| Err(SendFailure::Final("blocked by user".to_string())));
        let pipeline = Pipeline::start(fast_config(), backend).unwrap();
        let (tx, rx) = mpsc::channel();

        pipeline.submit(
            job(user(3), "hello")
                .with_retries(RetryBudget::Limited(5))
                .on_success(|_, _| panic!("must not succeed"))
                .on_error(move |origin, err: &String| {
                    tx.send(format!("{origin}: {err}"))?;
                    Ok(())
                }),
        );

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "test-origin: blocked by user");
        let stats = pipeline.shutdown().unwrap();
        assert_eq!(recorder.sent_texts().len(), 1);
        assert_eq!(recorder.notified_err.load(Ordering::SeqCst), 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.retried, 0);
    }

    #[test]
    fn transient_failures_are_attempted_budget_plus_one_times() {
        let (backend, recorder) =
            ScriptedBackend::scripted(|_, nth| Err(SendFailure::Transient(format!("timeout #{nth}"))));
        let pipeline = Pipeline::start(fast_config(), backend).unwrap();
        let (tx, rx) = mpsc::channel();

        pipeline.submit(
            job(user(4), "flaky")
                .with_retries(RetryBudget::Limited(2))
                .on_error(move |_, err: &String| {
                    tx.send(err.clone())?;
                    Ok(())
                }),
        );

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "timeout #2");
        let stats = pipeline.shutdown().unwrap();
        assert_eq!(recorder.sent_texts().len(), 3);
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.failed, 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unset_retry_budget_takes_pipeline_default() {
        let (backend, recorder) =
            ScriptedBackend::scripted(|_, _| Err(SendFailure::Transient("503".to_string())));
        let config = fast_config().with_default_retries(RetryBudget::Limited(1));
        let pipeline = Pipeline::start(config, backend).unwrap();

        pipeline.submit(job(user(5), "defaulted"));

        let stats = pipeline.shutdown().unwrap();
        assert_eq!(recorder.sent_texts().len(), 2);
        assert_eq!(stats.failed, 1);
    }

    #[test]
    fn unlimited_retries_keep_going_until_success() {
        let (backend, recorder) = ScriptedBackend::scripted(|_, nth| {
            if nth < 5 {
                Err(SendFailure::Transient("429".to_string()))
            } else {
                Ok(())
            }
        });
        let mut config = fast_config().with_default_retries(RetryBudget::Unlimited);
        config.unlimited_retry_warn_threshold = 3;
        let pipeline = Pipeline::start(config, backend).unwrap();

        pipeline.submit(job(user(6), "stubborn"));

        let stats = pipeline.shutdown().unwrap();
        assert_eq!(recorder.sent_texts().len(), 6);
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.retried, 5);
        assert_eq!(stats.retry_overflows, 1);
    }

    #[test]
    fn retries_below_the_threshold_are_not_reported() {
        let (backend, _recorder) = ScriptedBackend::scripted(|_, nth| {
            if nth < 2 {
                Err(SendFailure::Transient("429".to_string()))
            } else {
                Ok(())
            }
        });
        let mut config = fast_config().with_default_retries(RetryBudget::Unlimited);
        config.unlimited_retry_warn_threshold = 10;
        let pipeline = Pipeline::start(config, backend).unwrap();

        pipeline.submit(job(user(16), "patient"));

        let stats = pipeline.shutdown().unwrap();
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.retry_overflows, 0);
    }

    #[test]
    fn retried_job_stays_ahead_of_newer_jobs() {
        let (backend, recorder) = ScriptedBackend::scripted(|text, nth| {
            if text == "a" && nth == 0 {
                Err(SendFailure::Transient("hiccup".to_string()))
            } else {
                Ok(())
            }
        });
        let pipeline = Pipeline::start(fast_config(), backend).unwrap();

        pipeline.submit_batch([job(user(8), "a"), job(user(8), "b"), job(user(8), "c")]);

        pipeline.shutdown().unwrap();
        assert_eq!(recorder.sent_texts(), vec!["a", "a", "b", "c"]);
    }

    #[test]
    fn callback_failures_do_not_affect_siblings() {
        let (backend, _recorder) = ScriptedBackend::accepting();
        let pipeline = Pipeline::start(fast_config(), backend).unwrap();
        let (tx, rx) = mpsc::channel();

        pipeline.submit(
            job(user(9), "hi")
                .guarded(true)
                .on_success(|_, _| panic!("callback bug"))
                .on_success(|_, _| Err(anyhow::anyhow!("downstream unavailable")))
                .on_success(move |_, out: &String| {
                    tx.send(out.clone())?;
                    Ok(())
                }),
        );

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "sent:hi");
        let stats = pipeline.shutdown().unwrap();
        assert_eq!(stats.callback_failures, 2);
        assert_eq!(stats.delivered, 1);
    }

    #[test]
    fn unguarded_panic_abandons_only_its_own_job() {
        let (backend, _recorder) = ScriptedBackend::accepting();
        let pipeline = Pipeline::start(fast_config().with_completion_workers(1), backend).unwrap();
        let completed = Arc::new(AtomicUsize::new(0));
        let skipped = Arc::new(AtomicUsize::new(0));

        let after_panic = Arc::clone(&skipped);
        let mut batch = vec![
            job(user(17), "unguarded")
                .guarded(false)
                .on_success(|_, _| panic!("callback bug"))
                .on_success(move |_, _| {
                    after_panic.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
        ];
        batch.extend((0..5).map(|i| {
            let completed = Arc::clone(&completed);
            job(user(18), &format!("g{i}")).guarded(true).on_success(move |_, _| {
                completed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }));
        pipeline.submit_batch(batch);

        let stats = pipeline.shutdown().unwrap();
        assert_eq!(completed.load(Ordering::SeqCst), 5);
        assert_eq!(skipped.load(Ordering::SeqCst), 0);
        assert_eq!(stats.callback_failures, 1);
        assert_eq!(stats.delivered, 6);
    }

    #[test]
    fn transactional_job_closes_session_then_destination() {
        let (backend, recorder) = ScriptedBackend::accepting();
        let pipeline = Pipeline::start(fast_config(), backend).unwrap();

        pipeline.submit(job(user(10), "tx").transactional(true));

        let stats = pipeline.shutdown().unwrap();
        assert_eq!(
            *recorder.closes.lock().unwrap(),
            vec![TransactionScope::Session, TransactionScope::Destination]
        );
        assert_eq!(stats.transaction_failures, 0);
    }

    #[test]
    fn failed_session_close_skips_destination_scope() {
        let (backend, recorder) = ScriptedBackend::accepting();
        let backend = backend.failing_close(TransactionScope::Session);
        let pipeline = Pipeline::start(fast_config(), backend).unwrap();

        pipeline.submit(job(user(11), "tx").transactional(true));

        let stats = pipeline.shutdown().unwrap();
        assert_eq!(*recorder.closes.lock().unwrap(), vec![TransactionScope::Session]);
        assert_eq!(stats.transaction_failures, 1);
    }

    #[test]
    fn notify_hooks_fire_without_callbacks() {
        let (backend, recorder) = ScriptedBackend::scripted(|text, _| {
            if text == "bad" {
                Err(SendFailure::Final("rejected".to_string()))
            } else {
                Ok(())
            }
        });
        let pipeline = Pipeline::start(fast_config(), backend).unwrap();

        pipeline.submit_batch([job(user(12), "good"), job(user(13), "bad")]);

        pipeline.shutdown().unwrap();
        assert_eq!(recorder.notified_ok.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.notified_err.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reconfigure_restarts_after_draining() {
        let (backend, recorder) = ScriptedBackend::accepting();
        let pipeline = Pipeline::start(limited_config(1, Duration::from_millis(500)), backend).unwrap();
        let (tx, rx) = mpsc::channel();

        for text in ["j1", "j2"] {
            let tx = tx.clone();
            pipeline.submit(job(user(14), text).on_success(move |_, out: &String| {
                tx.send(out.clone())?;
                Ok(())
            }));
        }
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "sent:j1");

        // j2 is still held back by the limiter, so the restart stays pending.
        let invalid = fast_config().with_completion_workers(0);
        assert!(matches!(
            pipeline.request_reconfigure(invalid),
            Err(PipelineError::InvalidConfig(_))
        ));
        pipeline.request_reconfigure(fast_config().with_name("test-next")).unwrap();
        assert!(matches!(
            pipeline.request_reconfigure(fast_config()),
            Err(PipelineError::RestartPending)
        ));

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "sent:j2");
        assert!(wait_until(|| pipeline.stats().restarts == 1));
        assert_eq!(pipeline.status(), PipelineStatus::Running);

        pipeline.submit(job(user(14), "j3").on_success(move |_, out: &String| {
            tx.send(out.clone())?;
            Ok(())
        }));
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "sent:j3");

        let stats = pipeline.shutdown().unwrap();
        assert_eq!(stats.restarts, 1);
        assert_eq!(stats.delivered, 3);
        assert_eq!(recorder.sent_texts(), vec!["j1", "j2", "j3"]);
    }

    #[test]
    fn rate_limit_holds_across_a_restart() {
        let window = Duration::from_millis(600);
        let config = limited_config(1, window);
        let (backend, recorder) = ScriptedBackend::accepting();
        let pipeline = Pipeline::start(config.clone(), backend).unwrap();
        let (tx, rx) = mpsc::channel();

        let first = tx.clone();
        pipeline.submit(job(user(19), "before").on_success(move |_, out: &String| {
            first.send(out.clone())?;
            Ok(())
        }));
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "sent:before");

        pipeline.request_reconfigure(config).unwrap();
        assert!(wait_until(|| pipeline.stats().restarts == 1));

        pipeline.submit(job(user(19), "after").on_success(move |_, out: &String| {
            tx.send(out.clone())?;
            Ok(())
        }));
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "sent:after");

        let before = recorder.sent_at("before")[0];
        let after = recorder.sent_at("after")[0];
        assert!(after.duration_since(before) >= window);

        let stats = pipeline.shutdown().unwrap();
        assert_eq!(stats.restarts, 1);
        assert_eq!(stats.delivered, 2);
    }

    #[test]
    fn shutdown_delivers_everything_already_queued() {
        let (backend, recorder) = ScriptedBackend::accepting();
        let pipeline = Pipeline::start(fast_config(), backend).unwrap();
        let completed = Arc::new(AtomicUsize::new(0));

        pipeline.submit_batch((0..20).map(|i| {
            let completed = Arc::clone(&completed);
            job(user(100 + i), &format!("m{i}")).on_success(move |_, _| {
                completed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }));

        let stats = pipeline.shutdown().unwrap();
        assert_eq!(stats.submitted, 20);
        assert_eq!(stats.delivered, 20);
        assert_eq!(recorder.sent_texts().len(), 20);
        assert_eq!(completed.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn submissions_after_shutdown_are_dropped() {
        let (backend, recorder) = ScriptedBackend::accepting();
        let pipeline = Pipeline::start(fast_config(), backend).unwrap();
        let submitter = pipeline.submitter();

        pipeline.shutdown().unwrap();
        assert_eq!(submitter.status(), PipelineStatus::Stopped);

        submitter.submit(job(user(15), "late"));
        assert_eq!(submitter.stats().dropped, 1);
        assert_eq!(submitter.stats().submitted, 0);
        assert!(recorder.sent_texts().is_empty());
    }

    #[test]
    fn producers_on_many_threads_all_get_through() {
        let (backend, recorder) = ScriptedBackend::accepting();
        let pipeline = Pipeline::start(fast_config(), backend).unwrap();

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let submitter = pipeline.submitter();
                thread::spawn(move || {
                    for i in 0..10 {
                        submitter.submit(job(user(200 + p), &format!("p{p}-{i}")));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        let stats = pipeline.shutdown().unwrap();
        assert_eq!(stats.delivered, 40);

        // Per destination, sends keep submission order.
        let sent = recorder.sent_texts();
        for p in 0..4 {
            let prefix = format!("p{p}-");
            let mine: Vec<_> = sent.iter().filter(|t| t.starts_with(&prefix)).cloned().collect();
            let expected: Vec<_> = (0..10).map(|i| format!("p{p}-{i}")).collect();
            assert_eq!(mine, expected);
        }
    }

    #[test]
    fn invalid_config_is_rejected_at_start() {
        let (backend, _recorder) = ScriptedBackend::accepting();
        let config = fast_config().with_completion_batch_size(0);
        assert!(matches!(
            Pipeline::start(config, backend),
            Err(PipelineError::InvalidConfig(_))
        ));
    }
}
