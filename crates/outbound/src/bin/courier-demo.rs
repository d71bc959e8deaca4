//! Drives a pipeline against a console backend.
//!
//! Every fifth send fails transiently once, and messages to the "blocked"
//! destination fail for good, so the log shows retries and error callbacks.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use courier_outbound::{
    Backend, ContextFormat, DeliveryJob, DestinationKey, Pipeline, PipelineConfig, SendFailure,
    TransactionScope,
};

#[derive(Debug, Clone)]
struct ConsoleMessage {
    to: DestinationKey,
    text: String,
}

#[derive(Debug, Serialize)]
struct Origin {
    update_id: u64,
    chat: String,
}

#[derive(Default)]
struct ConsoleBackend {
    sent: AtomicU64,
    flaked: Mutex<HashSet<String>>,
    blocked: Option<DestinationKey>,
}

impl Backend for ConsoleBackend {
    type Payload = ConsoleMessage;
    type Output = u64;
    type Error = String;
    type Context = Origin;

    fn send(&self, msg: &ConsoleMessage) -> Result<u64, SendFailure<String>> {
        if Some(msg.to) == self.blocked {
            return Err(SendFailure::Final(format!("{} blocked the bot", msg.to)));
        }

        let n = self.sent.fetch_add(1, Ordering::SeqCst) + 1;
        if n % 5 == 0 {
            let mut flaked = self.flaked.lock().unwrap_or_else(|e| e.into_inner());
            if flaked.insert(msg.text.clone()) {
                return Err(SendFailure::Transient("simulated 502".to_string()));
            }
        }

        println!("[{}] {}", msg.to, msg.text);
        Ok(n)
    }

    fn close_transaction(&self, ctx: &Origin, scope: TransactionScope) -> Result<(), String> {
        tracing::debug!(update_id = ctx.update_id, %scope, "transaction closed");
        Ok(())
    }

    fn describe_context(&self, ctx: &Origin, verbose: bool, format: ContextFormat) -> String {
        match format {
            ContextFormat::Json => serde_json::to_string(ctx).unwrap_or_default(),
            ContextFormat::Text if verbose => format!("update {} from {}", ctx.update_id, ctx.chat),
            ContextFormat::Text => format!("update {}", ctx.update_id),
        }
    }
}

fn main() -> anyhow::Result<()> {
    courier_observability::init();

    let config = PipelineConfig::from_env()?.with_name("courier-demo");
    let destinations = [
        DestinationKey::user(1001)?,
        DestinationKey::group(-2002)?,
        DestinationKey::channel(-3003)?,
    ];
    let blocked = DestinationKey::user(4004)?;

    let backend = ConsoleBackend {
        blocked: Some(blocked),
        ..ConsoleBackend::default()
    };
    let pipeline = Pipeline::start(config, backend)?;

    let mut update_id = 0;
    for round in 0..3 {
        for to in destinations.iter().copied().chain([blocked]) {
            update_id += 1;
            let origin = Arc::new(Origin {
                update_id,
                chat: to.to_string(),
            });
            let job = DeliveryJob::new(
                to,
                ConsoleMessage {
                    to,
                    text: format!("round {round} hello #{update_id}"),
                },
                origin,
            )
            .transactional(true)
            .on_success(|origin: &Origin, n: &u64| {
                tracing::info!(update_id = origin.update_id, send = n, "delivered");
                Ok(())
            })
            .on_error(|origin: &Origin, err: &String| {
                tracing::warn!(update_id = origin.update_id, error = %err, "gave up");
                Ok(())
            });
            pipeline.submit(job);
        }
    }

    let stats = pipeline.shutdown()?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
