//! Background sweep that redelivers due outbox records and reports backlog.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{error, info};

use super::Outbox;

const SWEEP_BATCH_LIMIT: i64 = 100;

pub struct OutboxWorker {
    outbox: Arc<Outbox>,
    poll_interval: Duration,
    /// Minimum spacing between backlog reports, so a stuck upstream does not
    /// turn every poll tick into an alert.
    report_interval: Duration,
}

impl OutboxWorker {
    pub fn new(outbox: Arc<Outbox>, poll_interval: Duration, report_interval: Duration) -> Self {
        Self {
            outbox,
            poll_interval,
            report_interval,
        }
    }

    pub async fn run(self) {
        let mut last_report = Instant::now();

        loop {
            sleep(self.poll_interval).await;

            match self.outbox.sweep_due(SWEEP_BATCH_LIMIT).await {
                Ok(0) => {}
                Ok(attempted) => info!(attempted, "outbox sweep redelivered due records"),
                Err(e) => error!("outbox sweep failed: {e}"),
            }

            if last_report.elapsed() >= self.report_interval {
                last_report = Instant::now();
                match self.outbox.backlog().await {
                    Ok(backlog) if backlog.delivering > 0 || backlog.failed > 0 => {
                        info!(
                            pending = backlog.pending,
                            delivering = backlog.delivering,
                            failed = backlog.failed,
                            "outbox backlog"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!("outbox backlog query failed: {e}"),
                }
            }
        }
    }
}
