//! `hplan dispatch run` — drive C9 by hand against a [`hplan_broker::PaperBroker`].
//!
//! The wall-clock throttle (§4.9) is backed by `chrono::Utc::now` here; a
//! fresh `Dispatcher` is constructed per invocation, so the 15-minute
//! throttle window is only meaningful across calls when the caller runs
//! this command from a long-lived process (the daemon's `/v1/dispatch/run`
//! route is the one that actually carries state across invocations).

use anyhow::Result;
use chrono::Utc;
use hplan_broker::PaperBroker;
use hplan_dispatcher::{DispatchOutcome, Dispatcher};

pub async fn run(throttle_window_minutes: i64, max_retries: i32) -> Result<()> {
    let pool = hplan_db::connect_from_env().await?;
    let broker = PaperBroker::new();
    let clock = || Utc::now().timestamp_millis();
    let dispatcher = Dispatcher::new(throttle_window_minutes, max_retries, clock);

    let outcome = dispatcher.dispatch_once(&pool, &broker).await?;

    match outcome {
        DispatchOutcome::Throttled => println!("outcome=throttled"),
        DispatchOutcome::NothingPending => println!("outcome=nothing_pending"),
        DispatchOutcome::MaxRetriesExceeded { uuid } => {
            println!("outcome=max_retries_exceeded uuid={uuid}");
        }
        DispatchOutcome::Executed { uuid, order_id } => {
            println!(
                "outcome=executed uuid={uuid} order_id={}",
                order_id.as_deref().unwrap_or("")
            );
        }
        DispatchOutcome::Failed { uuid, reason } => {
            println!("outcome=failed uuid={uuid} reason={reason}");
        }
    }

    Ok(())
}
