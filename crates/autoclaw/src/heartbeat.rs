use crate::reply::{InboundMessage, Outbound, ReplyEngine, HEARTBEAT_BODY};
use crate::session::now_ms;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Periodic prober that keeps idle agent sessions warm.
///
/// Runs out-of-band from user turns: it never touches `updated_at_ms`, backs
/// off whenever the command queue is busy, and suppresses the conventional
/// `HEARTBEAT_OK` answer instead of dispatching it.
pub fn spawn_heartbeat(
    engine: Arc<ReplyEngine>,
    outbound: mpsc::Sender<Outbound>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some(minutes) = engine.heartbeat_minutes() else {
            return;
        };
        let period = Duration::from_secs(minutes.saturating_mul(60));
        tracing::info!("heartbeat scheduler running every {minutes}m");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => {
                    heartbeat_sweep(&engine, &outbound).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

/// One pass over all stored sessions.
pub async fn heartbeat_sweep(engine: &ReplyEngine, outbound: &mpsc::Sender<Outbound>) {
    let idle_limit_ms = engine.heartbeat_idle_minutes().saturating_mul(60_000);
    let now = now_ms();

    for (key, session) in engine.sessions().all().await {
        if now.saturating_sub(session.updated_at_ms) <= idle_limit_ms {
            continue;
        }
        if engine.queue().pending() > 0 {
            tracing::debug!("heartbeat for {key} skipped: queue busy");
            continue;
        }

        let probe = InboundMessage {
            from: key.clone(),
            body: HEARTBEAT_BODY.to_string(),
            message_id: format!("heartbeat-{now}"),
            received_at_ms: now,
            ..InboundMessage::default()
        };
        let outcome = engine.reply_heartbeat(&probe).await;
        if outcome.payloads.is_empty() {
            continue;
        }
        if outbound
            .send(Outbound {
                to: key,
                payloads: outcome.payloads,
            })
            .await
            .is_err()
        {
            break;
        }
    }
}
