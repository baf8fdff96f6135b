//! src/engine/detector.rs
//!
//! The failure-detection half of the engine: a periodic tick that picks one
//! random member and probes it, first with a direct ping and then through
//! indirect ping-req helpers, before passing a verdict.

use crate::engine::EngineCtx;
use crate::packet::Packet;
use crate::status::Status;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time;
use tokio_util::sync::CancellationToken;

/// One-shot wakers for "an ack arrived from this member". A check registers
/// a waiter before it pings, and deregisters it itself when the wait times
/// out, so entries never accumulate for members that stay silent.
#[derive(Debug, Default)]
pub(crate) struct AckWaiters {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    waiting: HashMap<String, Vec<(u64, oneshot::Sender<()>)>>,
}

impl AckWaiters {
    pub(crate) fn register(&self, name: &str) -> (u64, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().expect("waiter lock");
        inner.next_id += 1;
        let id = inner.next_id;
        inner
            .waiting
            .entry(name.to_string())
            .or_default()
            .push((id, tx));
        (id, rx)
    }

    /// Wakes everything currently waiting on an ack from `name`.
    pub(crate) fn notify(&self, name: &str) {
        let woken = self.inner.lock().expect("waiter lock").waiting.remove(name);
        if let Some(woken) = woken {
            for (_, tx) in woken {
                let _ = tx.send(());
            }
        }
    }

    /// Drops a single registration after its wait ended.
    pub(crate) fn forget(&self, name: &str, id: u64) {
        let mut inner = self.inner.lock().expect("waiter lock");
        if let Some(waiters) = inner.waiting.get_mut(name) {
            waiters.retain(|(waiter_id, _)| *waiter_id != id);
            if waiters.is_empty() {
                inner.waiting.remove(name);
            }
        }
    }
}

/// Periodically spawns a check against one random non-local member of any
/// status.
pub(crate) async fn run_failure_detection(ctx: Arc<EngineCtx>, shutdown: CancellationToken) {
    let mut ticker = time::interval(ctx.config.ping_interval());
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let target = {
                    let members = ctx.members.lock().await;
                    members.find(1, Status::ALL, &[]).into_iter().next()
                };
                if let Some(target) = target {
                    tokio::spawn(check(ctx.clone(), target));
                }
            }
        }
    }
}

/// One failure-detection round against `target`.
///
/// The waiter is registered before the ping goes out, so an ack racing the
/// timer can never be missed. A target that stays silent through both the
/// direct and indirect phases is marked suspect; the transition rules keep
/// an already-offline member offline.
async fn check(ctx: Arc<EngineCtx>, target: Arc<str>) {
    let source = { ctx.members.lock().await.local_source() };

    let (id, ack_rx) = ctx.waiters.register(&target);
    ctx.send(
        &target,
        Packet::Ping {
            source: source.clone(),
        },
    )
    .await;
    let mut online = wait_ack(ack_rx, ctx.config.ping_timeout()).await;
    ctx.waiters.forget(&target, id);

    if !online {
        let helpers = {
            let members = ctx.members.lock().await;
            members.find(
                ctx.config.ping_req_count,
                Status::AVAILABLE,
                &[target.as_ref()],
            )
        };
        if !helpers.is_empty() {
            let (id, ack_rx) = ctx.waiters.register(&target);
            for helper in &helpers {
                tracing::debug!(
                    target = %target,
                    helper = %helper,
                    "direct ping timed out; requesting indirect ping"
                );
                ctx.send(
                    helper,
                    Packet::PingReq {
                        source: source.clone(),
                        target: target.to_string(),
                    },
                )
                .await;
            }
            online = wait_ack(ack_rx, ctx.config.ping_req_timeout()).await;
            ctx.waiters.forget(&target, id);
        }
    }

    let new_status = if online {
        Status::ONLINE
    } else {
        Status::SUSPECT
    };
    ctx.members.lock().await.update(&target, Some(new_status), None);
}

async fn wait_ack(ack_rx: oneshot::Receiver<()>, timeout: Duration) -> bool {
    matches!(time::timeout(timeout, ack_rx).await, Ok(Ok(())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_wakes_all_registered_waiters() {
        let waiters = AckWaiters::default();
        let (_, mut rx1) = waiters.register("b:2");
        let (_, mut rx2) = waiters.register("b:2");
        let (_, mut other) = waiters.register("c:3");
        waiters.notify("b:2");
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
        assert!(other.try_recv().is_err());
    }

    #[test]
    fn test_forget_removes_only_one_registration() {
        let waiters = AckWaiters::default();
        let (id1, mut rx1) = waiters.register("b:2");
        let (_, mut rx2) = waiters.register("b:2");
        waiters.forget("b:2", id1);
        waiters.notify("b:2");
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn test_notify_without_waiters_is_harmless() {
        let waiters = AckWaiters::default();
        waiters.notify("b:2");
        waiters.forget("b:2", 42);
    }
}
