//! Link liveness probing.
//!
//! [`HeartbeatMonitor::run`] sends a ping every `interval` and arms a pong
//! timer; the matching pong cancels it, expiry declares the link dead. The
//! loop is strictly sequential, so at most one probe is ever outstanding.
//! Matched pongs feed the RTT window used by health and diagnostics.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::metrics;
use crate::state::LinkStats;
use crate::tunnel::frame::Frame;
use crate::util::now_ms;

/// Why the heartbeat loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatExit {
    /// Pong timer expired — the link is dead.
    Dead,
    /// Shutdown was requested.
    Shutdown,
    /// The outbound sink or pong feed closed underneath us.
    LinkClosed,
}

/// Drives ping/pong probing over one link.
pub struct HeartbeatMonitor {
    interval: Duration,
    timeout: Duration,
    stats: Arc<LinkStats>,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration, timeout: Duration, stats: Arc<LinkStats>) -> Self {
        Self {
            interval,
            timeout,
            stats,
        }
    }

    /// Probe until the link dies, the feeds close, or `shutdown` fires.
    ///
    /// `outbound` carries probe frames to the link writer; `pongs` delivers
    /// `(seq, echoed timestamp_ms)` pairs parsed from incoming frames.
    pub async fn run(
        &self,
        outbound: mpsc::Sender<Frame>,
        mut pongs: mpsc::Receiver<(u64, u64)>,
        shutdown: CancellationToken,
    ) -> HeartbeatExit {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately; skip it so
        // probing starts one interval after connect.
        ticker.tick().await;

        let mut seq: u64 = 0;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = shutdown.cancelled() => return HeartbeatExit::Shutdown,
            }

            seq += 1;
            let probe = Frame::Ping {
                seq,
                timestamp_ms: now_ms(),
            };
            if outbound.send(probe).await.is_err() {
                return HeartbeatExit::LinkClosed;
            }
            debug!(seq, "Heartbeat probe sent");

            let deadline = tokio::time::sleep(self.timeout);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    pong = pongs.recv() => match pong {
                        Some((pong_seq, sent_ms)) if pong_seq == seq => {
                            let rtt = now_ms().saturating_sub(sent_ms);
                            self.stats.last_pong_ms.store(now_ms(), Ordering::Relaxed);
                            self.stats.record_rtt(rtt);
                            metrics::record_heartbeat_rtt(rtt);
                            debug!(seq, rtt_ms = rtt, "Heartbeat pong matched");
                            break;
                        }
                        // Stale pong from a previous probe — keep waiting.
                        Some((pong_seq, _)) => {
                            debug!(seq, pong_seq, "Ignoring stale pong");
                        }
                        None => return HeartbeatExit::LinkClosed,
                    },
                    () = &mut deadline => {
                        warn!(seq, timeout_ms = self.timeout.as_millis() as u64,
                            "Pong timeout, declaring link dead");
                        return HeartbeatExit::Dead;
                    }
                    () = shutdown.cancelled() => return HeartbeatExit::Shutdown,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(interval_ms: u64, timeout_ms: u64) -> (HeartbeatMonitor, Arc<LinkStats>) {
        let stats = Arc::new(LinkStats::new());
        (
            HeartbeatMonitor::new(
                Duration::from_millis(interval_ms),
                Duration::from_millis(timeout_ms),
                Arc::clone(&stats),
            ),
            stats,
        )
    }

    #[tokio::test]
    async fn matched_pongs_keep_the_link_alive() {
        let (hb, stats) = monitor(20, 30);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (pong_tx, pong_rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();

        // Echo every ping back as a matching pong.
        let echo = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Frame::Ping { seq, timestamp_ms } = frame {
                    if pong_tx.send((seq, timestamp_ms)).await.is_err() {
                        break;
                    }
                }
            }
        });

        let stop = shutdown.clone();
        let handle = tokio::spawn(async move { hb.run(out_tx, pong_rx, stop).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
        assert_eq!(handle.await.expect("join"), HeartbeatExit::Shutdown);
        assert!(stats.rtt_stats().is_some(), "pongs recorded RTT samples");
        echo.abort();
    }

    #[tokio::test]
    async fn missed_pong_declares_the_link_dead() {
        let (hb, _stats) = monitor(10, 25);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (_pong_tx, pong_rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();

        // Swallow pings without answering.
        let sink = tokio::spawn(async move { while out_rx.recv().await.is_some() {} });

        let exit = hb.run(out_tx, pong_rx, shutdown).await;
        assert_eq!(exit, HeartbeatExit::Dead);
        sink.abort();
    }

    #[tokio::test]
    async fn one_probe_outstanding_at_a_time() {
        let (hb, _stats) = monitor(10, 60);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (_pong_tx, pong_rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(async move { hb.run(out_tx, pong_rx, shutdown).await });

        // First probe fires after one interval; the pong timer (60ms) then
        // blocks further probes even though the interval is 10ms.
        let first = tokio::time::timeout(Duration::from_millis(100), out_rx.recv())
            .await
            .expect("first probe")
            .expect("frame");
        assert!(matches!(first, Frame::Ping { seq: 1, .. }));

        let second = tokio::time::timeout(Duration::from_millis(20), out_rx.recv()).await;
        assert!(second.is_err(), "no second probe while one is pending");

        assert_eq!(handle.await.expect("join"), HeartbeatExit::Dead);
    }

    #[tokio::test]
    async fn stale_pongs_do_not_satisfy_the_probe() {
        let (hb, _stats) = monitor(10, 40);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (pong_tx, pong_rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();

        let answer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Frame::Ping { seq, timestamp_ms } = frame {
                    // Answer with a stale sequence number.
                    let _ = pong_tx.send((seq.wrapping_sub(1), timestamp_ms)).await;
                }
            }
        });

        let exit = hb.run(out_tx, pong_rx, shutdown).await;
        assert_eq!(exit, HeartbeatExit::Dead);
        answer.abort();
    }
}
