use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::error::exit_code;

const BEAT_INTERVAL: Duration = Duration::from_secs(1);
const KILL_AFTER: Duration = Duration::from_secs(2);

/// Cross-monitor the two execution contexts. Each side schedules a
/// recurring heartbeat in its own context that pushes back a kill timer
/// running in the other one; a scheduler that silently stops making
/// progress misses a beat and the surviving context aborts the process.
///
/// Must be called from within the control-plane `LocalSet`.
pub fn cross_monitor(auxiliary: &Handle) {
    let (control_beat, control_watch) = mpsc::channel(1);
    tokio::task::spawn_local(beat(control_beat));
    auxiliary.spawn(kill_on_stall(control_watch, "control"));

    let (aux_beat, aux_watch) = mpsc::channel(1);
    auxiliary.spawn(beat(aux_beat));
    tokio::task::spawn_local(kill_on_stall(aux_watch, "auxiliary"));
}

async fn beat(tx: mpsc::Sender<()>) {
    let mut interval = tokio::time::interval(BEAT_INTERVAL);
    loop {
        interval.tick().await;
        // A full buffer means the kill timer is already behind on draining
        // beats; never suspend on it from here.
        match tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => {}
            Err(mpsc::error::TrySendError::Closed(())) => return,
        }
    }
}

async fn kill_on_stall(watch: mpsc::Receiver<()>, context: &'static str) {
    if stalled(watch, KILL_AFTER).await {
        tracing::error!(context, "Watchdog kill timer fired");
        std::process::exit(exit_code::WATCHDOG);
    }
}

/// True when the heartbeat misses an interval, false when it shut down
/// cleanly.
async fn stalled(mut watch: mpsc::Receiver<()>, after: Duration) -> bool {
    loop {
        match tokio::time::timeout(after, watch.recv()).await {
            Ok(Some(())) => {}
            Ok(None) => return false,
            Err(_) => return true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn missed_beats_trip_the_kill_timer() {
        let (tx, rx) = mpsc::channel(1);
        let monitor = tokio::spawn(stalled(rx, Duration::from_secs(2)));

        for _ in 0..3 {
            tx.send(()).await.expect("kill timer alive");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        // Stop beating without closing the channel: a stalled scheduler
        // still holds its sender.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(monitor.await.expect("monitor finishes"));
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn clean_shutdown_is_not_a_stall() {
        let (tx, rx) = mpsc::channel(1);
        let monitor = tokio::spawn(stalled(rx, Duration::from_secs(2)));
        tx.send(()).await.expect("kill timer alive");
        drop(tx);
        assert!(!monitor.await.expect("monitor finishes"));
    }
}
