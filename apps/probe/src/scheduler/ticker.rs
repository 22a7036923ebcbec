//! Periodic trigger phase-aligned to wall-clock seconds.
//!
//! A check with frequency F and offset O fires at instants where
//! `now % F == O`. The ticker owns a single task for its whole life:
//! Stop leaves the task parked, Start re-arms it, Update re-phases on
//! the next computation, Delete ends the task and closes the channel.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{Notify, mpsc};

#[derive(Debug)]
struct TickerState {
    running: bool,
    deleted: bool,
    interval: i64,
    offset: i64,
}

pub struct Ticker {
    state: Arc<Mutex<TickerState>>,
    poke: Arc<Notify>,
}

impl Ticker {
    /// Create a stopped ticker. Ticks are delivered on the returned
    /// channel with the wall-clock instant of each tick; the channel
    /// closes on delete.
    pub fn new(interval: i64, offset: i64) -> (Self, mpsc::Receiver<SystemTime>) {
        let state =
            Arc::new(Mutex::new(TickerState { running: false, deleted: false, interval, offset }));
        let poke = Arc::new(Notify::new());
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(run_loop(Arc::clone(&state), Arc::clone(&poke), tx));
        (Self { state, poke }, rx)
    }

    pub fn start(&self) {
        self.state.lock().expect("ticker state lock poisoned").running = true;
        self.poke.notify_one();
    }

    /// Pause delivery; the task stays alive and Start re-arms it.
    pub fn stop(&self) {
        self.state.lock().expect("ticker state lock poisoned").running = false;
        self.poke.notify_one();
    }

    /// Change the period; takes effect at the next fire computation.
    pub fn update(&self, interval: i64, offset: i64) {
        let mut state = self.state.lock().expect("ticker state lock poisoned");
        state.interval = interval;
        state.offset = offset;
        drop(state);
        self.poke.notify_one();
    }

    /// Terminal: ends the task and closes the tick channel. A tick
    /// already queued may still be delivered, or may be dropped with
    /// the channel.
    pub fn delete(&self) {
        let mut state = self.state.lock().expect("ticker state lock poisoned");
        state.running = false;
        state.deleted = true;
        drop(state);
        self.poke.notify_one();
    }
}

/// Seconds until the next aligned fire instant. Never zero: starting
/// exactly on phase waits a full interval.
pub(crate) fn next_wait(now: i64, interval: i64, offset: i64) -> i64 {
    let wait = ((interval + offset) - (now % interval)) % interval;
    if wait == 0 { interval } else { wait }
}

fn unix_now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

async fn run_loop(state: Arc<Mutex<TickerState>>, poke: Arc<Notify>, tx: mpsc::Sender<SystemTime>) {
    loop {
        let (running, deleted, interval, offset) = {
            let state = state.lock().expect("ticker state lock poisoned");
            (state.running, state.deleted, state.interval, state.offset)
        };
        if deleted {
            return;
        }
        if !running {
            poke.notified().await;
            continue;
        }
        let wait = next_wait(unix_now(), interval, offset);
        tokio::select! {
            // state changed, re-evaluate
            _ = poke.notified() => continue,
            _ = tokio::time::sleep(Duration::from_secs(wait as u64)) => {
                // a slow consumer holds the one-slot buffer; the next
                // tick waits behind it rather than piling up
                if tx.send(SystemTime::now()).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_wait_lands_on_phase() {
        for now in [0i64, 1, 7, 59, 60, 61, 119, 3601, 1_700_000_000] {
            for (interval, offset) in [(10, 0), (10, 3), (60, 0), (60, 59), (300, 120)] {
                let wait = next_wait(now, interval, offset);
                assert!(wait >= 1 && wait <= interval, "wait {wait} for now={now}");
                assert_eq!(
                    (now + wait) % interval,
                    offset,
                    "now={now} interval={interval} offset={offset}"
                );
            }
        }
    }

    #[test]
    fn next_wait_on_phase_waits_a_full_interval() {
        // now % 60 == 15 and offset == 15: already on phase
        assert_eq!(next_wait(15, 60, 15), 60);
        assert_eq!(next_wait(75, 60, 15), 60);
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_ticks_once_started() {
        let (ticker, mut rx) = Ticker::new(1, 0);

        // stopped tickers stay silent
        assert!(
            tokio::time::timeout(Duration::from_secs(3), rx.recv()).await.is_err(),
            "stopped ticker must not fire"
        );

        ticker.start();
        let tick = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("tick within interval");
        assert!(tick.is_some());
        ticker.delete();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_pauses_and_start_resumes() {
        let (ticker, mut rx) = Ticker::new(1, 0);
        ticker.start();
        tokio::time::timeout(Duration::from_secs(3), rx.recv()).await.unwrap();

        ticker.stop();
        // drain ticks already queued or blocked in the sender
        while tokio::time::timeout(Duration::from_millis(10), rx.recv()).await.is_ok() {}
        assert!(tokio::time::timeout(Duration::from_secs(3), rx.recv()).await.is_err());

        ticker.start();
        assert!(tokio::time::timeout(Duration::from_secs(3), rx.recv()).await.is_ok());
        ticker.delete();
    }

    #[tokio::test(start_paused = true)]
    async fn delete_closes_the_channel() {
        let (ticker, mut rx) = Ticker::new(1, 0);
        ticker.start();
        tokio::time::timeout(Duration::from_secs(3), rx.recv()).await.unwrap();

        ticker.delete();
        // at most one queued tick may still arrive before the close
        let end = async {
            while rx.recv().await.is_some() {}
        };
        tokio::time::timeout(Duration::from_secs(3), end).await.expect("channel closes");
    }

    #[tokio::test(start_paused = true)]
    async fn update_keeps_ticking() {
        let (ticker, mut rx) = Ticker::new(1, 0);
        ticker.start();
        tokio::time::timeout(Duration::from_secs(3), rx.recv()).await.unwrap();

        ticker.update(2, 1);
        assert!(tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.is_ok());
        ticker.delete();
    }
}
