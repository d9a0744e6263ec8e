//! Timer engine: a dedicated thread turning deadlines into session events.

use super::events::{Event, EventQueue};

use parking_lot::{Condvar, Mutex};

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Timers are identified by purpose; re-arming an id replaces the old
/// timer, cancellation is idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerId {
    ConnectionBackoff,
    StreamError,
    PlaybackReportTick,
    MediaTick,
}

struct TimerEntry {
    id: TimerId,
    deadline: Instant,
    period: Option<Duration>,
    event: Event,
}

#[derive(Default)]
struct TimerState {
    timers: Vec<TimerEntry>,
    stop: bool,
}

/// Periodically wakes and enqueues the events of expired timers.
pub struct TimerEngine {
    shared: Arc<(Mutex<TimerState>, Condvar)>,
    thread: Option<thread::JoinHandle<()>>,
}

impl TimerEngine {
    pub fn new(queue: EventQueue) -> Self {
        let shared = Arc::new((Mutex::new(TimerState::default()), Condvar::new()));
        let thread_shared = shared.clone();

        let thread = thread::Builder::new()
            .name("rfbtv-timer".to_string())
            .spawn(move || run(thread_shared, queue))
            .expect("spawn timer thread");

        TimerEngine {
            shared,
            thread: Some(thread),
        }
    }

    /// Arm a one-shot or periodic timer; an existing timer with the same
    /// id is replaced.
    pub fn start_timer(&self, id: TimerId, delay: Duration, period: Option<Duration>, event: Event) {
        let (lock, condvar) = &*self.shared;
        let mut state = lock.lock();
        state.timers.retain(|t| t.id != id);
        state.timers.push(TimerEntry {
            id,
            deadline: Instant::now() + delay,
            period,
            event,
        });
        condvar.notify_one();
    }

    /// Idempotent; a timer that already fired stays harmless because
    /// handlers re-check state.
    pub fn cancel_timer(&self, id: TimerId) {
        let (lock, condvar) = &*self.shared;
        lock.lock().timers.retain(|t| t.id != id);
        condvar.notify_one();
    }
}

impl Drop for TimerEngine {
    fn drop(&mut self) {
        let (lock, condvar) = &*self.shared;
        lock.lock().stop = true;
        condvar.notify_one();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run(shared: Arc<(Mutex<TimerState>, Condvar)>, queue: EventQueue) {
    let (lock, condvar) = &*shared;
    let mut state = lock.lock();
    loop {
        if state.stop {
            return;
        }

        let now = Instant::now();
        let mut fired = Vec::new();
        state.timers.retain_mut(|timer| {
            if timer.deadline > now {
                return true;
            }
            fired.push(timer.event.clone());
            match timer.period {
                Some(period) => {
                    timer.deadline = now + period;
                    true
                }
                None => false,
            }
        });

        if !fired.is_empty() {
            // Enqueue outside any deadline math but under the lock: the
            // order of expiry is preserved
            for event in fired {
                queue.put(event);
            }
            continue;
        }

        match state.timers.iter().map(|t| t.deadline).min() {
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(now);
                let _ = condvar.wait_for(&mut state, timeout);
            }
            None => condvar.wait(&mut state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_shot_fires_once() {
        let (queue, receiver) = EventQueue::new();
        let engine = TimerEngine::new(queue);
        engine.start_timer(
            TimerId::ConnectionBackoff,
            Duration::from_millis(10),
            None,
            Event::Connect,
        );

        assert!(matches!(
            receiver.recv_timeout(Duration::from_secs(2)).unwrap(),
            Event::Connect
        ));
        assert!(receiver.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn periodic_fires_repeatedly() {
        let (queue, receiver) = EventQueue::new();
        let engine = TimerEngine::new(queue);
        engine.start_timer(
            TimerId::MediaTick,
            Duration::from_millis(5),
            Some(Duration::from_millis(5)),
            Event::MediaTick,
        );

        for _ in 0..3 {
            assert!(matches!(
                receiver.recv_timeout(Duration::from_secs(2)).unwrap(),
                Event::MediaTick
            ));
        }
        engine.cancel_timer(TimerId::MediaTick);
    }

    #[test]
    fn cancel_is_idempotent() {
        let (queue, _receiver) = EventQueue::new();
        let engine = TimerEngine::new(queue);
        engine.cancel_timer(TimerId::StreamError);
        engine.start_timer(
            TimerId::StreamError,
            Duration::from_secs(60),
            None,
            Event::StreamTimeoutExpired,
        );
        engine.cancel_timer(TimerId::StreamError);
        engine.cancel_timer(TimerId::StreamError);
    }
}
