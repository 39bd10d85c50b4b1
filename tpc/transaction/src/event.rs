use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// One-shot event. A post that happens before a wait is still observed.
#[derive(Default)]
pub struct EventSemaphore {
    posted: Mutex<bool>,
    condvar: Condvar,
}

impl EventSemaphore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self) {
        let mut posted = self.posted.lock();
        *posted = true;
        self.condvar.notify_all();
    }

    pub fn is_posted(&self) -> bool {
        *self.posted.lock()
    }

    pub fn wait(&self) {
        let mut posted = self.posted.lock();
        while !*posted {
            self.condvar.wait(&mut posted);
        }
    }

    /// Returns `false` if `timeout` elapsed before the event was posted.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut posted = self.posted.lock();
        if !*posted {
            self.condvar
                .wait_while_for(&mut posted, |posted| !*posted, timeout);
        }
        *posted
    }

    pub fn reset(&self) {
        *self.posted.lock() = false;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_post_before_wait_is_seen() {
        let event = EventSemaphore::new();
        event.post();
        event.wait();
        assert!(event.is_posted());
    }

    #[test]
    fn test_wait_blocks_until_post() {
        let event = Arc::new(EventSemaphore::new());
        let poster = {
            let event = event.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                event.post();
            })
        };
        event.wait();
        poster.join().unwrap();
        assert!(event.is_posted());
    }

    #[test]
    fn test_wait_timeout_and_reset() {
        let event = EventSemaphore::new();
        assert!(!event.wait_timeout(Duration::from_millis(10)));
        event.post();
        assert!(event.wait_timeout(Duration::from_millis(10)));
        event.reset();
        assert!(!event.is_posted());
    }
}
