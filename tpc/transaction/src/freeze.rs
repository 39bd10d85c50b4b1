//! Reader/writer gate used to freeze transaction completion.
//!
//! Completions hold the read side. An administrative freeze takes the write
//! side: it waits for in-flight completions to drain and blocks new ones.
//! Writers are admitted in ticket order, readers queue behind any pending
//! writer and are all woken together when the writer leaves.

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct GateState {
    readers: usize,
    writer_active: bool,
    /// Ticket handed to the next writer that arrives.
    next_ticket: u64,
    /// Ticket of the writer allowed in next.
    serving: u64,
}

impl GateState {
    fn writers_waiting_or_active(&self) -> bool {
        self.next_ticket != self.serving
    }
}

#[derive(Default)]
pub struct FreezeGate {
    state: Mutex<GateState>,
    readers_cv: Condvar,
    writers_cv: Condvar,
}

/// Read side of the gate, released on drop.
pub struct ReadGuard<'a> {
    gate: &'a FreezeGate,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock();
        state.readers -= 1;
        if state.readers == 0 {
            self.gate.writers_cv.notify_all();
        }
    }
}

impl FreezeGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> ReadGuard<'_> {
        let mut state = self.state.lock();
        while state.writer_active || state.writers_waiting_or_active() {
            self.readers_cv.wait(&mut state);
        }
        state.readers += 1;
        ReadGuard { gate: self }
    }

    /// Blocks until every reader left and all earlier writers released.
    /// Must be paired with [`FreezeGate::release_write`].
    pub fn acquire_write(&self) {
        let mut state = self.state.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        while state.serving != ticket || state.writer_active || state.readers > 0 {
            self.writers_cv.wait(&mut state);
        }
        state.writer_active = true;
    }

    pub fn release_write(&self) {
        let mut state = self.state.lock();
        if !state.writer_active {
            return;
        }
        state.writer_active = false;
        state.serving += 1;
        self.writers_cv.notify_all();
        self.readers_cv.notify_all();
    }

    pub fn is_write_locked(&self) -> bool {
        self.state.lock().writer_active
    }

    pub fn readers(&self) -> usize {
        self.state.lock().readers
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_readers_share_the_gate() {
        let gate = FreezeGate::new();
        let a = gate.read();
        let b = gate.read();
        assert_eq!(gate.readers(), 2);
        drop(a);
        drop(b);
        assert_eq!(gate.readers(), 0);
    }

    #[test]
    fn test_writer_waits_for_readers() {
        let gate = Arc::new(FreezeGate::new());
        let reader = gate.read();
        let acquired = Arc::new(AtomicBool::new(false));

        let writer = {
            let gate = gate.clone();
            let acquired = acquired.clone();
            thread::spawn(move || {
                gate.acquire_write();
                acquired.store(true, Ordering::SeqCst);
                gate.release_write();
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));
        drop(reader);
        writer.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_reader_blocks_while_write_locked() {
        let gate = Arc::new(FreezeGate::new());
        gate.acquire_write();
        let entered = Arc::new(AtomicBool::new(false));

        let reader = {
            let gate = gate.clone();
            let entered = entered.clone();
            thread::spawn(move || {
                let _guard = gate.read();
                entered.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));
        gate.release_write();
        reader.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }
}
