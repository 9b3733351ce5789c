use parking_lot::{Condvar, Mutex};

/// One-shot level-triggered signal.
///
/// A signal starts unpulsed and latches once pulsed; `wait` returns
/// immediately on a pulsed signal. These are the only suspension points in
/// the acquisition protocol, so they are deliberately minimal: no payload,
/// no reset.
pub struct Signal {
    pulsed: Mutex<bool>,
    cv: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self {
            pulsed: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Latches the signal and wakes all waiters. Idempotent.
    pub fn pulse(&self) {
        let mut pulsed = self.pulsed.lock();
        if !*pulsed {
            *pulsed = true;
            self.cv.notify_all();
        }
    }

    pub fn is_pulsed(&self) -> bool {
        *self.pulsed.lock()
    }

    /// Blocks until the signal is pulsed.
    pub fn wait(&self) {
        let mut pulsed = self.pulsed.lock();
        while !*pulsed {
            self.cv.wait(&mut pulsed);
        }
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn pulse_is_sticky() {
        let sig = Signal::new();
        assert!(!sig.is_pulsed());
        sig.pulse();
        sig.pulse();
        assert!(sig.is_pulsed());
        sig.wait();
    }

    #[test]
    fn wait_wakes_on_pulse() {
        let sig = Arc::new(Signal::new());
        let waiter = {
            let sig = Arc::clone(&sig);
            thread::spawn(move || sig.wait())
        };
        thread::sleep(Duration::from_millis(20));
        sig.pulse();
        waiter.join().unwrap();
    }
}
