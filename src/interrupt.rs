//! Cooperative thread interruption
//!
//! Every blocking pool operation honors a per-thread interrupt flag. Another
//! thread raises it through an [`InterruptHandle`], which also unparks the
//! target so a parked waiter observes the flag immediately. The flag is
//! consumed (test-and-clear) exactly when a blocking call fails with
//! [`PoolError::Interrupted`](crate::PoolError::Interrupted); operations that
//! must complete regardless, such as returning an object, never consult it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};

thread_local! {
    static INTERRUPT_FLAG: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
}

/// A handle through which one thread interrupts another.
///
/// Obtained on the target thread via [`current`] and handed to whoever needs
/// to deliver the interrupt.
///
/// # Examples
///
/// ```
/// use std::sync::mpsc;
/// use std::thread;
///
/// let (tx, rx) = mpsc::channel();
/// let worker = thread::spawn(move || {
///     tx.send(sealpool::interrupt::current()).unwrap();
///     while !sealpool::interrupt::take_interrupted() {
///         thread::park();
///     }
/// });
/// rx.recv().unwrap().interrupt();
/// worker.join().unwrap();
/// ```
#[derive(Clone, Debug)]
pub struct InterruptHandle {
    thread: Thread,
    flag: Arc<AtomicBool>,
}

impl InterruptHandle {
    /// Raise the target thread's interrupt flag and unpark it.
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::Release);
        self.thread.unpark();
    }

    /// Read the flag without clearing it.
    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// The calling thread's interrupt handle.
pub fn current() -> InterruptHandle {
    InterruptHandle {
        thread: thread::current(),
        flag: INTERRUPT_FLAG.with(Arc::clone),
    }
}

/// Test and clear the calling thread's interrupt flag.
pub fn take_interrupted() -> bool {
    INTERRUPT_FLAG.with(|flag| flag.swap(false, Ordering::AcqRel))
}

/// Read the calling thread's interrupt flag without clearing it.
pub fn is_interrupted() -> bool {
    INTERRUPT_FLAG.with(|flag| flag.load(Ordering::Acquire))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn take_clears_flag() {
        current().interrupt();
        assert!(is_interrupted());
        assert!(take_interrupted());
        assert!(!is_interrupted());
        assert!(!take_interrupted());
    }

    #[test]
    fn interrupt_crosses_threads() {
        let (tx, rx) = mpsc::channel();
        let worker = thread::spawn(move || {
            tx.send(current()).unwrap();
            while !take_interrupted() {
                thread::park();
            }
        });
        let handle = rx.recv().unwrap();
        handle.interrupt();
        worker.join().unwrap();
        assert!(!handle.is_interrupted());
    }

    #[test]
    fn handle_observes_flag() {
        let handle = current();
        assert!(!handle.is_interrupted());
        handle.interrupt();
        assert!(handle.is_interrupted());
        assert!(take_interrupted());
    }
}
