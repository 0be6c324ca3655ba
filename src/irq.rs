//! Interrupt delivery and the completion flag.
//!
//! The controller raises its interrupt line by sending an [Irq] on a channel. A single
//! dedicated thread owns the receiving end and runs [Nand::irq] for every event, which makes it
//! the subsystem's interrupt context.

use crate::nand::{Hardware, Nand};

use crossbeam_channel::Receiver;
use std::io;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

/// One edge on the controller interrupt line
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Irq;

/// The flag the interrupt handler sets when an operation has been completed.
///
/// Holding the mutex is the equivalent of running with interrupts disabled: the handler can't
/// set the flag in between the waiter's check and its going to sleep.
#[derive(Debug, Default)]
pub struct Completion {
    done: Mutex<bool>,
    wakeup: Condvar,
}

impl Completion {
    pub fn clear(&self) {
        *self.done.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }

    pub fn signal(&self) {
        let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        *done = true;
        self.wakeup.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.done.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep until the flag is set
    pub fn wait(&self) {
        let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        while !*done {
            done = self
                .wakeup
                .wait(done)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Start the interrupt thread for `nand`.
///
/// The thread exits once every sender of `line` has been dropped.
pub fn spawn<H>(nand: Arc<Nand<H>>, line: Receiver<Irq>) -> io::Result<JoinHandle<()>>
where
    H: Hardware + 'static,
{
    thread::Builder::new()
        .name("nand-irq".to_owned())
        .spawn(move || {
            for Irq in line.iter() {
                nand.irq();
            }
            log::debug!("NAND interrupt line closed");
        })
}

#[cfg(test)]
mod test {
    use super::*;

    use std::time::Duration;

    #[test]
    fn test_completion_wakes_waiter() {
        let completion = Arc::new(Completion::default());
        completion.clear();
        assert!(!completion.is_set());

        let signaller = completion.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            signaller.signal();
        });

        completion.wait();
        assert!(completion.is_set());
        handle.join().unwrap();
    }

    #[test]
    fn test_completion_already_set() {
        let completion = Completion::default();
        completion.signal();
        // Must not block
        completion.wait();
        assert!(completion.is_set());
    }
}
