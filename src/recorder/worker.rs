//! Named worker threads with bounded joins

use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;

/// A spawned worker whose result can be awaited with a deadline
pub struct Worker<T> {
    name: String,
    handle: JoinHandle<()>,
    done: Receiver<T>,
}

/// Outcome of a bounded join
pub enum Joined<T> {
    Finished(T),
    /// Still running at the deadline; the worker is handed back
    TimedOut(Worker<T>),
    /// Worker panicked before producing a result
    Panicked,
}

impl<T: Send + 'static> Worker<T> {
    pub fn spawn<F>(name: &str, body: F) -> std::io::Result<Self>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, done) = crossbeam_channel::bounded(1);
        let handle = std::thread::Builder::new().name(name.to_string()).spawn(move || {
            let _ = tx.send(body());
        })?;

        Ok(Self {
            name: name.to_string(),
            handle,
            done,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait up to `timeout` for the result
    pub fn join_timeout(self, timeout: Duration) -> Joined<T> {
        match self.done.recv_timeout(timeout) {
            Ok(value) => {
                let _ = self.handle.join();
                Joined::Finished(value)
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!("Worker {} did not finish within {:?}", self.name, timeout);
                Joined::TimedOut(self)
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = self.handle.join();
                tracing::error!("Worker {} panicked", self.name);
                Joined::Panicked
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_returns_value() {
        let worker = Worker::spawn("adder", || 2 + 2).unwrap();
        assert_eq!(worker.name(), "adder");
        assert!(matches!(worker.join_timeout(Duration::from_secs(1)), Joined::Finished(4)));
    }

    #[test]
    fn test_join_times_out() {
        let worker =
            Worker::spawn("sleeper", || std::thread::sleep(Duration::from_millis(500))).unwrap();
        assert!(matches!(worker.join_timeout(Duration::from_millis(20)), Joined::TimedOut(_)));
    }

    #[test]
    fn test_join_reports_panic() {
        let worker: Worker<()> = Worker::spawn("boom", || panic!("boom")).unwrap();
        assert!(matches!(worker.join_timeout(Duration::from_secs(1)), Joined::Panicked));
    }
}
