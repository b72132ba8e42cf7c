//! A single-threaded executor that runs submitted jobs and an optional periodic task.

use crate::{
    listener::{BackgroundErrorListener, Registry},
    Error,
};
use futures::{channel::oneshot, executor::block_on};
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        mpsc::{self, RecvTimeoutError},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send>;

/// A task run at a fixed delay.
pub(crate) type Tick = Box<dyn FnMut() -> Result<(), Error> + Send>;

enum Message {
    Job(Job),
    Shutdown,
}

/// Runs jobs one at a time, in submission order, on a dedicated thread.
///
/// If a periodic task is provided, it runs `interval` after the previous run completed (or after
/// start). Errors and panics of the periodic task are logged and reported to the error listeners,
/// and the task keeps running on later ticks.
pub(crate) struct Executor {
    name: String,
    sender: Mutex<Option<mpsc::Sender<Message>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Executor {
    pub(crate) fn new(
        name: String,
        periodic: Option<(Duration, Tick)>,
        errors: Arc<Registry<dyn BackgroundErrorListener>>,
    ) -> Result<Self, Error> {
        let (sender, receiver) = mpsc::channel();
        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || work(thread_name, receiver, periodic, errors))?;
        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queue `job` and return a receiver for its result.
    ///
    /// A job that panics resolves to [Error::TaskPanicked].
    pub(crate) fn submit<T, F>(&self, job: F) -> Result<oneshot::Receiver<Result<T, Error>>, Error>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, Error> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            let result = catch_unwind(AssertUnwindSafe(job)).unwrap_or(Err(Error::TaskPanicked));
            let _ = tx.send(result);
        });
        let sender = self.sender.lock().unwrap();
        sender
            .as_ref()
            .ok_or(Error::Closed)?
            .send(Message::Job(job))
            .map_err(|_| Error::Closed)?;
        Ok(rx)
    }

    /// Submit `job` and block until it completes.
    pub(crate) fn run<T, F>(&self, job: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, Error> + Send + 'static,
    {
        wait(self.submit(job)?)
    }

    /// Run every job already queued, then stop the thread.
    ///
    /// Safe to call more than once and from the executor thread itself (in which case the thread
    /// exits after the current job without being joined).
    pub(crate) fn shutdown(&self) {
        if let Some(sender) = self.sender.lock().unwrap().take() {
            let _ = sender.send(Message::Shutdown);
        }
        let Some(handle) = self.handle.lock().unwrap().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            error!(name = %self.name, "executor thread panicked");
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Block until a job submitted to an [Executor] completes.
pub(crate) fn wait<T>(receiver: oneshot::Receiver<Result<T, Error>>) -> Result<T, Error> {
    block_on(receiver).map_err(|_| Error::Closed)?
}

fn work(
    name: String,
    receiver: mpsc::Receiver<Message>,
    mut periodic: Option<(Duration, Tick)>,
    errors: Arc<Registry<dyn BackgroundErrorListener>>,
) {
    let mut deadline = periodic
        .as_ref()
        .map(|(interval, _)| Instant::now() + *interval);
    loop {
        let message = match (deadline, periodic.as_mut()) {
            (Some(at), Some((interval, tick))) => {
                let now = Instant::now();
                if now >= at {
                    match catch_unwind(AssertUnwindSafe(|| tick())) {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            error!(%name, ?err, "periodic task failed");
                            errors.notify(&err);
                        }
                        Err(_) => {
                            error!(%name, "periodic task panicked");
                            errors.notify(&Error::TaskPanicked);
                        }
                    }
                    deadline = Some(Instant::now() + *interval);
                    continue;
                }
                match receiver.recv_timeout(at - now) {
                    Ok(message) => message,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            _ => match receiver.recv() {
                Ok(message) => message,
                Err(_) => break,
            },
        };
        match message {
            Message::Job(job) => job(),
            Message::Shutdown => break,
        }
    }
    debug!(%name, "executor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn errors() -> Arc<Registry<dyn BackgroundErrorListener>> {
        Arc::new(Registry::new())
    }

    #[test_traced]
    fn test_jobs_run_in_order() {
        let executor = Executor::new("test-order".into(), None, errors()).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let receivers: Vec<_> = (0..10)
            .map(|i| {
                let log = log.clone();
                executor
                    .submit(move || {
                        log.lock().unwrap().push(i);
                        Ok(i * 2)
                    })
                    .unwrap()
            })
            .collect();
        let results: Vec<_> = receivers.into_iter().map(|rx| wait(rx).unwrap()).collect();
        assert_eq!(results, (0..10).map(|i| i * 2).collect::<Vec<_>>());
        assert_eq!(*log.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test_traced]
    fn test_job_error_and_panic() {
        let executor = Executor::new("test-errors".into(), None, errors()).unwrap();
        assert!(matches!(
            executor.run(|| -> Result<(), Error> { Err(Error::WriteFailed) }),
            Err(Error::WriteFailed)
        ));
        assert!(matches!(
            executor.run(|| -> Result<(), Error> { panic!("boom") }),
            Err(Error::TaskPanicked)
        ));

        // The executor survives a panicking job.
        assert_eq!(executor.run(|| Ok(7)).unwrap(), 7);
    }

    #[test_traced]
    fn test_submit_after_shutdown() {
        let executor = Executor::new("test-shutdown".into(), None, errors()).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let rx = executor
            .submit({
                let ran = ran.clone();
                move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();
        executor.shutdown();

        // Queued work completes before the thread stops.
        wait(rx).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(matches!(executor.submit(|| Ok(())), Err(Error::Closed)));
        executor.shutdown();
    }

    #[test_traced]
    fn test_periodic_task() {
        let registry = errors();
        let reported = Arc::new(AtomicUsize::new(0));
        registry.register(Arc::new({
            let reported = reported.clone();
            move |_: &Error| {
                reported.fetch_add(1, Ordering::SeqCst);
            }
        }));

        let ticks = Arc::new(AtomicUsize::new(0));
        let tick: Tick = Box::new({
            let ticks = ticks.clone();
            move || {
                let n = ticks.fetch_add(1, Ordering::SeqCst);
                match n {
                    0 => Err(Error::WriteFailed),
                    1 => panic!("tick panicked"),
                    _ => Ok(()),
                }
            }
        });
        let executor = Executor::new(
            "test-periodic".into(),
            Some((Duration::from_millis(5), tick)),
            registry,
        )
        .unwrap();

        let start = Instant::now();
        while ticks.load(Ordering::SeqCst) < 5 {
            assert!(start.elapsed() < Duration::from_secs(10), "ticks stalled");
            thread::sleep(Duration::from_millis(1));
        }
        executor.shutdown();
        assert_eq!(reported.load(Ordering::SeqCst), 2);
    }
}
