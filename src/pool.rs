//! A bounded pool of worker threads. Jobs are submitted without blocking; `wait` is the only
//! place the submitter blocks.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use log::{debug, error, warn};

use crate::error::InstallError;

/// The default number of jobs that may run at once.
pub const DEFAULT_POOL_SIZE: usize = 20;

/// How often `wait` checks the running jobs against the timeout.
const TIMEOUT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One unit of work.
pub type Job = Box<dyn FnOnce() -> Result<(), failure::Error> + Send + 'static>;

struct Task {
    seq: usize,
    jid: String,
    job: Job,
}

struct Completion {
    jid: String,
    result: Result<(), failure::Error>,
}

/// Jobs currently running, by sequence number: `(jid, start time)`.
type Running = Arc<Mutex<HashMap<usize, (String, Instant)>>>;

pub struct Pool {
    job_timeout: Option<Duration>,

    /// `None` once the pool has given up on its workers.
    tasks: Option<Sender<Task>>,

    /// Our end of the task queue, so that queued tasks can be thrown away.
    queued: Receiver<Task>,

    completions: Receiver<Completion>,
    running: Running,

    next_seq: usize,
    outstanding: usize,

    workers: Vec<JoinHandle<()>>,
}

impl Pool {
    /// Start `size` workers. If `job_timeout` is given, `wait` fails as soon as any job has been
    /// running for longer than that.
    pub fn new(size: usize, job_timeout: Option<Duration>) -> Self {
        assert!(size > 0, "a pool needs at least one worker");

        let (task_send, task_recv) = unbounded();
        let (done_send, done_recv) = unbounded();
        let running: Running = Arc::new(Mutex::new(HashMap::new()));

        let workers = (0..size)
            .map(|_| {
                let tasks = task_recv.clone();
                let done = done_send.clone();
                let running = Arc::clone(&running);
                std::thread::spawn(move || worker(tasks, done, running))
            })
            .collect();

        Pool {
            job_timeout,
            tasks: Some(task_send),
            queued: task_recv,
            completions: done_recv,
            running,
            next_seq: 0,
            outstanding: 0,
            workers,
        }
    }

    /// The number of jobs submitted but not yet collected by `wait`.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Queue `job`. `jid` only shows up in logs and errors.
    pub fn submit(&mut self, jid: &str, job: Job) {
        let tasks = self
            .tasks
            .as_ref()
            .expect("submit to a pool that gave up on its workers");

        let task = Task {
            seq: self.next_seq,
            jid: jid.to_owned(),
            job,
        };

        // We hold a receiver ourselves, so the channel cannot be disconnected.
        tasks.send(task).unwrap();

        self.next_seq += 1;
        self.outstanding += 1;
    }

    /// Block until all `numtasks` outstanding jobs have completed. `numtasks` must be exactly the
    /// number of outstanding jobs.
    ///
    /// Every job is waited for even after one fails. The error of the first job to fail is then
    /// returned as is; all failures are logged.
    pub fn wait(&mut self, numtasks: usize) -> Result<(), failure::Error> {
        assert_eq!(
            numtasks, self.outstanding,
            "waiting for {} jobs, but {} are outstanding",
            numtasks, self.outstanding
        );

        let mut first_err = None;

        while self.outstanding > 0 {
            let completion = self.next_completion()?;
            self.outstanding -= 1;

            match completion.result {
                Ok(()) => debug!("Job {} done", completion.jid),
                Err(err) => {
                    error!("Job {} failed: {}", completion.jid, err);
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn next_completion(&mut self) -> Result<Completion, failure::Error> {
        let outstanding = self.outstanding;

        let timeout = match self.job_timeout {
            Some(timeout) => timeout,
            None => {
                return self
                    .completions
                    .recv()
                    .map_err(|_| InstallError::PoolClosed { outstanding }.into())
            }
        };

        loop {
            match self.completions.recv_timeout(TIMEOUT_POLL_INTERVAL) {
                Ok(completion) => return Ok(completion),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(InstallError::PoolClosed { outstanding }.into())
                }
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(job) = self.overdue(timeout) {
                        self.give_up();
                        return Err(InstallError::JobTimedOut {
                            job,
                            secs: timeout.as_secs(),
                        }
                        .into());
                    }
                }
            }
        }
    }

    /// A job that has been running for longer than `timeout`, if any.
    fn overdue(&self, timeout: Duration) -> Option<String> {
        self.running
            .lock()
            .unwrap()
            .values()
            .find(|(_, started)| started.elapsed() > timeout)
            .map(|(jid, _)| jid.clone())
    }

    /// Throw away queued jobs and stop feeding the workers. Running remote commands cannot be
    /// interrupted, so the workers running them are left behind.
    fn give_up(&mut self) {
        self.tasks = None;

        let mut dropped = 0;
        while self.queued.try_recv().is_ok() {
            dropped += 1;
        }

        warn!(
            "Giving up on {} running jobs ({} queued jobs dropped)",
            self.outstanding - dropped,
            dropped
        );

        self.outstanding = 0;
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        let gave_up = self.tasks.is_none();
        self.tasks = None;

        while self.queued.try_recv().is_ok() {}

        if gave_up || self.outstanding > 0 {
            warn!("Detaching {} pool workers", self.workers.len());
            return;
        }

        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker(tasks: Receiver<Task>, done: Sender<Completion>, running: Running) {
    while let Ok(Task { seq, jid, job }) = tasks.recv() {
        running
            .lock()
            .unwrap()
            .insert(seq, (jid.clone(), Instant::now()));

        let result = match panic::catch_unwind(AssertUnwindSafe(job)) {
            Ok(result) => result,
            Err(payload) => Err(InstallError::JobPanicked {
                job: jid.clone(),
                msg: panic_message(&*payload),
            }
            .into()),
        };

        running.lock().unwrap().remove(&seq);

        if done.send(Completion { jid, result }).is_err() {
            break;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".into()
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use super::*;

    #[test]
    fn wait_for_nothing() {
        let mut pool = Pool::new(4, None);
        let start = Instant::now();
        pool.wait(0).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    #[should_panic(expected = "outstanding")]
    fn wait_count_mismatch() {
        let mut pool = Pool::new(2, None);
        pool.submit("master", Box::new(|| Ok(())));
        pool.submit("node001", Box::new(|| Ok(())));
        let _ = pool.wait(1);
    }

    #[test]
    fn concurrency_is_bounded() {
        const SIZE: usize = 3;

        let mut pool = Pool::new(SIZE, None);
        let current = Arc::new(AtomicUsize::new(0));
        let max = Arc::new(AtomicUsize::new(0));

        for i in 0..12 {
            let current = Arc::clone(&current);
            let max = Arc::clone(&max);
            pool.submit(
                &format!("node{:03}", i),
                Box::new(move || {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    max.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }),
            );
        }

        pool.wait(12).unwrap();
        assert_eq!(current.load(Ordering::SeqCst), 0);
        assert!(max.load(Ordering::SeqCst) <= SIZE);
    }

    #[test]
    fn drain_then_fail() {
        let mut pool = Pool::new(2, None);
        let finished = Arc::new(AtomicUsize::new(0));

        pool.submit(
            "node002",
            Box::new(|| Err(failure::format_err!("node002: apt-get exited with status 100"))),
        );
        pool.submit(
            "node003",
            Box::new(|| {
                std::thread::sleep(Duration::from_millis(100));
                Err(failure::format_err!("node003: late failure"))
            }),
        );
        for i in 0..4 {
            let finished = Arc::clone(&finished);
            pool.submit(
                &format!("worker{}", i),
                Box::new(move || {
                    std::thread::sleep(Duration::from_millis(30));
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            );
        }

        let err = pool.wait(6).unwrap_err();
        assert_eq!(err.to_string(), "node002: apt-get exited with status 100");
        assert_eq!(finished.load(Ordering::SeqCst), 4);
        assert_eq!(pool.outstanding(), 0);

        // The pool is still usable after a failed phase.
        pool.submit("master", Box::new(|| Ok(())));
        pool.wait(1).unwrap();
    }

    #[test]
    fn panics_are_failures() {
        let mut pool = Pool::new(2, None);
        pool.submit("master", Box::new(|| panic!("boom")));
        pool.submit("node001", Box::new(|| Ok(())));

        let err = pool.wait(2).unwrap_err();
        match err.downcast_ref::<InstallError>() {
            Some(InstallError::JobPanicked { job, msg }) => {
                assert_eq!(job, "master");
                assert_eq!(msg, "boom");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn job_timeout() {
        let mut pool = Pool::new(2, Some(Duration::from_millis(200)));

        pool.submit(
            "node001",
            Box::new(|| {
                std::thread::sleep(Duration::from_secs(3));
                Ok(())
            }),
        );
        pool.submit("master", Box::new(|| Ok(())));

        let start = Instant::now();
        let err = pool.wait(2).unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(3));

        match err.downcast_ref::<InstallError>() {
            Some(InstallError::JobTimedOut { job, .. }) => assert_eq!(job, "node001"),
            other => panic!("unexpected error {:?}", other),
        }
    }
}
