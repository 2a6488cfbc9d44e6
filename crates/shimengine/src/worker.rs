//! Worker delegator (spec.md §4.4, §9 "Worker delegation as message passing").
//!
//! A single dedicated thread with an oversized stack, fed through a one-slot mailbox: one
//! lock, two condition variables (request-ready, response-ready). The caller fills the
//! request, signals, and blocks on the response. The handler the worker runs is invoked with
//! `from_worker = true` so a prepare call that lands back here never tries to delegate again.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use shimcore::config::WORKER_STACK_SIZE_MB;
use shimcore::types::HostHandle;

pub struct PrepareJob {
    pub connection_path: String,
    pub sql: String,
    pub host_statement: HostHandle,
    pub from_worker: bool,
}

enum Request {
    Prepare(PrepareJob),
    Shutdown,
}

struct MailboxState<T> {
    request: Option<Request>,
    response: Option<Option<T>>,
}

struct Mailbox<T> {
    state: Mutex<MailboxState<T>>,
    request_ready: Condvar,
    response_ready: Condvar,
}

impl<T> Mailbox<T> {
    fn new() -> Self {
        Mailbox {
            state: Mutex::new(MailboxState { request: None, response: None }),
            request_ready: Condvar::new(),
            response_ready: Condvar::new(),
        }
    }
}

/// A single dedicated worker thread plus the mailbox used to hand it prepare jobs.
pub struct Worker<T> {
    mailbox: Arc<Mailbox<T>>,
    handle: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> Worker<T> {
    pub fn spawn<F>(handler: F) -> std::io::Result<Self>
    where
        F: Fn(PrepareJob) -> T + Send + 'static,
    {
        let mailbox = Arc::new(Mailbox::new());
        let worker_mailbox = mailbox.clone();
        let handle = std::thread::Builder::new()
            .name("shim-prepare-worker".to_string())
            .stack_size(WORKER_STACK_SIZE_MB * 1024 * 1024)
            .spawn(move || worker_loop(worker_mailbox, handler))?;
        Ok(Worker { mailbox, handle: Some(handle) })
    }

    /// Hand `job` to the worker and block until it replies. Returns `None` only if the worker
    /// has already shut down.
    pub fn delegate(&self, mut job: PrepareJob) -> Option<T> {
        job.from_worker = true;
        let mut state = self.mailbox.state.lock().unwrap();
        state.request = Some(Request::Prepare(job));
        state.response = None;
        self.mailbox.request_ready.notify_one();
        while state.response.is_none() {
            state = self.mailbox.response_ready.wait(state).unwrap();
        }
        state.response.take().flatten()
    }

    pub fn shutdown(mut self) {
        {
            let mut state = self.mailbox.state.lock().unwrap();
            state.request = Some(Request::Shutdown);
            self.mailbox.request_ready.notify_one();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop<T, F>(mailbox: Arc<Mailbox<T>>, handler: F)
where
    F: Fn(PrepareJob) -> T,
{
    loop {
        let request = {
            let mut state = mailbox.state.lock().unwrap();
            while state.request.is_none() {
                state = mailbox.request_ready.wait(state).unwrap();
            }
            state.request.take().unwrap()
        };

        match request {
            Request::Shutdown => {
                tracing::debug!("prepare worker received shutdown request");
                return;
            }
            Request::Prepare(job) => {
                let result = handler(job);
                let mut state = mailbox.state.lock().unwrap();
                state.response = Some(Some(result));
                mailbox.response_ready.notify_one();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn delegated_job_runs_with_from_worker_set() {
        let seen_from_worker = Arc::new(AtomicBool::new(false));
        let flag = seen_from_worker.clone();
        let worker = Worker::spawn(move |job: PrepareJob| {
            flag.store(job.from_worker, Ordering::SeqCst);
            job.sql.len()
        })
        .unwrap();

        let result = worker.delegate(PrepareJob {
            connection_path: "/db".to_string(),
            sql: "SELECT 1".to_string(),
            host_statement: HostHandle(1),
            from_worker: false,
        });

        assert_eq!(result, Some(8));
        assert!(seen_from_worker.load(Ordering::SeqCst));
        worker.shutdown();
    }

    #[test]
    fn multiple_sequential_jobs_each_get_their_own_response() {
        let worker = Worker::spawn(|job: PrepareJob| job.sql.to_uppercase()).unwrap();
        let r1 =
            worker.delegate(PrepareJob { connection_path: "/a".into(), sql: "select 1".into(), host_statement: HostHandle(1), from_worker: false });
        let r2 =
            worker.delegate(PrepareJob { connection_path: "/a".into(), sql: "select 2".into(), host_statement: HostHandle(2), from_worker: false });
        assert_eq!(r1, Some("SELECT 1".to_string()));
        assert_eq!(r2, Some("SELECT 2".to_string()));
        worker.shutdown();
    }
}
