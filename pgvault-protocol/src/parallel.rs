//! Parallel job executor.
//!
//! Drives N protocol clients from a single thread. Jobs are pulled from a
//! callback as workers go idle, so queue ordering stays with the caller;
//! results complete in arbitrary order and are matched by job key. At most
//! one job is in flight per worker.

use std::collections::VecDeque;
use std::os::unix::io::AsRawFd;
use std::thread::sleep;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags};

use pgvault_api_types::{Error, Result};

use crate::client::ProtocolClient;
use crate::frame::{Command, CommandType};
use crate::pack::Value;

/// One unit of work: an opaque key the caller uses to match the result, and
/// the command to run on a worker.
#[derive(Debug, Clone)]
pub struct ParallelJob {
    pub key: Value,
    pub command: Command,
}

impl ParallelJob {
    pub fn new(key: Value, command: Command) -> Self {
        Self { key, command }
    }
}

pub struct CompletedJob {
    pub key: Value,
    pub worker: usize,
    pub result: Result<Value>,
}

enum SlotState {
    Idle,
    Busy { job: ParallelJob, attempt: usize },
    Dead,
}

struct WorkerSlot {
    client: ProtocolClient,
    state: SlotState,
}

type JobSource<'a> = Box<dyn FnMut(usize) -> Result<Option<ParallelJob>> + 'a>;

pub struct ParallelExecutor<'a> {
    workers: Vec<WorkerSlot>,
    job_source: JobSource<'a>,
    timeout: Duration,
    retry_interval: Vec<Duration>,
    source_done: bool,
    retry_queue: VecDeque<(ParallelJob, usize)>,
}

impl<'a> ParallelExecutor<'a> {
    pub fn new(
        clients: Vec<ProtocolClient>,
        timeout: Duration,
        retry_interval: Vec<Duration>,
        job_source: impl FnMut(usize) -> Result<Option<ParallelJob>> + 'a,
    ) -> Self {
        Self {
            workers: clients
                .into_iter()
                .map(|client| WorkerSlot {
                    client,
                    state: SlotState::Idle,
                })
                .collect(),
            job_source: Box::new(job_source),
            timeout,
            retry_interval,
            source_done: false,
            retry_queue: VecDeque::new(),
        }
    }

    /// Run until the job source is exhausted and every result is in, calling
    /// `on_result` for each completed job. An error from the callback stops
    /// the run; in-flight work is cancelled and drained first.
    pub fn run(mut self, mut on_result: impl FnMut(CompletedJob) -> Result<()>) -> Result<usize> {
        let mut completed = 0;

        loop {
            if let Err(err) = self.assign_jobs(&mut on_result, &mut completed) {
                self.shutdown();
                return Err(err);
            }

            let busy: Vec<usize> = self
                .workers
                .iter()
                .enumerate()
                .filter(|(_, worker)| matches!(worker.state, SlotState::Busy { .. }))
                .map(|(idx, _)| idx)
                .collect();

            if busy.is_empty() {
                if self.jobs_remain() && self.workers.iter().all(|w| !matches!(w.state, SlotState::Idle)) {
                    self.shutdown();
                    return Err(Error::protocol("all workers have failed"));
                }

                if !self.jobs_remain() {
                    break;
                }

                continue;
            }

            // Half the protocol timeout, so a worker going silent is
            // noticed within one timeout window.
            let ready = match self.poll_busy(&busy) {
                Ok(ready) => ready,
                Err(err) => {
                    self.shutdown();
                    return Err(err);
                }
            };

            if ready.is_empty() {
                self.keep_alive();
                continue;
            }

            for idx in ready {
                if let Some(done) = self.collect_result(idx) {
                    completed += 1;

                    if let Err(err) = on_result(done) {
                        self.shutdown();
                        return Err(err);
                    }
                }
            }
        }

        self.shutdown();
        Ok(completed)
    }

    fn jobs_remain(&self) -> bool {
        !self.source_done || !self.retry_queue.is_empty()
    }

    fn assign_jobs(
        &mut self,
        on_result: &mut impl FnMut(CompletedJob) -> Result<()>,
        completed: &mut usize,
    ) -> Result<()> {
        for idx in 0..self.workers.len() {
            if !matches!(self.workers[idx].state, SlotState::Idle) {
                continue;
            }

            let (job, attempt) = match self.retry_queue.pop_front() {
                Some(entry) => entry,
                None => {
                    if self.source_done {
                        break;
                    }

                    match (self.job_source)(idx)? {
                        Some(job) => (job, 0),
                        None => {
                            self.source_done = true;
                            break;
                        }
                    }
                }
            };

            let worker = &mut self.workers[idx];

            match worker.client.send(&job.command) {
                Ok(()) => worker.state = SlotState::Busy { job, attempt },
                Err(err) => {
                    log::warn!("worker {idx} failed to accept a job: {err}");
                    worker.state = SlotState::Dead;

                    if attempt < self.retry_interval.len() {
                        self.retry_queue.push_back((job, attempt + 1));
                    } else {
                        *completed += 1;
                        on_result(CompletedJob {
                            key: job.key,
                            worker: idx,
                            result: Err(err),
                        })?;
                    }
                }
            }
        }

        Ok(())
    }

    fn poll_busy(&mut self, busy: &[usize]) -> Result<Vec<usize>> {
        let mut fds: Vec<PollFd> = busy
            .iter()
            .map(|&idx| PollFd::new(self.workers[idx].client.as_raw_fd(), PollFlags::POLLIN))
            .collect();

        let timeout_ms = (self.timeout.as_millis() / 2).max(1) as i32;

        loop {
            match poll(&mut fds, timeout_ms) {
                Ok(0) => return Ok(Vec::new()),
                Ok(_) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => return Err(Error::protocol(format!("poll failed: {err}"))),
            }
        }

        Ok(busy
            .iter()
            .zip(&fds)
            .filter(|(_, fd)| {
                fd.revents()
                    .map(|events| {
                        events.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
                    })
                    .unwrap_or(false)
            })
            .map(|(&idx, _)| idx)
            .collect())
    }

    /// Read the pending result from a busy worker. Returns the completed job
    /// unless it was rescheduled for retry.
    fn collect_result(&mut self, idx: usize) -> Option<CompletedJob> {
        let state = std::mem::replace(&mut self.workers[idx].state, SlotState::Idle);

        let (job, attempt) = match state {
            SlotState::Busy { job, attempt } => (job, attempt),
            other => {
                self.workers[idx].state = other;
                return None;
            }
        };

        match self.workers[idx].client.result() {
            Ok(payload) => Some(CompletedJob {
                key: job.key,
                worker: idx,
                result: Ok(payload.unwrap_or(Value::Null)),
            }),
            Err(err) => {
                // Errors reported by the worker carry its stack; errors
                // without one are transport failures and kill the channel.
                let remote = err.stack().is_some();

                if !remote {
                    self.workers[idx].state = SlotState::Dead;
                }

                if err.retryable() && attempt < self.retry_interval.len() {
                    log::warn!(
                        "job retry {} of {} after: {err}",
                        attempt + 1,
                        self.retry_interval.len()
                    );
                    sleep(self.retry_interval[attempt]);

                    if remote {
                        // Channel is intact, resend on the same worker.
                        let worker = &mut self.workers[idx];

                        match worker.client.send(&job.command) {
                            Ok(()) => {
                                worker.state = SlotState::Busy {
                                    job,
                                    attempt: attempt + 1,
                                };
                                return None;
                            }
                            Err(send_err) => {
                                log::warn!("worker {idx} lost during retry: {send_err}");
                                worker.state = SlotState::Dead;
                            }
                        }
                    }

                    self.retry_queue.push_back((job, attempt + 1));
                    return None;
                }

                Some(CompletedJob {
                    key: job.key,
                    worker: idx,
                    result: Err(err),
                })
            }
        }
    }

    /// Ping idle workers so long quiet stretches do not look like death.
    fn keep_alive(&mut self) {
        for (idx, worker) in self.workers.iter_mut().enumerate() {
            if matches!(worker.state, SlotState::Idle) {
                if let Err(err) = worker.client.noop() {
                    log::warn!("worker {idx} keep-alive failed: {err}");
                    worker.state = SlotState::Dead;
                }
            }
        }
    }

    /// Cancel in-flight sessions, drain pending results and ask every live
    /// worker to exit.
    fn shutdown(&mut self) {
        for worker in self.workers.iter_mut() {
            if let SlotState::Busy { job, .. } =
                std::mem::replace(&mut worker.state, SlotState::Idle)
            {
                if job.command.session_id != 0 {
                    let cancel = Command::session(
                        job.command.id.clone(),
                        CommandType::Cancel,
                        job.command.session_id,
                        Value::Null,
                    );
                    let _ = worker.client.send(&cancel);
                }

                // Drain whatever the worker was writing; the result is
                // discarded either way.
                let _ = worker.client.result();

                if job.command.session_id != 0 {
                    let _ = worker.client.result();
                }
            }

            let _ = worker.client.exit();
        }
    }
}
