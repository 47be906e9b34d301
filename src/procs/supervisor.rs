// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::SupervisorConfig;
use crate::control::ControlListener;
use crate::env::Environment;
use crate::error::ErrorKind;
use crate::fork::{exit_parts, spawn_worker, terminate, StdIoConf};
use crate::procs::ipc;
use crate::procs::logger::{Logger, Stream};
use crate::session::{self, SessionName, SessionSpec};
use crate::Error;

/// Bounds on how often, and how quickly, workers are restarted
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestartLimits {
    /// Automatic restarts allowed before the worker is marked failed, 0 disables restarts
    pub max_restarts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// A run at least this long resets the backoff delay
    pub reset_after: Duration,
    /// Time between SIGTERM and SIGKILL when stopping a worker
    pub stop_timeout: Duration,
}

impl RestartLimits {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            max_restarts: config.max_restarts,
            backoff_base: config.backoff_base(),
            backoff_max: config.backoff_max(),
            reset_after: config.reset_after(),
            stop_timeout: config.stop_timeout(),
        }
    }
}

impl Default for RestartLimits {
    fn default() -> Self {
        Self::from_config(&SupervisorConfig::default())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    Starting,
    Running { pid: u32 },
    Backoff { attempt: u32, delay_ms: u64 },
    Exited { code: Option<i32>, signal: Option<i32> },
    Stopped,
    Failed { reason: String },
}

impl WorkerState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    pub fn pid(&self) -> Option<u32> {
        match self {
            Self::Running { pid } => Some(*pid),
            _ => None,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running { pid } => write!(f, "running (pid {})", pid),
            Self::Backoff { attempt, delay_ms } => {
                write!(f, "restarting in {}ms (attempt {})", delay_ms, attempt)
            }
            Self::Exited {
                code: Some(code), ..
            } => write!(f, "exited (code {})", code),
            Self::Exited {
                signal: Some(signal),
                ..
            } => write!(f, "exited (signal {})", signal),
            Self::Exited { .. } => write!(f, "exited"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed { reason } => write!(f, "failed: {}", reason),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub name: String,
    pub state: WorkerState,
    /// Automatic restarts since the worker was last started by hand
    pub restarts: u32,
}

/// `min(base * 2^attempt, max)`
#[derive(Clone, Debug)]
struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

enum WorkerCommand {
    Start,
    Stop(oneshot::Sender<()>),
    Restart(oneshot::Sender<()>),
}

/// What a worker task does next
enum Next {
    Run,
    Idle,
    Exit,
}

/// Owns one child process at a time, and restarts it according to its policy
struct Worker {
    spec: SessionSpec,
    env: Arc<Environment>,
    work_dir: Arc<PathBuf>,
    limits: RestartLimits,
    logger: Logger,
    status: watch::Sender<WorkerStatus>,
    restarts: u32,
    backoff: Backoff,
}

impl Worker {
    async fn run(mut self, mut commands: mpsc::Receiver<WorkerCommand>) {
        let mut next = Next::Run;
        loop {
            next = match next {
                Next::Run => self.run_once(&mut commands).await,
                Next::Idle => self.idle(&mut commands).await,
                Next::Exit => return,
            };
        }
    }

    fn set_state(&mut self, state: WorkerState) {
        self.status.send_replace(WorkerStatus {
            name: self.spec.name().to_string(),
            state,
            restarts: self.restarts,
        });
    }

    /// Started by hand, the restart budget starts over
    fn reset(&mut self) {
        self.restarts = 0;
        self.backoff.reset();
    }

    async fn idle(&mut self, commands: &mut mpsc::Receiver<WorkerCommand>) -> Next {
        loop {
            match commands.recv().await {
                Some(WorkerCommand::Start) => {
                    self.reset();
                    return Next::Run;
                }
                Some(WorkerCommand::Restart(ack)) => {
                    self.reset();
                    ack.send(()).ok();
                    return Next::Run;
                }
                // already stopped
                Some(WorkerCommand::Stop(ack)) => {
                    ack.send(()).ok();
                }
                None => return Next::Exit,
            }
        }
    }

    async fn run_once(&mut self, commands: &mut mpsc::Receiver<WorkerCommand>) -> Next {
        self.set_state(WorkerState::Starting);
        let started = Instant::now();

        let mut child = match spawn_worker(
            &self.spec,
            &self.env,
            &self.work_dir,
            StdIoConf::captured(),
        ) {
            Ok(child) => child,
            Err(e) => {
                error!(session = %self.spec.name(), "{}", e);
                self.set_state(WorkerState::Failed {
                    reason: e.to_string(),
                });
                return self.after_exit(false, started.elapsed(), commands).await;
            }
        };

        let pid = child.id().unwrap_or_default();
        info!(session = %self.spec.name(), pid, "worker running");
        self.set_state(WorkerState::Running { pid });

        // the capture tasks end on their own at EOF
        if let Some(stdout) = child.stdout.take() {
            self.logger.capture(Stream::Stdout, stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.logger.capture(Stream::Stderr, stderr);
        }

        enum Event {
            Exited(std::io::Result<std::process::ExitStatus>),
            Stop(Option<oneshot::Sender<()>>),
            Restart(oneshot::Sender<()>),
        }

        let event = loop {
            tokio::select! {
                status = child.wait() => break Event::Exited(status),
                command = commands.recv() => match command {
                    Some(WorkerCommand::Start) => continue,
                    Some(WorkerCommand::Stop(ack)) => break Event::Stop(Some(ack)),
                    Some(WorkerCommand::Restart(ack)) => break Event::Restart(ack),
                    None => break Event::Stop(None),
                },
            }
        };

        match event {
            Event::Exited(Ok(status)) => {
                let (code, signal) = exit_parts(&status);
                let uptime = started.elapsed();
                warn!(session = %self.spec.name(), pid, ?code, ?signal, ?uptime, "worker exited");

                self.set_state(WorkerState::Exited { code, signal });
                self.after_exit(status.success(), uptime, commands).await
            }
            Event::Exited(Err(e)) => {
                error!(session = %self.spec.name(), pid, "failed to wait on worker: {}", e);
                self.set_state(WorkerState::Failed {
                    reason: e.to_string(),
                });
                self.after_exit(false, started.elapsed(), commands).await
            }
            Event::Stop(ack) => {
                self.stop_child(&mut child).await;
                self.set_state(WorkerState::Stopped);

                match ack {
                    Some(ack) => {
                        ack.send(()).ok();
                        Next::Idle
                    }
                    None => Next::Exit,
                }
            }
            Event::Restart(ack) => {
                self.stop_child(&mut child).await;
                self.reset();
                ack.send(()).ok();
                Next::Run
            }
        }
    }

    async fn stop_child(&self, child: &mut tokio::process::Child) {
        info!(session = %self.spec.name(), "stopping worker");
        if let Err(e) = terminate(child, self.limits.stop_timeout).await {
            error!(session = %self.spec.name(), "failed to stop worker: {}", e);
        }
    }

    /// Decides whether, and when, the worker runs again
    async fn after_exit(
        &mut self,
        success: bool,
        uptime: Duration,
        commands: &mut mpsc::Receiver<WorkerCommand>,
    ) -> Next {
        // a worker that stayed up long enough starts over with a fresh restart budget
        if uptime >= self.limits.reset_after {
            self.reset();
        }

        if !self.spec.restart().should_restart(success) {
            info!(session = %self.spec.name(), policy = ?self.spec.restart(), "not restarting worker");
            return Next::Idle;
        }

        if self.restarts >= self.limits.max_restarts {
            let reason = format!("maximum restarts ({}) exceeded", self.limits.max_restarts);
            error!(session = %self.spec.name(), "{}", reason);
            self.set_state(WorkerState::Failed { reason });
            return Next::Idle;
        }

        let delay = self.backoff.next_delay();
        let attempt = self.restarts + 1;
        info!(session = %self.spec.name(), attempt, ?delay, "restarting worker");
        self.set_state(WorkerState::Backoff {
            attempt,
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        });

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        tokio::select! {
            _ = &mut sleep => {
                self.restarts = attempt;
                Next::Run
            }
            command = commands.recv() => match command {
                Some(WorkerCommand::Start) => {
                    self.reset();
                    Next::Run
                }
                Some(WorkerCommand::Restart(ack)) => {
                    self.reset();
                    ack.send(()).ok();
                    Next::Run
                }
                Some(WorkerCommand::Stop(ack)) => {
                    self.set_state(WorkerState::Stopped);
                    ack.send(()).ok();
                    Next::Idle
                }
                None => Next::Exit,
            },
        }
    }
}

struct WorkerHandle {
    name: SessionName,
    commands: mpsc::Sender<WorkerCommand>,
    status: watch::Receiver<WorkerStatus>,
    task: JoinHandle<()>,
}

/// Launch and monitor worker processes
///
/// Rules:
///   - each worker runs as a direct child, in its own process group
///   - workers are restarted according to their `RestartPolicy`, with exponential backoff
///   - stdout and stderr of every worker go to its `Logger`
///   - listens on the control socket for commands from a `Leader`
pub struct Supervisor {
    workers: Vec<WorkerHandle>,
}

impl Supervisor {
    /// Spawns every session; returns once all of them have been requested to start
    pub async fn start(
        sessions: Vec<SessionSpec>,
        env: Environment,
        work_dir: PathBuf,
        limits: RestartLimits,
        log_dir: Option<PathBuf>,
    ) -> Result<Self, Error> {
        session::check_unique(&sessions)?;

        let env = Arc::new(env);
        let work_dir = Arc::new(work_dir);
        let mut workers = Vec::with_capacity(sessions.len());

        for spec in sessions {
            let name = spec.name().clone();
            let logger = Logger::open(name.clone(), log_dir.as_deref()).await?;

            let (status_tx, status_rx) = watch::channel(WorkerStatus {
                name: name.to_string(),
                state: WorkerState::Starting,
                restarts: 0,
            });
            let (commands_tx, commands_rx) = mpsc::channel(8);

            let worker = Worker {
                spec,
                env: Arc::clone(&env),
                work_dir: Arc::clone(&work_dir),
                backoff: Backoff::new(limits.backoff_base, limits.backoff_max),
                limits: limits.clone(),
                logger,
                status: status_tx,
                restarts: 0,
            };

            info!(session = %name, "starting worker");
            let task = tokio::spawn(worker.run(commands_rx));
            workers.push(WorkerHandle {
                name,
                commands: commands_tx,
                status: status_rx,
                task,
            });
        }

        Ok(Self { workers })
    }

    fn worker(&self, name: &str) -> Result<&WorkerHandle, Error> {
        self.workers
            .iter()
            .find(|w| w.name.as_str() == name)
            .ok_or_else(|| ErrorKind::UnknownSession(name.to_string()).into())
    }

    pub fn names(&self) -> impl Iterator<Item = &SessionName> {
        self.workers.iter().map(|w| &w.name)
    }

    /// Status of every worker, in launch order
    pub fn status(&self) -> Vec<WorkerStatus> {
        self.workers
            .iter()
            .map(|w| w.status.borrow().clone())
            .collect()
    }

    pub fn worker_status(&self, name: &str) -> Result<WorkerStatus, Error> {
        Ok(self.worker(name)?.status.borrow().clone())
    }

    /// Waits until the state of worker `name` satisfies `pred`
    pub async fn wait_for<F>(&self, name: &str, pred: F) -> Result<WorkerStatus, Error>
    where
        F: Fn(&WorkerState) -> bool,
    {
        let mut status = self.worker(name)?.status.clone();
        loop {
            {
                let current = status.borrow_and_update();
                if pred(&current.state) {
                    return Ok(current.clone());
                }
            }

            status
                .changed()
                .await
                .map_err(|_| Error::from(format!("worker {} is gone", name)))?;
        }
    }

    async fn send(&self, name: &str, command: WorkerCommand) -> Result<(), Error> {
        self.worker(name)?
            .commands
            .send(command)
            .await
            .map_err(|_| Error::from(format!("worker {} is gone", name)))
    }

    pub async fn start_session(&self, name: &str) -> Result<(), Error> {
        self.send(name, WorkerCommand::Start).await
    }

    /// Stops the worker, returning once it has exited
    pub async fn stop_session(&self, name: &str) -> Result<(), Error> {
        let (ack, done) = oneshot::channel();
        self.send(name, WorkerCommand::Stop(ack)).await?;
        done.await
            .map_err(|_| Error::from(format!("worker {} is gone", name)))
    }

    /// Stops the worker and starts it again, returning once the old process has exited
    pub async fn restart_session(&self, name: &str) -> Result<(), Error> {
        let (ack, done) = oneshot::channel();
        self.send(name, WorkerCommand::Restart(ack)).await?;
        done.await
            .map_err(|_| Error::from(format!("worker {} is gone", name)))
    }

    /// Stops every worker concurrently and waits for their tasks to finish
    pub async fn shutdown(self) {
        info!("stopping all workers");
        let names: Vec<SessionName> = self.names().cloned().collect();
        let results = join_all(names.iter().map(|name| self.stop_session(name.as_str()))).await;
        for (name, result) in names.iter().zip(results) {
            if let Err(e) = result {
                warn!(session = %name, "{}", e);
            }
        }

        let tasks: Vec<JoinHandle<()>> = self
            .workers
            .into_iter()
            .map(|WorkerHandle { task, .. }| task)
            .collect();
        for result in join_all(tasks).await {
            if let Err(e) = result {
                error!("worker task failed: {}", e);
            }
        }
    }

    /// Serves the control socket until a shutdown request, SIGINT or SIGTERM, then stops all workers
    pub async fn serve(self, listener: ControlListener) -> Result<(), Error> {
        let shutdown = Notify::new();
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        info!(socket = %listener.path().display(), "supervisor listening");
        let result = tokio::select! {
            result = ipc::serve(&listener, &self, &shutdown) => result,
            _ = shutdown.notified() => {
                info!("shutdown requested");
                Ok(())
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                Ok(())
            }
            _ = sigint.recv() => {
                info!("received SIGINT");
                Ok(())
            }
        };

        self.shutdown().await;
        result
    }
}
