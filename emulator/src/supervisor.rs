// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! simulator processes
//!
//! A `SupervisedProcess` owns one OS process. A watcher thread reaps the
//! process and classifies its exit: if `stop` was called before the watcher
//! saw the exit, the shutdown is expected, no matter which of the two
//! happened first at the OS level. Anything else is an unexpected exit.
//!
//! Readiness is a TCP connect to the process' control port. The poll has no
//! deadline by default; it ends as soon as the watcher reports an exit.

use crate::error::{Error, Result};
use crate::lock;
use crate::options::Output;
use crate::toolchain::Toolchain;
use log::{debug, error, info, warn};
use std::net::{SocketAddr, TcpStream};
use std::process::{Child, Command};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Connect timeout and pause between readiness attempts.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How often the watcher checks on its process.
const WATCH_INTERVAL: Duration = Duration::from_millis(20);

/// Everything needed to start a simulator.
#[derive(Debug)]
pub struct LaunchSpec {
    /// label for logs and errors: the instance, or the instances sharing the process.
    pub name: String,
    pub toolchain: Toolchain,
    pub args: Vec<String>,
    pub stdout: Output,
    pub stderr: Output,
    /// generated files the process reads; removed once the process is gone.
    pub workdir: Option<TempDir>,
}

impl LaunchSpec {
    pub fn new(name: &str, toolchain: &Toolchain, args: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            toolchain: toolchain.clone(),
            args,
            stdout: Output::default(),
            stderr: Output::default(),
            workdir: None,
        }
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.toolchain.display_name())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownEvent {
    /// the process went away after `stop`.
    Expected { code: Option<i32> },
    /// the process went away on its own.
    Unexpected { code: Option<i32> },
}

impl ShutdownEvent {
    pub fn is_expected(&self) -> bool {
        matches!(self, ShutdownEvent::Expected { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// the process exited before the port accepted a connection.
    Exited,
    TimedOut(Duration),
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        *self == Readiness::Ready
    }

    /// Turn anything but `Ready` into the matching startup error.
    pub fn into_result(self, instance: &str, binary: &str) -> Result<()> {
        match self {
            Readiness::Ready => Ok(()),
            Readiness::Exited => Err(Error::ReadinessFailure {
                instance: instance.to_string(),
                binary: binary.to_string(),
            }),
            Readiness::TimedOut(waited) => Err(Error::ReadinessTimeout {
                instance: instance.to_string(),
                waited,
            }),
        }
    }
}

#[derive(Default)]
struct ProcessState {
    killed: bool,
    exit: Option<ShutdownEvent>,
}

struct Shared {
    child: Mutex<Child>,
    state: Mutex<ProcessState>,
    exited: Condvar,
}

pub struct SupervisedProcess {
    name: String,
    binary: String,
    pid: u32,
    shared: Arc<Shared>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    _workdir: Option<TempDir>,
}

impl SupervisedProcess {
    /// Start the process and its watcher.
    pub fn launch(spec: LaunchSpec) -> Result<Self> {
        let binary = spec.toolchain.display_name();
        let mut command = Command::new(&spec.toolchain.executable);
        command
            .args(&spec.args)
            .stdout(spec.stdout.stdio()?)
            .stderr(spec.stderr.stdio()?);
        if !spec.toolchain.ld_library_path.is_empty() {
            command.env("LD_LIBRARY_PATH", &spec.toolchain.ld_library_path);
        }
        debug!("{}: {}", spec.name, spec.command_line());

        let child = command.spawn().map_err(|e| Error::ProcessLaunchFailure {
            binary: binary.clone(),
            reason: e.to_string(),
        })?;
        let pid = child.id();
        debug!("{}({}) PID is {}.", spec.name, binary, pid);

        let shared = Arc::new(Shared {
            child: Mutex::new(child),
            state: Mutex::new(ProcessState::default()),
            exited: Condvar::new(),
        });
        let watcher = {
            let shared = shared.clone();
            let name = spec.name.clone();
            thread::Builder::new()
                .name(format!("{}-watcher", spec.name))
                .spawn(move || watch(&name, &shared))
                .map_err(|e| Error::ProcessLaunchFailure {
                    binary: binary.clone(),
                    reason: format!("cannot start watcher: {}", e),
                })?
        };

        Ok(Self {
            name: spec.name,
            binary,
            pid,
            shared,
            watcher: Mutex::new(Some(watcher)),
            _workdir: spec.workdir,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_event().is_none()
    }

    pub fn shutdown_event(&self) -> Option<ShutdownEvent> {
        lock(&self.shared.state).exit
    }

    /// Block until the process is gone, or `timeout` elapses.
    pub fn wait_for_exit(&self, timeout: Option<Duration>) -> Option<ShutdownEvent> {
        let state = lock(&self.shared.state);
        match timeout {
            None => {
                let state = self
                    .shared
                    .exited
                    .wait_while(state, |s| s.exit.is_none())
                    .unwrap_or_else(|e| e.into_inner());
                state.exit
            }
            Some(timeout) => {
                let (state, _) = self
                    .shared
                    .exited
                    .wait_timeout_while(state, timeout, |s| s.exit.is_none())
                    .unwrap_or_else(|e| e.into_inner());
                state.exit
            }
        }
    }

    /// Poll `addr` until it accepts a connection or the process exits.
    ///
    /// Between attempts the poll sleeps on the exit notification, so an exit
    /// ends the wait immediately.
    pub fn wait_for_ready(&self, addr: SocketAddr, timeout: Option<Duration>) -> Readiness {
        let started = Instant::now();
        loop {
            if !self.is_running() {
                return Readiness::Exited;
            }
            if TcpStream::connect_timeout(&addr, POLL_INTERVAL).is_ok() {
                debug!("{}: {} is reachable", self.name, addr);
                return Readiness::Ready;
            }
            let pause = match timeout {
                Some(timeout) => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        return Readiness::TimedOut(waited);
                    }
                    POLL_INTERVAL.min(timeout - waited)
                }
                None => POLL_INTERVAL,
            };
            if self.wait_for_exit(Some(pause)).is_some() {
                return Readiness::Exited;
            }
        }
    }

    /// Kill the process and wait for the watcher to reap it.
    ///
    /// Stopping a process that already exited, or stopping twice, is fine.
    pub fn stop(&self) -> Result<()> {
        {
            let mut state = lock(&self.shared.state);
            if state.exit.is_none() {
                state.killed = true;
            }
        }
        if self.is_running() {
            let mut child = lock(&self.shared.child);
            if let Err(e) = child.kill() {
                // lost the race against a natural exit
                if !matches!(child.try_wait(), Ok(Some(_))) {
                    return Err(Error::io(format!("{}: killing {}", self.name, self.binary), &e));
                }
            }
        }
        self.wait_for_exit(None);
        let watcher = lock(&self.watcher).take();
        if let Some(watcher) = watcher {
            if watcher.join().is_err() {
                warn!("{}: watcher thread panicked", self.name);
            }
        }
        Ok(())
    }
}

impl Drop for SupervisedProcess {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("{}", e);
        }
    }
}

fn watch(name: &str, shared: &Shared) {
    let code = loop {
        let status = lock(&shared.child).try_wait();
        match status {
            Ok(Some(status)) => break status.code(),
            Ok(None) => thread::sleep(WATCH_INTERVAL),
            Err(e) => {
                error!("{}: cannot wait for process: {}", name, e);
                break None;
            }
        }
    };

    let mut state = lock(&shared.state);
    let event = if state.killed {
        info!("{} shut down.", name);
        ShutdownEvent::Expected { code }
    } else {
        error!(
            "{}",
            Error::UnexpectedExit {
                instance: name.to_string(),
                code
            }
        );
        ShutdownEvent::Unexpected { code }
    };
    state.exit = Some(event);
    shared.exited.notify_all();
}
