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

//! start/stop barrier for instances that share one process
//!
//! All instances are declared before any of them starts. Every `start` call
//! registers its instance; registration order is call order and becomes the
//! instance's device index. The call that completes the set launches the
//! process on behalf of everybody, and all callers observe the outcome of
//! that one launch. The process is terminated by the last `stop`.
//!
//! A registry lives for one emulated network: once terminated it cannot be
//! started again.

use crate::error::{Error, Result};
use crate::lock;
use log::{debug, info, warn};
use std::fmt;
use std::sync::{Condvar, Mutex};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// no instance has started.
    Idle,
    /// some, but not all, declared instances have started.
    Accumulating,
    /// the last instance started and the process is coming up.
    Launching,
    Running,
    /// some, but not all, instances have stopped.
    Draining,
    Terminated,
    /// the launch failed; only stops are accepted.
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One instance's contribution to the shared launch.
#[derive(Debug)]
pub struct Registration<P> {
    pub name: String,
    /// position in registration order.
    pub index: usize,
    pub payload: P,
}

/// Brings the shared process up and down on behalf of the registry.
pub trait SharedLauncher: Send + Sync {
    type Participant: Send;
    type Handle: Send;

    /// Launch a single process for all registrations, given in registration
    /// order, and return once it is ready.
    fn launch(&self, registrations: Vec<Registration<Self::Participant>>) -> Result<Self::Handle>;

    fn terminate(&self, handle: Self::Handle) -> Result<()>;
}

struct Barrier<P, H> {
    phase: Phase,
    declared: Vec<String>,
    registered: Vec<String>,
    pending: Vec<Registration<P>>,
    stopped: Vec<String>,
    outcome: Option<Result<()>>,
    handle: Option<H>,
    launches: usize,
}

pub struct Registry<L: SharedLauncher> {
    label: String,
    launcher: L,
    barrier: Mutex<Barrier<L::Participant, L::Handle>>,
    launched: Condvar,
}

impl<L: SharedLauncher> Registry<L> {
    pub fn new(label: &str, launcher: L) -> Self {
        Self {
            label: label.to_string(),
            launcher,
            barrier: Mutex::new(Barrier {
                phase: Phase::Idle,
                declared: Vec::new(),
                registered: Vec::new(),
                pending: Vec::new(),
                stopped: Vec::new(),
                outcome: None,
                handle: None,
                launches: 0,
            }),
            launched: Condvar::new(),
        }
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Announce an instance. Only possible before the first `start`.
    pub fn declare(&self, name: &str) -> Result<usize> {
        let mut barrier = lock(&self.barrier);
        if barrier.phase != Phase::Idle {
            return Err(Error::invalid_state(
                name,
                format!("{} is {}, no more instances can join", self.label, barrier.phase),
            ));
        }
        if barrier.declared.iter().any(|n| n == name) {
            return Err(Error::invalid_state(name, "declared twice"));
        }
        barrier.declared.push(name.to_string());
        Ok(barrier.declared.len())
    }

    pub fn expected(&self) -> usize {
        lock(&self.barrier).declared.len()
    }

    pub fn registered(&self) -> Vec<String> {
        lock(&self.barrier).registered.clone()
    }

    pub fn phase(&self) -> Phase {
        lock(&self.barrier).phase
    }

    /// Number of times the launcher ran. Never more than one.
    pub fn launches(&self) -> usize {
        lock(&self.barrier).launches
    }

    /// The running process, between a successful launch and termination.
    pub fn handle(&self) -> Option<L::Handle>
    where
        L::Handle: Clone,
    {
        lock(&self.barrier).handle.clone()
    }

    /// Register `name` and block until the shared process is ready, or failed.
    ///
    /// Returns the instance's registration index.
    pub fn start(&self, name: &str, payload: L::Participant) -> Result<usize> {
        let mut barrier = lock(&self.barrier);
        match barrier.phase {
            Phase::Idle | Phase::Accumulating => {}
            phase => {
                return Err(Error::invalid_state(
                    name,
                    format!("cannot start, {} is {}", self.label, phase),
                ))
            }
        }
        if !barrier.declared.iter().any(|n| n == name) {
            return Err(Error::invalid_state(name, "started without being declared"));
        }
        if barrier.registered.iter().any(|n| n == name) {
            return Err(Error::invalid_state(name, "started twice"));
        }

        let index = barrier.registered.len();
        barrier.registered.push(name.to_string());
        barrier.pending.push(Registration {
            name: name.to_string(),
            index,
            payload,
        });
        debug!(
            "{}: registered {} as device {} ({} of {})",
            self.label,
            name,
            index,
            index + 1,
            barrier.declared.len()
        );

        if barrier.registered.len() < barrier.declared.len() {
            barrier.phase = Phase::Accumulating;
            let barrier = self
                .launched
                .wait_while(barrier, |b| b.outcome.is_none())
                .unwrap_or_else(|e| e.into_inner());
            return barrier
                .outcome
                .clone()
                .unwrap_or_else(|| Err(Error::invalid_state(name, "woken without a launch outcome")))
                .map(|_| index);
        }

        barrier.phase = Phase::Launching;
        barrier.launches += 1;
        let registrations = std::mem::take(&mut barrier.pending);
        drop(barrier);

        info!(
            "{}: launching for {} instances",
            self.label,
            registrations.len()
        );
        let result = self.launcher.launch(registrations);

        let mut barrier = lock(&self.barrier);
        let outcome = match result {
            Ok(handle) => {
                barrier.phase = if barrier.stopped.is_empty() {
                    Phase::Running
                } else {
                    Phase::Draining
                };
                barrier.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                barrier.phase = Phase::Failed;
                Err(e)
            }
        };
        barrier.outcome = Some(outcome.clone());
        self.launched.notify_all();

        // every instance stopped while the process was coming up
        if barrier.stopped.len() == barrier.declared.len() {
            self.terminate(barrier)?;
        }
        outcome.map(|_| index)
    }

    /// Record that `name` stopped; the last stop terminates the process.
    pub fn stop(&self, name: &str) -> Result<()> {
        let mut barrier = lock(&self.barrier);
        if !barrier.declared.iter().any(|n| n == name) {
            return Err(Error::invalid_state(name, "stopped without being declared"));
        }
        if barrier.stopped.iter().any(|n| n == name) {
            warn!("{}: {} stopped twice", self.label, name);
            return Ok(());
        }
        barrier.stopped.push(name.to_string());

        // an instance that stops without having started can never complete
        // the set, so the launch is abandoned and waiting starts are released
        let waiting = matches!(barrier.phase, Phase::Idle | Phase::Accumulating);
        if waiting && !barrier.registered.iter().any(|n| n == name) {
            warn!("{}: {} stopped before starting, no launch", self.label, name);
            barrier.phase = Phase::Failed;
            barrier.pending.clear();
            barrier.outcome = Some(Err(Error::invalid_state(
                name,
                format!("stopped before {} launched", self.label),
            )));
            self.launched.notify_all();
        }

        if barrier.stopped.len() < barrier.declared.len() {
            if barrier.phase == Phase::Running {
                barrier.phase = Phase::Draining;
            }
            return Ok(());
        }
        if barrier.phase == Phase::Launching {
            // the launching thread terminates once it is done
            return Ok(());
        }
        self.terminate(barrier)
    }

    fn terminate(
        &self,
        mut barrier: std::sync::MutexGuard<Barrier<L::Participant, L::Handle>>,
    ) -> Result<()> {
        barrier.phase = Phase::Terminated;
        let handle = barrier.handle.take();
        drop(barrier);
        match handle {
            Some(handle) => {
                info!("{}: all instances stopped, terminating", self.label);
                self.launcher.terminate(handle)
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeLauncher {
        fail: bool,
        order: Mutex<Vec<(String, usize)>>,
        terminated: AtomicUsize,
    }

    impl SharedLauncher for FakeLauncher {
        type Participant = u32;
        type Handle = usize;

        fn launch(&self, registrations: Vec<Registration<u32>>) -> Result<usize> {
            *self.order.lock().unwrap() = registrations
                .iter()
                .map(|r| (r.name.clone(), r.index))
                .collect();
            if self.fail {
                return Err(Error::ReadinessFailure {
                    instance: "shared".into(),
                    binary: "tofino-model".into(),
                });
            }
            Ok(registrations.len())
        }

        fn terminate(&self, _handle: usize) -> Result<()> {
            self.terminated.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn registry(names: &[&str], fail: bool) -> Arc<Registry<FakeLauncher>> {
        let registry = Registry::new(
            "fake",
            FakeLauncher {
                fail,
                ..Default::default()
            },
        );
        for name in names {
            registry.declare(name).unwrap();
        }
        Arc::new(registry)
    }

    fn start_in_thread(
        registry: &Arc<Registry<FakeLauncher>>,
        name: &str,
    ) -> thread::JoinHandle<Result<usize>> {
        let registry = registry.clone();
        let name = name.to_string();
        thread::spawn(move || registry.start(&name, 0))
    }

    fn wait_for_registrations(registry: &Registry<FakeLauncher>, count: usize) {
        while registry.registered().len() < count {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn single_instance_launches_immediately() {
        let registry = registry(&["s1"], false);
        assert_eq!(registry.phase(), Phase::Idle);
        assert_eq!(registry.start("s1", 0), Ok(0));
        assert_eq!(registry.phase(), Phase::Running);
        assert_eq!(registry.launches(), 1);
        registry.stop("s1").unwrap();
        assert_eq!(registry.phase(), Phase::Terminated);
        assert_eq!(registry.launcher().terminated.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn launch_happens_once_after_all_starts() {
        let _logger = env_logger::builder().is_test(true).try_init();
        let names = ["s1", "s2", "s3", "s4", "s5", "s6"];
        let registry = registry(&names, false);
        let handles: Vec<_> = names
            .iter()
            .rev()
            .map(|name| start_in_thread(&registry, name))
            .collect();
        let mut indices: Vec<usize> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();
        indices.sort_unstable();
        assert_eq!(indices, (0..names.len()).collect::<Vec<_>>());
        assert_eq!(registry.launches(), 1);

        // the launcher saw instances in call order, indexed densely
        let order = registry.launcher().order.lock().unwrap().clone();
        assert_eq!(
            order.iter().map(|(name, _)| name.clone()).collect::<Vec<_>>(),
            registry.registered()
        );
        assert!(order.iter().enumerate().all(|(k, (_, index))| k == *index));
    }

    #[test]
    fn registration_order_is_call_order() {
        let registry = registry(&["A", "B", "C"], false);
        let b = start_in_thread(&registry, "B");
        wait_for_registrations(&registry, 1);
        assert_eq!(registry.phase(), Phase::Accumulating);
        let a = start_in_thread(&registry, "A");
        wait_for_registrations(&registry, 2);
        assert_eq!(registry.launches(), 0);
        let c = registry.start("C", 0);

        assert_eq!(b.join().unwrap(), Ok(0));
        assert_eq!(a.join().unwrap(), Ok(1));
        assert_eq!(c, Ok(2));
        assert_eq!(
            *registry.launcher().order.lock().unwrap(),
            vec![("B".to_string(), 0), ("A".to_string(), 1), ("C".to_string(), 2)]
        );
    }

    #[test]
    fn every_caller_sees_the_failed_launch() {
        let registry = registry(&["s1", "s2", "s3"], true);
        let waiting: Vec<_> = ["s1", "s2"]
            .iter()
            .map(|name| start_in_thread(&registry, name))
            .collect();
        wait_for_registrations(&registry, 2);
        let last = registry.start("s3", 0).unwrap_err();
        for handle in waiting {
            assert_eq!(handle.join().unwrap().unwrap_err(), last);
        }
        assert_eq!(registry.phase(), Phase::Failed);
        assert_eq!(registry.launches(), 1);

        for name in ["s1", "s2", "s3"].iter() {
            registry.stop(name).unwrap();
        }
        assert_eq!(registry.phase(), Phase::Terminated);
        assert_eq!(registry.launcher().terminated.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn last_stop_terminates() {
        let names = ["s1", "s2", "s3"];
        let registry = registry(&names, false);
        let handles: Vec<_> = names
            .iter()
            .map(|name| start_in_thread(&registry, name))
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        registry.stop("s2").unwrap();
        assert_eq!(registry.phase(), Phase::Draining);
        registry.stop("s2").unwrap();
        registry.stop("s3").unwrap();
        assert_eq!(registry.launcher().terminated.load(Ordering::SeqCst), 0);
        registry.stop("s1").unwrap();
        assert_eq!(registry.phase(), Phase::Terminated);
        assert_eq!(registry.launcher().terminated.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_before_launch_releases_waiting_starts() {
        let registry = registry(&["s1", "s2", "s3"], false);
        let s1 = start_in_thread(&registry, "s1");
        wait_for_registrations(&registry, 1);
        assert_eq!(registry.phase(), Phase::Accumulating);

        // s2 never starts
        registry.stop("s2").unwrap();
        let err = s1.join().unwrap().unwrap_err();
        assert!(matches!(err, Error::InvalidState { ref instance, .. } if instance == "s2"));
        assert_eq!(registry.phase(), Phase::Failed);
        assert!(registry.start("s3", 0).is_err());

        registry.stop("s1").unwrap();
        registry.stop("s3").unwrap();
        assert_eq!(registry.phase(), Phase::Terminated);
        assert_eq!(registry.launches(), 0);
        assert_eq!(registry.launcher().terminated.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn waiting_instance_stopped_from_elsewhere() {
        let registry = registry(&["s1", "s2"], false);
        let s1 = start_in_thread(&registry, "s1");
        wait_for_registrations(&registry, 1);
        registry.stop("s1").unwrap();
        registry.stop("s2").unwrap();
        assert!(s1.join().unwrap().is_err());
        assert_eq!(registry.phase(), Phase::Terminated);
        assert_eq!(registry.launches(), 0);
    }

    #[test]
    fn last_stop_before_any_start() {
        let registry = registry(&["s1", "s2"], false);
        registry.stop("s1").unwrap();
        registry.stop("s2").unwrap();
        assert_eq!(registry.phase(), Phase::Terminated);
        assert_eq!(registry.launches(), 0);
    }

    #[test]
    fn lifecycle_misuse() {
        let registry = registry(&["s1", "s2"], false);
        assert!(registry.declare("s1").is_err());
        assert!(registry.start("s9", 0).is_err());
        assert!(registry.stop("s9").is_err());

        let s1 = start_in_thread(&registry, "s1");
        wait_for_registrations(&registry, 1);
        assert!(registry.declare("s3").is_err());
        assert!(matches!(
            registry.start("s1", 0),
            Err(Error::InvalidState { .. })
        ));
        registry.start("s2", 0).unwrap();
        s1.join().unwrap().unwrap();

        registry.stop("s1").unwrap();
        registry.stop("s2").unwrap();
        assert!(registry.start("s1", 0).is_err());
        assert_eq!(registry.launches(), 1);
    }
}
