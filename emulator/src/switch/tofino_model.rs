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

//! hardware chip model, one process for all switches of a network
//!
//! Every `TofinoModel` is a logical device of a single `tofino-model`
//! process. The process is launched by the last switch to start, with the
//! device configurations of all switches merged and their interfaces mapped
//! into disjoint slices of the device port space.

use super::{local_port, Configure, Switch};
use crate::device_config::{self, DeviceConfig};
use crate::error::{Error, Result};
use crate::intf::SharedInterfaces;
use crate::lock;
use crate::options::{Credentials, Output, TofinoModelOptions};
use crate::ports::{self, PortMap};
use crate::registry::{Registration, Registry, SharedLauncher};
use crate::supervisor::{LaunchSpec, Readiness, SupervisedProcess};
use crate::toolchain::{Toolchains, TOFINO_MODEL};
use itertools::Itertools;
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub type ModelRegistry = Registry<ModelLauncher>;

/// What a switch hands over when it starts.
pub struct ModelParticipant {
    pub intfs: SharedInterfaces,
    pub options: TofinoModelOptions,
}

/// Options the process takes once, reduced over all participants.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SharedModelOptions {
    pub cli_port: u16,
    pub cli_credentials: Option<Credentials>,
    pub dru_sim_tcp_port_base: u16,
    pub time_disable: bool,
    pub port_monitor: bool,
    pub dod_test_mode: bool,
    pub log_dir: Option<PathBuf>,
    pub json_log_enable: bool,
    pub stdout: Output,
    pub stderr: Output,
}

// how a shared option value shows up in a mismatch error.
trait Describe {
    fn describe(&self) -> String;
}

macro_rules! describe_display {
    ($($t:ty),*) => {
        $(impl Describe for $t {
            fn describe(&self) -> String {
                self.to_string()
            }
        })*
    };
}

describe_display!(u16, bool, Output, Credentials);

impl Describe for PathBuf {
    fn describe(&self) -> String {
        self.display().to_string()
    }
}

/// Instance names and their options, in registration order.
pub type Participants<'a> = [(&'a str, &'a TofinoModelOptions)];

/// Every participant must carry the same value.
fn uniform<T, F>(option: &str, participants: &Participants, get: F) -> Result<T>
where
    T: PartialEq + Describe,
    F: Fn(&TofinoModelOptions) -> T,
{
    let (first_name, first) = participants
        .first()
        .ok_or_else(|| Error::invalid_state(TOFINO_MODEL, "no participants"))?;
    let value = get(*first);
    for (name, options) in &participants[1..] {
        let other = get(*options);
        if other != value {
            return Err(Error::SharedOptionMismatch {
                option: option.to_string(),
                first: (first_name.to_string(), value.describe()),
                second: (name.to_string(), other.describe()),
            });
        }
    }
    Ok(value)
}

/// Participants that set the value must agree; the agreed value applies to all.
fn agreed<T, F>(option: &str, participants: &Participants, get: F) -> Result<Option<T>>
where
    T: PartialEq + Describe,
    F: Fn(&TofinoModelOptions) -> Option<T>,
{
    let mut agreed: Option<(&str, T)> = None;
    for (name, options) in participants {
        let value = match get(*options) {
            Some(value) => value,
            None => continue,
        };
        if let Some((first_name, existing)) = &agreed {
            if *existing != value {
                return Err(Error::SharedOptionMismatch {
                    option: option.to_string(),
                    first: (first_name.to_string(), existing.describe()),
                    second: (name.to_string(), value.describe()),
                });
            }
            continue;
        }
        agreed = Some((*name, value));
    }
    Ok(agreed.map(|(_, value)| value))
}

impl SharedModelOptions {
    /// Reduce the options of all participants, in registration order.
    pub fn reduce(participants: &Participants) -> Result<Self> {
        Ok(Self {
            cli_port: uniform("cli_port", participants, |o| o.cli_port)?,
            cli_credentials: agreed("cli_credentials", participants, |o| o.cli_credentials.clone())?,
            dru_sim_tcp_port_base: uniform("dru_sim_tcp_port_base", participants, |o| {
                o.dru_sim_tcp_port_base
            })?,
            time_disable: uniform("time_disable", participants, |o| o.time_disable)?,
            port_monitor: uniform("port_monitor", participants, |o| o.port_monitor)?,
            dod_test_mode: uniform("dod_test_mode", participants, |o| o.dod_test_mode)?,
            log_dir: agreed("log_dir", participants, |o| o.log_dir.clone())?,
            json_log_enable: uniform("json_log_enable", participants, |o| o.json_log_enable)?,
            stdout: uniform("stdout", participants, |o| o.stdout.clone())?,
            stderr: uniform("stderr", participants, |o| o.stderr.clone())?,
        })
    }

    pub fn command_args(
        &self,
        device_config: &Path,
        num_devices: usize,
        port_map: &Path,
        credentials: Option<&Path>,
    ) -> Vec<String> {
        let mut args = vec![
            "--p4-target-config".to_string(),
            device_config.display().to_string(),
            "--num-of-chips".to_string(),
            num_devices.to_string(),
            "-f".to_string(),
            port_map.display().to_string(),
            "--cli-port".to_string(),
            self.cli_port.to_string(),
        ];
        if let Some(credentials) = credentials {
            args.push("--cli-credentials".to_string());
            args.push(credentials.display().to_string());
        }
        args.push("-t".to_string());
        args.push(self.dru_sim_tcp_port_base.to_string());

        if self.time_disable {
            args.push("--time-disable".to_string());
        }
        if self.port_monitor {
            args.push("--port-monitor".to_string());
        }
        if self.dod_test_mode {
            args.push("--dod-test-mode".to_string());
        }

        match &self.log_dir {
            Some(dir) => {
                args.push("--log-dir".to_string());
                args.push(dir.display().to_string());
                if self.json_log_enable {
                    args.push("--json-logs-enable".to_string());
                }
            }
            None => args.push("--logs-disable".to_string()),
        }
        args
    }
}

/// Launches the shared process for the registry.
pub struct ModelLauncher {
    toolchains: Arc<Toolchains>,
    ready_timeout: Option<Duration>,
}

impl ModelLauncher {
    pub fn new(toolchains: Arc<Toolchains>, ready_timeout: Option<Duration>) -> Self {
        Self {
            toolchains,
            ready_timeout,
        }
    }

    pub fn ready_timeout(&self) -> Option<Duration> {
        self.ready_timeout
    }
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    std::fs::write(path, contents).map_err(|e| Error::io(format!("writing {}", path.display()), &e))
}

impl SharedLauncher for ModelLauncher {
    type Participant = ModelParticipant;
    type Handle = Arc<SupervisedProcess>;

    fn launch(&self, registrations: Vec<Registration<ModelParticipant>>) -> Result<Self::Handle> {
        let label = format!(
            "{}[{}]",
            TOFINO_MODEL,
            registrations.iter().map(|r| r.name.as_str()).join(",")
        );
        let toolchain = self.toolchains.get(TOFINO_MODEL)?;

        let participants: Vec<_> = registrations
            .iter()
            .map(|r| (r.name.as_str(), &r.payload.options))
            .collect();
        let shared = SharedModelOptions::reduce(&participants)?;

        let fragments = registrations
            .iter()
            .map(|r| DeviceConfig::from_file(&r.name, &r.payload.options.p4_target_conf))
            .collect::<Result<Vec<_>>>()?;
        let merged = device_config::merge(
            registrations
                .iter()
                .map(|r| r.name.as_str())
                .zip(fragments.iter()),
        )?;

        // nothing is renamed unless every instance fits
        for r in &registrations {
            ports::plan(&r.name, r.index, &lock(&r.payload.intfs))?;
        }
        let mut port_map = PortMap::new();
        for r in &registrations {
            let entries = ports::map_ports(&r.name, r.index, &mut lock(&r.payload.intfs))?;
            debug!("{}: {} ports mapped for device {}", r.name, entries.len(), r.index);
            port_map.extend(entries);
        }
        port_map.validate()?;

        let workdir = tempfile::Builder::new()
            .prefix("tofino-model-")
            .tempdir()
            .map_err(|e| Error::io("creating the model work directory", &e))?;
        let config_path = workdir.path().join("p4_target_config.json");
        merged.write_to(&config_path)?;
        let port_map_path = workdir.path().join("ports.json");
        port_map.write_to(&port_map_path)?;
        let credentials_path = match &shared.cli_credentials {
            Some(credentials) => {
                let path = workdir.path().join("cli-credentials");
                write_file(&path, &credentials.line())?;
                Some(path)
            }
            None => None,
        };

        let args = shared.command_args(
            &config_path,
            registrations.len(),
            &port_map_path,
            credentials_path.as_deref(),
        );
        let mut spec = LaunchSpec::new(&label, toolchain, args);
        spec.stdout = shared.stdout.clone();
        spec.stderr = shared.stderr.clone();
        spec.workdir = Some(workdir);

        let process = SupervisedProcess::launch(spec)?;
        let ready_addr = local_port(shared.cli_port);
        let readiness = process.wait_for_ready(ready_addr, self.ready_timeout);
        if let Err(e) = readiness.into_result(&label, process.binary()) {
            process.stop()?;
            return Err(e);
        }
        info!("{} is ready on {}", label, ready_addr);
        Ok(Arc::new(process))
    }

    fn terminate(&self, handle: Arc<SupervisedProcess>) -> Result<()> {
        info!("{}: killing the shared model", handle.name());
        handle.stop()
    }
}

/// One logical device of the shared hardware model.
pub struct TofinoModel {
    name: String,
    intfs: SharedInterfaces,
    registry: Arc<ModelRegistry>,
    options: Option<TofinoModelOptions>,
    index: Option<usize>,
    stopped: bool,
}

impl TofinoModel {
    /// Create the switch and declare it to `registry`.
    pub fn new(name: &str, intfs: SharedInterfaces, registry: Arc<ModelRegistry>) -> Result<Self> {
        registry.declare(name)?;
        Ok(Self {
            name: name.to_string(),
            intfs,
            registry,
            options: None,
            index: None,
            stopped: false,
        })
    }

    /// Device index, known once `start` returned.
    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn cli_port(&self) -> Option<u16> {
        self.options.as_ref().map(|o| o.cli_port)
    }
}

impl Configure for TofinoModel {
    type Options = TofinoModelOptions;

    fn configure(&mut self, options: TofinoModelOptions) -> Result<()> {
        if self.index.is_some() {
            return Err(Error::invalid_state(&self.name, "cannot configure a running switch"));
        }
        options.validate(&self.name)?;
        self.options = Some(options);
        Ok(())
    }
}

impl Switch for TofinoModel {
    fn name(&self) -> &str {
        &self.name
    }

    /// Blocks until every declared switch started and the shared process is ready.
    fn start(&mut self, _controllers: &[String]) -> Result<()> {
        let options = self
            .options
            .clone()
            .ok_or_else(|| Error::invalid_state(&self.name, "not configured"))?;
        let participant = ModelParticipant {
            intfs: self.intfs.clone(),
            options,
        };
        let index = self.registry.start(&self.name, participant)?;
        self.index = Some(index);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        self.registry.stop(&self.name)
    }

    fn wait_for_ready(&self) -> Result<bool> {
        let cli_port = self
            .cli_port()
            .ok_or_else(|| Error::invalid_state(&self.name, "not configured"))?;
        let process = match self.registry.handle() {
            Some(process) => process,
            None => return Ok(false),
        };
        let ready_timeout = self.registry.launcher().ready_timeout();
        match process.wait_for_ready(local_port(cli_port), ready_timeout) {
            Readiness::Ready => Ok(true),
            Readiness::Exited => Ok(false),
            timed_out => timed_out.into_result(&self.name, process.binary()).map(|_| false),
        }
    }
}
