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

//! software switch model, one process per switch

use super::{local_port, Configure, Switch};
use crate::error::{Error, Result};
use crate::intf::{Interfaces, SharedInterfaces};
use crate::lock;
use crate::options::SimpleSwitchOptions;
use crate::supervisor::{LaunchSpec, SupervisedProcess};
use crate::toolchain::{Toolchains, SIMPLE_SWITCH};
use log::info;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub struct SimpleSwitch {
    name: String,
    intfs: SharedInterfaces,
    toolchains: Arc<Toolchains>,
    ready_timeout: Option<Duration>,
    options: Option<SimpleSwitchOptions>,
    process: Option<SupervisedProcess>,
    stopped: bool,
}

impl SimpleSwitch {
    pub fn new(
        name: &str,
        intfs: SharedInterfaces,
        toolchains: Arc<Toolchains>,
        ready_timeout: Option<Duration>,
    ) -> Self {
        Self {
            name: name.to_string(),
            intfs,
            toolchains,
            ready_timeout,
            options: None,
            process: None,
            stopped: false,
        }
    }

    pub fn thrift_port(&self) -> Option<u16> {
        self.options.as_ref().and_then(|o| o.thrift_port)
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(|p| p.pid())
    }

    pub(crate) fn interfaces(&self) -> &SharedInterfaces {
        &self.intfs
    }

    pub(crate) fn options(&self) -> Result<&SimpleSwitchOptions> {
        self.options
            .as_ref()
            .ok_or_else(|| Error::invalid_state(&self.name, "not configured"))
    }

    /// Arguments for the model: ports, thrift, logging, the target
    /// configuration, then `extra` target options after `--`.
    pub fn command_args(&self, intfs: &Interfaces, extra: &[String]) -> Result<Vec<String>> {
        let options = self.options()?;
        let thrift_port = options
            .thrift_port
            .ok_or_else(|| Error::invalid_config(&self.name, "thrift_port", "not set"))?;

        let mut args = Vec::new();
        for (port, intf) in intfs.iter().filter(|(_, intf)| !intf.is_loopback()) {
            args.push("-i".to_string());
            args.push(format!("{}@{}", port, intf.name()));
        }
        args.extend(vec!["--thrift-port".to_string(), thrift_port.to_string()]);

        if let Some(sock) = &options.nanolog_sock {
            args.extend(vec!["--nanolog".to_string(), sock.clone()]);
        }
        if options.log_console {
            args.push("--log-console".to_string());
        }
        if let Some(file) = &options.log_file {
            args.extend(vec!["--log-file".to_string(), file.display().to_string()]);
        }
        args.extend(vec!["--log-level".to_string(), options.log_level.clone()]);
        if options.log_flush {
            args.push("--log-flush".to_string());
        }
        if options.dump_packet_data > 0 {
            args.extend(vec![
                "--dump-packet-data".to_string(),
                options.dump_packet_data.to_string(),
            ]);
        }
        if let Some(dir) = &options.pcap_dir {
            args.extend(vec!["--pcap".to_string(), dir.display().to_string()]);
        }

        args.push(options.p4_target_conf.display().to_string());
        if !extra.is_empty() {
            args.push("--".to_string());
            args.extend(extra.iter().cloned());
        }
        Ok(args)
    }

    /// Launch `binary` and block until `ready_addr` accepts a connection.
    pub(crate) fn launch(&mut self, binary: &str, extra: &[String], ready_addr: SocketAddr) -> Result<()> {
        if self.process.is_some() {
            return Err(Error::invalid_state(&self.name, "already started"));
        }
        let toolchain = self.toolchains.get(binary)?.clone();
        let args = {
            let intfs = lock(&self.intfs);
            self.command_args(&intfs, extra)?
        };
        let options = self.options()?;
        let mut spec = LaunchSpec::new(&self.name, &toolchain, args);
        spec.stdout = options.stdout.clone();
        spec.stderr = options.stderr.clone();

        let process = SupervisedProcess::launch(spec)?;
        let readiness = process.wait_for_ready(ready_addr, self.ready_timeout);
        if let Err(e) = readiness.into_result(&self.name, process.binary()) {
            process.stop()?;
            return Err(e);
        }
        info!("{} ({}) is ready on {}", self.name, binary, ready_addr);
        self.process = Some(process);
        self.stopped = false;
        Ok(())
    }

    /// Poll `addr` until it accepts a connection. A process that exited, or
    /// was stopped, is not ready.
    pub(crate) fn poll(&self, addr: SocketAddr) -> Result<bool> {
        let process = match &self.process {
            Some(process) => process,
            None if self.stopped => return Ok(false),
            None => return Err(Error::invalid_state(&self.name, "not started")),
        };
        let readiness = process.wait_for_ready(addr, self.ready_timeout);
        match readiness.into_result(&self.name, process.binary()) {
            Ok(()) => Ok(true),
            Err(Error::ReadinessFailure { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn required_thrift_port(&self) -> Result<u16> {
        self.thrift_port()
            .ok_or_else(|| Error::invalid_config(&self.name, "thrift_port", "not set"))
    }
}

impl Configure for SimpleSwitch {
    type Options = SimpleSwitchOptions;

    fn configure(&mut self, options: SimpleSwitchOptions) -> Result<()> {
        if self.process.is_some() {
            return Err(Error::invalid_state(&self.name, "cannot configure a running switch"));
        }
        options.validate(&self.name)?;
        self.options = Some(options);
        Ok(())
    }
}

impl Switch for SimpleSwitch {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, _controllers: &[String]) -> Result<()> {
        let thrift_port = self.required_thrift_port()?;
        self.launch(SIMPLE_SWITCH, &[], local_port(thrift_port))
    }

    fn stop(&mut self) -> Result<()> {
        match self.process.take() {
            Some(process) => {
                self.stopped = true;
                process.stop()
            }
            None => Ok(()),
        }
    }

    fn wait_for_ready(&self) -> Result<bool> {
        let thrift_port = self.required_thrift_port()?;
        self.poll(local_port(thrift_port))
    }
}
