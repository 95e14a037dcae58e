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

//! per-network state: control port allocation and the shared model registry

use crate::error::{Error, Result};
use crate::intf::SharedInterfaces;
use crate::options::{SimpleSwitchGrpcOptions, SimpleSwitchOptions, TofinoModelOptions};
use crate::registry::Phase;
use crate::switch::{Configure, ModelLauncher, ModelRegistry, SimpleSwitch, SimpleSwitchGrpc, TofinoModel};
use crate::toolchain::{Toolchains, TOFINO_MODEL};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::TryFrom;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_THRIFT_PORT_BASE: u16 = 9090;
pub const DEFAULT_GRPC_PORT_BASE: u16 = 9559;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// first thrift port handed to software switches that do not set one.
    pub thrift_port_base: u16,
    /// first gRPC port handed to gRPC switches that do not set one.
    pub grpc_port_base: u16,
    /// readiness deadline in milliseconds; the poll is unbounded when unset.
    pub ready_timeout_ms: Option<u64>,
    /// simulator locations; resolved from the environment when unset.
    pub toolchains: Option<Toolchains>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            thrift_port_base: DEFAULT_THRIFT_PORT_BASE,
            grpc_port_base: DEFAULT_GRPC_PORT_BASE,
            ready_timeout_ms: None,
            toolchains: None,
        }
    }
}

impl SessionConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| Error::io(format!("opening {}", path.display()), &e))?;
        serde_yaml::from_reader(BufReader::new(file)).map_err(|e| Error::Io {
            context: format!("parsing {}", path.display()),
            reason: e.to_string(),
        })
    }

    pub fn from_str(config: &str) -> Result<Self> {
        serde_yaml::from_str(config).map_err(|e| Error::Io {
            context: "parsing session config".to_string(),
            reason: e.to_string(),
        })
    }

    pub fn ready_timeout(&self) -> Option<Duration> {
        self.ready_timeout_ms.map(Duration::from_millis)
    }
}

/// Hands out TCP ports, skipping the ones switches asked for explicitly.
struct PortAllocator {
    option: &'static str,
    next: u32,
    owners: HashMap<u16, String>,
}

impl PortAllocator {
    fn new(option: &'static str, base: u16) -> Self {
        Self {
            option,
            next: u32::from(base),
            owners: HashMap::new(),
        }
    }

    // the requested port, or the next free one
    fn assign(&mut self, instance: &str, requested: Option<u16>) -> Result<u16> {
        let port = match requested {
            Some(port) => port,
            None => self.get_next(instance)?,
        };
        if let Some(owner) = self.owners.get(&port) {
            return Err(Error::invalid_config(
                instance,
                self.option,
                format!("port {} is already used by {}", port, owner),
            ));
        }
        self.owners.insert(port, instance.to_string());
        debug!("{}: {} is {}", instance, self.option, port);
        Ok(port)
    }

    fn get_next(&mut self, instance: &str) -> Result<u16> {
        loop {
            let port = u16::try_from(self.next).map_err(|_| {
                Error::invalid_config(instance, self.option, "no ports left to allocate")
            })?;
            self.next += 1;
            if !self.owners.contains_key(&port) {
                return Ok(port);
            }
        }
    }
}

/// One emulated network.
///
/// Every hardware-model switch created through a session is declared to the
/// session's registry right away, so all of them must be created before the
/// first one starts.
pub struct Session {
    config: SessionConfig,
    toolchains: Arc<Toolchains>,
    thrift_ports: PortAllocator,
    grpc_ports: PortAllocator,
    models: Arc<ModelRegistry>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        let toolchains = Arc::new(config.toolchains.clone().unwrap_or_else(Toolchains::from_env));
        let launcher = ModelLauncher::new(toolchains.clone(), config.ready_timeout());
        Self {
            thrift_ports: PortAllocator::new("thrift_port", config.thrift_port_base),
            grpc_ports: PortAllocator::new("grpc_server_port", config.grpc_port_base),
            models: Arc::new(ModelRegistry::new(TOFINO_MODEL, launcher)),
            toolchains,
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn toolchains(&self) -> &Toolchains {
        &self.toolchains
    }

    pub fn models(&self) -> &Arc<ModelRegistry> {
        &self.models
    }

    /// Number of hardware-model switches the shared process will host.
    pub fn declared_models(&self) -> usize {
        self.models.expected()
    }

    pub fn model_phase(&self) -> Phase {
        self.models.phase()
    }

    pub fn tofino_model(
        &mut self,
        name: &str,
        intfs: SharedInterfaces,
        options: TofinoModelOptions,
    ) -> Result<TofinoModel> {
        // validate before declaring, every declared switch is awaited by the others
        options.validate(name)?;
        let mut switch = TofinoModel::new(name, intfs, self.models.clone())?;
        switch.configure(options)?;
        Ok(switch)
    }

    pub fn simple_switch(
        &mut self,
        name: &str,
        intfs: SharedInterfaces,
        mut options: SimpleSwitchOptions,
    ) -> Result<SimpleSwitch> {
        options.validate(name)?;
        options.thrift_port = Some(self.thrift_ports.assign(name, options.thrift_port)?);
        let mut switch = SimpleSwitch::new(
            name,
            intfs,
            self.toolchains.clone(),
            self.config.ready_timeout(),
        );
        switch.configure(options)?;
        Ok(switch)
    }

    pub fn simple_switch_grpc(
        &mut self,
        name: &str,
        intfs: SharedInterfaces,
        mut options: SimpleSwitchGrpcOptions,
    ) -> Result<SimpleSwitchGrpc> {
        options.validate(name)?;
        options.base.thrift_port = Some(self.thrift_ports.assign(name, options.base.thrift_port)?);
        options.grpc_server_port = Some(self.grpc_ports.assign(name, options.grpc_server_port)?);
        let mut switch = SimpleSwitchGrpc::new(
            name,
            intfs,
            self.toolchains.clone(),
            self.config.ready_timeout(),
        );
        switch.configure(options)?;
        Ok(switch)
    }
}
