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

//! the network description read by `loadnet`

use anyhow::{Context, Result};
use emulator::{
    shared, Interface, Interfaces, LinkInterface, Session, SessionConfig, SharedInterfaces,
    Switch, VirtualInterface,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    TofinoModel,
    SimpleSwitch,
    SimpleSwitchGrpc,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Kind::TofinoModel => write!(f, "tofino_model"),
            Kind::SimpleSwitch => write!(f, "simple_switch"),
            Kind::SimpleSwitchGrpc => write!(f, "simple_switch_grpc"),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SwitchEntry {
    pub name: String,
    pub kind: Kind,
    /// options of the switch kind, see the emulator option types.
    #[serde(default)]
    pub options: Option<serde_yaml::Value>,
    /// host interface name by port number.
    #[serde(default)]
    pub ports: BTreeMap<usize, String>,
}

impl SwitchEntry {
    fn options<T: DeserializeOwned>(&self) -> Result<T> {
        let options = self
            .options
            .clone()
            .unwrap_or_else(|| serde_yaml::Value::Mapping(Default::default()));
        serde_yaml::from_value(options)
            .with_context(|| format!("{}: invalid {} options", self.name, self.kind))
    }

    fn interfaces(&self, virtual_links: bool) -> SharedInterfaces {
        let intfs: Interfaces = self
            .ports
            .iter()
            .map(|(&port, name)| {
                let intf: Box<dyn Interface> = if virtual_links {
                    VirtualInterface::boxed(name)
                } else {
                    Box::new(LinkInterface::new(name))
                };
                (port, intf)
            })
            .collect();
        shared(intfs)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Topology {
    #[serde(default)]
    pub session: SessionConfig,
    pub switches: Vec<SwitchEntry>,
}

impl Topology {
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        serde_yaml::from_reader(BufReader::new(file))
            .with_context(|| format!("parsing {}", path.display()))
    }

    #[allow(dead_code)]
    pub fn from_str(config: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(config)?)
    }

    /// Create and configure every switch, in file order.
    ///
    /// With `virtual_links` interfaces are only renamed in memory, not on the host.
    pub fn build(&self, session: &mut Session, virtual_links: bool) -> Result<Vec<Box<dyn Switch>>> {
        let mut switches: Vec<Box<dyn Switch>> = Vec::with_capacity(self.switches.len());
        for entry in &self.switches {
            let intfs = entry.interfaces(virtual_links);
            let switch: Box<dyn Switch> = match entry.kind {
                Kind::TofinoModel => {
                    Box::new(session.tofino_model(&entry.name, intfs, entry.options()?)?)
                }
                Kind::SimpleSwitch => {
                    Box::new(session.simple_switch(&entry.name, intfs, entry.options()?)?)
                }
                Kind::SimpleSwitchGrpc => {
                    Box::new(session.simple_switch_grpc(&entry.name, intfs, entry.options()?)?)
                }
            };
            switches.push(switch);
        }
        Ok(switches)
    }
}
