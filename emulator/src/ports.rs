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

//! device port numbering for co-hosted model instances
//!
//! Each instance owns a slice of `PORT_STRIDE` device ports, selected by its
//! registration index. Within the slice, port `n` of the instance (ports are
//! numbered from 1) becomes device port `base + n - 1`. Every device port is
//! backed by a pair of transport ids; the interface is renamed after the
//! first one so the model can find it.

use crate::error::{Error, Result};
use crate::intf::Interfaces;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

/// Width of the device port range reserved for each instance.
pub const PORT_STRIDE: usize = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapEntry {
    pub device_port: usize,
    pub veth1: usize,
    pub veth2: usize,
}

impl PortMapEntry {
    /// compute the entry for local port `port` of the instance registered at `index`.
    pub fn new(index: usize, port: usize) -> Self {
        let base = index * PORT_STRIDE;
        let device_port = base + port - 1;
        let veth1 = base + device_port * 2;
        Self {
            device_port,
            veth1,
            veth2: veth1 + 1,
        }
    }

    /// the name the interface carries once the model owns it.
    pub fn interface_name(&self) -> String {
        format!("veth{}", self.veth1)
    }
}

/// The port map file handed to the hardware model with `-f`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMap {
    #[serde(rename = "PortToVeth")]
    pub port_to_veth: Vec<PortMapEntry>,
}

impl PortMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, entries: Vec<PortMapEntry>) {
        self.port_to_veth.extend(entries);
    }

    pub fn len(&self) -> usize {
        self.port_to_veth.len()
    }

    pub fn is_empty(&self) -> bool {
        self.port_to_veth.is_empty()
    }

    /// device ports must be pairwise distinct across the whole map.
    pub fn validate(&self) -> Result<()> {
        if let Some(dup) = self
            .port_to_veth
            .iter()
            .map(|e| e.device_port)
            .duplicates()
            .next()
        {
            return Err(Error::malformed(
                "port map",
                format!("device port {} assigned twice", dup),
            ));
        }
        Ok(())
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        let context = format!("writing port map {}", path.display());
        let mut file = std::fs::File::create(path).map_err(|e| Error::io(context.clone(), &e))?;
        serde_json::to_writer(&mut file, self).map_err(|e| Error::Io {
            context: context.clone(),
            reason: e.to_string(),
        })?;
        file.flush().map_err(|e| Error::io(context, &e))
    }
}

/// Compute the entries for an instance without touching its interfaces.
///
/// Loopback interfaces are skipped. Ports outside of `1..=PORT_STRIDE` would
/// spill into a neighbour's device ports and are rejected.
pub fn plan(instance: &str, index: usize, intfs: &Interfaces) -> Result<Vec<PortMapEntry>> {
    intfs
        .iter()
        .filter(|(_, intf)| !intf.is_loopback())
        .map(|(&port, _)| {
            if port == 0 || port > PORT_STRIDE {
                return Err(Error::PortSpaceExhausted {
                    instance: instance.to_string(),
                    port,
                });
            }
            Ok(PortMapEntry::new(index, port))
        })
        .collect()
}

/// Compute the entries for an instance and rename its interfaces to match.
///
/// Renaming happens in place, so this must run exactly once per instance.
/// Nothing is renamed if any port is out of range.
pub fn map_ports(instance: &str, index: usize, intfs: &mut Interfaces) -> Result<Vec<PortMapEntry>> {
    let entries = plan(instance, index, intfs)?;
    let targets = intfs.values_mut().filter(|intf| !intf.is_loopback());
    for (intf, entry) in targets.zip(entries.iter()) {
        intf.rename(&entry.interface_name())?;
    }
    Ok(entries)
}
