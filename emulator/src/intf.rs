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

//! network interfaces attached to a switch
//!
//! The network emulation framework owns the interfaces; switches only borrow
//! them through a shared, ordered map from port number to handle.

use crate::error::{Error, Result};
use log::debug;
use std::collections::BTreeMap;
use std::process::Command;
use std::sync::{Arc, Mutex};

/// Name of the loopback interface. Loopback ports are never handed to a model.
pub const LOOPBACK: &str = "lo";

pub trait Interface: Send {
    fn name(&self) -> &str;
    fn rename(&mut self, new_name: &str) -> Result<()>;

    fn is_loopback(&self) -> bool {
        self.name() == LOOPBACK
    }
}

/// Interfaces of one switch, keyed by port number.
pub type Interfaces = BTreeMap<usize, Box<dyn Interface>>;

/// The framework's interfaces, shared with the switch that uses them.
pub type SharedInterfaces = Arc<Mutex<Interfaces>>;

pub fn shared(intfs: Interfaces) -> SharedInterfaces {
    Arc::new(Mutex::new(intfs))
}

/// An interface that only exists as a name, e.g., one that is created later
/// by the framework, or one used in tests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VirtualInterface {
    name: String,
}

impl VirtualInterface {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    pub fn boxed(name: &str) -> Box<dyn Interface> {
        Box::new(Self::new(name))
    }
}

impl Interface for VirtualInterface {
    fn name(&self) -> &str {
        &self.name
    }

    fn rename(&mut self, new_name: &str) -> Result<()> {
        self.name = new_name.to_string();
        Ok(())
    }
}

/// A host network link managed with iproute2.
#[derive(Clone, Debug)]
pub struct LinkInterface {
    name: String,
}

impl LinkInterface {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    fn ip_link(&self, args: &[&str]) -> Result<()> {
        let context = format!("ip link {}", args.join(" "));
        let output = Command::new("ip")
            .arg("link")
            .args(args)
            .output()
            .map_err(|e| Error::io(context.clone(), &e))?;
        if !output.status.success() {
            return Err(Error::Io {
                context,
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

impl Interface for LinkInterface {
    fn name(&self) -> &str {
        &self.name
    }

    // the kernel refuses to rename a link that is up.
    fn rename(&mut self, new_name: &str) -> Result<()> {
        if self.name == new_name {
            return Ok(());
        }
        debug!("renaming link {} to {}", self.name, new_name);
        self.ip_link(&["set", "dev", &self.name, "down"])?;
        self.ip_link(&["set", "dev", &self.name, "name", new_name])?;
        self.name = new_name.to_string();
        self.ip_link(&["set", "dev", &self.name, "up"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_rename() {
        let mut intf = VirtualInterface::new("s1-eth1");
        assert!(!intf.is_loopback());
        intf.rename("veth0").unwrap();
        assert_eq!(intf.name(), "veth0");
        assert!(VirtualInterface::new(LOOPBACK).is_loopback());
    }
}
