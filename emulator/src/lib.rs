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

//! Supervision of P4 switch simulators for network emulation.
//!
//! The hardware chip model runs all switches of a network in one shared
//! process; the software models run one process per switch.

mod device_config;
mod error;
mod intf;
mod options;
mod ports;
mod registry;
mod session;
mod supervisor;
pub mod switch;
mod toolchain;

use std::sync::{Mutex, MutexGuard};

pub use crate::device_config::{merge, DeviceConfig};
pub use crate::error::{Error, Result};
pub use crate::intf::{shared, Interface, Interfaces, LinkInterface, SharedInterfaces, VirtualInterface, LOOPBACK};
pub use crate::options::{
    Credentials, Output, SimpleSwitchGrpcOptions, SimpleSwitchOptions, TofinoModelOptions,
};
pub use crate::ports::{map_ports, PortMap, PortMapEntry, PORT_STRIDE};
pub use crate::registry::{Phase, Registration, Registry, SharedLauncher};
pub use crate::session::{Session, SessionConfig};
pub use crate::supervisor::{LaunchSpec, Readiness, ShutdownEvent, SupervisedProcess};
pub use crate::switch::{Configure, SimpleSwitch, SimpleSwitchGrpc, Switch, TofinoModel};
pub use crate::toolchain::{Toolchain, Toolchains, SIMPLE_SWITCH, SIMPLE_SWITCH_GRPC, TOFINO_MODEL};

// poisoned locks are recovered, the protected state stays consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
