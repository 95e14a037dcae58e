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

//! interface for the switches of an emulated network

use crate::error::Result;
use std::net::{Ipv4Addr, SocketAddr};

mod simple_switch;
mod simple_switch_grpc;
mod tofino_model;

pub use simple_switch::SimpleSwitch;
pub use simple_switch_grpc::SimpleSwitchGrpc;
pub use tofino_model::{
    ModelLauncher, ModelParticipant, ModelRegistry, Participants, SharedModelOptions, TofinoModel,
};

/// What the network emulation framework drives.
///
/// `start` blocks until the switch's control port is reachable. For switches
/// sharing one process, every `start` blocks until the last one launched it,
/// so those must be started from separate threads.
pub trait Switch: Send {
    fn name(&self) -> &str;

    /// Controllers are accepted for compatibility with the framework and ignored.
    fn start(&mut self, controllers: &[String]) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    /// Poll the control port; `false` if the process exited first.
    fn wait_for_ready(&self) -> Result<bool>;
}

/// Option validation, done once, before `start`.
pub trait Configure {
    type Options;

    fn configure(&mut self, options: Self::Options) -> Result<()>;
}

/// Control ports are polled on the loopback address.
pub(crate) fn local_port(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}
