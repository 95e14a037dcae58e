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

use super::{Configure, SimpleSwitch, Switch};
use crate::error::{Error, Result};
use crate::intf::SharedInterfaces;
use crate::options::SimpleSwitchGrpcOptions;
use crate::toolchain::{Toolchains, SIMPLE_SWITCH_GRPC};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// The software switch with a P4Runtime server; ready once the gRPC port is.
pub struct SimpleSwitchGrpc {
    inner: SimpleSwitch,
    options: Option<SimpleSwitchGrpcOptions>,
}

impl SimpleSwitchGrpc {
    pub fn new(
        name: &str,
        intfs: SharedInterfaces,
        toolchains: Arc<Toolchains>,
        ready_timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: SimpleSwitch::new(name, intfs, toolchains, ready_timeout),
            options: None,
        }
    }

    pub fn grpc_port(&self) -> Option<u16> {
        self.options.as_ref().and_then(|o| o.grpc_server_port)
    }

    pub fn thrift_port(&self) -> Option<u16> {
        self.inner.thrift_port()
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.pid()
    }

    fn grpc_options(&self) -> Result<(&SimpleSwitchGrpcOptions, u16)> {
        let options = self
            .options
            .as_ref()
            .ok_or_else(|| Error::invalid_state(self.name(), "not configured"))?;
        let port = options
            .grpc_server_port
            .ok_or_else(|| Error::invalid_config(self.name(), "grpc_server_port", "not set"))?;
        Ok((options, port))
    }

    fn ready_addr(&self) -> Result<SocketAddr> {
        let (options, port) = self.grpc_options()?;
        Ok(options.grpc_ready_addr(port))
    }

    /// Target options, passed after `--`.
    pub fn target_args(&self) -> Result<Vec<String>> {
        let (options, port) = self.grpc_options()?;
        let mut args = vec![
            "--grpc-server-addr".to_string(),
            options.grpc_server_addr(port).to_string(),
        ];
        if options.grpc_server_ssl {
            args.push("--grpc-server-ssl".to_string());
        }
        for (flag, path) in [
            ("--grpc-server-cacert", &options.grpc_server_cacert),
            ("--grpc-server-cert", &options.grpc_server_cert),
            ("--grpc-server-key", &options.grpc_server_key),
        ] {
            if let Some(path) = path {
                args.push(flag.to_string());
                args.push(path.display().to_string());
            }
        }
        if options.grpc_server_with_client_auth {
            args.push("--grpc-server-with-client-auth".to_string());
        }
        Ok(args)
    }
}

impl Configure for SimpleSwitchGrpc {
    type Options = SimpleSwitchGrpcOptions;

    fn configure(&mut self, options: SimpleSwitchGrpcOptions) -> Result<()> {
        options.validate(self.name())?;
        self.inner.configure(options.base.clone())?;
        self.options = Some(options);
        Ok(())
    }
}

impl Switch for SimpleSwitchGrpc {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn start(&mut self, _controllers: &[String]) -> Result<()> {
        let extra = self.target_args()?;
        let ready_addr = self.ready_addr()?;
        self.inner.launch(SIMPLE_SWITCH_GRPC, &extra, ready_addr)
    }

    fn stop(&mut self) -> Result<()> {
        self.inner.stop()
    }

    fn wait_for_ready(&self) -> Result<bool> {
        self.inner.poll(self.ready_addr()?)
    }
}
