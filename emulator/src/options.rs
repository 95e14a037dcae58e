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

//! options accepted by the switch variants
//!
//! constructed programmatically or read from the switch section of a
//! topology file. Options are only checked when a switch is configured.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::Stdio;

pub const DEFAULT_CLI_PORT: u16 = 8000;
pub const DEFAULT_DRU_SIM_TCP_PORT_BASE: u16 = 8001;
pub const LOG_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

/// Where a simulator's standard output or error goes.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Output {
    #[serde(rename = "devnull")]
    Null,
    Inherit,
    File(PathBuf),
}

impl Default for Output {
    fn default() -> Self {
        Output::Null
    }
}

impl Output {
    pub fn stdio(&self) -> Result<Stdio> {
        match self {
            Output::Null => Ok(Stdio::null()),
            Output::Inherit => Ok(Stdio::inherit()),
            Output::File(path) => File::create(path)
                .map(Stdio::from)
                .map_err(|e| Error::io(format!("creating {}", path.display()), &e)),
        }
    }
}

impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Output::Null => write!(f, "null"),
            Output::Inherit => write!(f, "inherit"),
            Output::File(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    /// contents of the credentials file, `username:password`.
    pub fn line(&self) -> String {
        format!("{}:{}", self.username, self.password)
    }
}

// passwords stay out of logs and error messages.
impl fmt::Display for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:***", self.username)
    }
}

/// Options of the hardware chip model.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TofinoModelOptions {
    /// device configuration fragment for this instance.
    pub p4_target_conf: PathBuf,
    pub cli_port: u16,
    pub cli_credentials: Option<Credentials>,
    pub dru_sim_tcp_port_base: u16,
    /// do not increment time automatically.
    pub time_disable: bool,
    /// detect port up/down events.
    pub port_monitor: bool,
    /// send every 10th deflect-on-drop packet to port 0.
    pub dod_test_mode: bool,
    /// packet processing logs; disabled when unset.
    pub log_dir: Option<PathBuf>,
    pub json_log_enable: bool,
    pub stdout: Output,
    pub stderr: Output,
}

impl Default for TofinoModelOptions {
    fn default() -> Self {
        Self {
            p4_target_conf: PathBuf::new(),
            cli_port: DEFAULT_CLI_PORT,
            cli_credentials: None,
            dru_sim_tcp_port_base: DEFAULT_DRU_SIM_TCP_PORT_BASE,
            time_disable: false,
            port_monitor: false,
            dod_test_mode: false,
            log_dir: None,
            json_log_enable: false,
            stdout: Output::default(),
            stderr: Output::default(),
        }
    }
}

impl TofinoModelOptions {
    pub fn new(p4_target_conf: &Path) -> Self {
        Self {
            p4_target_conf: p4_target_conf.to_path_buf(),
            ..Default::default()
        }
    }

    pub fn validate(&self, instance: &str) -> Result<()> {
        check_file(instance, "p4_target_conf", &self.p4_target_conf)?;
        check_port(instance, "cli_port", self.cli_port)?;
        check_port(instance, "dru_sim_tcp_port_base", self.dru_sim_tcp_port_base)?;
        if let Some(credentials) = &self.cli_credentials {
            if credentials.username.is_empty() {
                return Err(Error::invalid_config(
                    instance,
                    "cli_credentials",
                    "username is empty",
                ));
            }
            if credentials.username.contains(':') {
                return Err(Error::invalid_config(
                    instance,
                    "cli_credentials",
                    "username should not contain ':'",
                ));
            }
            if credentials.line().contains('\n') {
                return Err(Error::invalid_config(
                    instance,
                    "cli_credentials",
                    "credentials should fit on a single line",
                ));
            }
        }
        if let Some(log_dir) = &self.log_dir {
            check_dir(instance, "log_dir", log_dir)?;
        }
        Ok(())
    }
}

/// Options of the software switch model.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SimpleSwitchOptions {
    pub p4_target_conf: PathBuf,
    /// thrift runtime server port; allocated by the session when unset.
    pub thrift_port: Option<u16>,
    /// IPC socket for nanomsg pub/sub logs.
    pub nanolog_sock: Option<String>,
    pub log_console: bool,
    pub log_file: Option<PathBuf>,
    pub log_level: String,
    pub log_flush: bool,
    /// bytes of packet data to dump on receive and send.
    pub dump_packet_data: usize,
    /// pcap output directory; created if missing.
    pub pcap_dir: Option<PathBuf>,
    pub stdout: Output,
    pub stderr: Output,
}

impl Default for SimpleSwitchOptions {
    fn default() -> Self {
        Self {
            p4_target_conf: PathBuf::new(),
            thrift_port: None,
            nanolog_sock: None,
            log_console: false,
            log_file: None,
            log_level: "trace".to_string(),
            log_flush: false,
            dump_packet_data: 0,
            pcap_dir: None,
            stdout: Output::default(),
            stderr: Output::default(),
        }
    }
}

impl SimpleSwitchOptions {
    pub fn new(p4_target_conf: &Path) -> Self {
        Self {
            p4_target_conf: p4_target_conf.to_path_buf(),
            ..Default::default()
        }
    }

    pub fn validate(&self, instance: &str) -> Result<()> {
        check_file(instance, "p4_target_conf", &self.p4_target_conf)?;
        if let Some(port) = self.thrift_port {
            check_port(instance, "thrift_port", port)?;
        }
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(Error::invalid_config(
                instance,
                "log_level",
                format!("{} should be one of {:?}", self.log_level, LOG_LEVELS),
            ));
        }
        if let Some(pcap_dir) = &self.pcap_dir {
            std::fs::create_dir_all(pcap_dir).map_err(|e| {
                Error::invalid_config(instance, "pcap_dir", format!("{}: {}", pcap_dir.display(), e))
            })?;
        }
        Ok(())
    }
}

/// Options of the software switch model with a gRPC control plane.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SimpleSwitchGrpcOptions {
    #[serde(flatten)]
    pub base: SimpleSwitchOptions,
    /// address the gRPC server binds to, all addresses when unset.
    pub grpc_server_ip: Option<IpAddr>,
    /// gRPC server port; allocated by the session when unset.
    pub grpc_server_port: Option<u16>,
    pub grpc_server_ssl: bool,
    pub grpc_server_cacert: Option<PathBuf>,
    pub grpc_server_cert: Option<PathBuf>,
    pub grpc_server_key: Option<PathBuf>,
    pub grpc_server_with_client_auth: bool,
}

impl SimpleSwitchGrpcOptions {
    pub fn new(p4_target_conf: &Path) -> Self {
        Self {
            base: SimpleSwitchOptions::new(p4_target_conf),
            ..Default::default()
        }
    }

    /// The `--grpc-server-addr` value.
    pub fn grpc_server_addr(&self, port: u16) -> SocketAddr {
        let ip = self
            .grpc_server_ip
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        SocketAddr::new(ip, port)
    }

    /// Where readiness is polled: the bound address, or loopback when the
    /// server listens on all addresses.
    pub fn grpc_ready_addr(&self, port: u16) -> SocketAddr {
        match self.grpc_server_ip {
            Some(ip) if !ip.is_unspecified() => SocketAddr::new(ip, port),
            Some(IpAddr::V6(_)) => SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), port),
            _ => SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
        }
    }

    pub fn validate(&self, instance: &str) -> Result<()> {
        self.base.validate(instance)?;
        if let Some(port) = self.grpc_server_port {
            check_port(instance, "grpc_server_port", port)?;
        }
        for (field, path) in [
            ("grpc_server_cacert", &self.grpc_server_cacert),
            ("grpc_server_cert", &self.grpc_server_cert),
            ("grpc_server_key", &self.grpc_server_key),
        ] {
            if let Some(path) = path {
                check_file(instance, field, path)?;
            }
        }
        Ok(())
    }
}

// a TCP port must lie in (0, 65536); the upper bound is the type's.
fn check_port(instance: &str, field: &str, port: u16) -> Result<()> {
    if port == 0 {
        return Err(Error::invalid_config(instance, field, "must be in (0, 65536)"));
    }
    Ok(())
}

fn check_file(instance: &str, field: &str, path: &Path) -> Result<()> {
    if !path.is_file() {
        return Err(Error::invalid_config(
            instance,
            field,
            format!("{} is not a file", path.display()),
        ));
    }
    Ok(())
}

fn check_dir(instance: &str, field: &str, path: &Path) -> Result<()> {
    if !path.is_dir() {
        return Err(Error::invalid_config(
            instance,
            field,
            format!("{} is not a directory", path.display()),
        ));
    }
    Ok(())
}
