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

//! locating the simulator binaries

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

pub const TOFINO_MODEL: &str = "tofino-model";
pub const SIMPLE_SWITCH: &str = "simple_switch";
pub const SIMPLE_SWITCH_GRPC: &str = "simple_switch_grpc";

/// A simulator binary and the library path it runs with.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Toolchain {
    pub executable: PathBuf,
    #[serde(default)]
    pub ld_library_path: String,
}

impl Toolchain {
    pub fn new(executable: &Path, ld_library_path: &str) -> Self {
        Self {
            executable: executable.to_path_buf(),
            ld_library_path: ld_library_path.to_string(),
        }
    }

    pub fn display_name(&self) -> String {
        self.executable.display().to_string()
    }
}

/// The binaries of the three switch variants.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Toolchains {
    pub tofino_model: Option<Toolchain>,
    pub simple_switch: Option<Toolchain>,
    pub simple_switch_grpc: Option<Toolchain>,
}

impl Toolchains {
    /// Resolve whatever the environment provides. Missing binaries only
    /// become an error when a switch of that kind is started.
    pub fn from_env() -> Self {
        Self {
            tofino_model: tofino_model().ok(),
            simple_switch: bmv2_model(SIMPLE_SWITCH).ok(),
            simple_switch_grpc: bmv2_model(SIMPLE_SWITCH_GRPC).ok(),
        }
    }

    pub fn get(&self, binary: &str) -> Result<&Toolchain> {
        let toolchain = match binary {
            TOFINO_MODEL => &self.tofino_model,
            SIMPLE_SWITCH => &self.simple_switch,
            SIMPLE_SWITCH_GRPC => &self.simple_switch_grpc,
            _ => &None,
        };
        toolchain.as_ref().ok_or_else(|| Error::ProcessLaunchFailure {
            binary: binary.to_string(),
            reason: "not found, check the installation environment".to_string(),
        })
    }
}

fn first_var(names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| env::var(name).ok())
        .find(|value| !value.is_empty())
}

/// `tofino-model` from the SDE install tree, `$BFSDE_INSTALL` or `$SDE_INSTALL`.
pub fn tofino_model() -> Result<Toolchain> {
    let install = first_var(&["BFSDE_INSTALL", "SDE_INSTALL"]).ok_or_else(|| {
        Error::ProcessLaunchFailure {
            binary: TOFINO_MODEL.to_string(),
            reason: "neither BFSDE_INSTALL nor SDE_INSTALL is set".to_string(),
        }
    })?;
    let install = PathBuf::from(install);
    Ok(Toolchain {
        executable: install.join("bin").join(TOFINO_MODEL),
        ld_library_path: format!("/usr/local/lib:{}", install.join("lib").display()),
    })
}

/// A BMv2 model from `$PATH`, or from `$BMV2_INSTALL/bin`.
pub fn bmv2_model(name: &str) -> Result<Toolchain> {
    let mut dirs: Vec<PathBuf> = env::var_os("PATH")
        .map(|paths| env::split_paths(&paths).collect())
        .unwrap_or_default();
    if let Some(install) = first_var(&["BMV2_INSTALL"]) {
        dirs.push(PathBuf::from(install).join("bin"));
    }
    dirs.iter()
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
        .map(|executable| Toolchain {
            executable,
            ld_library_path: String::new(),
        })
        .ok_or_else(|| Error::ProcessLaunchFailure {
            binary: name.to_string(),
            reason: "not found in PATH or BMV2_INSTALL".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_toolchain_names_binary() {
        let toolchains = Toolchains {
            tofino_model: Some(Toolchain::new(Path::new("/opt/sde/bin/tofino-model"), "")),
            simple_switch: None,
            simple_switch_grpc: None,
        };
        assert!(toolchains.get(TOFINO_MODEL).is_ok());
        assert!(matches!(
            toolchains.get(SIMPLE_SWITCH),
            Err(Error::ProcessLaunchFailure { ref binary, .. }) if binary == SIMPLE_SWITCH
        ));
    }

    #[test]
    fn read_yaml_toolchains() {
        let toolchains: Toolchains = serde_yaml::from_str(
            "---
tofino_model:
  executable: /opt/sde/install/bin/tofino-model
  ld_library_path: /usr/local/lib:/opt/sde/install/lib
simple_switch: ~
simple_switch_grpc:
  executable: /usr/local/bin/simple_switch_grpc
",
        )
        .unwrap();
        assert_eq!(
            toolchains.tofino_model.unwrap().ld_library_path,
            "/usr/local/lib:/opt/sde/install/lib"
        );
        assert!(toolchains.simple_switch.is_none());
        assert_eq!(toolchains.simple_switch_grpc.unwrap().ld_library_path, "");
    }
}
