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

use std::fmt;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while configuring, launching and retiring simulator processes.
///
/// Errors are `Clone` because the outcome of a shared launch is handed to
/// every instance that waited on it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// An option failed validation when the switch was configured.
    InvalidConfiguration {
        instance: String,
        field: String,
        reason: String,
    },
    /// A device configuration fragment (or the merged document) is not well formed.
    MalformedDeviceConfig { instance: String, reason: String },
    /// Two co-hosted instances disagree on an option the shared process takes once.
    SharedOptionMismatch {
        option: String,
        first: (String, String),
        second: (String, String),
    },
    /// A port index does not fit in the instance's slice of the device port space.
    PortSpaceExhausted { instance: String, port: usize },
    /// The operating system refused to start the binary.
    ProcessLaunchFailure { binary: String, reason: String },
    /// The process exited before its control port accepted a connection.
    ReadinessFailure { instance: String, binary: String },
    /// The optional readiness deadline elapsed.
    ReadinessTimeout { instance: String, waited: Duration },
    /// The process went away after it was ready, without anybody stopping it.
    UnexpectedExit { instance: String, code: Option<i32> },
    /// A lifecycle operation was called out of order.
    InvalidState { instance: String, reason: String },
    Io { context: String, reason: String },
}

impl Error {
    pub fn invalid_config(instance: &str, field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            instance: instance.to_string(),
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    pub fn malformed(instance: &str, reason: impl Into<String>) -> Self {
        Self::MalformedDeviceConfig {
            instance: instance.to_string(),
            reason: reason.into(),
        }
    }

    pub fn invalid_state(instance: &str, reason: impl Into<String>) -> Self {
        Self::InvalidState {
            instance: instance.to_string(),
            reason: reason.into(),
        }
    }

    pub fn io(context: impl Into<String>, err: &std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            reason: err.to_string(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidConfiguration {
                instance,
                field,
                reason,
            } => write!(f, "{}: invalid `{}`: {}", instance, field, reason),
            Self::MalformedDeviceConfig { instance, reason } => {
                write!(f, "{}: malformed device config: {}", instance, reason)
            }
            Self::SharedOptionMismatch {
                option,
                first,
                second,
            } => write!(
                f,
                "shared option `{}` differs: {} has {}, {} has {}",
                option, first.0, first.1, second.0, second.1
            ),
            Self::PortSpaceExhausted { instance, port } => write!(
                f,
                "{}: port {} is outside of the instance port range",
                instance, port
            ),
            Self::ProcessLaunchFailure { binary, reason } => {
                write!(f, "failed to launch {}: {}", binary, reason)
            }
            Self::ReadinessFailure { instance, binary } => write!(
                f,
                "{}: {} exited before its control port became reachable",
                instance, binary
            ),
            Self::ReadinessTimeout { instance, waited } => write!(
                f,
                "{}: control port not reachable after {:?}",
                instance, waited
            ),
            Self::UnexpectedExit { instance, code } => match code {
                Some(code) => write!(f, "{}: exited unexpectedly with code {}", instance, code),
                None => write!(f, "{}: terminated unexpectedly by a signal", instance),
            },
            Self::InvalidState { instance, reason } => write!(f, "{}: {}", instance, reason),
            Self::Io { context, reason } => write!(f, "{}: {}", context, reason),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_instance_and_field() {
        let err = Error::invalid_config("s1", "cli_port", "must be in (0, 65536)");
        assert_eq!(err.to_string(), "s1: invalid `cli_port`: must be in (0, 65536)");

        let err = Error::SharedOptionMismatch {
            option: "cli_port".into(),
            first: ("s1".into(), "8000".into()),
            second: ("s2".into(), "9000".into()),
        };
        assert_eq!(
            err.to_string(),
            "shared option `cli_port` differs: s1 has 8000, s2 has 9000"
        );
    }
}
