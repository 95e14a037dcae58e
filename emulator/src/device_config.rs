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

//! device configuration documents for the hardware model
//!
//! Every instance is described by a fragment holding exactly one chip, one
//! program and one switch options block. Co-hosted instances are merged into
//! a single document where the device of the k-th registered instance gets
//! id k.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::Path;

pub const CHIP_LIST: &str = "chip_list";
pub const P4_DEVICES: &str = "p4_devices";
pub const SWITCH_OPTIONS: &str = "switch_options";

/// field holding the device id in each of the three sections.
const CHIP_ID: &str = "instance";
const DEVICE_ID: &str = "device-id";

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub chip_list: Vec<Value>,
    #[serde(default)]
    pub p4_devices: Vec<Value>,
    #[serde(default)]
    pub switch_options: Vec<Value>,
    /// everything else in the document, carried over untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DeviceConfig {
    pub fn from_file(instance: &str, path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| Error::io(format!("{}: opening {}", instance, path.display()), &e))?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| Error::malformed(instance, format!("{}: {}", path.display(), e)))
    }

    pub fn from_str(instance: &str, config: &str) -> Result<Self> {
        serde_json::from_str(config).map_err(|e| Error::malformed(instance, e.to_string()))
    }

    pub fn num_devices(&self) -> usize {
        self.p4_devices.len()
    }

    /// Check the single-device shape of a per-instance fragment.
    pub fn validate_fragment(&self, instance: &str) -> Result<()> {
        for (section, entries) in self.sections() {
            if entries.len() != 1 {
                return Err(Error::malformed(
                    instance,
                    format!("`{}` must have exactly one entry, found {}", section, entries.len()),
                ));
            }
            if !entries[0].is_object() {
                return Err(Error::malformed(
                    instance,
                    format!("`{}` entry must be an object", section),
                ));
            }
        }
        Ok(())
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        let context = format!("writing device config {}", path.display());
        let mut file = File::create(path).map_err(|e| Error::io(context.clone(), &e))?;
        serde_json::to_writer_pretty(&mut file, self).map_err(|e| Error::Io {
            context: context.clone(),
            reason: e.to_string(),
        })?;
        file.flush().map_err(|e| Error::io(context, &e))
    }

    fn sections(&self) -> [(&'static str, &Vec<Value>); 3] {
        [
            (CHIP_LIST, &self.chip_list),
            (P4_DEVICES, &self.p4_devices),
            (SWITCH_OPTIONS, &self.switch_options),
        ]
    }
}

fn set_id(entry: &mut Value, key: &str, id: usize) {
    if let Value::Object(fields) = entry {
        fields.insert(key.to_string(), Value::from(id));
    }
}

/// Merge per-instance fragments, given in registration order.
///
/// The fragment at position k describes device k. Extra top-level keys are
/// carried over; two fragments that set the same key to different values
/// cannot be combined.
pub fn merge<'a, I>(fragments: I) -> Result<DeviceConfig>
where
    I: IntoIterator<Item = (&'a str, &'a DeviceConfig)>,
{
    let mut merged = DeviceConfig::default();
    let mut owners: HashMap<String, &str> = HashMap::new();

    for (index, (instance, fragment)) in fragments.into_iter().enumerate() {
        fragment.validate_fragment(instance)?;

        let mut chip = fragment.chip_list[0].clone();
        set_id(&mut chip, CHIP_ID, index);
        merged.chip_list.push(chip);

        let mut device = fragment.p4_devices[0].clone();
        set_id(&mut device, DEVICE_ID, index);
        merged.p4_devices.push(device);

        let mut options = fragment.switch_options[0].clone();
        set_id(&mut options, DEVICE_ID, index);
        merged.switch_options.push(options);

        for (key, value) in fragment.extra.iter() {
            match merged.extra.get(key) {
                Some(existing) if existing != value => {
                    return Err(Error::malformed(
                        instance,
                        format!(
                            "`{}` is {} here but {} in {}",
                            key, value, existing, owners[key]
                        ),
                    ));
                }
                Some(_) => {}
                None => {
                    merged.extra.insert(key.clone(), value.clone());
                    owners.insert(key.clone(), instance);
                }
            }
        }
    }
    Ok(merged)
}
