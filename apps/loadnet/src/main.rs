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

use anyhow::{Context, Result};
use env_logger::Target;
use log::{error, info, LevelFilter};
use std::io::BufRead;
use std::path::PathBuf;
use std::thread;
use structopt::StructOpt;

use emulator::{Error, Session, Switch};

mod topology;
use topology::Topology;

#[derive(StructOpt)]
#[structopt(name = "loadnet", about = "Bring up a network of P4 switch simulators")]
struct Arguments {
    /// network description (YAML)
    #[structopt(short, long, parse(from_os_str))]
    topo_file: PathBuf,
    /// supported levels: off, error, warn, info, debug, trace
    #[structopt(short, long, default_value = "info")]
    log_level: LevelFilter,
    /// rename interfaces in memory only, leaving host links alone
    #[structopt(long)]
    virtual_links: bool,
}

// switches sharing the hardware model block in `start` until all of them
// arrived, so every switch starts on its own thread.
fn start_all(switches: &mut [Box<dyn Switch>]) -> Vec<(String, emulator::Result<()>)> {
    thread::scope(|scope| {
        let handles: Vec<_> = switches
            .iter_mut()
            .map(|switch| {
                let name = switch.name().to_string();
                (name, scope.spawn(move || switch.start(&[])))
            })
            .collect();
        handles
            .into_iter()
            .map(|(name, handle)| {
                let result = handle
                    .join()
                    .unwrap_or_else(|_| Err(Error::invalid_state(&name, "start panicked")));
                (name, result)
            })
            .collect()
    })
}

fn stop_all(switches: &mut [Box<dyn Switch>]) -> Result<()> {
    let mut failed = None;
    for switch in switches.iter_mut().rev() {
        if let Err(e) = switch.stop() {
            error!("{}", e);
            failed.get_or_insert(e);
        }
    }
    match failed {
        Some(e) => Err(e).context("stopping the network"),
        None => Ok(()),
    }
}

// on a failed start everything is stopped again and the first start error,
// naming its switch, is returned
fn bring_up(switches: &mut [Box<dyn Switch>]) -> Result<()> {
    let failure = start_all(switches)
        .into_iter()
        .find_map(|(name, result)| result.err().map(|e| (name, e)));
    if let Some((name, e)) = failure {
        if let Err(stop_error) = stop_all(switches) {
            error!("{:#}", stop_error);
        }
        return Err(e).with_context(|| format!("starting {}", name));
    }
    Ok(())
}

fn run(args: &Arguments) -> Result<()> {
    let topology = Topology::from_file(&args.topo_file)?;
    let mut session = Session::new(topology.session.clone());
    let mut switches = topology.build(&mut session, args.virtual_links)?;
    info!(
        "{} switches, {} on the shared hardware model",
        switches.len(),
        session.declared_models()
    );

    bring_up(&mut switches)?;

    println!("network is up, press Enter to stop");
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("reading stdin")?;

    stop_all(&mut switches)
}

fn main() {
    let args = Arguments::from_args();

    let _logger = env_logger::builder()
        .filter(Some("emulator"), args.log_level)
        .filter(Some("loadnet"), args.log_level)
        .target(Target::Stderr)
        .init();

    if let Err(e) = run(&args) {
        eprintln!("loadnet: {:#}", e);
        std::process::exit(1);
    }
}
