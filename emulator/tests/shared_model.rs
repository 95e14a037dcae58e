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

use emulator::{
    shared, Error, Interfaces, Phase, Result, Session, SessionConfig, SimpleSwitchGrpcOptions,
    SimpleSwitchOptions, Switch, TofinoModel, TofinoModelOptions, Toolchain, Toolchains, VirtualInterface, LOOPBACK,
};
use serde_json::json;
use std::fs;
use std::io::Write;
use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

// a stand-in for the simulators: records its arguments, then runs `tail`
fn fake_model(dir: &Path, tail: &str) -> PathBuf {
    let path = dir.join("model.sh");
    let mut file = fs::File::create(&path).unwrap();
    writeln!(file, "#!/bin/sh").unwrap();
    writeln!(file, "echo \"$@\" > {}", dir.join("args").display()).unwrap();
    writeln!(file, "{}", tail).unwrap();
    file.sync_all().unwrap();
    drop(file);
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn recorded_args(dir: &Path) -> Vec<String> {
    let path = dir.join("args");
    let started = Instant::now();
    loop {
        if let Ok(args) = fs::read_to_string(&path) {
            if args.ends_with('\n') {
                return args.split_whitespace().map(String::from).collect();
            }
        }
        assert!(started.elapsed() < Duration::from_secs(10), "model never ran");
        thread::sleep(Duration::from_millis(10));
    }
}

fn session(model: &Path) -> Session {
    let toolchain = Toolchain::new(model, "");
    Session::new(SessionConfig {
        toolchains: Some(Toolchains {
            tofino_model: Some(toolchain.clone()),
            simple_switch: Some(toolchain),
            simple_switch_grpc: None,
        }),
        ..Default::default()
    })
}

fn fragment(dir: &Path, name: &str, chips: usize) -> PathBuf {
    let chip = json!({"chip_family": "tofino", "instance": 0, "pcie_sysfs_prefix": "/sys/devices"});
    let chip_list = vec![chip; chips];
    let config = json!({
        "chip_list": chip_list,
        "p4_devices": [{"device-id": 0, "p4_programs": [{"program-name": name}]}],
        "switch_options": [{"device-id": 0, "model": true}],
        "instance": 0,
    });
    let path = dir.join(format!("{}.conf", name));
    fs::write(&path, config.to_string()).unwrap();
    path
}

fn interfaces(name: &str, ports: &[usize]) -> emulator::SharedInterfaces {
    let mut intfs = Interfaces::new();
    intfs.insert(0, VirtualInterface::boxed(LOOPBACK));
    for port in ports {
        intfs.insert(*port, VirtualInterface::boxed(&format!("{}-eth{}", name, port)));
    }
    shared(intfs)
}

fn names(intfs: &emulator::SharedInterfaces) -> Vec<String> {
    intfs
        .lock()
        .unwrap()
        .values()
        .map(|intf| intf.name().to_string())
        .collect()
}

// starts every switch on its own thread, as the framework must
fn start_all(switches: &mut [TofinoModel]) -> Vec<Result<()>> {
    thread::scope(|scope| {
        let handles: Vec<_> = switches
            .iter_mut()
            .map(|switch| scope.spawn(move || switch.start(&[])))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

struct Network {
    dir: TempDir,
    session: Session,
    switches: Vec<TofinoModel>,
    intfs: Vec<emulator::SharedInterfaces>,
}

fn network(tail: &str, options: impl Fn(&str, &Path) -> TofinoModelOptions) -> Network {
    let dir = tempfile::tempdir().unwrap();
    let model = fake_model(dir.path(), tail);
    let mut session = session(&model);
    let mut switches = Vec::new();
    let mut intfs = Vec::new();
    for (name, ports) in [("s1", vec![1, 2]), ("s2", vec![1])] {
        let conf = fragment(dir.path(), name, 1);
        let switch_intfs = interfaces(name, &ports);
        switches.push(
            session
                .tofino_model(name, switch_intfs.clone(), options(name, &conf))
                .unwrap(),
        );
        intfs.push(switch_intfs);
    }
    Network {
        dir,
        session,
        switches,
        intfs,
    }
}

#[test]
fn switches_share_one_process() {
    let _logger = env_logger::builder().is_test(true).try_init();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let cli_port = listener.local_addr().unwrap().port();
    let mut net = network("exec sleep 30", |_, conf| TofinoModelOptions {
        cli_port,
        ..TofinoModelOptions::new(conf)
    });
    assert_eq!(net.session.declared_models(), 2);

    for result in start_all(&mut net.switches) {
        result.unwrap();
    }
    let models = net.session.models().clone();
    assert_eq!(models.launches(), 1);
    assert_eq!(models.phase(), Phase::Running);
    let process = models.handle().unwrap();
    assert!(process.is_running());

    // interfaces follow the device index each switch registered with
    let mut indices = Vec::new();
    for (switch, intfs) in net.switches.iter().zip(net.intfs.iter()) {
        let index = switch.index().unwrap();
        indices.push(index);
        let expected: Vec<String> = match switch.name() {
            "s1" => vec![
                LOOPBACK.to_string(),
                format!("veth{}", 512 * index + 2 * (512 * index)),
                format!("veth{}", 512 * index + 2 * (512 * index + 1)),
            ],
            _ => vec![
                LOOPBACK.to_string(),
                format!("veth{}", 512 * index + 2 * (512 * index)),
            ],
        };
        assert_eq!(names(intfs), expected);
        assert!(switch.wait_for_ready().unwrap());
    }
    indices.sort_unstable();
    assert_eq!(indices, vec![0, 1]);

    let args = recorded_args(net.dir.path());
    let flag = |name: &str| {
        let position = args.iter().position(|a| a == name).unwrap();
        args[position + 1].clone()
    };
    assert_eq!(flag("--num-of-chips"), "2");
    assert_eq!(flag("--cli-port"), cli_port.to_string());
    assert_eq!(args.last().unwrap(), "--logs-disable");

    let merged: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(flag("--p4-target-config")).unwrap()).unwrap();
    assert_eq!(merged["chip_list"][1]["instance"], 1);
    assert_eq!(merged["p4_devices"][1]["device-id"], 1);
    assert_eq!(merged["switch_options"][0]["device-id"], 0);
    let port_map: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(flag("-f")).unwrap()).unwrap();
    assert_eq!(port_map["PortToVeth"].as_array().unwrap().len(), 3);

    net.switches[0].stop().unwrap();
    assert!(process.is_running());
    assert_eq!(models.phase(), Phase::Draining);
    net.switches[1].stop().unwrap();
    assert_eq!(models.phase(), Phase::Terminated);
    assert!(process.shutdown_event().unwrap().is_expected());
    assert!(models.handle().is_none());
}

#[test]
fn every_switch_sees_the_readiness_failure() {
    let _logger = env_logger::builder().is_test(true).try_init();
    let cli_port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let mut net = network("exit 1", |_, conf| TofinoModelOptions {
        cli_port,
        ..TofinoModelOptions::new(conf)
    });

    let results = start_all(&mut net.switches);
    let first = results[0].clone().unwrap_err();
    assert!(matches!(first, Error::ReadinessFailure { .. }));
    assert!(results.iter().all(|r| r.as_ref().err() == Some(&first)));
    assert_eq!(net.session.model_phase(), Phase::Failed);
    assert_eq!(net.session.models().launches(), 1);

    for switch in net.switches.iter_mut() {
        switch.stop().unwrap();
    }
    assert_eq!(net.session.model_phase(), Phase::Terminated);
}

#[test]
fn mismatched_shared_options_abort_the_launch() {
    let mut net = network("exec sleep 30", |name, conf| {
        let mut options = TofinoModelOptions::new(conf);
        if name == "s1" {
            options.cli_port = 9000;
        }
        options
    });

    let results = start_all(&mut net.switches);
    for result in &results {
        assert!(matches!(
            result,
            Err(Error::SharedOptionMismatch { option, .. }) if option == "cli_port"
        ));
    }
    // the model never ran
    assert!(!net.dir.path().join("args").exists());
    assert_eq!(names(&net.intfs[1]), vec![LOOPBACK, "s2-eth1"]);
    for switch in net.switches.iter_mut() {
        switch.stop().unwrap();
    }
}

#[test]
fn malformed_fragment_names_its_switch() {
    let dir = tempfile::tempdir().unwrap();
    let model = fake_model(dir.path(), "exec sleep 30");
    let mut session = session(&model);
    let good = fragment(dir.path(), "s1", 1);
    let bad = fragment(dir.path(), "s2", 2);
    let mut switches = vec![
        session
            .tofino_model("s1", interfaces("s1", &[1]), TofinoModelOptions::new(&good))
            .unwrap(),
        session
            .tofino_model("s2", interfaces("s2", &[1]), TofinoModelOptions::new(&bad))
            .unwrap(),
    ];
    for result in start_all(&mut switches) {
        assert!(matches!(
            result,
            Err(Error::MalformedDeviceConfig { ref instance, .. }) if instance == "s2"
        ));
    }
    // every switch declared to the session must start before anybody launches
    assert!(session
        .tofino_model("s3", interfaces("s3", &[1]), TofinoModelOptions::new(&good))
        .is_err());
}

#[test]
fn software_switch_runs_its_own_process() {
    let _logger = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let model = fake_model(dir.path(), "exec sleep 30");
    let mut session = session(&model);
    let conf = fragment(dir.path(), "s1", 1);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let thrift_port = listener.local_addr().unwrap().port();

    let mut switch = session
        .simple_switch(
            "s1",
            interfaces("s1", &[1, 3]),
            SimpleSwitchOptions {
                thrift_port: Some(thrift_port),
                ..SimpleSwitchOptions::new(&conf)
            },
        )
        .unwrap();
    switch.start(&[]).unwrap();
    assert!(switch.pid().is_some());
    assert!(switch.wait_for_ready().unwrap());

    let args = recorded_args(dir.path());
    assert_eq!(&args[..4], &["-i", "1@s1-eth1", "-i", "3@s1-eth3"]);
    assert_eq!(args.last().unwrap(), &conf.display().to_string());
    assert!(matches!(switch.start(&[]), Err(Error::InvalidState { .. })));

    switch.stop().unwrap();
    assert!(switch.pid().is_none());
    // the shared model is untouched by software switches
    assert_eq!(session.model_phase(), Phase::Idle);
}

#[test]
fn grpc_switch_is_ready_on_its_grpc_port() {
    let _logger = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let model = fake_model(dir.path(), "exec sleep 30");
    let mut session = Session::new(SessionConfig {
        ready_timeout_ms: Some(5000),
        toolchains: Some(Toolchains {
            tofino_model: None,
            simple_switch: None,
            simple_switch_grpc: Some(Toolchain::new(&model, "")),
        }),
        ..Default::default()
    });
    let conf = fragment(dir.path(), "s2", 1);
    let grpc = TcpListener::bind("127.0.0.1:0").unwrap();
    let grpc_port = grpc.local_addr().unwrap().port();
    // nothing listens on the thrift port
    let thrift_port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let mut options = SimpleSwitchGrpcOptions::new(&conf);
    options.base.thrift_port = Some(thrift_port);
    options.grpc_server_port = Some(grpc_port);
    let mut switch = session
        .simple_switch_grpc("s2", interfaces("s2", &[1]), options)
        .unwrap();
    switch.start(&[]).unwrap();
    assert_eq!(switch.wait_for_ready(), Ok(true));

    let args = recorded_args(dir.path());
    let separator = args.iter().position(|a| a == "--").unwrap();
    let grpc_addr = format!("0.0.0.0:{}", grpc_port);
    assert_eq!(&args[separator..], &["--", "--grpc-server-addr", grpc_addr.as_str()]);

    switch.stop().unwrap();
    assert_eq!(switch.wait_for_ready(), Ok(false));
}
