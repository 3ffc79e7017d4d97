//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use playground::app::Playground;
use playground::config::Config;
use playground::control::BrokerMode;
use playground::runtime::{
    ExecSpec, ExitState, LaunchProfile, ProbeReport, ProcessOutput, Runtime, RuntimeError,
    UnitState,
};
use playground::sandbox::{AddressingStrategy, MemoryStore};
use tempfile::TempDir;

/// Runtime that keeps units in memory. `sh -c "echo ..."` prints its argument.
#[derive(Debug, Default)]
pub struct MemoryRuntime {
    pub units: Mutex<HashMap<String, UnitState>>,
    pub addresses: Mutex<HashMap<String, Ipv4Addr>>,
    pub commands: Mutex<Vec<String>>,
}

impl MemoryRuntime {
    pub fn set_address(&self, unit: &str, addr: Ipv4Addr) {
        self.addresses.lock().unwrap().insert(unit.to_string(), addr);
    }

    pub fn has_unit(&self, unit: &str) -> bool {
        self.units.lock().unwrap().contains_key(unit)
    }
}

fn output(stdout: String) -> ProcessOutput {
    ProcessOutput {
        stdout: stdout.into_bytes(),
        stderr: Vec::new(),
        exit: ExitState::Exited { code: 0 },
        truncated: false,
    }
}

impl Runtime for MemoryRuntime {
    fn state(&self, unit: &str) -> Result<UnitState, RuntimeError> {
        Ok(self
            .units
            .lock()
            .unwrap()
            .get(unit)
            .copied()
            .unwrap_or(UnitState::Missing))
    }

    fn start(&self, unit: &str) -> Result<(), RuntimeError> {
        self.units
            .lock()
            .unwrap()
            .insert(unit.to_string(), UnitState::Running);
        Ok(())
    }

    fn stop(&self, unit: &str) -> Result<(), RuntimeError> {
        if let Some(state) = self.units.lock().unwrap().get_mut(unit) {
            *state = UnitState::Stopped;
        }
        Ok(())
    }

    fn delete(&self, unit: &str) -> Result<(), RuntimeError> {
        self.units.lock().unwrap().remove(unit);
        Ok(())
    }

    fn launch(&self, unit: &str, _profile: &LaunchProfile) -> Result<(), RuntimeError> {
        self.start(unit)
    }

    fn exec(&self, _unit: &str, spec: &ExecSpec<'_>) -> Result<ProcessOutput, RuntimeError> {
        let command = spec.argv.last().cloned().unwrap_or_default();
        self.commands.lock().unwrap().push(command.clone());
        let stdout = match command.strip_prefix("echo ") {
            Some(rest) => format!("{}\n", rest),
            None => String::new(),
        };
        Ok(output(stdout))
    }

    fn push_file(&self, _unit: &str, _local: &Path, _remote: &str) -> Result<(), RuntimeError> {
        Ok(())
    }

    fn pull_file(&self, _unit: &str, _remote: &str, _local: &Path) -> Result<(), RuntimeError> {
        Ok(())
    }

    fn address(&self, unit: &str) -> Result<Option<Ipv4Addr>, RuntimeError> {
        Ok(self.addresses.lock().unwrap().get(unit).copied())
    }

    fn probe(&self, _template: &str) -> ProbeReport {
        ProbeReport::ready("memory runtime")
    }
}

/// Config that runs everything locally against an in-memory registry.
pub fn test_config(storage: &Path, upstream_port: u16) -> Config {
    let mut config = Config::default();
    config.registry.database = ":memory:".to_string();
    config.registry.storage_root = storage.to_string_lossy().into_owned();
    config.broker.mode = BrokerMode::Disabled;
    config.broker.sockets = Vec::new();
    config.runtime.settle_secs = 0;
    config.addressing.strategy = AddressingStrategy::Queried;
    config.proxy.upstream_port = upstream_port;
    config
}

pub struct Harness {
    pub app: Arc<Playground>,
    pub runtime: Arc<MemoryRuntime>,
    pub storage: TempDir,
}

pub fn harness(upstream_port: u16) -> Harness {
    let storage = TempDir::new().unwrap();
    let runtime = Arc::new(MemoryRuntime::default());
    let app = Playground::with_runtime(
        test_config(storage.path(), upstream_port),
        runtime.clone(),
        Arc::new(MemoryStore::new()),
    )
    .unwrap();
    Harness {
        app: Arc::new(app),
        runtime,
        storage,
    }
}
