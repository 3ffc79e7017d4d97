//! In-memory runtime for unit tests.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Mutex;

use super::{
    ExecSpec, ExitState, LaunchProfile, ProbeReport, ProcessOutput, Runtime, RuntimeError,
    UnitState,
};

#[derive(Debug, Default)]
pub(crate) struct FakeRuntime {
    pub units: Mutex<HashMap<String, UnitState>>,
    pub addresses: Mutex<HashMap<String, Ipv4Addr>>,
    pub execs: Mutex<Vec<(String, Vec<String>, Option<String>, Option<Vec<u8>>)>>,
    pub replies: Mutex<VecDeque<ProcessOutput>>,
    pub launched: Mutex<Vec<String>>,
    /// When set, `start` leaves the unit stopped.
    pub start_is_noop: bool,
    /// When set, every call fails as if the tool were missing.
    pub broken: bool,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_unit(self, unit: &str, state: UnitState) -> Self {
        self.units.lock().unwrap().insert(unit.to_string(), state);
        self
    }

    pub fn reply(&self, stdout: &str, code: i32) {
        self.replies.lock().unwrap().push_back(ProcessOutput {
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
            exit: ExitState::Exited { code },
            truncated: false,
        });
    }

    pub fn state_of(&self, unit: &str) -> UnitState {
        self.units
            .lock()
            .unwrap()
            .get(unit)
            .copied()
            .unwrap_or(UnitState::Missing)
    }

    pub fn exec_argvs(&self) -> Vec<Vec<String>> {
        self.execs
            .lock()
            .unwrap()
            .iter()
            .map(|(_, argv, _, _)| argv.clone())
            .collect()
    }

    fn check(&self) -> Result<(), RuntimeError> {
        if self.broken {
            return Err(RuntimeError::NotInstalled {
                binary: "fake".to_string(),
            });
        }
        Ok(())
    }
}

impl Runtime for FakeRuntime {
    fn state(&self, unit: &str) -> Result<UnitState, RuntimeError> {
        self.check()?;
        Ok(self.state_of(unit))
    }

    fn start(&self, unit: &str) -> Result<(), RuntimeError> {
        self.check()?;
        if !self.start_is_noop {
            self.units
                .lock()
                .unwrap()
                .insert(unit.to_string(), UnitState::Running);
        }
        Ok(())
    }

    fn stop(&self, unit: &str) -> Result<(), RuntimeError> {
        self.check()?;
        if let Some(state) = self.units.lock().unwrap().get_mut(unit) {
            *state = UnitState::Stopped;
        }
        Ok(())
    }

    fn delete(&self, unit: &str) -> Result<(), RuntimeError> {
        self.check()?;
        self.units.lock().unwrap().remove(unit);
        Ok(())
    }

    fn launch(&self, unit: &str, _profile: &LaunchProfile) -> Result<(), RuntimeError> {
        self.check()?;
        self.launched.lock().unwrap().push(unit.to_string());
        self.units
            .lock()
            .unwrap()
            .insert(unit.to_string(), UnitState::Running);
        Ok(())
    }

    fn exec(&self, unit: &str, spec: &ExecSpec<'_>) -> Result<ProcessOutput, RuntimeError> {
        self.check()?;
        self.execs.lock().unwrap().push((
            unit.to_string(),
            spec.argv.to_vec(),
            spec.cwd.map(str::to_string),
            spec.stdin.map(<[u8]>::to_vec),
        ));
        Ok(self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ProcessOutput {
                stdout: Vec::new(),
                stderr: Vec::new(),
                exit: ExitState::Exited { code: 0 },
                truncated: false,
            }))
    }

    fn push_file(&self, _unit: &str, _local: &Path, _remote: &str) -> Result<(), RuntimeError> {
        self.check()
    }

    fn pull_file(&self, _unit: &str, _remote: &str, _local: &Path) -> Result<(), RuntimeError> {
        self.check()
    }

    fn address(&self, unit: &str) -> Result<Option<Ipv4Addr>, RuntimeError> {
        self.check()?;
        Ok(self.addresses.lock().unwrap().get(unit).copied())
    }

    fn probe(&self, _template: &str) -> ProbeReport {
        ProbeReport::ready("fake runtime")
    }
}
