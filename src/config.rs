use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use crate::control::BrokerMode;
use crate::runtime::{ExecLimits, LaunchProfile};
use crate::sandbox::{AddressingStrategy, NamingScheme, Subnet};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub addressing: AddressingConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub exec: ExecConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Container client binary
    #[serde(default = "default_binary")]
    pub binary: String,

    /// Invoke the client through `sudo -n`
    #[serde(default)]
    pub use_sudo: bool,

    /// Prefix for runtime unit names
    #[serde(default = "default_unit_prefix")]
    pub unit_prefix: String,

    #[serde(default)]
    pub naming: NamingScheme,

    /// Base image units are launched from
    #[serde(default = "default_template")]
    pub template: String,

    #[serde(default = "default_cpu")]
    pub cpu: String,

    #[serde(default = "default_memory")]
    pub memory: String,

    #[serde(default = "default_processes")]
    pub processes: u32,

    /// Allow nested containers inside units
    #[serde(default)]
    pub nesting: bool,

    #[serde(default = "default_syscall_intercepts")]
    pub syscall_intercepts: Vec<String>,

    /// Directory inside the unit all file paths are anchored under
    #[serde(default = "default_root")]
    pub root: String,

    #[serde(default = "default_status_timeout")]
    pub status_timeout_secs: u64,

    /// Timeout for launch, delete and file transfer calls
    #[serde(default = "default_op_timeout")]
    pub op_timeout_secs: u64,

    /// Wait after issuing start before the first status check
    #[serde(default = "default_settle")]
    pub settle_secs: u64,

    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,

    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: usize,

    /// Directories skipped by tree listings
    #[serde(default = "default_ignored_dirs")]
    pub ignored_dirs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressingConfig {
    #[serde(default)]
    pub strategy: AddressingStrategy,

    /// Private subnet for deterministic addresses, CIDR notation
    #[serde(default = "default_subnet")]
    pub subnet: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_database")]
    pub database: String,

    /// Parent of per-sandbox storage directories
    #[serde(default = "default_storage_root")]
    pub storage_root: String,

    #[serde(default = "default_id_length")]
    pub id_length: usize,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub mode: BrokerMode,

    /// Candidate sockets, tried in order
    #[serde(default = "default_sockets")]
    pub sockets: Vec<String>,

    /// Socket the daemon binds
    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    #[serde(default = "default_socket_mode")]
    pub socket_mode: u32,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,

    /// Create answers only after launch, settle and helper have finished
    #[serde(default = "default_create_timeout_secs")]
    pub create_timeout_secs: u64,

    /// How long the daemon waits for a request line
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Attempts per socket
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    /// Executable run after a unit is created
    #[serde(default)]
    pub create_helper: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecConfig {
    #[serde(default = "default_exec_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_output")]
    pub max_output_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Address the HTTP server binds
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Port sandboxes serve HTTP on
    #[serde(default = "default_upstream_port")]
    pub upstream_port: u16,

    #[serde(default = "default_proxy_connect")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_proxy_read")]
    pub read_timeout_secs: u64,

    #[serde(default = "default_max_body")]
    pub max_body_bytes: usize,
}

fn default_binary() -> String {
    "lxc".to_string()
}

fn default_unit_prefix() -> String {
    "pg-".to_string()
}

fn default_template() -> String {
    "playground-base".to_string()
}

fn default_cpu() -> String {
    "1".to_string()
}

fn default_memory() -> String {
    "512MB".to_string()
}

fn default_processes() -> u32 {
    256
}

fn default_syscall_intercepts() -> Vec<String> {
    vec!["mknod".to_string(), "setxattr".to_string()]
}

fn default_root() -> String {
    "/home/sandbox".to_string()
}

fn default_status_timeout() -> u64 {
    5
}

fn default_op_timeout() -> u64 {
    120
}

fn default_settle() -> u64 {
    3
}

fn default_start_timeout() -> u64 {
    30
}

fn default_max_file_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_ignored_dirs() -> Vec<String> {
    [".git", "node_modules", "vendor", "__pycache__", ".cache"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_subnet() -> String {
    "10.200.0.0/16".to_string()
}

fn default_database() -> String {
    "~/.local/share/playground/registry.db".to_string()
}

fn default_storage_root() -> String {
    "~/.local/share/playground/sandboxes".to_string()
}

fn default_id_length() -> usize {
    12
}

fn default_max_attempts() -> usize {
    16
}

fn default_sockets() -> Vec<String> {
    vec![
        "/run/playground/broker.sock".to_string(),
        "/var/run/playground/broker.sock".to_string(),
        "/tmp/playground-broker.sock".to_string(),
    ]
}

fn default_socket_path() -> String {
    "/run/playground/broker.sock".to_string()
}

fn default_socket_mode() -> u32 {
    0o660
}

fn default_connect_timeout_ms() -> u64 {
    500
}

fn default_response_timeout_ms() -> u64 {
    1000
}

fn default_create_timeout_secs() -> u64 {
    120
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_attempts() -> u32 {
    3
}

fn default_log_dir() -> String {
    "/var/log/playground".to_string()
}

fn default_exec_timeout() -> u64 {
    20
}

fn default_max_output() -> usize {
    200 * 1024
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_upstream_port() -> u16 {
    80
}

fn default_proxy_connect() -> u64 {
    5
}

fn default_proxy_read() -> u64 {
    30
}

fn default_max_body() -> usize {
    32 * 1024 * 1024
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            use_sudo: false,
            unit_prefix: default_unit_prefix(),
            naming: NamingScheme::default(),
            template: default_template(),
            cpu: default_cpu(),
            memory: default_memory(),
            processes: default_processes(),
            nesting: false,
            syscall_intercepts: default_syscall_intercepts(),
            root: default_root(),
            status_timeout_secs: default_status_timeout(),
            op_timeout_secs: default_op_timeout(),
            settle_secs: default_settle(),
            start_timeout_secs: default_start_timeout(),
            max_file_bytes: default_max_file_bytes(),
            ignored_dirs: default_ignored_dirs(),
        }
    }
}

impl Default for AddressingConfig {
    fn default() -> Self {
        Self {
            strategy: AddressingStrategy::default(),
            subnet: default_subnet(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            storage_root: default_storage_root(),
            id_length: default_id_length(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            mode: BrokerMode::default(),
            sockets: default_sockets(),
            socket_path: default_socket_path(),
            socket_mode: default_socket_mode(),
            connect_timeout_ms: default_connect_timeout_ms(),
            response_timeout_ms: default_response_timeout_ms(),
            create_timeout_secs: default_create_timeout_secs(),
            request_timeout_ms: default_request_timeout_ms(),
            attempts: default_attempts(),
            log_dir: default_log_dir(),
            create_helper: None,
        }
    }
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_exec_timeout(),
            max_output_bytes: default_max_output(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            upstream_port: default_upstream_port(),
            connect_timeout_secs: default_proxy_connect(),
            read_timeout_secs: default_proxy_read(),
            max_body_bytes: default_max_body(),
        }
    }
}

impl RuntimeConfig {
    pub fn launch_profile(&self) -> LaunchProfile {
        LaunchProfile {
            template: self.template.clone(),
            cpu: self.cpu.clone(),
            memory: self.memory.clone(),
            processes: self.processes,
            nesting: self.nesting,
            syscall_intercepts: self.syscall_intercepts.clone(),
        }
    }

    pub fn file_limits(&self) -> ExecLimits {
        ExecLimits::new(Duration::from_secs(self.op_timeout_secs), self.max_file_bytes)
    }
}

impl AddressingConfig {
    /// Parse the `a.b.c.d/n` subnet.
    pub fn parse_subnet(&self) -> Result<Subnet> {
        let (base, prefix) = self
            .subnet
            .split_once('/')
            .ok_or_else(|| anyhow!("subnet '{}' is not in CIDR notation", self.subnet))?;
        let base: Ipv4Addr = base
            .parse()
            .with_context(|| format!("invalid subnet base '{}'", base))?;
        let prefix: u8 = prefix
            .parse()
            .with_context(|| format!("invalid prefix length '{}'", prefix))?;
        Subnet::new(base, prefix)
            .ok_or_else(|| anyhow!("prefix length /{} leaves no usable hosts", prefix))
    }
}

impl ExecConfig {
    pub fn limits(&self) -> ExecLimits {
        ExecLimits::new(Duration::from_secs(self.timeout_secs), self.max_output_bytes)
    }
}

impl Config {
    /// Load config from file, or return defaults if file doesn't exist
    pub fn load(path: &str) -> Result<Self> {
        let expanded_path = expand_tilde(path);

        if !expanded_path.exists() {
            return Ok(Self::default());
        }

        let contents =
            std::fs::read_to_string(&expanded_path).context("Failed to read config file")?;

        toml::from_str(&contents).context("Failed to parse config file")
    }

    /// Get the default config path
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("playground")
            .join("config.toml")
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}
