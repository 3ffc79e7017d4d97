use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::broker::{BrokerClient, BrokerContext, BrokerTimeouts};
use crate::config::{expand_tilde, Config};
use crate::control::SandboxControl;
use crate::proxy::SandboxProxy;
use crate::runtime::{LxcRuntime, Runtime, SandboxDriver};
use crate::sandbox::{
    AddressResolver, KvStore, MemoryStore, RegistryOptions, SandboxRegistry, UnitNamer,
};

/// Everything a request handler or CLI command needs, wired from config.
pub struct Playground {
    pub config: Config,
    pub driver: Arc<SandboxDriver>,
    pub registry: Arc<SandboxRegistry>,
    pub resolver: AddressResolver,
    pub control: Arc<SandboxControl>,
    pub proxy: SandboxProxy,
}

pub type SharedApp = Arc<Playground>;

impl Playground {
    /// Wire the real container runtime.
    pub fn new(config: Config) -> Result<Self> {
        let runtime = Arc::new(LxcRuntime::new(
            config.runtime.binary.clone(),
            config.runtime.use_sudo,
            Duration::from_secs(config.runtime.status_timeout_secs),
            Duration::from_secs(config.runtime.op_timeout_secs),
        ));
        Self::with_runtime(config, runtime, Arc::new(MemoryStore::new()))
    }

    /// Wire an explicit runtime and cache store.
    pub fn with_runtime(
        config: Config,
        runtime: Arc<dyn Runtime>,
        store: Arc<dyn KvStore>,
    ) -> Result<Self> {
        let namer = UnitNamer::new(config.runtime.unit_prefix.clone(), config.runtime.naming);
        let driver = Arc::new(build_driver(&config, Arc::clone(&runtime), namer.clone()));

        let subnet = config.addressing.parse_subnet()?;
        let resolver = AddressResolver::new(
            config.addressing.strategy,
            subnet,
            Arc::clone(&store),
            runtime,
            namer,
        );

        let database = expand_tilde(&config.registry.database);
        let registry = SandboxRegistry::open(
            &database.to_string_lossy(),
            Arc::clone(&driver),
            store,
            RegistryOptions {
                id_length: config.registry.id_length,
                max_attempts: config.registry.max_attempts,
                storage_root: Some(expand_tilde(&config.registry.storage_root)),
            },
        )
        .with_context(|| format!("opening registry {:?}", database))?
        .with_recorder(resolver.recorder().clone());

        let control = SandboxControl::new(
            broker_client(&config),
            config.broker.mode,
            Arc::clone(&driver),
            config.exec.limits(),
        );

        let proxy = SandboxProxy::new(
            resolver.clone(),
            config.proxy.upstream_port,
            Duration::from_secs(config.proxy.connect_timeout_secs),
            Duration::from_secs(config.proxy.read_timeout_secs),
        )
        .context("building proxy HTTP client")?;

        Ok(Self {
            config,
            driver,
            registry: Arc::new(registry),
            resolver,
            control: Arc::new(control),
            proxy,
        })
    }

    /// Context for the privileged daemon, sharing this driver.
    pub fn broker_context(&self) -> BrokerContext {
        BrokerContext::new(
            Arc::clone(&self.driver),
            expand_tilde(&self.config.broker.log_dir),
            self.config.broker.create_helper.as_deref().map(expand_tilde),
            self.config.runtime.file_limits(),
            self.config.exec.limits(),
        )
    }
}

fn build_driver(config: &Config, runtime: Arc<dyn Runtime>, namer: UnitNamer) -> SandboxDriver {
    SandboxDriver::new(
        runtime,
        namer,
        config.runtime.launch_profile(),
        config.runtime.root.clone(),
    )
    .with_timing(
        Duration::from_secs(config.runtime.settle_secs),
        Duration::from_secs(config.runtime.start_timeout_secs),
    )
    .with_file_limits(config.runtime.file_limits())
    .with_ignored_dirs(config.runtime.ignored_dirs.clone())
}

fn broker_client(config: &Config) -> BrokerClient {
    BrokerClient::new(
        config.broker.sockets.iter().map(|s| expand_tilde(s)).collect(),
        BrokerTimeouts {
            connect: Duration::from_millis(config.broker.connect_timeout_ms),
            response: Duration::from_millis(config.broker.response_timeout_ms),
            create_response: Duration::from_secs(config.broker.create_timeout_secs),
            attempts: config.broker.attempts,
            ..BrokerTimeouts::default()
        },
    )
}
