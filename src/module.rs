//! Module lifecycle
//!
//! Every gateway feature (proxy listeners, config store, process
//! supervisor) is a module with an init/start/stop lifecycle. The
//! registry is an explicit static list of constructors; `main` builds
//! all of them, inits and starts in order, and stops in reverse on
//! shutdown.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::{Bus, BusRequest, Topic};
use crate::config::{ConfigStore, ConnTuning, GatewayConfig};
use crate::core::template::VarRegistry;
use crate::http::HttpProxyEngine;
use crate::logger::log;
use crate::socks5::Socks5ProxyEngine;
use crate::supervisor::Supervisor;

/// Everything a module needs to assemble itself
#[derive(Clone)]
pub struct ModuleContext {
    pub config: Arc<GatewayConfig>,
    pub store: ConfigStore,
    pub tuning: ConnTuning,
    pub vars: Arc<VarRegistry>,
    pub bus: Bus,
    pub shutdown: CancellationToken,
}

/// One lifecycle-managed gateway feature
#[async_trait]
pub trait Module: Send {
    fn name(&self) -> &'static str;

    /// Build internal state from the config snapshot
    async fn init(&mut self, ctx: &ModuleContext) -> Result<()>;

    /// Begin serving
    async fn start(&mut self, ctx: &ModuleContext) -> Result<()>;

    /// Stop serving and release resources
    async fn stop(&mut self);
}

/// Constructor type for the static registry
pub type ModuleCtor = fn() -> Box<dyn Module>;

/// The fixed module list, in startup order
pub fn builtin_modules() -> Vec<(&'static str, ModuleCtor)> {
    vec![
        ("config_store", || Box::new(ConfigModule::default()) as Box<dyn Module>),
        ("service_process_mgr", || {
            Box::new(SupervisorModule::default()) as Box<dyn Module>
        }),
        ("http_reverse_proxy", || {
            Box::new(HttpProxyModule::default()) as Box<dyn Module>
        }),
        ("socks5_reverse_proxy", || {
            Box::new(Socks5ProxyModule::default()) as Box<dyn Module>
        }),
    ]
}

/// Ordered module collection driving the shared lifecycle
pub struct ModuleManager {
    modules: Vec<Box<dyn Module>>,
}

impl ModuleManager {
    /// Build every registered module
    pub fn from_registry() -> Self {
        let modules = builtin_modules()
            .into_iter()
            .map(|(_, ctor)| ctor())
            .collect();
        Self { modules }
    }

    pub async fn init_all(&mut self, ctx: &ModuleContext) -> Result<()> {
        for module in &mut self.modules {
            log::debug!(module = module.name(), "init");
            module.init(ctx).await?;
        }
        Ok(())
    }

    pub async fn start_all(&mut self, ctx: &ModuleContext) -> Result<()> {
        for module in &mut self.modules {
            log::info!(module = module.name(), "start");
            module.start(ctx).await?;
        }
        Ok(())
    }

    /// Stop in reverse startup order
    pub async fn stop_all(&mut self) {
        for module in self.modules.iter_mut().rev() {
            log::info!(module = module.name(), "stop");
            module.stop().await;
        }
    }
}

/// Serves config snapshot requests over the bus
#[derive(Default)]
struct ConfigModule {
    token: Option<CancellationToken>,
}

#[async_trait]
impl Module for ConfigModule {
    fn name(&self) -> &'static str {
        "config_store"
    }

    async fn init(&mut self, ctx: &ModuleContext) -> Result<()> {
        self.token = Some(ctx.shutdown.child_token());
        Ok(())
    }

    async fn start(&mut self, ctx: &ModuleContext) -> Result<()> {
        let mut rx = ctx.bus.subscribe(Topic::Config);
        let store = ctx.store.clone();
        let token = self.token.clone().unwrap_or_default();
        tokio::spawn(async move {
            loop {
                let request = tokio::select! {
                    request = rx.recv() => request,
                    _ = token.cancelled() => break,
                };
                match request {
                    Some(BusRequest::FetchConfig { reply }) => {
                        let _ = reply.send(store.snapshot().await);
                    }
                    Some(BusRequest::ClearCache) => {
                        log::debug!("clear-cache notification received");
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        });
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(token) = &self.token {
            token.cancel();
        }
    }
}

/// Runs the configured HTTP reverse proxy listeners
#[derive(Default)]
struct HttpProxyModule {
    engines: Vec<Arc<HttpProxyEngine>>,
    handles: Vec<JoinHandle<()>>,
    token: Option<CancellationToken>,
}

#[async_trait]
impl Module for HttpProxyModule {
    fn name(&self) -> &'static str {
        "http_reverse_proxy"
    }

    async fn init(&mut self, ctx: &ModuleContext) -> Result<()> {
        let token = ctx.shutdown.child_token();
        for cfg in ctx.config.http_proxies.iter().filter(|c| c.enable) {
            let engine = HttpProxyEngine::new(
                cfg,
                ctx.tuning,
                Arc::clone(&ctx.vars),
                token.child_token(),
            )?;
            self.engines.push(Arc::new(engine));
        }
        self.token = Some(token);
        Ok(())
    }

    async fn start(&mut self, _ctx: &ModuleContext) -> Result<()> {
        for engine in &self.engines {
            let engine = Arc::clone(engine);
            self.handles.push(tokio::spawn(async move {
                if let Err(e) = engine.run().await {
                    log::error!(error = %e, "http proxy listener failed");
                }
            }));
        }
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(token) = &self.token {
            token.cancel();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}

/// Runs the configured SOCKS5 reverse proxy listeners
#[derive(Default)]
struct Socks5ProxyModule {
    engines: Vec<Arc<Socks5ProxyEngine>>,
    handles: Vec<JoinHandle<()>>,
    token: Option<CancellationToken>,
}

#[async_trait]
impl Module for Socks5ProxyModule {
    fn name(&self) -> &'static str {
        "socks5_reverse_proxy"
    }

    async fn init(&mut self, ctx: &ModuleContext) -> Result<()> {
        let token = ctx.shutdown.child_token();
        for cfg in ctx.config.socks5_proxies.iter().filter(|c| c.enable) {
            let engine = Socks5ProxyEngine::new(cfg, ctx.tuning, token.child_token());
            self.engines.push(Arc::new(engine));
        }
        self.token = Some(token);
        Ok(())
    }

    async fn start(&mut self, _ctx: &ModuleContext) -> Result<()> {
        for engine in &self.engines {
            let engine = Arc::clone(engine);
            self.handles.push(tokio::spawn(async move {
                if let Err(e) = engine.run().await {
                    log::error!(error = %e, "socks5 proxy listener failed");
                }
            }));
        }
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(token) = &self.token {
            token.cancel();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}

/// Wraps the process supervisor and its bus handler
#[derive(Default)]
struct SupervisorModule {
    supervisor: Option<Arc<Supervisor>>,
    stop_processes: bool,
    token: Option<CancellationToken>,
}

#[async_trait]
impl Module for SupervisorModule {
    fn name(&self) -> &'static str {
        "service_process_mgr"
    }

    async fn init(&mut self, ctx: &ModuleContext) -> Result<()> {
        if !ctx.config.supervisor.enable {
            return Ok(());
        }
        let token = ctx.shutdown.child_token();
        let supervisor = Supervisor::new(ctx.config.supervisor.clone());
        supervisor.serve_bus(&ctx.bus, token.clone());
        self.stop_processes = ctx.config.supervisor.stop_process_when_exit;
        self.supervisor = Some(supervisor);
        self.token = Some(token);
        Ok(())
    }

    async fn start(&mut self, ctx: &ModuleContext) -> Result<()> {
        if let Some(supervisor) = &self.supervisor {
            if ctx.config.supervisor.auto_start_process {
                supervisor.start_all().await;
            }
        }
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(supervisor) = &self.supervisor {
            if self.stop_processes {
                supervisor.stop_all().await;
            }
        }
        if let Some(token) = &self.token {
            token.cancel();
        }
    }
}
