//! An [`Engine`] that drives the `docker` or `podman` command line.
//!
//! A session owns one network, the services bound by evaluated containers and
//! the snapshot images produced by [`Engine::sync`]. All of them are removed
//! when the engine is dropped. Each evaluation runs in a throwaway worker
//! container that idles on `sleep infinity` while layers are replayed into it
//! with `cp` and `exec`.

use crate::container::{Container, Layer};
use crate::plan::{Plan, ServiceBinding, StepKind};
use crate::runtime::{detect_runtime, ContainerRuntime};
use crate::{Engine, EngineError, EngineResult, ExecOutput};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::{Command as StdCommand, Output};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

const PROBE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct RunningService {
    name: String,
    aliases: Vec<String>,
}

#[derive(Debug, Clone)]
struct Snapshot {
    image: String,
    output: ExecOutput,
}

#[derive(Debug, Default)]
struct Session {
    network: Option<String>,
    services: HashMap<String, RunningService>,
    snapshots: HashMap<String, Snapshot>,
}

/// Docker/Podman backed engine
#[derive(Debug)]
pub struct CliEngine {
    runtime: ContainerRuntime,
    session_id: String,
    session: Mutex<Session>,
}

impl CliEngine {
    pub fn new(runtime: ContainerRuntime) -> EngineResult<Self> {
        if !runtime.is_available() {
            return Err(EngineError::NoRuntimeAvailable);
        }

        let session_id = format!("ci-{}", &Uuid::new_v4().simple().to_string()[..8]);
        info!(runtime = %runtime, session = %session_id, "Opened container session");

        Ok(Self {
            runtime,
            session_id,
            session: Mutex::new(Session::default()),
        })
    }

    /// Use whichever runtime is installed, preferring Podman.
    pub fn detect() -> EngineResult<Self> {
        Self::new(detect_runtime())
    }

    pub fn runtime(&self) -> ContainerRuntime {
        self.runtime
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn output(&self, args: &[String]) -> EngineResult<Output> {
        debug!("{} {}", self.runtime.command(), args.join(" "));
        Command::new(self.runtime.command())
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| EngineError::CommandFailed {
                command: self.describe(args),
                reason: e.to_string(),
            })
    }

    /// Run a runtime command that must succeed; returns trimmed stdout.
    async fn checked(&self, args: &[String]) -> EngineResult<String> {
        let output = self.output(args).await?;
        if !output.status.success() {
            return Err(EngineError::CommandFailed {
                command: self.describe(args),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn describe(&self, args: &[String]) -> String {
        format!("{} {}", self.runtime.command(), args.join(" "))
    }

    async fn ensure_network(&self, session: &mut Session) -> EngineResult<String> {
        if let Some(network) = &session.network {
            return Ok(network.clone());
        }

        let network = self.session_id.clone();
        self.checked(&strings(["network", "create", &network])).await?;
        session.network = Some(network.clone());
        Ok(network)
    }

    async fn ensure_service(
        &self,
        session: &mut Session,
        network: &str,
        binding: &ServiceBinding,
    ) -> EngineResult<()> {
        let key = serde_json::to_string(&binding.service)?;

        if let Some(running) = session.services.get_mut(&key) {
            if running.aliases.contains(&binding.alias) {
                return Ok(());
            }
            // An attachment's aliases are fixed, so reattach with the full set
            running.aliases.push(binding.alias.clone());
            self.checked(&strings(["network", "disconnect", network, &running.name]))
                .await?;
            let mut args = strings(["network", "connect"]);
            for alias in &running.aliases {
                args.push("--alias".to_string());
                args.push(alias.clone());
            }
            args.push(network.to_string());
            args.push(running.name.clone());
            self.checked(&args).await?;
            return Ok(());
        }

        let plan = Plan::resolve(binding.service.container());
        if !plan.services.is_empty() {
            return Err(EngineError::Unsupported(format!(
                "service '{}' binds other services",
                binding.alias
            )));
        }
        if plan
            .steps
            .iter()
            .any(|step| matches!(step.kind, StepKind::CopyDirectory { .. }))
        {
            return Err(EngineError::Unsupported(format!(
                "service '{}' copies host directories",
                binding.alias
            )));
        }

        let name = format!("{}-svc-{}", self.session_id, session.services.len());
        let opts = binding.service.opts();
        let mut args = strings(["run", "-d", "--name", &name, "--network", network]);
        args.extend(strings(["--network-alias", &binding.alias]));
        for (key, value) in &plan.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        for port in &plan.exposed_ports {
            args.push("--expose".to_string());
            args.push(port.to_string());
        }
        for mount in &plan.caches {
            args.push("-v".to_string());
            args.push(format!("{}:{}", mount.cache.name(), mount.path));
        }
        if let Some(workdir) = &plan.workdir {
            args.extend(strings(["-w", workdir]));
        }

        let command = plan.last_exec().map(<[String]>::to_vec).unwrap_or_default();
        if opts.use_entrypoint || command.is_empty() {
            args.push(plan.image.clone());
            args.extend(command);
        } else {
            args.extend(strings(["--entrypoint", &command[0]]));
            args.push(plan.image.clone());
            args.extend(command[1..].iter().cloned());
        }

        info!(service = %binding.alias, image = %plan.image, "Starting service");
        self.checked(&args).await?;

        if let Some(probe) = &opts.readiness_probe {
            let ready = self
                .wait_until_ready(&name, &binding.alias, probe, opts.readiness_timeout)
                .await;
            if let Err(e) = ready {
                // Only ready services are recorded, so the next binding starts over
                if let Err(rm) = self.checked(&strings(["rm", "-f", &name])).await {
                    warn!("Failed to remove unready service {}: {}", name, rm);
                }
                return Err(e);
            }
        }

        session.services.insert(
            key,
            RunningService {
                name,
                aliases: vec![binding.alias.clone()],
            },
        );
        Ok(())
    }

    async fn wait_until_ready(
        &self,
        name: &str,
        alias: &str,
        probe: &[String],
        timeout: Duration,
    ) -> EngineResult<()> {
        let start_time = Instant::now();
        let mut args = strings(["exec", name]);
        args.extend(probe.iter().cloned());

        loop {
            match self.output(&args).await {
                Ok(output) if output.status.success() => {
                    info!(service = %alias, "Service is ready");
                    return Ok(());
                }
                // Not up yet, keep probing until the deadline
                Ok(_) if start_time.elapsed() < timeout => sleep(PROBE_INTERVAL).await,
                Ok(_) => {
                    return Err(EngineError::ServiceUnreachable {
                        alias: alias.to_string(),
                        timeout: timeout.as_secs(),
                    })
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn run(&self, container: &Container, retain: bool) -> EngineResult<ExecOutput> {
        let plan = Plan::resolve(container);
        let layers = container.layers();

        // Services and the retained prefix are resolved under the session
        // lock; the layers themselves run without it.
        let (network, base) = {
            let mut session = self.session.lock().await;
            let network = if plan.services.is_empty() {
                None
            } else {
                let network = self.ensure_network(&mut session).await?;
                for binding in &plan.services {
                    self.ensure_service(&mut session, &network, binding).await?;
                }
                Some(network)
            };

            let mut base = None;
            for len in (1..=layers.len()).rev() {
                let key = snapshot_key(container.image(), &layers[..len])?;
                if let Some(snapshot) = session.snapshots.get(&key) {
                    base = Some((len, snapshot.clone()));
                    break;
                }
            }
            (network, base)
        };

        let (start, image, mut last) = match base {
            Some((len, snapshot)) if len == layers.len() => {
                debug!(layers = len, "Container already retained");
                return Ok(snapshot.output);
            }
            Some((len, snapshot)) => (len, snapshot.image, snapshot.output),
            None => (0, plan.image.clone(), ExecOutput::default()),
        };

        let worker = Worker {
            runtime: self.runtime,
            name: format!("{}-{}", self.session_id, &Uuid::new_v4().simple().to_string()[..8]),
        };
        let mut args = strings(["run", "-d", "--name", &worker.name]);
        if let Some(network) = &network {
            args.extend(strings(["--network", network]));
        }
        for mount in &plan.caches {
            args.push("-v".to_string());
            args.push(format!("{}:{}", mount.cache.name(), mount.path));
        }
        args.extend(strings(["--entrypoint", "sleep", &image, "infinity"]));
        self.checked(&args).await?;
        debug!(worker = %worker.name, image = %image, skipped_layers = start, "Started worker");

        for step in plan.steps_from(start) {
            match &step.kind {
                StepKind::CopyDirectory { source, path } => {
                    let source = tokio::fs::canonicalize(source.path()).await?;
                    self.checked(&strings(["exec", &worker.name, "mkdir", "-p", path]))
                        .await?;
                    self.checked(&strings([
                        "cp",
                        &format!("{}/.", source.display()),
                        &format!("{}:{}", worker.name, path),
                    ]))
                    .await?;
                }
                StepKind::Exec { args, env, workdir } => {
                    last = self.exec(&worker.name, args, env, workdir.as_deref()).await?;
                }
            }
        }

        if retain {
            let image = self.checked(&strings(["commit", &worker.name])).await?;
            let key = snapshot_key(container.image(), layers)?;
            debug!(image = %image, layers = layers.len(), "Retained container");
            self.session.lock().await.snapshots.insert(
                key,
                Snapshot {
                    image,
                    output: last.clone(),
                },
            );
        }

        Ok(last)
    }

    async fn exec(
        &self,
        worker: &str,
        command: &[String],
        env: &[(String, String)],
        workdir: Option<&str>,
    ) -> EngineResult<ExecOutput> {
        let mut args = strings(["exec"]);
        if let Some(workdir) = workdir {
            args.extend(strings(["-w", workdir]));
        }
        for (key, value) in env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(worker.to_string());
        args.extend(command.iter().cloned());

        info!("exec {}", command.join(" "));
        let output = self.output(&args).await?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            return Err(EngineError::ExecFailed {
                command: command.join(" "),
                exit_code: output.status.code(),
                stdout,
                stderr,
            });
        }

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code: output.status.code().unwrap_or_default(),
        })
    }
}

#[async_trait]
impl Engine for CliEngine {
    async fn evaluate(&self, container: &Container) -> EngineResult<ExecOutput> {
        self.run(container, false).await
    }

    async fn sync(&self, container: &Container) -> EngineResult<()> {
        self.run(container, true).await.map(|_| ())
    }

    fn name(&self) -> &str {
        self.runtime.command()
    }
}

impl Drop for CliEngine {
    fn drop(&mut self) {
        let runtime = self.runtime.command();
        let session = self.session.get_mut();

        for service in session.services.values() {
            cleanup(runtime, &["rm", "-f", &service.name]);
        }
        for snapshot in session.snapshots.values() {
            cleanup(runtime, &["rmi", "-f", &snapshot.image]);
        }
        if let Some(network) = &session.network {
            cleanup(runtime, &["network", "rm", network]);
        }
    }
}

/// Removes the worker container when evaluation ends, successful or not.
struct Worker {
    runtime: ContainerRuntime,
    name: String,
}

impl Drop for Worker {
    fn drop(&mut self) {
        cleanup(self.runtime.command(), &["rm", "-f", &self.name]);
    }
}

fn cleanup(runtime: &str, args: &[&str]) {
    match StdCommand::new(runtime).args(args).output() {
        Ok(output) if output.status.success() => {}
        Ok(output) => warn!(
            "Cleanup `{} {}` failed: {}",
            runtime,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        ),
        Err(e) => warn!("Cleanup `{} {}` failed: {}", runtime, args.join(" "), e),
    }
}

fn snapshot_key(image: &str, layers: &[Layer]) -> EngineResult<String> {
    Ok(serde_json::to_string(&(image, layers))?)
}

fn strings<const N: usize>(args: [&str; N]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}
