//! Resolution of a [`Container`] into the concrete work a runtime performs.
//!
//! Environment variables and the working directory are folded into each exec
//! step so that a step can be replayed on its own, which is what lets an
//! engine skip a prefix of layers it has already evaluated.

use crate::container::{CacheVolume, Container, HostDirectory, Layer, Service};

/// A step with side effects inside the worker container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepKind {
    CopyDirectory {
        source: HostDirectory,
        path: String,
    },
    Exec {
        args: Vec<String>,
        env: Vec<(String, String)>,
        workdir: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// Index of the layer that produced this step
    pub layer_index: usize,
    pub kind: StepKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheMount {
    pub cache: CacheVolume,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceBinding {
    pub alias: String,
    pub service: Service,
}

/// Everything needed to evaluate a container, in layer order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub image: String,
    pub caches: Vec<CacheMount>,
    pub services: Vec<ServiceBinding>,
    pub exposed_ports: Vec<u16>,
    pub steps: Vec<Step>,
    /// Environment in effect after the last layer
    pub env: Vec<(String, String)>,
    /// Working directory in effect after the last layer
    pub workdir: Option<String>,
}

impl Plan {
    pub fn resolve(container: &Container) -> Self {
        let mut plan = Plan {
            image: container.image().to_string(),
            caches: Vec::new(),
            services: Vec::new(),
            exposed_ports: Vec::new(),
            steps: Vec::new(),
            env: Vec::new(),
            workdir: None,
        };

        for (layer_index, layer) in container.layers().iter().enumerate() {
            match layer {
                Layer::ServiceBinding { alias, service } => plan.services.push(ServiceBinding {
                    alias: alias.clone(),
                    service: (**service).clone(),
                }),
                Layer::Directory { path, source } => plan.steps.push(Step {
                    layer_index,
                    kind: StepKind::CopyDirectory {
                        source: source.clone(),
                        path: path.clone(),
                    },
                }),
                Layer::Workdir(path) => plan.workdir = Some(path.clone()),
                Layer::MountedCache { path, cache } => plan.caches.push(CacheMount {
                    cache: cache.clone(),
                    path: path.clone(),
                }),
                Layer::EnvVariable { name, value } => set_env(&mut plan.env, name, value),
                Layer::ExposedPort(port) => plan.exposed_ports.push(*port),
                Layer::Exec(args) => plan.steps.push(Step {
                    layer_index,
                    kind: StepKind::Exec {
                        args: args.clone(),
                        env: plan.env.clone(),
                        workdir: plan.workdir.clone(),
                    },
                }),
            }
        }

        plan
    }

    /// Ordered argument vectors of every exec step.
    pub fn exec_commands(&self) -> Vec<&[String]> {
        self.steps
            .iter()
            .filter_map(|step| match &step.kind {
                StepKind::Exec { args, .. } => Some(args.as_slice()),
                StepKind::CopyDirectory { .. } => None,
            })
            .collect()
    }

    /// Steps produced by layers at or after `layer_index`.
    pub fn steps_from(&self, layer_index: usize) -> impl Iterator<Item = &Step> {
        self.steps
            .iter()
            .filter(move |step| step.layer_index >= layer_index)
    }

    /// Arguments of the last exec layer, used as a service command.
    pub fn last_exec(&self) -> Option<&[String]> {
        self.exec_commands().last().copied()
    }
}

// Later values replace earlier ones but keep their original position.
fn set_env(env: &mut Vec<(String, String)>, name: &str, value: &str) {
    match env.iter_mut().find(|(existing, _)| existing == name) {
        Some(entry) => entry.1 = value.to_string(),
        None => env.push((name.to_string(), value.to_string())),
    }
}
