//! Immutable, layered container declarations.
//!
//! A [`Container`] is a base image plus an ordered chain of [`Layer`]s. Every
//! builder method takes `&self` and returns a new value, so any number of
//! derived containers can share a common base without observing each other:
//!
//! ```rust
//! use engine::Container;
//!
//! let base = Container::from_image("rust:slim-bookworm").with_workdir("/src");
//! let fmt = base.with_exec(["cargo", "fmt", "--check"]);
//! let test = base.with_exec(["cargo", "test"]);
//!
//! assert_eq!(base.layers().len(), 1);
//! assert_ne!(fmt, test);
//! ```
//!
//! Nothing runs until the container is handed to an [`crate::Engine`].

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A directory on the host, copied into a container when the layer is applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostDirectory {
    path: PathBuf,
}

impl HostDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A named volume that persists between runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheVolume {
    name: String,
}

impl CacheVolume {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Options applied when turning a container into a long-running service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceOpts {
    /// Start the image's own entrypoint instead of the last exec layer
    pub use_entrypoint: bool,
    /// Command run inside the service until it exits 0
    pub readiness_probe: Option<Vec<String>>,
    /// How long to keep probing before giving up
    pub readiness_timeout: Duration,
}

impl Default for ServiceOpts {
    fn default() -> Self {
        Self {
            use_entrypoint: false,
            readiness_probe: None,
            readiness_timeout: Duration::from_secs(30),
        }
    }
}

impl ServiceOpts {
    pub fn with_entrypoint(mut self) -> Self {
        self.use_entrypoint = true;
        self
    }

    pub fn with_readiness_probe<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.readiness_probe = Some(args.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout = timeout;
        self
    }
}

/// A container declared as a service that other containers can bind to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Service {
    container: Container,
    opts: ServiceOpts,
}

impl Service {
    pub fn container(&self) -> &Container {
        &self.container
    }

    pub fn opts(&self) -> &ServiceOpts {
        &self.opts
    }

    /// Ports declared with [`Container::with_exposed_port`]
    pub fn exposed_ports(&self) -> Vec<u16> {
        self.container
            .layers
            .iter()
            .filter_map(|layer| match layer {
                Layer::ExposedPort(port) => Some(*port),
                _ => None,
            })
            .collect()
    }
}

/// One declarative transformation applied on top of the base image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Layer {
    /// Make `service` reachable under the hostname `alias`
    ServiceBinding { alias: String, service: Box<Service> },
    /// Copy a host directory to `path`
    Directory { path: String, source: HostDirectory },
    /// Working directory for subsequent execs
    Workdir(String),
    /// Mount a persistent cache volume at `path`
    MountedCache { path: String, cache: CacheVolume },
    /// Environment variable for subsequent execs
    EnvVariable { name: String, value: String },
    /// Port the container listens on when run as a service
    ExposedPort(u16),
    /// Run a command; a non-zero exit fails the container
    Exec(Vec<String>),
}

/// An immutable container declaration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Container {
    image: String,
    layers: Vec<Layer>,
}

impl Container {
    /// Start a declaration from a base image reference.
    pub fn from_image(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            layers: Vec::new(),
        }
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Returns a new container with `layer` appended.
    pub fn with_layer(&self, layer: Layer) -> Self {
        let mut layers = Vec::with_capacity(self.layers.len() + 1);
        layers.extend_from_slice(&self.layers);
        layers.push(layer);
        Self {
            image: self.image.clone(),
            layers,
        }
    }

    pub fn with_service_binding(&self, alias: impl Into<String>, service: &Service) -> Self {
        self.with_layer(Layer::ServiceBinding {
            alias: alias.into(),
            service: Box::new(service.clone()),
        })
    }

    pub fn with_directory(&self, path: impl Into<String>, source: HostDirectory) -> Self {
        self.with_layer(Layer::Directory {
            path: path.into(),
            source,
        })
    }

    pub fn with_workdir(&self, path: impl Into<String>) -> Self {
        self.with_layer(Layer::Workdir(path.into()))
    }

    pub fn with_mounted_cache(&self, path: impl Into<String>, cache: CacheVolume) -> Self {
        self.with_layer(Layer::MountedCache {
            path: path.into(),
            cache,
        })
    }

    pub fn with_env_variable(&self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.with_layer(Layer::EnvVariable {
            name: name.into(),
            value: value.into(),
        })
    }

    pub fn with_exposed_port(&self, port: u16) -> Self {
        self.with_layer(Layer::ExposedPort(port))
    }

    pub fn with_exec<I, S>(&self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_layer(Layer::Exec(args.into_iter().map(Into::into).collect()))
    }

    /// Declare this container as a service.
    pub fn as_service(&self, opts: ServiceOpts) -> Service {
        Service {
            container: self.clone(),
            opts,
        }
    }

    /// True when `self` is `other` with zero or more layers appended.
    pub fn extends(&self, other: &Container) -> bool {
        self.image == other.image
            && self.layers.len() >= other.layers.len()
            && self.layers[..other.layers.len()] == other.layers[..]
    }
}
