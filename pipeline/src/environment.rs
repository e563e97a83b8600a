//! The shared toolchain environment every stage starts from.

use crate::config::PipelineConfig;
use crate::service::postgres_service;
use engine::{CacheVolume, Container, HostDirectory};

/// Builds the toolchain container bound to the database service.
///
/// The result depends only on the configuration, so building twice yields
/// equal containers and the same ordered command sequence.
pub struct EnvironmentBuilder<'a> {
    config: &'a PipelineConfig,
}

impl<'a> EnvironmentBuilder<'a> {
    pub fn new(config: &'a PipelineConfig) -> Self {
        Self { config }
    }

    pub fn build(&self) -> Container {
        let config = self.config;
        let db = &config.database;

        let mut env = Container::from_image(&config.toolchain_image)
            .with_service_binding(&db.host, &postgres_service(config))
            .with_directory(&config.mount_path, HostDirectory::new(&config.source_dir))
            .with_workdir(&config.mount_path)
            .with_mounted_cache(&config.cache_path, CacheVolume::new(&config.cache_volume));

        for (name, value) in self.variables() {
            env = env.with_env_variable(name, value);
        }

        let mut install = vec!["apt-get".to_string(), "install".to_string()];
        install.extend(config.system_packages.iter().cloned());
        install.push("-y".to_string());

        env.with_exec(["apt-get", "update"])
            .with_exec(install)
            .with_exec(self.sqlx_install())
            .with_exec([config.init_script.as_str()])
    }

    /// Environment variables exported to the toolchain, in export order.
    pub fn variables(&self) -> Vec<(&'static str, String)> {
        let config = self.config;
        let db = &config.database;
        vec![
            ("CARGO_TERM_COLOR", config.cargo_term_color.clone()),
            ("SQLX_VERSION", config.sqlx_version.clone()),
            ("SQLX_FEATURES", config.sqlx_features.clone()),
            ("POSTGRES_HOST", db.host.clone()),
            ("POSTGRES_USER", db.username.clone()),
            ("POSTGRES_PASSWORD", db.password.clone()),
            ("POSTGRES_DB", db.name.clone()),
            ("DATABASE_URL", db.connection_string()),
            ("APP_ENVIRONMENT", config.app_environment.clone()),
            ("SKIP_DOCKER", config.skip_docker.to_string()),
        ]
    }

    fn sqlx_install(&self) -> Vec<String> {
        vec![
            "cargo".to_string(),
            "install".to_string(),
            "sqlx-cli".to_string(),
            format!("--version={}", self.config.sqlx_version),
            format!("--features={}", self.config.sqlx_features),
            "--no-default-features".to_string(),
            "--locked".to_string(),
        ]
    }
}

pub fn build_env(config: &PipelineConfig) -> Container {
    EnvironmentBuilder::new(config).build()
}
