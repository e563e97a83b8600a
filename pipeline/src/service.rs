use crate::config::PipelineConfig;
use engine::{Container, Service, ServiceOpts};
use std::time::Duration;

/// The PostgreSQL service the toolchain container binds to.
pub fn postgres_service(config: &PipelineConfig) -> Service {
    let db = &config.database;
    Container::from_image(&db.image)
        .with_env_variable("POSTGRES_PASSWORD", &db.password)
        .with_exposed_port(db.port)
        .as_service(
            ServiceOpts::default()
                .with_entrypoint()
                .with_readiness_probe([
                    "pg_isready".to_string(),
                    "-h".to_string(),
                    "localhost".to_string(),
                    "-p".to_string(),
                    db.port.to_string(),
                    "-U".to_string(),
                    db.username.clone(),
                ])
                .with_readiness_timeout(Duration::from_secs(config.service_ready_timeout_secs)),
        )
}
