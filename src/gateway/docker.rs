//! Docker-backed compute gateway.
//!
//! Farm instances are containers: tags map to container labels, starting
//! an instance is create+start, stopping is stop+remove. The coordinator
//! and workers are expected to run from prebuilt images that launch the
//! respective subcommand as their entrypoint.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::models::HostConfig;
use bollard::Docker;
use uuid::Uuid;

use super::{ComputeGateway, GatewayError, InstanceId, InstanceStateFilter, ROLE_TAG};

/// Compute gateway over the local Docker daemon.
pub struct DockerComputeGateway {
    docker: Docker,
    env: Vec<String>,
    network_mode: Option<String>,
}

impl DockerComputeGateway {
    /// Connects to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::ConnectionFailed` if the daemon is not
    /// accessible.
    pub fn new() -> Result<Self, GatewayError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| GatewayError::ConnectionFailed(e.to_string()))?;
        Ok(Self::from_docker(docker))
    }

    /// Creates a gateway from an existing bollard client.
    pub fn from_docker(docker: Docker) -> Self {
        Self {
            docker,
            env: Vec::new(),
            network_mode: None,
        }
    }

    /// Environment variables injected into every started instance.
    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    /// Network mode for started instances (e.g. "bridge", "host").
    pub fn with_network_mode(mut self, mode: impl Into<String>) -> Self {
        self.network_mode = Some(mode.into());
        self
    }

    fn instance_name(tags: &HashMap<String, String>) -> String {
        let role = tags.get(ROLE_TAG).map(String::as_str).unwrap_or("instance");
        format!("docfarm-{}-{}", role, Uuid::new_v4().simple())
    }
}

#[async_trait]
impl ComputeGateway for DockerComputeGateway {
    async fn start_instance(
        &self,
        image: &str,
        tags: &HashMap<String, String>,
    ) -> Result<InstanceId, GatewayError> {
        let host_config = HostConfig {
            network_mode: self.network_mode.clone(),
            ..Default::default()
        };

        let config = Config {
            image: Some(image.to_string()),
            env: if self.env.is_empty() {
                None
            } else {
                Some(self.env.clone())
            },
            labels: Some(tags.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: Self::instance_name(tags),
            platform: None,
        };

        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| GatewayError::Compute(format!("failed to create container: {e}")))?;

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            // Leave no half-started container behind.
            let _ = self
                .docker
                .remove_container(
                    &created.id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            return Err(GatewayError::Compute(format!(
                "failed to start container: {e}"
            )));
        }

        Ok(InstanceId(created.id))
    }

    async fn stop_instance(&self, instance: &InstanceId) -> Result<(), GatewayError> {
        self.docker
            .stop_container(&instance.0, Some(StopContainerOptions { t: 10 }))
            .await
            .map_err(|e| GatewayError::Compute(format!("failed to stop container: {e}")))?;

        self.docker
            .remove_container(
                &instance.0,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| GatewayError::Compute(format!("failed to remove container: {e}")))?;

        Ok(())
    }

    async fn list_instances_by_tag(
        &self,
        tag_key: &str,
        tag_value: &str,
        state: InstanceStateFilter,
    ) -> Result<Vec<InstanceId>, GatewayError> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{tag_key}={tag_value}")]);
        if state == InstanceStateFilter::Running {
            filters.insert("status".to_string(), vec!["running".to_string()]);
        }

        let options = ListContainersOptions::<String> {
            all: state == InstanceStateFilter::Any,
            filters,
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| GatewayError::Compute(format!("failed to list containers: {e}")))?;

        Ok(containers
            .into_iter()
            .filter_map(|container| container.id)
            .map(InstanceId)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_name_uses_role_tag() {
        let mut tags = HashMap::new();
        tags.insert(ROLE_TAG.to_string(), "worker".to_string());

        let name = DockerComputeGateway::instance_name(&tags);
        assert!(name.starts_with("docfarm-worker-"));
    }

    #[test]
    fn test_instance_name_without_role() {
        let name = DockerComputeGateway::instance_name(&HashMap::new());
        assert!(name.starts_with("docfarm-instance-"));
    }

    #[test]
    fn test_instance_names_are_unique() {
        let tags = HashMap::new();
        assert_ne!(
            DockerComputeGateway::instance_name(&tags),
            DockerComputeGateway::instance_name(&tags)
        );
    }
}
