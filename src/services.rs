use crate::registry::{DataType, Query, Registry};
use crate::types::{InstanceId, KernelError, NodeId, ServiceDescriptor};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;

/// What the engine needs to create one worker container.
#[derive(Clone, Debug)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub env: Vec<(String, String)>,
    pub labels: Vec<(String, String)>,
}

/// Container lifecycle as an external collaborator. The kernel only drives
/// this interface; real engines live outside the crate.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn create(&self, spec: &ContainerSpec) -> Result<(), KernelError>;
    async fn start(&self, name: &str) -> Result<(), KernelError>;
    async fn stop(&self, name: &str) -> Result<(), KernelError>;
    async fn remove(&self, name: &str, force: bool) -> Result<(), KernelError>;
    /// Names of containers matching every given label.
    async fn list(&self, labels: &[(String, String)]) -> Result<Vec<String>, KernelError>;
}

/// Engine that only logs. Stands in where no real engine is wired up.
pub struct NullEngine;

#[async_trait]
impl ContainerEngine for NullEngine {
    async fn create(&self, spec: &ContainerSpec) -> Result<(), KernelError> {
        debug!("engine: create {} from {}", spec.name, spec.image);
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), KernelError> {
        debug!("engine: start {name}");
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), KernelError> {
        debug!("engine: stop {name}");
        Ok(())
    }

    async fn remove(&self, name: &str, force: bool) -> Result<(), KernelError> {
        debug!("engine: remove {name} (force={force})");
        Ok(())
    }

    async fn list(&self, _labels: &[(String, String)]) -> Result<Vec<String>, KernelError> {
        Ok(Vec::new())
    }
}

/// Declared services: their registry entries and their containers.
pub struct ServiceManager {
    registry: Registry,
    engine: Arc<dyn ContainerEngine>,
    project: String,
    node: NodeId,
}

impl ServiceManager {
    pub fn new(
        registry: Registry,
        engine: Arc<dyn ContainerEngine>,
        project: &str,
        node: &str,
    ) -> Self {
        ServiceManager {
            registry,
            engine,
            project: project.to_string(),
            node: node.to_string(),
        }
    }

    pub fn container_name(&self, service: &str, instance: InstanceId) -> String {
        format!(
            "ce_{}_{}_service_{}_{}",
            self.project, self.node, instance, service
        )
    }

    /// All declared services. Creates the `kernel/services` entry on first
    /// use.
    pub async fn list(&self) -> Result<HashMap<String, ServiceDescriptor>, KernelError> {
        let listed = match self.registry.get("kernel/services", &Query::none()).await {
            Ok(listed) => listed,
            Err(KernelError::Route(_)) => {
                self.registry
                    .create("kernel/services", DataType::Hash, None, None)
                    .await?;
                return Ok(HashMap::new());
            }
            Err(e) => return Err(e),
        };
        let mut out = HashMap::new();
        let Some(fields) = listed.as_object() else {
            return Ok(out);
        };
        for (name, value) in fields {
            if value.is_null() {
                continue;
            }
            match serde_json::from_value(value.clone()) {
                Ok(descriptor) => {
                    out.insert(name.clone(), descriptor);
                }
                Err(e) => warn!("skipping corrupt descriptor of `{name}`: {e}"),
            }
        }
        Ok(out)
    }

    pub async fn descriptor(&self, service: &str) -> Result<ServiceDescriptor, KernelError> {
        self.list()
            .await?
            .remove(service)
            .ok_or_else(|| KernelError::Route(format!("service `{service}` doesn't exist")))
    }

    /// Declare a new service with a fresh token at scale 1.
    pub async fn add(
        &self,
        service: &str,
        image: &str,
        permissions: Vec<String>,
    ) -> Result<(), KernelError> {
        if self.list().await?.contains_key(service) {
            return Err(KernelError::Consistency(format!(
                "service `{service}` is already declared"
            )));
        }
        let descriptor = ServiceDescriptor {
            image: image.to_string(),
            token: generate_token(),
            scale: 1,
            permissions,
            methods: HashMap::new(),
            command: None,
        };
        self.write_descriptor(service, &descriptor).await
    }

    /// Start instances `1..=num` (default: declared scale). Per-instance
    /// failures are logged, not fatal.
    pub async fn start(&self, service: &str, num: Option<i64>) -> Result<(), KernelError> {
        let descriptor = self.descriptor(service).await?;
        let num = num.unwrap_or(descriptor.scale).max(1);
        for instance in 1..=num {
            self.start_instance(service, &descriptor, instance).await;
        }
        Ok(())
    }

    async fn start_instance(
        &self,
        service: &str,
        descriptor: &ServiceDescriptor,
        instance: InstanceId,
    ) {
        let name = self.container_name(service, instance);
        if let Err(e) = self.engine.remove(&name, true).await {
            debug!("no previous container to remove for {name}: {e}");
        }
        let spec = ContainerSpec {
            image: descriptor.image.clone(),
            name: name.clone(),
            env: vec![
                ("CE_TOKEN".to_string(), descriptor.token.clone()),
                ("CE_NAME".to_string(), service.to_string()),
                ("CE_NODE".to_string(), self.node.clone()),
                ("CE_INSTANCE".to_string(), instance.to_string()),
            ],
            labels: vec![
                ("CRAFTEngine".to_string(), "True".to_string()),
                ("Service".to_string(), service.to_string()),
            ],
        };
        let started = async {
            self.engine.create(&spec).await?;
            self.engine.start(&name).await
        }
        .await;
        match started {
            Ok(()) => info!("'{service}'[{instance}] service started"),
            Err(e) => error!("error starting service '{service}'[{instance}]: {e}"),
        }
    }

    pub async fn stop(&self, service: &str) -> Result<(), KernelError> {
        let descriptor = self.descriptor(service).await?;
        for instance in 1..=descriptor.scale.max(1) {
            let name = self.container_name(service, instance);
            match self.engine.stop(&name).await {
                Ok(()) => info!("'{service}'[{instance}] service stopped"),
                Err(e) => warn!("error stopping service '{service}'[{instance}]: {e}"),
            }
        }
        Ok(())
    }

    /// Stop and remove every instance, then drop the declaration.
    pub async fn remove(&self, service: &str) -> Result<(), KernelError> {
        let descriptor = self.descriptor(service).await?;
        self.stop(service).await?;
        for instance in 1..=descriptor.scale.max(1) {
            let name = self.container_name(service, instance);
            match self.engine.remove(&name, true).await {
                Ok(()) => info!("'{service}'[{instance}] service removed"),
                Err(e) => warn!("error removing service '{service}'[{instance}]: {e}"),
            }
        }
        self.registry
            .rem("kernel/services", &Query::keys([service]))
            .await
    }

    /// Reconcile running containers with the asked-for count and record the
    /// new scale so authentication admits instances `1..=num`.
    pub async fn scale(&self, service: &str, num: i64) -> Result<(), KernelError> {
        if num < 1 {
            return Err(KernelError::Route(format!(
                "scale of `{service}` must be at least 1"
            )));
        }
        let mut descriptor = self.descriptor(service).await?;
        let labels = vec![
            ("CRAFTEngine".to_string(), "True".to_string()),
            ("Service".to_string(), service.to_string()),
        ];
        let running = self.engine.list(&labels).await?.len() as i64;
        if running > num {
            for instance in (num + 1)..=running {
                let name = self.container_name(service, instance);
                if let Err(e) = self.engine.remove(&name, true).await {
                    warn!("error removing service '{service}'[{instance}]: {e}");
                }
            }
        } else {
            for instance in (running + 1)..=num {
                self.start_instance(service, &descriptor, instance).await;
            }
        }
        descriptor.scale = num;
        self.write_descriptor(service, &descriptor).await
    }

    async fn write_descriptor(
        &self,
        service: &str,
        descriptor: &ServiceDescriptor,
    ) -> Result<(), KernelError> {
        let value = serde_json::to_value(descriptor)
            .map_err(|e| KernelError::Kv(format!("descriptor encode failed: {e}")))?;
        let mut fields = serde_json::Map::new();
        fields.insert(service.to_string(), value);
        self.registry
            .set("kernel/services", &Query::fields(fields))
            .await
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemKv;
    use tokio::sync::Mutex;

    /// Engine double recording every call, in place of a live daemon.
    #[derive(Default)]
    struct RecordingEngine {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ContainerEngine for RecordingEngine {
        async fn create(&self, spec: &ContainerSpec) -> Result<(), KernelError> {
            self.calls.lock().await.push(format!("create {}", spec.name));
            Ok(())
        }

        async fn start(&self, name: &str) -> Result<(), KernelError> {
            self.calls.lock().await.push(format!("start {name}"));
            Ok(())
        }

        async fn stop(&self, name: &str) -> Result<(), KernelError> {
            self.calls.lock().await.push(format!("stop {name}"));
            Ok(())
        }

        async fn remove(&self, name: &str, _force: bool) -> Result<(), KernelError> {
            self.calls.lock().await.push(format!("remove {name}"));
            Ok(())
        }

        async fn list(&self, _labels: &[(String, String)]) -> Result<Vec<String>, KernelError> {
            Ok(Vec::new())
        }
    }

    fn manager(engine: Arc<RecordingEngine>) -> ServiceManager {
        let registry = Registry::local(Arc::new(MemKv::new()));
        ServiceManager::new(registry, engine, "proj", "n1")
    }

    #[test]
    fn container_naming() {
        let manager = manager(Arc::new(RecordingEngine::default()));
        assert_eq!(
            manager.container_name("web", 2),
            "ce_proj_n1_service_2_web"
        );
    }

    #[tokio::test]
    async fn list_bootstraps_the_registry_entry() {
        let manager = manager(Arc::new(RecordingEngine::default()));
        assert!(manager.list().await.unwrap().is_empty());
        // second call reads the now-existing hash
        assert!(manager.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn add_then_start_and_remove() {
        let engine = Arc::new(RecordingEngine::default());
        let manager = manager(engine.clone());
        manager.list().await.unwrap();
        manager.add("web", "img:web", vec![]).await.unwrap();
        assert!(matches!(
            manager.add("web", "img:web", vec![]).await,
            Err(KernelError::Consistency(_))
        ));

        let descriptor = manager.descriptor("web").await.unwrap();
        assert_eq!(descriptor.scale, 1);
        assert_eq!(descriptor.token.len(), 64);

        manager.start("web", Some(2)).await.unwrap();
        {
            let calls = engine.calls.lock().await;
            assert!(calls.contains(&"start ce_proj_n1_service_1_web".to_string()));
            assert!(calls.contains(&"start ce_proj_n1_service_2_web".to_string()));
        }

        manager.remove("web").await.unwrap();
        assert!(manager.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scale_records_new_count() {
        let manager = manager(Arc::new(RecordingEngine::default()));
        manager.list().await.unwrap();
        manager.add("web", "img:web", vec![]).await.unwrap();
        manager.scale("web", 3).await.unwrap();
        assert_eq!(manager.descriptor("web").await.unwrap().scale, 3);
        assert!(manager.scale("web", 0).await.is_err());
    }

    #[tokio::test]
    async fn unknown_service_is_a_route_error() {
        let manager = manager(Arc::new(RecordingEngine::default()));
        assert!(matches!(
            manager.start("ghost", None).await,
            Err(KernelError::Route(_))
        ));
    }
}
