//! Vultr provider implementation

use crate::api::{
    CreateInstanceBody, CreateLoadBalancerBody, InstanceEnvelope, LoadBalancerEnvelope,
    SshKeyList, UpdateLoadBalancerBody,
};
use crate::client::{VultrClient, VultrConfig};
use async_trait::async_trait;
use capvultr_cloud::{
    CloudError, CloudProvider, Instance, InstanceCreateRequest, LoadBalancer,
    LoadBalancerCreateRequest, LoadBalancerUpdate, Result, SshKey,
};

const SSH_KEY_PAGE_SIZE: u32 = 100;

/// Vultr provider
pub struct VultrProvider {
    client: VultrClient,
}

impl VultrProvider {
    pub fn new(config: VultrConfig) -> crate::Result<Self> {
        Ok(Self {
            client: VultrClient::new(config)?,
        })
    }

    /// Create a provider from `VULTR_API_KEY` / `VULTR_API_URL`
    pub fn from_env() -> crate::Result<Self> {
        Self::new(VultrConfig::from_env()?)
    }

    async fn list_ssh_keys(&self) -> Result<Vec<SshKey>> {
        let mut keys = Vec::new();
        let mut cursor = String::new();
        loop {
            let mut query = vec![("per_page", SSH_KEY_PAGE_SIZE.to_string())];
            if !cursor.is_empty() {
                query.push(("cursor", cursor.clone()));
            }

            let Some(page) = self
                .client
                .get_with_query::<SshKeyList, _>("/ssh-keys", &query)
                .await?
            else {
                break;
            };
            keys.extend(page.ssh_keys.into_iter().map(SshKey::from));

            if page.meta.links.next.is_empty() || page.meta.links.next == cursor {
                break;
            }
            cursor = page.meta.links.next;
        }
        Ok(keys)
    }
}

#[async_trait]
impl CloudProvider for VultrProvider {
    fn name(&self) -> &str {
        "vultr"
    }

    async fn get_instance(&self, id: &str) -> Result<Option<Instance>> {
        if id.is_empty() {
            return Ok(None);
        }

        match self
            .client
            .get::<InstanceEnvelope>(&format!("/instances/{}", id))
            .await
        {
            Ok(found) => Ok(found.map(|e| e.instance.into())),
            // Vultr answers 400 for ids that are not valid UUIDs
            Err(e) if e.status() == Some(400) => {
                tracing::debug!(instance_id = id, "Instance id rejected, treating as absent");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn create_instance(&self, request: &InstanceCreateRequest) -> Result<Instance> {
        let body = CreateInstanceBody::from(request);
        let created: InstanceEnvelope = self.client.post("/instances", &body).await?;
        tracing::info!(
            instance_id = %created.instance.id,
            label = %request.label,
            "Created instance"
        );
        Ok(created.instance.into())
    }

    async fn delete_instance(&self, id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(CloudError::InvalidConfig(
                "cannot delete instance without an id".to_string(),
            ));
        }

        if self.client.delete(&format!("/instances/{}", id)).await? {
            tracing::info!(instance_id = id, "Deleted instance");
        } else {
            tracing::debug!(instance_id = id, "Instance already gone");
        }
        Ok(())
    }

    async fn get_load_balancer(&self, id: &str) -> Result<Option<LoadBalancer>> {
        if id.is_empty() {
            return Ok(None);
        }

        let found = self
            .client
            .get::<LoadBalancerEnvelope>(&format!("/load-balancers/{}", id))
            .await?;
        Ok(found.map(|e| e.load_balancer.into()))
    }

    async fn create_load_balancer(
        &self,
        request: &LoadBalancerCreateRequest,
    ) -> Result<LoadBalancer> {
        let body = CreateLoadBalancerBody::from(request);
        let created: LoadBalancerEnvelope = self.client.post("/load-balancers", &body).await?;
        tracing::info!(
            load_balancer_id = %created.load_balancer.id,
            label = %request.label,
            "Created load balancer"
        );
        Ok(created.load_balancer.into())
    }

    async fn update_load_balancer(&self, id: &str, update: &LoadBalancerUpdate) -> Result<()> {
        // The API has no conditional write, so the precondition is checked
        // against a fresh read right before the PATCH.
        if update.expected_instances.is_some() {
            let current = self
                .get_load_balancer(id)
                .await?
                .ok_or_else(|| CloudError::ResourceNotFound(format!("load balancer {}", id)))?;
            if !update.precondition_holds(&current.instances) {
                return Err(CloudError::Conflict(format!(
                    "load balancer {} membership changed",
                    id
                )));
            }
        }

        let body = UpdateLoadBalancerBody {
            instances: &update.instances,
        };
        self.client
            .patch(&format!("/load-balancers/{}", id), &body)
            .await?;
        Ok(())
    }

    async fn delete_load_balancer(&self, id: &str) -> Result<()> {
        if id.is_empty() {
            return Ok(());
        }

        if self.client.delete(&format!("/load-balancers/{}", id)).await? {
            tracing::info!(load_balancer_id = id, "Deleted load balancer");
        } else {
            tracing::debug!(load_balancer_id = id, "Load balancer already gone");
        }
        Ok(())
    }

    async fn get_ssh_key(&self, name: &str) -> Result<Option<SshKey>> {
        if name.is_empty() {
            return Err(CloudError::InvalidConfig("missing ssh key".to_string()));
        }

        let keys = self.list_ssh_keys().await?;
        let by_name = keys.iter().position(|k| k.name == name);
        let found = by_name.or_else(|| keys.iter().position(|k| k.id == name));
        Ok(found.map(|i| keys[i].clone()))
    }
}
