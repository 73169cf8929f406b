use std::sync::Arc;

use async_trait::async_trait;

use crate::{CloudError, CloudInstance, ImageId, InstanceId, Region, Virtualization};

/// A describe filter, `(name, values)` as the IaaS expects them,
/// e.g. `("tag:Project", ["loads"])`. A `*` suffix in a value is a
/// prefix wildcard.
pub type Filter = (String, Vec<String>);

/// One machine image as returned by the image sweep
#[derive(Debug, Clone)]
pub struct MachineImage {
    /// Region-scoped image id
    pub id: ImageId,
    /// Image name, used for ordering
    pub name: String,
    /// Virtualization type the image boots under
    pub virtualization: Virtualization,
}

/// Everything needed to launch one batch of instances
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    /// Image to boot
    pub image: ImageId,
    /// How many machines, launched as one batch (min = max = count)
    pub count: u32,
    /// Machine type
    pub instance_type: String,
    /// Key pair installed on the machines
    pub key_pair: String,
    /// Security group the machines join
    pub security_group: String,
    /// Opaque boot payload handed to the machines
    pub user_data: Option<String>,
}

/// Thin adapter over the IaaS API for one region.
///
/// Implementations do no orchestration of their own; retries, tagging
/// policy, and pooling all live above this trait.
#[async_trait]
pub trait CloudClient: Send + Sync {
    /// The region this client talks to
    fn region(&self) -> Region;

    /// List instances matching all `filters`
    async fn describe_instances(
        &self,
        filters: &[Filter],
    ) -> Result<Vec<CloudInstance>, CloudError>;

    /// Launch a batch of instances
    async fn run_instances(
        &self,
        request: &LaunchRequest,
    ) -> Result<Vec<CloudInstance>, CloudError>;

    /// Attach `tags` to every instance in `ids`. Overwrites existing
    /// values for the same keys.
    async fn create_tags(
        &self,
        ids: &[InstanceId],
        tags: &[(String, String)],
    ) -> Result<(), CloudError>;

    /// Terminate every instance in `ids`
    async fn terminate_instances(&self, ids: &[InstanceId]) -> Result<(), CloudError>;

    /// List machine images owned by `owner_id`
    async fn describe_images(&self, owner_id: &str) -> Result<Vec<MachineImage>, CloudError>;
}

/// Factory for per-region clients. The pool memoizes one client per
/// region through this trait.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Connect to `region`
    async fn connect(&self, region: Region) -> Result<Arc<dyn CloudClient>, CloudError>;
}
