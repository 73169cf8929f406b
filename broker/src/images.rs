//! Per-region base image registry, populated once at startup.

use std::collections::HashMap;

use futures::future::try_join_all;
use tracing::{debug, info};

use cloud::{CloudError, CloudProvider, ImageId, Region, Virtualization};

/// Instance families that cannot boot hvm images
const PARAVIRTUAL_FAMILIES: [&str; 4] = ["m1", "m2", "c1", "t1"];

/// Map of region to the base image for each virtualization type.
///
/// Populated by sweeping the configured owner's images per region,
/// sorting by name, and keeping the two highest-sorted. A single
/// region failure is fatal: nothing may proceed with a blank slot.
#[derive(Debug, Default, Clone)]
pub struct ImageRegistry {
    images: HashMap<Region, HashMap<Virtualization, ImageId>>,
}

impl ImageRegistry {
    /// Sweep every region concurrently and build the registry
    pub async fn populate(
        provider: &dyn CloudProvider,
        regions: &[Region],
        owner_id: &str,
    ) -> Result<ImageRegistry, CloudError> {
        let sweeps = regions.iter().map(|region| async move {
            let client = provider.connect(*region).await?;
            let mut images = client.describe_images(owner_id).await?;
            images.sort_by(|a, b| a.name.cmp(&b.name));

            let mut slots = HashMap::new();
            for image in images.iter().rev().take(2) {
                debug!(
                    "{}: {} image is {} ({})",
                    region,
                    image.virtualization.to_string(),
                    image.id,
                    image.name
                );
                slots.entry(image.virtualization).or_insert_with(|| image.id.clone());
            }
            Ok::<_, CloudError>((*region, slots))
        });

        let populated = try_join_all(sweeps).await?;
        info!("Image registry populated for {} region(s)", populated.len());
        Ok(ImageRegistry {
            images: populated.into_iter().collect(),
        })
    }

    /// Registry from a fixed map, for callers that already know their
    /// images
    pub fn from_map(images: HashMap<Region, HashMap<Virtualization, ImageId>>) -> Self {
        Self { images }
    }

    /// The image to boot for `instance_type` in `region`. Older
    /// instance families require paravirtual images; everything else
    /// boots hvm.
    pub fn get(&self, region: Region, instance_type: &str) -> Result<ImageId, CloudError> {
        let virtualization = if PARAVIRTUAL_FAMILIES
            .iter()
            .any(|family| instance_type.starts_with(family))
        {
            Virtualization::Paravirtual
        } else {
            Virtualization::Hvm
        };

        self.images
            .get(&region)
            .and_then(|slots| slots.get(&virtualization))
            .cloned()
            .ok_or(CloudError::ImageNotFound {
                region,
                virtualization,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCloud;

    #[tokio::test]
    async fn populate_indexes_by_virtualization() {
        let fake = FakeCloud::new();
        let registry = ImageRegistry::populate(&fake, Region::all(), "595879546273")
            .await
            .unwrap();

        let hvm = registry.get(Region::UsWest2, "m3.large").unwrap();
        let para = registry.get(Region::UsWest2, "t1.micro").unwrap();
        assert_ne!(hvm, para);
    }

    #[tokio::test]
    async fn old_families_get_paravirtual() {
        let fake = FakeCloud::new();
        let registry = ImageRegistry::populate(&fake, &[Region::UsWest2], "595879546273")
            .await
            .unwrap();
        for instance_type in &["m1.small", "m2.xlarge", "c1.medium", "t1.micro"] {
            assert_eq!(
                registry.get(Region::UsWest2, instance_type).unwrap(),
                registry.get(Region::UsWest2, "t1.micro").unwrap()
            );
        }
    }

    #[test]
    fn empty_slot_is_image_not_found() {
        let registry = ImageRegistry::default();
        assert!(registry.get(Region::UsWest2, "t1.micro").is_err());
    }
}
