use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_ec2::config::Region as SdkRegion;
use aws_sdk_ec2::types::{
    Filter as SdkFilter, Instance as SdkInstance, InstanceStateName, InstanceType, Tag,
    VirtualizationType,
};
use aws_sdk_ec2::Client;
use chrono::{TimeZone, Utc};
use snafu::ResultExt;
use tracing::debug;

use crate::{
    CloudClient, CloudError, CloudInstance, CloudProvider, CreateTags, DescribeImages,
    DescribeInstances, Filter, InstanceId, InstanceState, LaunchRequest, MachineImage, Region,
    RunInstances, TerminateInstances, Virtualization,
};

/// Connects [`Ec2Client`]s from the ambient AWS credential chain
#[derive(Debug, Default)]
pub struct Ec2Provider {}

#[async_trait]
impl CloudProvider for Ec2Provider {
    async fn connect(&self, region: Region) -> Result<Arc<dyn CloudClient>, CloudError> {
        debug!("Connecting EC2 client for region {}", region);
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(SdkRegion::new(region.as_str()))
            .load()
            .await;
        Ok(Arc::new(Ec2Client {
            region,
            client: Client::new(&config),
        }))
    }
}

/// Thin EC2 adapter for one region
pub struct Ec2Client {
    region: Region,
    client: Client,
}

#[async_trait]
impl CloudClient for Ec2Client {
    fn region(&self) -> Region {
        self.region
    }

    async fn describe_instances(
        &self,
        filters: &[Filter],
    ) -> Result<Vec<CloudInstance>, CloudError> {
        let filters: Vec<SdkFilter> = filters
            .iter()
            .map(|(name, values)| {
                SdkFilter::builder()
                    .name(name)
                    .set_values(Some(values.clone()))
                    .build()
            })
            .collect();

        let mut instances = vec![];
        let mut next_token: Option<String> = None;
        loop {
            let response = self
                .client
                .describe_instances()
                .set_filters(Some(filters.clone()))
                .set_next_token(next_token)
                .send()
                .await
                .map_err(aws_sdk_ec2::Error::from)
                .context(DescribeInstances {
                    region: self.region,
                })?;

            for reservation in response.reservations() {
                for instance in reservation.instances() {
                    if let Some(instance) = convert_instance(self.region, instance) {
                        instances.push(instance);
                    }
                }
            }

            next_token = response.next_token().map(|token| token.to_string());
            if next_token.is_none() {
                break;
            }
        }
        Ok(instances)
    }

    async fn run_instances(
        &self,
        request: &LaunchRequest,
    ) -> Result<Vec<CloudInstance>, CloudError> {
        let response = self
            .client
            .run_instances()
            .image_id(&request.image)
            .min_count(request.count as i32)
            .max_count(request.count as i32)
            .instance_type(InstanceType::from(request.instance_type.as_str()))
            .key_name(&request.key_pair)
            .security_groups(&request.security_group)
            .set_user_data(request.user_data.as_ref().map(|data| base64::encode(data)))
            .send()
            .await
            .map_err(aws_sdk_ec2::Error::from)
            .context(RunInstances {
                region: self.region,
                count: request.count,
            })?;

        Ok(response
            .instances()
            .iter()
            .filter_map(|instance| convert_instance(self.region, instance))
            .collect())
    }

    async fn create_tags(
        &self,
        ids: &[InstanceId],
        tags: &[(String, String)],
    ) -> Result<(), CloudError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut call = self.client.create_tags();
        for id in ids {
            call = call.resources(&id.0);
        }
        for (key, value) in tags {
            call = call.tags(Tag::builder().key(key).value(value).build());
        }
        let _ = call
            .send()
            .await
            .map_err(aws_sdk_ec2::Error::from)
            .context(CreateTags {
                region: self.region,
            })?;
        Ok(())
    }

    async fn terminate_instances(&self, ids: &[InstanceId]) -> Result<(), CloudError> {
        if ids.is_empty() {
            return Ok(());
        }
        let _ = self
            .client
            .terminate_instances()
            .set_instance_ids(Some(ids.iter().map(|id| id.0.clone()).collect()))
            .send()
            .await
            .map_err(aws_sdk_ec2::Error::from)
            .context(TerminateInstances {
                region: self.region,
            })?;
        Ok(())
    }

    async fn describe_images(&self, owner_id: &str) -> Result<Vec<MachineImage>, CloudError> {
        let response = self
            .client
            .describe_images()
            .owners(owner_id)
            .send()
            .await
            .map_err(aws_sdk_ec2::Error::from)
            .context(DescribeImages {
                region: self.region,
            })?;

        Ok(response
            .images()
            .iter()
            .filter_map(|image| {
                let virtualization = match image.virtualization_type()? {
                    VirtualizationType::Hvm => Virtualization::Hvm,
                    VirtualizationType::Paravirtual => Virtualization::Paravirtual,
                    _ => return None,
                };
                Some(MachineImage {
                    id: image.image_id()?.to_string(),
                    name: image.name().unwrap_or_default().to_string(),
                    virtualization,
                })
            })
            .collect())
    }
}

fn convert_instance(region: Region, instance: &SdkInstance) -> Option<CloudInstance> {
    let id = InstanceId::from(instance.instance_id()?);
    let state = instance
        .state()
        .and_then(|state| state.name())
        .map(convert_state)
        .unwrap_or(InstanceState::Pending);
    let launch_time = instance
        .launch_time()
        .and_then(|time| Utc.timestamp_opt(time.secs(), time.subsec_nanos()).single());
    let tags: HashMap<String, String> = instance
        .tags()
        .iter()
        .filter_map(|tag| Some((tag.key()?.to_string(), tag.value()?.to_string())))
        .collect();

    Some(CloudInstance {
        id,
        region,
        instance_type: instance
            .instance_type()
            .map(|instance_type| instance_type.as_str().to_string())
            .unwrap_or_default(),
        public_ip: instance.public_ip_address().map(|ip| ip.to_string()),
        private_ip: instance.private_ip_address().map(|ip| ip.to_string()),
        state,
        launch_time,
        tags,
    })
}

fn convert_state(state: &InstanceStateName) -> InstanceState {
    match state {
        InstanceStateName::Pending => InstanceState::Pending,
        InstanceStateName::Running => InstanceState::Running,
        InstanceStateName::ShuttingDown | InstanceStateName::Stopping => InstanceState::Stopping,
        InstanceStateName::Stopped => InstanceState::Stopped,
        _ => InstanceState::Terminated,
    }
}
