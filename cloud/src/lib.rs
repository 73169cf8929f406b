#![warn(missing_docs)]
//! IaaS capability used by the broker: the instance model, the tag
//! protocol which doubles as the recovery log, and the `CloudClient`
//! trait with its EC2 adapter.
//!
//! The orchestration core only ever sees the types in this crate;
//! provider SDK types never leak past the adapter.

use snafu::Snafu;

mod client;
mod ec2;
mod instance;
mod region;
pub mod tags;

pub use client::{CloudClient, CloudProvider, Filter, LaunchRequest, MachineImage};
pub use ec2::Ec2Provider;
pub use instance::{CloudInstance, InstanceId, InstanceState};
pub use region::Region;

use strum_macros::ToString;

/// Virtualization type of a machine image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ToString)]
#[strum(serialize_all = "lowercase")]
pub enum Virtualization {
    /// Hardware assisted virtualization
    Hvm,
    /// Paravirtual, required by the older instance families
    Paravirtual,
}

/// Identifier of a machine image within one region
pub type ImageId = String;

/// Common error type for all IaaS interactions
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum CloudError {
    #[snafu(display("Unknown region '{}'", region))]
    InvalidRegion { region: String },
    #[snafu(display("Failed to describe instances in {}", region))]
    DescribeInstances {
        region: Region,
        source: aws_sdk_ec2::Error,
    },
    #[snafu(display("Failed to launch {} instances in {}", count, region))]
    RunInstances {
        region: Region,
        count: u32,
        source: aws_sdk_ec2::Error,
    },
    #[snafu(display("Failed to tag instances in {}", region))]
    CreateTags {
        region: Region,
        source: aws_sdk_ec2::Error,
    },
    #[snafu(display("Failed to terminate instances in {}", region))]
    TerminateInstances {
        region: Region,
        source: aws_sdk_ec2::Error,
    },
    #[snafu(display("Failed to describe images in {}", region))]
    DescribeImages {
        region: Region,
        source: aws_sdk_ec2::Error,
    },
    #[snafu(display(
        "No {} image registered for region {}",
        virtualization.to_string(),
        region
    ))]
    ImageNotFound {
        region: Region,
        virtualization: Virtualization,
    },
    #[snafu(display("IaaS provider failure: {}", message))]
    Internal { message: String },
}
