//! Container-platform abstraction for Bay.
//!
//! The [`Driver`] trait is the only surface higher layers use to talk to a
//! container platform. Two implementations ship with the crate:
//! [`docker::DockerDriver`] (bollard) and [`k8s::K8sDriver`] (kube). Drivers
//! handle container, volume and network lifecycle plus endpoint resolution;
//! they do not handle auth, retries, audit or quota.
//!
//! Every resource a driver creates is labelled (see [`labels`]) so the
//! garbage collector can discover and fence its own resources.

pub mod docker;
pub mod error;
pub mod k8s;
pub mod labels;
pub mod profile;

mod driver;

pub use driver::{
    CargoHandle, ContainerInfo, ContainerStatus, Driver, MultiContainerInfo, RuntimeInstance,
    SessionHandle, WORKSPACE_MOUNT_PATH,
};
pub use error::{DriverError, DriverResult};
pub use profile::{ContainerSpec, Profile, ResourceSpec, StartupConfig, StartupOrder};
