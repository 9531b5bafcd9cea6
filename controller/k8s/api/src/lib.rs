#![forbid(unsafe_code)]

pub mod annotations;
pub mod labels;
pub mod policy;

pub use k8s_openapi::{
    api::core::v1::{
        Capabilities, Container, ContainerPort, EnvVar, HTTPGetAction, Namespace, Pod, PodSpec,
        PodStatus, Probe, ResourceRequirements, SecurityContext,
    },
    apimachinery::pkg::{
        api::resource::Quantity,
        apis::meta::v1::{Condition, Time},
        util::intstr::IntOrString,
    },
};
pub use kube::{
    api::{Api, ListParams, ObjectMeta, Patch, PatchParams, Resource, ResourceExt},
    error::ErrorResponse,
    Client, Error,
};
