//! Builds the proxy [`Deployment`] for an [`Envoy`].
//!
//! The pod runs two containers: `envoy-init` renders the bootstrap config from the (read-only)
//! config map mount into a scratch volume, substituting downward-API data, and `envoy` runs the
//! proxy against the rendered file.

use crate::{
    downward::{self, Needed},
    Envoy, Error,
};
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment},
        core::v1::{
            ConfigMapVolumeSource, Container, ContainerPort, DownwardAPIVolumeFile,
            DownwardAPIVolumeSource, EmptyDirVolumeSource, EnvVar, EnvVarSource,
            ObjectFieldSelector, PodSpec, PodTemplateSpec, SecretVolumeSource, Volume,
            VolumeMount,
        },
    },
    apimachinery::pkg::{apis::meta::v1::LabelSelector, util::intstr::IntOrString},
};
use kube::{api::ObjectMeta, Resource, ResourceExt};
use std::collections::BTreeMap;

pub const DEFAULT_INIT_IMAGE: &str = "soloio/envoy-operator-init:0.1";

pub const DOWNWARD_VOLUME: &str = "downward-api-volume";
pub const DOWNWARD_PATH: &str = "/etc/podinfo";

pub const CONFIG_VOLUME: &str = "envoy-config";
pub const CONFIG_PATH: &str = "/etc/tmp-envoy";

// Config map mounts are read-only, so the rendered config is written to a scratch volume.
pub const RENDERED_CONFIG_VOLUME: &str = "envoy-tmp-config";
pub const RENDERED_CONFIG_PATH: &str = "/etc/envoy";

pub const TLS_VOLUME: &str = "tls-certs";
pub const TLS_PATH: &str = "/etc/envoy-tls";

pub const CONFIG_FILE: &str = "envoy.json";

pub fn source_config_file() -> String {
    format!("{}/{}", CONFIG_PATH, CONFIG_FILE)
}

pub fn rendered_config_file() -> String {
    format!("{}/{}", RENDERED_CONFIG_PATH, CONFIG_FILE)
}

pub fn labels(envoy: &Envoy) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), "envoy".to_string());
    labels.insert("envoy_cluster".to_string(), envoy.name_any());
    labels
}

/// Metadata shared by all objects owned by `envoy`.
pub fn owned_meta(envoy: &Envoy) -> ObjectMeta {
    ObjectMeta {
        name: Some(envoy.name_any()),
        namespace: envoy.namespace(),
        labels: Some(labels(envoy)),
        owner_references: envoy.controller_owner_ref(&()).map(|o| vec![o]),
        ..ObjectMeta::default()
    }
}

/// Determines the downward-API volumes and environment variables needed to render the envoy's
/// node and cluster templates.
pub fn downward(envoy: &Envoy) -> Result<(Vec<Volume>, Vec<EnvVar>), downward::Error> {
    let needed = Needed::from_templates(vec![
        envoy.spec.node_id_template.as_str(),
        envoy.spec.cluster_id_template.as_str(),
    ])?;

    let mut volumes = Vec::new();
    if needed.volume() {
        volumes.push(downward_volume(needed.pod_labels, needed.pod_annotations));
    }

    let mut env = Vec::new();
    if needed.pod_name {
        env.push(field_env("POD_NAME", "metadata.name"));
    }
    if needed.pod_namespace {
        env.push(field_env("POD_NAMESPACE", "metadata.namespace"));
    }
    if needed.pod_ip {
        env.push(field_env("POD_IP", "status.podIP"));
    }
    if needed.pod_svc_account {
        env.push(field_env("POD_SVCACCNT", "spec.serviceAccountName"));
    }
    if needed.pod_uid {
        env.push(field_env("POD_UID", "metadata.uid"));
    }
    if needed.node_name {
        env.push(field_env("NODE_NAME", "spec.nodeName"));
    }
    if needed.node_ip {
        env.push(field_env("NODE_IP", "status.hostIP"));
    }

    Ok((volumes, env))
}

fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..ObjectFieldSelector::default()
            }),
            ..EnvVarSource::default()
        }),
        ..EnvVar::default()
    }
}

fn downward_volume(pod_labels: bool, pod_annotations: bool) -> Volume {
    let item = |path: &str, field_path: &str| DownwardAPIVolumeFile {
        path: path.to_string(),
        field_ref: Some(ObjectFieldSelector {
            field_path: field_path.to_string(),
            ..ObjectFieldSelector::default()
        }),
        ..DownwardAPIVolumeFile::default()
    };

    let mut items = Vec::new();
    if pod_labels {
        items.push(item(downward::LABELS_FILE, "metadata.labels"));
    }
    if pod_annotations {
        items.push(item(downward::ANNOTATIONS_FILE, "metadata.annotations"));
    }

    Volume {
        name: DOWNWARD_VOLUME.to_string(),
        downward_api: Some(DownwardAPIVolumeSource {
            items: Some(items),
            ..DownwardAPIVolumeSource::default()
        }),
        ..Volume::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..VolumeMount::default()
    }
}

/// The volumes that do not depend on downward-API usage.
pub fn base_volumes(envoy: &Envoy) -> Vec<Volume> {
    let mut volumes = vec![
        Volume {
            name: CONFIG_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: Some(envoy.name_any()),
                ..ConfigMapVolumeSource::default()
            }),
            ..Volume::default()
        },
        Volume {
            name: RENDERED_CONFIG_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Volume::default()
        },
    ];

    if let Some(secret) = envoy.spec.tls_secret() {
        volumes.push(Volume {
            name: TLS_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret.to_string()),
                ..SecretVolumeSource::default()
            }),
            ..Volume::default()
        });
    }

    volumes
}

pub fn envoy_container(envoy: &Envoy) -> Container {
    let mut mounts = vec![mount(RENDERED_CONFIG_VOLUME, RENDERED_CONFIG_PATH)];
    if envoy.spec.tls_secret().is_some() {
        mounts.push(mount(TLS_VOLUME, TLS_PATH));
    }

    let ports = envoy.spec.admin_port.filter(|p| *p != 0).map(|port| {
        vec![ContainerPort {
            container_port: port,
            name: Some("admin".to_string()),
            ..ContainerPort::default()
        }]
    });

    Container {
        name: "envoy".to_string(),
        image: Some(envoy.spec.image.clone()),
        command: envoy.spec.image_command.clone(),
        args: Some(vec![
            "-c".to_string(),
            rendered_config_file(),
            "--v2-config-only".to_string(),
        ]),
        volume_mounts: Some(mounts),
        ports,
        ..Container::default()
    }
}

pub fn init_container(env: Vec<EnvVar>, downward_mounted: bool, image: &str) -> Container {
    let mut mounts = vec![
        mount(CONFIG_VOLUME, CONFIG_PATH),
        mount(RENDERED_CONFIG_VOLUME, RENDERED_CONFIG_PATH),
    ];
    if downward_mounted {
        mounts.push(mount(DOWNWARD_VOLUME, DOWNWARD_PATH));
    }

    Container {
        name: "envoy-init".to_string(),
        image: Some(image.to_string()),
        args: Some(vec![
            "--input".to_string(),
            source_config_file(),
            "--output".to_string(),
            rendered_config_file(),
            "--podinfo".to_string(),
            DOWNWARD_PATH.to_string(),
        ]),
        env: if env.is_empty() { None } else { Some(env) },
        volume_mounts: Some(mounts),
        ..Container::default()
    }
}

pub fn deployment(envoy: &Envoy, init_image: &str) -> Result<Deployment, Error> {
    let (downward_volumes, env) = downward(envoy)?;
    let downward_mounted = !downward_volumes.is_empty();

    let mut volumes = base_volumes(envoy);
    volumes.extend(downward_volumes);

    let labels = labels(envoy);
    let template = PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels.clone()),
            ..ObjectMeta::default()
        }),
        spec: Some(PodSpec {
            init_containers: Some(vec![init_container(env, downward_mounted, init_image)]),
            containers: vec![envoy_container(envoy)],
            volumes: Some(volumes),
            ..PodSpec::default()
        }),
    };

    Ok(Deployment {
        metadata: owned_meta(envoy),
        spec: Some(DeploymentSpec {
            replicas: Some(envoy.spec.deployment.replicas),
            selector: LabelSelector {
                match_labels: Some(labels),
                ..LabelSelector::default()
            },
            template,
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateDeployment {
                    max_unavailable: Some(IntOrString::Int(1)),
                    max_surge: Some(IntOrString::Int(1)),
                }),
            }),
            ..DeploymentSpec::default()
        }),
        status: None,
    })
}
