#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod bootstrap;
pub mod deployment;
pub mod downward;
pub mod envoy;
pub mod init;
pub mod owned;

use futures::prelude::*;
use k8s_openapi::api::{apps::v1::Deployment, core::v1::ConfigMap};
use kube::runtime::{
    reflector::{store::Store, ObjectRef},
    watcher::Event,
};
use std::sync::Arc;
use tokio::sync::mpsc;

pub use self::envoy::{Create, Envoy, EnvoySpec};

/// Label selector matching the objects created on behalf of envoys.
pub const OWNED_SELECTOR: &str = "app=envoy";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid template: {0}")]
    Template(#[from] downward::Error),

    #[error("failed to serialize bootstrap config: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Clone)]
pub struct Ctx {
    pub envoys: Store<Envoy>,
    pub deployments: Store<Deployment>,
    pub config_maps: Store<ConfigMap>,
    pub creates: mpsc::Sender<Create>,
    pub init_image: Arc<str>,
}

impl Ctx {
    pub async fn process<T, S>(self, events: S, handle: fn(Event<T>, &Self))
    where
        S: Stream<Item = Event<T>>,
    {
        tokio::pin!(events);
        while let Some(ev) = events.next().await {
            handle(ev, &self);
        }
    }

    fn deployment_exists(&self, namespace: &str, name: &str) -> bool {
        self.deployments
            .get(&ObjectRef::new(name).within(namespace))
            .is_some()
    }

    fn config_map_exists(&self, namespace: &str, name: &str) -> bool {
        self.config_maps
            .get(&ObjectRef::new(name).within(namespace))
            .is_some()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use kube::runtime::reflector::store::Writer;

    pub fn envoy(name: &str, node_id_template: &str) -> Envoy {
        let mut e = Envoy::new(
            name,
            EnvoySpec {
                image: "envoyproxy/envoy:v1.6.0".to_string(),
                node_id_template: node_id_template.to_string(),
                ..EnvoySpec::default()
            },
        );
        e.metadata.namespace = Some("default".to_string());
        e.metadata.uid = Some(format!("uid-{}", name));
        e
    }

    fn store<K>(objs: Vec<K>) -> Store<K>
    where
        K: kube::Resource<DynamicType = ()> + Clone + 'static,
    {
        let mut writer = Writer::default();
        writer.apply_watcher_event(&Event::Restarted(objs));
        writer.as_reader()
    }

    pub fn mk_ctx(
        envoys: Vec<Envoy>,
        deployments: Vec<Deployment>,
        config_maps: Vec<ConfigMap>,
    ) -> (Ctx, mpsc::Receiver<Create>) {
        let (tx, rx) = mpsc::channel(10);
        let ctx = Ctx {
            envoys: store(envoys),
            deployments: store(deployments),
            config_maps: store(config_maps),
            creates: tx,
            init_image: deployment::DEFAULT_INIT_IMAGE.into(),
        };
        (ctx, rx)
    }
}
