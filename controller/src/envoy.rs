use super::{bootstrap, deployment, Ctx};
use k8s_openapi::api::{apps::v1::Deployment, core::v1::ConfigMap};
use kube::{
    api::{Api, PostParams},
    runtime::{events, reflector::ObjectRef, watcher::Event},
    Resource,
};
use tokio::{sync::mpsc, time};

pub const FIELD_MANAGER: &str = "envoy-operator";

/// The `envoy.solo.io/Envoy` custom resource
#[derive(
    Clone,
    Debug,
    PartialEq,
    kube::CustomResource,
    serde::Deserialize,
    serde::Serialize,
    schemars::JsonSchema,
)]
#[kube(
    group = "envoy.solo.io",
    version = "v1alpha1",
    kind = "Envoy",
    shortname = "envoy",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct EnvoySpec {
    /// The Envoy proxy image.
    pub image: String,

    /// Overrides the image's entrypoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_command: Option<Vec<String>>,

    /// Template for the Envoy node id. May reference downward-API data, e.g. `{{ .PodName }}`.
    #[serde(default)]
    pub node_id_template: String,

    /// Template for the Envoy cluster name.
    #[serde(default)]
    pub cluster_id_template: String,

    /// The ADS management server. When unset, Envoy runs without dynamic resources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ads_server: Option<String>,

    #[serde(default = "default_ads_port")]
    pub ads_port: i32,

    /// A secret holding `tls.crt`, `tls.key` and `ca.crt`, mounted into the proxy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_secret_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_port: Option<i32>,

    #[serde(default)]
    pub deployment: EnvoyDeploymentSpec,
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
pub struct EnvoyDeploymentSpec {
    #[serde(default = "default_replicas")]
    pub replicas: i32,
}

/// Objects that must be created on behalf of an [`Envoy`]
#[derive(Clone, Debug, PartialEq)]
pub struct Create {
    pub target: ObjectRef<Envoy>,
    pub config_map: Option<ConfigMap>,
    pub deployment: Option<Deployment>,
}

fn default_ads_port() -> i32 {
    8081
}

fn default_replicas() -> i32 {
    1
}

impl Default for EnvoySpec {
    fn default() -> Self {
        Self {
            image: String::new(),
            image_command: None,
            node_id_template: String::new(),
            cluster_id_template: String::new(),
            ads_server: None,
            ads_port: default_ads_port(),
            tls_secret_name: None,
            admin_port: None,
            deployment: EnvoyDeploymentSpec::default(),
        }
    }
}

impl Default for EnvoyDeploymentSpec {
    fn default() -> Self {
        Self {
            replicas: default_replicas(),
        }
    }
}

impl EnvoySpec {
    /// The TLS secret name, if one is configured.
    pub fn tls_secret(&self) -> Option<&str> {
        self.tls_secret_name.as_deref().filter(|s| !s.is_empty())
    }
}

pub fn handle(ev: Event<Envoy>, ctx: &Ctx) {
    match ev {
        Event::Restarted(envoys) => {
            for envoy in &envoys {
                update(ObjectRef::from_obj(envoy), ctx);
            }
        }
        Event::Applied(envoy) => {
            update(ObjectRef::from_obj(&envoy), ctx);
        }
        Event::Deleted(_) => {
            // owned objects are garbage collected through their owner references.
        }
    }
}

/// Builds the objects owned by the referenced envoy. If any of them is missing from the cache, a
/// create is enqueued via the context.
#[tracing::instrument(skip_all, fields(
    namespace = target.namespace.as_deref().unwrap_or_default(),
    envoy = %target.name
))]
pub fn update(target: ObjectRef<Envoy>, ctx: &Ctx) {
    let namespace = match target.namespace.as_ref() {
        Some(ns) => ns,
        None => {
            tracing::warn!("envoy is not namespaced; skipping");
            return;
        }
    };
    tracing::debug!("checking envoy for update");

    let envoy = match ctx.envoys.get(&target) {
        Some(e) => e,
        None => {
            tracing::warn!("envoy not found");
            return;
        }
    };

    let config_map = if ctx.config_map_exists(namespace, &target.name) {
        tracing::trace!("config map exists");
        None
    } else {
        match bootstrap::config_map(&envoy) {
            Ok(cm) => Some(cm),
            Err(error) => {
                tracing::warn!(%error, "failed to build bootstrap config; skipping");
                return;
            }
        }
    };

    let deployment = if ctx.deployment_exists(namespace, &target.name) {
        tracing::trace!("deployment exists");
        None
    } else {
        match deployment::deployment(&envoy, &ctx.init_image) {
            Ok(d) => Some(d),
            Err(error) => {
                tracing::warn!(%error, "failed to build deployment; skipping");
                return;
            }
        }
    };

    if config_map.is_none() && deployment.is_none() {
        tracing::debug!("no update necessary");
        return;
    }

    let create = Create {
        target,
        config_map,
        deployment,
    };
    if let Err(e) = ctx.creates.try_send(create) {
        match e {
            mpsc::error::TrySendError::Full(c) => {
                tracing::error!(envoy = %c.target, "dropping create because the channel is full");
            }
            mpsc::error::TrySendError::Closed(c) => {
                tracing::error!(envoy = %c.target, "dropping create because the channel is closed");
            }
        }
    }
}

/// Reads from `creates` and creates the owned objects. Writes are serialized on a single task.
pub async fn apply_creates(
    mut creates: mpsc::Receiver<Create>,
    client: kube::Client,
    timeout: time::Duration,
) {
    let params = PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..PostParams::default()
    };
    while let Some(c) = creates.recv().await {
        apply(client.clone(), &params, timeout, c).await;
    }
    tracing::debug!("create stream ended");
}

#[tracing::instrument(skip_all, fields(
    namespace = target.namespace.as_deref().unwrap_or_default(),
    envoy = %target.name
))]
async fn apply(
    client: kube::Client,
    params: &PostParams,
    timeout: time::Duration,
    Create {
        target,
        config_map,
        deployment,
    }: Create,
) {
    let namespace = match target.namespace.as_deref() {
        Some(ns) => ns,
        None => return,
    };

    let mut created = Vec::new();
    if let Some(cm) = config_map {
        let api = Api::<ConfigMap>::namespaced(client.clone(), namespace);
        if create(&api, params, timeout, &cm).await {
            created.push("configmap");
        }
    }
    if let Some(d) = deployment {
        let api = Api::<Deployment>::namespaced(client.clone(), namespace);
        if create(&api, params, timeout, &d).await {
            created.push("deployment");
        }
    }
    if created.is_empty() {
        return;
    }

    let event_reporter = events::Reporter {
        controller: FIELD_MANAGER.to_string(),
        instance: None,
    };
    let event_recorder = events::Recorder::new(client, event_reporter, target.clone().into());
    if let Err(error) = event_recorder
        .publish(events::Event {
            type_: events::EventType::Normal,
            reason: "Created".to_string(),
            note: Some(format!("envoy/{} created {}", target.name, created.join(", "))),
            action: "Create".to_string(),
            secondary: None,
        })
        .await
    {
        tracing::error!(%error, "failed to record event");
    }
}

/// Creates `obj`, returning true if it was created by this call. An object that already exists is
/// left untouched.
async fn create<K>(api: &Api<K>, params: &PostParams, timeout: time::Duration, obj: &K) -> bool
where
    K: Resource + Clone + std::fmt::Debug + serde::Serialize + serde::de::DeserializeOwned,
    K::DynamicType: Default,
{
    let kind = K::kind(&Default::default()).to_string();
    let name = obj.meta().name.clone().unwrap_or_default();
    tracing::debug!(%kind, %name, "creating");

    match time::timeout(timeout, api.create(params, obj)).await {
        Ok(Ok(_)) => {
            tracing::info!(%kind, %name, "created");
            true
        }
        Ok(Err(kube::Error::Api(resp))) if resp.code == 409 => {
            tracing::debug!(%kind, %name, "already exists");
            false
        }
        Ok(Err(error)) => {
            tracing::warn!(%kind, %name, %error, "failed to create");
            false
        }
        Err(_) => {
            tracing::warn!(%kind, %name, ?timeout, "timed out creating");
            false
        }
    }
}
