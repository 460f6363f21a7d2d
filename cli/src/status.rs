use crate::table::{Column, Table};
use anyhow::Result;
use envoy_operator_controller::{Envoy, OWNED_SELECTOR};
use k8s_openapi::api::apps::v1::Deployment;
use kube::{api::ListParams, Api, Client, ResourceExt};
use serde::Serialize;
use std::{collections::HashMap, fmt::Display};

#[derive(Debug, PartialEq, Serialize)]
pub struct EnvoyStatus {
    namespace: String,
    name: String,
    status: DeploymentStatus,
    ready: i32,
    desired: i32,
}

#[derive(Debug, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
enum DeploymentStatus {
    Missing,
    Progressing,
    Ready,
}

impl Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Missing => Display::fmt("Missing", f),
            Self::Progressing => Display::fmt("Progressing", f),
            Self::Ready => Display::fmt("Ready", f),
        }
    }
}

pub async fn status(client: Client, label_selector: Option<&str>) -> Result<Vec<EnvoyStatus>> {
    let mut params = ListParams::default();
    if let Some(selector) = label_selector {
        params = params.labels(selector);
    }
    let envoys = Api::<Envoy>::all(client.clone()).list(&params).await?;

    let owned = ListParams::default().labels(OWNED_SELECTOR);
    let deployments = Api::<Deployment>::all(client).list(&owned).await?;

    Ok(summarize(envoys.items, deployments.items))
}

fn summarize(envoys: Vec<Envoy>, deployments: Vec<Deployment>) -> Vec<EnvoyStatus> {
    let deployments = deployments
        .into_iter()
        .map(|d| ((d.namespace().unwrap_or_default(), d.name_any()), d))
        .collect::<HashMap<_, _>>();

    envoys
        .into_iter()
        .map(|e| {
            let namespace = e.namespace().unwrap_or_default();
            let name = e.name_any();
            let desired = e.spec.deployment.replicas;
            let ready = deployments
                .get(&(namespace.clone(), name.clone()))
                .map(|d| {
                    d.status
                        .as_ref()
                        .and_then(|s| s.ready_replicas)
                        .unwrap_or(0)
                });
            let status = match ready {
                None => DeploymentStatus::Missing,
                Some(ready) if ready >= desired => DeploymentStatus::Ready,
                Some(_) => DeploymentStatus::Progressing,
            };
            EnvoyStatus {
                namespace,
                name,
                status,
                ready: ready.unwrap_or(0),
                desired,
            }
        })
        .collect()
}

pub fn print_status(results: &[EnvoyStatus]) {
    let table = Table {
        cols: vec![
            Column::new("NAMESPACE", |s: &EnvoyStatus| s.namespace.clone()),
            Column::new("ENVOY", |s: &EnvoyStatus| s.name.clone()),
            Column::new("STATUS", |s: &EnvoyStatus| s.status.to_string()),
            Column::new(
                "READY",
                |s: &EnvoyStatus| format!("{}/{}", s.ready, s.desired),
            ),
        ],
        data: results,
    };
    print!("{}", table);
}

pub fn json_print_status(results: &[EnvoyStatus]) -> Result<()> {
    serde_json::to_writer_pretty(std::io::stdout(), results)?;
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use envoy_operator_controller::{deployment, EnvoySpec};
    use k8s_openapi::api::apps::v1::DeploymentStatus as Observed;

    fn envoy(name: &str, replicas: i32) -> Envoy {
        let mut e = Envoy::new(
            name,
            EnvoySpec {
                image: "envoyproxy/envoy:v1.6.0".to_string(),
                ..EnvoySpec::default()
            },
        );
        e.spec.deployment.replicas = replicas;
        e.metadata.namespace = Some("edge".to_string());
        e
    }

    fn deployed(e: &Envoy, ready: i32) -> Deployment {
        let mut d = deployment::deployment(e, deployment::DEFAULT_INIT_IMAGE).unwrap();
        d.status = Some(Observed {
            ready_replicas: Some(ready),
            ..Observed::default()
        });
        d
    }

    #[test]
    fn summarizes_envoys() {
        let a = envoy("a", 2);
        let b = envoy("b", 2);
        let c = envoy("c", 1);
        let deployments = vec![deployed(&a, 2), deployed(&b, 1)];

        let statuses = summarize(vec![a, b, c], deployments);
        let summary = statuses
            .iter()
            .map(|s| (s.name.as_str(), &s.status, s.ready))
            .collect::<Vec<_>>();
        assert_eq!(
            summary,
            vec![
                ("a", &DeploymentStatus::Ready, 2),
                ("b", &DeploymentStatus::Progressing, 1),
                ("c", &DeploymentStatus::Missing, 0),
            ]
        );
    }

    #[test]
    fn renders_table() {
        let statuses = summarize(vec![envoy("front", 3)], vec![]);
        let table = Table {
            cols: vec![
                Column::new("ENVOY", |s: &EnvoyStatus| s.name.clone()),
                Column::new("STATUS", |s: &EnvoyStatus| s.status.to_string()),
            ],
            data: &statuses,
        };
        assert_eq!(
            table.to_string(),
            "ENVOY   STATUS    \nfront   Missing   \n"
        );
    }
}
