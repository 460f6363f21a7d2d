use k8s_openapi::{
    api::{apps::v1::Deployment, core::v1::Namespace},
    apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
};
use kube::{api::ListParams, Api, Client, ResourceExt};
use serde::Serialize;

const CHECK: &str = "√";
const EX: &str = "×";

const CATEGORY: &str = "envoy-operator";
pub const CRD_NAME: &str = "envoys.envoy.solo.io";
pub const NAMESPACE_SELECTOR: &str = "app.kubernetes.io/part-of=envoy-operator";
pub const CONTROLLER_NAME: &str = "envoy-operator";

const CRD_HINT: &str = "install the CRD with `envoy-operator crd | kubectl apply -f -`";
const INSTALL_HINT: &str = "check that the operator is installed and its pods are running";

#[derive(Serialize)]
struct CheckOutput {
    success: bool,
    categories: Vec<Category>,
}

#[derive(Serialize)]
struct Category {
    category_name: &'static str,
    checks: Vec<CheckResult>,
}

#[derive(Debug, Serialize, Default)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    #[default]
    Success,
    Error,
}

#[derive(Debug, Serialize, Default)]
pub struct CheckResult {
    description: &'static str,
    result: CheckStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl CheckResult {
    pub fn success(&self) -> bool {
        matches!(self.result, CheckStatus::Success)
    }

    fn ok(description: &'static str) -> Self {
        Self {
            description,
            result: CheckStatus::Success,
            ..Default::default()
        }
    }

    fn failed(description: &'static str, error: impl ToString, hint: &'static str) -> Self {
        Self {
            description,
            result: CheckStatus::Error,
            error: Some(error.to_string()),
            hint: Some(hint),
        }
    }
}

pub async fn crd_check(client: Client) -> CheckResult {
    let api = Api::<CustomResourceDefinition>::all(client);
    let description = "Envoy CRD exists";
    match api.get_opt(CRD_NAME).await {
        Ok(Some(_)) => CheckResult::ok(description),
        Ok(None) => CheckResult::failed(description, "Envoy CRD is not installed", CRD_HINT),
        Err(err) => CheckResult::failed(description, err, CRD_HINT),
    }
}

pub async fn namespace_check(client: Client) -> (CheckResult, Option<String>) {
    let api = Api::<Namespace>::all(client);
    let description = "operator namespace exists";
    let selector = ListParams::default().labels(NAMESPACE_SELECTOR);
    match api.list(&selector).await {
        Ok(objs) => match objs.items.as_slice() {
            [ns] => (CheckResult::ok(description), Some(ns.name_any())),
            [] => (
                CheckResult::failed(description, "operator namespace not found", INSTALL_HINT),
                None,
            ),
            _ => (
                CheckResult::failed(
                    description,
                    "multiple operator namespaces found",
                    INSTALL_HINT,
                ),
                None,
            ),
        },
        Err(err) => (CheckResult::failed(description, err, INSTALL_HINT), None),
    }
}

pub async fn deploy_check(client: Client, ns: &str) -> CheckResult {
    let api = Api::<Deployment>::namespaced(client, ns);
    let description = "operator controller is healthy";
    match api.get_opt(CONTROLLER_NAME).await {
        Ok(Some(deploy)) => deployment_available(description, &deploy),
        Ok(None) => CheckResult::failed(
            description,
            "envoy-operator deployment not found",
            INSTALL_HINT,
        ),
        Err(err) => CheckResult::failed(description, err, INSTALL_HINT),
    }
}

fn deployment_available(description: &'static str, deploy: &Deployment) -> CheckResult {
    let has_available_replicas = deploy
        .status
        .as_ref()
        .and_then(|status| status.available_replicas)
        .map_or(false, |replicas| replicas > 0);

    if has_available_replicas {
        CheckResult::ok(description)
    } else {
        CheckResult::failed(
            description,
            "envoy-operator deployment has no available replicas",
            INSTALL_HINT,
        )
    }
}

pub async fn run_checks(client: Client, pre: bool) -> Vec<CheckResult> {
    let mut results = vec![crd_check(client.clone()).await];
    if pre {
        return results;
    }

    let (result, ns) = namespace_check(client.clone()).await;
    results.push(result);

    if let Some(ns) = ns {
        results.push(deploy_check(client, &ns).await);
    }

    results
}

pub fn print_checks(results: Vec<CheckResult>) -> bool {
    let mut success = true;
    println!("{}", CATEGORY);
    println!("{}", CATEGORY.chars().map(|_| '-').collect::<String>());
    for result in results {
        match result.result {
            CheckStatus::Success => {
                println!("{} {}", CHECK, result.description);
            }
            CheckStatus::Error => {
                success = false;
                println!("{} {}", EX, result.description);
                if let Some(error) = result.error {
                    println!("    {}", error);
                }
                if let Some(hint) = result.hint {
                    println!("    hint: {}", hint);
                }
            }
        }
    }

    println!();
    let success_symbol = if success { CHECK } else { EX };
    println!("Status check results are {}", success_symbol);
    success
}

pub fn json_print_checks(results: Vec<CheckResult>) -> anyhow::Result<bool> {
    let success = results.iter().all(CheckResult::success);
    let output = CheckOutput {
        success,
        categories: vec![Category {
            category_name: CATEGORY,
            checks: results,
        }],
    };
    serde_json::to_writer_pretty(std::io::stdout(), &output)?;
    println!();
    Ok(success)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DeploymentStatus;

    #[test]
    fn deployment_availability() {
        let mut deploy = Deployment::default();
        assert!(!deployment_available("d", &deploy).success());

        deploy.status = Some(DeploymentStatus {
            available_replicas: Some(0),
            ..DeploymentStatus::default()
        });
        let result = deployment_available("d", &deploy);
        assert!(!result.success());
        assert!(result.hint.is_some());

        deploy.status = Some(DeploymentStatus {
            available_replicas: Some(2),
            ..DeploymentStatus::default()
        });
        assert!(deployment_available("d", &deploy).success());
    }

    #[test]
    fn serializes_results() {
        let value = serde_json::to_value(CheckResult::failed("crd", "missing", CRD_HINT)).unwrap();
        assert_eq!(value["result"], "error");
        assert_eq!(value["error"], "missing");

        let value = serde_json::to_value(CheckResult::ok("crd")).unwrap();
        assert_eq!(value, serde_json::json!({ "description": "crd", "result": "success" }));
    }
}
