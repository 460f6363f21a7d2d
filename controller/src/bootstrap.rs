//! The Envoy bootstrap config, delivered as a [`ConfigMap`] named after the [`Envoy`].
//!
//! The node id and cluster are written as the raw templates; the init container renders them
//! once downward-API data is available in the pod.

use crate::{deployment, downward, Envoy, Error};
use k8s_openapi::api::core::v1::ConfigMap;
use serde_json::{json, Value};
use std::collections::BTreeMap;

pub const XDS_CLUSTER: &str = "xds_cluster";

/// Builds the bootstrap config map. Fails if any string in the document, not only the node and
/// cluster templates, would not render in the init container.
pub fn config_map(envoy: &Envoy) -> Result<ConfigMap, Error> {
    let doc = config(envoy);
    downward::parse_json(&doc)?;
    let config = serde_json::to_string_pretty(&doc)?;

    let mut data = BTreeMap::new();
    data.insert(deployment::CONFIG_FILE.to_string(), config);

    Ok(ConfigMap {
        metadata: deployment::owned_meta(envoy),
        data: Some(data),
        ..ConfigMap::default()
    })
}

pub fn config(envoy: &Envoy) -> Value {
    let spec = &envoy.spec;
    let mut config = json!({
        "node": {
            "id": spec.node_id_template,
            "cluster": spec.cluster_id_template,
        },
    });

    if let Some(port) = spec.admin_port.filter(|p| *p != 0) {
        config["admin"] = json!({
            "access_log_path": "/dev/null",
            "address": socket_address("0.0.0.0", port),
        });
    }

    if let Some(server) = spec.ads_server.as_deref().filter(|s| !s.is_empty()) {
        let mut cluster = json!({
            "name": XDS_CLUSTER,
            "connect_timeout": "5s",
            "type": "STRICT_DNS",
            "http2_protocol_options": {},
            "hosts": [socket_address(server, spec.ads_port)],
        });
        if spec.tls_secret().is_some() {
            cluster["tls_context"] = tls_context();
        }

        config["dynamic_resources"] = json!({
            "ads_config": {
                "api_type": "GRPC",
                "grpc_services": [{ "envoy_grpc": { "cluster_name": XDS_CLUSTER } }],
            },
            "cds_config": { "ads": {} },
            "lds_config": { "ads": {} },
        });
        config["static_resources"] = json!({ "clusters": [cluster] });
    }

    config
}

fn socket_address(address: &str, port: i32) -> Value {
    json!({ "socket_address": { "address": address, "port_value": port } })
}

fn tls_context() -> Value {
    let file = |name: &str| json!({ "filename": format!("{}/{}", deployment::TLS_PATH, name) });
    json!({
        "common_tls_context": {
            "tls_certificates": [{
                "certificate_chain": file("tls.crt"),
                "private_key": file("tls.key"),
            }],
            "validation_context": {
                "trusted_ca": file("ca.crt"),
            },
        },
    })
}
