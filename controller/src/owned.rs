//! Watches the objects created on behalf of envoys so that they are recreated if they are removed.

use super::{envoy, Ctx, Envoy};
use kube::{
    runtime::{reflector::ObjectRef, watcher::Event},
    Resource, ResourceExt,
};

pub fn handle<K>(ev: Event<K>, ctx: &Ctx)
where
    K: Resource<DynamicType = ()>,
{
    match ev {
        Event::Applied(obj) | Event::Deleted(obj) => {
            if let Some(owner) = owner(&obj) {
                tracing::debug!(
                    kind = %K::kind(&()),
                    name = %obj.name_any(),
                    "updating envoy for owned object",
                );
                envoy::update(owner, ctx);
            }
        }

        Event::Restarted(_) => {
            tracing::debug!(kind = %K::kind(&()), "updating envoys on restart");
            // On restart, reconcile all known envoys.
            for e in ctx.envoys.state() {
                envoy::update(ObjectRef::from_obj(&*e), ctx);
            }
        }
    }
}

/// Returns a reference to the envoy controlling `obj`, if any.
fn owner<K: Resource>(obj: &K) -> Option<ObjectRef<Envoy>> {
    let api_version = Envoy::api_version(&());
    let kind = Envoy::kind(&());
    obj.owner_references()
        .iter()
        .find(|o| o.controller == Some(true) && o.kind == kind && o.api_version == api_version)
        .map(|o| ObjectRef::new(&o.name).within(obj.namespace().as_deref().unwrap_or_default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        deployment,
        tests::{envoy, mk_ctx},
    };
    use k8s_openapi::api::apps::v1::Deployment;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn deleted_deployment_is_recreated() {
        let e = envoy("front", "");
        let d = deployment::deployment(&e, "init:test").unwrap();
        assert_eq!(owner(&d), Some(ObjectRef::from_obj(&e)));

        // The cache no longer holds the deployment.
        let cm = crate::bootstrap::config_map(&e).unwrap();
        let (ctx, mut rx) = mk_ctx(vec![e.clone()], vec![], vec![cm]);
        handle(Event::Deleted(d), &ctx);

        let c = assert_ok!(rx.try_recv());
        assert_eq!(c.target, ObjectRef::from_obj(&e));
        assert!(c.config_map.is_none());
        assert!(c.deployment.is_some());
    }

    #[test]
    fn unowned_objects_are_ignored() {
        let e = envoy("front", "");
        let mut d = deployment::deployment(&e, "init:test").unwrap();
        d.metadata.owner_references = None;
        assert_eq!(owner(&d), None);

        let (ctx, mut rx) = mk_ctx(vec![e], vec![], vec![]);
        handle(Event::Applied(d), &ctx);
        assert_err!(rx.try_recv());
    }

    #[test]
    fn restart_updates_all_envoys() {
        let (ctx, mut rx) = mk_ctx(vec![envoy("a", ""), envoy("b", "")], vec![], vec![]);
        handle::<Deployment>(Event::Restarted(vec![]), &ctx);
        assert_ok!(rx.try_recv());
        assert_ok!(rx.try_recv());
        assert_err!(rx.try_recv());
    }
}
