//! Kausality kube integration: shared client bootstrap and dynamic-object
//! API construction for arbitrary group/version/kinds.

#![forbid(unsafe_code)]

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::Discovery,
    Client,
};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

static CLIENT: OnceCell<Client> = OnceCell::const_new();
static RESOURCES: OnceCell<HashMap<String, ApiResource>> = OnceCell::const_new();

/// Process-wide kube client, built once from the ambient config.
pub async fn get_kube_client() -> Result<Client> {
    let client = CLIENT
        .get_or_try_init(|| async {
            debug!("initializing kube client from default config");
            Client::try_default().await
        })
        .await?;
    Ok(client.clone())
}

/// Split an apiVersion into (group, version). Core-group kinds carry a bare
/// version ("v1"); anything with more than one slash is malformed.
pub fn parse_api_version(api_version: &str) -> Result<(String, String)> {
    if api_version.is_empty() {
        return Err(anyhow!("empty apiVersion"));
    }
    match api_version.split_once('/') {
        None => Ok((String::new(), api_version.to_string())),
        Some((group, version)) => {
            if group.is_empty() || version.is_empty() || version.contains('/') {
                return Err(anyhow!("invalid apiVersion: {}", api_version));
            }
            Ok((group.to_string(), version.to_string()))
        }
    }
}

fn gvk_key(gvk: &GroupVersionKind) -> String {
    format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
}

/// Server-advertised resources, fetched once per process. A failed discovery
/// run leaves the map empty; lookups then fall back to inferred plurals.
async fn discovered_resources(client: &Client) -> &'static HashMap<String, ApiResource> {
    RESOURCES
        .get_or_init(|| async {
            let mut map = HashMap::new();
            match Discovery::new(client.clone()).run().await {
                Ok(discovery) => {
                    for group in discovery.groups() {
                        for (ar, _caps) in group.recommended_resources() {
                            map.insert(gvk_key(&GroupVersionKind {
                                group: ar.group.clone(),
                                version: ar.version.clone(),
                                kind: ar.kind.clone(),
                            }), ar);
                        }
                    }
                    debug!(resources = map.len(), "api discovery cached");
                }
                Err(err) => {
                    warn!(error = %err, "api discovery failed; falling back to inferred plurals");
                }
            }
            map
        })
        .await
}

/// Prefer the server-advertised resource (authoritative plural, covers kinds
/// with irregular naming); infer from the kind for anything the cache does
/// not know, such as CRDs installed after startup.
fn resource_for(cache: &HashMap<String, ApiResource>, gvk: &GroupVersionKind) -> ApiResource {
    cache
        .get(&gvk_key(gvk))
        .cloned()
        .unwrap_or_else(|| ApiResource::from_gvk(gvk))
}

/// Dynamic API for a kind named by an owner reference. Discovery runs once
/// and is cached; admission-path lookups cannot afford a round-trip per
/// request.
pub async fn dynamic_api(
    client: Client,
    api_version: &str,
    kind: &str,
    namespace: Option<&str>,
) -> Result<Api<DynamicObject>> {
    let (group, version) = parse_api_version(api_version)?;
    let gvk = GroupVersionKind { group, version, kind: kind.to_string() };
    let ar = resource_for(discovered_resources(&client).await, &gvk);
    Ok(match namespace {
        Some(ns) => Api::namespaced_with(client, ns, &ar),
        None => Api::all_with(client, &ar),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_api_version_accepts_core_and_grouped() {
        assert_eq!(parse_api_version("v1").unwrap(), (String::new(), "v1".to_string()));
        assert_eq!(
            parse_api_version("apps/v1").unwrap(),
            ("apps".to_string(), "v1".to_string())
        );
        assert_eq!(
            parse_api_version("database.example.org/v1alpha1").unwrap(),
            ("database.example.org".to_string(), "v1alpha1".to_string())
        );
    }

    #[test]
    fn parse_api_version_rejects_malformed() {
        assert!(parse_api_version("").is_err());
        assert!(parse_api_version("a/b/c").is_err());
        assert!(parse_api_version("/v1").is_err());
        assert!(parse_api_version("apps/").is_err());
    }

    #[test]
    fn lookup_prefers_discovered_plural_over_inference() {
        // Multus declares a dashed plural that no pluralization rule infers.
        let gvk = GroupVersionKind {
            group: "k8s.cni.cncf.io".into(),
            version: "v1".into(),
            kind: "NetworkAttachmentDefinition".into(),
        };
        let advertised = ApiResource {
            group: gvk.group.clone(),
            version: gvk.version.clone(),
            api_version: "k8s.cni.cncf.io/v1".into(),
            kind: gvk.kind.clone(),
            plural: "network-attachment-definitions".into(),
        };
        let mut cache = HashMap::new();
        cache.insert(gvk_key(&gvk), advertised);

        assert_eq!(resource_for(&cache, &gvk).plural, "network-attachment-definitions");
    }

    #[test]
    fn lookup_falls_back_to_inference_on_cache_miss() {
        let gvk = GroupVersionKind {
            group: "apps".into(),
            version: "v1".into(),
            kind: "Deployment".into(),
        };
        let ar = resource_for(&HashMap::new(), &gvk);
        assert_eq!(ar.plural, "deployments");
        assert_eq!(ar.api_version, "apps/v1");
    }
}
