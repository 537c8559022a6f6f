//! The provider abstraction: the cloud-side collaborator that actually owns
//! artifact records. The core only depends on the two operations below;
//! everything else (authentication, the real artifact-listing API calls) is
//! out of scope per the overview.
//!
//! [`InMemoryProvider`] is the reference implementation used by every
//! example and test in this repository: it treats the id the builder tool
//! reported as the provider's own opaque tag and registers it directly.

use std::future::Future;

use tracing::instrument;

use crate::error::CoreResult;
use crate::model::Artifact;
use crate::registry::Registry;

/// A cloud provider's artifact catalog, as consumed by the coordinator.
pub trait Provider: Send + Sync {
    /// Register (and return) the artifact the builder tool reported by id.
    fn load_artifact_by_id(
        &self,
        registry: &Registry,
        id: &str,
        region: Option<&str>,
        image: &str,
        version: &str,
    ) -> impl Future<Output = CoreResult<Artifact>> + Send;

    /// Populate the registry with artifacts that already exist in the
    /// provider, so base-artifact resolution can find them without a build.
    fn load_existing_artifacts(&self, registry: &Registry, region: Option<&str>) -> impl Future<Output = CoreResult<()>> + Send;
}

/// A provider backed by nothing but the in-process registry.
#[derive(Clone, Copy, Debug, Default)]
pub struct InMemoryProvider;

impl Provider for InMemoryProvider {
    #[instrument(skip(self, registry))]
    async fn load_artifact_by_id(
        &self,
        registry: &Registry,
        id: &str,
        region: Option<&str>,
        image: &str,
        version: &str,
    ) -> CoreResult<Artifact> {
        let mut artifact = Artifact::managed(id, image, version);
        artifact.provider_tag = region.map(str::to_string);
        if let Ok(image_record) = registry.get_image(image) {
            artifact.environment = Some(image_record.environment.clone());
        }

        registry.register_artifact(artifact.clone())?;
        registry.associate_artifact(artifact.clone(), image, version)?;
        Ok(artifact)
    }

    async fn load_existing_artifacts(&self, _registry: &Registry, _region: Option<&str>) -> CoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ImageCatalog;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[tokio::test]
    async fn load_artifact_by_id_registers_and_associates() {
        let catalog = ImageCatalog::new([crate::model::Image {
            name: "fedora".to_string(),
            current_version: "25".to_string(),
            environment: "prod".to_string(),
            description: String::new(),
            template_path: "packer.yml".to_string(),
            base: None,
            archive: serde_json::json!({}),
            provision: None,
            instance_type: None,
            metadata: vec![],
            builder_overrides: serde_json::json!({}),
        }]);
        let registry = Registry::new(Arc::new(catalog));
        let provider = InMemoryProvider;

        let artifact = provider
            .load_artifact_by_id(&registry, "ami-abc", Some("us-east-1"), "fedora", "25")
            .await
            .unwrap();

        assert_eq!(artifact.id, "ami-abc");
        let image = registry.get_image("fedora").unwrap().clone();
        assert_eq!(registry.get_image_artifact(&image, Some("25")).unwrap(), artifact);
    }
}
