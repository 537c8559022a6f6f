//! The in-memory registry: indexes of images and artifacts, plus cycle
//! detection over the image dependency graph.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::instrument;

use crate::error::{CoreError, CoreResult};
use crate::model::{Artifact, Image, ImageCatalog};

/// Images plus the artifacts registered against them.
///
/// `by_key` indexes artifacts under their derived key (`image:version` for
/// managed artifacts, `name` for unmanaged ones) and additionally under
/// their provider id. `versions` indexes `(image, version) -> artifact`
/// separately so [`Registry::get_image_artifact`] doesn't need to guess a key.
pub struct Registry {
    catalog: Arc<ImageCatalog>,
    by_key: DashMap<String, Artifact>,
    versions: DashMap<(String, String), Artifact>,
}

impl Registry {
    pub fn new(catalog: Arc<ImageCatalog>) -> Self {
        Self {
            catalog,
            by_key: DashMap::new(),
            versions: DashMap::new(),
        }
    }

    pub fn catalog(&self) -> &ImageCatalog {
        &self.catalog
    }

    pub fn get_image(&self, name: &str) -> CoreResult<&Image> {
        self.catalog.get(name).ok_or_else(|| CoreError::unknown_image(name))
    }

    /// Register an artifact under its derived key and its provider id.
    /// Idempotent for re-registering the identical artifact; a conflicting
    /// artifact under the same key is a configuration error.
    #[instrument(skip(self, artifact), fields(key = %artifact.key()))]
    pub fn register_artifact(&self, artifact: Artifact) -> CoreResult<()> {
        let key = artifact.key();
        if let Some(existing) = self.by_key.get(&key) {
            if *existing != artifact {
                return Err(CoreError::configuration(format!(
                    "conflicting artifact registered under key {key:?}"
                )));
            }
        } else {
            self.by_key.insert(key, artifact.clone());
        }
        self.by_key.entry(artifact.id.clone()).or_insert_with(|| artifact.clone());
        Ok(())
    }

    /// Associate `artifact` with `(image, version)`. A second, conflicting
    /// artifact registered for the same version is a configuration error.
    pub fn associate_artifact(&self, artifact: Artifact, image: &str, version: &str) -> CoreResult<()> {
        let key = (image.to_string(), version.to_string());
        if let Some(existing) = self.versions.get(&key) {
            if *existing != artifact {
                return Err(CoreError::configuration(format!(
                    "duplicate artifact registered for {image}:{version}"
                )));
            }
        } else {
            self.versions.insert(key, artifact);
        }
        Ok(())
    }

    pub fn get_image_artifact(&self, image: &Image, version: Option<&str>) -> Option<Artifact> {
        let version = version.unwrap_or(&image.current_version);
        self.versions
            .get(&(image.name.clone(), version.to_string()))
            .map(|entry| entry.clone())
    }

    pub fn get_artifact_by_name(&self, name: &str) -> CoreResult<Artifact> {
        self.by_key
            .get(name)
            .map(|entry| entry.clone())
            .ok_or_else(|| CoreError::unknown_artifact(name))
    }

    /// Validate the image dependency graph (ignoring base references that
    /// resolve to external artifacts, not catalog images) and return a
    /// topological level-ordering.
    pub fn check_cycles(&self) -> CoreResult<Vec<Vec<String>>> {
        let mut edges = BTreeMap::new();
        for image in self.catalog.iter() {
            let mut deps = BTreeSet::new();
            if let Some((base_name, _)) = image.base_with_version() {
                if self.catalog.contains(base_name) {
                    deps.insert(base_name.to_string());
                }
            }
            edges.insert(image.name.clone(), deps);
        }
        topological_sort(edges).map_err(|residual| {
            CoreError::configuration(format!("dependency cycle detected among edges: {residual:?}"))
        })
    }
}

/// Kahn's-algorithm level-set topological sort. On success, returns a
/// sequence of level-sets where level `k` depends only on levels `< k`. On
/// failure (a cycle), returns the residual edge set that couldn't be
/// resolved.
pub fn topological_sort(
    mut remaining: BTreeMap<String, BTreeSet<String>>,
) -> Result<Vec<Vec<String>>, BTreeSet<(String, String)>> {
    let mut levels = Vec::new();

    loop {
        if remaining.is_empty() {
            break;
        }

        let ready: Vec<String> = remaining
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(node, _)| node.clone())
            .collect();

        if ready.is_empty() {
            let residual = remaining
                .iter()
                .flat_map(|(node, deps)| deps.iter().map(move |dep| (node.clone(), dep.clone())))
                .collect();
            return Err(residual);
        }

        for node in &ready {
            remaining.remove(node);
        }
        for deps in remaining.values_mut() {
            for node in &ready {
                deps.remove(node);
            }
        }

        levels.push(ready);
    }

    Ok(levels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Image;
    use pretty_assertions::assert_eq;

    fn image(name: &str, base: Option<&str>) -> Image {
        Image {
            name: name.to_string(),
            current_version: "1".to_string(),
            environment: "prod".to_string(),
            description: String::new(),
            template_path: "packer.yml".to_string(),
            base: base.map(str::to_string),
            archive: serde_json::json!({}),
            provision: None,
            instance_type: None,
            metadata: vec![],
            builder_overrides: serde_json::json!({}),
        }
    }

    #[test]
    fn three_tier_chain_sorts_into_levels() {
        let catalog = ImageCatalog::new([
            image("fedora", None),
            image("server", Some("fedora")),
            image("web", Some("server")),
        ]);
        let registry = Registry::new(Arc::new(catalog));
        let levels = registry.check_cycles().unwrap();
        assert_eq!(levels, vec![vec!["fedora".to_string()], vec!["server".to_string()], vec!["web".to_string()]]);
    }

    #[test]
    fn cycle_is_reported_with_residual_edges() {
        let catalog = ImageCatalog::new([image("a", Some("b")), image("b", Some("a"))]);
        let registry = Registry::new(Arc::new(catalog));
        let err = registry.check_cycles().unwrap_err();
        assert!(matches!(err, CoreError::Configuration { .. }));
    }

    #[test]
    fn base_referencing_external_artifact_is_not_a_graph_edge() {
        let catalog = ImageCatalog::new([image("server", Some("external-base"))]);
        let registry = Registry::new(Arc::new(catalog));
        let levels = registry.check_cycles().unwrap();
        assert_eq!(levels, vec![vec!["server".to_string()]]);
    }

    #[test]
    fn register_then_associate_artifact_round_trips() {
        let catalog = ImageCatalog::new([image("fedora", None)]);
        let registry = Registry::new(Arc::new(catalog));
        let image = registry.get_image("fedora").unwrap().clone();
        let artifact = Artifact::managed("ami-abc", "fedora", "25");

        registry.register_artifact(artifact.clone()).unwrap();
        registry.associate_artifact(artifact.clone(), "fedora", "25").unwrap();

        let found = registry.get_image_artifact(&image, Some("25")).unwrap();
        assert_eq!(found, artifact);
    }
}
