//! The data model: images, artifacts, and the catalog that holds them.
//!
//! Mirrors `shelver.image`/`shelver.artifact` from the original
//! implementation: immutable records loaded once from the configuration
//! document and never mutated afterward.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single image specification from the catalog.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub name: String,
    pub current_version: String,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_template_path")]
    pub template_path: String,
    /// Either `"name"` or `"name:version"`, referring to another catalog
    /// image or to an externally registered artifact.
    #[serde(default)]
    pub base: Option<String>,
    #[serde(default)]
    pub archive: Value,
    #[serde(default)]
    pub provision: Option<Value>,
    pub instance_type: Option<String>,
    #[serde(default)]
    pub metadata: Vec<String>,
    #[serde(default)]
    pub builder_overrides: Value,
}

fn default_environment() -> String {
    "prod".to_string()
}

fn default_template_path() -> String {
    "packer.yml".to_string()
}

impl Image {
    /// Split `base` into `(name, version)` on the first `:`.
    ///
    /// A missing version means "whatever that image's current version is".
    pub fn base_with_version(&self) -> Option<(&str, Option<&str>)> {
        let base = self.base.as_deref()?;
        match base.split_once(':') {
            Some((name, version)) => Some((name, Some(version))),
            None => Some((base, None)),
        }
    }
}

/// A produced (or externally registered) artifact.
///
/// Invariant: either `image` and `version` are both set (a managed artifact
/// this core built) or `name` alone identifies an unmanaged/external one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub provider_tag: Option<String>,
    pub name: Option<String>,
    pub image: Option<String>,
    pub version: Option<String>,
    pub environment: Option<String>,
}

impl Artifact {
    pub fn managed(id: impl Into<String>, image: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider_tag: None,
            name: None,
            image: Some(image.into()),
            version: Some(version.into()),
            environment: None,
        }
    }

    pub fn unmanaged(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider_tag: None,
            name: Some(name.into()),
            image: None,
            version: None,
            environment: None,
        }
    }

    /// The key this artifact is indexed under in the registry.
    pub fn key(&self) -> String {
        match (&self.image, &self.version) {
            (Some(image), Some(version)) => format!("{image}:{version}"),
            _ => self.name.clone().unwrap_or_else(|| self.id.clone()),
        }
    }
}

/// An immutable collection of images, keyed by name, loaded once from the
/// configuration document.
#[derive(Clone, Debug, Default)]
pub struct ImageCatalog {
    images: BTreeMap<String, Image>,
}

impl ImageCatalog {
    pub fn new(images: impl IntoIterator<Item = Image>) -> Self {
        Self {
            images: images.into_iter().map(|image| (image.name.clone(), image)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Image> {
        self.images.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.images.contains_key(name)
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.images.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Image> {
        self.images.values()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}
