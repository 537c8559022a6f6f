//! Configuration loading: parses the catalog document, splits out the
//! reserved `defaults`/`provider` sections, and deep-merges defaults into
//! each image spec before it's deserialized into [`crate::model::Image`].

use std::path::Path;

use color_eyre::{Result, eyre::Context};
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use crate::error::CoreError;
use crate::model::{Image, ImageCatalog};

/// The parsed provider section of the catalog document (`provider: {name: ..., ...}`).
///
/// The core doesn't act on this beyond passing it through to whatever
/// constructs a real provider; it's kept here only so the loader can split
/// it out of the document before parsing images.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct ProviderConfig {
    pub name: Option<String>,
    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

pub struct LoadedConfig {
    pub catalog: ImageCatalog,
    pub provider: ProviderConfig,
}

/// Load and parse a catalog document from a YAML string.
#[instrument(skip(document))]
pub fn load_catalog(document: &str) -> Result<LoadedConfig> {
    let mut root: Map<String, Value> =
        serde_yaml::from_str(document).context("parse catalog document")?;

    let provider: ProviderConfig = root
        .remove("provider")
        .map(serde_json::from_value)
        .transpose()
        .context("parse provider section")?
        .unwrap_or_default();

    let defaults = root.remove("defaults").unwrap_or(Value::Object(Map::new()));

    let mut images = Vec::with_capacity(root.len());
    for (name, spec) in root {
        let merged = deep_merge(defaults.clone(), spec)
            .map_err(|err| color_eyre::eyre::eyre!("{err}"))
            .with_context(|| format!("merge defaults into image {name:?}"))?;
        let mut image: Image =
            serde_json::from_value(merged).with_context(|| format!("parse image {name:?}"))?;
        image.name = name;
        if image.description.is_empty() {
            image.description = format!("{} - version {}", image.name, image.current_version);
        }
        debug!(image = %image.name, "loaded image");
        images.push(image);
    }

    Ok(LoadedConfig {
        catalog: ImageCatalog::new(images),
        provider,
    })
}

/// Load a catalog document from a file on disk.
pub async fn load_catalog_file(path: &Path) -> Result<LoadedConfig> {
    let document = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("read catalog file {path:?}"))?;
    load_catalog(&document)
}

/// Deep-merge `right` on top of `left`.
///
/// - object vs object: recurse key-wise.
/// - array vs array: concatenate (`left` elements first).
/// - object vs non-object, or array vs non-array: a configuration error.
/// - anything else (scalars, or one side is `Null`): `right` wins.
pub fn deep_merge(left: Value, right: Value) -> Result<Value, CoreError> {
    match (left, right) {
        (Value::Object(mut left), Value::Object(right)) => {
            for (key, right_value) in right {
                let merged = match left.remove(&key) {
                    Some(left_value) => deep_merge(left_value, right_value)?,
                    None => right_value,
                };
                left.insert(key, merged);
            }
            Ok(Value::Object(left))
        }
        (Value::Object(_), other) if !other.is_null() => Err(CoreError::configuration(format!(
            "cannot merge non-object {other:?} into an object"
        ))),
        (Value::Array(mut left), Value::Array(right)) => {
            left.extend(right);
            Ok(Value::Array(left))
        }
        (Value::Array(_), other) if !other.is_null() => Err(CoreError::configuration(format!(
            "cannot merge non-array {other:?} into an array"
        ))),
        (left, Value::Null) => Ok(left),
        (_, right) => Ok(right),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn merge_disjoint_objects() {
        let left = json!({"a": 1});
        let right = json!({"b": 2});
        let merged = deep_merge(left, right).unwrap();
        assert_eq!(merged, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn merge_nested_objects_recurses() {
        let left = json!({"builders": [{"type": "amazon-ebs", "region": "us-east-1"}]});
        let right = json!({"builders": [{"instance_type": "t3.micro"}]});
        let merged = deep_merge(left, right).unwrap();
        assert_eq!(
            merged,
            json!({"builders": [
                {"type": "amazon-ebs", "region": "us-east-1"},
                {"instance_type": "t3.micro"}
            ]})
        );
    }

    #[test]
    fn merge_empty_right_is_identity() {
        let left = json!({"a": 1, "b": [1, 2]});
        let merged = deep_merge(left.clone(), json!({})).unwrap();
        assert_eq!(merged, left);
    }

    #[test]
    fn merge_scalar_right_wins() {
        let merged = deep_merge(json!("prod"), json!("staging")).unwrap();
        assert_eq!(merged, json!("staging"));
    }

    #[test]
    fn merge_type_mismatch_is_configuration_error() {
        let err = deep_merge(json!({"a": 1}), json!([1, 2])).unwrap_err();
        assert!(matches!(err, CoreError::Configuration { .. }));
    }

    #[test]
    fn load_catalog_applies_defaults_and_description() {
        let document = r#"
defaults:
  environment: staging
fedora:
  current_version: "25"
server:
  current_version: "2"
  base: fedora
  environment: prod
"#;
        let loaded = load_catalog(document).unwrap();
        let fedora = loaded.catalog.get("fedora").unwrap();
        assert_eq!(fedora.environment, "staging");
        assert_eq!(fedora.description, "fedora - version 25");

        let server = loaded.catalog.get("server").unwrap();
        assert_eq!(server.environment, "prod");
        assert_eq!(server.base.as_deref(), Some("fedora"));
    }
}
