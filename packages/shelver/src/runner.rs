//! The Build Runner: assembles the template context, renders the image's
//! template, merges in builder overrides, writes the concrete JSON template,
//! invokes the builder tool, and hands its pipes to the watcher.

use std::future::Future;
use std::path::{Path, PathBuf};

use color_eyre::eyre::Context as _;
use serde_json::{Map, Value, json};
use tokio::sync::watch;
use tracing::instrument;

use crate::archive::ArchiveInfo;
use crate::config::deep_merge;
use crate::error::CoreError;
use crate::model::{Artifact, Image};
use crate::watcher::{self, CancelStage, LineSink, RawArtifact};

/// The seam the coordinator schedules builds through, so it can be tested
/// against a fake that never spawns a real builder tool.
pub trait BuildExecutor: Send + Sync {
    fn run(
        &self,
        scratch_dir: &Path,
        image: &Image,
        version: &str,
        archive: &ArchiveInfo,
        base_artifact: Option<&Artifact>,
        cancel_rx: watch::Receiver<CancelStage>,
    ) -> impl Future<Output = Result<Vec<RawArtifact>, CoreError>> + Send;
}

/// Resolved paths and options the runner needs that don't vary per build.
#[derive(Clone, Debug)]
pub struct RunnerOptions {
    /// Argv prefix used to invoke the builder tool, e.g. `["packer"]`.
    pub builder_cmd: Vec<String>,
    /// Directory `image.template_path` is resolved relative to.
    pub catalog_dir: PathBuf,
    /// Directory per-build log files are written under.
    pub log_dir: PathBuf,
    /// Whether to colorize forwarded build output.
    pub colorize: bool,
}

pub struct BuildRunner {
    options: RunnerOptions,
}

impl BuildRunner {
    pub fn new(options: RunnerOptions) -> Self {
        Self { options }
    }

    /// Run one build inside `scratch_dir` (a private, per-build temp
    /// directory the caller owns) and return the artifacts the builder tool
    /// reported.
    #[instrument(skip(self, scratch_dir, cancel_rx), fields(image = %image.name, %version))]
    pub async fn run(
        &self,
        scratch_dir: &Path,
        image: &Image,
        version: &str,
        archive: &ArchiveInfo,
        base_artifact: Option<&Artifact>,
        cancel_rx: watch::Receiver<CancelStage>,
    ) -> Result<Vec<RawArtifact>, CoreError> {
        let context = build_context(image, version, archive, base_artifact);
        let template = self
            .render_template(image, &context)
            .await
            .map_err(|err| CoreError::configuration(err.to_string()))?;

        let template_path = scratch_dir.join("template.json");
        let encoded = serde_json::to_vec_pretty(&template)
            .map_err(|err| CoreError::configuration(format!("encode template: {err}")))?;
        crate::fs::write(&template_path, encoded)
            .await
            .map_err(|err| CoreError::configuration(err.to_string()))?;

        crate::fs::create_dir_all(&self.options.log_dir)
            .await
            .map_err(|err| CoreError::configuration(err.to_string()))?;
        let log_path = self.options.log_dir.join(format!("{}_{version}.log", image.name));
        let log_file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
            .map_err(|err| CoreError::configuration(format!("open log file {log_path:?}: {err}")))?;
        let sink = watcher::Tee {
            first: watcher::StdoutSink,
            second: watcher::FileSink(log_file),
        };

        let mut argv = self.options.builder_cmd.clone();
        argv.push("build".to_string());
        argv.push("-machine-readable".to_string());
        argv.push(template_path.display().to_string());

        let child = crate::subprocess::spawn_builder_tool(&argv, scratch_dir, std::env::vars())
            .map_err(|err| CoreError::configuration(format!("{err:#}")))?;

        let outcome = watcher::watch(child, &image.name, self.options.colorize, sink, cancel_rx).await?;
        Ok(outcome.artifacts)
    }
}

impl BuildExecutor for BuildRunner {
    async fn run(
        &self,
        scratch_dir: &Path,
        image: &Image,
        version: &str,
        archive: &ArchiveInfo,
        base_artifact: Option<&Artifact>,
        cancel_rx: watch::Receiver<CancelStage>,
    ) -> Result<Vec<RawArtifact>, CoreError> {
        BuildRunner::run(self, scratch_dir, image, version, archive, base_artifact, cancel_rx).await
    }
}

impl BuildRunner {
    async fn render_template(&self, image: &Image, context: &Value) -> color_eyre::Result<Value> {
        let template_path = self.options.catalog_dir.join(&image.template_path);
        let raw = tokio::fs::read_to_string(&template_path)
            .await
            .with_context(|| format!("read template {template_path:?}"))?;
        let doc: Value = serde_yaml::from_str(&raw).with_context(|| format!("parse template {template_path:?}"))?;

        let env = minijinja::Environment::new();
        let rendered = render_node(&env, &doc, context).context("render template")?;
        merge_builder_overrides(rendered, &image.builder_overrides).map_err(|err| color_eyre::eyre::eyre!("{err}"))
    }
}

/// The context available to template placeholders.
fn build_context(image: &Image, version: &str, archive: &ArchiveInfo, base_artifact: Option<&Artifact>) -> Value {
    json!({
        "name": image.name,
        "version": version,
        "description": image.description,
        "environment": image.environment,
        "instance_type": image.instance_type,
        "base": image.base,
        "provision": image.provision,
        "base_artifact": base_artifact.map(|artifact| json!({
            "id": artifact.id,
            "provider_tag": artifact.provider_tag,
        })),
        "archive": {
            "path": archive.path.display().to_string(),
            "source_dir": archive.source_dir.display().to_string(),
            "revision": archive.revision,
        },
    })
}

/// Walk the template document, rendering every string leaf through the
/// template engine and then re-parsing it as a literal where possible.
fn render_node(env: &minijinja::Environment, node: &Value, context: &Value) -> color_eyre::Result<Value> {
    match node {
        Value::String(s) => {
            let rendered = env.render_str(s, context).with_context(|| format!("render placeholder in {s:?}"))?;
            Ok(reparse_literal(&rendered))
        }
        Value::Array(items) => items
            .iter()
            .map(|item| render_node(env, item, context))
            .collect::<color_eyre::Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, value) in map {
                out.insert(key.clone(), render_node(env, value, context)?);
            }
            Ok(Value::Object(out))
        }
        scalar => Ok(scalar.clone()),
    }
}

/// Attempt to parse a rendered string as a literal value (integer, float,
/// boolean, null, quoted string, JSON array/object), falling back to the
/// string itself when nothing parses.
fn reparse_literal(rendered: &str) -> Value {
    let trimmed = rendered.trim();
    match trimmed {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" | "None" => return Value::Null,
        _ => {}
    }
    if let Ok(n) = trimmed.parse::<i64>() {
        return json!(n);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        return json!(f);
    }
    let looks_like_json = (trimmed.starts_with('[') && trimmed.ends_with(']'))
        || (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('"') && trimmed.ends_with('"') && trimmed.len() >= 2);
    if looks_like_json {
        if let Ok(value) = serde_json::from_str(trimmed) {
            return value;
        }
    }
    Value::String(rendered.to_string())
}

/// Deep-merge the image's `builder_overrides` into each entry of the
/// template's top-level `builders` sequence. Missing `builders` is a
/// configuration error.
fn merge_builder_overrides(template: Value, builder_overrides: &Value) -> Result<Value, CoreError> {
    let Value::Object(mut root) = template else {
        return Err(CoreError::configuration("template must be a mapping"));
    };
    let builders = root
        .remove("builders")
        .and_then(|v| v.as_array().cloned())
        .ok_or_else(|| CoreError::configuration("template is missing a `builders` sequence"))?;

    let merged = builders
        .into_iter()
        .map(|builder| deep_merge(builder, builder_overrides.clone()))
        .collect::<Result<Vec<_>, _>>()?;

    root.insert("builders".to_string(), Value::Array(merged));
    Ok(Value::Object(root))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn reparse_literal_recognizes_scalars() {
        assert_eq!(reparse_literal("true"), Value::Bool(true));
        assert_eq!(reparse_literal("42"), json!(42));
        assert_eq!(reparse_literal("3.14"), json!(3.14));
        assert_eq!(reparse_literal("null"), Value::Null);
        assert_eq!(reparse_literal("plain text"), json!("plain text"));
        assert_eq!(reparse_literal("[1, 2, 3]"), json!([1, 2, 3]));
    }

    #[test]
    fn render_node_substitutes_and_reparses() {
        let env = minijinja::Environment::new();
        let context = json!({"version": "25"});
        let doc = json!({"ami_name": "fedora-{{ version }}", "count": "{{ 1 }}"});
        let rendered = render_node(&env, &doc, &context).unwrap();
        assert_eq!(rendered["ami_name"], json!("fedora-25"));
        assert_eq!(rendered["count"], json!(1));
    }

    #[test]
    fn merge_builder_overrides_applies_to_every_builder() {
        let template = json!({
            "builders": [
                {"type": "amazon-ebs", "region": "us-east-1"},
                {"type": "amazon-ebs", "region": "us-west-2"},
            ]
        });
        let overrides = json!({"instance_type": "t3.micro"});
        let merged = merge_builder_overrides(template, &overrides).unwrap();
        let builders = merged["builders"].as_array().unwrap();
        assert_eq!(builders[0]["instance_type"], json!("t3.micro"));
        assert_eq!(builders[1]["instance_type"], json!("t3.micro"));
    }

    #[test]
    fn missing_builders_is_a_configuration_error() {
        let err = merge_builder_overrides(json!({}), &json!({})).unwrap_err();
        assert!(matches!(err, CoreError::Configuration { .. }));
    }
}
