//! The typed error taxonomy for the core build pipeline.
//!
//! Most plumbing code (filesystem access, subprocess spawning, template I/O)
//! propagates `color_eyre::Result` directly: callers don't need to
//! discriminate on those failures, only report them. The handful of error
//! kinds that the coordinator and registry *do* need to discriminate on are
//! collected here as a plain enum, in the same style the rest of the
//! workspace uses for small domain errors.

use derive_more::{Display, Error};

/// An error produced by the build core that callers may need to match on,
/// as opposed to the ambient `color_eyre::Report` used for plumbing failures.
#[derive(Debug, Clone, Display, Error)]
pub enum CoreError {
    /// The catalog, a template, or a builder override is malformed.
    #[display("configuration error: {message}")]
    Configuration {
        message: String,
    },

    /// An image name was not found in the catalog.
    #[display("unknown image: {name}")]
    UnknownImage {
        name: String,
    },

    /// An artifact name or (image, version) pair was not found in the registry.
    #[display("unknown artifact: {name}")]
    UnknownArtifact {
        name: String,
    },

    /// The builder tool subprocess exited with a non-zero status.
    #[display("builder tool exited with status {exit_code}: {}", errors.join("; "))]
    BuilderTool {
        exit_code: i32,
        errors: Vec<String>,
    },

    /// A build (or a base-image build it depended on) was canceled.
    #[display("build canceled")]
    Canceled,

    /// A build failed because a base image it depends on failed to build.
    #[display("base image failed: {source}")]
    BaseImageFailed {
        #[error(source)]
        source: Box<CoreError>,
    },
}

impl CoreError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn unknown_image(name: impl Into<String>) -> Self {
        Self::UnknownImage { name: name.into() }
    }

    pub fn unknown_artifact(name: impl Into<String>) -> Self {
        Self::UnknownArtifact { name: name.into() }
    }
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
