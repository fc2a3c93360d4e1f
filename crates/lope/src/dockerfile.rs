//! Derived image synthesis.

use crate::spec::{RunSpec, WorkDirStrategy};

/// Downloads the docker client into the image so the mounted engine socket is usable.
pub const DOCKER_CLIENT_BOOTSTRAP: [&str; 4] = [
    r"RUN wget -q https://download.docker.com/linux/static/stable/x86_64/docker-18.03.1-ce.tgz && \",
    r"tar xfv docker* && \",
    r"mv docker/docker /usr/local/bin && \",
    "rm -rf docker/",
];

/// The image the container is started from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePlan {
    /// Image reference passed to the run command.
    pub image: String,
    /// Build file to build `image` from, when the source image is not used as is.
    pub dockerfile: Option<String>,
}

impl ImagePlan {
    pub fn needs_build(&self) -> bool {
        self.dockerfile.is_some()
    }
}

/// Render the build file for `spec`.
///
/// The custom instructions are appended as a single trailing segment, so an
/// empty instruction list still terminates the text with a newline.
pub fn synthesize(spec: &RunSpec) -> String {
    let mut lines = header(spec);
    lines.push(spec.instructions.join("\n"));
    lines.join("\n")
}

/// Decide whether a derived image is needed and, if so, what to build.
pub fn plan(spec: &RunSpec) -> ImagePlan {
    // Count emitted lines rather than inspecting the text; an empty join
    // would otherwise look like content.
    let line_count = header(spec).len() + spec.instructions.len();
    if line_count == 1 {
        return ImagePlan {
            image: spec.source_image.clone(),
            dockerfile: None,
        };
    }

    ImagePlan {
        image: spec.target_image.clone(),
        dockerfile: Some(synthesize(spec)),
    }
}

fn header(spec: &RunSpec) -> Vec<String> {
    let mut lines = vec![format!("FROM {}", spec.source_image)];

    if spec.work_dir_strategy == WorkDirStrategy::CopyIntoImage {
        lines.push(format!("ADD . {}", spec.work_dir));
    }

    if spec.engine_integration.install_client {
        lines.extend(DOCKER_CLIENT_BOOTSTRAP.iter().map(|l| l.to_string()));
    }

    lines
}
