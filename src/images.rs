//! Container image extraction from pod specifications.

use k8s_openapi::api::core::v1::{Pod, PodSpec};

/// An image referenced by a pod, with the container that declared it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodImage {
    pub image: String,
    pub container_name: String,
}

/// Collects the images referenced by a pod spec in init-container,
/// container, ephemeral-container order, deduplicated by image string.
pub fn images_from_pod_spec(spec: &PodSpec) -> Vec<PodImage> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();

    let mut add = |image: Option<&String>, name: &str| {
        let Some(image) = image else { return };
        let image = image.trim();
        if image.is_empty() || !seen.insert(image.to_owned()) {
            return;
        }
        out.push(PodImage {
            image: image.to_owned(),
            container_name: name.to_owned(),
        });
    };

    if let Some(init) = &spec.init_containers {
        for c in init {
            add(c.image.as_ref(), &c.name);
        }
    }
    for c in &spec.containers {
        add(c.image.as_ref(), &c.name);
    }
    if let Some(ephemeral) = &spec.ephemeral_containers {
        for c in ephemeral {
            add(c.image.as_ref(), &c.name);
        }
    }

    out
}

/// Strips container runtime scheme prefixes (`docker://`,
/// `docker-pullable://`, `containerd://`, `cri-o://`, `nerdctl://`, ...)
/// from a runtime-reported image ID.
pub fn normalize_image_id(image_id: &str) -> String {
    let trimmed = image_id.trim();
    match trimmed.find("://") {
        Some(idx) => trimmed[idx + 3..].trim().to_owned(),
        None => trimmed.to_owned(),
    }
}

/// Looks up the runtime-reported image ID for a container name across the
/// pod's regular, init and ephemeral container statuses.
pub fn image_id_for_container(pod: &Pod, container_name: &str) -> Option<String> {
    let status = pod.status.as_ref()?;
    let lists = [
        status.container_statuses.as_ref(),
        status.init_container_statuses.as_ref(),
        status.ephemeral_container_statuses.as_ref(),
    ];
    for statuses in lists.into_iter().flatten() {
        for cs in statuses {
            if cs.name == container_name && !cs.image_id.is_empty() {
                return Some(normalize_image_id(&cs.image_id));
            }
        }
    }
    None
}
