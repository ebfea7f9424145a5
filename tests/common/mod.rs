//! Scripted registry and target fakes shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use image_mirror_controller::distribution::manifest::digest_of;
use image_mirror_controller::distribution::{
    BlobProgress, Distribution, DistributionError, FetchedManifest, RepoAddress,
};
use image_mirror_controller::keychain::RegistryAuth;
use image_mirror_controller::reference::ImageReference;
use image_mirror_controller::registry::Target;

/// An in-memory stand-in for both sides of a mirror session. Manifests and
/// target contents are keyed by the full reference string, so source and
/// target entries never collide.
#[derive(Default)]
pub struct ScriptedRegistry {
    manifests: Mutex<HashMap<String, FetchedManifest>>,
    heads: Mutex<HashMap<String, String>>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    existing_blobs: Mutex<HashSet<String>>,
    fail_fetch: Mutex<bool>,

    pub fetch_calls: Mutex<Vec<String>>,
    pub head_calls: Mutex<Vec<String>>,
    pub copied_blobs: Mutex<Vec<String>>,
    pub put_manifests: Mutex<Vec<(String, String, Vec<u8>)>>,
}

impl ScriptedRegistry {
    /// Registers a manifest payload under a source reference and returns
    /// its digest.
    pub fn add_manifest(&self, reference: &str, media_type: &str, payload: Vec<u8>) -> String {
        let digest = digest_of(&payload);
        self.manifests.lock().unwrap().insert(
            reference.to_owned(),
            FetchedManifest {
                digest: digest.clone(),
                media_type: Some(media_type.to_owned()),
                payload,
            },
        );
        digest
    }

    /// Declares a manifest as already present at the given reference.
    pub fn set_head(&self, reference: &str, digest: &str) {
        self.heads
            .lock()
            .unwrap()
            .insert(reference.to_owned(), digest.to_owned());
    }

    pub fn add_blob(&self, digest: &str, payload: Vec<u8>) {
        self.blobs.lock().unwrap().insert(digest.to_owned(), payload);
    }

    pub fn fail_all_fetches(&self) {
        *self.fail_fetch.lock().unwrap() = true;
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_calls.lock().unwrap().len()
    }

    /// The payload of the last manifest pushed to the given reference.
    pub fn pushed_manifest(&self, reference: &str) -> Option<Vec<u8>> {
        self.put_manifests
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(r, _, _)| r == reference)
            .map(|(_, _, payload)| payload.clone())
    }
}

#[async_trait]
impl Distribution for ScriptedRegistry {
    async fn fetch_manifest(
        &self,
        image: &ImageReference,
        _auth: &RegistryAuth,
    ) -> Result<FetchedManifest, DistributionError> {
        let whole = image.whole();
        self.fetch_calls.lock().unwrap().push(whole.clone());
        if *self.fail_fetch.lock().unwrap() {
            return Err(DistributionError::Status {
                status: 500,
                url: whole,
                details: vec![],
            });
        }
        self.manifests
            .lock()
            .unwrap()
            .get(&whole)
            .cloned()
            .ok_or(DistributionError::Status {
                status: 404,
                url: whole,
                details: vec![],
            })
    }

    async fn head_manifest(
        &self,
        image: &ImageReference,
        _auth: &RegistryAuth,
    ) -> Result<Option<String>, DistributionError> {
        let whole = image.whole();
        self.head_calls.lock().unwrap().push(whole.clone());
        if let Some(digest) = self.heads.lock().unwrap().get(&whole) {
            return Ok(Some(digest.clone()));
        }
        // Manifests pushed earlier in the session are visible to later HEADs.
        let pushed = self
            .put_manifests
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(r, _, _)| *r == whole)
            .map(|(_, _, payload)| digest_of(payload));
        Ok(pushed)
    }

    async fn put_manifest(
        &self,
        image: &ImageReference,
        media_type: &str,
        payload: &[u8],
        _auth: &RegistryAuth,
    ) -> Result<(), DistributionError> {
        self.put_manifests.lock().unwrap().push((
            image.whole(),
            media_type.to_owned(),
            payload.to_vec(),
        ));
        Ok(())
    }

    async fn blob_exists(
        &self,
        _repo: &RepoAddress,
        digest: &str,
        _auth: &RegistryAuth,
    ) -> Result<bool, DistributionError> {
        if self.existing_blobs.lock().unwrap().contains(digest) {
            return Ok(true);
        }
        Ok(self.copied_blobs.lock().unwrap().iter().any(|d| d == digest))
    }

    async fn fetch_blob(
        &self,
        _repo: &RepoAddress,
        digest: &str,
        _auth: &RegistryAuth,
    ) -> Result<Vec<u8>, DistributionError> {
        self.blobs
            .lock()
            .unwrap()
            .get(digest)
            .cloned()
            .ok_or(DistributionError::Status {
                status: 404,
                url: digest.to_owned(),
                details: vec![],
            })
    }

    async fn copy_blob(
        &self,
        _src: &RepoAddress,
        _src_auth: &RegistryAuth,
        _dst: &RepoAddress,
        _dst_auth: &RegistryAuth,
        digest: &str,
        progress: Option<&BlobProgress>,
    ) -> Result<u64, DistributionError> {
        self.copied_blobs.lock().unwrap().push(digest.to_owned());
        let size = self
            .blobs
            .lock()
            .unwrap()
            .get(digest)
            .map(|b| b.len() as u64)
            .unwrap_or(1);
        if let Some(progress) = progress {
            progress.add(size);
        }
        Ok(size)
    }
}

pub struct FakeTarget {
    pub registry: String,
    pub prefix: String,
    pub ensured: Mutex<Vec<String>>,
}

impl FakeTarget {
    pub fn new(registry: &str, prefix: &str) -> Self {
        Self {
            registry: registry.to_owned(),
            prefix: prefix.to_owned(),
            ensured: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Target for FakeTarget {
    fn registry(&self) -> &str {
        &self.registry
    }

    fn repo_prefix(&self) -> &str {
        &self.prefix
    }

    fn insecure(&self) -> bool {
        false
    }

    async fn ensure_repository(&self, name: &str) -> Result<()> {
        self.ensured.lock().unwrap().push(name.to_owned());
        Ok(())
    }

    async fn basic_auth(&self) -> Result<(String, String)> {
        Ok(("AWS".to_owned(), "token".to_owned()))
    }
}

/// A minimal image manifest payload with the given config and layer digests.
pub fn image_manifest_json(config_digest: &str, layer_digests: &[&str]) -> Vec<u8> {
    let layers: Vec<serde_json::Value> = layer_digests
        .iter()
        .map(|digest| {
            serde_json::json!({
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "size": 128,
                "digest": digest,
            })
        })
        .collect();
    serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "size": 64,
            "digest": config_digest,
        },
        "layers": layers,
    }))
    .unwrap()
}

/// A digest string built from a repeated hex character.
pub fn hex_digest(fill: char) -> String {
    format!("sha256:{}", fill.to_string().repeat(64))
}
