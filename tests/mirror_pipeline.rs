//! End-to-end mirror pipeline scenarios against a scripted registry.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{hex_digest, image_manifest_json, FakeTarget, ScriptedRegistry};
use image_mirror_controller::distribution::manifest::{
    digest_of, OciImageIndex, DOCKER_MANIFEST_MEDIA_TYPE, OCI_IMAGE_INDEX_MEDIA_TYPE,
    OCI_IMAGE_MANIFEST_MEDIA_TYPE,
};
use image_mirror_controller::keychain::Keychain;
use image_mirror_controller::mirror::{InCooldownError, Metadata, Pusher, PusherOptions, RetryError};
use image_mirror_controller::paths::RepoPathTransformer;

fn build_pusher(
    registry: Arc<ScriptedRegistry>,
    target: Arc<FakeTarget>,
    options: PusherOptions,
) -> Pusher {
    Pusher::new(
        target,
        registry,
        RepoPathTransformer::new(&[]),
        Keychain::default(),
        options,
    )
}

#[tokio::test]
async fn tag_mirror_into_fresh_target() {
    let registry = Arc::new(ScriptedRegistry::default());
    let target = Arc::new(FakeTarget::new("123.dkr.ecr.us-east-1.amazonaws.com", "mirror"));

    let config_digest = hex_digest('c');
    let layer_digest = hex_digest('e');
    let payload = image_manifest_json(&config_digest, &[&layer_digest]);
    let source_digest = registry.add_manifest(
        "docker.io/library/nginx:1.25",
        DOCKER_MANIFEST_MEDIA_TYPE,
        payload,
    );
    registry.add_blob(&config_digest, b"config".to_vec());
    registry.add_blob(&layer_digest, b"layer".to_vec());

    let pusher = build_pusher(registry.clone(), target.clone(), PusherOptions::default());
    pusher
        .mirror("docker.io/library/nginx:1.25", Metadata::default())
        .await
        .expect("mirror succeeds");

    let expected_target = "123.dkr.ecr.us-east-1.amazonaws.com/mirror/library/nginx:1.25";

    // Repository provisioned, blobs copied, manifest pushed.
    assert_eq!(*target.ensured.lock().unwrap(), vec!["mirror/library/nginx"]);
    let copied = registry.copied_blobs.lock().unwrap().clone();
    assert!(copied.contains(&config_digest));
    assert!(copied.contains(&layer_digest));
    let pushed = registry.pushed_manifest(expected_target).expect("manifest pushed");
    assert_eq!(digest_of(&pushed), source_digest);

    // The target string is the cache key and carries the verified digest.
    let entries = pusher.cache_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].target, expected_target);
    assert_eq!(entries[0].digest.as_deref(), Some(source_digest.as_str()));
    assert!(!entries[0].inflight);
}

#[tokio::test]
async fn second_mirror_is_single_flight() {
    let registry = Arc::new(ScriptedRegistry::default());
    let target = Arc::new(FakeTarget::new("registry.example.com", "mirror"));
    let payload = image_manifest_json(&hex_digest('c'), &[&hex_digest('e')]);
    registry.add_manifest("docker.io/library/nginx:1.25", DOCKER_MANIFEST_MEDIA_TYPE, payload);
    registry.add_blob(&hex_digest('c'), b"config".to_vec());
    registry.add_blob(&hex_digest('e'), b"layer".to_vec());

    let pusher = build_pusher(registry.clone(), target, PusherOptions::default());
    pusher.mirror("docker.io/library/nginx:1.25", Metadata::default()).await.unwrap();
    let fetches_after_first = registry.fetch_count();

    pusher.mirror("docker.io/library/nginx:1.25", Metadata::default()).await.unwrap();
    assert_eq!(registry.fetch_count(), fetches_after_first, "no traffic on the second pass");
}

#[tokio::test]
async fn digest_pull_defers_until_image_id_is_reported() {
    let registry = Arc::new(ScriptedRegistry::default());
    let target = Arc::new(FakeTarget::new("registry.example.com", "mirror"));
    let pusher = build_pusher(
        registry.clone(),
        target,
        PusherOptions {
            digest_pull: true,
            ..Default::default()
        },
    );

    pusher
        .mirror("docker.io/library/alpine:3.19", Metadata::default())
        .await
        .expect("deferral is ok");

    assert_eq!(registry.fetch_count(), 0);
    assert!(registry.head_calls.lock().unwrap().is_empty());
    assert!(pusher.cache_entries().is_empty(), "deferral leaves no state");
}

#[tokio::test]
async fn digest_already_present_short_circuits() {
    let registry = Arc::new(ScriptedRegistry::default());
    let target = Arc::new(FakeTarget::new("registry.example.com", "mirror"));
    let pod_digest = hex_digest('a');
    registry.set_head(
        &format!("registry.example.com/mirror/library/alpine@{pod_digest}"),
        &pod_digest,
    );

    let pusher = build_pusher(
        registry.clone(),
        target,
        PusherOptions {
            digest_pull: true,
            ..Default::default()
        },
    );

    let meta = Metadata {
        image_id: format!("docker-pullable://docker.io/library/alpine@{pod_digest}"),
        ..Default::default()
    };
    pusher.mirror("docker.io/library/alpine:3.19", meta).await.unwrap();

    // One HEAD settles it; nothing was pulled or pushed.
    assert_eq!(registry.head_calls.lock().unwrap().len(), 1);
    assert_eq!(registry.fetch_count(), 0);
    assert!(registry.put_manifests.lock().unwrap().is_empty());
    let entries = pusher.cache_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].digest.as_deref(), Some(pod_digest.as_str()));
}

#[tokio::test]
async fn different_digest_repush_is_refused() {
    let registry = Arc::new(ScriptedRegistry::default());
    let target = Arc::new(FakeTarget::new("registry.example.com", "mirror"));

    let payload = image_manifest_json(&hex_digest('c'), &[&hex_digest('e')]);
    registry.add_manifest("quay.io/x/svc:v1", DOCKER_MANIFEST_MEDIA_TYPE, payload);
    // Target already has different content under the same tag.
    registry.set_head("registry.example.com/mirror/x/svc:v1", &hex_digest('a'));

    let pusher = build_pusher(
        registry.clone(),
        target,
        PusherOptions {
            allow_different_digest_repush: false,
            failure_cooldown: Duration::from_secs(3600),
            ..Default::default()
        },
    );

    let err = pusher
        .mirror("quay.io/x/svc:v1", Metadata::default())
        .await
        .expect_err("digest mismatch is refused");
    let retry = err.downcast_ref::<RetryError>().expect("cooldown recorded");
    assert!(retry.cause.to_string().contains("refusing to overwrite"));
    assert!(registry.put_manifests.lock().unwrap().is_empty());

    // The failure cools the target down.
    let err = pusher
        .mirror("quay.io/x/svc:v1", Metadata::default())
        .await
        .expect_err("cooldown suppresses the retry");
    let retry = err.downcast_ref::<RetryError>().expect("retry error");
    assert!(retry.cause.downcast_ref::<InCooldownError>().is_some());
}

#[tokio::test]
async fn latest_tag_overwrites_different_digest() {
    let registry = Arc::new(ScriptedRegistry::default());
    let target = Arc::new(FakeTarget::new("registry.example.com", "mirror"));

    let payload = image_manifest_json(&hex_digest('c'), &[&hex_digest('e')]);
    registry.add_manifest("quay.io/x/svc:latest", DOCKER_MANIFEST_MEDIA_TYPE, payload);
    registry.add_blob(&hex_digest('c'), b"config".to_vec());
    registry.add_blob(&hex_digest('e'), b"layer".to_vec());
    registry.set_head("registry.example.com/mirror/x/svc:latest", &hex_digest('a'));

    let pusher = build_pusher(
        registry.clone(),
        target,
        PusherOptions {
            allow_different_digest_repush: false,
            ..Default::default()
        },
    );

    pusher
        .mirror("quay.io/x/svc:latest", Metadata::default())
        .await
        .expect("latest is always overwritten");
    assert!(registry
        .pushed_manifest("registry.example.com/mirror/x/svc:latest")
        .is_some());
}

#[tokio::test]
async fn cooldown_elapses_and_readmits() {
    let registry = Arc::new(ScriptedRegistry::default());
    let target = Arc::new(FakeTarget::new("registry.example.com", "mirror"));
    registry.fail_all_fetches();

    let pusher = build_pusher(
        registry.clone(),
        target,
        PusherOptions {
            failure_cooldown: Duration::from_millis(500),
            ..Default::default()
        },
    );

    let err = pusher
        .mirror("docker.io/library/nginx:1.25", Metadata::default())
        .await
        .expect_err("source pull fails");
    assert!(err.downcast_ref::<RetryError>().is_some());
    assert_eq!(registry.fetch_count(), 1);

    // Within the window: suppressed without wire traffic.
    let err = pusher
        .mirror("docker.io/library/nginx:1.25", Metadata::default())
        .await
        .expect_err("still cooling down");
    let retry = err.downcast_ref::<RetryError>().expect("retry error");
    assert!(retry.cause.downcast_ref::<InCooldownError>().is_some());
    assert_eq!(registry.fetch_count(), 1);

    // After the window: re-admitted and re-attempted.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let _ = pusher
        .mirror("docker.io/library/nginx:1.25", Metadata::default())
        .await
        .expect_err("source still failing");
    assert_eq!(registry.fetch_count(), 2);
}

#[tokio::test]
async fn dry_run_skips_the_push() {
    let registry = Arc::new(ScriptedRegistry::default());
    let target = Arc::new(FakeTarget::new("registry.example.com", "mirror"));
    let payload = image_manifest_json(&hex_digest('c'), &[&hex_digest('e')]);
    registry.add_manifest("docker.io/library/nginx:1.25", DOCKER_MANIFEST_MEDIA_TYPE, payload);

    let pusher = build_pusher(
        registry.clone(),
        target.clone(),
        PusherOptions {
            dry_run: true,
            ..Default::default()
        },
    );
    pusher.mirror("docker.io/library/nginx:1.25", Metadata::default()).await.unwrap();

    assert!(registry.put_manifests.lock().unwrap().is_empty());
    assert!(registry.copied_blobs.lock().unwrap().is_empty());
    // Repository provisioning still happened; dry-run only skips the push.
    assert_eq!(target.ensured.lock().unwrap().len(), 1);
    assert_eq!(pusher.cache_entries().len(), 1);
}

#[tokio::test]
async fn dry_pull_stops_after_the_descriptor() {
    let registry = Arc::new(ScriptedRegistry::default());
    let target = Arc::new(FakeTarget::new("registry.example.com", "mirror"));
    let payload = image_manifest_json(&hex_digest('c'), &[&hex_digest('e')]);
    registry.add_manifest("docker.io/library/nginx:1.25", DOCKER_MANIFEST_MEDIA_TYPE, payload);

    let pusher = build_pusher(
        registry.clone(),
        target.clone(),
        PusherOptions {
            dry_pull: true,
            ..Default::default()
        },
    );
    pusher.mirror("docker.io/library/nginx:1.25", Metadata::default()).await.unwrap();

    assert_eq!(registry.fetch_count(), 1);
    assert!(registry.copied_blobs.lock().unwrap().is_empty());
    assert!(target.ensured.lock().unwrap().is_empty());
}

#[tokio::test]
async fn curated_multi_arch_index_mirror() {
    let registry = Arc::new(ScriptedRegistry::default());
    let target = Arc::new(FakeTarget::new("registry.example.com", "mirror"));

    // Child manifests for the four index entries.
    let amd64 = image_manifest_json(&hex_digest('1'), &[&hex_digest('2')]);
    let arm64 = image_manifest_json(&hex_digest('3'), &[&hex_digest('4')]);
    let ppc64le = image_manifest_json(&hex_digest('5'), &[&hex_digest('6')]);
    let attestation = image_manifest_json(&hex_digest('7'), &[]);
    let amd64_digest = digest_of(&amd64);
    let arm64_digest = digest_of(&arm64);
    let ppc64le_digest = digest_of(&ppc64le);
    let attestation_digest = digest_of(&attestation);

    let index = serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": OCI_IMAGE_INDEX_MEDIA_TYPE,
        "manifests": [
            {"mediaType": OCI_IMAGE_MANIFEST_MEDIA_TYPE, "size": amd64.len(), "digest": amd64_digest,
             "platform": {"architecture": "amd64", "os": "linux"}},
            {"mediaType": OCI_IMAGE_MANIFEST_MEDIA_TYPE, "size": arm64.len(), "digest": arm64_digest,
             "platform": {"architecture": "arm64", "os": "linux"}},
            {"mediaType": OCI_IMAGE_MANIFEST_MEDIA_TYPE, "size": ppc64le.len(), "digest": ppc64le_digest,
             "platform": {"architecture": "ppc64le", "os": "linux"}},
            {"mediaType": OCI_IMAGE_MANIFEST_MEDIA_TYPE, "size": attestation.len(), "digest": attestation_digest,
             "platform": {"architecture": "unknown", "os": "unknown"},
             "annotations": {"vnd.docker.reference.type": "attestation-manifest"}}
        ]
    }))
    .unwrap();

    let pod_digest = hex_digest('f');
    let pull_reference = format!("docker.io/library/app@{pod_digest}");
    registry.add_manifest(&pull_reference, OCI_IMAGE_INDEX_MEDIA_TYPE, index);
    for (digest, payload) in [
        (amd64_digest.clone(), amd64),
        (arm64_digest.clone(), arm64),
    ] {
        registry.add_manifest(
            &format!("docker.io/library/app@{digest}"),
            OCI_IMAGE_MANIFEST_MEDIA_TYPE,
            payload,
        );
    }
    for fill in ['1', '2', '3', '4'] {
        registry.add_blob(&hex_digest(fill), vec![fill as u8; 16]);
    }

    let pusher = build_pusher(
        registry.clone(),
        target,
        PusherOptions {
            digest_pull: true,
            mirror_platforms: vec!["linux/amd64".into(), "linux/arm64".into()],
            ..Default::default()
        },
    );

    let meta = Metadata {
        image_id: pod_digest.clone(),
        ..Default::default()
    };
    pusher.mirror("docker.io/library/app:1", meta).await.expect("curated mirror");

    // The pushed index carries exactly the two desired platforms.
    let pushed = registry
        .pushed_manifest("registry.example.com/mirror/library/app:1")
        .expect("index pushed");
    let pushed_index: OciImageIndex = serde_json::from_slice(&pushed).unwrap();
    let digests: Vec<&str> = pushed_index.manifests.iter().map(|m| m.digest.as_str()).collect();
    assert_eq!(digests, vec![amd64_digest.as_str(), arm64_digest.as_str()]);

    // Both child manifests were copied; the excluded platforms were not.
    let puts = registry.put_manifests.lock().unwrap();
    assert!(puts.iter().any(|(r, _, _)| r.ends_with(&amd64_digest)));
    assert!(puts.iter().any(|(r, _, _)| r.ends_with(&arm64_digest)));
    assert!(!puts.iter().any(|(r, _, _)| r.ends_with(&ppc64le_digest)));
    assert!(!puts.iter().any(|(r, _, _)| r.ends_with(&attestation_digest)));
}

#[tokio::test]
async fn full_index_mirror_without_digest_pull() {
    let registry = Arc::new(ScriptedRegistry::default());
    let target = Arc::new(FakeTarget::new("registry.example.com", "mirror"));

    let amd64 = image_manifest_json(&hex_digest('1'), &[&hex_digest('2')]);
    let arm64 = image_manifest_json(&hex_digest('3'), &[&hex_digest('4')]);
    let amd64_digest = digest_of(&amd64);
    let arm64_digest = digest_of(&arm64);

    let index = serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": OCI_IMAGE_INDEX_MEDIA_TYPE,
        "manifests": [
            {"mediaType": OCI_IMAGE_MANIFEST_MEDIA_TYPE, "size": amd64.len(), "digest": amd64_digest,
             "platform": {"architecture": "amd64", "os": "linux"}},
            {"mediaType": OCI_IMAGE_MANIFEST_MEDIA_TYPE, "size": arm64.len(), "digest": arm64_digest,
             "platform": {"architecture": "arm64", "os": "linux"}}
        ]
    }))
    .unwrap();
    let index_digest = registry.add_manifest(
        "ghcr.io/acme/svc:2.0",
        OCI_IMAGE_INDEX_MEDIA_TYPE,
        index,
    );
    for (digest, payload) in [(amd64_digest.clone(), amd64), (arm64_digest.clone(), arm64)] {
        registry.add_manifest(
            &format!("ghcr.io/acme/svc@{digest}"),
            OCI_IMAGE_MANIFEST_MEDIA_TYPE,
            payload,
        );
    }
    for fill in ['1', '2', '3', '4'] {
        registry.add_blob(&hex_digest(fill), vec![fill as u8; 16]);
    }

    let pusher = build_pusher(registry.clone(), target, PusherOptions::default());
    pusher.mirror("ghcr.io/acme/svc:2.0", Metadata::default()).await.unwrap();

    // Entire index mirrored byte for byte.
    let pushed = registry
        .pushed_manifest("registry.example.com/mirror/acme/svc:2.0")
        .expect("index pushed");
    assert_eq!(digest_of(&pushed), index_digest);

    let entries = pusher.cache_entries();
    assert_eq!(entries[0].digest.as_deref(), Some(index_digest.as_str()));
}

#[tokio::test]
async fn arch_placeholder_reassigns_the_target() {
    let registry = Arc::new(ScriptedRegistry::default());
    let target = Arc::new(FakeTarget::new("registry.example.com", "mirror/$arch"));

    let config_digest = hex_digest('c');
    let payload = image_manifest_json(&config_digest, &[&hex_digest('e')]);
    registry.add_manifest("docker.io/library/nginx:1.25", DOCKER_MANIFEST_MEDIA_TYPE, payload);
    registry.add_blob(&config_digest, br#"{"architecture": "arm64", "os": "linux"}"#.to_vec());
    registry.add_blob(&hex_digest('e'), b"layer".to_vec());

    let pusher = build_pusher(registry.clone(), target.clone(), PusherOptions::default());
    pusher.mirror("docker.io/library/nginx:1.25", Metadata::default()).await.unwrap();

    let entries = pusher.cache_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(
        entries[0].target,
        "registry.example.com/mirror/arm64/library/nginx:1.25"
    );
    assert_eq!(*target.ensured.lock().unwrap(), vec!["mirror/arm64/library/nginx"]);
}
