//! Garbage collector integration tests over the fake driver.

mod common;

use bay_db::SandboxStatus;
use bay_driver::labels::LabelMap;
use common::{bay, INSTANCE_ID, OWNER};

fn labelled(pairs: &[(&str, &str)]) -> LabelMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Forces a sandbox's idle deadline into the past, the way the original GC
/// e2e suite pokes the catalog directly.
async fn force_idle_expired(bay: &common::TestBay, sandbox_id: &str) {
    let past = (chrono::Utc::now() - chrono::Duration::seconds(30)).to_rfc3339();
    sqlx::query("UPDATE sandboxes SET idle_expires_at = ? WHERE id = ?")
        .bind(past)
        .bind(sandbox_id)
        .execute(bay.db.pool())
        .await
        .unwrap();
}

async fn force_ttl_expired(bay: &common::TestBay, sandbox_id: &str) {
    let past = (chrono::Utc::now() - chrono::Duration::seconds(30)).to_rfc3339();
    sqlx::query("UPDATE sandboxes SET expires_at = ? WHERE id = ?")
        .bind(past)
        .bind(sandbox_id)
        .execute(bay.db.pool())
        .await
        .unwrap();
}

#[tokio::test]
async fn idle_session_gc_reclaims_compute_and_allows_rebuild() {
    let bay = bay().await;
    let sandbox = bay
        .sandboxes
        .create(OWNER, "python-default", None, None)
        .await
        .unwrap();
    bay.sandboxes.ensure_running(&sandbox).await.unwrap();
    assert_eq!(bay.driver.running_container_count(), 1);

    force_idle_expired(&bay, &sandbox.id).await;

    let report = bay.gc.run_cycle().await;
    assert_eq!(report.idle_sessions, 1);
    assert_eq!(report.expired_sandboxes, 0);

    // Back to idle: no compute, cargo preserved.
    let reloaded = bay.sandboxes.get(&sandbox.id, OWNER).await.unwrap();
    assert!(reloaded.current_session_id.is_none());
    assert!(reloaded.idle_expires_at.is_none());
    assert_eq!(bay.driver.running_container_count(), 0);
    assert_eq!(bay.driver.volume_count(), 1);

    let (_, status) = bay.sandboxes.get_with_status(&sandbox.id, OWNER).await.unwrap();
    assert_eq!(status, SandboxStatus::Idle);

    // A later capability call transparently rebuilds compute.
    let session = bay.sandboxes.ensure_running(&reloaded).await.unwrap();
    assert!(session.is_ready());

    // Nothing left to reclaim on the next cycle.
    let report = bay.gc.run_cycle().await;
    assert_eq!(report.idle_sessions, 0);
}

#[tokio::test]
async fn expired_sandbox_gc_deletes_sandbox_and_managed_workspace() {
    let bay = bay().await;
    let sandbox = bay
        .sandboxes
        .create(OWNER, "python-default", None, Some(3600))
        .await
        .unwrap();
    bay.sandboxes.ensure_running(&sandbox).await.unwrap();

    force_ttl_expired(&bay, &sandbox.id).await;

    // Before GC the sandbox reports expired.
    let (_, status) = bay.sandboxes.get_with_status(&sandbox.id, OWNER).await.unwrap();
    assert_eq!(status, SandboxStatus::Expired);

    let report = bay.gc.run_cycle().await;
    assert_eq!(report.expired_sandboxes, 1);

    // After GC: not found, no containers, no managed volume.
    let err = bay.sandboxes.get(&sandbox.id, OWNER).await.unwrap_err();
    assert_eq!(err.code(), "not_found");
    assert_eq!(bay.driver.container_count(), 0);
    assert_eq!(bay.driver.volume_count(), 0);

    // Idempotent: the next cycle finds nothing.
    let report = bay.gc.run_cycle().await;
    assert_eq!(report.expired_sandboxes, 0);
}

#[tokio::test]
async fn orphan_container_gc_enforces_the_strict_instance_fence() {
    let bay = bay().await;

    // A live sandbox whose container must never be reclaimed.
    let sandbox = bay
        .sandboxes
        .create(OWNER, "python-default", None, None)
        .await
        .unwrap();
    let session = bay.sandboxes.ensure_running(&sandbox).await.unwrap();
    let live_container = session.container_id.clone().unwrap();

    // Trusted orphan: our fence token, but its session row is gone.
    bay.driver.add_external_instance(
        "orphan-trusted",
        labelled(&[
            ("managed", "true"),
            ("instance_id", INSTANCE_ID),
            ("session_id", "sess-vanished0001"),
        ]),
    );

    // Another Bay's container: matching managed label, different fence.
    bay.driver.add_external_instance(
        "orphan-foreign",
        labelled(&[
            ("managed", "true"),
            ("instance_id", "other-bay"),
            ("session_id", "sess-foreign00001"),
        ]),
    );

    // Unmanaged container: never touched regardless of other labels.
    bay.driver.add_external_instance(
        "bystander",
        labelled(&[("instance_id", INSTANCE_ID), ("session_id", "sess-x")]),
    );

    let report = bay.gc.run_cycle().await;
    assert_eq!(report.orphan_containers, 1);

    assert!(!bay.driver.has_container("orphan-trusted"));
    assert!(bay.driver.has_container("orphan-foreign"));
    assert!(bay.driver.has_container("bystander"));
    assert!(bay.driver.has_container(&live_container));
}

#[tokio::test]
async fn orphan_workspace_gc_reaps_unowned_managed_cargos() {
    let bay = bay().await;
    let cargos = bay.sandboxes.cargo_manager();

    // Managed cargo whose sandbox never came to exist.
    let orphan = cargos.create(OWNER, true, Some("sandbox-neverborn")).await.unwrap();
    bay.db.detach_cargo(&orphan.id).await.unwrap();

    // Attached managed cargo and external cargo must both survive.
    let attached = cargos.create(OWNER, true, Some("sandbox-alive")).await.unwrap();
    let external = cargos.create(OWNER, false, None).await.unwrap();

    let report = bay.gc.run_cycle().await;
    assert_eq!(report.orphan_workspaces, 1);

    assert!(!bay.driver.has_volume(&orphan.driver_ref));
    assert!(cargos.get_by_id(&orphan.id).await.unwrap().is_none());
    assert!(bay.driver.has_volume(&attached.driver_ref));
    assert!(bay.driver.has_volume(&external.driver_ref));

    let report = bay.gc.run_cycle().await;
    assert_eq!(report.orphan_workspaces, 0);
}

#[tokio::test]
async fn sandbox_delete_beats_expired_gc_without_conflict() {
    let bay = bay().await;
    let sandbox = bay
        .sandboxes
        .create(OWNER, "python-default", None, Some(3600))
        .await
        .unwrap();
    bay.sandboxes.ensure_running(&sandbox).await.unwrap();
    force_ttl_expired(&bay, &sandbox.id).await;

    // User delete lands first; the GC cycle then observes the soft-deleted
    // row and no-ops instead of double-deleting.
    bay.sandboxes.delete(&sandbox).await.unwrap();
    let report = bay.gc.run_cycle().await;
    assert_eq!(report.expired_sandboxes, 0);
    assert_eq!(bay.driver.container_count(), 0);
    assert_eq!(bay.driver.volume_count(), 0);
}
