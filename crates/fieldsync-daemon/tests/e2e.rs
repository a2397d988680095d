//! End-to-end tests for fieldsync-daemon.
//!
//! Runs full engines over the native collaborators: file storage, the
//! storage watcher and the directory-backed replica.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fieldsync_core::model::{FormPatch, NewImage};
use fieldsync_core::{KeyValueStorage, StorageChange, SyncConfig};
use fieldsync_daemon::{FileStorage, HostOptions, NativeHost, StorageWatcher};
use tempfile::TempDir;
use tokio::time::{Instant, sleep};

const OWNER: &str = "inspector@example.com";

fn options(data_dir: &Path, remote_dir: &Path, watch: bool) -> HostOptions {
    HostOptions {
        data_dir: data_dir.to_path_buf(),
        remote_dir: remote_dir.to_path_buf(),
        owner: Some(OWNER.to_string()),
        config: SyncConfig {
            project_name: "Bridge 42".to_string(),
            ..SyncConfig::default()
        },
        watch,
    }
}

fn image(name: &str) -> NewImage {
    NewImage {
        file_name: name.to_string(),
        bytes: vec![0xFF, 0xD8, 0xFF],
        preview_ref: format!("blob:{}", name),
        is_sketch: false,
    }
}

fn elr(value: &str) -> FormPatch {
    FormPatch {
        elr: Some(value.to_string()),
        ..Default::default()
    }
}

/// Two devices share only the replica directory.
#[tokio::test]
async fn test_devices_sync_through_replica() {
    let remote = TempDir::new().expect("Failed to create temp dir");
    let device_a = TempDir::new().expect("Failed to create temp dir");
    let device_b = TempDir::new().expect("Failed to create temp dir");

    let mut a = NativeHost::open(options(device_a.path(), remote.path(), false)).unwrap();
    a.engine_mut().load_all().await.unwrap();
    a.engine_mut().set_form_field(elr("ABC"));
    let added = a
        .engine_mut()
        .add_images(vec![image("IMG_0001.jpg"), image("IMG_0002.jpg")])
        .await
        .unwrap();
    assert_eq!(added.len(), 2);
    assert!(added.iter().all(|img| img.url.as_deref().is_some_and(|u| u.starts_with("file://"))));
    a.engine_mut().save_all_now().await.unwrap();

    let mut b = NativeHost::open(options(device_b.path(), remote.path(), false)).unwrap();
    let report = b.engine_mut().load_all().await.unwrap();
    assert!(report.local.is_empty());

    assert_eq!(b.engine().form().data.elr, "ABC");
    let names: Vec<_> = b.engine().images().iter().map(|i| i.file_name.as_str()).collect();
    assert_eq!(names, vec!["IMG_0001.jpg", "IMG_0002.jpg"]);
    // Same owner and project name derive the same ids on both devices
    assert_eq!(b.engine().images()[0].id, added[0].id);
}

/// A restart restores state from local storage alone.
#[tokio::test]
async fn test_restart_restores_local_state() {
    let remote = TempDir::new().expect("Failed to create temp dir");
    let data = TempDir::new().expect("Failed to create temp dir");

    {
        let mut host = NativeHost::open(options(data.path(), remote.path(), false)).unwrap();
        host.engine_mut().load_all().await.unwrap();
        host.engine_mut().set_form_field(elr("XYZ"));
        // Dropped before any remote write
    }

    let storage = FileStorage::open(data.path()).unwrap();
    assert!(!storage.keys().unwrap().is_empty());

    let mut host = NativeHost::open(options(data.path(), remote.path(), false)).unwrap();
    let report = host.engine_mut().load_all().await.unwrap();
    assert!(!report.local.is_empty());
    assert_eq!(host.engine().form().data.elr, "XYZ");
}

/// Two hosts sharing one data directory see each other's writes through
/// the watcher, like two tabs sharing localStorage.
#[tokio::test]
async fn test_shared_data_dir_propagates_through_watcher() {
    let remote = TempDir::new().expect("Failed to create temp dir");
    let data = TempDir::new().expect("Failed to create temp dir");

    let mut a = NativeHost::open(options(data.path(), remote.path(), true)).unwrap();
    let mut b = NativeHost::open(options(data.path(), remote.path(), true)).unwrap();
    a.engine_mut().load_all().await.unwrap();
    b.engine_mut().load_all().await.unwrap();

    // Give watchers time to fully initialize - FSEvents on macOS needs time
    sleep(Duration::from_millis(500)).await;

    a.engine_mut().set_form_field(elr("DEF"));

    // FSEvents + debounce can take several seconds
    let deadline = Instant::now() + Duration::from_secs(10);
    while b.engine().form().data.elr != "DEF" {
        assert!(Instant::now() < deadline, "Timeout waiting for storage change");
        sleep(Duration::from_millis(100)).await;
        b.engine_mut().process_inbound();
    }

    // Adopting a change never re-schedules it on the receiver
    assert!(!b.engine().is_pending(fieldsync_core::Collection::FormData));
}

/// The watcher reports key files and ignores temp and foreign files.
#[tokio::test]
async fn test_storage_watcher_reports_keys() {
    let data = TempDir::new().expect("Failed to create temp dir");
    let storage = FileStorage::open(data.path()).unwrap();

    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _sub = storage.changes().subscribe(move |change: StorageChange| {
        sink.lock().unwrap().push(change.key);
    });
    let _watcher = StorageWatcher::new(data.path().to_path_buf(), Arc::clone(storage.changes()))
        .expect("Failed to create watcher");

    sleep(Duration::from_millis(500)).await;

    std::fs::write(data.path().join("notes.txt"), "ignored").unwrap();
    storage.set_item("fieldsync:o:h:images", "[]").unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        {
            let seen = seen.lock().unwrap();
            if !seen.is_empty() {
                assert!(seen.iter().all(|k| k == "fieldsync:o:h:images"), "{:?}", seen);
                break;
            }
        }
        assert!(Instant::now() < deadline, "Timeout waiting for storage change");
        sleep(Duration::from_millis(100)).await;
    }
}

/// Clearing a project removes local keys, the replica record and objects.
#[tokio::test]
async fn test_clear_all_removes_everything() {
    let remote = TempDir::new().expect("Failed to create temp dir");
    let data = TempDir::new().expect("Failed to create temp dir");

    let mut host = NativeHost::open(options(data.path(), remote.path(), false)).unwrap();
    host.engine_mut().load_all().await.unwrap();
    host.engine_mut().set_form_field(elr("ABC"));
    host.engine_mut()
        .add_images(vec![image("IMG_0001.jpg")])
        .await
        .unwrap();
    host.engine_mut().save_all_now().await.unwrap();
    assert!(remote.path().join("objects").exists());

    host.engine_mut().clear_all().await.unwrap();
    assert!(host.engine().images().is_empty());
    assert_eq!(host.engine().form().data.elr, "");

    let mut fresh = NativeHost::open(options(data.path(), remote.path(), false)).unwrap();
    fresh.engine_mut().load_all().await.unwrap();
    assert!(fresh.engine().images().is_empty());
    assert_eq!(fresh.engine().form().data.elr, "");
}
