mod common;

use common::{World, read_all, root, test_config, write_file};
use std::{sync::Arc, time::Duration};
use tlfs_core::{CancellationToken, EngineConfig, Error, config::DirtyBufferConfig};

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn test_indirect_file_round_trips() {
    let world = World::new();
    let laptop = world.device("laptop");
    let phone = world.device("phone");
    let cancel = CancellationToken::new();
    let root_l = root(&laptop, &world).await;
    let data = pattern(300);

    let file = write_file(&laptop, root_l, "big.bin", &data).await;
    assert_eq!(laptop.stat(&cancel, file).await.unwrap().size, 300);
    assert_eq!(read_all(&laptop, file).await, data);
    // Spans three 64-byte children.
    assert_eq!(
        laptop.read(&cancel, file, 60, 70).await.unwrap(),
        &data[60..130]
    );
    assert!(laptop.read(&cancel, file, 300, 10).await.unwrap().is_empty());
    assert_eq!(laptop.read(&cancel, file, 290, 100).await.unwrap(), &data[290..]);

    let root_p = root(&phone, &world).await;
    let (found, _) = phone.lookup(&cancel, root_p, "big.bin").await.unwrap();
    assert_eq!(read_all(&phone, found.unwrap()).await, data);
}

#[tokio::test]
async fn test_ranged_read_fetches_only_covering_children() {
    let world = World::new();
    let laptop = world.device("laptop");
    let phone = world.device("phone");
    let cancel = CancellationToken::new();
    let root_l = root(&laptop, &world).await;
    let data = pattern(300);
    write_file(&laptop, root_l, "big.bin", &data).await;

    let root_p = root(&phone, &world).await;
    let (file, _) = phone.lookup(&cancel, root_p, "big.bin").await.unwrap();
    let file = file.unwrap();
    let before = world.blocks.get_count();
    // Only the last of five children covers this range.
    assert_eq!(phone.read(&cancel, file, 270, 30).await.unwrap(), &data[270..]);
    assert!(world.blocks.get_count() - before <= 2);

    assert_eq!(phone.read(&cancel, file, 100, 100).await.unwrap(), &data[100..200]);
    assert_eq!(read_all(&phone, file).await, data);
}

#[tokio::test]
async fn test_unsynced_writes_are_visible_locally() {
    let world = World::new();
    let laptop = world.device("laptop");
    let phone = world.device("phone");
    let cancel = CancellationToken::new();
    let root_l = root(&laptop, &world).await;
    let root_p = root(&phone, &world).await;

    let file = write_file(&laptop, root_l, "notes.txt", &pattern(100)).await;
    laptop.write(&cancel, file, b"XYZ", 62).await.unwrap();
    laptop.write(&cancel, file, b"tail", 150).await.unwrap();

    let mut expected = pattern(100);
    expected[62..65].copy_from_slice(b"XYZ");
    expected.resize(150, 0);
    expected.extend_from_slice(b"tail");
    assert_eq!(laptop.stat(&cancel, file).await.unwrap().size, 154);
    assert_eq!(read_all(&laptop, file).await, expected);

    let (status, _) = laptop.folder_status(root_l.tlf).unwrap();
    assert_eq!(status.dirty_paths, ["/notes.txt"]);

    phone
        .sync_from_server_for_testing(&cancel, root_p.tlf)
        .await
        .unwrap();
    let (remote, _) = phone.lookup(&cancel, root_p, "notes.txt").await.unwrap();
    assert_eq!(read_all(&phone, remote.unwrap()).await, pattern(100));

    laptop.sync(&cancel, file).await.unwrap();
    let (status, _) = laptop.folder_status(root_l.tlf).unwrap();
    assert!(status.dirty_paths.is_empty());
    phone
        .sync_from_server_for_testing(&cancel, root_p.tlf)
        .await
        .unwrap();
    let (remote, _) = phone.lookup(&cancel, root_p, "notes.txt").await.unwrap();
    assert_eq!(read_all(&phone, remote.unwrap()).await, expected);
}

#[tokio::test]
async fn test_truncate() {
    let world = World::new();
    let laptop = world.device("laptop");
    let cancel = CancellationToken::new();
    let root = root(&laptop, &world).await;
    let data = pattern(200);
    let file = write_file(&laptop, root, "t.bin", &data).await;

    laptop.truncate(&cancel, file, 70).await.unwrap();
    assert_eq!(read_all(&laptop, file).await, &data[..70]);
    laptop.truncate(&cancel, file, 80).await.unwrap();
    let mut grown = data[..70].to_vec();
    grown.resize(80, 0);
    assert_eq!(read_all(&laptop, file).await, grown);
    laptop.sync(&cancel, file).await.unwrap();
    assert_eq!(read_all(&laptop, file).await, grown);

    laptop.truncate(&cancel, file, 0).await.unwrap();
    laptop.sync(&cancel, file).await.unwrap();
    assert_eq!(laptop.stat(&cancel, file).await.unwrap().size, 0);
    assert!(read_all(&laptop, file).await.is_empty());
}

#[tokio::test]
async fn test_identical_small_files_share_a_block() {
    let world = World::new();
    let laptop = world.device("laptop");
    let cancel = CancellationToken::new();
    let root = root(&laptop, &world).await;

    let a = write_file(&laptop, root, "a", b"same bytes").await;
    let b = write_file(&laptop, root, "b", b"same bytes").await;
    let a_ptr = laptop.get_node_metadata(&cancel, a).await.unwrap().ptr;
    let b_ptr = laptop.get_node_metadata(&cancel, b).await.unwrap().ptr;
    assert_eq!(a_ptr.id, b_ptr.id);
    assert_ne!(a_ptr, b_ptr);
    assert_eq!(world.blocks.ref_counts(root.tlf, a_ptr.id), (2, 0));
}

fn small_buffer() -> EngineConfig {
    EngineConfig {
        dirty_buffer: DirtyBufferConfig {
            max_buffer_bytes: 100,
            force_sync_bytes: 1_000_000,
        },
        ..test_config()
    }
}

#[tokio::test]
async fn test_writes_wait_for_buffer_room() {
    let world = World::new();
    let crypto = world.add_device("laptop");
    let laptop = Arc::new(world.engine_with(&crypto, small_buffer()));
    let cancel = CancellationToken::new();
    let root = root(&laptop, &world).await;
    let (a, _) = laptop.create_file(&cancel, root, "a", false).await.unwrap();
    let (b, _) = laptop.create_file(&cancel, root, "b", false).await.unwrap();

    laptop.write(&cancel, a, &pattern(98), 0).await.unwrap();

    let blocked = CancellationToken::new();
    let err = {
        let laptop = laptop.clone();
        let task_blocked = blocked.clone();
        let write = tokio::spawn(async move { laptop.write(&task_blocked, b, b"more bytes", 0).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!write.is_finished());
        blocked.cancel();
        write.await.unwrap().unwrap_err()
    };
    assert!(matches!(err, Error::Cancelled));

    let write = {
        let laptop = laptop.clone();
        tokio::spawn(async move {
            laptop
                .write(&CancellationToken::new(), b, b"more bytes", 0)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!write.is_finished());
    laptop.sync(&cancel, a).await.unwrap();
    write.await.unwrap().unwrap();
    assert_eq!(read_all(&laptop, b).await, b"more bytes");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_buffer_drains_after_racing_writes_and_syncs() {
    let world = World::new();
    let laptop = Arc::new(world.device("laptop"));
    let cancel = CancellationToken::new();
    let root = root(&laptop, &world).await;
    let (file, _) = laptop.create_file(&cancel, root, "a", false).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..16u64 {
        let laptop = laptop.clone();
        tasks.push(tokio::spawn(async move {
            let cancel = CancellationToken::new();
            laptop.write(&cancel, file, &pattern(40), i * 40).await.unwrap();
            laptop.sync(&cancel, file).await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    laptop.sync(&cancel, file).await.unwrap();

    let (status, _) = laptop.status(&cancel).await.unwrap();
    assert_eq!(status.dirty.unsynced_bytes, 0);
    assert_eq!(status.dirty.syncing_bytes, 0);
    assert_eq!(laptop.stat(&cancel, file).await.unwrap().size, 640);
    laptop.shutdown().unwrap();
}

#[tokio::test]
async fn test_status_reports_session_and_quota() {
    let world = World::new();
    let laptop = world.device("laptop");
    let cancel = CancellationToken::new();
    let root = root(&laptop, &world).await;
    let file = write_file(&laptop, root, "a", &pattern(10)).await;
    laptop.write(&cancel, file, b"x", 0).await.unwrap();

    let (status, _) = laptop.status(&cancel).await.unwrap();
    assert_eq!(status.user, "alice");
    assert_eq!(status.device, "laptop");
    assert_eq!(status.folders, [root.tlf]);
    assert!(status.staged_folders.is_empty());
    assert!(status.dirty.unsynced_bytes > 0);
    let quota = status.quota.unwrap();
    assert!(quota.usage_bytes > 0);

    let (folder, changed) = laptop.folder_status(root.tlf).unwrap();
    assert!(!folder.staged);
    assert!(folder.readable);
    assert_eq!(folder.head_writer, world.alice);
    assert_eq!(folder.head_revision, folder.latest_merged_revision);
    laptop.sync(&cancel, file).await.unwrap();
    changed.await.unwrap();
}

#[tokio::test]
async fn test_shutdown_reports_unsynced_data() {
    let world = World::new();
    let laptop = world.device("laptop");
    let cancel = CancellationToken::new();
    let root = root(&laptop, &world).await;
    let (file, _) = laptop.create_file(&cancel, root, "a", false).await.unwrap();
    laptop.write(&cancel, file, b"unsaved", 0).await.unwrap();

    let err = laptop.shutdown().unwrap_err();
    assert!(matches!(err, Error::UnsyncedOnShutdown(n) if n > 0), "{err}");
    let err = laptop.write(&cancel, file, b"late", 0).await.unwrap_err();
    assert!(matches!(err, Error::Shutdown));
}

#[tokio::test]
async fn test_clean_shutdown() {
    let world = World::new();
    let laptop = world.device("laptop");
    let root = root(&laptop, &world).await;
    write_file(&laptop, root, "a", b"saved").await;
    laptop.shutdown().unwrap();
}
