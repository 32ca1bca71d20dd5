mod common;

use common::{World, names, read_all, root, test_config, write_file};
use std::time::Duration;
use tlfs_core::{CancellationToken, EngineConfig, Error};
use tlfs_fs::{Engine, Node};

const CONFLICT_DATE: &str = "2023-11-14";

async fn refresh(engine: &Engine, root: Node) {
    engine
        .sync_from_server_for_testing(&CancellationToken::new(), root.tlf)
        .await
        .unwrap();
}

fn staged(engine: &Engine, root: Node) -> bool {
    engine.folder_status(root.tlf).unwrap().0.staged
}

async fn open(engine: &Engine, dir: Node, name: &str) -> Node {
    engine
        .lookup(&CancellationToken::new(), dir, name)
        .await
        .unwrap()
        .0
        .unwrap()
}

#[tokio::test]
async fn test_independent_creates_converge() {
    let world = World::new();
    let laptop = world.device("laptop");
    let phone = world.device("phone");
    let root_l = root(&laptop, &world).await;
    let root_p = root(&phone, &world).await;

    write_file(&laptop, root_l, "a.txt", b"laptop").await;
    let b = write_file(&phone, root_p, "b.txt", b"phone").await;
    assert!(staged(&phone, root_p), "the phone lost the race");
    assert_eq!(world.md.branch_count(root_p.tlf), 1);

    refresh(&phone, root_p).await;
    assert!(!staged(&phone, root_p));
    assert_eq!(world.md.branch_count(root_p.tlf), 0);
    assert_eq!(names(&phone, root_p).await, ["a.txt", "b.txt"]);
    assert_eq!(read_all(&phone, b).await, b"phone");

    refresh(&laptop, root_l).await;
    assert_eq!(names(&laptop, root_l).await, ["a.txt", "b.txt"]);
    let b = open(&laptop, root_l, "b.txt").await;
    assert_eq!(read_all(&laptop, b).await, b"phone");

    let (l, _) = laptop.folder_status(root_l.tlf).unwrap();
    let (p, _) = phone.folder_status(root_p.tlf).unwrap();
    assert_eq!(l.head_revision, p.head_revision);
    assert_eq!(
        world.md.merged_head_revision(root_l.tlf),
        Some(l.head_revision)
    );
}

#[tokio::test]
async fn test_same_name_creates_get_a_conflict_name() {
    let world = World::new();
    let laptop = world.device("laptop");
    let phone = world.device("phone");
    let root_l = root(&laptop, &world).await;
    let root_p = root(&phone, &world).await;

    write_file(&laptop, root_l, "a.txt", b"laptop").await;
    let mine = write_file(&phone, root_p, "a.txt", b"phone").await;
    refresh(&phone, root_p).await;

    let conflict = format!("a (alice's conflicted copy {CONFLICT_DATE}).txt");
    assert_eq!(names(&phone, root_p).await, [conflict.clone(), "a.txt".to_string()]);
    // The phone's node follows its own file to the new name.
    assert_eq!(read_all(&phone, mine).await, b"phone");
    assert_eq!(open(&phone, root_p, &conflict).await, mine);
    let theirs = open(&phone, root_p, "a.txt").await;
    assert_eq!(read_all(&phone, theirs).await, b"laptop");

    refresh(&laptop, root_l).await;
    let copy = open(&laptop, root_l, &conflict).await;
    assert_eq!(read_all(&laptop, copy).await, b"phone");
}

#[tokio::test]
async fn test_concurrent_edits_keep_both_versions() {
    let world = World::new();
    let laptop = world.device("laptop");
    let phone = world.device("phone");
    let cancel = CancellationToken::new();
    let root_l = root(&laptop, &world).await;
    let root_p = root(&phone, &world).await;

    let file_l = write_file(&laptop, root_l, "shared.txt", b"v1").await;
    refresh(&phone, root_p).await;
    let file_p = open(&phone, root_p, "shared.txt").await;

    laptop.write(&cancel, file_l, b"laptop edit", 0).await.unwrap();
    laptop.sync(&cancel, file_l).await.unwrap();
    phone.write(&cancel, file_p, b"phone edit", 0).await.unwrap();
    phone.sync(&cancel, file_p).await.unwrap();
    assert!(staged(&phone, root_p));

    refresh(&phone, root_p).await;
    let conflict = format!("shared (alice's conflicted copy {CONFLICT_DATE}).txt");
    assert_eq!(
        names(&phone, root_p).await,
        ["shared (alice's conflicted copy 2023-11-14).txt", "shared.txt"]
    );
    assert_eq!(read_all(&phone, file_p).await, b"phone edit");
    let merged = open(&phone, root_p, "shared.txt").await;
    assert_eq!(read_all(&phone, merged).await, b"laptop edit");

    refresh(&laptop, root_l).await;
    assert_eq!(read_all(&laptop, file_l).await, b"laptop edit");
    let copy = open(&laptop, root_l, &conflict).await;
    assert_eq!(read_all(&laptop, copy).await, b"phone edit");
}

#[tokio::test]
async fn test_modification_survives_remote_removal() {
    let world = World::new();
    let laptop = world.device("laptop");
    let phone = world.device("phone");
    let cancel = CancellationToken::new();
    let root_l = root(&laptop, &world).await;
    let root_p = root(&phone, &world).await;

    write_file(&laptop, root_l, "f.txt", b"original").await;
    refresh(&phone, root_p).await;
    let file_p = open(&phone, root_p, "f.txt").await;

    laptop.remove_entry(&cancel, root_l, "f.txt").await.unwrap();
    phone.write(&cancel, file_p, b"changed", 0).await.unwrap();
    phone.sync(&cancel, file_p).await.unwrap();
    refresh(&phone, root_p).await;

    // The write overlays the first seven bytes and keeps the tail.
    assert_eq!(names(&phone, root_p).await, ["f.txt"]);
    assert_eq!(read_all(&phone, file_p).await, b"changedl");
    refresh(&laptop, root_l).await;
    let restored = open(&laptop, root_l, "f.txt").await;
    assert_eq!(read_all(&laptop, restored).await, b"changedl");
}

#[tokio::test]
async fn test_unmerged_rename_is_replayed() {
    let world = World::new();
    let laptop = world.device("laptop");
    let phone = world.device("phone");
    let cancel = CancellationToken::new();
    let root_l = root(&laptop, &world).await;
    let root_p = root(&phone, &world).await;

    let (docs_l, _) = laptop.create_dir(&cancel, root_l, "docs").await.unwrap();
    write_file(&laptop, docs_l, "old.txt", b"text").await;
    refresh(&phone, root_p).await;
    let docs_p = open(&phone, root_p, "docs").await;
    let file_p = open(&phone, docs_p, "old.txt").await;

    write_file(&laptop, docs_l, "other.txt", b"other").await;
    phone
        .rename(&cancel, docs_p, "old.txt", root_p, "new.txt")
        .await
        .unwrap();
    assert!(staged(&phone, root_p));
    refresh(&phone, root_p).await;

    assert_eq!(names(&phone, root_p).await, ["docs", "new.txt"]);
    assert_eq!(names(&phone, docs_p).await, ["other.txt"]);
    assert_eq!(read_all(&phone, file_p).await, b"text");

    refresh(&laptop, root_l).await;
    assert_eq!(names(&laptop, root_l).await, ["docs", "new.txt"]);
    assert_eq!(names(&laptop, docs_l).await, ["other.txt"]);
}

#[tokio::test]
async fn test_unstage_drops_local_changes() {
    let world = World::new();
    let laptop = world.device("laptop");
    let phone = world.device("phone");
    let cancel = CancellationToken::new();
    let root_l = root(&laptop, &world).await;
    let root_p = root(&phone, &world).await;

    write_file(&laptop, root_l, "kept.txt", b"laptop").await;
    let lost = write_file(&phone, root_p, "lost.txt", b"phone").await;
    phone.write(&cancel, lost, b"unsynced", 0).await.unwrap();
    assert!(staged(&phone, root_p));

    phone.unstage_for_testing(&cancel, root_p.tlf).await.unwrap();
    let (status, _) = phone.folder_status(root_p.tlf).unwrap();
    assert!(!status.staged);
    assert!(status.dirty_paths.is_empty());
    assert_eq!(world.md.branch_count(root_p.tlf), 0);
    assert_eq!(names(&phone, root_p).await, ["kept.txt"]);
    assert!(phone.stat(&cancel, lost).await.is_err());
}

#[tokio::test]
async fn test_rekey_is_refused_while_staged() {
    let world = World::new();
    let laptop = world.device("laptop");
    let phone = world.device("phone");
    let cancel = CancellationToken::new();
    let root_l = root(&laptop, &world).await;
    let root_p = root(&phone, &world).await;

    write_file(&laptop, root_l, "a", b"1").await;
    write_file(&phone, root_p, "b", b"2").await;
    let err = phone.rekey(&cancel, root_p.tlf).await.unwrap_err();
    assert!(matches!(err, Error::Unmerged(tlf) if tlf == root_p.tlf));
}

#[tokio::test(start_paused = true)]
async fn test_failing_resolution_backs_off_without_spinning() {
    let world = World::new();
    let laptop = world.device("laptop");
    let phone_key = world.add_device("phone");
    let root_l = root(&laptop, &world).await;
    {
        let phone = world.engine(&phone_key);
        let root_p = root(&phone, &world).await;
        write_file(&laptop, root_l, "a.txt", b"laptop").await;
        write_file(&phone, root_p, "b.txt", b"phone").await;
        assert!(staged(&phone, root_p));
        phone.shutdown().unwrap();
    }

    // Every new block is refused, so resolution cannot commit.
    world.blocks.set_limit_bytes(0);
    let phone = world.engine_with(
        &phone_key,
        EngineConfig {
            background_updates: true,
            ..test_config()
        },
    );
    let root_p = root(&phone, &world).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(staged(&phone, root_p));
    assert_eq!(world.md.pending_update_registrations(root_p.tlf), 1);

    world.blocks.set_limit_bytes(i64::MAX);
    write_file(&laptop, root_l, "c.txt", b"laptop again").await;
    world.blocks.set_limit_bytes(0);

    // The listener waits past the newest merged revision instead of
    // firing again at once.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(world.md.pending_update_registrations(root_p.tlf), 1);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(staged(&phone, root_p));
    assert_eq!(world.md.pending_update_registrations(root_p.tlf), 1);

    world.blocks.set_limit_bytes(i64::MAX);
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(!staged(&phone, root_p));
    assert_eq!(names(&phone, root_p).await, ["a.txt", "b.txt", "c.txt"]);
}
