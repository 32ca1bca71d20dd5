mod common;

use common::{World, names, read_all, root, write_file};
use std::sync::{Arc, Mutex};
use tlfs_core::{CancellationToken, EntryType, Error, ops::WriteRange};
use tlfs_fs::{Node, NodeChange, Observer};

#[derive(Debug, Default)]
struct Recorder {
    local: Mutex<Vec<(Node, WriteRange)>>,
    batches: Mutex<Vec<Vec<NodeChange>>>,
}

impl Observer for Recorder {
    fn local_change(&self, node: Node, write: WriteRange) {
        self.local.lock().unwrap().push((node, write));
    }

    fn batch_changes(&self, changes: &[NodeChange]) {
        self.batches.lock().unwrap().push(changes.to_vec());
    }
}

#[tokio::test]
async fn test_create_and_lookup() {
    let world = World::new();
    let laptop = world.device("laptop");
    let cancel = CancellationToken::new();
    let root = root(&laptop, &world).await;

    let (docs, info) = laptop.create_dir(&cancel, root, "docs").await.unwrap();
    assert_eq!(info.typ, EntryType::Dir);
    let (run, _) = laptop.create_file(&cancel, docs, "run.sh", true).await.unwrap();
    let link = laptop
        .create_link(&cancel, docs, "latest", "run.sh")
        .await
        .unwrap();
    assert_eq!(link.typ, EntryType::Sym);
    assert_eq!(link.sym_path.as_deref(), Some("run.sh"));

    assert_eq!(names(&laptop, root).await, ["docs"]);
    assert_eq!(names(&laptop, docs).await, ["latest", "run.sh"]);

    let (found, info) = laptop.lookup(&cancel, docs, "run.sh").await.unwrap();
    assert_eq!(found, Some(run));
    assert_eq!(info.typ, EntryType::Exec);
    let (found, info) = laptop.lookup(&cancel, docs, "latest").await.unwrap();
    assert!(found.is_none(), "symlinks have no node");
    assert_eq!(info.sym_path.as_deref(), Some("run.sh"));

    let meta = laptop.get_node_metadata(&cancel, run).await.unwrap();
    assert_eq!(meta.last_writer, world.alice);
    assert_eq!(meta.entry.size, 0);
}

#[tokio::test]
async fn test_name_errors() {
    let world = World::new();
    let laptop = world.device("laptop");
    let cancel = CancellationToken::new();
    let root = root(&laptop, &world).await;
    laptop.create_dir(&cancel, root, "docs").await.unwrap();

    let long = "x".repeat(256);
    for bad in ["", ".", "..", "a/b", long.as_str()] {
        let err = laptop.create_file(&cancel, root, bad, false).await.unwrap_err();
        assert!(matches!(err, Error::InvalidName(_)), "{bad:?}: {err}");
    }
    let err = laptop.create_file(&cancel, root, "docs", false).await.unwrap_err();
    assert!(matches!(err, Error::NameExists(_)));
    let err = laptop.lookup(&cancel, root, "missing").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn test_remove() {
    let world = World::new();
    let laptop = world.device("laptop");
    let cancel = CancellationToken::new();
    let root = root(&laptop, &world).await;
    let (docs, _) = laptop.create_dir(&cancel, root, "docs").await.unwrap();
    let file = write_file(&laptop, docs, "a.txt", b"hello").await;

    let err = laptop.remove_dir(&cancel, root, "docs").await.unwrap_err();
    assert!(matches!(err, Error::DirNotEmpty(_)));
    let err = laptop.remove_entry(&cancel, root, "docs").await.unwrap_err();
    assert!(matches!(err, Error::NotFile(_)));
    let err = laptop.remove_dir(&cancel, docs, "a.txt").await.unwrap_err();
    assert!(matches!(err, Error::NotDir(_)));

    laptop.remove_entry(&cancel, docs, "a.txt").await.unwrap();
    let err = laptop.stat(&cancel, file).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "{err}");
    laptop.remove_dir(&cancel, root, "docs").await.unwrap();
    assert!(names(&laptop, root).await.is_empty());
}

#[tokio::test]
async fn test_rename_keeps_nodes() {
    let world = World::new();
    let laptop = world.device("laptop");
    let cancel = CancellationToken::new();
    let root = root(&laptop, &world).await;
    let (docs, _) = laptop.create_dir(&cancel, root, "docs").await.unwrap();
    let (old, _) = laptop.create_dir(&cancel, root, "old").await.unwrap();
    let file = write_file(&laptop, docs, "a.txt", b"contents").await;
    write_file(&laptop, old, "b.txt", b"replaced").await;

    laptop
        .rename(&cancel, docs, "a.txt", old, "b.txt")
        .await
        .unwrap();
    assert!(names(&laptop, docs).await.is_empty());
    assert_eq!(names(&laptop, old).await, ["b.txt"]);
    assert_eq!(read_all(&laptop, file).await, b"contents");
    let (found, _) = laptop.lookup(&cancel, old, "b.txt").await.unwrap();
    assert_eq!(found, Some(file));

    let err = laptop
        .rename(&cancel, root, "docs", docs, "inner")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidName(_)));
    let err = laptop
        .rename(&cancel, root, "docs", root, "old")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DirNotEmpty(_)), "{err}");

    laptop.rename(&cancel, root, "old", root, "new").await.unwrap();
    assert_eq!(names(&laptop, root).await, ["docs", "new"]);
    assert_eq!(read_all(&laptop, file).await, b"contents");
}

#[tokio::test]
async fn test_attributes() {
    let world = World::new();
    let laptop = world.device("laptop");
    let cancel = CancellationToken::new();
    let root = root(&laptop, &world).await;
    let file = write_file(&laptop, root, "tool", b"#!/bin/sh").await;

    laptop.set_ex(&cancel, file, true).await.unwrap();
    assert_eq!(laptop.stat(&cancel, file).await.unwrap().typ, EntryType::Exec);
    laptop.set_mtime(&cancel, file, 42).await.unwrap();
    assert_eq!(laptop.stat(&cancel, file).await.unwrap().mtime, 42);

    let err = laptop.set_ex(&cancel, root, true).await.unwrap_err();
    assert!(matches!(err, Error::NotFile(_)));
}

#[tokio::test]
async fn test_observer_sees_local_and_batched_changes() {
    let world = World::new();
    let laptop = world.device("laptop");
    let cancel = CancellationToken::new();
    let root = root(&laptop, &world).await;
    let recorder = Arc::new(Recorder::default());
    let observer: Arc<dyn Observer> = recorder.clone();
    laptop.register_for_changes(root.tlf, observer.clone()).unwrap();

    let (file, _) = laptop.create_file(&cancel, root, "a", false).await.unwrap();
    laptop.write(&cancel, file, b"abc", 0).await.unwrap();
    assert_eq!(
        *recorder.local.lock().unwrap(),
        [(file, WriteRange { off: 0, len: 3 })]
    );
    assert!(
        recorder
            .batches
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .any(|c| *c == NodeChange::Updated(root))
    );

    laptop.remove_entry(&cancel, root, "a").await.unwrap();
    assert!(
        recorder
            .batches
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .any(|c| *c == NodeChange::Unlinked(file))
    );

    laptop.unregister_for_changes(root.tlf, &observer).unwrap();
    let before = recorder.batches.lock().unwrap().len();
    laptop.create_dir(&cancel, root, "quiet").await.unwrap();
    assert_eq!(recorder.batches.lock().unwrap().len(), before);
}

#[tokio::test]
async fn test_second_device_sees_changes() {
    let world = World::new();
    let laptop = world.device("laptop");
    let phone = world.device("phone");
    let cancel = CancellationToken::new();

    let root_l = root(&laptop, &world).await;
    let root_p = root(&phone, &world).await;
    let (docs, _) = laptop.create_dir(&cancel, root_l, "docs").await.unwrap();
    write_file(&laptop, docs, "a.txt", b"from the laptop").await;

    assert!(names(&phone, root_p).await.is_empty());
    phone
        .sync_from_server_for_testing(&cancel, root_p.tlf)
        .await
        .unwrap();
    let (docs_p, _) = phone.lookup(&cancel, root_p, "docs").await.unwrap();
    let (file, _) = phone
        .lookup(&cancel, docs_p.unwrap(), "a.txt")
        .await
        .unwrap();
    assert_eq!(read_all(&phone, file.unwrap()).await, b"from the laptop");
}
