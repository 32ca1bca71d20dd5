mod common;

use common::{World, read_all, root, test_config, write_file};
use std::sync::Arc;
use tlfs_core::{CancellationToken, EngineConfig, Error, crypto::DeviceCrypto};
use tlfs_fs::RekeyStatus;
use tlfs_keys::RekeyOutcome;

fn slow_prompt() -> EngineConfig {
    EngineConfig {
        rekey_with_prompt_wait_ms: 60_000,
        ..test_config()
    }
}

#[tokio::test]
async fn test_new_device_waits_for_a_rekey() {
    let world = World::new();
    let laptop = world.device("laptop");
    let cancel = CancellationToken::new();
    let root_l = root(&laptop, &world).await;
    write_file(&laptop, root_l, "a.txt", b"secret").await;

    let phone_key = world.add_device("phone");
    let phone = world.engine_with(&phone_key, slow_prompt());
    let err = phone
        .get_or_create_root_node(&cancel, &world.handle)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RekeyNeedsInteraction(tlf) if tlf == root_l.tlf));
    let (status, _) = phone.folder_status(root_l.tlf).unwrap();
    assert!(!status.readable);

    let mut queued = phone.rekey_status(root_l.tlf);
    queued
        .wait_for(|s| *s == RekeyStatus::AwaitingInteraction)
        .await
        .unwrap();

    let outcome = laptop.rekey(&cancel, root_l.tlf).await.unwrap();
    assert_eq!(outcome, RekeyOutcome::DevicesAdded);

    phone
        .sync_from_server_for_testing(&cancel, root_l.tlf)
        .await
        .unwrap();
    let root_p = phone.get_root_node(&cancel, &world.handle).await.unwrap();
    let (file, _) = phone.lookup(&cancel, root_p, "a.txt").await.unwrap();
    assert_eq!(read_all(&phone, file.unwrap()).await, b"secret");
}

#[tokio::test(start_paused = true)]
async fn test_paper_key_unlocks_after_the_prompt_wait() {
    let world = World::new();
    let paper = Arc::new(DeviceCrypto::generate());
    world.dir.set_paper_key(world.alice, paper).unwrap();
    let laptop = world.device("laptop");
    let root_l = root(&laptop, &world).await;
    write_file(&laptop, root_l, "a.txt", b"from the laptop").await;

    let phone_key = world.add_device("phone");
    let phone = world.engine_with(&phone_key, slow_prompt());
    let cancel = CancellationToken::new();
    let err = phone
        .get_or_create_root_node(&cancel, &world.handle)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RekeyNeedsInteraction(_)));

    let mut status = phone.rekey_status(root_l.tlf);
    status
        .wait_for(|s| *s == RekeyStatus::AwaitingInteraction)
        .await
        .unwrap();
    // The paused clock jumps ahead once every task is idle.
    let done = status.wait_for(RekeyStatus::is_finished).await.unwrap().clone();
    assert_eq!(done, RekeyStatus::Done(RekeyOutcome::DevicesAdded));

    let root_p = phone.get_root_node(&cancel, &world.handle).await.unwrap();
    let (file, _) = phone.lookup(&cancel, root_p, "a.txt").await.unwrap();
    assert_eq!(read_all(&phone, file.unwrap()).await, b"from the laptop");
}

#[tokio::test]
async fn test_requested_rekey_with_nothing_to_do() {
    let world = World::new();
    let laptop = world.device("laptop");
    let root_l = root(&laptop, &world).await;

    let mut status = laptop.request_rekey(root_l.tlf).unwrap();
    let done = status.wait_for(RekeyStatus::is_finished).await.unwrap().clone();
    assert_eq!(done, RekeyStatus::Done(RekeyOutcome::Unchanged));
    assert_eq!(
        *laptop.rekey_status(root_l.tlf).borrow(),
        RekeyStatus::Done(RekeyOutcome::Unchanged)
    );
}

#[tokio::test]
async fn test_revoked_device_forces_a_new_key_generation() {
    let world = World::new();
    let laptop = world.device("laptop");
    let old_phone = world.add_device("old phone");
    let cancel = CancellationToken::new();
    let root_l = root(&laptop, &world).await;
    write_file(&laptop, root_l, "before.txt", b"old key").await;

    world.dir.revoke_device(world.alice, old_phone.kid()).unwrap();
    let outcome = laptop.rekey(&cancel, root_l.tlf).await.unwrap();
    assert_eq!(outcome, RekeyOutcome::NewKeyGen);

    let after = write_file(&laptop, root_l, "after.txt", b"new key").await;
    assert_eq!(read_all(&laptop, after).await, b"new key");
    let (before, _) = laptop.lookup(&cancel, root_l, "before.txt").await.unwrap();
    assert_eq!(read_all(&laptop, before.unwrap()).await, b"old key");

    let err = world.dir.session(world.alice, old_phone.kid()).unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_prompt_wait_fails_the_rekey() {
    let world = World::new();
    let laptop = world.device("laptop");
    let root_l = root(&laptop, &world).await;
    write_file(&laptop, root_l, "a.txt", b"secret").await;

    let phone_key = world.add_device("phone");
    let phone = world.engine_with(&phone_key, slow_prompt());
    let cancel = CancellationToken::new();
    phone
        .get_or_create_root_node(&cancel, &world.handle)
        .await
        .unwrap_err();
    let mut status = phone.rekey_status(root_l.tlf);
    status
        .wait_for(|s| *s == RekeyStatus::AwaitingInteraction)
        .await
        .unwrap();

    phone.shutdown().unwrap();
    let done = status.wait_for(RekeyStatus::is_finished).await.unwrap().clone();
    assert_eq!(done, RekeyStatus::Failed(Error::Shutdown.to_string()));
}
