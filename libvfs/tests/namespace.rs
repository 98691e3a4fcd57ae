mod common;

use std::sync::Arc;

use common::{FakeSlaveOps, assert_aggregates, init_logging, open_vfs};
use libvfs::{User, Vfs, VfsError, VfsEvent, VfsOptions};

#[test]
fn test_reload_after_reopen() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    {
        let vfs = Vfs::open(tmp.path(), VfsOptions::default()).unwrap();
        let root = vfs.root_handle();
        let rls = root.create_directory_unchecked("Rls", "alice", "staff").unwrap();
        let a = rls.create_file_unchecked("a.bin", "alice", "staff", Some("S1")).unwrap();
        a.set_size(100).unwrap();
        a.add_slave("S2").unwrap();
        let sub = rls.create_directory_unchecked("sub", "alice", "staff").unwrap();
        sub.create_file_unchecked("b.bin", "bob", "staff", Some("S2"))
            .unwrap()
            .set_size(20)
            .unwrap();
        root.create_link_unchecked("latest", "/Rls", "alice", "staff")
            .unwrap();
        vfs.flush();
    }

    let vfs = Vfs::open(tmp.path(), VfsOptions::default()).unwrap();
    let root = vfs.root_handle();
    assert_eq!(root.size().unwrap(), 120);
    assert_eq!(root.ref_count("S1").unwrap(), 1);
    assert_eq!(root.ref_count("S2").unwrap(), 2);

    let a = vfs.file("/rls/A.BIN");
    assert!(a.exists());
    assert_eq!(a.size().unwrap(), 100);
    assert_eq!(a.username().unwrap(), "alice");
    assert_eq!(vfs.file("/latest/sub/b.bin").size().unwrap(), 20);
    assert_eq!(vfs.directory("/rls").name(), "rls");
    assert_eq!(vfs.directory("/rls").inode().unwrap().name(), "Rls");
    assert_aggregates(&root);
}

#[test]
fn test_eviction_reloads_from_disk() {
    let (_tmp, vfs) = open_vfs();
    let root = vfs.root_handle();
    let d = root.create_directory_unchecked("d", "u", "g").unwrap();
    for i in 0..5 {
        d.create_file_unchecked(&format!("f{i}"), "u", "g", Some("S1"))
            .unwrap()
            .set_size(10)
            .unwrap();
    }
    let dir = d.inode().unwrap();
    assert_eq!(vfs.evict_children(&dir), 5);
    assert_eq!(d.size().unwrap(), 50);
    assert_eq!(d.files_unchecked().unwrap().len(), 5);
    assert_eq!(vfs.file("/d/f3").size().unwrap(), 10);
    assert_aggregates(&root);
}

#[test]
fn test_corrupt_file_record_is_dropped() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    {
        let vfs = Vfs::open(tmp.path(), VfsOptions::default()).unwrap();
        let rls = vfs
            .root_handle()
            .create_directory_unchecked("rls", "u", "g")
            .unwrap();
        rls.create_file_unchecked("a.bin", "u", "g", Some("S1"))
            .unwrap()
            .set_size(100)
            .unwrap();
        rls.create_file_unchecked("b.bin", "u", "g", Some("S1"))
            .unwrap()
            .set_size(5)
            .unwrap();
        vfs.flush();
        std::fs::write(vfs.disk().real_path("/rls/a.bin"), b"{ not json").unwrap();
    }

    let vfs = Vfs::open(tmp.path(), VfsOptions::default()).unwrap();
    let err = vfs.file("/rls/a.bin").size().unwrap_err();
    assert!(err.is_not_found());
    let rls = vfs.directory("/rls");
    assert_eq!(rls.size().unwrap(), 5);
    assert_eq!(rls.ref_count("S1").unwrap(), 1);
    assert_eq!(vfs.root_handle().size().unwrap(), 5);
    assert!(!vfs.disk().exists("/rls/a.bin"));
}

#[test]
fn test_corrupt_directory_record_is_regenerated() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    {
        let vfs = Vfs::open(tmp.path(), VfsOptions::default()).unwrap();
        let rls = vfs
            .root_handle()
            .create_directory_unchecked("rls", "u", "g")
            .unwrap();
        rls.create_file_unchecked("a.bin", "u", "g", Some("S1"))
            .unwrap()
            .set_size(100)
            .unwrap();
        vfs.flush();
        let record = vfs.disk().real_path("/rls").join(".dirProperties");
        std::fs::write(record, b"garbage").unwrap();
    }

    let vfs = Vfs::open(tmp.path(), VfsOptions::default()).unwrap();
    let rls = vfs.directory("/rls");
    assert_eq!(rls.size().unwrap(), 100);
    assert_eq!(rls.ref_count("S1").unwrap(), 1);
    assert!(vfs.file("/rls/a.bin").exists());
    assert!(
        rls.inode()
            .unwrap()
            .as_directory()
            .unwrap()
            .has_placeholder_last_modified()
    );
}

#[test]
fn test_corrupt_root_is_recreated() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join(".dirProperties"), b"[").unwrap();
    let vfs = Vfs::open(tmp.path(), VfsOptions::default()).unwrap();
    assert!(vfs.root_handle().is_empty_unchecked().unwrap());
    let raw = std::fs::read_to_string(tmp.path().join(".dirProperties")).unwrap();
    assert!(raw.contains("\"directory\""));
}

#[test]
fn test_size_and_refs_follow_mutations() {
    let (_tmp, vfs) = open_vfs();
    let root = vfs.root_handle();
    let a = root.create_directory_unchecked("a", "u", "g").unwrap();
    let b = a.create_directory_unchecked("b", "u", "g").unwrap();
    let f = b.create_file_unchecked("f", "u", "g", Some("S1")).unwrap();
    f.set_size(40).unwrap();
    f.add_slave("S2").unwrap();
    let g = a.create_file_unchecked("g", "u", "g", Some("S2")).unwrap();
    g.set_size(2).unwrap();
    assert_eq!(root.size().unwrap(), 42);
    assert_eq!(root.ref_count("S2").unwrap(), 2);
    assert_aggregates(&root);

    f.set_size(10).unwrap();
    f.remove_slave("S1").unwrap();
    assert_eq!(a.size().unwrap(), 12);
    assert_eq!(root.ref_count("S1").unwrap(), 0);
    assert_aggregates(&root);

    f.rename_to_unchecked("/f-moved").unwrap();
    assert_eq!(b.size().unwrap(), 0);
    assert_eq!(root.size().unwrap(), 12);
    assert_eq!(vfs.file("/f-moved").size().unwrap(), 10);
    assert_aggregates(&root);

    let report = root.validate_size_recursive().unwrap();
    assert_eq!(report.corrected, 0);
    assert_eq!(report.new_size, 12);
}

#[test]
fn test_handles_fail_after_concurrent_delete() {
    let (_tmp, vfs) = open_vfs();
    let root = vfs.root_handle();
    let f = root.create_file_unchecked("f", "u", "g", Some("S1")).unwrap();
    let same = vfs.file("/F");
    assert_eq!(f, same);
    vfs.delete_inode(&f.inode().unwrap()).unwrap();
    assert!(same.size().unwrap_err().is_not_found());
    assert!(matches!(
        vfs.delete_inode(&vfs.root()),
        Err(VfsError::PermissionDenied(_))
    ));
}

#[tokio::test]
async fn test_delete_routes_to_slaves() {
    let (_tmp, vfs) = open_vfs();
    let ops = Arc::new(FakeSlaveOps::new(&["S1", "S2"], &["S1"]));
    vfs.set_slave_ops(ops.clone());
    let root = vfs.root_handle();
    let d = root.create_directory_unchecked("d", "u", "g").unwrap();
    let f = d.create_file_unchecked("f", "u", "g", Some("S1")).unwrap();
    f.add_slave("S2").unwrap();
    let keep = root.create_file_unchecked("keep", "u", "g", Some("S2")).unwrap();

    f.delete_unchecked().await.unwrap();
    let mut deletes = ops.deletes.lock().unwrap().clone();
    deletes.sort();
    assert_eq!(
        deletes,
        vec![
            ("S1".to_string(), "/d/f".to_string()),
            ("S2".to_string(), "/d/f".to_string())
        ]
    );

    d.delete(&User::new("u", "g")).await.unwrap();
    assert_eq!(ops.broadcast_deletes.lock().unwrap().as_slice(), &["/d".to_string()]);
    assert_eq!(ops.cancelled.lock().unwrap().as_slice(), &["/d".to_string()]);
    assert!(!d.exists());
    assert!(keep.exists());
    assert_eq!(root.ref_count("S1").unwrap(), 0);
    assert_eq!(root.ref_count("S2").unwrap(), 1);
}

#[test]
fn test_rename_routes_to_slaves() {
    let (_tmp, vfs) = open_vfs();
    let ops = Arc::new(FakeSlaveOps::new(&["S1"], &["S1"]));
    vfs.set_slave_ops(ops.clone());
    let root = vfs.root_handle();
    let d = root.create_directory_unchecked("d", "u", "g").unwrap();
    let e = root.create_directory_unchecked("e", "u", "g").unwrap();
    let f = d.create_file_unchecked("f", "u", "g", Some("S1")).unwrap();
    f.set_size(3).unwrap();

    // "ghost" is no longer a known slave and gets no command
    f.add_slave("ghost").unwrap();
    f.rename_to_unchecked("/e/g").unwrap();
    assert_eq!(
        ops.renames.lock().unwrap().as_slice(),
        &[(
            "S1".to_string(),
            "/d/f".to_string(),
            "/e".to_string(),
            "g".to_string()
        )]
    );
    assert_eq!(e.size().unwrap(), 3);
    assert_eq!(d.size().unwrap(), 0);

    d.rename_to(&User::new("u", "g"), "/e/d2").unwrap();
    assert_eq!(
        ops.broadcast_renames.lock().unwrap().as_slice(),
        &[("/d".to_string(), "/e".to_string(), "d2".to_string())]
    );
    assert!(vfs.directory("/e/d2").exists());
    assert!(matches!(
        e.rename_to_unchecked("/e/d2/inside"),
        Err(VfsError::PermissionDenied(_))
    ));
    let err = vfs.file("/e/g").rename_to_unchecked("/E/D2").unwrap_err();
    assert!(matches!(err, VfsError::AlreadyExists(_)));
}

#[tokio::test]
async fn test_checksum_fetch_falls_back_across_slaves() {
    let (_tmp, vfs) = open_vfs();
    let mut ops = FakeSlaveOps::new(&["S1", "S2", "S3"], &["S1", "S2"]);
    ops.checksums.insert("S2".to_string(), 0xabcd);
    let ops = Arc::new(ops);
    vfs.set_slave_ops(ops.clone());
    let f = vfs
        .root_handle()
        .create_file_unchecked("f", "u", "g", Some("S1"))
        .unwrap();
    f.add_slave("S2").unwrap();
    f.add_slave("S3").unwrap();

    assert_eq!(f.checksum().await.unwrap(), 0xabcd);
    assert_eq!(
        ops.checksum_calls.lock().unwrap().as_slice(),
        &["S1".to_string(), "S2".to_string()]
    );
    assert_eq!(f.checksum().await.unwrap(), 0xabcd);
    assert_eq!(ops.checksum_calls.lock().unwrap().len(), 2);
    assert_eq!(f.checksum_cached().unwrap(), 0xabcd);
}

#[test]
fn test_offline_files_and_availability() {
    let (_tmp, vfs) = open_vfs();
    let ops = Arc::new(FakeSlaveOps::new(&["S1", "S2"], &["S1"]));
    vfs.set_slave_ops(ops);
    let root = vfs.root_handle();
    let d = root.create_directory_unchecked("d", "u", "g").unwrap();
    let online = d.create_file_unchecked("on", "u", "g", Some("S1")).unwrap();
    assert!(!root.has_offline_files().unwrap());
    assert_eq!(online.a_slave_for_function().unwrap(), "S1");

    let offline = d.create_file_unchecked("off", "u", "g", Some("S2")).unwrap();
    assert!(root.has_offline_files().unwrap());
    assert!(!offline.is_available().unwrap());
    assert!(matches!(
        offline.a_slave_for_function(),
        Err(VfsError::NoAvailableSlave(_))
    ));

    let forgotten = d.create_file_unchecked("gone", "u", "g", Some("S1")).unwrap();
    forgotten.add_slave("S9").unwrap();
    assert_eq!(
        forgotten.available_slaves().unwrap().into_iter().collect::<Vec<_>>(),
        vec!["S1"]
    );
    assert!(!forgotten.has_slave("S9").unwrap());
    assert_eq!(root.ref_count("S9").unwrap(), 0);
}

#[test]
fn test_remove_slave_from_tree() {
    let (_tmp, vfs) = open_vfs();
    let root = vfs.root_handle();
    let a = root.create_directory_unchecked("a", "u", "g").unwrap();
    let b = root.create_directory_unchecked("b", "u", "g").unwrap();
    a.create_file_unchecked("1", "u", "g", Some("S1")).unwrap();
    let two = a.create_file_unchecked("2", "u", "g", Some("S1")).unwrap();
    two.add_slave("S2").unwrap();
    b.create_file_unchecked("3", "u", "g", Some("S2")).unwrap();

    assert_eq!(root.remove_slave("S1").unwrap(), 2);
    assert!(a.exists());
    assert!(!vfs.file("/a/1").exists());
    assert!(b.exists());
    assert_eq!(root.ref_count("S1").unwrap(), 0);

    assert_eq!(root.remove_slave("S2").unwrap(), 2);
    assert!(!a.exists());
    assert!(!b.exists());
    assert!(root.exists());
    assert_aggregates(&root);
}

#[tokio::test]
async fn test_events_are_published() {
    let (_tmp, vfs) = open_vfs();
    let mut rx = vfs.events().subscribe();
    let root = vfs.root_handle();
    let d = root.create_directory_unchecked("d", "u", "g").unwrap();
    let f = d.create_file_unchecked("f", "u", "g", Some("S1")).unwrap();
    f.set_size(9).unwrap();
    f.rename_to_unchecked("/d/g").unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
    assert!(seen.contains(&VfsEvent::Created {
        path: "/d".to_string()
    }));
    assert!(seen.contains(&VfsEvent::Created {
        path: "/d/f".to_string()
    }));
    assert!(seen.contains(&VfsEvent::SizeChanged {
        path: "/d/f".to_string(),
        size: 9
    }));
    assert!(seen.contains(&VfsEvent::Renamed {
        from: "/d/f".to_string(),
        to: "/d/g".to_string()
    }));
}

#[tokio::test]
async fn test_owner_permissions_on_delete_and_rename() {
    let (_tmp, vfs) = open_vfs();
    let mut perms = libvfs::PathPermissions::new();
    perms.add_rule(libvfs::PermAction::DeleteOwn, "*", &["*"]);
    perms.add_rule(libvfs::PermAction::Delete, "*", &["=siteop"]);
    perms.add_rule(libvfs::PermAction::RenameOwn, "*", &["!*"]);
    vfs.set_permissions(Arc::new(perms));
    let root = vfs.root_handle();
    let alice = User::new("alice", "users");
    let bob = User::new("bob", "users");
    let op = User::new("op", "siteop");
    let mine = root.create_directory(&alice, "mine").unwrap();
    let other = root.create_directory(&alice, "other").unwrap();

    let err = mine.rename_to(&alice, "/renamed").unwrap_err();
    assert!(matches!(err, VfsError::PermissionDenied(_)));

    let err = mine.delete(&bob).await.unwrap_err();
    assert!(matches!(err, VfsError::PermissionDenied(_)));
    mine.delete(&alice).await.unwrap();
    assert!(!mine.exists());

    other.delete(&op).await.unwrap();
    assert!(!other.exists());
}
