mod common;

use std::sync::Arc;
use std::thread;

use common::{FakeRemergeSlave, assert_aggregates, init_logging, open_vfs, snapshot};
use libvfs::{CollisionPolicy, LightRemoteInode, RemergeError, RemergeReport, Vfs, VfsOptions};

#[test]
fn test_rls_scenario() {
    let (_tmp, vfs) = open_vfs();
    let root = vfs.root_handle();
    let rls = root.create_directory_unchecked("rls", "u", "g").unwrap();
    let a = rls.create_file_unchecked("a.bin", "u", "g", Some("S1")).unwrap();
    a.set_size(100).unwrap();
    let s1 = FakeRemergeSlave::new("S1");

    let before = snapshot(&root);
    let report = rls
        .remerge(
            &[LightRemoteInode::file("a.bin", 100, 10)],
            &s1,
            10,
            CollisionPolicy::Rename,
        )
        .unwrap();
    assert_eq!(report, RemergeReport::default());
    assert_eq!(snapshot(&root), before);

    let report = rls
        .remerge(
            &[LightRemoteInode::file("b.bin", 50, 10)],
            &s1,
            10,
            CollisionPolicy::Rename,
        )
        .unwrap();
    assert_eq!(report.created, 1);
    assert_eq!(report.slaves_removed, 1);
    assert!(!a.exists());
    let b = rls.file_unchecked("b.bin").unwrap();
    assert_eq!(b.slaves().unwrap().into_iter().collect::<Vec<_>>(), vec!["S1"]);
    assert_eq!(rls.size().unwrap(), 50);
    assert_eq!(rls.ref_count("S1").unwrap(), 1);
    assert_eq!(root.size().unwrap(), 50);
    assert_eq!(root.ref_count("S1").unwrap(), 1);
    assert_aggregates(&root);
}

#[test]
fn test_remerge_is_idempotent() {
    let (_tmp, vfs) = open_vfs();
    let root = vfs.root_handle();
    let s1 = FakeRemergeSlave::with_checksums("S1");
    let listing = vec![
        LightRemoteInode::file("B.nfo", 3, 200),
        LightRemoteInode::file("a.rar", 1000, 100),
        LightRemoteInode::file("c.sfv", 20, 300),
    ];
    let dir = vfs.directory("/mp3/new");
    let first = dir
        .remerge(&listing, &s1, 400, CollisionPolicy::Rename)
        .unwrap();
    assert_eq!(first.created, 3);
    let after_first = snapshot(&root);

    let second = dir
        .remerge(&listing, &s1, 400, CollisionPolicy::Rename)
        .unwrap();
    assert_eq!(second.created, 0);
    assert_eq!(second.slaves_added, 0);
    assert_eq!(second.collisions, 0);
    assert_eq!(snapshot(&root), after_first);
    assert_eq!(dir.last_modified().unwrap(), 400);
    assert_aggregates(&root);
}

#[test]
fn test_collision_with_link_rename() {
    let (_tmp, vfs) = open_vfs();
    let root = vfs.root_handle();
    let d = root.create_directory_unchecked("d", "u", "g").unwrap();
    d.create_link_unchecked("x", "/d", "u", "g").unwrap();
    let s1 = FakeRemergeSlave::new("S1");

    let report = d
        .remerge(
            &[LightRemoteInode::file("x", 10, 1)],
            &s1,
            1,
            CollisionPolicy::Rename,
        )
        .unwrap();
    assert_eq!(report.collisions, 1);
    assert_eq!(
        s1.renames.lock().unwrap().as_slice(),
        &[("/d/x".to_string(), "/d".to_string(), "x.collision.S1".to_string())]
    );
    assert!(s1.deletes.lock().unwrap().is_empty());

    assert_eq!(d.link_unchecked("x").unwrap().target().unwrap(), "/d");
    let copy = d.file_unchecked("x.collision.S1").unwrap();
    assert_eq!(copy.size().unwrap(), 10);
    assert!(copy.has_slave("S1").unwrap());
    assert_eq!(d.inode_handles_unchecked().unwrap().len(), 2);
    assert_aggregates(&root);
}

#[test]
fn test_collision_with_link_delete() {
    let (_tmp, vfs) = open_vfs();
    let root = vfs.root_handle();
    let d = root.create_directory_unchecked("d", "u", "g").unwrap();
    d.create_link_unchecked("x", "/d", "u", "g").unwrap();
    let s1 = FakeRemergeSlave::new("S1");

    let report = d
        .remerge(
            &[LightRemoteInode::file("x", 10, 1)],
            &s1,
            1,
            CollisionPolicy::DeleteIncoming,
        )
        .unwrap();
    assert_eq!(report.collisions, 1);
    assert_eq!(report.created, 0);
    assert_eq!(s1.deletes.lock().unwrap().as_slice(), &["/d/x".to_string()]);
    assert!(s1.renames.lock().unwrap().is_empty());

    let children = d.inode_handles_unchecked().unwrap();
    assert_eq!(children.len(), 1);
    assert!(children[0].is_link());
    assert_eq!(d.size().unwrap(), 0);
}

#[test]
fn test_single_slave_size_correction() {
    let (_tmp, vfs) = open_vfs();
    let root = vfs.root_handle();
    let d = root.create_directory_unchecked("d", "u", "g").unwrap();
    let f = d.create_file_unchecked("f.bin", "u", "g", Some("A")).unwrap();
    f.set_size(100).unwrap();
    let a = FakeRemergeSlave::new("A");

    let report = d
        .remerge(
            &[LightRemoteInode::file("f.bin", 120, 1)],
            &a,
            1,
            CollisionPolicy::Rename,
        )
        .unwrap();
    assert_eq!(report.sizes_corrected, 1);
    assert_eq!(report.collisions, 0);
    assert_eq!(f.size().unwrap(), 120);
    assert!(f.has_slave("A").unwrap());
    assert_eq!(d.inode_handles_unchecked().unwrap().len(), 1);
    assert!(a.renames.lock().unwrap().is_empty());
    assert_eq!(root.size().unwrap(), 120);
}

#[test]
fn test_size_mismatch_with_other_holders_collides() {
    let (_tmp, vfs) = open_vfs();
    let root = vfs.root_handle();
    let d = root.create_directory_unchecked("d", "u", "g").unwrap();
    let f = d.create_file_unchecked("f.bin", "u", "g", Some("A")).unwrap();
    f.set_size(100).unwrap();
    f.add_slave("B").unwrap();
    let b = FakeRemergeSlave::new("B");

    let report = d
        .remerge(
            &[LightRemoteInode::file("f.bin", 120, 1)],
            &b,
            1,
            CollisionPolicy::Rename,
        )
        .unwrap();
    assert_eq!(report.collisions, 1);
    assert_eq!(f.size().unwrap(), 100);
    assert!(!f.has_slave("B").unwrap());
    let copy = d.file_unchecked("f.bin.collision.B").unwrap();
    assert_eq!(copy.size().unwrap(), 120);
    assert_eq!(d.ref_count("A").unwrap(), 1);
    assert_eq!(d.ref_count("B").unwrap(), 1);
    assert_eq!(d.size().unwrap(), 220);
    assert_aggregates(&root);
}

#[test]
fn test_unknown_physical_directory_is_fatal() {
    let (_tmp, vfs) = open_vfs();
    let d = vfs
        .root_handle()
        .create_directory_unchecked("d", "u", "g")
        .unwrap();
    let s1 = FakeRemergeSlave::new("S1");
    let err = d
        .remerge(
            &[LightRemoteInode::directory("sub", 1)],
            &s1,
            1,
            CollisionPolicy::Rename,
        )
        .unwrap_err();
    match err {
        RemergeError::UnexpectedDirectory { slave, path } => {
            assert_eq!(slave, "S1");
            assert_eq!(path, "/d/sub");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn test_deep_remerge_stamps_placeholders() {
    let (_tmp, vfs) = open_vfs();
    let root = vfs.root_handle();
    let s1 = FakeRemergeSlave::new("S1");

    let deep = vfs.directory("/a/b");
    deep.remerge(
        &[LightRemoteInode::file("f", 5, 400)],
        &s1,
        500,
        CollisionPolicy::Rename,
    )
    .unwrap();
    let a = vfs.directory("/a");
    let a_inode = a.inode().unwrap();
    assert!(a_inode.as_directory().unwrap().has_placeholder_last_modified());
    assert_eq!(deep.last_modified().unwrap(), 500);

    a.remerge(
        &[LightRemoteInode::directory("b", 500)],
        &s1,
        300,
        CollisionPolicy::Rename,
    )
    .unwrap();
    assert_eq!(a.last_modified().unwrap(), 300);
    assert!(!a_inode.as_directory().unwrap().has_placeholder_last_modified());

    a.remerge(
        &[LightRemoteInode::directory("b", 500)],
        &s1,
        200,
        CollisionPolicy::Rename,
    )
    .unwrap();
    assert_eq!(a.last_modified().unwrap(), 300);
    assert_eq!(root.ref_count("S1").unwrap(), 1);
    assert_aggregates(&root);
}

#[test]
fn test_slave_leaving_prunes_emptied_directories() {
    let (_tmp, vfs) = open_vfs();
    let root = vfs.root_handle();
    let s1 = FakeRemergeSlave::new("S1");
    let s2 = FakeRemergeSlave::new("S2");

    vfs.directory("/x/only1")
        .remerge(&[LightRemoteInode::file("f", 1, 1)], &s1, 1, CollisionPolicy::Rename)
        .unwrap();
    vfs.directory("/x/shared")
        .remerge(&[LightRemoteInode::file("g", 2, 1)], &s1, 1, CollisionPolicy::Rename)
        .unwrap();
    vfs.directory("/x/shared")
        .remerge(&[LightRemoteInode::file("g", 2, 1)], &s2, 1, CollisionPolicy::Rename)
        .unwrap();
    assert_eq!(root.ref_count("S1").unwrap(), 2);
    assert_eq!(root.ref_count("S2").unwrap(), 1);

    // S1 no longer has anything under /x
    let report = vfs
        .directory("/x")
        .remerge(&[], &s1, 1, CollisionPolicy::Rename)
        .unwrap();
    assert_eq!(report.slaves_removed, 2);
    assert!(!vfs.directory("/x/only1").exists());
    assert!(vfs.directory("/x/shared").exists());
    assert_eq!(root.ref_count("S1").unwrap(), 0);
    assert_eq!(root.ref_count("S2").unwrap(), 1);
    assert_eq!(root.size().unwrap(), 2);
    assert_aggregates(&root);
}

#[test]
fn test_checksums_queued_for_unknown() {
    let (_tmp, vfs) = open_vfs();
    let d = vfs
        .root_handle()
        .create_directory_unchecked("d", "u", "g")
        .unwrap();
    let f = d.create_file_unchecked("known.bin", "u", "g", Some("S0")).unwrap();
    f.set_size(7).unwrap();
    f.set_checksum(0xdeadbeef).unwrap();
    let u = d.create_file_unchecked("unknown.bin", "u", "g", Some("S0")).unwrap();
    u.set_size(9).unwrap();

    let s1 = FakeRemergeSlave::with_checksums("S1");
    let report = d
        .remerge(
            &[
                LightRemoteInode::file("known.bin", 7, 1),
                LightRemoteInode::file("new.bin", 3, 1),
                LightRemoteInode::file("unknown.bin", 9, 1),
            ],
            &s1,
            1,
            CollisionPolicy::Rename,
        )
        .unwrap();
    assert_eq!(report.slaves_added, 2);
    assert_eq!(report.checksums_queued, 2);
    let queued = s1.queued.lock().unwrap().clone();
    assert_eq!(queued, vec!["/d/new.bin".to_string(), "/d/unknown.bin".to_string()]);
}

#[test]
fn test_slave_names_survive_reload() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let s1 = FakeRemergeSlave::new("S1");
    {
        let vfs = Vfs::open(tmp.path(), VfsOptions::default()).unwrap();
        let report = vfs
            .root_handle()
            .remerge(
                &[
                    LightRemoteInode::file(".dirProperties.x.tmp", 5, 1),
                    LightRemoteInode::file("movie.rkfs-tmp", 10, 1),
                    LightRemoteInode::file("movie.tmp", 20, 1),
                ],
                &s1,
                1,
                CollisionPolicy::Rename,
            )
            .unwrap();
        assert_eq!(report.created, 2);
        vfs.flush();
    }

    let vfs = Vfs::open(tmp.path(), VfsOptions::default()).unwrap();
    let root = vfs.root_handle();
    assert!(vfs.file("/movie.rkfs-tmp").exists());
    assert!(vfs.file("/movie.tmp").exists());
    assert!(!vfs.file("/.dirProperties.x.tmp").exists());
    assert_eq!(root.size().unwrap(), 30);
    assert_eq!(root.ref_count("S1").unwrap(), 2);
    assert_aggregates(&root);
}

#[test]
fn test_concurrent_remerges_converge() {
    let (_tmp, vfs) = open_vfs();
    let root = vfs.root_handle();
    let dirs: Vec<String> = (0..3)
        .flat_map(|d| (0..2).map(move |s| format!("/d{d}/sub{s}")))
        .collect();
    for dir in &dirs {
        let handle = vfs.directory(dir);
        handle.parent().create_directory_recursive(handle.name()).unwrap();
    }
    let listing: Vec<LightRemoteInode> = (1..=5)
        .map(|k| LightRemoteInode::file(&format!("f{k}.bin"), 10 * k, 1))
        .collect();

    let workers: Vec<_> = (0..8)
        .map(|t| {
            let vfs = Arc::clone(&vfs);
            let dirs = dirs.clone();
            let listing = listing.clone();
            thread::spawn(move || {
                let slave = FakeRemergeSlave::new(&format!("S{}", t % 4));
                for i in 0..50 {
                    let dir = &dirs[(i + t) % dirs.len()];
                    vfs.directory(dir)
                        .remerge(&listing, &slave, 1, CollisionPolicy::Rename)
                        .unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    // every slave has now seen every directory at least once
    assert_eq!(root.size().unwrap(), 150 * dirs.len() as u64);
    for s in 0..4 {
        assert_eq!(root.ref_count(&format!("S{s}")).unwrap(), 5 * dirs.len() as u64);
    }
    for dir in &dirs {
        let f = vfs.file(&format!("{dir}/f3.bin"));
        assert_eq!(f.slaves().unwrap().len(), 4);
    }
    assert_aggregates(&root);
}
