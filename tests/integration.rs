/// Integration tests for a2nest

use a2nest::*;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

/// Create a disk image file holding an archive with a single record ONE.
fn build_two_level(dir: &TempDir, blocks: usize) -> PathBuf {
    let mut archive = ZipArchive::new();
    archive
        .add_record("ONE", vec![0x01; 1024])
        .expect("Failed to add record");

    let mut image = DiskImage::create("VOL", blocks).expect("Failed to create image");
    image
        .volume_mut()
        .expect("Volume should be mounted")
        .write_file("ARCHIVE.ZIP", &archive.to_bytes())
        .expect("Failed to write archive");

    let path = dir.path().join("disk.po");
    fs::write(&path, image.to_bytes()).expect("Failed to write host file");
    path
}

/// Create an archive holding a partitioned image whose first partition
/// holds a volume containing another archive. Five levels when opened
/// down to the inner archive.
fn build_four_level(dir: &TempDir) -> PathBuf {
    let mut inner = ZipArchive::new();
    inner
        .add_record("ONE", vec![0x01; 1024])
        .expect("Failed to add record");

    let mut image = DiskImage::create("SUB", 64).expect("Failed to create image");
    image
        .volume_mut()
        .expect("Volume should be mounted")
        .write_file("INNER.ZIP", &inner.to_bytes())
        .expect("Failed to write archive");

    let mut map =
        PartitionMap::create(&[("FIRST", 64), ("SECOND", 8)]).expect("Failed to create map");
    map.replace(1, &image.to_bytes())
        .expect("Failed to fill partition");

    let mut outer = ZipArchive::new();
    outer
        .add_record("MULTI.IMG", map.to_bytes())
        .expect("Failed to add image record");

    let path = dir.path().join("outer.zip");
    fs::write(&path, outer.to_bytes()).expect("Failed to write host file");
    path
}

#[test]
fn test_open_without_changes_leaves_host_identical() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let host = build_two_level(&dir, 280);
    let before = fs::read(&host).expect("Failed to read host");

    let mut chain = NodeChain::open_path(
        &format!("{}:ARCHIVE.ZIP", host.display()),
        OpenMode::ReadWrite,
    )
    .expect("Failed to open chain");

    assert_eq!(chain.depth(), 2);
    assert!(!chain.is_dirty());

    // A save with nothing dirty is a no-op
    chain.save_updates().expect("Save should succeed");
    drop(chain);

    let after = fs::read(&host).expect("Failed to read host");
    assert_eq!(before, after);
}

#[test]
fn test_two_level_add_save_reopen() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let host = build_two_level(&dir, 1600);
    let ext_path = format!("{}:ARCHIVE.ZIP", host.display());

    // First session: add TWO
    let mut chain =
        NodeChain::open_path(&ext_path, OpenMode::ReadWrite).expect("Failed to open chain");
    match chain.leaf_mut() {
        Container::Archive(archive) => {
            archive
                .add_record("TWO", vec![0x02; 2048])
                .expect("Failed to add record");
        }
        other => panic!("Expected archive leaf, got {}", other.kind()),
    }
    chain.save_updates().expect("Save should succeed");
    drop(chain);

    // Second session: add THREE
    let mut chain =
        NodeChain::open_path(&ext_path, OpenMode::ReadWrite).expect("Failed to open chain");
    match chain.leaf_mut() {
        Container::Archive(archive) => {
            archive
                .add_record("THREE", vec![0x03; 3072])
                .expect("Failed to add record");
        }
        other => panic!("Expected archive leaf, got {}", other.kind()),
    }
    chain.save_updates().expect("Save should succeed");
    drop(chain);

    // Third session: everything persisted, in insertion order
    let chain =
        NodeChain::open_path(&ext_path, OpenMode::ReadWrite).expect("Failed to open chain");
    match chain.leaf().container() {
        Container::Archive(archive) => {
            let records = archive.records();
            assert_eq!(records.len(), 3);
            assert_eq!(records[0].name, "ONE");
            assert_eq!(records[0].data.len(), 1024);
            assert_eq!(records[1].name, "TWO");
            assert_eq!(records[1].data, vec![0x02; 2048]);
            assert_eq!(records[2].name, "THREE");
            assert_eq!(records[2].data, vec![0x03; 3072]);
        }
        other => panic!("Expected archive leaf, got {}", other.kind()),
    }
    chain.check_health().expect("Chain should be healthy");
}

#[test]
fn test_save_clears_dirty_flags() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let host = build_two_level(&dir, 1600);
    let ext_path = format!("{}:ARCHIVE.ZIP", host.display());

    let mut chain =
        NodeChain::open_path(&ext_path, OpenMode::ReadWrite).expect("Failed to open chain");
    match chain.leaf_mut() {
        Container::Archive(archive) => {
            archive
                .add_record("TWO", vec![0x02; 512])
                .expect("Failed to add record");
        }
        other => panic!("Expected archive leaf, got {}", other.kind()),
    }
    assert!(chain.is_dirty());

    chain.save_updates().expect("Save should succeed");
    assert!(!chain.is_dirty());
    for level in 0..chain.depth() {
        assert!(!chain.node(level).unwrap().is_dirty());
    }

    // A second save performs no write at all
    let before = fs::read(&host).expect("Failed to read host");
    let stamp = fs::metadata(&host)
        .expect("Failed to stat host")
        .modified()
        .expect("Failed to read mtime");
    chain.save_updates().expect("Save should succeed");
    let after = fs::read(&host).expect("Failed to read host");
    assert_eq!(before, after);
    let stamp_after = fs::metadata(&host)
        .expect("Failed to stat host")
        .modified()
        .expect("Failed to read mtime");
    assert_eq!(stamp, stamp_after);
}

#[test]
fn test_overflow_rejected_and_host_untouched() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    // 16 blocks leaves 10 data blocks, enough for the initial archive only
    let host = build_two_level(&dir, 16);
    let before = fs::read(&host).expect("Failed to read host");
    let ext_path = format!("{}:ARCHIVE.ZIP", host.display());

    let mut chain =
        NodeChain::open_path(&ext_path, OpenMode::ReadWrite).expect("Failed to open chain");
    let free_before = match chain.node(0).unwrap().container() {
        Container::Image(image) => image.volume().unwrap().free_blocks(),
        _ => panic!("Expected image at level 0"),
    };

    match chain.leaf_mut() {
        Container::Archive(archive) => {
            archive
                .add_record("BIG", vec![0xAA; 8192])
                .expect("Failed to add record");
        }
        other => panic!("Expected archive leaf, got {}", other.kind()),
    }

    let err = chain.save_updates().expect_err("Save should be rejected");
    match err {
        NestError::PropagationFailed { level, ref cause, .. } => {
            assert_eq!(level, 0);
            assert!(matches!(**cause, NestError::OutOfSpace { .. }));
        }
        other => panic!("Expected PropagationFailed, got {}", other),
    }

    // The chain is still usable and internally consistent
    chain.check_health().expect("Chain should be healthy");
    let free_after = match chain.node(0).unwrap().container() {
        Container::Image(image) => image.volume().unwrap().free_blocks(),
        _ => panic!("Expected image at level 0"),
    };
    assert_eq!(free_before, free_after);
    drop(chain);

    // The host file never changed
    let after = fs::read(&host).expect("Failed to read host");
    assert_eq!(before, after);

    // Re-opening sees only the original record
    let chain =
        NodeChain::open_path(&ext_path, OpenMode::ReadOnly).expect("Failed to open chain");
    match chain.leaf().container() {
        Container::Archive(archive) => {
            assert_eq!(archive.records().len(), 1);
            assert_eq!(archive.records()[0].name, "ONE");
        }
        other => panic!("Expected archive leaf, got {}", other.kind()),
    }
}

#[test]
fn test_deep_nesting_save_propagates_to_host() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let host = build_four_level(&dir);
    let ext_path = format!("{}:MULTI.IMG:FIRST:INNER.ZIP", host.display());

    let mut chain =
        NodeChain::open_path(&ext_path, OpenMode::ReadWrite).expect("Failed to open chain");
    assert_eq!(chain.depth(), 5);
    assert_eq!(chain.node(0).unwrap().kind(), ContainerKind::Archive);
    assert_eq!(chain.node(1).unwrap().kind(), ContainerKind::MultiPartSet);
    assert_eq!(chain.node(2).unwrap().kind(), ContainerKind::Partition);
    assert_eq!(chain.node(3).unwrap().kind(), ContainerKind::DiskImage);
    assert_eq!(chain.node(4).unwrap().kind(), ContainerKind::Archive);
    chain.check_health().expect("Chain should be healthy");

    match chain.leaf_mut() {
        Container::Archive(archive) => {
            archive
                .add_record("TWO", vec![0x02; 2048])
                .expect("Failed to add record");
        }
        other => panic!("Expected archive leaf, got {}", other.kind()),
    }
    chain.save_updates().expect("Save should succeed");
    drop(chain);

    let chain =
        NodeChain::open_path(&ext_path, OpenMode::ReadOnly).expect("Failed to open chain");
    match chain.leaf().container() {
        Container::Archive(archive) => {
            assert_eq!(archive.records().len(), 2);
            assert_eq!(
                archive.record_data("TWO").expect("TWO should exist"),
                vec![0x02; 2048].as_slice()
            );
        }
        other => panic!("Expected archive leaf, got {}", other.kind()),
    }
    chain.check_health().expect("Chain should be healthy");
}

#[test]
fn test_read_only_chain_rejects_save() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let host = build_two_level(&dir, 280);
    let ext_path = format!("{}:ARCHIVE.ZIP", host.display());

    let mut chain =
        NodeChain::open_path(&ext_path, OpenMode::ReadOnly).expect("Failed to open chain");
    match chain.leaf_mut() {
        Container::Archive(archive) => {
            archive
                .add_record("TWO", vec![0x02; 512])
                .expect("Failed to add record");
        }
        other => panic!("Expected archive leaf, got {}", other.kind()),
    }
    assert!(chain.save_updates().is_err());
}

#[test]
fn test_volume_root_segment_addresses_volume() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let host = build_two_level(&dir, 280);

    // Trailing separator addresses the mounted volume itself
    let mut chain = NodeChain::open_path(&format!("{}:", host.display()), OpenMode::ReadWrite)
        .expect("Failed to open chain");
    assert_eq!(chain.depth(), 1);

    match chain.leaf_mut() {
        Container::Image(image) => {
            image
                .volume_mut()
                .expect("Volume should be mounted")
                .rename_volume("NEWVOL")
                .expect("Failed to rename volume");
        }
        other => panic!("Expected image leaf, got {}", other.kind()),
    }
    chain.save_updates().expect("Save should succeed");
    drop(chain);

    let chain = NodeChain::open_path(&format!("{}:", host.display()), OpenMode::ReadOnly)
        .expect("Failed to open chain");
    match chain.leaf().container() {
        Container::Image(image) => {
            assert_eq!(image.volume().unwrap().volume_name(), "NEWVOL");
        }
        other => panic!("Expected image leaf, got {}", other.kind()),
    }
}

#[test]
fn test_archive_in_archive_save_propagates() {
    let dir = TempDir::new().expect("Failed to create temp dir");

    let mut inner = ZipArchive::new();
    inner
        .add_record("ONE", vec![0x01; 1024])
        .expect("Failed to add record");
    let mut outer = ZipArchive::new();
    outer
        .add_record("INNER.ZIP", inner.to_bytes())
        .expect("Failed to add archive record");
    let host = dir.path().join("outer.zip");
    fs::write(&host, outer.to_bytes()).expect("Failed to write host file");
    let ext_path = format!("{}:INNER.ZIP", host.display());

    let mut chain =
        NodeChain::open_path(&ext_path, OpenMode::ReadWrite).expect("Failed to open chain");
    assert_eq!(chain.depth(), 2);
    assert_eq!(chain.node(0).unwrap().kind(), ContainerKind::Archive);
    assert_eq!(chain.node(1).unwrap().kind(), ContainerKind::Archive);

    match chain.leaf_mut() {
        Container::Archive(archive) => {
            archive
                .add_record("TWO", vec![0x02; 2048])
                .expect("Failed to add record");
        }
        other => panic!("Expected archive leaf, got {}", other.kind()),
    }
    chain.save_updates().expect("Save should succeed");
    drop(chain);

    // The outer archive's member grew; both levels round-trip
    let chain =
        NodeChain::open_path(&ext_path, OpenMode::ReadOnly).expect("Failed to open chain");
    match chain.leaf().container() {
        Container::Archive(archive) => {
            assert_eq!(archive.records().len(), 2);
            assert_eq!(
                archive.record_data("TWO").expect("TWO should exist"),
                vec![0x02; 2048].as_slice()
            );
        }
        other => panic!("Expected archive leaf, got {}", other.kind()),
    }
    chain.check_health().expect("Chain should be healthy");
}

#[test]
fn test_image_in_image_save_propagates() {
    let dir = TempDir::new().expect("Failed to create temp dir");

    let mut inner = DiskImage::create("SUB", 32).expect("Failed to create image");
    inner
        .volume_mut()
        .expect("Volume should be mounted")
        .write_file("F", &[5u8; 600])
        .expect("Failed to write file");
    let mut outer = DiskImage::create("OUTER", 280).expect("Failed to create image");
    outer
        .volume_mut()
        .expect("Volume should be mounted")
        .write_file("SUB.PO", &inner.to_bytes())
        .expect("Failed to write nested image");
    let host = dir.path().join("outer.po");
    fs::write(&host, outer.to_bytes()).expect("Failed to write host file");
    let ext_path = format!("{}:SUB.PO", host.display());

    let mut chain =
        NodeChain::open_path(&ext_path, OpenMode::ReadWrite).expect("Failed to open chain");
    assert_eq!(chain.depth(), 2);
    assert_eq!(chain.node(0).unwrap().kind(), ContainerKind::DiskImage);
    assert_eq!(chain.node(1).unwrap().kind(), ContainerKind::DiskImage);

    chain.analyze_leaf().expect("Inner volume should mount");
    match chain.leaf_mut() {
        Container::Image(image) => {
            image
                .volume_mut()
                .expect("Volume should be mounted")
                .write_file("G", &[7u8; 777])
                .expect("Failed to write file");
        }
        other => panic!("Expected image leaf, got {}", other.kind()),
    }
    chain.save_updates().expect("Save should succeed");
    drop(chain);

    // Trailing separator mounts the inner volume on reopen
    let chain = NodeChain::open_path(&format!("{}:", ext_path), OpenMode::ReadOnly)
        .expect("Failed to open chain");
    match chain.leaf().container() {
        Container::Image(image) => {
            let volume = image.volume().expect("Volume should be mounted");
            assert_eq!(volume.read_file("F").expect("F should exist"), vec![5u8; 600]);
            assert_eq!(volume.read_file("G").expect("G should exist"), vec![7u8; 777]);
        }
        other => panic!("Expected image leaf, got {}", other.kind()),
    }
    chain.check_health().expect("Chain should be healthy");
}

#[test]
fn test_walk_policy_limits_descent() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let host = build_four_level(&dir);

    // Unlimited descent reaches the innermost record
    let mut names = Vec::new();
    walk(&host, &policies::always, &mut |entry| {
        names.push(entry.name.clone());
    })
    .expect("Walk should succeed");
    assert!(names.contains(&"MULTI.IMG".to_string()));
    assert!(names.contains(&"INNER.ZIP".to_string()));
    assert!(names.contains(&"ONE".to_string()));

    // Wrapper-only descent stops at mounted volumes
    let mut names = Vec::new();
    walk(&host, &policies::wrappers_only, &mut |entry| {
        names.push(entry.name.clone());
    })
    .expect("Walk should succeed");
    assert!(names.contains(&"INNER.ZIP".to_string()));
    assert!(!names.contains(&"ONE".to_string()));
}
