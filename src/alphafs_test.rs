#[cfg(test)]
mod tests {
    use alloc::{boxed::Box, format, string::String, vec, vec::Vec};

    use crate::{
        block_dev::{BlockDevice, RamDisk},
        common::{AlphaError, EntryKind, FixedClock, Permission},
        config::{AlphaConfig, DEFAULT_VOLUME_SIZE},
        free_space::FreeRun,
        fs::{AlphaFs, MountKind},
        layout::ID_LENGTH,
    };

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn new_fs(blocks: u64, block_size: u32) -> AlphaFs<RamDisk> {
        init();
        AlphaFs::format_with_clock(
            RamDisk::new(blocks, block_size),
            "test",
            Box::new(FixedClock(42)),
        )
        .expect("format failed")
    }

    fn assert_clean(fs: &AlphaFs<RamDisk>) {
        let report = fs.check_consistency().expect("check failed");
        assert!(report.is_clean(), "problems: {:?}", report.problems);
    }

    #[test]
    fn test_format_layout() {
        let fs = new_fs(64, 512);
        assert_eq!(fs.mount_kind(), MountKind::Formatted);
        assert_eq!(fs.root(), 1);
        assert_eq!(
            fs.free_runs().unwrap(),
            vec![FreeRun {
                start: 3,
                count: 61
            }]
        );

        let root = fs.stat(fs.root()).unwrap();
        assert_eq!(root.name, "root");
        assert_eq!(root.kind, EntryKind::Directory);
        assert_eq!(root.permission, Permission::Write);
        assert_eq!(root.created, 42);
        assert_eq!(root.id.len(), ID_LENGTH - 1);
        assert!(root.id.bytes().all(|b| b.is_ascii_digit()));
        assert_eq!(fs.resolve("/root").unwrap(), fs.root());
        assert_eq!(fs.resolve("root").unwrap(), fs.root());
        assert_clean(&fs);
    }

    #[test]
    fn test_create_write_delete_scenario() {
        let mut fs = new_fs(64, 512);
        let dir = fs.make_directory("/root/dir1").unwrap();
        let file = fs.make_file("/root/dir1/file1").unwrap();
        assert_eq!(fs.resolve("/root/dir1").unwrap(), dir);
        assert_eq!(fs.resolve("/root/dir1/file1").unwrap(), file);

        fs.write_data(file, b"hello").unwrap();
        assert_eq!(fs.read_data(file).unwrap(), b"hello");
        assert_eq!(fs.free_blocks().unwrap(), 56);
        assert_clean(&fs);

        fs.delete_path("/root/dir1").unwrap();
        assert_eq!(fs.free_blocks().unwrap(), 61);
        assert!(matches!(
            fs.resolve("/root/dir1"),
            Err(AlphaError::InvalidPath(_))
        ));
        assert_eq!(fs.lookup("/root/dir1/file1").unwrap(), None);
        assert!(fs.list_children(fs.root()).unwrap().is_empty());
        // released in delete order, no merging
        assert_eq!(fs.free_runs().unwrap().len(), 4);
        assert_clean(&fs);

        assert_eq!(fs.coalesce_free_space().unwrap(), 1);
        assert_eq!(
            fs.free_runs().unwrap(),
            vec![FreeRun {
                start: 3,
                count: 61
            }]
        );
    }

    #[test]
    fn test_error_scenarios() {
        let mut fs = new_fs(64, 512);
        assert!(matches!(
            fs.make_file("/root/missing/file"),
            Err(AlphaError::InvalidPath(_))
        ));
        let file = fs.make_file("/root/file").unwrap();
        assert!(matches!(
            fs.make_file("/root/file"),
            Err(AlphaError::AlreadyExists(_))
        ));
        assert!(matches!(
            fs.make_directory("/root/file/inner"),
            Err(AlphaError::NotADirectory(loc)) if loc == file
        ));

        fs.set_permission(file, Permission::Read).unwrap();
        assert_eq!(fs.write_data(file, b"nope"), Err(AlphaError::ReadOnly(file)));
        assert!(matches!(
            fs.write_data(fs.root(), b"nope"),
            Err(AlphaError::NotAFile(_))
        ));
        assert!(matches!(fs.make_file("home/x"), Err(AlphaError::InvalidPath(_))));
        assert_clean(&fs);
    }

    #[test]
    fn test_directory_full() {
        let mut fs = new_fs(256, 512);
        for i in 0..64 {
            fs.make_file(&format!("/root/f{}", i)).unwrap();
        }
        let free = fs.free_blocks().unwrap();
        assert_eq!(
            fs.make_file("/root/one_too_many"),
            Err(AlphaError::DirectoryFull(fs.root()))
        );
        assert_eq!(fs.free_blocks().unwrap(), free);
        assert_eq!(fs.list_children(fs.root()).unwrap().len(), 64);
        assert_clean(&fs);
    }

    #[test]
    fn test_children_stay_packed() {
        let mut fs = new_fs(128, 512);
        for name in ["a", "b", "c", "d"] {
            fs.make_file(&format!("/root/{}", name)).unwrap();
        }
        fs.delete_path("/root/b").unwrap();
        fs.delete_path("/root/d").unwrap();
        assert_eq!(fs.list_children(fs.root()).unwrap(), vec!["a", "c"]);
        fs.make_file("/root/e").unwrap();
        assert_eq!(fs.list_children(fs.root()).unwrap(), vec!["a", "c", "e"]);
        assert_eq!(fs.stat(fs.root()).unwrap().children, 3);
        assert_clean(&fs);
    }

    #[test]
    fn test_write_replaces_payload() {
        let mut fs = new_fs(64, 512);
        let file = fs.make_file("/root/file").unwrap();
        let big: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();

        fs.write_data(file, &big).unwrap();
        assert_eq!(fs.read_data(file).unwrap(), big);
        assert_eq!(fs.stat(file).unwrap().size, 1000);
        assert_clean(&fs);

        fs.write_data(file, b"short").unwrap();
        assert_eq!(fs.read_data(file).unwrap(), b"short");
        assert_eq!(fs.free_blocks().unwrap(), 61 - 2 - 1);
        assert_clean(&fs);

        fs.write_data(file, b"").unwrap();
        let meta = fs.stat(file).unwrap();
        assert_eq!((meta.size, meta.starting_block), (0, 0));
        assert!(fs.read_data(file).unwrap().is_empty());
        assert_eq!(fs.free_blocks().unwrap(), 61 - 2);
        assert_clean(&fs);
    }

    #[test]
    fn test_out_of_space_keeps_old_content() {
        let mut fs = new_fs(64, 512);
        let file = fs.make_file("/root/file").unwrap();
        fs.write_data(file, b"x").unwrap();
        let too_big = vec![7u8; 60 * 512];
        assert_eq!(fs.write_data(file, &too_big), Err(AlphaError::OutOfSpace(60)));
        assert_eq!(fs.read_data(file).unwrap(), b"x");
        assert_clean(&fs);
    }

    #[test]
    fn test_copy_tree() {
        let mut fs = new_fs(256, 512);
        fs.make_directory("/root/src").unwrap();
        fs.write_path("/root/src/f1", b"one").unwrap();
        fs.make_directory("/root/src/sub").unwrap();
        fs.write_path("/root/src/sub/f2", b"two").unwrap();
        let f3 = fs.write_path("/root/src/f3", b"three").unwrap();
        fs.set_permission(f3, Permission::Read).unwrap();

        let dst = fs.copy_path("/root/src", "root/dst").unwrap();
        assert_eq!(fs.resolve("/root/dst").unwrap(), dst);
        assert_eq!(fs.list_children(dst).unwrap(), vec!["f1", "sub", "f3"]);
        assert_eq!(fs.read_path("/root/dst/sub/f2").unwrap(), b"two");
        let copied_f3 = fs.resolve("/root/dst/f3").unwrap();
        assert_eq!(fs.stat(copied_f3).unwrap().permission, Permission::Read);

        fs.write_path("/root/dst/f1", b"changed").unwrap();
        assert_eq!(fs.read_path("/root/src/f1").unwrap(), b"one");
        fs.write_path("/root/src/sub/f2", b"also changed").unwrap();
        assert_eq!(fs.read_path("/root/dst/sub/f2").unwrap(), b"two");
        assert_clean(&fs);
    }

    #[test]
    fn test_copy_errors() {
        let mut fs = new_fs(128, 512);
        fs.make_directory("/root/src").unwrap();
        fs.make_file("/root/other").unwrap();
        assert!(matches!(
            fs.copy_path("/root/src", "/root/src"),
            Err(AlphaError::SamePath(_))
        ));
        assert!(matches!(
            fs.copy_path("/root/src", "/root/./src"),
            Err(AlphaError::SamePath(_))
        ));
        assert!(matches!(
            fs.copy_path("/root/src", "/root/src/inner"),
            Err(AlphaError::IntoSelf(_))
        ));
        assert!(matches!(
            fs.copy_path("/root/src", "/root/other"),
            Err(AlphaError::AlreadyExists(_))
        ));
        assert!(matches!(
            fs.copy_path("/root/nothing", "/root/copy"),
            Err(AlphaError::InvalidPath(_))
        ));
        assert_clean(&fs);
    }

    #[test]
    fn test_failed_copy_is_rolled_back() {
        let mut fs = new_fs(64, 512);
        fs.write_path("/root/big", &vec![1u8; 30 * 512]).unwrap();
        let free = fs.free_blocks().unwrap();
        assert_eq!(free, 29);

        assert_eq!(
            fs.copy_path("/root/big", "/root/copy"),
            Err(AlphaError::OutOfSpace(30))
        );
        assert_eq!(fs.lookup("/root/copy").unwrap(), None);
        assert_eq!(fs.free_blocks().unwrap(), free);
        assert_eq!(fs.list_children(fs.root()).unwrap(), vec!["big"]);
        assert_clean(&fs);
    }

    #[test]
    fn test_move() {
        let mut fs = new_fs(128, 512);
        fs.make_directory("/root/a").unwrap();
        fs.make_directory("/root/b").unwrap();
        fs.write_path("/root/a/f", b"moving").unwrap();

        let moved = fs.move_path("/root/a/f", "/root/b/g").unwrap();
        assert_eq!(fs.resolve("/root/b/g").unwrap(), moved);
        assert_eq!(fs.read_data(moved).unwrap(), b"moving");
        assert_eq!(fs.lookup("/root/a/f").unwrap(), None);
        assert!(fs.list_children(fs.resolve("/root/a").unwrap()).unwrap().is_empty());
        assert_clean(&fs);

        assert_eq!(fs.move_path("/root", "/root/b/r"), Err(AlphaError::RootEntry));
        assert!(matches!(
            fs.move_path("/root/b", "/root/b/inner"),
            Err(AlphaError::IntoSelf(_))
        ));
    }

    #[test]
    fn test_read_only_source_is_not_moved() {
        let mut fs = new_fs(128, 512);
        let file = fs.write_path("/root/locked", b"stay").unwrap();
        fs.set_permission(file, Permission::Read).unwrap();
        assert_eq!(
            fs.move_path("/root/locked", "/root/elsewhere"),
            Err(AlphaError::ReadOnly(file))
        );
        assert_eq!(fs.lookup("/root/elsewhere").unwrap(), None);
        assert_eq!(fs.read_path("/root/locked").unwrap(), b"stay");
    }

    #[test]
    fn test_delete_read_only_leaves_volume_untouched() {
        let mut fs = new_fs(128, 512);
        fs.make_directory("/root/dir").unwrap();
        fs.write_path("/root/dir/a", b"a").unwrap();
        let locked = fs.make_file("/root/dir/b").unwrap();
        fs.set_permission(locked, Permission::Read).unwrap();
        let free = fs.free_blocks().unwrap();

        assert_eq!(fs.delete_path("/root/dir"), Err(AlphaError::ReadOnly(locked)));
        assert_eq!(fs.free_blocks().unwrap(), free);
        assert_eq!(fs.read_path("/root/dir/a").unwrap(), b"a");
        assert_clean(&fs);

        fs.set_permission(locked, Permission::Execute).unwrap();
        fs.delete_path("/root/dir").unwrap();
        assert_clean(&fs);
    }

    #[test]
    fn test_root_cannot_be_deleted() {
        let mut fs = new_fs(64, 512);
        let root = fs.root();
        assert_eq!(fs.delete_path("/root"), Err(AlphaError::RootEntry));
        assert_eq!(fs.recursive_delete(root), Err(AlphaError::RootEntry));
        assert_eq!(fs.delete_path("/root/.."), Err(AlphaError::RootEntry));
    }

    #[test]
    fn test_corrupt_entry_is_reported() {
        let mut fs = new_fs(64, 512);
        fs.make_directory("/root/d").unwrap();
        let file = fs.make_file("/root/d/f").unwrap();
        fs.device().write_blocks(file, &[0u8; 1024]).unwrap();
        let free = fs.free_blocks().unwrap();

        assert_eq!(
            fs.delete_path("/root/d"),
            Err(AlphaError::Corrupt(file, "tree entry"))
        );
        assert_eq!(fs.free_blocks().unwrap(), free);
        assert!(matches!(fs.lookup("/root/d/f"), Err(AlphaError::Corrupt(..))));
        assert!(!fs.check_consistency().unwrap().is_clean());
    }

    #[test]
    fn test_bad_payload_range_stops_delete() {
        let mut fs = new_fs(64, 512);
        fs.make_directory("/root/d").unwrap();
        fs.write_path("/root/d/f1", b"first").unwrap();
        let f2 = fs.write_path("/root/d/f2", b"second").unwrap();
        let mut entry = fs.read_entry(f2).unwrap();
        entry.starting_block = 1000;
        fs.write_entry(f2, &entry).unwrap();
        let free = fs.free_blocks().unwrap();

        assert_eq!(
            fs.delete_path("/root/d"),
            Err(AlphaError::Corrupt(f2, "payload range"))
        );
        assert_eq!(fs.free_blocks().unwrap(), free);
        assert!(fs.lookup("/root/d").unwrap().is_some());
        assert_eq!(fs.read_path("/root/d/f1").unwrap(), b"first");
    }

    #[test]
    fn test_write_over_bad_payload_range_allocates_nothing() {
        let mut fs = new_fs(64, 512);
        let file = fs.write_path("/root/f", b"old").unwrap();
        let mut entry = fs.read_entry(file).unwrap();
        entry.starting_block = 1;
        fs.write_entry(file, &entry).unwrap();
        let free = fs.free_blocks().unwrap();

        assert_eq!(
            fs.write_data(file, b"new content"),
            Err(AlphaError::Corrupt(file, "payload range"))
        );
        assert_eq!(fs.free_blocks().unwrap(), free);
        assert_eq!(fs.read_entry(file).unwrap().starting_block, 1);
    }

    #[test]
    fn test_partial_copy_with_read_only_entries_is_discarded() {
        let mut fs = new_fs(128, 512);
        let free = fs.free_blocks().unwrap();
        fs.make_directory("/root/part").unwrap();
        let inner = fs.make_directory("/root/part/inner").unwrap();
        let file = fs.write_path("/root/part/inner/f", b"data").unwrap();
        fs.set_permission(file, Permission::Read).unwrap();
        fs.set_permission(inner, Permission::Execute).unwrap();

        fs.discard_partial_copy("/root/part").unwrap();
        assert_eq!(fs.lookup("/root/part").unwrap(), None);
        assert!(fs.list_children(fs.root()).unwrap().is_empty());
        assert_eq!(fs.free_blocks().unwrap(), free);
        assert_clean(&fs);

        fs.discard_partial_copy("/root/part").unwrap();
    }

    #[test]
    fn test_image_with_zero_block_size() {
        assert!(matches!(
            RamDisk::from_image(vec![0u8; 1024], 0),
            Err(AlphaError::Geometry(_))
        ));
        assert_eq!(RamDisk::new(4, 0).block_count(), 0);
    }

    #[test]
    fn test_links() {
        let mut fs = new_fs(128, 512);
        fs.make_directory("/root/dir").unwrap();
        let file = fs.write_path("/root/file", b"data").unwrap();

        let dir_link = fs.create_link("/root/dl", "/root/dir").unwrap();
        let file_link = fs.create_link("/root/fl", "root/file").unwrap();
        assert_eq!(fs.stat(dir_link).unwrap().kind, EntryKind::DirectoryLink);
        assert_eq!(fs.stat(file_link).unwrap().kind, EntryKind::FileLink);
        assert_eq!(fs.read_link(dir_link).unwrap(), "/root/dir");
        assert_eq!(fs.read_link(file_link).unwrap(), "/root/file");

        // links are not followed
        assert_eq!(fs.lookup("/root/dl/anything").unwrap(), None);
        assert_eq!(fs.read_link(file), Err(AlphaError::NotAFile(file)));
        assert!(matches!(
            fs.create_link("/root/dangling", "/root/none"),
            Err(AlphaError::InvalidPath(_))
        ));

        fs.delete_path("/root/fl").unwrap();
        assert_eq!(fs.read_path("/root/file").unwrap(), b"data");
        assert_clean(&fs);
    }

    #[test]
    fn test_metadata_setters() {
        let mut fs = new_fs(64, 512);
        let a = fs.make_file("/root/a_rather_long_name").unwrap();
        let b = fs.make_file("/root/b").unwrap();

        let meta = fs.stat(a).unwrap();
        assert_eq!((meta.created, meta.modified), (42, 42));
        assert_eq!(meta.permission, Permission::Write);
        assert_ne!(meta.id, fs.stat(b).unwrap().id);

        fs.set_name(a, "s").unwrap();
        assert_eq!(fs.read_entry(a).unwrap().name, "s");
        assert_eq!(fs.resolve("/root/s").unwrap(), a);
        assert_eq!(fs.lookup("/root/a_rather_long_name").unwrap(), None);

        assert!(matches!(fs.set_name(a, "x/y"), Err(AlphaError::InvalidName(_))));
        assert!(matches!(fs.set_name(a, ""), Err(AlphaError::InvalidName(_))));
        let too_long: String = core::iter::repeat('n').take(256).collect();
        assert!(matches!(fs.set_name(a, &too_long), Err(AlphaError::InvalidName(_))));

        fs.set_kind(b, "drlnk".parse().unwrap()).unwrap();
        assert_eq!(fs.stat(b).unwrap().kind, EntryKind::DirectoryLink);
        fs.set_permission(b, "execute".parse().unwrap()).unwrap();
        assert_eq!(fs.stat(b).unwrap().permission, Permission::Execute);
    }

    #[test]
    fn test_reopen_existing_volume() {
        let mut fs = new_fs(64, 512);
        fs.make_directory("/root/keep").unwrap();
        fs.write_path("/root/keep/file", b"persist").unwrap();
        let runs = fs.free_runs().unwrap();
        let device = fs.close().unwrap();

        let fs = AlphaFs::open_with_clock(device, "other", Box::new(FixedClock(1))).unwrap();
        assert_eq!(fs.mount_kind(), MountKind::Existing);
        assert_eq!(fs.volume_name(), "test");
        assert_eq!(fs.read_path("/root/keep/file").unwrap(), b"persist");
        assert_eq!(fs.free_runs().unwrap(), runs);
    }

    #[test]
    fn test_open_formats_blank_or_damaged_device() {
        init();
        let fs = AlphaFs::open_with_clock(RamDisk::new(64, 512), "fresh", Box::new(FixedClock(0)))
            .unwrap();
        assert_eq!(fs.mount_kind(), MountKind::Formatted);
        assert_eq!(fs.volume_name(), "fresh");

        let device = fs.close().unwrap();
        device.write_blocks(0, &[0xffu8; 512]).unwrap();
        let fs = AlphaFs::open_with_clock(device, "again", Box::new(FixedClock(0))).unwrap();
        assert_eq!(fs.mount_kind(), MountKind::Formatted);
        assert_clean(&fs);
    }

    #[test]
    fn test_block_size_mismatch() {
        let fs = new_fs(64, 512);
        let image = fs.close().unwrap().snapshot();
        let result = AlphaFs::open_with_clock(
            RamDisk::from_image(image, 1024).unwrap(),
            "test",
            Box::new(FixedClock(0)),
        );
        assert!(matches!(result, Err(AlphaError::Geometry(_))));
    }

    #[test]
    fn test_volume_too_small() {
        init();
        let result = AlphaFs::format_with_clock(RamDisk::new(3, 512), "tiny", Box::new(FixedClock(0)));
        assert!(matches!(result, Err(AlphaError::Geometry(_))));
        let result = AlphaFs::format_with_clock(RamDisk::new(64, 32), "tiny", Box::new(FixedClock(0)));
        assert!(matches!(result, Err(AlphaError::Geometry(_))));
    }

    #[test]
    fn test_large_blocks() {
        let mut fs = new_fs(32, 4096);
        assert_eq!(fs.geometry().entry_blocks, 1);
        assert_eq!(fs.root(), 1);
        fs.write_path("/root/f", b"four kilobyte blocks").unwrap();
        assert_eq!(fs.read_path("/root/f").unwrap(), b"four kilobyte blocks");
        assert_clean(&fs);
    }

    #[test]
    fn test_leaked_blocks_are_reported() {
        let mut fs = new_fs(64, 512);
        fs.allocate(3).unwrap().expect("space left");
        let report = fs.check_consistency().unwrap();
        assert!(!report.is_clean());
        assert_eq!(report.free_blocks, 58);
    }

    #[test]
    fn test_statfs() {
        let mut fs = new_fs(64, 512);
        fs.write_path("/root/f", b"abc").unwrap();
        let stat = fs.statfs().unwrap();
        assert_eq!(stat.volume_name, "test");
        assert_eq!(stat.block_size, 512);
        assert_eq!(stat.total_blocks, 64);
        assert_eq!(stat.free_blocks, 58);
        assert_eq!(stat.used_blocks, 6);
        assert_eq!(stat.free_runs, 1);
        assert_eq!(stat.largest_free_run, 58);

        let json = serde_json::to_value(&stat).unwrap();
        assert_eq!(json["free_blocks"], 58);
    }

    #[test]
    fn test_config_json() {
        let config = AlphaConfig::from_json(br#"{"volume_name":"x","block_size":1024}"#).unwrap();
        assert_eq!(config.volume_name, "x");
        assert_eq!(config.block_size, 1024);
        assert_eq!(config.volume_size, DEFAULT_VOLUME_SIZE);

        let text = config.to_json().unwrap();
        assert_eq!(AlphaConfig::from_json(text.as_bytes()).unwrap(), config);

        assert!(matches!(
            AlphaConfig::from_json(br#"{"block_size":16}"#),
            Err(AlphaError::Config(_))
        ));
        assert!(matches!(
            AlphaConfig::from_json(b"not json"),
            Err(AlphaError::Config(_))
        ));
    }
}
