//! File-system behavior: growth, sparsity, directories, removal
//! semantics, free-map accounting, persistence and cache effectiveness.

use kore::dev::MemDisk;
use kore::fs::{traits::FileSystem, File};
use kore::thread::ThreadBuilder;
use kore::Kernel;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tinyfs::inode::MAX_FILE_SIZE;
use tinyfs::TinyFs;

const SEED: u64 = 0x7465_7374;

fn random_bytes(len: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(SEED);
    (0..len).map(|_| rng.gen()).collect()
}

fn with_fs<R>(disk: Arc<MemDisk>, f: impl FnOnce(&TinyFs) -> R) -> R {
    let kernel = Kernel::builder().build();
    kernel.run(|| {
        let fs = TinyFs::mount(disk).unwrap();
        let r = f(&fs);
        kore::fs::register(fs);
        r
    })
}

fn fresh_disk() -> Arc<MemDisk> {
    let disk = Arc::new(MemDisk::new(4096));
    TinyFs::format(&*disk);
    disk
}

fn open_file(fs: &TinyFs, path: &str) -> kore::fs::RegularFile {
    fs.open(None, path)
        .unwrap()
        .into_regular()
        .expect("expected a regular file")
}

#[test]
fn create_then_read_zeros() {
    with_fs(fresh_disk(), |fs| {
        fs.create(None, "empty", 1000, false).unwrap();
        let f = open_file(fs, "empty");
        assert_eq!(f.length(), 1000);
        assert_eq!(f.tell(), 0);
        let mut buf = vec![0xFFu8; 1200];
        let n = f.read(&mut buf).unwrap();
        assert_eq!(n, 1000);
        assert!(buf[..1000].iter().all(|&b| b == 0));
    });
}

#[test]
fn sequential_growth_in_small_increments() {
    let disk = fresh_disk();
    let data = random_bytes(2134);
    with_fs(disk, |fs| {
        fs.create(None, "testfile", 0, false).unwrap();
        let f = open_file(fs, "testfile");
        let mut written = 0;
        while written < data.len() {
            let n = f.write(&data[written..data.len().min(written + 37)]).unwrap();
            assert!(n > 0);
            written += n;
            assert_eq!(f.length() as usize, written);
        }
        let f = open_file(fs, "testfile");
        let mut back = vec![0u8; data.len()];
        assert_eq!(f.read(&mut back).unwrap(), data.len());
        assert_eq!(back, data);
    });
}

#[test]
fn sparse_file_reads_zero_filled() {
    with_fs(fresh_disk(), |fs| {
        fs.create(None, "testfile", 0, false).unwrap();
        let f = open_file(fs, "testfile");
        f.seek(76542);
        assert_eq!(f.write(&[0u8]).unwrap(), 1);
        assert_eq!(f.length(), 76543);
        let f = open_file(fs, "testfile");
        let mut buf = vec![0xAA; 76543];
        assert_eq!(f.read(&mut buf).unwrap(), 76543);
        assert!(buf.iter().all(|&b| b == 0));
    });
}

#[test]
fn growth_stops_at_max_file_size() {
    with_fs(fresh_disk(), |fs| {
        fs.create(None, "big", 0, false).unwrap();
        let f = open_file(fs, "big");
        let n = f.write_at(&[7u8; 100], (MAX_FILE_SIZE - 10) as u32).unwrap();
        assert_eq!(n, 10);
        assert_eq!(f.length() as usize, MAX_FILE_SIZE);
        let mut buf = [0u8; 100];
        assert_eq!(f.read_at(&mut buf, (MAX_FILE_SIZE - 10) as u32).unwrap(), 10);
        assert!(buf[..10].iter().all(|&b| b == 7));
    });
}

#[test]
fn doubly_indirect_region_round_trips() {
    let data = random_bytes(4096);
    with_fs(fresh_disk(), |fs| {
        fs.create(None, "deep", 0, false).unwrap();
        let f = open_file(fs, "deep");
        // Straddle the direct/indirect boundary at 124 sectors.
        let offset = (124 * 512 - 100) as u32;
        assert_eq!(f.write_at(&data, offset).unwrap(), data.len());
        let mut back = vec![0u8; data.len()];
        assert_eq!(f.read_at(&mut back, offset).unwrap(), data.len());
        assert_eq!(back, data);
    });
}

#[test]
fn nested_directories_create_and_remove() {
    with_fs(fresh_disk(), |fs| {
        let mut path = String::new();
        for i in 0..10 {
            path.push_str(&format!("/{i}"));
            fs.create(None, &path, 0, true).unwrap();
        }
        let file_path = format!("{path}/test");
        fs.create(None, &file_path, 512, false).unwrap();
        assert!(matches!(
            fs.open(None, "/0/1/2/3/4/5/6/7/8/9/test"),
            Ok(File::Regular(_))
        ));
        // Non-empty prefixes cannot be removed yet.
        assert!(fs.remove(None, "/0").is_err());
        fs.remove(None, &file_path).unwrap();
        for i in (0..10).rev() {
            fs.remove(None, &path).unwrap();
            path.truncate(path.len() - format!("/{i}").len());
        }
        assert!(fs.open(None, "/0/1/2/3/4/5/6/7/8/9/test").is_err());
    });
}

#[test]
fn removed_file_stays_usable_until_close() {
    with_fs(fresh_disk(), |fs| {
        let baseline = fs.used_sectors();
        fs.create(None, "victim", 0, false).unwrap();
        let f = open_file(fs, "victim");
        assert_eq!(f.write(b"still here").unwrap(), 10);
        fs.remove(None, "victim").unwrap();
        assert!(fs.open(None, "victim").is_err());
        // The open handle keeps working.
        let mut buf = [0u8; 10];
        assert_eq!(f.read_at(&mut buf, 0).unwrap(), 10);
        assert_eq!(&buf, b"still here");
        assert_eq!(f.write_at(b"MORE", 10).unwrap(), 4);
        drop(f);
        // Closing the last handle returned every sector to the free map.
        assert_eq!(fs.used_sectors(), baseline);
    });
}

#[test]
fn free_map_accounts_for_index_sectors() {
    with_fs(fresh_disk(), |fs| {
        let baseline = fs.used_sectors();
        fs.create(None, "spread", 0, false).unwrap();
        let f = open_file(fs, "spread");
        // Past the direct region: data plus pointer sectors get allocated.
        let data = random_bytes(512);
        f.write_at(&data, (200 * 512) as u32).unwrap();
        assert!(fs.used_sectors() > baseline + 1);
        drop(f);
        fs.remove(None, "spread").unwrap();
        assert_eq!(fs.used_sectors(), baseline);
    });
}

#[test]
fn duplicate_and_invalid_names_rejected() {
    with_fs(fresh_disk(), |fs| {
        fs.create(None, "dup", 0, false).unwrap();
        assert!(fs.create(None, "dup", 0, false).is_err());
        assert!(fs.create(None, "", 0, false).is_err());
        assert!(fs.create(None, "waytoolonganame", 0, false).is_err());
        assert!(fs.open(None, "").is_err());
    });
}

#[test]
fn directory_removal_rules() {
    with_fs(fresh_disk(), |fs| {
        assert!(fs.remove(None, "/").is_err());
        fs.create(None, "/d", 0, true).unwrap();
        fs.create(None, "/d/x", 0, false).unwrap();
        assert!(fs.remove(None, "/d").is_err());
        fs.remove(None, "/d/x").unwrap();
        // A removed directory rejects new entries even while it is open.
        let handle = fs.open(None, "/d").unwrap().into_directory().unwrap();
        fs.remove(None, "/d").unwrap();
        assert!(fs.create(Some(&handle), "y", 0, false).is_err());
        assert!(fs.open(None, "/d").is_err());
    });
}

#[test]
fn readdir_skips_dot_entries() {
    with_fs(fresh_disk(), |fs| {
        for name in ["a", "b", "c"] {
            fs.create(None, name, 0, false).unwrap();
        }
        fs.create(None, "sub", 0, true).unwrap();
        let root = fs.root().unwrap();
        let mut names = Vec::new();
        while let Some(n) = root.readdir().unwrap() {
            names.push(n);
        }
        assert_eq!(names, vec!["a", "b", "c", "sub"]);
    });
}

#[test]
fn open_twice_positions_are_independent() {
    with_fs(fresh_disk(), |fs| {
        fs.create(None, "shared", 0, false).unwrap();
        let a = open_file(fs, "shared");
        a.write(b"0123456789").unwrap();
        let b = open_file(fs, "shared");
        let mut buf = [0u8; 4];
        b.read(&mut buf).unwrap();
        assert_eq!(&buf, b"0123");
        assert_eq!(a.tell(), 10);
        assert_eq!(b.tell(), 4);
        // Reopen through an existing handle also starts at zero.
        let c = a.reopen().unwrap();
        assert_eq!(c.tell(), 0);
    });
}

#[test]
fn deny_write_blocks_handle_writes() {
    with_fs(fresh_disk(), |fs| {
        fs.create(None, "exe", 0, false).unwrap();
        let f = open_file(fs, "exe");
        f.write(b"text").unwrap();
        let other = open_file(fs, "exe");
        f.deny_write();
        assert_eq!(other.write(b"scribble").unwrap(), 0);
        f.allow_write();
        assert_eq!(other.write(b"scribble").unwrap(), 8);
    });
}

#[test]
fn concurrent_readers_see_consistent_bytes() {
    let data = Arc::new(random_bytes(1024));
    with_fs(fresh_disk(), |fs| {
        fs.create(None, "shared", 0, false).unwrap();
        let f = open_file(fs, "shared");
        assert_eq!(f.write(&data).unwrap(), data.len());
        let mut handles = Vec::new();
        for i in 0..4 {
            let data = data.clone();
            let file = open_file(fs, "shared");
            handles.push(ThreadBuilder::new(&format!("reader{i}")).spawn(move || {
                let mut buf = vec![0u8; 1024];
                assert_eq!(file.read(&mut buf).unwrap(), 1024);
                assert_eq!(buf, *data);
            }));
        }
        for h in handles {
            assert_eq!(h.join(), 0);
        }
    });
}

#[test]
fn contents_survive_remount() {
    let disk = fresh_disk();
    let data = random_bytes(50000);
    {
        let d = data.clone();
        with_fs(disk.clone(), move |fs| {
            fs.create(None, "persist", 0, false).unwrap();
            let f = open_file(fs, "persist");
            assert_eq!(f.write(&d).unwrap(), d.len());
        });
    }
    with_fs(disk, move |fs| {
        let f = open_file(fs, "persist");
        assert_eq!(f.length() as usize, data.len());
        let mut back = vec![0u8; data.len()];
        assert_eq!(f.read(&mut back).unwrap(), data.len());
        assert_eq!(back, data);
    });
}

#[test]
fn repeated_reads_hit_the_cache() {
    with_fs(fresh_disk(), |fs| {
        fs.create(None, "hot", 0, false).unwrap();
        let f = open_file(fs, "hot");
        f.write(&random_bytes(512)).unwrap();
        let mut buf = [0u8; 512];
        f.read_at(&mut buf, 0).unwrap();
        let (_, hits_before) = fs.cache_stats();
        for _ in 0..10 {
            f.read_at(&mut buf, 0).unwrap();
        }
        let (_, hits_after) = fs.cache_stats();
        assert!(hits_after >= hits_before + 10);
    });
}
