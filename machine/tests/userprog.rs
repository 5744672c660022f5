//! User processes end to end: argument passing, exit and wait plumbing,
//! system-call validation, console I/O, and file syscalls.

use kore::fs::traits::FileSystem;
use kore::mm::Va;
use kore::process::{self, UserCtx};
use machine::{usys, MachineBuilder};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn args_echo(ctx: &mut UserCtx) -> i32 {
    let args = ctx.args();
    assert_eq!(args[0], "args-echo");
    for (i, a) in args.iter().enumerate().skip(1) {
        assert_eq!(a, &format!("arg{i}"));
    }
    args.len() as i32
}

#[test]
fn argument_passing() {
    init_logging();
    MachineBuilder::new()
        .program("args-echo", args_echo)
        .run(|m| {
            m.install_trivial("args-echo");
            assert_eq!(m.exec_wait("args-echo arg1 arg2 arg3"), 4);
            assert_eq!(m.exec_wait("args-echo"), 1);
        });
}

fn exit_forty_two(_ctx: &mut UserCtx) -> i32 {
    42
}

fn exit_via_syscall(ctx: &mut UserCtx) -> i32 {
    usys::exit(ctx, 57)
}

#[test]
fn exit_status_reaches_parent() {
    MachineBuilder::new()
        .program("quiet", exit_forty_two)
        .program("loud", exit_via_syscall)
        .run(|m| {
            m.install_trivial("quiet");
            m.install_trivial("loud");
            assert_eq!(m.exec_wait("quiet"), 42);
            assert_eq!(m.exec_wait("loud"), 57);
        });
}

#[test]
fn wait_is_once_only_and_children_only() {
    MachineBuilder::new()
        .program("quiet", exit_forty_two)
        .run(|m| {
            m.install_trivial("quiet");
            let pid = process::exec("quiet").unwrap();
            assert_eq!(process::wait(pid), 42);
            assert_eq!(process::wait(pid), -1);
            assert_eq!(process::wait(123456), -1);
        });
}

#[test]
fn exec_failures_return_minus_one() {
    MachineBuilder::new()
        .program("quiet", exit_forty_two)
        .program("ghost", exit_forty_two)
        .program("broken", exit_forty_two)
        .run(|m| {
            // Program registered but no executable file.
            assert_eq!(m.exec_wait("ghost"), -1);
            // Executable file with a bad header.
            m.install("broken", b"this is not an executable image");
            assert_eq!(m.exec_wait("broken"), -1);
            // No such program at all.
            assert_eq!(m.exec_wait("missing"), -1);
            // The good one still works afterwards.
            m.install_trivial("quiet");
            assert_eq!(m.exec_wait("quiet"), 42);
        });
}

fn bad_buffer_write(ctx: &mut UserCtx) -> i32 {
    // A buffer in kernel space must kill us before any I/O happens.
    usys::write(ctx, 1, Va::new(0xC000_0000), 16);
    0
}

fn bad_fd(ctx: &mut UserCtx) -> i32 {
    usys::filesize(ctx, 77);
    0
}

fn bad_stack_pointer(ctx: &mut UserCtx) -> i32 {
    ctx.syscall_at(Va::new(4));
    0
}

fn read_into_kernel_space(ctx: &mut UserCtx) -> i32 {
    let fd = usys::open(ctx, "args-data");
    assert!(fd >= 2);
    usys::read(ctx, fd, Va::new(0xBFFF_0000 + 0x4000_0000), 4);
    0
}

#[test]
fn memory_violations_kill_with_minus_one() {
    MachineBuilder::new()
        .program("bad-write", bad_buffer_write)
        .program("bad-fd", bad_fd)
        .program("bad-sp", bad_stack_pointer)
        .program("bad-read", read_into_kernel_space)
        .run(|m| {
            for p in ["bad-write", "bad-fd", "bad-sp", "bad-read"] {
                m.install_trivial(p);
            }
            m.fs().create(None, "args-data", 16, false).unwrap();
            assert_eq!(m.exec_wait("bad-write"), -1);
            assert_eq!(m.exec_wait("bad-fd"), -1);
            assert_eq!(m.exec_wait("bad-sp"), -1);
            assert_eq!(m.exec_wait("bad-read"), -1);
        });
}

fn console_hello(ctx: &mut UserCtx) -> i32 {
    let buf = ctx.push_bytes(b"hello from user\n");
    assert_eq!(usys::write(ctx, 1, buf, 16), 16);
    0
}

fn console_echo3(ctx: &mut UserCtx) -> i32 {
    let buf = ctx.push_bytes(&[0u8; 4]);
    assert_eq!(usys::read(ctx, 0, buf, 3), 3);
    let mut back = [0u8; 3];
    ctx.read(buf, &mut back);
    assert_eq!(&back, b"key");
    0
}

#[test]
fn console_write_is_captured() {
    MachineBuilder::new()
        .program("hello", console_hello)
        .run(|m| {
            m.install_trivial("hello");
            assert_eq!(m.exec_wait("hello"), 0);
            let out = String::from_utf8(m.console()).unwrap();
            assert!(out.contains("hello from user\n"));
            // Process termination announces itself on the console.
            assert!(out.contains("hello: exit(0)"));
        });
}

#[test]
fn console_read_returns_keystrokes() {
    MachineBuilder::new()
        .program("echo3", console_echo3)
        .run(|m| {
            m.install_trivial("echo3");
            m.type_input(b"key");
            assert_eq!(m.exec_wait("echo3"), 0);
        });
}

fn file_round_trip(ctx: &mut UserCtx) -> i32 {
    assert!(usys::create(ctx, "out.txt", 0));
    let fd = usys::open(ctx, "out.txt");
    assert!(fd >= 2);
    let data = ctx.push_bytes(b"0123456789abcdef");
    assert_eq!(usys::write(ctx, fd, data, 16), 16);
    assert_eq!(usys::tell(ctx, fd), 16);
    assert_eq!(usys::filesize(ctx, fd), 16);
    usys::seek(ctx, fd, 4);
    let back = ctx.push_bytes(&[0u8; 8]);
    assert_eq!(usys::read(ctx, fd, back, 8), 8);
    let mut bytes = [0u8; 8];
    ctx.read(back, &mut bytes);
    assert_eq!(&bytes, b"456789ab");
    usys::close(ctx, fd);
    // A second open starts at position zero with the same contents.
    let fd2 = usys::open(ctx, "out.txt");
    assert_eq!(usys::tell(ctx, fd2), 0);
    assert!(usys::remove(ctx, "out.txt"));
    assert!(usys::open(ctx, "out.txt") < 0);
    0
}

#[test]
fn file_syscalls_round_trip() {
    MachineBuilder::new()
        .program("filer", file_round_trip)
        .run(|m| {
            m.install_trivial("filer");
            assert_eq!(m.exec_wait("filer"), 0);
        });
}

fn close_twice(ctx: &mut UserCtx) -> i32 {
    let fd = usys::open(ctx, "close-me");
    assert!(fd >= 2);
    usys::close(ctx, fd);
    // The descriptor is gone; touching it again is a violation.
    usys::close(ctx, fd);
    0
}

#[test]
fn stale_descriptors_kill() {
    MachineBuilder::new()
        .program("close-twice", close_twice)
        .run(|m| {
            m.install_trivial("close-twice");
            m.fs().create(None, "close-me", 1, false).unwrap();
            assert_eq!(m.exec_wait("close-twice"), -1);
        });
}

fn dir_vine(ctx: &mut UserCtx) -> i32 {
    for i in 0..10 {
        let name = format!("{i}");
        assert!(usys::mkdir(ctx, &name));
        assert!(usys::chdir(ctx, &name));
    }
    assert!(usys::create(ctx, "test", 512));
    assert!(usys::chdir(ctx, "/"));
    let fd = usys::open(ctx, "/0/1/2/3/4/5/6/7/8/9/test");
    assert!(fd >= 2);
    assert!(!usys::isdir(ctx, fd));
    usys::close(ctx, fd);
    assert!(usys::remove(ctx, "/0/1/2/3/4/5/6/7/8/9/test"));
    let mut path = "/0/1/2/3/4/5/6/7/8/9".to_string();
    for _ in 0..10 {
        assert!(usys::remove(ctx, &path));
        path.truncate(path.rfind('/').unwrap());
    }
    assert!(usys::open(ctx, "/0/1/2/3/4/5/6/7/8/9/test") < 0);
    0
}

#[test]
fn deeply_nested_directories() {
    MachineBuilder::new().program("vine", dir_vine).run(|m| {
        m.install_trivial("vine");
        assert_eq!(m.exec_wait("vine"), 0);
    });
}

fn lister(ctx: &mut UserCtx) -> i32 {
    assert!(usys::mkdir(ctx, "sub"));
    assert!(usys::create(ctx, "alpha", 0));
    assert!(usys::create(ctx, "beta", 0));
    let fd = usys::open(ctx, "/");
    assert!(fd >= 2);
    assert!(usys::isdir(ctx, fd));
    let name_buf = ctx.push_bytes(&[0u8; 16]);
    let mut seen = Vec::new();
    while usys::readdir(ctx, fd, name_buf) {
        let mut raw = [0u8; 16];
        ctx.read(name_buf, &mut raw);
        let end = raw.iter().position(|&b| b == 0).unwrap();
        seen.push(String::from_utf8_lossy(&raw[..end]).into_owned());
    }
    // "." and ".." never show up; the executable was installed first.
    assert_eq!(seen, vec!["lister", "sub", "alpha", "beta"]);
    let sub = usys::open(ctx, "sub");
    assert!(usys::isdir(ctx, sub));
    assert!(usys::inumber(ctx, sub) > 0);
    assert_ne!(usys::inumber(ctx, sub), usys::inumber(ctx, fd));
    0
}

#[test]
fn readdir_lists_entries_in_storage_order() {
    MachineBuilder::new().program("lister", lister).run(|m| {
        m.install_trivial("lister");
        assert_eq!(m.exec_wait("lister"), 0);
    });
}

fn cwd_removed(ctx: &mut UserCtx) -> i32 {
    assert!(usys::mkdir(ctx, "doomed"));
    assert!(usys::chdir(ctx, "doomed"));
    assert!(usys::remove(ctx, "/doomed"));
    // Creating in a removed working directory fails cleanly.
    assert!(!usys::create(ctx, "orphan", 0));
    assert!(!usys::chdir(ctx, "/doomed"));
    assert!(usys::chdir(ctx, "/"));
    0
}

#[test]
fn removed_cwd_fails_cleanly() {
    MachineBuilder::new()
        .program("cwd-removed", cwd_removed)
        .run(|m| {
            m.install_trivial("cwd-removed");
            assert_eq!(m.exec_wait("cwd-removed"), 0);
        });
}

fn pattern(i: usize) -> u8 {
    (i.wrapping_mul(7) + 3) as u8
}

fn fan_reader(ctx: &mut UserCtx) -> i32 {
    let args = ctx.args();
    let index: i32 = args[1].parse().unwrap();
    let fd = usys::open(ctx, "fan-data");
    assert!(fd >= 2);
    let buf = ctx.push_bytes(&[0u8; 1024]);
    assert_eq!(usys::read(ctx, fd, buf, 1024), 1024);
    let mut bytes = vec![0u8; 1024];
    ctx.read(buf, &mut bytes);
    for (i, &b) in bytes.iter().enumerate() {
        assert_eq!(b, pattern(i), "byte {i} mismatch in reader {index}");
    }
    index
}

#[test]
fn synchronized_reader_fanout() {
    MachineBuilder::new()
        .program("fan-reader", fan_reader)
        .run(|m| {
            m.install_trivial("fan-reader");
            let data: Vec<u8> = (0..1024).map(pattern).collect();
            m.fs().create(None, "fan-data", 0, false).unwrap();
            let f = m
                .fs()
                .open(None, "fan-data")
                .unwrap()
                .into_regular()
                .unwrap();
            assert_eq!(f.write(&data).unwrap(), 1024);
            let pids: Vec<u64> = (0..10)
                .map(|i| process::exec(&format!("fan-reader {i}")).unwrap())
                .collect();
            for (i, pid) in pids.into_iter().enumerate() {
                assert_eq!(process::wait(pid), i as i32);
            }
        });
}

fn exe_writer(ctx: &mut UserCtx) -> i32 {
    // Writes to one's own running executable are denied.
    let fd = usys::open(ctx, "exe-writer");
    assert!(fd >= 2);
    let buf = ctx.push_bytes(b"overwrite");
    assert_eq!(usys::write(ctx, fd, buf, 9), 0);
    0
}

#[test]
fn running_executables_deny_writes() {
    MachineBuilder::new()
        .program("exe-writer", exe_writer)
        .run(|m| {
            m.install_trivial("exe-writer");
            assert_eq!(m.exec_wait("exe-writer"), 0);
            // After exit the file is writable again.
            let f = m
                .fs()
                .open(None, "exe-writer")
                .unwrap()
                .into_regular()
                .unwrap();
            assert_eq!(f.write(b"x").unwrap(), 1);
        });
}
