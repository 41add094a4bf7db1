//! Whole-machine scenarios: boot a kernel, run user programs as processes
//! and check what they observe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use x86_64::VirtAddr;

use crate::fs::file::{O_RDONLY, O_RDWR};
use crate::fs::FileSystem;
use crate::memory::mmap::{Prot, MAP_PRIVATE, MAP_SHARED};
use crate::memory::PAGE_SIZE;
use crate::param::{KernelConfig, NMMAP};
use crate::scheduler::{Channel, ProcessId, ProcessState};
use crate::sync::SpinLock;
use crate::syscalls::{SYS_CLOSE, SYS_GETPID, SYS_MMAP, SYS_SBRK};
use crate::{Kernel, KernelError, UserContext};

const TIMEOUT: Duration = Duration::from_secs(20);

fn config() -> KernelConfig {
    KernelConfig { ncpu: 2, nproc: 16, phys_pages: 256, disk_blocks: 256, ..KernelConfig::default() }
}

fn boot<F>(init: F) -> Arc<Kernel>
where
    F: FnOnce(&UserContext) -> i32 + Send + 'static,
{
    Kernel::boot(config(), init).unwrap()
}

/// What init does once its test body is over: reap whatever comes its way.
fn idle(u: &UserContext) -> ! {
    loop {
        if u.wait(None).is_err() {
            u.yield_now();
        }
    }
}

/// Spin, giving up the core, until `flag` is set.
fn wait_for(u: &UserContext, flag: &AtomicBool) {
    while !flag.load(Ordering::Acquire) {
        u.yield_now();
    }
}

/// Reap one child and read back its exit status through user memory.
fn wait_status(u: &UserContext) -> (ProcessId, i32) {
    let pid = u.wait(Some(VirtAddr::new(0))).unwrap();
    let mut status = [0u8; 4];
    u.load(0, &mut status);
    (pid, i32::from_le_bytes(status))
}

fn finish<T>(kernel: &Kernel, rx: &mpsc::Receiver<T>) -> T {
    let result = rx.recv_timeout(TIMEOUT);
    assert_eq!(kernel.panic_message(), None);
    kernel.shutdown();
    result.unwrap()
}

#[test]
fn fork_then_wait_returns_exit_status() {
    let (tx, rx) = mpsc::channel();
    let kernel = boot(move |u| {
        let child = u.fork(|_| 7).unwrap();
        let (pid, status) = wait_status(u);
        tx.send((child, pid, status)).unwrap();
        idle(u)
    });
    let (child, pid, status) = finish(&kernel, &rx);
    assert_eq!(child, pid);
    assert_eq!(status, 7);
}

#[test]
fn error_paths_report_failure() {
    let (tx, rx) = mpsc::channel();
    let kernel = boot(move |u| {
        let results = (u.wait(None).err(), u.kill(ProcessId(999)).err(), u.close(12).err());
        tx.send(results).unwrap();
        idle(u)
    });
    let results = finish(&kernel, &rx);
    assert_eq!(
        results,
        (Some(KernelError::NoChildren), Some(KernelError::NoSuchProcess), Some(KernelError::BadFileDescriptor))
    );
}

#[test]
fn child_address_space_is_a_private_copy() {
    let (tx, rx) = mpsc::channel();
    let kernel = boot(move |u| {
        u.store(16, b"parent");
        let child_tx = tx.clone();
        u.fork(move |u| {
            let mut seen = [0u8; 6];
            u.load(16, &mut seen);
            u.store(16, b"child!");
            child_tx.send((seen, u.trapframe().rax)).unwrap();
            0
        })
        .unwrap();
        wait_status(u);
        let mut after = [0u8; 6];
        u.load(16, &mut after);
        tx.send((after, 0)).unwrap();
        idle(u)
    });
    let (seen, rax) = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(&seen, b"parent");
    assert_eq!(rax, 0);
    let (after, _) = finish(&kernel, &rx);
    assert_eq!(&after, b"parent");
}

#[test]
fn fork_takes_one_reference_per_descriptor_and_region() {
    let kernel = Kernel::new(config()).unwrap();
    kernel.fs().add_file("data", b"0123456789").unwrap();

    let (tx, rx) = mpsc::channel();
    kernel
        .start(move |u| {
            let k = u.kernel().clone();
            let fd = u.open("data", O_RDONLY).unwrap();
            let addr = u.mmap(10, Prot::READ, MAP_PRIVATE, fd).unwrap();
            let mut head = [0u8; 4];
            u.load(addr.as_u64(), &mut head);

            let file = k.fd_get(fd).unwrap();
            let console = k.fd_get(1).unwrap();
            let before = (Arc::strong_count(&file), Arc::strong_count(&console));

            let go = Arc::new(AtomicBool::new(false));
            let child_go = go.clone();
            let child_tx = tx.clone();
            u.fork(move |u| {
                // The faulted-in page came along; no new fault needed.
                let mut seen = [0u8; 10];
                u.load(addr.as_u64(), &mut seen);
                child_tx.send(seen.to_vec()).unwrap();
                wait_for(u, &child_go);
                0
            })
            .unwrap();
            let after = (Arc::strong_count(&file), Arc::strong_count(&console));
            go.store(true, Ordering::Release);
            wait_status(u);
            let reaped = (Arc::strong_count(&file), Arc::strong_count(&console));

            tx.send([before, after, reaped].iter().flat_map(|&(a, b)| [a as u8, b as u8]).collect()).unwrap();
            idle(u)
        })
        .unwrap();

    let seen = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(&seen, b"0123456789");
    let counts = finish(&kernel, &rx);
    // file: descriptor + region + local handle; console: descriptor + local.
    assert_eq!(counts, vec![3, 2, 5, 3, 3, 2]);
}

#[test]
fn fork_references_the_file_behind_a_shared_region() {
    let kernel = Kernel::new(config()).unwrap();
    kernel.fs().add_file("data", b"0123456789").unwrap();

    let (tx, rx) = mpsc::channel();
    kernel
        .start(move |u| {
            let k = u.kernel().clone();
            let fd = u.open("data", O_RDWR).unwrap();
            u.mmap(PAGE_SIZE, Prot::READ | Prot::WRITE, MAP_SHARED, fd).unwrap();
            let file = k.fd_get(fd).unwrap();
            let before = Arc::strong_count(&file);

            let go = Arc::new(AtomicBool::new(false));
            let child_go = go.clone();
            u.fork(move |u| {
                wait_for(u, &child_go);
                0
            })
            .unwrap();
            let after = Arc::strong_count(&file);
            go.store(true, Ordering::Release);
            wait_status(u);
            tx.send((before, after, Arc::strong_count(&file))).unwrap();
            idle(u)
        })
        .unwrap();

    assert_eq!(finish(&kernel, &rx), (3, 5, 3));
}

#[test]
fn fork_out_of_memory_frees_the_partial_child() {
    let (tx, rx) = mpsc::channel();
    let kernel = boot(move |u| {
        let k = u.kernel().clone();
        // Leave enough for a process slot but not for a copy of the heap.
        while k.kmem().free_frames() > 32 {
            u.sbrk(PAGE_SIZE as i64).unwrap();
        }
        let before = k.kmem().free_frames();
        let forked = u.fork(|_| 0).err();
        let after = k.kmem().free_frames();
        tx.send((forked, before, after, k.procdump().len())).unwrap();
        idle(u)
    });
    let (forked, before, after, live) = finish(&kernel, &rx);
    assert_eq!(forked, Some(KernelError::OutOfMemory));
    assert_eq!(before, after);
    assert_eq!(live, 1);
}

#[test]
fn orphans_are_reparented_to_init() {
    let (tx, rx) = mpsc::channel();
    let kernel = boot(move |u| {
        let go = Arc::new(AtomicBool::new(false));
        let (kids_tx, kids_rx) = mpsc::channel();
        let middle_go = go.clone();
        let middle = u
            .fork(move |u| {
                let mut kids = Vec::new();
                for _ in 0..2 {
                    let go = middle_go.clone();
                    kids.push(
                        u.fork(move |u| {
                            wait_for(u, &go);
                            3
                        })
                        .unwrap(),
                    );
                }
                kids_tx.send(kids).unwrap();
                0
            })
            .unwrap();

        let first = wait_status(u);
        let kids = kids_rx.recv().unwrap();
        go.store(true, Ordering::Release);
        let mut rest = vec![wait_status(u), wait_status(u)];
        rest.sort();
        tx.send((middle, first, kids, rest)).unwrap();
        idle(u)
    });
    let (middle, first, kids, rest) = finish(&kernel, &rx);
    assert_eq!(first, (middle, 0));
    assert_eq!(rest, vec![(kids[0], 3), (kids[1], 3)]);
}

#[test]
fn failed_status_copy_leaves_the_zombie() {
    let (tx, rx) = mpsc::channel();
    let kernel = boot(move |u| {
        let child = u.fork(|_| 5).unwrap();
        let failed = u.wait(Some(VirtAddr::new(0x3000_0000))).err();
        let (pid, status) = wait_status(u);
        tx.send((child, failed, pid, status)).unwrap();
        idle(u)
    });
    let (child, failed, pid, status) = finish(&kernel, &rx);
    assert_eq!(failed, Some(KernelError::BadAddress));
    assert_eq!((pid, status), (child, 5));
}

#[test]
fn killed_parent_stops_waiting() {
    let (tx, rx) = mpsc::channel();
    let kernel = boot(move |u| {
        u.fork(move |u| {
            let k = u.kernel().clone();
            let go = Arc::new(AtomicBool::new(false));
            let child_go = go.clone();
            u.fork(move |u| {
                wait_for(u, &child_go);
                0
            })
            .unwrap();
            let me = u.getpid();
            k.kill(me).unwrap();
            let waited = k.wait(None).err();
            go.store(true, Ordering::Release);
            tx.send(waited).unwrap();
            0
        })
        .unwrap();
        idle(u)
    });
    assert_eq!(finish(&kernel, &rx), Some(KernelError::Killed));
}

#[test]
fn sleep_and_wakeup_alternate_two_processes() {
    const ROUNDS: u32 = 50;
    let (tx, rx) = mpsc::channel();
    let kernel = boot(move |u| {
        let turn = Arc::new(SpinLock::new("turn", 0u32));
        let chan = Channel::Addr(Arc::as_ptr(&turn) as usize);

        let child_turn = turn.clone();
        u.fork(move |u| {
            let k = u.kernel();
            for _ in 0..ROUNDS {
                let mut t = child_turn.lock();
                while *t % 2 == 0 {
                    t = k.sleep(chan, t);
                }
                *t += 1;
                k.wakeup(chan);
            }
            0
        })
        .unwrap();

        let k = u.kernel();
        for _ in 0..ROUNDS {
            let mut t = turn.lock();
            while *t % 2 == 1 {
                t = k.sleep(chan, t);
            }
            *t += 1;
            k.wakeup(chan);
        }
        let (_, status) = wait_status(u);
        let total = *turn.lock();
        tx.send((total, status)).unwrap();
        idle(u)
    });
    assert_eq!(finish(&kernel, &rx), (2 * ROUNDS, 0));
}

#[test]
fn kill_wakes_a_sleeping_process() {
    let (tx, rx) = mpsc::channel();
    let kernel = boot(move |u| {
        let victim = u
            .fork(|u| {
                let k = u.kernel();
                let lock = SpinLock::new("forever", ());
                let mut guard = lock.lock();
                loop {
                    guard = k.sleep(Channel::Addr(0xdead), guard);
                    if k.myproc().is_some_and(|p| k.killed(p)) {
                        break;
                    }
                }
                drop(guard);
                // Back towards user space: a killed process exits here.
                u.yield_now();
                0
            })
            .unwrap();

        let k = u.kernel().clone();
        while !k.procdump().iter().any(|info| info.pid == victim && info.state == ProcessState::Sleeping) {
            u.yield_now();
        }
        u.kill(victim).unwrap();
        tx.send(wait_status(u)).unwrap();
        idle(u)
    });
    let (_, status) = finish(&kernel, &rx);
    assert_eq!(status, -1);
}

#[test]
fn init_returning_is_a_kernel_panic() {
    let kernel = boot(|_| 0);
    let deadline = Instant::now() + TIMEOUT;
    while kernel.panic_message().is_none() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(kernel.panic_message().as_deref(), Some("init exiting"));
    assert!(kernel.is_halted());
}

#[test]
fn fault_fills_page_from_short_file() {
    let kernel = Kernel::new(config()).unwrap();
    kernel.fs().add_file("ten", b"0123456789").unwrap();

    let (tx, rx) = mpsc::channel();
    kernel
        .start(move |u| {
            let k = u.kernel().clone();
            let fd = u.open("ten", O_RDONLY).unwrap();
            let addr = u.mmap(PAGE_SIZE, Prot::READ, MAP_PRIVATE, fd).unwrap().as_u64();

            let free = k.kmem().free_frames();
            let mut last = [0u8; 1];
            u.load(addr + 9, &mut last);
            let used = free - k.kmem().free_frames();

            let mut page = vec![0xffu8; PAGE_SIZE as usize];
            u.load(addr, &mut page);
            tx.send((last[0], used, page)).unwrap();
            idle(u)
        })
        .unwrap();

    let (last, used, page) = finish(&kernel, &rx);
    assert_eq!(last, b'9');
    assert_eq!(used, 1);
    assert_eq!(&page[..10], b"0123456789");
    assert!(page[10..].iter().all(|&b| b == 0));
}

#[test]
fn mmap_rejects_bad_requests() {
    let kernel = Kernel::new(config()).unwrap();
    kernel.fs().add_file("ten", b"0123456789").unwrap();

    let (tx, rx) = mpsc::channel();
    kernel
        .start(move |u| {
            let fd = u.open("ten", O_RDONLY).unwrap();
            let results = vec![
                u.mmap(0, Prot::READ, MAP_PRIVATE, fd).err(),
                u.mmap(PAGE_SIZE, Prot::empty(), MAP_PRIVATE, fd).err(),
                u.mmap(PAGE_SIZE, Prot::READ, MAP_SHARED | MAP_PRIVATE, fd).err(),
                u.mmap(PAGE_SIZE, Prot::READ, MAP_PRIVATE, 9).err(),
                u.mmap(PAGE_SIZE, Prot::READ, MAP_PRIVATE, 1).err(),
                u.mmap(PAGE_SIZE, Prot::READ | Prot::WRITE, MAP_SHARED, fd).err(),
                u.mmap(2 * PAGE_SIZE, Prot::READ, MAP_PRIVATE, fd).err(),
                u.mmap(2 * PAGE_SIZE, Prot::READ | Prot::WRITE, MAP_PRIVATE, fd).err(),
                u.mmap(u64::MAX, Prot::READ | Prot::WRITE, MAP_PRIVATE, fd).err(),
                u.mmap(u64::MAX - PAGE_SIZE, Prot::WRITE, MAP_PRIVATE, fd).err(),
            ];
            let fd = fd as u64;
            let private = MAP_PRIVATE as u64;
            let raw = vec![
                u.syscall(SYS_MMAP, [PAGE_SIZE, 0x8, private, fd]),
                u.syscall(SYS_MMAP, [u64::MAX, 3, private, fd]),
                u.syscall(SYS_MMAP, [PAGE_SIZE, (1 << 32) | 1, private, fd]),
                u.syscall(SYS_MMAP, [PAGE_SIZE, 1, (1 << 32) | private, fd]),
                u.syscall(SYS_MMAP, [PAGE_SIZE, 1, private, (1 << 32) | fd]),
            ];
            tx.send((results, raw)).unwrap();
            idle(u)
        })
        .unwrap();

    let (results, raw) = finish(&kernel, &rx);
    assert_eq!(
        results,
        vec![
            Some(KernelError::InvalidArgument),
            Some(KernelError::InvalidArgument),
            Some(KernelError::InvalidArgument),
            Some(KernelError::BadFileDescriptor),
            Some(KernelError::InvalidArgument),
            Some(KernelError::PermissionDenied),
            Some(KernelError::InvalidArgument),
            None,
            Some(KernelError::InvalidArgument),
            Some(KernelError::OutOfMemory),
        ]
    );
    assert!(raw.iter().all(|&r| r == u64::MAX));
}

#[test]
fn mapping_slots_run_out() {
    let kernel = Kernel::new(config()).unwrap();
    kernel.fs().add_file("ten", b"0123456789").unwrap();

    let (tx, rx) = mpsc::channel();
    kernel
        .start(move |u| {
            let fd = u.open("ten", O_RDONLY).unwrap();
            let addrs: Vec<_> = (0..NMMAP).map(|_| u.mmap(PAGE_SIZE, Prot::READ, MAP_PRIVATE, fd).unwrap()).collect();
            let full = u.mmap(PAGE_SIZE, Prot::READ, MAP_PRIVATE, fd).err();
            u.munmap(addrs[3], PAGE_SIZE).unwrap();
            let again = u.mmap(PAGE_SIZE, Prot::READ, MAP_PRIVATE, fd).is_ok();
            tx.send((full, again)).unwrap();
            idle(u)
        })
        .unwrap();

    assert_eq!(finish(&kernel, &rx), (Some(KernelError::NoFreeMapping), true));
}

#[test]
fn munmap_trims_edges_but_never_splits() {
    let kernel = Kernel::new(config()).unwrap();
    kernel.fs().add_file("three", &[b'x'; 3 * PAGE_SIZE as usize]).unwrap();

    let (tx, rx) = mpsc::channel();
    kernel
        .start(move |u| {
            let fd = u.open("three", O_RDONLY).unwrap();
            let addr = u.mmap(3 * PAGE_SIZE, Prot::READ, MAP_PRIVATE, fd).unwrap();
            let middle = addr + PAGE_SIZE;

            let split = u.munmap(middle, PAGE_SIZE).err();
            let mut byte = [0u8; 1];
            u.load(middle.as_u64(), &mut byte);

            let head = u.munmap(addr, PAGE_SIZE);
            let tail = u.munmap(middle + PAGE_SIZE, PAGE_SIZE);
            let still = {
                u.load(middle.as_u64(), &mut byte);
                byte[0]
            };
            let last = u.munmap(middle, PAGE_SIZE);

            // Touching the region now is an unhandled fault.
            u.fork(move |u| {
                let mut b = [0u8; 1];
                u.load(middle.as_u64(), &mut b);
                0
            })
            .unwrap();
            let (_, status) = wait_status(u);
            tx.send((split, head, tail, still, last, status)).unwrap();
            idle(u)
        })
        .unwrap();

    let (split, head, tail, still, last, status) = finish(&kernel, &rx);
    assert_eq!(split, Some(KernelError::UnsupportedSplit));
    assert_eq!((head, tail, last), (Ok(()), Ok(()), Ok(())));
    assert_eq!(still, b'x');
    assert_eq!(status, -1);
}

#[test]
fn shared_mapping_writes_back_at_the_right_offset() {
    let kernel = Kernel::new(config()).unwrap();
    kernel.fs().add_file("two", &[b'a'; 2 * PAGE_SIZE as usize]).unwrap();

    let (tx, rx) = mpsc::channel();
    kernel
        .start(move |u| {
            let fd = u.open("two", O_RDWR).unwrap();
            let addr = u.mmap(2 * PAGE_SIZE, Prot::READ | Prot::WRITE, MAP_SHARED, fd).unwrap();
            u.store(addr.as_u64(), b"HEAD");
            u.store(addr.as_u64() + PAGE_SIZE, b"TAIL");
            let head = u.munmap(addr, PAGE_SIZE);
            let tail = u.munmap(addr + PAGE_SIZE, PAGE_SIZE);
            tx.send((head, tail)).unwrap();
            idle(u)
        })
        .unwrap();

    let (head, tail) = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!((head, tail), (Ok(()), Ok(())));

    let inode = kernel.fs().lookup("two").unwrap();
    let mut buf = [0u8; 6];
    {
        let _guard = inode.lock();
        inode.read_at(0, &mut buf);
        assert_eq!(&buf, b"HEADaa");
        inode.read_at(PAGE_SIZE, &mut buf);
        assert_eq!(&buf, b"TAILaa");
    }
    assert_eq!(kernel.panic_message(), None);
    kernel.shutdown();
}

#[test]
fn exit_writes_back_dirty_shared_pages() {
    let kernel = Kernel::new(config()).unwrap();
    kernel.fs().add_file("note", b"abcd").unwrap();

    let (tx, rx) = mpsc::channel();
    kernel
        .start(move |u| {
            let fd = u.open("note", O_RDWR).unwrap();
            let addr = u.mmap(PAGE_SIZE, Prot::READ | Prot::WRITE, MAP_SHARED, fd).unwrap().as_u64();
            u.fork(move |u| {
                u.store(addr, b"KID");
                0
            })
            .unwrap();
            tx.send(wait_status(u)).unwrap();
            idle(u)
        })
        .unwrap();

    let (_, status) = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(status, 0);

    let inode = kernel.fs().lookup("note").unwrap();
    let mut buf = [0u8; 4];
    {
        let _guard = inode.lock();
        inode.read_at(0, &mut buf);
    }
    assert_eq!(&buf, b"KIDd");
    assert_eq!(kernel.panic_message(), None);
    kernel.shutdown();
}

#[test]
fn failed_writeback_keeps_the_region() {
    let kernel = Kernel::new(config()).unwrap();
    kernel.fs().create_with_capacity("tiny", 1024).unwrap();

    let (tx, rx) = mpsc::channel();
    kernel
        .start(move |u| {
            let fd = u.open("tiny", O_RDWR).unwrap();
            let addr = u.mmap(PAGE_SIZE, Prot::READ | Prot::WRITE, MAP_SHARED, fd).unwrap();
            u.store(addr.as_u64(), b"x");
            let unmapped = u.munmap(addr, PAGE_SIZE);
            let mut b = [0u8; 1];
            u.load(addr.as_u64(), &mut b);
            tx.send((unmapped, b[0])).unwrap();
            idle(u)
        })
        .unwrap();

    assert_eq!(finish(&kernel, &rx), (Err(KernelError::IoError), b'x'));
}

#[test]
fn concurrent_misses_share_one_buffer() {
    let (tx, rx) = mpsc::channel();
    let kernel = boot(move |u| {
        let go = Arc::new(AtomicBool::new(false));
        for _ in 0..2 {
            let (go, tx) = (go.clone(), tx.clone());
            u.fork(move |u| {
                wait_for(u, &go);
                let k = u.kernel();
                let b = k.bcache().read(1, 5);
                tx.send(b.id()).unwrap();
                0
            })
            .unwrap();
        }
        go.store(true, Ordering::Release);
        wait_status(u);
        wait_status(u);
        idle(u)
    });

    let a = rx.recv_timeout(TIMEOUT).unwrap();
    let b = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(a, b);
    assert_eq!(kernel.disk().reads(), 1);
    assert_eq!(kernel.bcache().cached_copies(1, 5), 1);
    assert_eq!(kernel.panic_message(), None);
    kernel.shutdown();
}

#[test]
fn procdump_lists_live_processes() {
    let (tx, rx) = mpsc::channel();
    let kernel = boot(move |u| {
        let go = Arc::new(AtomicBool::new(false));
        let child_go = go.clone();
        let child = u
            .fork(move |u| {
                wait_for(u, &child_go);
                0
            })
            .unwrap();
        let dump = u.kernel().procdump();
        go.store(true, Ordering::Release);
        wait_status(u);
        tx.send((u.getpid(), child, dump)).unwrap();
        idle(u)
    });
    let (me, child, dump) = finish(&kernel, &rx);
    assert_eq!(dump.len(), 2);
    assert_eq!(dump[0].pid, me);
    assert_eq!(dump[0].state, ProcessState::Running);
    assert_eq!(dump[1].pid, child);
    assert!(dump.iter().all(|info| info.name == "initcode"));
}

#[test]
fn sbrk_grows_and_shrinks_the_heap() {
    let (tx, rx) = mpsc::channel();
    let kernel = boot(move |u| {
        let old = u.sbrk(2 * PAGE_SIZE as i64).unwrap();
        u.store(old + PAGE_SIZE + 100, b"heap");
        let grown = u.syscall(SYS_SBRK, [0; 4]);
        let shrunk = u.sbrk(-(2 * PAGE_SIZE as i64)).unwrap();
        let huge = u.sbrk(1 << 40).err();

        u.fork(move |u| {
            u.store(old + PAGE_SIZE + 100, b"gone");
            0
        })
        .unwrap();
        let (_, status) = wait_status(u);
        tx.send((old, grown, shrunk, huge, status)).unwrap();
        idle(u)
    });
    let (old, grown, shrunk, huge, status) = finish(&kernel, &rx);
    assert_eq!(old, PAGE_SIZE);
    assert_eq!(grown, 3 * PAGE_SIZE);
    assert_eq!(shrunk, 3 * PAGE_SIZE);
    assert_eq!(huge, Some(KernelError::OutOfMemory));
    assert_eq!(status, -1);
}

#[test]
fn raw_syscalls_map_errors_to_all_ones() {
    let (tx, rx) = mpsc::channel();
    let kernel = boot(move |u| {
        let pid = u.syscall(SYS_GETPID, [0; 4]);
        let bad_close = u.syscall(SYS_CLOSE, [42, 0, 0, 0]);
        let unknown = u.syscall(99, [0; 4]);
        tx.send((pid, u.getpid(), bad_close, unknown)).unwrap();
        idle(u)
    });
    let (raw, pid, bad_close, unknown) = finish(&kernel, &rx);
    assert_eq!(raw, pid.0);
    assert_eq!(bad_close, u64::MAX);
    assert_eq!(unknown, u64::MAX);
}

#[test]
fn reaping_returns_every_frame() {
    let (tx, rx) = mpsc::channel();
    let kernel = boot(move |u| {
        let k = u.kernel().clone();
        let before = k.kmem().free_frames();
        u.fork(|u| {
            u.sbrk(4 * PAGE_SIZE as i64).unwrap();
            0
        })
        .unwrap();
        wait_status(u);
        tx.send((before, k.kmem().free_frames())).unwrap();
        idle(u)
    });
    let (before, after) = finish(&kernel, &rx);
    assert_eq!(before, after);
}
