use super::*;

use crate::channel::{self, MemKernel};
use crate::lock::LockType;
use crate::ops::FileLock;
use crate::types::file::FileType;
use crate::types::{Attr, AttrOut, DirEntryPlus, Entry, ForgetOne, Ino, Opened};

use std::ffi::OsStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_std::channel::Receiver;
use async_std::task::JoinHandle;
use parking_lot::Mutex;

const ROOT: u64 = 1;

fn setup_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// what the filesystem saw
#[derive(Debug, Default)]
struct Seen {
    forgotten: Mutex<Vec<FileKey>>,
    destroyed: AtomicUsize,
    /// `a` has been renamed to `c`
    renamed: Mutex<bool>,
    /// rename waits for this channel when present
    gate: Mutex<Option<Receiver<()>>>,
    /// lookup and readdirplus answer, then wait for this channel when present
    lookup_gate: Mutex<Option<Receiver<()>>>,
    /// `b` has been removed
    b_gone: Mutex<bool>,
    /// number of lookups answered
    lookups: AtomicUsize,
}

/// `/a` and `/b`, both regular files
#[derive(Debug)]
struct Fixture(Arc<Seen>);

fn attr(kind: FileType) -> Attr {
    let mut attr = Attr::default();
    let _ = attr.kind(kind).perm(0o644);
    attr
}

#[async_trait::async_trait]
impl FileSystem for Fixture {
    async fn destroy(&self) {
        let _ = self.0.destroyed.fetch_add(1, Ordering::SeqCst);
    }

    async fn lookup(&self, _: &Context, parent: FileKey, name: &OsStr) -> Result<Entry, Errno> {
        assert_eq!(parent, FileKey(1));
        let renamed = *self.0.renamed.lock();
        let b_gone = *self.0.b_gone.lock();
        let key = match name.to_str() {
            Some("a") if !renamed => FileKey(2),
            Some("c") if renamed => FileKey(2),
            Some("b") if !b_gone => FileKey(3),
            _ => return Err(Errno::ENOENT),
        };
        let _ = self.0.lookups.fetch_add(1, Ordering::SeqCst);
        let gate = self.0.lookup_gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.recv().await;
        }
        Ok(Entry::new(key, attr(FileType::Regular), Duration::from_secs(1)))
    }

    async fn forget(&self, key: FileKey) {
        self.0.forgotten.lock().push(key);
    }

    async fn getattr(&self, _: &Context, key: FileKey, _: Option<u64>) -> Result<AttrOut, Errno> {
        let kind = if key == FileKey(1) {
            FileType::Directory
        } else {
            FileType::Regular
        };
        Ok(AttrOut {
            attr: attr(kind),
            ttl: Duration::from_secs(1),
        })
    }

    async fn rename(
        &self,
        _: &Context,
        _: FileKey,
        name: &OsStr,
        _: FileKey,
        newname: &OsStr,
        _: u32,
    ) -> Result<(), Errno> {
        assert_eq!((name.to_str(), newname.to_str()), (Some("a"), Some("c")));
        let gate = self.0.gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.recv().await;
        }
        *self.0.renamed.lock() = true;
        Ok(())
    }

    async fn open(&self, _: &Context, key: FileKey, _: i32) -> Result<Opened, Errno> {
        Ok(Opened::new(100 + key.0))
    }

    async fn flush(&self, _: &Context, _: FileKey, _: u64, _: u64) -> Result<(), Errno> {
        Ok(())
    }

    async fn opendir(&self, _: &Context, key: FileKey, _: i32) -> Result<Opened, Errno> {
        Ok(Opened::new(100 + key.0))
    }

    async fn readdirplus(
        &self,
        _: &Context,
        key: FileKey,
        _: u64,
        offset: u64,
    ) -> Result<Vec<DirEntryPlus>, Errno> {
        assert_eq!(key, FileKey(1));
        let entries = [("a", FileKey(2)), ("b", FileKey(3))];
        let listed = entries
            .iter()
            .zip(1_u64..)
            .skip(offset as usize)
            .map(|(&(name, key), next)| DirEntryPlus {
                entry: Entry::new(key, attr(FileType::Regular), Duration::from_secs(1)),
                offset: next,
                name: name.into(),
            })
            .collect();
        let gate = self.0.lookup_gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.recv().await;
        }
        Ok(listed)
    }

    async fn read(
        &self,
        _: &Context,
        key: FileKey,
        fh: u64,
        _: u64,
        _: u32,
    ) -> Result<Vec<u8>, Errno> {
        assert_eq!(fh, 100 + key.0);
        Ok(b"data".to_vec())
    }
}

fn init_op(major: u32) -> Operation {
    Operation::Init(OpInit {
        major,
        minor: 31,
        max_readahead: 4096,
        flags: 0,
    })
}

struct Mounted {
    kernel: MemKernel,
    inodes: Arc<InodeTable>,
    locks: Arc<LockRegistry>,
    server: JoinHandle<io::Result<()>>,
}

async fn mount(seen: &Arc<Seen>) -> Mounted {
    setup_tracing();
    let (reader, writer, kernel) = channel::memory();
    let init = kernel.submit(0, init_op(7));
    let server = ServerBuilder::new(Fixture(Arc::clone(seen)))
        .initialize(reader, writer)
        .await
        .unwrap();
    assert!(matches!(kernel.reply(init).await, Some(Ok(Response::Init(_)))));
    Mounted {
        kernel,
        inodes: server.inode_table(),
        locks: server.lock_registry(),
        server: task::spawn(server.run()),
    }
}

async fn lookup(kernel: &MemKernel, name: &str) -> u64 {
    let op = Operation::Lookup { name: name.into() };
    match kernel.call(ROOT, op).await {
        Some(Ok(Response::Entry(e))) => {
            assert_eq!(e.attr.ino, e.ino);
            e.ino
        }
        other => panic!("unexpected reply: {:?}", other),
    }
}

async fn open(kernel: &MemKernel, ino: u64) -> u64 {
    match kernel.call(ino, Operation::Open { flags: libc::O_RDWR }).await {
        Some(Ok(Response::Open(o))) => o.fh,
        other => panic!("unexpected reply: {:?}", other),
    }
}

fn release(fh: u64) -> Operation {
    Operation::Release {
        fh,
        flags: libc::O_RDWR,
        lock_owner: 0,
        flush: false,
        flock_release: false,
    }
}

fn setlk(fh: u64, owner: u64, typ: LockType, sleep: bool) -> Operation {
    Operation::SetLk {
        fh,
        owner,
        lock: FileLock {
            start: 0,
            end: u64::MAX,
            typ,
            pid: 10 + owner as u32,
        },
        sleep,
    }
}

fn flock(fh: u64, owner: u64, typ: LockType, nonblock: bool) -> Operation {
    Operation::Flock {
        fh,
        owner,
        typ,
        nonblock,
    }
}

async fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        task::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[test]
fn init_handshake() {
    setup_tracing();
    task::block_on(async {
        let (reader, writer, kernel) = channel::memory();
        let early = kernel.submit(ROOT, Operation::StatFs);
        let newer = kernel.submit(0, init_op(8));
        let init = kernel.submit(0, init_op(7));

        let seen = Arc::new(Seen::default());
        let server = ServerBuilder::new(Fixture(Arc::clone(&seen)))
            .config(*ServerConfig::default().max_write(4096))
            .initialize(reader, writer)
            .await
            .unwrap();

        assert_eq!(kernel.reply(early).await, Some(Err(Errno::EIO)));
        match kernel.reply(newer).await {
            Some(Ok(Response::Init(out))) => {
                assert_eq!((out.major, out.minor), (7, 31));
            }
            other => panic!("unexpected reply: {:?}", other),
        }
        match kernel.reply(init).await {
            Some(Ok(Response::Init(out))) => {
                assert_eq!(out.config.max_write, 4096);
                assert_eq!(out.config.max_readahead, 4096);
            }
            other => panic!("unexpected reply: {:?}", other),
        }

        let server = task::spawn(server.run());
        assert_eq!(kernel.call(0, init_op(7)).await, Some(Err(Errno::EIO)));
        kernel.close();
        server.await.unwrap();
        assert_eq!(seen.destroyed.load(Ordering::SeqCst), 1);
    });
}

#[test]
fn old_protocol_is_refused() -> anyhow::Result<()> {
    setup_tracing();
    task::block_on(async {
        let (reader, writer, kernel) = channel::memory();
        let init = kernel.submit(0, init_op(6));
        let ret = ServerBuilder::new(Fixture(Arc::default()))
            .initialize(reader, writer)
            .await;
        let err = match ret {
            Ok(_) => anyhow::bail!("protocol 7.6 was accepted"),
            Err(err) => err,
        };
        assert_eq!(err.raw_os_error(), Some(libc::EPROTO));
        assert_eq!(kernel.reply(init).await, Some(Err(Errno::EPROTO)));
        Ok(())
    })
}

#[test]
fn open_file_outlives_forget() {
    let seen = Arc::new(Seen::default());
    task::block_on(async {
        let m = mount(&seen).await;
        let ino = lookup(&m.kernel, "a").await;
        assert_eq!(lookup(&m.kernel, "a").await, ino);
        let fh = open(&m.kernel, ino).await;

        let read = Operation::Read {
            fh,
            offset: 0,
            size: 2,
        };
        assert_eq!(
            m.kernel.call(ino, read).await,
            Some(Ok(Response::Data(b"da".to_vec())))
        );

        let forget = Operation::Forget { nlookup: 2 };
        assert_eq!(m.kernel.call(ino, forget).await, Some(Ok(Response::None)));
        assert!(m.inodes.contains(Ino::from_raw(ino)));
        assert!(seen.forgotten.lock().is_empty());

        assert_eq!(m.kernel.call(ino, release(fh)).await, Some(Ok(Response::Empty)));
        assert!(!m.inodes.contains(Ino::from_raw(ino)));
        assert_eq!(*seen.forgotten.lock(), [FileKey(2)]);

        let getattr = Operation::GetAttr { fh: None };
        assert_eq!(m.kernel.call(ino, getattr).await, Some(Err(Errno::ENOENT)));

        // a fresh lookup gets a fresh inode number
        assert_ne!(lookup(&m.kernel, "a").await, ino);
    });
}

#[test]
fn forget_racing_a_lookup() {
    let seen = Arc::new(Seen::default());
    let (open_gate, gate) = async_std::channel::bounded(1);
    task::block_on(async {
        let m = mount(&seen).await;
        let first = lookup(&m.kernel, "b").await;

        *seen.lookup_gate.lock() = Some(gate);
        let racing = m.kernel.submit(ROOT, Operation::Lookup { name: "b".into() });
        // the handler has answered and is parked at the gate
        wait_until(|| seen.lookup_gate.lock().is_none()).await;

        let forget = Operation::Forget { nlookup: 1 };
        assert_eq!(m.kernel.call(first, forget).await, Some(Ok(Response::None)));
        assert!(!m.inodes.contains(Ino::from_raw(first)));
        assert_eq!(*seen.forgotten.lock(), [FileKey(3)]);

        open_gate.send(()).await.unwrap();
        let second = match m.kernel.reply(racing).await {
            Some(Ok(Response::Entry(e))) => e.ino,
            other => panic!("unexpected reply: {:?}", other),
        };
        assert_ne!(second, first);
        // the answer older than the forget hook was resolved again
        assert_eq!(seen.lookups.load(Ordering::SeqCst), 3);
        assert_eq!(m.inodes.info(Ino::from_raw(second)).unwrap().lookups, 1);
        assert_eq!(seen.forgotten.lock().len(), 1);
    });
}

#[test]
fn readdirplus_rolls_back_on_error() {
    let seen = Arc::new(Seen::default());
    let (open_gate, gate) = async_std::channel::bounded(1);
    task::block_on(async {
        let m = mount(&seen).await;
        let b = lookup(&m.kernel, "b").await;
        let fh = match m.kernel.call(ROOT, Operation::OpenDir { flags: 0 }).await {
            Some(Ok(Response::Open(o))) => o.fh,
            other => panic!("unexpected reply: {:?}", other),
        };

        *seen.lookup_gate.lock() = Some(gate);
        let readdir = Operation::ReadDirPlus {
            fh,
            offset: 0,
            size: 4096,
        };
        let listing = m.kernel.submit(ROOT, readdir);
        wait_until(|| seen.lookup_gate.lock().is_none()).await;

        // `b` goes away while the listing is in flight
        *seen.b_gone.lock() = true;
        let forget = Operation::Forget { nlookup: 1 };
        assert_eq!(m.kernel.call(b, forget).await, Some(Ok(Response::None)));

        open_gate.send(()).await.unwrap();
        assert_eq!(m.kernel.reply(listing).await, Some(Err(Errno::ENOENT)));
        // the lookup already counted for `a` was handed back
        assert!(m.inodes.is_empty());
        assert_eq!(*seen.forgotten.lock(), [FileKey(3), FileKey(2)]);
    });
}

#[test]
fn handle_misuse() {
    let seen = Arc::new(Seen::default());
    task::block_on(async {
        let m = mount(&seen).await;
        let a = lookup(&m.kernel, "a").await;
        let b = lookup(&m.kernel, "b").await;
        let fh = open(&m.kernel, a).await;

        let read = Operation::Read {
            fh,
            offset: 0,
            size: 4,
        };
        assert_eq!(m.kernel.call(b, read).await, Some(Err(Errno::EBADF)));

        assert_eq!(m.kernel.call(a, release(fh)).await, Some(Ok(Response::Empty)));
        assert_eq!(m.kernel.call(a, release(fh)).await, Some(Err(Errno::EBADF)));

        let getxattr = Operation::GetXAttr {
            name: "user.k".into(),
            size: 0,
        };
        assert_eq!(m.kernel.call(a, getxattr).await, Some(Err(Errno::ENOSYS)));

        let bad_name = Operation::Lookup {
            name: "x/y".into(),
        };
        assert_eq!(m.kernel.call(ROOT, bad_name).await, Some(Err(Errno::EINVAL)));
    });
}

#[test]
fn lock_conflicts() {
    let seen = Arc::new(Seen::default());
    task::block_on(async {
        let m = mount(&seen).await;
        let ino = lookup(&m.kernel, "a").await;
        let fh = open(&m.kernel, ino).await;

        let held = setlk(fh, 1, LockType::Exclusive, false);
        assert_eq!(m.kernel.call(ino, held).await, Some(Ok(Response::Empty)));

        let try_read = setlk(fh, 2, LockType::Shared, false);
        assert_eq!(m.kernel.call(ino, try_read).await, Some(Err(Errno::EAGAIN)));

        let query = Operation::GetLk {
            fh,
            owner: 2,
            lock: FileLock {
                start: 10,
                end: 20,
                typ: LockType::Shared,
                pid: 12,
            },
        };
        match m.kernel.call(ino, query).await {
            Some(Ok(Response::Lock(lock))) => {
                assert_eq!(lock.typ, LockType::Exclusive);
                assert_eq!(lock.pid, 11);
            }
            other => panic!("unexpected reply: {:?}", other),
        }

        let blocked = m.kernel.submit(ino, setlk(fh, 2, LockType::Shared, true));
        let locks = Arc::clone(&m.locks);
        wait_until(|| locks.waiting(Ino::from_raw(ino)) == 1).await;
        assert_eq!(m.kernel.reply_count(blocked), 0);

        let unlock = setlk(fh, 1, LockType::Unlock, false);
        assert_eq!(m.kernel.call(ino, unlock).await, Some(Ok(Response::Empty)));
        assert_eq!(m.kernel.reply(blocked).await, Some(Ok(Response::Empty)));
        assert_eq!(m.locks.posix_locks(Ino::from_raw(ino)).len(), 1);
    });
}

#[test]
fn flush_drops_posix_locks() {
    let seen = Arc::new(Seen::default());
    task::block_on(async {
        let m = mount(&seen).await;
        let ino = lookup(&m.kernel, "a").await;
        let fh = open(&m.kernel, ino).await;

        let held = setlk(fh, 1, LockType::Exclusive, false);
        assert_eq!(m.kernel.call(ino, held).await, Some(Ok(Response::Empty)));
        let blocked = m.kernel.submit(ino, setlk(fh, 2, LockType::Exclusive, true));
        let locks = Arc::clone(&m.locks);
        wait_until(|| locks.waiting(Ino::from_raw(ino)) == 1).await;

        // a flush by another owner leaves the lock alone
        let flush = Operation::Flush { fh, lock_owner: 3 };
        assert_eq!(m.kernel.call(ino, flush).await, Some(Ok(Response::Empty)));
        assert_eq!(m.kernel.reply_count(blocked), 0);

        let flush = Operation::Flush { fh, lock_owner: 1 };
        assert_eq!(m.kernel.call(ino, flush).await, Some(Ok(Response::Empty)));
        assert_eq!(m.kernel.reply(blocked).await, Some(Ok(Response::Empty)));
        let held = m.locks.posix_locks(Ino::from_raw(ino));
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].owner, 2);
    });
}

#[test]
fn flock_waits_for_release() {
    let seen = Arc::new(Seen::default());
    task::block_on(async {
        let m = mount(&seen).await;
        let ino = lookup(&m.kernel, "a").await;
        let first = open(&m.kernel, ino).await;
        let second = open(&m.kernel, ino).await;

        let exclusive = flock(first, 1, LockType::Exclusive, true);
        assert_eq!(m.kernel.call(ino, exclusive).await, Some(Ok(Response::Empty)));
        // the owner's new request replaces its old lock
        let shared = flock(first, 1, LockType::Shared, true);
        assert_eq!(m.kernel.call(ino, shared).await, Some(Ok(Response::Empty)));
        let exclusive = flock(first, 1, LockType::Exclusive, true);
        assert_eq!(m.kernel.call(ino, exclusive).await, Some(Ok(Response::Empty)));

        let try_lock = flock(second, 2, LockType::Exclusive, true);
        assert_eq!(m.kernel.call(ino, try_lock).await, Some(Err(Errno::EAGAIN)));
        let blocked = m.kernel.submit(ino, flock(second, 2, LockType::Exclusive, false));
        let locks = Arc::clone(&m.locks);
        wait_until(|| locks.waiting(Ino::from_raw(ino)) == 1).await;

        let close = Operation::Release {
            fh: first,
            flags: libc::O_RDWR,
            lock_owner: 1,
            flush: false,
            flock_release: true,
        };
        assert_eq!(m.kernel.call(ino, close).await, Some(Ok(Response::Empty)));
        assert_eq!(m.kernel.reply(blocked).await, Some(Ok(Response::Empty)));

        let try_lock = flock(second, 1, LockType::Shared, true);
        assert_eq!(m.kernel.call(ino, try_lock).await, Some(Err(Errno::EAGAIN)));
        let unlock = flock(second, 2, LockType::Unlock, true);
        assert_eq!(m.kernel.call(ino, unlock).await, Some(Ok(Response::Empty)));
        let try_lock = flock(second, 1, LockType::Shared, true);
        assert_eq!(m.kernel.call(ino, try_lock).await, Some(Ok(Response::Empty)));
    });
}

#[test]
fn batch_forget_evicts() {
    let seen = Arc::new(Seen::default());
    task::block_on(async {
        let m = mount(&seen).await;
        let a = lookup(&m.kernel, "a").await;
        let b = lookup(&m.kernel, "b").await;
        assert_eq!(lookup(&m.kernel, "b").await, b);

        let batch = vec![
            ForgetOne {
                ino: Ino::from_raw(a),
                nlookup: 1,
            },
            ForgetOne {
                ino: Ino::from_raw(b),
                nlookup: 1,
            },
        ];
        let forget = Operation::BatchForget(batch);
        assert_eq!(m.kernel.call(0, forget).await, Some(Ok(Response::None)));

        assert!(!m.inodes.contains(Ino::from_raw(a)));
        assert_eq!(m.inodes.info(Ino::from_raw(b)).unwrap().lookups, 1);
        assert_eq!(*seen.forgotten.lock(), [FileKey(2)]);
    });
}

#[test]
fn interrupted_lock_wait() {
    let seen = Arc::new(Seen::default());
    task::block_on(async {
        let m = mount(&seen).await;
        let ino = lookup(&m.kernel, "a").await;
        let fh = open(&m.kernel, ino).await;

        let held = setlk(fh, 1, LockType::Exclusive, false);
        assert_eq!(m.kernel.call(ino, held).await, Some(Ok(Response::Empty)));

        let blocked = m.kernel.submit(ino, setlk(fh, 2, LockType::Exclusive, true));
        let locks = Arc::clone(&m.locks);
        wait_until(|| locks.waiting(Ino::from_raw(ino)) == 1).await;

        let interrupt = Operation::Interrupt { unique: blocked };
        assert_eq!(m.kernel.call(0, interrupt).await, Some(Ok(Response::None)));
        assert_eq!(m.kernel.reply(blocked).await, Some(Err(Errno::EINTR)));

        // a late interrupt of a finished request is ignored
        let interrupt = Operation::Interrupt { unique: blocked };
        assert_eq!(m.kernel.call(0, interrupt).await, Some(Ok(Response::None)));
        assert_eq!(m.kernel.reply_count(blocked), 1);
        assert_eq!(m.locks.waiting(Ino::from_raw(ino)), 0);
    });
}

#[test]
fn rename_excludes_lookup_of_the_same_name() {
    let seen = Arc::new(Seen::default());
    let (open_gate, gate) = async_std::channel::bounded(1);
    *seen.gate.lock() = Some(gate);
    task::block_on(async {
        let m = mount(&seen).await;
        let rename = m.kernel.submit(
            ROOT,
            Operation::Rename {
                name: "a".into(),
                newparent: ROOT,
                newname: "c".into(),
                flags: 0,
            },
        );
        // rename takes the gate once it holds both names
        wait_until(|| seen.gate.lock().is_none()).await;
        let racing = m.kernel.submit(ROOT, Operation::Lookup { name: "a".into() });

        // an unrelated name is not held up
        let _ = lookup(&m.kernel, "b").await;
        assert_eq!(m.kernel.reply_count(racing), 0);

        open_gate.send(()).await.unwrap();
        assert_eq!(m.kernel.reply(rename).await, Some(Ok(Response::Empty)));
        assert_eq!(m.kernel.reply(racing).await, Some(Err(Errno::ENOENT)));
        let _ = lookup(&m.kernel, "c").await;
    });
}

#[test]
fn destroy_drains_requests() {
    let seen = Arc::new(Seen::default());
    task::block_on(async {
        let m = mount(&seen).await;
        let ino = lookup(&m.kernel, "a").await;
        let fh = open(&m.kernel, ino).await;

        let held = setlk(fh, 1, LockType::Exclusive, false);
        assert_eq!(m.kernel.call(ino, held).await, Some(Ok(Response::Empty)));
        let blocked = m.kernel.submit(ino, setlk(fh, 2, LockType::Exclusive, true));
        let locks = Arc::clone(&m.locks);
        wait_until(|| locks.waiting(Ino::from_raw(ino)) == 1).await;

        let destroy = m.kernel.submit(0, Operation::Destroy);
        m.server.await.unwrap();
        assert_eq!(m.kernel.reply(blocked).await, Some(Err(Errno::EINTR)));
        assert_eq!(m.kernel.reply(destroy).await, Some(Ok(Response::Empty)));
        assert_eq!(seen.destroyed.load(Ordering::SeqCst), 1);
    });
}

#[test]
fn read_errors() {
    let seen = Arc::new(Seen::default());
    task::block_on(async {
        let m = mount(&seen).await;
        m.kernel.fail(io::Error::from_raw_os_error(libc::EINTR));
        assert_eq!(
            m.kernel.call(ROOT, Operation::StatFs).await,
            Some(Err(Errno::ENOSYS))
        );
        m.kernel.fail(io::Error::from_raw_os_error(libc::ENODEV));
        m.server.await.unwrap();
        assert_eq!(seen.destroyed.load(Ordering::SeqCst), 1);
    });

    let seen = Arc::new(Seen::default());
    task::block_on(async {
        let m = mount(&seen).await;
        m.kernel.fail(io::Error::from_raw_os_error(libc::EIO));
        let err = m.server.await.unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EIO));
        assert_eq!(seen.destroyed.load(Ordering::SeqCst), 1);
    });
}
