use std::{cell::RefCell, sync::Arc, thread, time::Duration};

use spin::Mutex;

use crate::{
    device::{BlockFile, MemDisk},
    disk::{DiskScheduler, SchedulerConfig},
    error::Error,
    fs::{
        walker::{self, SectorCache},
        BlockDevice, BufferCache, DiskInode, EasyFileSystem, File, Inode, BLOCK_SIZE,
    },
};

const FS_BLOCKS: usize = 2048;

fn fresh_fs() -> (Arc<MemDisk>, Arc<Mutex<EasyFileSystem>>) {
    let disk = Arc::new(MemDisk::new(FS_BLOCKS));
    let efs = EasyFileSystem::create(disk.clone(), FS_BLOCKS as u32, 1);
    (disk, efs)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn new_file(root: &Arc<Inode>, name: &str, content: &[u8]) -> Arc<Inode> {
    let inode = root.create(name).unwrap();
    assert_eq!(inode.write(0, content).unwrap(), content.len());
    inode
}

fn quick() -> SchedulerConfig {
    SchedulerConfig {
        service_delay: Duration::ZERO,
        idle_interval: Duration::from_millis(1),
    }
}

#[test]
fn efs_test() {
    let (_, efs) = fresh_fs();
    let root_inode = EasyFileSystem::root_inode(&efs);

    root_inode.create("filea").unwrap();
    root_inode.create("fileb").unwrap();
    assert_eq!(root_inode.ls(), vec!["filea", "fileb"]);

    let filea = root_inode.find("filea").unwrap();
    let greet_str = "Hello, world!";
    filea.write(0, greet_str.as_bytes()).unwrap();
    let mut file = File::open(Some(filea)).unwrap();
    let mut buffer = [0u8; 233];
    let len = file.read(&mut buffer);
    assert_eq!(greet_str, core::str::from_utf8(&buffer[..len]).unwrap());

    let random_str_test = |len: usize| {
        let inode = root_inode.create(&format!("rand{}", len)).unwrap();
        // random digit
        let str: String = (0..len)
            .map(|_| char::from(b'0' + rand::random::<u8>() % 10))
            .collect();
        assert_eq!(inode.write(0, str.as_bytes()).unwrap(), len);
        let mut file = File::open(Some(inode)).unwrap();
        let mut read_buffer = [0u8; 127];
        let mut read_str = String::new();
        loop {
            let len = file.read(&mut read_buffer);
            if len == 0 {
                break;
            }
            read_str.push_str(core::str::from_utf8(&read_buffer[..len]).unwrap());
        }
        assert_eq!(str, read_str);
        assert_eq!(file.tell(), len);
    };

    random_str_test(4 * BLOCK_SIZE);
    random_str_test(8 * BLOCK_SIZE + BLOCK_SIZE / 2);
    random_str_test(70 * BLOCK_SIZE + BLOCK_SIZE / 7);
    random_str_test(DiskInode::MAX_SIZE);
}

#[test]
fn create_rejects_duplicates_and_oversized_files() {
    let (_, efs) = fresh_fs();
    let root_inode = EasyFileSystem::root_inode(&efs);
    let inode = root_inode.create("dup").unwrap();
    assert!(matches!(
        root_inode.create("dup"),
        Err(Error::AlreadyExists(name)) if name == "dup"
    ));
    assert!(matches!(
        inode.write(0, &vec![0u8; DiskInode::MAX_SIZE + 1]),
        Err(Error::FileTooLarge { .. })
    ));
    assert_eq!(inode.length(), 0);
}

#[test]
fn open_rejects_unformatted_device() {
    assert!(matches!(
        EasyFileSystem::open(Arc::new(MemDisk::new(16))),
        Err(Error::BadMagic)
    ));
}

#[test]
fn missing_inode_gives_no_file() {
    let (_, efs) = fresh_fs();
    let root_inode = EasyFileSystem::root_inode(&efs);
    assert!(File::open(None).is_none());
    assert!(File::open(root_inode.find("nothing")).is_none());
}

#[test]
fn read_at_truncates_at_end_of_file() {
    let (_, efs) = fresh_fs();
    let root_inode = EasyFileSystem::root_inode(&efs);
    let content = pattern(3 * BLOCK_SIZE - 100);
    let file = File::open(Some(new_file(&root_inode, "short", &content))).unwrap();
    let len = content.len();

    let mut buf = [0u8; BLOCK_SIZE];
    assert_eq!(file.read_at(&mut buf, len - 10), 10);
    assert_eq!(&buf[..10], &content[len - 10..]);
    assert_eq!(file.inode().read_at(len - 10, &mut buf), 10);
    assert_eq!(&buf[..10], &content[len - 10..]);
    assert_eq!(file.read_at(&mut buf, len), 0);
    assert_eq!(file.read_at(&mut buf, len + 5000), 0);
    assert_eq!(file.read_at(&mut buf[..0], 0), 0);

    let empty = File::open(Some(root_inode.create("empty").unwrap())).unwrap();
    assert_eq!(empty.read_at(&mut buf, 0), 0);
}

#[test]
fn reads_cross_sector_boundaries() {
    let (_, efs) = fresh_fs();
    let root_inode = EasyFileSystem::root_inode(&efs);
    let content = pattern(3 * BLOCK_SIZE);
    let file = File::open(Some(new_file(&root_inode, "three", &content))).unwrap();

    let mut two = [0u8; 2];
    assert_eq!(file.read_at(&mut two, BLOCK_SIZE - 1), 2);
    assert_eq!(two, content[BLOCK_SIZE - 1..BLOCK_SIZE + 1]);

    let mut window = vec![0u8; 2 * BLOCK_SIZE];
    assert_eq!(file.read_at(&mut window, 100), window.len());
    assert_eq!(window, content[100..100 + 2 * BLOCK_SIZE]);
}

#[test]
fn position_moves_only_with_read_write_and_seek() {
    let (_, efs) = fresh_fs();
    let root_inode = EasyFileSystem::root_inode(&efs);
    let content = pattern(2 * BLOCK_SIZE + 10);
    let len = content.len();
    let mut file = File::open(Some(new_file(&root_inode, "pos", &content))).unwrap();

    let mut buf = [0u8; 300];
    assert_eq!(file.read(&mut buf), 300);
    assert_eq!(file.tell(), 300);
    assert_eq!(file.read_at(&mut buf, 0), 300);
    assert_eq!(file.write_at(b"xyz", 5), 3);
    assert_eq!(file.tell(), 300);

    file.seek(len - 4);
    assert_eq!(file.read(&mut buf), 4);
    assert_eq!(file.tell(), len);
    assert_eq!(file.read(&mut buf), 0);
    assert_eq!(file.tell(), len);

    // 越过文件尾的位置是合法的
    file.seek(len + 100);
    assert_eq!(file.read(&mut buf), 0);
    assert_eq!(file.tell(), len + 100);

    file.seek(1);
    assert_eq!(file.write(b"ab"), 2);
    assert_eq!(file.tell(), 3);

    let mut head = [0u8; 8];
    assert_eq!(file.read_at(&mut head, 0), 8);
    assert_eq!(
        head,
        [content[0], b'a', b'b', content[3], content[4], b'x', b'y', b'z']
    );
}

#[test]
fn write_at_never_grows_the_file() {
    let (_, efs) = fresh_fs();
    let root_inode = EasyFileSystem::root_inode(&efs);
    let content = pattern(100);
    let file = File::open(Some(new_file(&root_inode, "fixed", &content))).unwrap();

    assert_eq!(file.write_at(&[7u8; 50], 80), 20);
    assert_eq!(file.length(), 100);
    assert_eq!(file.write_at(b"x", 100), 0);
    assert_eq!(file.write_at(b"x", 5000), 0);
    assert_eq!(file.length(), 100);

    let mut buf = [0u8; 200];
    assert_eq!(file.read_at(&mut buf, 0), 100);
    assert_eq!(&buf[..80], &content[..80]);
    assert!(buf[80..100].iter().all(|&b| b == 7));
}

#[test]
fn writes_at_the_end_of_the_address_space_do_nothing() {
    let (_, efs) = fresh_fs();
    let root_inode = EasyFileSystem::root_inode(&efs);
    let content = pattern(BLOCK_SIZE + 20);
    let inode = new_file(&root_inode, "far", &content);
    let mut file = File::open(Some(Arc::clone(&inode))).unwrap();

    file.seek(usize::MAX);
    assert_eq!(file.write(b"x"), 0);
    assert_eq!(file.tell(), usize::MAX);
    assert_eq!(file.write_at(b"xyz", usize::MAX - 1), 0);
    let mut buf = [0u8; 4];
    assert_eq!(file.read(&mut buf), 0);
    assert_eq!(inode.read_at(usize::MAX - 1, &mut buf), 0);
    assert!(matches!(
        inode.write(usize::MAX - 1, b"xyz"),
        Err(Error::FileTooLarge { .. })
    ));

    assert_eq!(file.length(), content.len());
    let mut all = vec![0u8; content.len()];
    assert_eq!(file.read_at(&mut all, 0), content.len());
    assert_eq!(all, content);
}

#[test]
fn deny_write_is_counted_across_handles() {
    let (_, efs) = fresh_fs();
    let root_inode = EasyFileSystem::root_inode(&efs);
    let inode = new_file(&root_inode, "locked", b"0123456789");
    let mut f1 = File::open(Some(Arc::clone(&inode))).unwrap();
    let mut f2 = f1.reopen().unwrap();

    // 同一个文件重复 deny 只算一次
    f1.deny_write();
    f1.deny_write();
    f2.deny_write();
    assert_eq!(f2.write_at(b"ab", 0), 0);
    assert_eq!(inode.write(0, b"ab").unwrap(), 0);

    f1.allow_write();
    assert!(inode.is_write_denied());
    assert_eq!(f1.write_at(b"ab", 0), 0);

    f2.allow_write();
    assert!(!inode.is_write_denied());
    assert_eq!(f1.write_at(b"ab", 0), 2);

    let mut buf = [0u8; 10];
    f2.read(&mut buf);
    assert_eq!(&buf, b"ab23456789");
}

#[test]
fn lookups_share_one_inode_and_close_releases_denial() {
    let (_, efs) = fresh_fs();
    let root_inode = EasyFileSystem::root_inode(&efs);
    let created = root_inode.create("shared").unwrap();
    let found = root_inode.find("shared").unwrap();
    assert!(Arc::ptr_eq(&created, &found));

    let mut writer_blocker = File::open(Some(found)).unwrap();
    writer_blocker.deny_write();
    let mut other = File::open(root_inode.find("shared")).unwrap();
    other.deny_write();
    assert!(created.is_write_denied());

    writer_blocker.close();
    assert!(created.is_write_denied());
    drop(other);
    assert!(!created.is_write_denied());
}

#[test]
fn reopened_file_has_its_own_position() {
    let (_, efs) = fresh_fs();
    let root_inode = EasyFileSystem::root_inode(&efs);
    let content = pattern(BLOCK_SIZE + 1);
    let mut a = File::open(Some(new_file(&root_inode, "twice", &content))).unwrap();

    let mut buf = [0u8; 10];
    assert_eq!(a.read(&mut buf), 10);
    a.deny_write();
    let mut b = a.reopen().unwrap();
    assert_eq!(b.tell(), 0);
    a.close();

    assert!(!b.inode().is_write_denied());
    assert_eq!(b.read(&mut buf), 10);
    assert_eq!(buf, content[..10]);
}

#[test]
fn file_reads_issue_one_hint_per_sector() {
    let (disk, efs) = fresh_fs();
    let scheduler = Arc::new(DiskScheduler::new(disk, quick()));
    efs.lock().attach_scheduler(Arc::clone(&scheduler));
    let worker = scheduler.spawn().unwrap();

    let root_inode = EasyFileSystem::root_inode(&efs);
    let content = pattern(3 * BLOCK_SIZE);
    let file = File::open(Some(new_file(&root_inode, "hinted", &content))).unwrap();
    let mut buf = vec![0u8; content.len()];
    assert_eq!(file.read_at(&mut buf, 0), content.len());
    assert_eq!(buf, content);

    let stats = efs.lock().buffer_cache().stats();
    assert_eq!(stats.hints, 3);
    assert!(stats.prefetches <= 3);

    // 再读一遍, 记下每次提示的扇区: 总是刚读过的数据扇区的下一个
    let sectors: Vec<usize> = (0..3)
        .map(|i| file.inode().byte_to_sector(i * BLOCK_SIZE).unwrap())
        .collect();
    let recorder = HintRecorder {
        inner: file.inode().sector_cache().as_ref(),
        hints: RefCell::new(Vec::new()),
    };
    assert_eq!(
        walker::read_at(file.inode().as_ref(), &recorder, &mut buf, 0),
        content.len()
    );
    assert_eq!(buf, content);
    let hints = recorder.hints.into_inner();
    assert_eq!(hints, sectors.iter().map(|s| s + 1).collect::<Vec<_>>());
    // 新文件系统上数据块是连续分配的, 前两次提示正好是文件的下一个数据扇区
    assert_eq!(hints[..2], sectors[1..]);
    assert!(!sectors.contains(&hints[2]));

    scheduler.stop();
    worker.join().unwrap();
    let stats = efs.lock().buffer_cache().stats();
    assert_eq!(stats.hints, 6);
    assert_eq!(scheduler.serviced(), stats.prefetches);
}

/// 把预读提示记下来再交给真正的缓存
struct HintRecorder<'a> {
    inner: &'a BufferCache,
    hints: RefCell<Vec<usize>>,
}

impl SectorCache for HintRecorder<'_> {
    fn read_sector(&self, sector: usize, buf: &mut [u8; BLOCK_SIZE]) {
        self.inner.read_sector(sector, buf);
    }

    fn read_ahead(&self, sector: usize) {
        self.hints.borrow_mut().push(sector);
        self.inner.read_ahead(sector);
    }
}

#[test]
fn concurrent_readers_with_read_ahead() {
    let (disk, efs) = fresh_fs();
    let scheduler = Arc::new(DiskScheduler::new(disk, quick()));
    efs.lock().attach_scheduler(Arc::clone(&scheduler));
    let worker = scheduler.spawn().unwrap();

    let root_inode = EasyFileSystem::root_inode(&efs);
    let content = Arc::new(pattern(40 * BLOCK_SIZE + 77));
    let inode = new_file(&root_inode, "big", &content);

    let readers: Vec<_> = (0..4)
        .map(|i| {
            let mut file = File::open(Some(inode.reopen())).unwrap();
            let content = Arc::clone(&content);
            thread::spawn(move || {
                file.seek(i * 13);
                let mut got = Vec::new();
                let mut chunk = [0u8; 700];
                loop {
                    let len = file.read(&mut chunk);
                    if len == 0 {
                        break;
                    }
                    got.extend_from_slice(&chunk[..len]);
                }
                assert_eq!(got, content[i * 13..]);
            })
        })
        .collect();
    for reader in readers {
        reader.join().unwrap();
    }

    scheduler.stop();
    worker.join().unwrap();
    let stats = efs.lock().buffer_cache().stats();
    assert!(stats.hints >= 4 * 40);
    assert_eq!(scheduler.serviced(), stats.prefetches);
}

#[test]
fn image_file_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fs.img");
    let content = pattern(5 * BLOCK_SIZE + 3);
    {
        let block_file: Arc<dyn BlockDevice> =
            Arc::new(BlockFile::create(&path, FS_BLOCKS).unwrap());
        let efs = EasyFileSystem::create(block_file, FS_BLOCKS as u32, 1);
        let root_inode = EasyFileSystem::root_inode(&efs);
        new_file(&root_inode, "persisted", &content);
    }

    let block_file: Arc<dyn BlockDevice> = Arc::new(BlockFile::open(&path).unwrap());
    assert_eq!(block_file.num_blocks(), FS_BLOCKS);
    let efs = EasyFileSystem::open(block_file).unwrap();
    let root_inode = EasyFileSystem::root_inode(&efs);
    assert_eq!(root_inode.ls(), vec!["persisted"]);
    let mut file = File::open(root_inode.find("persisted")).unwrap();
    let mut buf = vec![0u8; content.len() + 10];
    assert_eq!(file.read(&mut buf), content.len());
    assert_eq!(&buf[..content.len()], &content[..]);
}
