use std::{
    fs::{read_dir, File as HostFile},
    io::{Read, Write},
    sync::Arc,
    time::Duration,
};

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use log::{error, info, warn};
use rand::Rng;
use spin::Mutex;

use device::BlockFile;
use disk::{Deadline, DiskScheduler, SchedulerConfig, SectorBuf};
use error::{Error, Result};
use fs::{BlockDevice, EasyFileSystem, File, BLOCK_SIZE};

mod device;
mod disk;
mod error;
mod fs;
mod logger;
#[cfg(test)]
mod test;

/// 镜像的扇区数
const BLOCK_NUM: usize = 0x4000;
const IMAGE_NAME: &str = "fs.img";

fn cli() -> Command {
    let image = Arg::new("image")
        .short('i')
        .long("image")
        .required(true)
        .help("Disk image file");
    Command::new("easy-disk")
        .about("EasyFileSystem packer with a deadline-ordered disk scheduler")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .global(true)
                .help("error, warn, info, debug or trace (default: $EASY_DISK_LOG or info)"),
        )
        .arg(
            Arg::new("service-delay")
                .long("service-delay")
                .global(true)
                .value_parser(value_parser!(u64))
                .help("Simulated service time of one disk request, in ms"),
        )
        .arg(
            Arg::new("idle-interval")
                .long("idle-interval")
                .global(true)
                .value_parser(value_parser!(u64))
                .help("Disk worker sleep when the queue is empty, in ms"),
        )
        .subcommand(
            Command::new("pack")
                .about("Pack every file of a host directory into a new image")
                .arg(
                    Arg::new("source")
                        .short('s')
                        .long("source")
                        .required(true)
                        .help("Source dir (with backslash '/')"),
                )
                .arg(
                    Arg::new("target")
                        .short('t')
                        .long("target")
                        .required(true)
                        .help("Target dir (with backslash '/') where fs.img is written"),
                ),
        )
        .subcommand(
            Command::new("ls")
                .about("List the files of an image")
                .arg(image.clone()),
        )
        .subcommand(
            Command::new("cat")
                .about("Read a file through a file handle, with read-ahead")
                .arg(image.clone())
                .arg(
                    Arg::new("name")
                        .short('n')
                        .long("name")
                        .required(true)
                        .help("File name inside the image"),
                )
                .arg(
                    Arg::new("offset")
                        .long("offset")
                        .value_parser(value_parser!(usize))
                        .default_value("0"),
                )
                .arg(
                    Arg::new("len")
                        .long("len")
                        .value_parser(value_parser!(usize))
                        .help("Bytes to read (default: up to end of file)"),
                )
                .arg(
                    Arg::new("no-read-ahead")
                        .long("no-read-ahead")
                        .action(ArgAction::SetTrue)
                        .help("Read through the inode directly, without read-ahead hints"),
                ),
        )
        .subcommand(
            Command::new("schedule")
                .about("Submit random read requests and service them in deadline order")
                .arg(image)
                .arg(
                    Arg::new("requests")
                        .short('r')
                        .long("requests")
                        .value_parser(value_parser!(usize))
                        .default_value("16"),
                )
                .arg(
                    Arg::new("inline")
                        .long("inline")
                        .action(ArgAction::SetTrue)
                        .help("Service the queue on this thread instead of a disk worker"),
                ),
        )
}

fn main() {
    let matches = cli().get_matches();
    logger::init(logger::parse_level(
        matches.get_one::<String>("log-level").map(String::as_str),
    ));
    if let Err(err) = run(&matches) {
        error!("{}", err);
        std::process::exit(1);
    }
}

fn run(matches: &ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some(("pack", m)) => easy_fs_pack(m),
        Some(("ls", m)) => ls(m),
        Some(("cat", m)) => cat(m),
        Some(("schedule", m)) => schedule(m),
        _ => unreachable!("clap requires a subcommand"),
    }
}

fn scheduler_config(matches: &ArgMatches) -> SchedulerConfig {
    let mut config = SchedulerConfig::default();
    if let Some(ms) = matches.get_one::<u64>("service-delay") {
        config.service_delay = Duration::from_millis(*ms);
    }
    if let Some(ms) = matches.get_one::<u64>("idle-interval") {
        config.idle_interval = Duration::from_millis(*ms);
    }
    config
}

fn arg<'a>(matches: &'a ArgMatches, id: &str) -> &'a str {
    matches.get_one::<String>(id).map(String::as_str).unwrap_or_default()
}

fn easy_fs_pack(matches: &ArgMatches) -> Result<()> {
    let src_path = arg(matches, "source");
    let target_path = arg(matches, "target");
    info!("src_path: {}, target_path: {}", src_path, target_path);

    // 在 target 目录下新建一个 BLOCK_NUM 个扇区的镜像文件, 作为虚拟块设备
    let block_file: Arc<dyn BlockDevice> = Arc::new(BlockFile::create(
        format!("{}{}", target_path, IMAGE_NAME),
        BLOCK_NUM,
    )?);
    let efs = EasyFileSystem::create(Arc::clone(&block_file), BLOCK_NUM as u32, 1);
    let root_inode = EasyFileSystem::root_inode(&efs);

    for dir_entry in read_dir(src_path)? {
        let dir_entry = dir_entry?;
        if !dir_entry.file_type()?.is_file() {
            continue;
        }
        let name = dir_entry.file_name().to_string_lossy().into_owned();
        let mut all_data: Vec<u8> = Vec::new();
        HostFile::open(dir_entry.path())?.read_to_end(&mut all_data)?;
        let inode = root_inode.create(&name)?;
        match inode.write(0, &all_data) {
            Ok(written) => info!("packed {} ({} B)", name, written),
            Err(err @ Error::FileTooLarge { .. }) => warn!("{} left empty: {}", name, err),
            Err(err) => return Err(err),
        }
    }

    for app in root_inode.ls() {
        println!("{}", app);
    }
    Ok(())
}

fn open_image(matches: &ArgMatches) -> Result<(Arc<dyn BlockDevice>, Arc<Mutex<EasyFileSystem>>)> {
    let block_file: Arc<dyn BlockDevice> = Arc::new(BlockFile::open(arg(matches, "image"))?);
    let efs = EasyFileSystem::open(Arc::clone(&block_file))?;
    Ok((block_file, efs))
}

fn ls(matches: &ArgMatches) -> Result<()> {
    let (_, efs) = open_image(matches)?;
    let root_inode = EasyFileSystem::root_inode(&efs);
    for name in root_inode.ls() {
        let len = root_inode.find(&name).map_or(0, |inode| inode.length());
        println!("{:>8} {}", len, name);
    }
    Ok(())
}

fn cat(matches: &ArgMatches) -> Result<()> {
    let (block_file, efs) = open_image(matches)?;
    let scheduler = Arc::new(DiskScheduler::new(block_file, scheduler_config(matches)));
    efs.lock().attach_scheduler(Arc::clone(&scheduler));
    let worker = scheduler.spawn()?;

    let name = arg(matches, "name");
    let root_inode = EasyFileSystem::root_inode(&efs);
    let inode = root_inode
        .find(name)
        .ok_or_else(|| Error::NotFound(name.to_string()))?;
    if inode.is_dir() {
        return Err(Error::NotAFile);
    }
    let offset = matches.get_one::<usize>("offset").copied().unwrap_or(0);
    let mut left = matches
        .get_one::<usize>("len")
        .copied()
        .unwrap_or_else(|| inode.length().saturating_sub(offset));

    let mut stdout = std::io::stdout().lock();
    let mut buf = [0u8; 4 * BLOCK_SIZE];
    if matches.get_flag("no-read-ahead") {
        // 直接经由 inode 读取, 不经过扇区遍历, 也就没有预读提示
        let mut pos = offset;
        while left > 0 {
            let len = inode.read_at(pos, &mut buf[..left.min(4 * BLOCK_SIZE)]);
            if len == 0 {
                break;
            }
            stdout.write_all(&buf[..len])?;
            pos += len;
            left -= len;
        }
    } else {
        let mut file = File::open(Some(inode)).ok_or_else(|| Error::NotFound(name.to_string()))?;
        file.seek(offset);
        while left > 0 {
            let len = file.read(&mut buf[..left.min(4 * BLOCK_SIZE)]);
            if len == 0 {
                break;
            }
            stdout.write_all(&buf[..len])?;
            left -= len;
        }
        info!(
            "read {} B of inode {}, now at {}",
            file.tell() - offset,
            file.inode().inode_id(),
            file.tell()
        );
        file.close();
    }
    stdout.flush()?;

    scheduler.stop();
    if worker.join().is_err() {
        error!("disk worker panicked");
    }
    info!("{:?}", efs.lock().buffer_cache().stats());
    Ok(())
}

fn schedule(matches: &ArgMatches) -> Result<()> {
    let block_file: Arc<dyn BlockDevice> = Arc::new(BlockFile::open(arg(matches, "image"))?);
    let blocks = block_file.num_blocks();
    let count = matches.get_one::<usize>("requests").copied().unwrap_or(16);
    if blocks == 0 {
        warn!("image is empty, nothing to schedule");
        return Ok(());
    }
    let scheduler = Arc::new(DiskScheduler::new(block_file, scheduler_config(matches)));

    let mut rng = rand::thread_rng();
    let mut bufs = Vec::with_capacity(count);
    for _ in 0..count {
        let sector = rng.gen_range(0..blocks);
        let deadline: Deadline = rng.gen_range(0..1000);
        let buf = Arc::new(SectorBuf::new());
        scheduler.schedule_request(sector, false, Arc::clone(&buf), deadline)?;
        info!("submitted read of sector {} with deadline {}", sector, deadline);
        bufs.push(buf);
    }

    info!("{} requests queued", scheduler.len());
    if matches.get_flag("inline") {
        scheduler.stop();
        while scheduler.service_one() {}
    } else {
        let worker = scheduler.spawn()?;
        scheduler.stop();
        if worker.join().is_err() {
            error!("disk worker panicked");
        }
    }
    debug_assert!(scheduler.is_empty());
    info!(
        "serviced {} requests, {} completed buffers",
        scheduler.serviced(),
        bufs.iter().filter(|buf| buf.is_done()).count()
    );
    Ok(())
}
