//! 一个极简的 `log` 后端: 把日志按 `[时间 级别 模块] 内容` 的格式打印到 stderr

use std::io::Write;

use chrono::Local;
use log::{Level, LevelFilter, Log, Metadata, Record};

/// 环境变量, 未通过命令行指定级别时使用
pub const LOG_ENV: &str = "EASY_DISK_LOG";

struct Logger;

static LOGGER: Logger = Logger;

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let color = match record.level() {
            Level::Error => 31, // Red
            Level::Warn => 93,  // BrightYellow
            Level::Info => 34,  // Blue
            Level::Debug => 32, // Green
            Level::Trace => 90, // BrightBlack
        };
        // stderr 加锁, 多个线程 (比如磁盘 worker) 的输出不会交错
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(
            stderr,
            "\u{1B}[{}m[{} {:>5} {}] {}\u{1B}[0m",
            color,
            Local::now().format("%H:%M:%S%.3f"),
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

/// 解析日志级别, 依次尝试命令行参数和环境变量, 都没有时为 info
pub fn parse_level(arg: Option<&str>) -> LevelFilter {
    arg.map(str::to_owned)
        .or_else(|| std::env::var(LOG_ENV).ok())
        .and_then(|s| s.parse().ok())
        .unwrap_or(LevelFilter::Info)
}

/// 安装 logger; 重复调用时只会调整级别
pub fn init(level: LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}
