use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::Level;
use tracing_appender::rolling;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::writer::MakeWriterExt;

/// Whether the global subscriber is installed already.
static IS_INIT: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Default)]
pub struct TracingFactory {
    options: TracingFactoryOptions,
}

#[derive(Debug, Clone)]
pub struct TracingFactoryOptions {
    level: Level,

    output_type: OutputType,

    log_dir: Option<String>,
}

#[derive(Debug, Clone)]
pub enum OutputType {
    STDOUT,

    LOG,
}

impl TracingFactory {
    pub fn init_log(level: Level) -> Self {
        TracingFactory::init_log_with_options(TracingFactoryOptions::new_with_level(level))
    }

    pub fn init_log_with_options(opt: TracingFactoryOptions) -> Self {
        let mut opts = opt.clone();

        if IS_INIT
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Acquire)
            .is_ok()
        {
            let format = fmt::format()
                .with_file(true)
                .with_line_number(false)
                .with_target(false)
                .with_thread_ids(true)
                .with_thread_names(true)
                .compact();

            match opts.output_type {
                OutputType::STDOUT => {
                    let _ = tracing_subscriber::fmt()
                        .with_max_level(opts.level)
                        .event_format(format)
                        .try_init();
                }
                OutputType::LOG => {
                    let dir = match &opts.log_dir {
                        None => {
                            let path = String::from("/tmp/front/logs");
                            opts.log_dir = Some(path.clone());
                            path
                        }
                        Some(dir) => dir.clone(),
                    };

                    let file_appender = rolling::daily(dir.as_str(), "server.log");
                    let merge = file_appender.and(io::stdout);

                    let _ = tracing_subscriber::fmt()
                        .with_max_level(opts.level)
                        .event_format(format)
                        .with_writer(merge)
                        .try_init();
                }
            };
        }

        TracingFactory { options: opts }
    }

    pub fn get_log_dir(&self) -> &str {
        self.options.get_log_dir()
    }
}

impl Default for TracingFactoryOptions {
    fn default() -> Self {
        TracingFactoryOptions::new_with_level(Level::INFO)
    }
}

impl TracingFactoryOptions {
    pub fn new_with_level(level: Level) -> Self {
        TracingFactoryOptions::new(level, OutputType::STDOUT, None)
    }

    pub fn new(level: Level, output_type: OutputType, log_dir: Option<String>) -> Self {
        TracingFactoryOptions {
            level,
            output_type,
            log_dir,
        }
    }

    /// Parse the `-loglevel` flag. Unknown names fall back to INFO.
    pub fn parse_level(name: &str) -> Level {
        match name.to_ascii_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" | "warning" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }

    pub fn get_log_dir(&self) -> &str {
        match self.log_dir.as_ref() {
            None => "",
            Some(dir) => dir.as_str(),
        }
    }
}
