use std::{fs::OpenOptions, path::PathBuf};

use clap::ValueEnum;
use tracing::Level;
use tracing_subscriber::{filter::FromEnvError, fmt, EnvFilter, Layer};

#[derive(Clone, Debug, Copy, ValueEnum, PartialEq)]
pub enum LogOutput {
    Console,
    Json,
    None,
}

pub struct LoggingBuilder {
    output: LogOutput,
    level: Level,
    write_logs_file: Option<PathBuf>,
}

impl Default for LoggingBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggingBuilder {
    pub fn new() -> Self {
        Self {
            output: LogOutput::Console,
            level: Level::INFO,
            write_logs_file: None,
        }
    }

    /// Set the log output format
    pub fn with_output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    /// Set the log level
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Set the log file path (optional)
    pub fn with_log_file<P: Into<Option<PathBuf>>>(mut self, path: P) -> Self {
        self.write_logs_file = path.into();
        self
    }

    pub fn init(self) -> anyhow::Result<()> {
        use tracing_subscriber::layer::SubscriberExt;

        let level = self.level;
        let output_logs_filter = EnvFilter::builder()
            .with_default_directive(level.into())
            .from_env()?;

        // the file gets its own filter so WRITE_RUST_LOG can make it more verbose
        let make_detailed_logs_filter = || -> Result<EnvFilter, FromEnvError> {
            if std::env::var("WRITE_RUST_LOG").is_ok() {
                EnvFilter::builder()
                    .with_env_var("WRITE_RUST_LOG")
                    .from_env()
            } else {
                EnvFilter::builder()
                    .with_default_directive(level.into())
                    .from_env()
            }
        };

        let mut layers: Vec<Box<dyn tracing_subscriber::Layer<_> + Send + Sync>> = Vec::new();

        match self.output {
            LogOutput::Console => layers.push(
                fmt::layer()
                    .with_writer(std::io::stdout)
                    .with_thread_names(true)
                    .with_filter(output_logs_filter)
                    .boxed(),
            ),
            LogOutput::Json => layers.push(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stdout)
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_filter(output_logs_filter)
                    .boxed(),
            ),
            LogOutput::None => {}
        }

        if let Some(log_file_path) = self.write_logs_file {
            if let Some(parent) = log_file_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let log_file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(log_file_path)?;

            layers.push(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(log_file)
                    .with_filter(make_detailed_logs_filter()?)
                    .boxed(),
            );
        }

        let subscriber = tracing_subscriber::registry().with(layers);
        tracing::subscriber::set_global_default(subscriber)?;
        Ok(())
    }
}

/// Create a new logging builder
pub fn logging() -> LoggingBuilder {
    LoggingBuilder::new()
}
