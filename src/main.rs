use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::{
    Age, Cleanup, Criterion, Duplicate, FileSpec, LogSpecBuilder, LogSpecification, Logger,
    LoggerHandle, Naming,
};
use log::{debug, error, info, warn};
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout},
    sync::mpsc::unbounded_channel,
};
use tokio_stream::{StreamExt, wrappers::LinesStream};
use virtual_desktop_bar::{
    bar::DesktopBar,
    config::{self, BackendChoice, DEFAULT_CONFIG_FILE_PATH},
    coordinator::{ChangeCoordinator, Reaction},
    ipc::{Command, Output},
    services::{self, Backend, Notification},
};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long = "config", default_value = DEFAULT_CONFIG_FILE_PATH)]
    config_path: String,

    /// Overrides the backend from the config file.
    #[arg(short, long, value_enum)]
    backend: Option<BackendChoice>,

    /// Print the desktop list once and exit.
    #[arg(long)]
    once: bool,
}

fn start_logger(level: &str) -> Result<LoggerHandle> {
    let spec = if cfg!(debug_assertions) {
        LogSpecBuilder::new()
            .module("virtual_desktop_bar", log::LevelFilter::Info)
            .build()
    } else {
        LogSpecification::parse(level).unwrap_or_else(|_| {
            LogSpecBuilder::new()
                .module("virtual_desktop_bar", log::LevelFilter::Warn)
                .build()
        })
    };

    Logger::with(spec)
        .log_to_file(FileSpec::default().directory("/tmp/virtual-desktop-bar"))
        .duplicate_to_stderr(Duplicate::All)
        .rotate(
            Criterion::Age(Age::Day),
            Naming::Timestamps,
            Cleanup::KeepLogFiles(7),
        )
        .start()
        .context("Failed to start logger")
}

async fn write_output(stdout: &mut Stdout, output: &Output) -> Result<()> {
    let mut line = output.to_line()?;
    line.push('\n');
    stdout.write_all(line.as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = config::expand_path(&args.config_path)?;
    let mut config = config::read_config(&config_path)?;
    let _logger = start_logger(&config.log_level)?;

    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    let kind = services::probe(config.backend)?;
    info!("Detected {kind:?} backend");

    let (notification_tx, mut notifications) = unbounded_channel();
    let backend = Backend::connect(kind, &config, notification_tx).await?;

    let (output_tx, mut outputs) = unbounded_channel();
    let mut bar = DesktopBar::new(backend, config, output_tx).await;
    let mut stdout = tokio::io::stdout();

    if args.once {
        bar.broadcast().await;
        while let Ok(output) = outputs.try_recv() {
            write_output(&mut stdout, &output).await?;
        }
        return Ok(());
    }

    let (reaction_tx, mut reactions) = unbounded_channel();
    let mut coordinator = ChangeCoordinator::new(reaction_tx);

    let (config_tx, mut configs) = unbounded_channel();
    tokio::spawn(config::watch(config_path, config_tx));

    let mut commands = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    let mut stdin_open = true;
    let mut signals = Signals::new([SIGINT, SIGTERM]).context("Failed to register signals")?;

    // Bring the desktops in line with the config before the first change arrives.
    for reaction in Reaction::ALL {
        coordinator.schedule(reaction);
    }

    loop {
        tokio::select! {
            Some(notification) = notifications.recv() => {
                debug!("{notification:?}");
                if notification == Notification::CurrentDesktopChanged {
                    bar.update_current().await;
                }
                coordinator.notify(notification);
            }
            Some(reaction) = reactions.recv() => {
                coordinator.begin(reaction);
                bar.react(reaction).await;
            }
            Some(config) = configs.recv() => {
                info!("Config reloaded");
                for reaction in bar.set_config(config) {
                    coordinator.schedule(reaction);
                }
            }
            Some(output) = outputs.recv() => {
                write_output(&mut stdout, &output).await?;
            }
            line = commands.next(), if stdin_open => match line {
                Some(Ok(line)) if line.trim().is_empty() => {}
                Some(Ok(line)) => match Command::parse(&line) {
                    Ok(command) => bar.handle(command).await,
                    Err(e) => warn!("Ignoring malformed command {line:?}: {e}"),
                },
                Some(Err(e)) => {
                    error!("Failed to read stdin, no longer accepting commands: {e}");
                    stdin_open = false;
                }
                None => {
                    info!("stdin closed, no longer accepting commands");
                    stdin_open = false;
                }
            },
            Some(signal) = signals.next() => {
                info!("Received signal {signal}, exiting");
                break;
            }
        }
    }

    Ok(())
}
