use anyhow::{Context, Result};
use inotify::{EventMask, Inotify, WatchMask};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{sync::mpsc::UnboundedSender, time::sleep};
use tokio_stream::StreamExt;

use crate::coordinator::Reaction;

pub const DEFAULT_CONFIG_FILE_PATH: &str = "~/.config/virtual-desktop-bar.toml";

#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendChoice {
    #[default]
    Auto,
    Legacy,
    Modern,
}

#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct WindowNameSubstitution {
    /// Regular expression matched against the window class.
    pub pattern: String,
    pub name: String,
}

impl WindowNameSubstitution {
    fn new(pattern: &str, name: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            name: name.to_string(),
        }
    }
}

fn default_window_name_substitutions() -> Vec<WindowNameSubstitution> {
    vec![
        WindowNameSubstitution::new("Gimp-*.", "GIMP"),
        WindowNameSubstitution::new("dolphin", "Dolphin"),
        WindowNameSubstitution::new("kate", "Kate"),
        WindowNameSubstitution::new("konsole", "Konsole"),
        WindowNameSubstitution::new("ksysguard", "KSysGuard"),
        WindowNameSubstitution::new("lattedock", "Latte Dock"),
        WindowNameSubstitution::new("libreoffice-*", "LibreOffice"),
        WindowNameSubstitution::new("okular", "Okular"),
        WindowNameSubstitution::new("systemsettings", "Settings"),
    ]
}

fn default_log_level() -> String {
    "warn".to_owned()
}

fn default_new_desktop_name() -> String {
    "New Desktop".to_owned()
}

fn default_handshake_timeout_ms() -> u64 {
    5000
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    /// Label given to desktops without windows. Empty disables renaming.
    pub empty_desktops_rename_as: String,
    /// Shell command run after a desktop is added. Empty disables it.
    pub adding_desktops_execute_command: String,
    pub dynamic_desktops_enable: bool,
    pub multiple_screens_filter_occupied_desktops: bool,
    pub new_desktop_name: String,
    pub window_name_substitutions: Vec<WindowNameSubstitution>,
    pub backend: BackendChoice,
    pub handshake_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            empty_desktops_rename_as: String::new(),
            adding_desktops_execute_command: String::new(),
            dynamic_desktops_enable: false,
            multiple_screens_filter_occupied_desktops: false,
            new_desktop_name: default_new_desktop_name(),
            window_name_substitutions: default_window_name_substitutions(),
            backend: BackendChoice::default(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

impl Config {
    /// Reactions owed to a change from `previous` to `self`.
    pub fn reactions_since(&self, previous: &Config) -> Vec<Reaction> {
        let mut reactions = Vec::new();

        if self.empty_desktops_rename_as != previous.empty_desktops_rename_as {
            reactions.push(Reaction::RenameCheck);
        }
        if self.dynamic_desktops_enable != previous.dynamic_desktops_enable {
            reactions.push(Reaction::AddCheck);
            reactions.push(Reaction::RemoveCheck);
        }
        if self.multiple_screens_filter_occupied_desktops
            != previous.multiple_screens_filter_occupied_desktops
            || self.window_name_substitutions != previous.window_name_substitutions
        {
            reactions.push(Reaction::Broadcast);
        }

        reactions
    }
}

pub fn expand_path(path: &str) -> Result<PathBuf> {
    Ok(shellexpand::full(path)
        .with_context(|| format!("Failed to expand config path {path}"))?
        .into_owned()
        .into())
}

pub fn read_config(path: &Path) -> Result<Config> {
    match fs::read_to_string(path) {
        Ok(content) => {
            log::info!("Reading config file {path:?}");
            parse_config(&content).with_context(|| format!("Invalid config file {path:?}"))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::info!("No config file at {path:?}, using defaults");
            Ok(Config::default())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to read config file {path:?}")),
    }
}

fn parse_config(content: &str) -> Result<Config> {
    Ok(toml::from_str(content)?)
}

/// Watches the config file and sends every successfully parsed version.
///
/// A deleted file falls back to the defaults. The task ends when the receiver
/// is dropped.
pub async fn watch(path: PathBuf, output: UnboundedSender<Config>) {
    let Some(file_name) = path.file_name().map(|n| n.to_os_string()) else {
        log::error!("Config path {path:?} has no file name, not watching it");
        return;
    };
    let Some(parent) = path.parent().map(Path::to_path_buf) else {
        log::error!("Config path {path:?} has no parent directory, not watching it");
        return;
    };

    loop {
        let inotify = match Inotify::init() {
            Ok(inotify) => inotify,
            Err(e) => {
                log::error!("Failed to initialize inotify: {e}");
                return;
            }
        };

        let added = if path.exists() {
            log::debug!("watch path {path:?}");
            inotify.watches().add(
                &path,
                WatchMask::MODIFY
                    .union(WatchMask::CLOSE_WRITE)
                    .union(WatchMask::DELETE_SELF)
                    .union(WatchMask::MOVE_SELF),
            )
        } else {
            log::info!("watch directory {parent:?}");
            inotify.watches().add(
                &parent,
                WatchMask::CREATE
                    .union(WatchMask::MOVED_TO)
                    .union(WatchMask::MOVE_SELF),
            )
        };
        if let Err(e) = added {
            log::error!("Failed to add config watch: {e}");
            return;
        }

        let mut buffer = [0; 1024];
        let mut stream = match inotify.into_event_stream(&mut buffer) {
            Ok(stream) => stream,
            Err(e) => {
                log::error!("Failed to create inotify event stream: {e}");
                return;
            }
        };

        loop {
            log::debug!("waiting for config event");
            let reloaded = match stream.next().await {
                Some(Ok(inotify::Event {
                    mask: EventMask::CREATE | EventMask::MOVED_TO,
                    name: Some(name),
                    ..
                })) if name == file_name => {
                    log::info!("Config file created");
                    Some(read_config(&path))
                }
                Some(Ok(inotify::Event {
                    mask: EventMask::MODIFY | EventMask::CLOSE_WRITE | EventMask::MOVE_SELF,
                    ..
                })) if path.exists() => {
                    log::info!("Config file modified");
                    // Editors write in several steps.
                    sleep(Duration::from_millis(500)).await;
                    Some(read_config(&path))
                }
                Some(Ok(inotify::Event {
                    mask: EventMask::DELETE_SELF | EventMask::MOVE_SELF,
                    ..
                })) => {
                    log::info!("Config file deleted");
                    Some(Ok(Config::default()))
                }
                Some(Err(e)) => {
                    log::warn!("inotify error: {e}");
                    None
                }
                None => return,
                other => {
                    log::debug!("other event {other:?}");
                    continue;
                }
            };

            match reloaded {
                Some(Ok(config)) => {
                    if output.send(config).is_err() {
                        return;
                    }
                }
                Some(Err(e)) => log::warn!("Keeping previous config: {e:#}"),
                None => {}
            }

            // Re-arm the watch, the file may have been replaced.
            break;
        }
    }
}
