//! JSON lines spoken with the presentation layer: commands on stdin, events on stdout.

use crate::{desktops::DesktopRecord, services::DesktopId};
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "command", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Command {
    RequestDesktopInfoList,
    ShowDesktop {
        id: DesktopId,
    },
    AddDesktop {
        #[serde(default)]
        position: Option<u32>,
    },
    RemoveDesktop {
        number: u32,
    },
    RenameDesktop {
        number: u32,
        name: String,
    },
    ReplaceDesktops {
        number1: u32,
        number2: u32,
    },
    Shortcut {
        action: ShortcutAction,
    },
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ShortcutAction {
    SwitchToRecentDesktop,
    AddDesktop,
    RemoveLastDesktop,
    RemoveCurrentDesktop,
    RenameCurrentDesktop,
    MoveCurrentDesktopToLeft,
    MoveCurrentDesktopToRight,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum Output {
    DesktopInfoListSent { desktops: Vec<DesktopRecord> },
    RequestRenameCurrentDesktop,
}

impl Command {
    pub fn parse(line: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(line)?)
    }
}

impl Output {
    pub fn to_line(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
