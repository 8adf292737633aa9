//! Coalesces bursts of window manager notifications.
//!
//! Each reaction kind has its own pending flag. Scheduling an already pending
//! reaction does nothing. The flag is cleared right before the reaction runs,
//! so changes caused by the reaction itself schedule a fresh run.

use crate::services::Notification;
use std::{collections::HashSet, time::Duration};
use tokio::sync::mpsc::UnboundedSender;

const DEFER: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reaction {
    Broadcast,
    AddCheck,
    RemoveCheck,
    RenameCheck,
}

impl Reaction {
    pub const ALL: [Reaction; 4] = [
        Reaction::AddCheck,
        Reaction::RemoveCheck,
        Reaction::RenameCheck,
        Reaction::Broadcast,
    ];

    pub fn for_notification(notification: Notification) -> &'static [Reaction] {
        match notification {
            Notification::CurrentDesktopChanged | Notification::DesktopNamesChanged => {
                &[Reaction::Broadcast]
            }
            Notification::DesktopCountChanged | Notification::WindowStateChanged => &Self::ALL,
        }
    }
}

pub struct ChangeCoordinator {
    pending: HashSet<Reaction>,
    fire: UnboundedSender<Reaction>,
}

impl ChangeCoordinator {
    /// Due reactions are posted to `fire`. Once its receiver is gone they are dropped.
    pub fn new(fire: UnboundedSender<Reaction>) -> Self {
        Self {
            pending: HashSet::new(),
            fire,
        }
    }

    pub fn notify(&mut self, notification: Notification) {
        for reaction in Reaction::for_notification(notification) {
            self.schedule(*reaction);
        }
    }

    /// Returns false when the reaction was already pending.
    pub fn schedule(&mut self, reaction: Reaction) -> bool {
        if !self.pending.insert(reaction) {
            return false;
        }

        let fire = self.fire.clone();
        tokio::spawn(async move {
            tokio::time::sleep(DEFER).await;
            if fire.send(reaction).is_err() {
                log::debug!("Dropping {reaction:?}, event loop is gone");
            }
        });
        true
    }

    /// Call with each reaction received from the channel, before running it.
    pub fn begin(&mut self, reaction: Reaction) {
        self.pending.remove(&reaction);
    }

    pub fn is_pending(&self, reaction: Reaction) -> bool {
        self.pending.contains(&reaction)
    }
}
