//! The desktop bar core: directory queries, mutations and the dynamic desktop policies.
//!
//! Nothing here caches window manager state except the current and most
//! recent desktop. Every decision re-reads the desktops and windows first.
//! Public operations never fail: a failed call is logged and treated as not
//! applied.

use crate::{
    config::Config,
    coordinator::Reaction,
    desktops::{self, DesktopRecord, WindowNames},
    ipc::{Command, Output, ShortcutAction},
    services::{DesktopId, Rect, WindowManager, WindowRecord},
    utils::launcher,
};
use anyhow::Result;
use log::{debug, error, info, warn};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

const ON_ADD_COMMAND_DELAY: Duration = Duration::from_millis(100);

pub struct DesktopBar<W> {
    wm: W,
    config: Config,
    names: WindowNames,
    output: UnboundedSender<Output>,
    current: Option<DesktopId>,
    most_recent: Option<DesktopId>,
}

impl<W: WindowManager> DesktopBar<W> {
    pub async fn new(wm: W, config: Config, output: UnboundedSender<Output>) -> Self {
        let current = wm.current_desktop().await.unwrap_or_else(|e| {
            warn!("Failed to read the current desktop: {e:#}");
            None
        });

        Self {
            names: WindowNames::new(&config.window_name_substitutions),
            wm,
            config,
            output,
            most_recent: current.clone(),
            current,
        }
    }

    pub fn window_manager(&self) -> &W {
        &self.wm
    }

    /// Swaps in a reloaded config and returns the reactions it calls for.
    pub fn set_config(&mut self, config: Config) -> Vec<Reaction> {
        let reactions = config.reactions_since(&self.config);
        if config.window_name_substitutions != self.config.window_name_substitutions {
            self.names = WindowNames::new(&config.window_name_substitutions);
        }
        self.config = config;
        reactions
    }

    pub async fn list_desktops(&self, detail: bool) -> Vec<DesktopRecord> {
        self.try_list_desktops(detail).await.unwrap_or_else(|e| {
            warn!("Failed to list desktops: {e:#}");
            Vec::new()
        })
    }

    async fn try_list_desktops(&self, detail: bool) -> Result<Vec<DesktopRecord>> {
        let kind = self.wm.kind();
        let current = self.wm.current_desktop().await?;
        let mut records = self
            .wm
            .desktops()
            .await?
            .into_iter()
            .map(|entry| DesktopRecord::from_entry(kind, entry, current.as_ref()))
            .collect::<Vec<_>>();

        if detail {
            let stacking = self.wm.stacking_order().await?;
            let screen = self.screen_filter().await;
            for record in &mut records {
                let census = desktops::census(&stacking, &record.id, screen.as_ref());
                record.fill_windows(&census, &self.names, kind);
            }
        }

        Ok(records)
    }

    async fn screen_filter(&self) -> Option<Rect> {
        if !self.config.multiple_screens_filter_occupied_desktops {
            return None;
        }

        self.wm.primary_screen().await.unwrap_or_else(|e| {
            warn!("Failed to read the primary screen, not filtering: {e:#}");
            None
        })
    }

    pub async fn lookup_by_index(&self, number: u32) -> Option<DesktopRecord> {
        self.list_desktops(false)
            .await
            .into_iter()
            .find(|d| d.number == number)
    }

    pub async fn lookup_by_id(&self, id: &DesktopId) -> Option<DesktopRecord> {
        self.list_desktops(false)
            .await
            .into_iter()
            .find(|d| d.id == *id)
    }

    /// Windows counted on `desktop`, top-most first.
    pub async fn list_windows(
        &self,
        desktop: &DesktopId,
        ignore_screen_filter: bool,
    ) -> Vec<WindowRecord> {
        let stacking = match self.wm.stacking_order().await {
            Ok(stacking) => stacking,
            Err(e) => {
                warn!("Failed to read the stacking order: {e:#}");
                return Vec::new();
            }
        };
        let screen = if ignore_screen_filter {
            None
        } else {
            self.screen_filter().await
        };

        desktops::census(&stacking, desktop, screen.as_ref())
    }

    pub async fn empty_desktops(&self, strict: bool) -> Vec<u32> {
        match self.snapshot_empty(strict).await {
            Ok((_, empty)) => empty,
            Err(e) => {
                warn!("Failed to compute empty desktops: {e:#}");
                Vec::new()
            }
        }
    }

    async fn snapshot_empty(&self, strict: bool) -> Result<(Vec<DesktopRecord>, Vec<u32>)> {
        let desktops = self.try_list_desktops(false).await?;
        let stacking = self.wm.stacking_order().await?;
        let empty = desktops::empty_desktops(&desktops, &stacking, strict);
        Ok((desktops, empty))
    }

    pub async fn show(&self, id: &DesktopId) {
        if let Err(e) = self.wm.activate_desktop(id).await {
            warn!("Failed to show desktop {id}: {e:#}");
        }
    }

    /// Creates a desktop at the 1-based `position`, or after the last one.
    pub async fn add(&self, position: Option<u32>) {
        let number = match position.filter(|p| *p > 0) {
            Some(number) => number,
            None => match self.wm.desktops().await {
                Ok(desktops) => desktops.len() as u32 + 1,
                Err(e) => {
                    warn!("Failed to count desktops: {e:#}");
                    return;
                }
            },
        };

        let name = &self.config.new_desktop_name;
        if let Err(e) = self
            .wm
            .create_desktop(self.wm.kind().position(number), name)
            .await
        {
            warn!("Failed to add desktop {name:?} at {number}: {e:#}");
            return;
        }
        info!("Added desktop {name:?} at {number}");

        let command = &self.config.adding_desktops_execute_command;
        if !command.is_empty() {
            launcher::execute_detached(command, ON_ADD_COMMAND_DELAY);
        }
    }

    pub async fn remove(&self, number: u32) {
        let desktops = self.list_desktops(false).await;
        if desktops.len() <= 1 {
            info!("Refusing to remove the last desktop");
            return;
        }

        match desktops.iter().find(|d| d.number == number) {
            Some(desktop) => self.remove_desktop(desktop).await,
            None => debug!("No desktop {number} to remove"),
        }
    }

    async fn remove_desktop(&self, desktop: &DesktopRecord) {
        match self.wm.remove_desktop(&desktop.id).await {
            Ok(()) => info!("Removed desktop {} ({:?})", desktop.number, desktop.name),
            Err(e) => warn!("Failed to remove desktop {}: {e:#}", desktop.number),
        }
    }

    pub async fn rename(&self, number: u32, name: &str) {
        match self.lookup_by_index(number).await {
            Some(desktop) => self.rename_desktop(&desktop.id, name).await,
            None => debug!("No desktop {number} to rename"),
        }
    }

    async fn rename_desktop(&self, id: &DesktopId, name: &str) {
        let Err(e) = self.wm.rename_desktop(id, name).await else {
            return;
        };

        // Known gap: the window manager may restore the old name later.
        warn!("Renaming desktop {id} failed ({e:#}), writing EWMH desktop names instead");
        if let Err(e) = self.wm.rename_desktop_fallback(id, name).await {
            error!("Fallback rename of desktop {id} failed: {e:#}");
        }
    }

    /// Exchanges the windows and names of two desktops.
    ///
    /// The steps are independent calls. A failure midway leaves the desktops
    /// partly swapped; there is no rollback.
    pub async fn swap(&self, number1: u32, number2: u32) {
        if number1 == number2 {
            return;
        }

        let desktops = match self.try_list_desktops(false).await {
            Ok(desktops) => desktops,
            Err(e) => {
                warn!("Failed to list desktops for swap: {e:#}");
                return;
            }
        };
        let find = |number| desktops.iter().find(|d| d.number == number);
        let (Some(desktop1), Some(desktop2)) = (find(number1), find(number2)) else {
            debug!("Ignoring swap of {number1} and {number2}, out of range");
            return;
        };

        // Both censuses before anything moves.
        let stacking = match self.wm.stacking_order().await {
            Ok(stacking) => stacking,
            Err(e) => {
                warn!("Failed to read the stacking order for swap: {e:#}");
                return;
            }
        };
        let mut windows1 = movable_windows(&stacking, &desktop1.id);
        let mut windows2 = movable_windows(&stacking, &desktop2.id);
        // Windows on both desktops already end up where they belong.
        let shared = windows1
            .iter()
            .filter(|w| windows2.iter().any(|other| other.id == w.id))
            .map(|w| w.id.clone())
            .collect::<Vec<_>>();
        windows1.retain(|w| !shared.contains(&w.id));
        windows2.retain(|w| !shared.contains(&w.id));

        if desktop1.is_current {
            self.show(&desktop2.id).await;
        } else if desktop2.is_current {
            self.show(&desktop1.id).await;
        }

        for window in &windows2 {
            self.move_window(window, &desktop2.id, &desktop1.id).await;
        }
        for window in &windows1 {
            self.move_window(window, &desktop1.id, &desktop2.id).await;
        }

        self.rename_desktop(&desktop1.id, &desktop2.name).await;
        self.rename_desktop(&desktop2.id, &desktop1.name).await;
        info!("Swapped desktops {number1} and {number2}");
    }

    async fn move_window(&self, window: &WindowRecord, from: &DesktopId, to: &DesktopId) {
        if let Err(e) = self.wm.move_window(&window.id, from, to).await {
            warn!("Failed to move window {} to desktop {to}: {e:#}", window.id);
        }
    }

    /// Adds a desktop when every desktop holds a window.
    pub async fn try_add_empty_desktop(&self) {
        if !self.config.dynamic_desktops_enable {
            return;
        }

        match self.snapshot_empty(false).await {
            Ok((_, empty)) if empty.is_empty() => self.add(None).await,
            Ok(_) => {}
            Err(e) => warn!("Skipping add check: {e:#}"),
        }
    }

    /// Removes every empty desktop but the first one.
    pub async fn try_remove_empty_desktops(&self) {
        if !self.config.dynamic_desktops_enable {
            return;
        }

        let (desktops, empty) = match self.snapshot_empty(false).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Skipping remove check: {e:#}");
                return;
            }
        };

        // Highest first, so the lower display indexes stay valid.
        for number in empty.iter().skip(1).rev() {
            if let Some(desktop) = desktops.iter().find(|d| d.number == *number) {
                self.remove_desktop(desktop).await;
            }
        }
    }

    pub async fn try_rename_empty_desktops(&self) {
        let label = &self.config.empty_desktops_rename_as;
        if label.is_empty() {
            return;
        }

        let (desktops, empty) = match self.snapshot_empty(true).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Skipping rename check: {e:#}");
                return;
            }
        };

        for desktop in desktops
            .iter()
            .filter(|d| empty.contains(&d.number) && d.name != *label)
        {
            self.rename_desktop(&desktop.id, label).await;
        }
    }

    /// Remembers the previous desktop whenever the current one changes.
    pub async fn update_current(&mut self) {
        match self.wm.current_desktop().await {
            Ok(current) if current != self.current => {
                if let Some(previous) = std::mem::replace(&mut self.current, current) {
                    self.most_recent = Some(previous);
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to read the current desktop: {e:#}"),
        }
    }

    pub fn most_recent(&self) -> Option<&DesktopId> {
        self.most_recent.as_ref()
    }

    pub async fn broadcast(&self) {
        let desktops = self.list_desktops(true).await;
        self.emit(Output::DesktopInfoListSent { desktops });
    }

    fn emit(&self, output: Output) {
        if self.output.send(output).is_err() {
            debug!("Output closed, dropping event");
        }
    }

    async fn current_number(&self) -> Option<u32> {
        self.list_desktops(false)
            .await
            .into_iter()
            .find(|d| d.is_current)
            .map(|d| d.number)
    }

    pub async fn shortcut(&self, action: ShortcutAction) {
        debug!("Shortcut {action:?}");

        match action {
            ShortcutAction::SwitchToRecentDesktop => {
                if let Some(id) = &self.most_recent {
                    self.show(id).await;
                }
            }
            ShortcutAction::AddDesktop => self.add(None).await,
            ShortcutAction::RemoveLastDesktop => {
                let count = self.list_desktops(false).await.len() as u32;
                self.remove(count).await;
            }
            ShortcutAction::RemoveCurrentDesktop => {
                if let Some(number) = self.current_number().await {
                    self.remove(number).await;
                }
            }
            ShortcutAction::RenameCurrentDesktop => self.emit(Output::RequestRenameCurrentDesktop),
            ShortcutAction::MoveCurrentDesktopToLeft => {
                if let Some(number) = self.current_number().await {
                    self.swap(number, number - 1).await;
                }
            }
            ShortcutAction::MoveCurrentDesktopToRight => {
                if let Some(number) = self.current_number().await {
                    self.swap(number, number + 1).await;
                }
            }
        }
    }

    pub async fn handle(&self, command: Command) {
        match command {
            Command::RequestDesktopInfoList => self.broadcast().await,
            Command::ShowDesktop { id } => self.show(&id).await,
            Command::AddDesktop { position } => self.add(position).await,
            Command::RemoveDesktop { number } => self.remove(number).await,
            Command::RenameDesktop { number, name } => self.rename(number, &name).await,
            Command::ReplaceDesktops { number1, number2 } => self.swap(number1, number2).await,
            Command::Shortcut { action } => self.shortcut(action).await,
        }
    }

    pub async fn react(&self, reaction: Reaction) {
        match reaction {
            Reaction::Broadcast => self.broadcast().await,
            Reaction::AddCheck => self.try_add_empty_desktop().await,
            Reaction::RemoveCheck => self.try_remove_empty_desktops().await,
            Reaction::RenameCheck => self.try_rename_empty_desktops().await,
        }
    }
}

/// Windows that belong to `desktop` itself. Windows on all desktops stay put.
fn movable_windows(stacking: &[WindowRecord], desktop: &DesktopId) -> Vec<WindowRecord> {
    desktops::census(stacking, desktop, None)
        .into_iter()
        .filter(|w| w.membership.names(desktop))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        BackendKind, DesktopEntry, Membership, WindowId, WindowKind,
    };
    use anyhow::{anyhow, bail};
    use std::cell::RefCell;
    use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Create(u32, String),
        Remove(DesktopId),
        Rename(DesktopId, String),
        RenameFallback(DesktopId, String),
        Activate(DesktopId),
        Move(WindowId, DesktopId, DesktopId),
    }

    struct FakeWindow {
        id: WindowId,
        class: String,
        on_all: bool,
        /// Desktop keys.
        desktops: Vec<String>,
    }

    #[derive(Default)]
    struct FakeState {
        /// (key, name) by position.
        desktops: Vec<(String, String)>,
        current: Option<String>,
        windows: Vec<FakeWindow>,
        next_key: u32,
        calls: Vec<Call>,
        fail_renames: bool,
    }

    /// In-memory window manager speaking either numbering convention.
    struct FakeWm {
        kind: BackendKind,
        state: RefCell<FakeState>,
    }

    impl FakeWm {
        fn new(kind: BackendKind, names: &[&str]) -> Self {
            let mut state = FakeState::default();
            for name in names {
                let key = format!("desktop-{}", state.next_key);
                state.next_key += 1;
                state.desktops.push((key, name.to_string()));
            }
            state.current = state.desktops.first().map(|(key, _)| key.clone());

            Self {
                kind,
                state: RefCell::new(state),
            }
        }

        /// Adds a window on the desktops at the given 1-based positions.
        fn with_window(self, id: u32, numbers: &[usize]) -> Self {
            {
                let mut state = self.state.borrow_mut();
                let desktops = numbers
                    .iter()
                    .map(|n| state.desktops[n - 1].0.clone())
                    .collect();
                let id = self.window_id(id);
                state.windows.push(FakeWindow {
                    id,
                    class: "konsole".into(),
                    on_all: false,
                    desktops,
                });
            }
            self
        }

        fn with_sticky_window(self, id: u32) -> Self {
            let id = self.window_id(id);
            self.state.borrow_mut().windows.push(FakeWindow {
                id,
                class: "plasmashell".into(),
                on_all: true,
                desktops: Vec::new(),
            });
            self
        }

        fn failing_renames(self) -> Self {
            self.state.borrow_mut().fail_renames = true;
            self
        }

        fn window_id(&self, id: u32) -> WindowId {
            match self.kind {
                BackendKind::Legacy => WindowId::X11(id),
                BackendKind::Modern => WindowId::Uuid(format!("window-{id}")),
            }
        }

        fn id_of(&self, state: &FakeState, key: &str) -> DesktopId {
            match self.kind {
                BackendKind::Legacy => {
                    let position = state.desktops.iter().position(|(k, _)| k == key);
                    DesktopId::Number(position.map_or(0, |p| p as u32 + 1))
                }
                BackendKind::Modern => DesktopId::Token(key.to_string()),
            }
        }

        fn key_of(&self, state: &FakeState, id: &DesktopId) -> Result<String> {
            match (self.kind, id) {
                (BackendKind::Legacy, DesktopId::Number(n)) => state
                    .desktops
                    .get((*n as usize).wrapping_sub(1))
                    .map(|(key, _)| key.clone())
                    .ok_or_else(|| anyhow!("no desktop {n}")),
                (BackendKind::Modern, DesktopId::Token(token))
                    if state.desktops.iter().any(|(k, _)| k == token) =>
                {
                    Ok(token.clone())
                }
                _ => bail!("bad desktop id {id}"),
            }
        }

        fn record(&self, call: Call) {
            self.state.borrow_mut().calls.push(call);
        }

        fn names(&self) -> Vec<String> {
            self.state
                .borrow()
                .desktops
                .iter()
                .map(|(_, name)| name.clone())
                .collect()
        }

        fn count(&self) -> usize {
            self.state.borrow().desktops.len()
        }

        /// Positions each window explicitly belongs to.
        fn placement(&self) -> Vec<(WindowId, Vec<usize>)> {
            let state = self.state.borrow();
            state
                .windows
                .iter()
                .map(|w| {
                    let mut positions = w
                        .desktops
                        .iter()
                        .filter_map(|key| state.desktops.iter().position(|(k, _)| k == key))
                        .map(|p| p + 1)
                        .collect::<Vec<_>>();
                    positions.sort();
                    (w.id.clone(), positions)
                })
                .collect()
        }

        fn current_position(&self) -> Option<usize> {
            let state = self.state.borrow();
            let current = state.current.as_ref()?;
            state
                .desktops
                .iter()
                .position(|(k, _)| k == current)
                .map(|p| p + 1)
        }

        fn calls(&self) -> Vec<Call> {
            self.state.borrow().calls.clone()
        }
    }

    impl WindowManager for FakeWm {
        fn kind(&self) -> BackendKind {
            self.kind
        }

        async fn desktops(&self) -> Result<Vec<DesktopEntry>> {
            let state = self.state.borrow();
            Ok(state
                .desktops
                .iter()
                .enumerate()
                .map(|(position, (key, name))| DesktopEntry {
                    id: self.id_of(&state, key),
                    position: match self.kind {
                        BackendKind::Legacy => position as u32 + 1,
                        BackendKind::Modern => position as u32,
                    },
                    name: name.clone(),
                })
                .collect())
        }

        async fn current_desktop(&self) -> Result<Option<DesktopId>> {
            let state = self.state.borrow();
            Ok(state.current.as_ref().map(|key| self.id_of(&state, key)))
        }

        async fn stacking_order(&self) -> Result<Vec<WindowRecord>> {
            let state = self.state.borrow();
            Ok(state
                .windows
                .iter()
                .map(|w| WindowRecord {
                    id: w.id.clone(),
                    title: String::new(),
                    class: w.class.clone(),
                    membership: if w.on_all {
                        Membership::AllDesktops
                    } else {
                        Membership::Desktops(
                            w.desktops.iter().map(|key| self.id_of(&state, key)).collect(),
                        )
                    },
                    geometry: Rect::new(0, 0, 800, 600),
                    kind: WindowKind::Normal,
                    skip_taskbar: false,
                    skip_pager: false,
                    skip_switcher: false,
                    demands_attention: false,
                })
                .collect())
        }

        async fn primary_screen(&self) -> Result<Option<Rect>> {
            Ok(Some(Rect::new(0, 0, 1920, 1080)))
        }

        async fn create_desktop(&self, position: u32, name: &str) -> Result<()> {
            self.record(Call::Create(position, name.to_string()));
            let mut state = self.state.borrow_mut();
            let key = format!("desktop-{}", state.next_key);
            state.next_key += 1;

            let index = match self.kind {
                BackendKind::Legacy => (position as usize).saturating_sub(1),
                BackendKind::Modern => state.desktops.len(),
            }
            .min(state.desktops.len());
            state.desktops.insert(index, (key, name.to_string()));
            Ok(())
        }

        async fn remove_desktop(&self, id: &DesktopId) -> Result<()> {
            self.record(Call::Remove(id.clone()));
            let mut state = self.state.borrow_mut();
            let key = self.key_of(&state, id)?;
            state.desktops.retain(|(k, _)| *k != key);
            for window in &mut state.windows {
                window.desktops.retain(|k| *k != key);
            }
            Ok(())
        }

        async fn rename_desktop(&self, id: &DesktopId, name: &str) -> Result<()> {
            self.record(Call::Rename(id.clone(), name.to_string()));
            let mut state = self.state.borrow_mut();
            if state.fail_renames {
                bail!("org.freedesktop.DBus.Error.Failed");
            }
            let key = self.key_of(&state, id)?;
            if let Some(desktop) = state.desktops.iter_mut().find(|(k, _)| *k == key) {
                desktop.1 = name.to_string();
            }
            Ok(())
        }

        async fn rename_desktop_fallback(&self, id: &DesktopId, name: &str) -> Result<()> {
            self.record(Call::RenameFallback(id.clone(), name.to_string()));
            let mut state = self.state.borrow_mut();
            let key = self.key_of(&state, id)?;
            if let Some(desktop) = state.desktops.iter_mut().find(|(k, _)| *k == key) {
                desktop.1 = name.to_string();
            }
            Ok(())
        }

        async fn activate_desktop(&self, id: &DesktopId) -> Result<()> {
            self.record(Call::Activate(id.clone()));
            let mut state = self.state.borrow_mut();
            let key = self.key_of(&state, id)?;
            state.current = Some(key);
            Ok(())
        }

        async fn move_window(
            &self,
            window: &WindowId,
            from: &DesktopId,
            to: &DesktopId,
        ) -> Result<()> {
            self.record(Call::Move(window.clone(), from.clone(), to.clone()));
            let mut state = self.state.borrow_mut();
            let (from, to) = (self.key_of(&state, from)?, self.key_of(&state, to)?);
            let window = state
                .windows
                .iter_mut()
                .find(|w| w.id == *window)
                .ok_or_else(|| anyhow!("no window {window}"))?;
            window.desktops.retain(|k| *k != from);
            if !window.desktops.contains(&to) {
                window.desktops.push(to);
            }
            Ok(())
        }
    }

    const KINDS: [BackendKind; 2] = [BackendKind::Legacy, BackendKind::Modern];

    async fn setup(wm: FakeWm, config: Config) -> (DesktopBar<FakeWm>, UnboundedReceiver<Output>) {
        let (tx, rx) = unbounded_channel();
        (DesktopBar::new(wm, config, tx).await, rx)
    }

    fn dynamic() -> Config {
        Config {
            dynamic_desktops_enable: true,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_exactly_one_current_desktop() {
        for kind in KINDS {
            let (bar, _) = setup(FakeWm::new(kind, &["A", "B", "C"]), Config::default()).await;
            bar.show(&bar.lookup_by_index(2).await.unwrap().id).await;

            let desktops = bar.list_desktops(true).await;
            let current = desktops.iter().filter(|d| d.is_current).collect::<Vec<_>>();
            assert_eq!(current.len(), 1, "{kind:?}");
            assert_eq!(current[0].number, 2);
            assert_eq!(current[0].name, "B");
            assert_eq!(
                desktops.iter().map(|d| d.number).collect::<Vec<_>>(),
                vec![1, 2, 3]
            );
        }
    }

    #[tokio::test]
    async fn test_lookup_absent_desktop() {
        let (bar, _) = setup(FakeWm::new(BackendKind::Modern, &["A"]), Config::default()).await;
        assert!(bar.lookup_by_index(0).await.is_none());
        assert!(bar.lookup_by_index(2).await.is_none());
        assert!(bar.lookup_by_id(&DesktopId::Number(1)).await.is_none());
        assert!(bar.lookup_by_id(&DesktopId::Token("desktop-0".into())).await.is_some());
    }

    #[tokio::test]
    async fn test_swap_scenario() {
        for kind in KINDS {
            let wm = FakeWm::new(kind, &["A", "B", "C"])
                .with_window(1, &[1])
                .with_window(2, &[2])
                .with_window(3, &[3]);
            let (bar, _) = setup(wm, Config::default()).await;

            bar.swap(1, 3).await;

            let wm = bar.window_manager();
            assert_eq!(wm.names(), vec!["C", "B", "A"], "{kind:?}");
            assert_eq!(wm.current_position(), Some(3));

            let desktops = bar.list_desktops(true).await;
            let current = desktops.iter().find(|d| d.is_current).unwrap();
            assert_eq!(current.name, "A");
            assert_eq!(current.number, 3);

            assert_eq!(
                wm.placement(),
                vec![
                    (wm.window_id(1), vec![3]),
                    (wm.window_id(2), vec![2]),
                    (wm.window_id(3), vec![1]),
                ]
            );
        }
    }

    #[tokio::test]
    async fn test_swap_is_its_own_inverse() {
        for kind in KINDS {
            let wm = FakeWm::new(kind, &["A", "B", "C", "D"])
                .with_window(1, &[2])
                .with_window(2, &[2])
                .with_window(3, &[4])
                .with_sticky_window(4);
            let (bar, _) = setup(wm, Config::default()).await;
            let names = bar.window_manager().names();
            let placement = bar.window_manager().placement();

            bar.swap(2, 4).await;
            assert_ne!(bar.window_manager().names(), names);

            bar.swap(2, 4).await;
            assert_eq!(bar.window_manager().names(), names, "{kind:?}");
            assert_eq!(bar.window_manager().placement(), placement);
        }
    }

    #[tokio::test]
    async fn test_swap_keeps_window_on_both_desktops() {
        let wm = FakeWm::new(BackendKind::Modern, &["A", "B", "C"])
            .with_window(1, &[1, 2])
            .with_window(2, &[2]);
        let (bar, _) = setup(wm, Config::default()).await;
        let placement = bar.window_manager().placement();

        bar.swap(1, 2).await;
        let shared = bar.window_manager().placement()[0].clone();
        assert_eq!(shared.1, vec![1, 2]);
        assert!(
            !bar.window_manager()
                .calls()
                .iter()
                .any(|call| matches!(call, Call::Move(id, _, _) if *id == shared.0))
        );

        bar.swap(1, 2).await;
        assert_eq!(bar.window_manager().placement(), placement);
    }

    #[tokio::test]
    async fn test_swap_ignores_same_and_out_of_range() {
        for kind in KINDS {
            let wm = FakeWm::new(kind, &["A", "B"]).with_window(1, &[1]);
            let (bar, _) = setup(wm, Config::default()).await;
            let before = bar.list_desktops(true).await;

            bar.swap(1, 1).await;
            bar.swap(0, 1).await;
            bar.swap(1, 3).await;
            bar.swap(3, 4).await;

            assert!(bar.window_manager().calls().is_empty(), "{kind:?}");
            assert_eq!(bar.list_desktops(true).await, before);
        }
    }

    #[tokio::test]
    async fn test_try_add_when_no_desktop_is_empty() {
        for kind in KINDS {
            let wm = FakeWm::new(kind, &["A", "B"])
                .with_window(1, &[1])
                .with_window(2, &[2]);
            let (bar, _) = setup(wm, dynamic()).await;
            let placement = bar.window_manager().placement();

            bar.try_add_empty_desktop().await;

            let wm = bar.window_manager();
            assert_eq!(wm.count(), 3, "{kind:?}");
            assert_eq!(wm.names(), vec!["A", "B", "New Desktop"]);
            assert_eq!(wm.placement(), placement);
            assert_eq!(
                wm.calls(),
                vec![Call::Create(
                    kind.position(3),
                    "New Desktop".to_string()
                )]
            );
        }
    }

    #[tokio::test]
    async fn test_try_add_does_nothing_with_an_empty_desktop_or_when_disabled() {
        let wm = FakeWm::new(BackendKind::Legacy, &["A", "B"]).with_window(1, &[1]);
        let (bar, _) = setup(wm, dynamic()).await;
        bar.try_add_empty_desktop().await;
        assert_eq!(bar.window_manager().count(), 2);

        let wm = FakeWm::new(BackendKind::Legacy, &["A"]).with_window(1, &[1]);
        let (bar, _) = setup(wm, Config::default()).await;
        bar.try_add_empty_desktop().await;
        assert_eq!(bar.window_manager().count(), 1);
    }

    #[tokio::test]
    async fn test_try_remove_keeps_first_empty_desktop() {
        for kind in KINDS {
            let wm = FakeWm::new(kind, &["A", "B", "C", "D", "E"])
                .with_window(1, &[1])
                .with_window(3, &[3]);
            let (bar, _) = setup(wm, dynamic()).await;
            assert_eq!(bar.empty_desktops(false).await, vec![2, 4, 5]);

            bar.try_remove_empty_desktops().await;

            assert_eq!(bar.window_manager().names(), vec!["A", "B", "C"], "{kind:?}");
            assert_eq!(bar.empty_desktops(false).await, vec![2]);
        }
    }

    #[tokio::test]
    async fn test_sticky_window_blocks_rename_but_not_removal() {
        let wm = FakeWm::new(BackendKind::Legacy, &["A", "B", "C"])
            .with_window(1, &[1])
            .with_sticky_window(2);
        let config = Config {
            empty_desktops_rename_as: "Empty".into(),
            ..dynamic()
        };
        let (bar, _) = setup(wm, config).await;

        assert!(bar.empty_desktops(true).await.is_empty());
        assert_eq!(bar.empty_desktops(false).await, vec![2, 3]);

        bar.try_rename_empty_desktops().await;
        assert_eq!(bar.window_manager().names(), vec!["A", "B", "C"]);

        bar.try_remove_empty_desktops().await;
        assert_eq!(bar.window_manager().names(), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_try_rename_strictly_empty_desktops() {
        for kind in KINDS {
            let wm = FakeWm::new(kind, &["A", "Empty", "C"]).with_window(1, &[1]);
            let config = Config {
                empty_desktops_rename_as: "Empty".into(),
                ..Config::default()
            };
            let (bar, _) = setup(wm, config).await;

            bar.try_rename_empty_desktops().await;

            let wm = bar.window_manager();
            assert_eq!(wm.names(), vec!["A", "Empty", "Empty"], "{kind:?}");
            // Already labelled desktops are left alone.
            assert_eq!(wm.calls().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_remove_refuses_last_desktop() {
        for kind in KINDS {
            let (bar, _) = setup(FakeWm::new(kind, &["A"]), Config::default()).await;
            bar.remove(1).await;
            bar.shortcut(ShortcutAction::RemoveLastDesktop).await;
            assert_eq!(bar.window_manager().count(), 1);
            assert!(bar.window_manager().calls().is_empty());
        }
    }

    #[tokio::test]
    async fn test_remove_translates_display_index() {
        for kind in KINDS {
            let (bar, _) = setup(FakeWm::new(kind, &["A", "B", "C"]), Config::default()).await;
            bar.remove(2).await;
            bar.remove(7).await;
            assert_eq!(bar.window_manager().names(), vec!["A", "C"], "{kind:?}");
        }
    }

    #[tokio::test]
    async fn test_add_at_position() {
        let (bar, _) = setup(
            FakeWm::new(BackendKind::Legacy, &["A", "B"]),
            Config::default(),
        )
        .await;
        bar.add(Some(1)).await;
        assert_eq!(bar.window_manager().names(), vec!["New Desktop", "A", "B"]);

        // The protocol can only append.
        let (bar, _) = setup(
            FakeWm::new(BackendKind::Modern, &["A", "B"]),
            Config::default(),
        )
        .await;
        bar.add(Some(1)).await;
        assert_eq!(bar.window_manager().names(), vec!["A", "B", "New Desktop"]);
    }

    #[tokio::test]
    async fn test_rename_falls_back_after_error_reply() {
        let wm = FakeWm::new(BackendKind::Modern, &["A", "B"]).failing_renames();
        let (bar, _) = setup(wm, Config::default()).await;

        bar.rename(2, "Mail").await;

        let id = DesktopId::Token("desktop-1".into());
        assert_eq!(
            bar.window_manager().calls(),
            vec![
                Call::Rename(id.clone(), "Mail".into()),
                Call::RenameFallback(id, "Mail".into()),
            ]
        );
        assert_eq!(bar.window_manager().names(), vec!["A", "Mail"]);
    }

    #[tokio::test]
    async fn test_recent_desktop_shortcut() {
        for kind in KINDS {
            let (mut bar, _) = setup(FakeWm::new(kind, &["A", "B", "C"]), Config::default()).await;

            bar.show(&bar.lookup_by_index(3).await.unwrap().id).await;
            bar.update_current().await;
            assert_eq!(bar.most_recent(), bar.lookup_by_index(1).await.map(|d| d.id).as_ref());

            bar.shortcut(ShortcutAction::SwitchToRecentDesktop).await;
            bar.update_current().await;
            assert_eq!(bar.window_manager().current_position(), Some(1), "{kind:?}");
            assert_eq!(bar.most_recent(), bar.lookup_by_index(3).await.map(|d| d.id).as_ref());
        }
    }

    #[tokio::test]
    async fn test_move_current_desktop_shortcuts() {
        let wm = FakeWm::new(BackendKind::Legacy, &["A", "B", "C"]).with_window(1, &[1]);
        let (bar, _) = setup(wm, Config::default()).await;

        bar.shortcut(ShortcutAction::MoveCurrentDesktopToLeft).await;
        assert!(bar.window_manager().calls().is_empty());

        bar.shortcut(ShortcutAction::MoveCurrentDesktopToRight).await;
        let wm = bar.window_manager();
        assert_eq!(wm.names(), vec!["B", "A", "C"]);
        assert_eq!(wm.current_position(), Some(2));
        assert_eq!(wm.placement(), vec![(WindowId::X11(1), vec![2])]);
    }

    #[tokio::test]
    async fn test_broadcast_and_rename_request() {
        let wm = FakeWm::new(BackendKind::Legacy, &["A", "B"]).with_window(1, &[1]);
        let (bar, mut rx) = setup(wm, Config::default()).await;

        bar.handle(Command::RequestDesktopInfoList).await;
        let Some(Output::DesktopInfoListSent { desktops }) = rx.recv().await else {
            panic!("expected a desktop info list");
        };
        assert_eq!(desktops.len(), 2);
        assert!(desktops[0].is_current);
        assert!(!desktops[0].is_empty);
        assert_eq!(desktops[0].active_window_name, "Konsole");
        assert!(desktops[1].is_empty);

        bar.shortcut(ShortcutAction::RenameCurrentDesktop).await;
        assert_eq!(rx.recv().await, Some(Output::RequestRenameCurrentDesktop));
    }

    #[tokio::test]
    async fn test_config_reload_reactions() {
        let (mut bar, _) = setup(FakeWm::new(BackendKind::Legacy, &["A"]), Config::default()).await;
        assert_eq!(
            bar.set_config(dynamic()),
            vec![Reaction::AddCheck, Reaction::RemoveCheck]
        );
        assert!(bar.set_config(dynamic()).is_empty());
    }
}
