//! Modern backend: KWin on Wayland.
//!
//! Desktops and windows come from the plasma virtual-desktop and
//! window-management protocols. Their event queue runs on a dedicated thread
//! that mirrors the compositor state into a shared snapshot. Renames still go
//! through KWin's D-Bus service because the protocol has no rename request.

use super::{
    BackendKind, DesktopEntry, DesktopId, Membership, Notification, Rect, WindowId, WindowKind,
    WindowRecord, kwin::KWinDbus, x11,
};
use anyhow::{Context, Result, anyhow, bail};
use handshake::{HandshakeState, Settle, SettleStep};
use log::{debug, error, info, warn};
use std::{
    collections::HashMap,
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tokio::sync::{mpsc::UnboundedSender, watch};
use wayland_client::{
    Connection, Dispatch, EventQueue, Proxy, QueueHandle, WEnum,
    protocol::{
        wl_callback::WlCallback,
        wl_output::{self, WlOutput},
        wl_registry::{self, WlRegistry},
    },
};
use wayland_protocols::xdg::xdg_output::zv1::client::{
    zxdg_output_manager_v1::ZxdgOutputManagerV1,
    zxdg_output_v1::{self, ZxdgOutputV1},
};
use wayland_protocols_plasma::{
    plasma_virtual_desktop::client::{
        org_kde_plasma_virtual_desktop::{self, OrgKdePlasmaVirtualDesktop},
        org_kde_plasma_virtual_desktop_management::{self, OrgKdePlasmaVirtualDesktopManagement},
    },
    plasma_window_management::client::{
        org_kde_plasma_window::{self, OrgKdePlasmaWindow},
        org_kde_plasma_window_management::{self, OrgKdePlasmaWindowManagement},
    },
};

pub mod handshake;

const VIRTUAL_DESKTOP_MANAGEMENT_VERSION: u32 = 2;
// get_window_by_uuid needs 13.
const WINDOW_MANAGEMENT_VERSION: u32 = 14;

// org_kde_plasma_window_management.state bits.
const STATE_DEMANDS_ATTENTION: u32 = 1 << 7;
const STATE_SKIP_TASKBAR: u32 = 1 << 12;
const STATE_SKIP_SWITCHER: u32 = 1 << 18;

pub struct WaylandBackend {
    connection: Connection,
    snapshot: Arc<RwLock<Snapshot>>,
    kwin: KWinDbus<'static>,
    handle: QueueHandle<PlasmaState>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Snapshot {
    desktop_manager: Option<OrgKdePlasmaVirtualDesktopManagement>,
    /// Desktop ids by position.
    desktop_order: Vec<String>,
    desktops: HashMap<String, DesktopState>,
    windows: HashMap<String, WindowState>,
    /// Window uuids, bottom-most first.
    stacking: Vec<String>,
    screen: Option<ScreenState>,
}

struct DesktopState {
    proxy: OrgKdePlasmaVirtualDesktop,
    name: String,
    active: bool,
}

struct WindowState {
    proxy: OrgKdePlasmaWindow,
    title: String,
    app_id: String,
    flags: u32,
    desktops: Vec<String>,
    geometry: Rect,
}

#[derive(Default, Clone, Copy)]
struct ScreenState {
    physical: Rect,
    logical: Option<Rect>,
}

impl ScreenState {
    fn rect(&self) -> Rect {
        self.logical.unwrap_or(self.physical)
    }
}

impl WaylandBackend {
    pub async fn new(
        dbus: &zbus::Connection,
        notifications: UnboundedSender<Notification>,
        timeout: Duration,
    ) -> Result<Self> {
        let (handshake_tx, handshake_rx) = handshake::channel();

        let connection =
            Connection::connect_to_env().context("Failed to connect to the Wayland display")?;
        let queue = connection.new_event_queue();
        let handle = queue.handle();
        let snapshot = Arc::new(RwLock::new(Snapshot::default()));
        let stop = Arc::new(AtomicBool::new(false));

        let state = PlasmaState {
            snapshot: snapshot.clone(),
            notifications,
            desktop_manager_name: None,
            window_manager: None,
            output: None,
            output_manager: None,
            xdg_output: None,
            created: 0,
        };

        let worker = thread::Builder::new()
            .name("wayland-dispatch".to_string())
            .spawn({
                let connection = connection.clone();
                let stop = stop.clone();
                move || run_dispatch(connection, queue, state, handshake_tx, stop)
            })
            .context("Failed to spawn Wayland dispatch thread")?;

        handshake::wait_ready(handshake_rx, timeout).await?;
        info!("Connected to the plasma desktop protocols");

        Ok(Self {
            connection,
            snapshot,
            kwin: KWinDbus::new(dbus).await?,
            handle,
            stop,
            worker: Some(worker),
        })
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Snapshot>> {
        self.snapshot
            .read()
            .map_err(|e| anyhow!("Wayland snapshot poisoned: {e}"))
    }

    fn flush(&self) -> Result<()> {
        self.connection
            .flush()
            .context("Failed to flush Wayland requests")
    }

    pub async fn desktops(&self) -> Result<Vec<DesktopEntry>> {
        let snapshot = self.read()?;

        Ok(snapshot
            .desktop_order
            .iter()
            .enumerate()
            .map(|(position, id)| DesktopEntry {
                id: DesktopId::Token(id.clone()),
                position: position as u32,
                name: snapshot
                    .desktops
                    .get(id)
                    .map(|d| d.name.clone())
                    .unwrap_or_default(),
            })
            .collect())
    }

    pub async fn current_desktop(&self) -> Result<Option<DesktopId>> {
        let snapshot = self.read()?;

        Ok(snapshot
            .desktop_order
            .iter()
            .find(|id| snapshot.desktops.get(*id).is_some_and(|d| d.active))
            .map(|id| DesktopId::Token(id.clone())))
    }

    pub async fn stacking_order(&self) -> Result<Vec<WindowRecord>> {
        let snapshot = self.read()?;

        let mut ordered = snapshot
            .stacking
            .iter()
            .filter_map(|uuid| snapshot.windows.get(uuid).map(|w| (uuid, w)))
            .collect::<Vec<_>>();
        // Windows announced after the last stacking update go on top.
        ordered.extend(
            snapshot
                .windows
                .iter()
                .filter(|(uuid, _)| !snapshot.stacking.contains(*uuid)),
        );

        Ok(ordered
            .into_iter()
            .map(|(uuid, window)| WindowRecord {
                id: WindowId::Uuid(uuid.clone()),
                title: window.title.clone(),
                class: window.app_id.clone(),
                membership: Membership::Desktops(
                    window
                        .desktops
                        .iter()
                        .cloned()
                        .map(DesktopId::Token)
                        .collect(),
                ),
                geometry: window.geometry,
                kind: WindowKind::Normal,
                skip_taskbar: window.flags & STATE_SKIP_TASKBAR != 0,
                skip_pager: false,
                skip_switcher: window.flags & STATE_SKIP_SWITCHER != 0,
                demands_attention: window.flags & STATE_DEMANDS_ATTENTION != 0,
            })
            .collect())
    }

    pub async fn primary_screen(&self) -> Result<Option<Rect>> {
        Ok(self.read()?.screen.map(|s| s.rect()))
    }

    /// The protocol cannot insert at a position; new desktops always go last.
    pub async fn create_desktop(&self, position: u32, name: &str) -> Result<()> {
        {
            let snapshot = self.read()?;
            let manager = snapshot
                .desktop_manager
                .as_ref()
                .context("Virtual desktop management is not available")?;
            let last = snapshot.desktop_order.len() as u32;

            if position != last {
                debug!("Ignoring requested position {position}, appending at {last}");
            }
            manager.request_create_virtual_desktop(name.to_string(), last);
        }
        self.flush()
    }

    pub async fn remove_desktop(&self, id: &DesktopId) -> Result<()> {
        let id = token(id)?;
        {
            let snapshot = self.read()?;
            let manager = snapshot
                .desktop_manager
                .as_ref()
                .context("Virtual desktop management is not available")?;
            manager.request_remove_virtual_desktop(id.to_string());
        }
        self.flush()
    }

    pub async fn rename_desktop(&self, id: &DesktopId, name: &str) -> Result<()> {
        self.kwin
            .set_desktop_name(token(id)?, name)
            .await
            .context("setDesktopName failed")
    }

    /// Rewrites the desktop names Xwayland exposes through EWMH.
    pub async fn rename_desktop_fallback(&self, id: &DesktopId, name: &str) -> Result<()> {
        let id = token(id)?;
        let position = self
            .read()?
            .desktop_order
            .iter()
            .position(|d| d == id)
            .with_context(|| format!("Unknown desktop {id}"))? as u32;

        x11::rename_via_ewmh(BackendKind::Modern.display_index(position), name)
    }

    pub async fn activate_desktop(&self, id: &DesktopId) -> Result<()> {
        let id = token(id)?;
        {
            let snapshot = self.read()?;
            let desktop = snapshot
                .desktops
                .get(id)
                .with_context(|| format!("Unknown desktop {id}"))?;
            desktop.proxy.request_activate();
        }
        self.flush()
    }

    pub async fn move_window(
        &self,
        window: &WindowId,
        from: &DesktopId,
        to: &DesktopId,
    ) -> Result<()> {
        let WindowId::Uuid(uuid) = window else {
            bail!("Window {window} does not belong to the Wayland backend");
        };
        let (from, to) = (token(from)?, token(to)?);
        {
            let snapshot = self.read()?;
            let window = snapshot
                .windows
                .get(uuid)
                .with_context(|| format!("Unknown window {uuid}"))?;

            window.proxy.request_enter_virtual_desktop(to.to_string());
            if from != to {
                window.proxy.request_leave_virtual_desktop(from.to_string());
            }
        }
        self.flush()
    }
}

impl Drop for WaylandBackend {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        // A sync round wakes the dispatch thread out of its blocking read.
        self.connection.display().sync(&self.handle, ());
        let _ = self.connection.flush();

        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            warn!("Wayland dispatch thread panicked");
        }
    }
}

fn token(id: &DesktopId) -> Result<&str> {
    match id {
        DesktopId::Token(token) => Ok(token),
        other => Err(anyhow!(
            "Desktop id {other} is not valid for the {:?} backend",
            BackendKind::Modern
        )),
    }
}

fn run_dispatch(
    connection: Connection,
    mut queue: EventQueue<PlasmaState>,
    mut state: PlasmaState,
    handshake: watch::Sender<HandshakeState>,
    stop: Arc<AtomicBool>,
) {
    let handle = queue.handle();
    let _registry = connection.display().get_registry(&handle, ());
    handshake.send_replace(HandshakeState::AwaitingCapabilities);

    // Requests queued while a round dispatches go out after its sync, so the
    // state of a new object only lands in the following round.
    let mut settle = Settle::default();
    loop {
        if let Err(e) = queue.roundtrip(&mut state) {
            handshake.send_replace(HandshakeState::Failed(e.to_string()));
            return;
        }

        let missing = state.missing_globals();
        if !missing.is_empty() {
            handshake.send_replace(HandshakeState::Failed(format!(
                "compositor does not announce {}",
                missing.join(", ")
            )));
            return;
        }

        match settle.step(state.created) {
            SettleStep::Again => continue,
            SettleStep::Settled => break,
            SettleStep::GaveUp => {
                warn!(
                    "Objects still appearing after {} roundtrips, starting anyway",
                    settle.rounds()
                );
                break;
            }
        }
    }
    debug!("Wayland state settled after {} roundtrips", settle.rounds());
    handshake.send_replace(HandshakeState::Ready);

    while !stop.load(Ordering::Acquire) {
        if let Err(e) = queue.blocking_dispatch(&mut state) {
            error!("Wayland dispatch failed: {e}");
            break;
        }
    }
    debug!("Wayland dispatch thread stopped");
}

struct PlasmaState {
    snapshot: Arc<RwLock<Snapshot>>,
    notifications: UnboundedSender<Notification>,
    desktop_manager_name: Option<u32>,
    window_manager: Option<(OrgKdePlasmaWindowManagement, u32)>,
    output: Option<(WlOutput, u32)>,
    output_manager: Option<ZxdgOutputManagerV1>,
    xdg_output: Option<ZxdgOutputV1>,
    /// Proxies created so far, never decremented.
    created: usize,
}

impl PlasmaState {
    fn missing_globals(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.desktop_manager_name.is_none() {
            missing.push(OrgKdePlasmaVirtualDesktopManagement::interface().name);
        }
        if self.window_manager.is_none() {
            missing.push(OrgKdePlasmaWindowManagement::interface().name);
        }
        missing
    }

    fn notify(&self, notification: Notification) {
        let _ = self.notifications.send(notification);
    }

    fn update(&self, f: impl FnOnce(&mut Snapshot)) {
        match self.snapshot.write() {
            Ok(mut snapshot) => f(&mut snapshot),
            Err(e) => error!("Wayland snapshot poisoned: {e}"),
        }
    }

    fn request_xdg_output(&mut self, handle: &QueueHandle<Self>) {
        if self.xdg_output.is_some() {
            return;
        }
        if let (Some(manager), Some((output, _))) = (&self.output_manager, &self.output) {
            self.xdg_output = Some(manager.get_xdg_output(output, handle, ()));
            self.created += 1;
        }
    }
}

impl Dispatch<WlRegistry, ()> for PlasmaState {
    fn event(
        state: &mut Self,
        proxy: &WlRegistry,
        event: <WlRegistry as Proxy>::Event,
        _data: &(),
        _conn: &Connection,
        handle: &QueueHandle<Self>,
    ) {
        match event {
            wl_registry::Event::Global {
                name,
                interface,
                version,
            } => {
                if interface == OrgKdePlasmaVirtualDesktopManagement::interface().name
                    && state.desktop_manager_name.is_none()
                {
                    debug!("Binding virtual desktop management v{version}");
                    let manager: OrgKdePlasmaVirtualDesktopManagement = proxy.bind(
                        name,
                        version.min(VIRTUAL_DESKTOP_MANAGEMENT_VERSION),
                        handle,
                        (),
                    );
                    state.desktop_manager_name = Some(name);
                    state.created += 1;
                    state.update(|s| s.desktop_manager = Some(manager));
                } else if interface == OrgKdePlasmaWindowManagement::interface().name
                    && state.window_manager.is_none()
                {
                    debug!("Binding window management v{version}");
                    let manager =
                        proxy.bind(name, version.min(WINDOW_MANAGEMENT_VERSION), handle, ());
                    state.window_manager = Some((manager, name));
                    state.created += 1;
                } else if interface == WlOutput::interface().name && state.output.is_none() {
                    // The first output stands in for the primary screen.
                    state.output = Some((proxy.bind(name, version.min(3), handle, ()), name));
                    state.created += 1;
                    state.request_xdg_output(handle);
                } else if interface == ZxdgOutputManagerV1::interface().name
                    && state.output_manager.is_none()
                {
                    state.output_manager = Some(proxy.bind(name, version.min(3), handle, ()));
                    state.created += 1;
                    state.request_xdg_output(handle);
                }
            }
            wl_registry::Event::GlobalRemove { name } => {
                if state.desktop_manager_name == Some(name) {
                    warn!("Virtual desktop management was removed");
                    state.desktop_manager_name = None;
                    state.update(|s| {
                        s.desktop_manager = None;
                        s.desktop_order.clear();
                        s.desktops.clear();
                    });
                    state.notify(Notification::DesktopCountChanged);
                } else if state.window_manager.as_ref().is_some_and(|(_, n)| *n == name) {
                    warn!("Window management was removed");
                    state.window_manager = None;
                    state.update(|s| {
                        s.windows.clear();
                        s.stacking.clear();
                    });
                } else if state.output.as_ref().is_some_and(|(_, n)| *n == name) {
                    info!("Primary output was removed");
                    state.output = None;
                    state.xdg_output = None;
                    state.update(|s| s.screen = None);
                }
            }
            _ => {}
        }
    }
}

impl Dispatch<OrgKdePlasmaVirtualDesktopManagement, ()> for PlasmaState {
    fn event(
        state: &mut Self,
        proxy: &OrgKdePlasmaVirtualDesktopManagement,
        event: <OrgKdePlasmaVirtualDesktopManagement as Proxy>::Event,
        _data: &(),
        _conn: &Connection,
        handle: &QueueHandle<Self>,
    ) {
        match event {
            org_kde_plasma_virtual_desktop_management::Event::DesktopCreated {
                desktop_id,
                position,
            } => {
                debug!("Desktop {desktop_id} created at {position}");
                let desktop = proxy.get_virtual_desktop(desktop_id.clone(), handle, desktop_id.clone());
                state.created += 1;
                state.update(|s| {
                    let position = (position as usize).min(s.desktop_order.len());
                    s.desktop_order.insert(position, desktop_id.clone());
                    s.desktops.insert(
                        desktop_id,
                        DesktopState {
                            proxy: desktop,
                            name: String::new(),
                            active: false,
                        },
                    );
                });
                state.notify(Notification::DesktopCountChanged);
            }
            org_kde_plasma_virtual_desktop_management::Event::DesktopRemoved { desktop_id } => {
                debug!("Desktop {desktop_id} removed");
                state.update(|s| {
                    s.desktop_order.retain(|id| *id != desktop_id);
                    // org_kde_plasma_virtual_desktop has no destructor request;
                    // dropping the proxy is all that can be done client-side.
                    s.desktops.remove(&desktop_id);
                });
                state.notify(Notification::DesktopCountChanged);
            }
            _ => {}
        }
    }
}

impl Dispatch<OrgKdePlasmaVirtualDesktop, String> for PlasmaState {
    fn event(
        state: &mut Self,
        _proxy: &OrgKdePlasmaVirtualDesktop,
        event: <OrgKdePlasmaVirtualDesktop as Proxy>::Event,
        desktop_id: &String,
        _conn: &Connection,
        _handle: &QueueHandle<Self>,
    ) {
        let notification = match event {
            org_kde_plasma_virtual_desktop::Event::Name { name } => {
                state.update(|s| {
                    if let Some(desktop) = s.desktops.get_mut(desktop_id) {
                        desktop.name = name;
                    }
                });
                Notification::DesktopNamesChanged
            }
            org_kde_plasma_virtual_desktop::Event::Activated => {
                state.update(|s| {
                    for (id, desktop) in s.desktops.iter_mut() {
                        desktop.active = id == desktop_id;
                    }
                });
                Notification::CurrentDesktopChanged
            }
            org_kde_plasma_virtual_desktop::Event::Deactivated => {
                state.update(|s| {
                    if let Some(desktop) = s.desktops.get_mut(desktop_id) {
                        desktop.active = false;
                    }
                });
                return;
            }
            _ => return,
        };
        state.notify(notification);
    }
}

impl Dispatch<OrgKdePlasmaWindowManagement, ()> for PlasmaState {
    fn event(
        state: &mut Self,
        proxy: &OrgKdePlasmaWindowManagement,
        event: <OrgKdePlasmaWindowManagement as Proxy>::Event,
        _data: &(),
        _conn: &Connection,
        handle: &QueueHandle<Self>,
    ) {
        match event {
            org_kde_plasma_window_management::Event::WindowWithUuid { uuid, .. } => {
                let window = proxy.get_window_by_uuid(uuid.clone(), handle, uuid.clone());
                state.created += 1;
                state.update(|s| {
                    s.windows.insert(
                        uuid,
                        WindowState {
                            proxy: window,
                            title: String::new(),
                            app_id: String::new(),
                            flags: 0,
                            desktops: Vec::new(),
                            geometry: Rect::default(),
                        },
                    );
                });
            }
            org_kde_plasma_window_management::Event::StackingOrderUuidChanged { uuids } => {
                state.update(|s| {
                    s.stacking = uuids
                        .split(';')
                        .filter(|uuid| !uuid.is_empty())
                        .map(str::to_string)
                        .collect();
                });
            }
            _ => {}
        }
    }
}

impl Dispatch<OrgKdePlasmaWindow, String> for PlasmaState {
    fn event(
        state: &mut Self,
        _proxy: &OrgKdePlasmaWindow,
        event: <OrgKdePlasmaWindow as Proxy>::Event,
        uuid: &String,
        _conn: &Connection,
        _handle: &QueueHandle<Self>,
    ) {
        state.update(|s| {
            if let org_kde_plasma_window::Event::Unmapped = event {
                if let Some(window) = s.windows.remove(uuid) {
                    window.proxy.destroy();
                }
                s.stacking.retain(|id| id != uuid);
                return;
            }

            let Some(window) = s.windows.get_mut(uuid) else {
                return;
            };

            match event {
                org_kde_plasma_window::Event::TitleChanged { title } => window.title = title,
                org_kde_plasma_window::Event::AppIdChanged { app_id } => window.app_id = app_id,
                org_kde_plasma_window::Event::StateChanged { flags } => window.flags = flags,
                org_kde_plasma_window::Event::Geometry {
                    x,
                    y,
                    width,
                    height,
                } => {
                    window.geometry = Rect::new(x, y, width as i32, height as i32);
                }
                org_kde_plasma_window::Event::VirtualDesktopEntered { id } => {
                    if !window.desktops.contains(&id) {
                        window.desktops.push(id);
                    }
                }
                org_kde_plasma_window::Event::VirtualDesktopLeft { is } => {
                    window.desktops.retain(|d| *d != is);
                }
                _ => {}
            }
        });
    }
}

impl Dispatch<WlOutput, ()> for PlasmaState {
    fn event(
        state: &mut Self,
        _proxy: &WlOutput,
        event: <WlOutput as Proxy>::Event,
        _data: &(),
        _conn: &Connection,
        _handle: &QueueHandle<Self>,
    ) {
        match event {
            wl_output::Event::Geometry { x, y, .. } => state.update(|s| {
                let screen = s.screen.get_or_insert_with(ScreenState::default);
                screen.physical.x = x;
                screen.physical.y = y;
            }),
            wl_output::Event::Mode {
                flags: WEnum::Value(flags),
                width,
                height,
                ..
            } if flags.contains(wl_output::Mode::Current) => state.update(|s| {
                let screen = s.screen.get_or_insert_with(ScreenState::default);
                screen.physical.width = width;
                screen.physical.height = height;
            }),
            _ => {}
        }
    }
}

impl Dispatch<ZxdgOutputManagerV1, ()> for PlasmaState {
    fn event(
        _state: &mut Self,
        _proxy: &ZxdgOutputManagerV1,
        _event: <ZxdgOutputManagerV1 as Proxy>::Event,
        _data: &(),
        _conn: &Connection,
        _handle: &QueueHandle<Self>,
    ) {
    } // This interface has no events.
}

impl Dispatch<ZxdgOutputV1, ()> for PlasmaState {
    fn event(
        state: &mut Self,
        _proxy: &ZxdgOutputV1,
        event: <ZxdgOutputV1 as Proxy>::Event,
        _data: &(),
        _conn: &Connection,
        _handle: &QueueHandle<Self>,
    ) {
        state.update(|s| {
            let screen = s.screen.get_or_insert_with(ScreenState::default);
            let logical = screen.logical.get_or_insert(screen.physical);
            match event {
                zxdg_output_v1::Event::LogicalPosition { x, y } => {
                    logical.x = x;
                    logical.y = y;
                }
                zxdg_output_v1::Event::LogicalSize { width, height } => {
                    logical.width = width;
                    logical.height = height;
                }
                _ => {}
            }
        });
    }
}

impl Dispatch<WlCallback, ()> for PlasmaState {
    fn event(
        _state: &mut Self,
        _proxy: &WlCallback,
        _event: <WlCallback as Proxy>::Event,
        _data: &(),
        _conn: &Connection,
        _handle: &QueueHandle<Self>,
    ) {
    } // Only used to wake the dispatch loop.
}
