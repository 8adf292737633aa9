//! Legacy backend: X11 session running KWin.
//!
//! Window and current-desktop state come straight from the EWMH properties.
//! EWMH has no way to add or remove a desktop at a given position, so those
//! (and renames, which EWMH only supports unreliably) go through KWin's
//! D-Bus service.

use super::{
    BackendKind, DesktopEntry, DesktopId, Membership, Notification, Rect, WindowId, WindowKind,
    WindowRecord, kwin::KWinDbus,
};
use anyhow::{Context, Result, anyhow, bail};
use ewmh::{ALL_DESKTOPS, Atoms};
use log::{debug, error, warn};
use std::{sync::Arc, thread};
use tokio::sync::mpsc::UnboundedSender;
use x11rb::{
    connection::Connection,
    protocol::{
        Event,
        randr::ConnectionExt as _,
        xproto::{AtomEnum, ChangeWindowAttributesAux, ConnectionExt, EventMask, Window},
    },
    rust_connection::RustConnection,
};

pub mod ewmh;

pub struct X11Backend {
    conn: Arc<RustConnection>,
    root: Window,
    screen_size: (u16, u16),
    atoms: Atoms,
    kwin: KWinDbus<'static>,
}

impl X11Backend {
    pub async fn new(
        dbus: &zbus::Connection,
        notifications: UnboundedSender<Notification>,
    ) -> Result<Self> {
        let (conn, screen_num) = x11rb::connect(None).context("Failed to connect to X server")?;
        let screen = &conn.setup().roots[screen_num];
        let root = screen.root;
        let screen_size = (screen.width_in_pixels, screen.height_in_pixels);
        let atoms = Atoms::new(&conn)?.reply()?;
        let conn = Arc::new(conn);

        select_property_changes(&*conn, root)?;
        for window in ewmh::get_u32_list(&*conn, root, atoms._NET_CLIENT_LIST, AtomEnum::WINDOW)? {
            if let Err(e) = select_property_changes(&*conn, window) {
                debug!("Cannot watch window {window:#x}: {e}");
            }
        }
        conn.flush()?;

        spawn_event_reader(conn.clone(), root, atoms, notifications)?;

        Ok(Self {
            conn,
            root,
            screen_size,
            atoms,
            kwin: KWinDbus::new(dbus).await?,
        })
    }

    pub async fn desktops(&self) -> Result<Vec<DesktopEntry>> {
        Ok(self
            .kwin
            .list()
            .await?
            .into_iter()
            .map(|d| DesktopEntry {
                id: DesktopId::Number(d.position + 1),
                position: d.position + 1,
                name: d.name,
            })
            .collect())
    }

    pub async fn current_desktop(&self) -> Result<Option<DesktopId>> {
        let current = ewmh::get_cardinal(&*self.conn, self.root, self.atoms._NET_CURRENT_DESKTOP)?;
        Ok(current.map(|index| DesktopId::Number(index + 1)))
    }

    pub async fn stacking_order(&self) -> Result<Vec<WindowRecord>> {
        let windows = ewmh::get_u32_list(
            &*self.conn,
            self.root,
            self.atoms._NET_CLIENT_LIST_STACKING,
            AtomEnum::WINDOW,
        )?;

        Ok(windows
            .into_iter()
            .filter_map(|window| match self.window_record(window) {
                Ok(record) => Some(record),
                Err(e) => {
                    // Usually a window that was closed while we were reading it.
                    debug!("Skipping window {window:#x}: {e}");
                    None
                }
            })
            .collect())
    }

    pub async fn primary_screen(&self) -> Result<Option<Rect>> {
        let monitors = self
            .conn
            .randr_get_monitors(self.root, true)?
            .reply()
            .map(|reply| reply.monitors)
            .unwrap_or_default();

        let rect = monitors
            .iter()
            .find(|m| m.primary)
            .or_else(|| monitors.first())
            .map(|m| Rect::new(m.x.into(), m.y.into(), m.width.into(), m.height.into()))
            .unwrap_or_else(|| {
                Rect::new(0, 0, self.screen_size.0.into(), self.screen_size.1.into())
            });

        Ok(Some(rect))
    }

    pub async fn create_desktop(&self, position: u32, name: &str) -> Result<()> {
        // KWin counts positions from 0 and clamps past-the-end values to an append.
        self.kwin
            .create_desktop(position.saturating_sub(1), name)
            .await
            .context("createDesktop failed")
    }

    pub async fn remove_desktop(&self, id: &DesktopId) -> Result<()> {
        let kwin_id = self.kwin.id_at(number(id)? - 1).await?;
        self.kwin
            .remove_desktop(&kwin_id)
            .await
            .context("removeDesktop failed")
    }

    pub async fn rename_desktop(&self, id: &DesktopId, name: &str) -> Result<()> {
        let kwin_id = self.kwin.id_at(number(id)? - 1).await?;
        self.kwin
            .set_desktop_name(&kwin_id, name)
            .await
            .context("setDesktopName failed")
    }

    pub async fn rename_desktop_fallback(&self, id: &DesktopId, name: &str) -> Result<()> {
        rewrite_desktop_name(&*self.conn, &self.atoms, self.root, number(id)?, name)
    }

    pub async fn activate_desktop(&self, id: &DesktopId) -> Result<()> {
        ewmh::request_current_desktop(&*self.conn, &self.atoms, self.root, number(id)? - 1)
    }

    pub async fn move_window(
        &self,
        window: &WindowId,
        _from: &DesktopId,
        to: &DesktopId,
    ) -> Result<()> {
        let WindowId::X11(window) = window else {
            bail!("Window {window} does not belong to the X11 backend");
        };

        ewmh::request_window_desktop(&*self.conn, &self.atoms, self.root, *window, number(to)? - 1)
    }

    fn window_record(&self, window: Window) -> Result<WindowRecord> {
        let conn = &*self.conn;
        let atoms = &self.atoms;

        let membership = match ewmh::get_cardinal(conn, window, atoms._NET_WM_DESKTOP)? {
            Some(ALL_DESKTOPS) => Membership::AllDesktops,
            Some(index) => Membership::Desktops(vec![DesktopId::Number(index + 1)]),
            None => Membership::Desktops(Vec::new()),
        };

        let states = ewmh::get_u32_list(conn, window, atoms._NET_WM_STATE, AtomEnum::ATOM)?;
        let types = ewmh::get_u32_list(conn, window, atoms._NET_WM_WINDOW_TYPE, AtomEnum::ATOM)?;
        let kind = if types
            .iter()
            .any(|t| *t == atoms._NET_WM_WINDOW_TYPE_DOCK || *t == atoms._NET_WM_WINDOW_TYPE_DESKTOP)
        {
            WindowKind::Auxiliary
        } else {
            WindowKind::Normal
        };

        // WM_CLASS holds the instance name followed by the class name.
        let class = ewmh::get_string_list(conn, window, atoms.WM_CLASS, AtomEnum::STRING)?
            .into_iter()
            .nth(1)
            .unwrap_or_default();
        let title = ewmh::get_utf8_string(conn, atoms, window, atoms._NET_WM_NAME)?;

        let geometry = conn.get_geometry(window)?.reply()?;
        let origin = conn.translate_coordinates(window, self.root, 0, 0)?.reply()?;

        Ok(WindowRecord {
            id: WindowId::X11(window),
            title,
            class,
            membership,
            geometry: Rect::new(
                origin.dst_x.into(),
                origin.dst_y.into(),
                geometry.width.into(),
                geometry.height.into(),
            ),
            kind,
            skip_taskbar: states.contains(&atoms._NET_WM_STATE_SKIP_TASKBAR),
            skip_pager: states.contains(&atoms._NET_WM_STATE_SKIP_PAGER),
            skip_switcher: false,
            demands_attention: states.contains(&atoms._NET_WM_STATE_DEMANDS_ATTENTION),
        })
    }
}

fn number(id: &DesktopId) -> Result<u32> {
    match id {
        DesktopId::Number(n) if *n >= 1 => Ok(*n),
        other => Err(anyhow!(
            "Desktop id {other} is not valid for the {:?} backend",
            BackendKind::Legacy
        )),
    }
}

fn select_property_changes<C: Connection>(conn: &C, window: Window) -> Result<()> {
    conn.change_window_attributes(
        window,
        &ChangeWindowAttributesAux::new().event_mask(EventMask::PROPERTY_CHANGE),
    )?
    .check()?;
    Ok(())
}

/// Renames desktop `number` (1-based) through a fresh connection to the X
/// server. On Wayland this reaches Xwayland, which KWin keeps in sync only
/// loosely.
pub fn rename_via_ewmh(number: u32, name: &str) -> Result<()> {
    let (conn, screen_num) = x11rb::connect(None).context("Failed to connect to Xwayland")?;
    let root = conn.setup().roots[screen_num].root;
    let atoms = Atoms::new(&conn)?.reply()?;

    rewrite_desktop_name(&conn, &atoms, root, number, name)
}

fn rewrite_desktop_name<C: Connection>(
    conn: &C,
    atoms: &Atoms,
    root: Window,
    number: u32,
    name: &str,
) -> Result<()> {
    let count = ewmh::get_cardinal(conn, root, atoms._NET_NUMBER_OF_DESKTOPS)?.unwrap_or(number);
    let mut names = ewmh::get_string_list(conn, root, atoms._NET_DESKTOP_NAMES, atoms.UTF8_STRING)?;

    names.resize(count.max(number) as usize, String::new());
    names[number as usize - 1] = name.to_string();

    ewmh::set_desktop_names(conn, atoms, root, &names)
}

fn spawn_event_reader(
    conn: Arc<RustConnection>,
    root: Window,
    atoms: Atoms,
    notifications: UnboundedSender<Notification>,
) -> Result<()> {
    thread::Builder::new()
        .name("x11-events".to_string())
        .spawn(move || {
            loop {
                let event = match conn.wait_for_event() {
                    Ok(event) => event,
                    Err(e) => {
                        error!("X11 connection lost: {e}");
                        break;
                    }
                };

                let Event::PropertyNotify(event) = event else {
                    continue;
                };

                let notification = if event.window == root {
                    match event.atom {
                        atom if atom == atoms._NET_CURRENT_DESKTOP => {
                            Some(Notification::CurrentDesktopChanged)
                        }
                        atom if atom == atoms._NET_NUMBER_OF_DESKTOPS => {
                            Some(Notification::DesktopCountChanged)
                        }
                        atom if atom == atoms._NET_DESKTOP_NAMES => {
                            Some(Notification::DesktopNamesChanged)
                        }
                        atom if atom == atoms._NET_CLIENT_LIST => {
                            watch_new_clients(&*conn, root, &atoms);
                            None
                        }
                        _ => None,
                    }
                } else if event.atom == atoms._NET_WM_STATE {
                    Some(Notification::WindowStateChanged)
                } else {
                    None
                };

                if let Some(notification) = notification
                    && notifications.send(notification).is_err()
                {
                    debug!("Notification receiver dropped, stopping X11 event reader");
                    break;
                }
            }
        })
        .context("Failed to spawn X11 event reader")?;

    Ok(())
}

fn watch_new_clients<C: Connection>(conn: &C, root: Window, atoms: &Atoms) {
    let clients = match ewmh::get_u32_list(conn, root, atoms._NET_CLIENT_LIST, AtomEnum::WINDOW) {
        Ok(clients) => clients,
        Err(e) => {
            warn!("Failed to read client list: {e}");
            return;
        }
    };

    // Re-selecting the mask on an already watched window is a no-op.
    for window in clients {
        if let Err(e) = select_property_changes(conn, window) {
            debug!("Cannot watch window {window:#x}: {e}");
        }
    }
    let _ = conn.flush();
}
