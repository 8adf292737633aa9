pub mod kwin;
pub mod types;
pub mod wayland;
pub mod x11;

pub use self::types::{
    DesktopEntry, DesktopId, Membership, Notification, Rect, WindowId, WindowKind, WindowRecord,
};

use crate::config::{BackendChoice, Config};
use anyhow::{Result, bail};
use std::{env, time::Duration};
use tokio::sync::mpsc::UnboundedSender;
use wayland::WaylandBackend;
use x11::X11Backend;

/// Which display server the window manager runs on. Decided once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// X11: desktops are numbered from 1.
    Legacy,
    /// Wayland: desktops carry opaque ids and positions count from 0.
    Modern,
}

impl BackendKind {
    /// Translates a backend position into the 1-based index shown to users.
    pub fn display_index(self, position: u32) -> u32 {
        match self {
            BackendKind::Legacy => position,
            BackendKind::Modern => position + 1,
        }
    }

    /// Inverse of [`BackendKind::display_index`].
    pub fn position(self, display_index: u32) -> u32 {
        match self {
            BackendKind::Legacy => display_index,
            BackendKind::Modern => display_index.saturating_sub(1),
        }
    }
}

pub fn probe(choice: BackendChoice) -> Result<BackendKind> {
    match choice {
        BackendChoice::Legacy => Ok(BackendKind::Legacy),
        BackendChoice::Modern => Ok(BackendKind::Modern),
        BackendChoice::Auto => probe_session(
            env::var("XDG_SESSION_TYPE").ok().as_deref(),
            env::var_os("WAYLAND_DISPLAY").is_some(),
            env::var_os("DISPLAY").is_some(),
        ),
    }
}

fn probe_session(
    session_type: Option<&str>,
    wayland_display: bool,
    x11_display: bool,
) -> Result<BackendKind> {
    match session_type.map(str::to_lowercase).as_deref() {
        Some("wayland") if wayland_display => return Ok(BackendKind::Modern),
        Some("x11") if x11_display => return Ok(BackendKind::Legacy),
        Some("wayland") | Some("x11") => {
            bail!("XDG_SESSION_TYPE does not match the available display sockets")
        }
        _ => {}
    }

    match (wayland_display, x11_display) {
        (true, false) => Ok(BackendKind::Modern),
        (false, true) => Ok(BackendKind::Legacy),
        (true, true) => bail!(
            "Both WAYLAND_DISPLAY and DISPLAY are set without XDG_SESSION_TYPE, pass --backend"
        ),
        (false, false) => bail!("No display server found (neither WAYLAND_DISPLAY nor DISPLAY)"),
    }
}

/// Operations the core needs from the window manager.
///
/// Every call may fail; a failed call means the operation did not happen.
#[allow(async_fn_in_trait)]
pub trait WindowManager {
    fn kind(&self) -> BackendKind;

    /// Ordered by position.
    async fn desktops(&self) -> Result<Vec<DesktopEntry>>;

    async fn current_desktop(&self) -> Result<Option<DesktopId>>;

    /// Bottom-most window first.
    async fn stacking_order(&self) -> Result<Vec<WindowRecord>>;

    /// Rectangle used by the multi-screen occupancy filter.
    async fn primary_screen(&self) -> Result<Option<Rect>>;

    /// `position` uses the backend's numbering convention.
    async fn create_desktop(&self, position: u32, name: &str) -> Result<()>;

    async fn remove_desktop(&self, id: &DesktopId) -> Result<()>;

    async fn rename_desktop(&self, id: &DesktopId, name: &str) -> Result<()>;

    /// Writes the EWMH desktop names directly. Names set this way are not
    /// persisted by the window manager.
    async fn rename_desktop_fallback(&self, id: &DesktopId, name: &str) -> Result<()>;

    async fn activate_desktop(&self, id: &DesktopId) -> Result<()>;

    async fn move_window(&self, window: &WindowId, from: &DesktopId, to: &DesktopId)
    -> Result<()>;
}

pub enum Backend {
    Legacy(X11Backend),
    Modern(WaylandBackend),
}

impl Backend {
    pub async fn connect(
        kind: BackendKind,
        config: &Config,
        notifications: UnboundedSender<Notification>,
    ) -> Result<Self> {
        let dbus = zbus::Connection::session().await?;

        match kind {
            BackendKind::Legacy => {
                log::info!("Using X11 backend");
                Ok(Backend::Legacy(X11Backend::new(&dbus, notifications).await?))
            }
            BackendKind::Modern => {
                log::info!("Using Wayland backend");
                let timeout = Duration::from_millis(config.handshake_timeout_ms);
                Ok(Backend::Modern(
                    WaylandBackend::new(&dbus, notifications, timeout).await?,
                ))
            }
        }
    }
}

impl WindowManager for Backend {
    fn kind(&self) -> BackendKind {
        match self {
            Backend::Legacy(_) => BackendKind::Legacy,
            Backend::Modern(_) => BackendKind::Modern,
        }
    }

    async fn desktops(&self) -> Result<Vec<DesktopEntry>> {
        match self {
            Backend::Legacy(b) => b.desktops().await,
            Backend::Modern(b) => b.desktops().await,
        }
    }

    async fn current_desktop(&self) -> Result<Option<DesktopId>> {
        match self {
            Backend::Legacy(b) => b.current_desktop().await,
            Backend::Modern(b) => b.current_desktop().await,
        }
    }

    async fn stacking_order(&self) -> Result<Vec<WindowRecord>> {
        match self {
            Backend::Legacy(b) => b.stacking_order().await,
            Backend::Modern(b) => b.stacking_order().await,
        }
    }

    async fn primary_screen(&self) -> Result<Option<Rect>> {
        match self {
            Backend::Legacy(b) => b.primary_screen().await,
            Backend::Modern(b) => b.primary_screen().await,
        }
    }

    async fn create_desktop(&self, position: u32, name: &str) -> Result<()> {
        match self {
            Backend::Legacy(b) => b.create_desktop(position, name).await,
            Backend::Modern(b) => b.create_desktop(position, name).await,
        }
    }

    async fn remove_desktop(&self, id: &DesktopId) -> Result<()> {
        match self {
            Backend::Legacy(b) => b.remove_desktop(id).await,
            Backend::Modern(b) => b.remove_desktop(id).await,
        }
    }

    async fn rename_desktop(&self, id: &DesktopId, name: &str) -> Result<()> {
        match self {
            Backend::Legacy(b) => b.rename_desktop(id, name).await,
            Backend::Modern(b) => b.rename_desktop(id, name).await,
        }
    }

    async fn rename_desktop_fallback(&self, id: &DesktopId, name: &str) -> Result<()> {
        match self {
            Backend::Legacy(b) => b.rename_desktop_fallback(id, name).await,
            Backend::Modern(b) => b.rename_desktop_fallback(id, name).await,
        }
    }

    async fn activate_desktop(&self, id: &DesktopId) -> Result<()> {
        match self {
            Backend::Legacy(b) => b.activate_desktop(id).await,
            Backend::Modern(b) => b.activate_desktop(id).await,
        }
    }

    async fn move_window(
        &self,
        window: &WindowId,
        from: &DesktopId,
        to: &DesktopId,
    ) -> Result<()> {
        match self {
            Backend::Legacy(b) => b.move_window(window, from, to).await,
            Backend::Modern(b) => b.move_window(window, from, to).await,
        }
    }
}
