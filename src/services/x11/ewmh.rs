//! EWMH atoms and property helpers for the X11 backend.

use anyhow::{Context, Result};
use x11rb::{
    atom_manager,
    connection::Connection,
    protocol::xproto::{
        Atom, AtomEnum, ClientMessageEvent, ConnectionExt, EventMask, PropMode, Window,
    },
    wrapper::ConnectionExt as _,
};

/// `_NET_WM_DESKTOP` value of windows shown on every desktop.
pub const ALL_DESKTOPS: u32 = 0xFFFF_FFFF;

/// Source indication for client messages: sent by a pager.
const SOURCE_PAGER: u32 = 2;

atom_manager! {
    pub Atoms: AtomsCookie {
        UTF8_STRING,
        WM_CLASS,
        _NET_CLIENT_LIST,
        _NET_CLIENT_LIST_STACKING,
        _NET_CURRENT_DESKTOP,
        _NET_NUMBER_OF_DESKTOPS,
        _NET_DESKTOP_NAMES,
        _NET_WM_NAME,
        _NET_WM_DESKTOP,
        _NET_WM_STATE,
        _NET_WM_STATE_SKIP_TASKBAR,
        _NET_WM_STATE_SKIP_PAGER,
        _NET_WM_STATE_DEMANDS_ATTENTION,
        _NET_WM_WINDOW_TYPE,
        _NET_WM_WINDOW_TYPE_DOCK,
        _NET_WM_WINDOW_TYPE_DESKTOP,
    }
}

pub fn get_cardinal<C: Connection>(conn: &C, window: Window, property: Atom) -> Result<Option<u32>> {
    let reply = conn
        .get_property(false, window, property, AtomEnum::CARDINAL, 0, 1)?
        .reply()
        .with_context(|| format!("Failed to read cardinal property {property}"))?;

    Ok(reply.value32().and_then(|mut values| values.next()))
}

pub fn get_u32_list<C: Connection>(
    conn: &C,
    window: Window,
    property: Atom,
    kind: impl Into<Atom>,
) -> Result<Vec<u32>> {
    let reply = conn
        .get_property(false, window, property, kind, 0, u32::MAX)?
        .reply()
        .with_context(|| format!("Failed to read list property {property}"))?;

    Ok(reply
        .value32()
        .map(|values| values.collect())
        .unwrap_or_default())
}

/// Reads a property made of NUL separated strings (`WM_CLASS`, `_NET_DESKTOP_NAMES`).
pub fn get_string_list<C: Connection>(
    conn: &C,
    window: Window,
    property: Atom,
    kind: impl Into<Atom>,
) -> Result<Vec<String>> {
    let reply = conn
        .get_property(false, window, property, kind, 0, u32::MAX)?
        .reply()
        .with_context(|| format!("Failed to read string property {property}"))?;

    Ok(split_nul_strings(&reply.value))
}

pub fn get_utf8_string<C: Connection>(
    conn: &C,
    atoms: &Atoms,
    window: Window,
    property: Atom,
) -> Result<String> {
    Ok(get_string_list(conn, window, property, atoms.UTF8_STRING)?
        .into_iter()
        .next()
        .unwrap_or_default())
}

pub fn set_desktop_names<C: Connection>(
    conn: &C,
    atoms: &Atoms,
    root: Window,
    names: &[String],
) -> Result<()> {
    let mut data = Vec::new();
    for name in names {
        data.extend_from_slice(name.as_bytes());
        data.push(0);
    }

    conn.change_property8(
        PropMode::REPLACE,
        root,
        atoms._NET_DESKTOP_NAMES,
        atoms.UTF8_STRING,
        &data,
    )?
    .check()
    .context("Failed to write _NET_DESKTOP_NAMES")?;
    conn.flush()?;

    Ok(())
}

/// Asks the window manager to change a root or client property on our behalf.
pub fn send_root_message<C: Connection>(
    conn: &C,
    root: Window,
    window: Window,
    message_type: Atom,
    data: [u32; 5],
) -> Result<()> {
    let event = ClientMessageEvent::new(32, window, message_type, data);

    conn.send_event(
        false,
        root,
        EventMask::SUBSTRUCTURE_NOTIFY | EventMask::SUBSTRUCTURE_REDIRECT,
        event,
    )?
    .check()
    .with_context(|| format!("Failed to send client message {message_type}"))?;
    conn.flush()?;

    Ok(())
}

/// `_NET_CURRENT_DESKTOP` request. `index` is 0-based.
pub fn request_current_desktop<C: Connection>(
    conn: &C,
    atoms: &Atoms,
    root: Window,
    index: u32,
) -> Result<()> {
    send_root_message(
        conn,
        root,
        root,
        atoms._NET_CURRENT_DESKTOP,
        [index, x11rb::CURRENT_TIME, 0, 0, 0],
    )
}

/// `_NET_WM_DESKTOP` request. `index` is 0-based.
pub fn request_window_desktop<C: Connection>(
    conn: &C,
    atoms: &Atoms,
    root: Window,
    window: Window,
    index: u32,
) -> Result<()> {
    send_root_message(
        conn,
        root,
        window,
        atoms._NET_WM_DESKTOP,
        [index, SOURCE_PAGER, 0, 0, 0],
    )
}

fn split_nul_strings(raw: &[u8]) -> Vec<String> {
    let raw = raw.strip_suffix(&[0]).unwrap_or(raw);
    if raw.is_empty() {
        return Vec::new();
    }

    raw.split(|b| *b == 0)
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect()
}
