use serde::{Deserialize, Serialize};
use std::fmt;

/// Native desktop identifier.
///
/// The legacy backend numbers desktops from 1, the modern backend hands out
/// opaque tokens. The two are never comparable with each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DesktopId {
    Number(u32),
    Token(String),
}

impl fmt::Display for DesktopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DesktopId::Number(n) => write!(f, "{n}"),
            DesktopId::Token(t) => write!(f, "{t}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WindowId {
    X11(u32),
    Uuid(String),
}

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowId::X11(id) => write!(f, "{id:#x}"),
            WindowId::Uuid(uuid) => write!(f, "{uuid}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn intersected(&self, other: &Rect) -> Rect {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.width).min(other.x + other.width);
        let bottom = (self.y + self.height).min(other.y + other.height);

        if right <= left || bottom <= top {
            Rect::default()
        } else {
            Rect::new(left, top, right - left, bottom - top)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Membership {
    /// Only the legacy backend reports this sentinel.
    AllDesktops,
    Desktops(Vec<DesktopId>),
}

impl Membership {
    /// Whether the window shows up on `desktop`, counting "all desktops".
    pub fn includes(&self, desktop: &DesktopId) -> bool {
        match self {
            Membership::AllDesktops => true,
            Membership::Desktops(ids) => ids.contains(desktop),
        }
    }

    /// Whether the window's reported membership names `desktop` explicitly.
    pub fn names(&self, desktop: &DesktopId) -> bool {
        match self {
            Membership::AllDesktops => false,
            Membership::Desktops(ids) => ids.contains(desktop),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WindowKind {
    #[default]
    Normal,
    /// Docks, panels and desktop backgrounds.
    Auxiliary,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowRecord {
    pub id: WindowId,
    pub title: String,
    pub class: String,
    pub membership: Membership,
    pub geometry: Rect,
    pub kind: WindowKind,
    pub skip_taskbar: bool,
    pub skip_pager: bool,
    pub skip_switcher: bool,
    pub demands_attention: bool,
}

/// One desktop as reported by the window manager, before any derived fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesktopEntry {
    pub id: DesktopId,
    /// Position in the backend's own numbering convention.
    pub position: u32,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Notification {
    CurrentDesktopChanged,
    DesktopCountChanged,
    DesktopNamesChanged,
    /// Legacy backend only.
    WindowStateChanged,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_intersection() {
        let screen = Rect::new(0, 0, 1920, 1080);
        let window = Rect::new(1800, 100, 400, 300);
        assert_eq!(screen.intersected(&window), Rect::new(1800, 100, 120, 300));

        let outside = Rect::new(1920, 0, 100, 100);
        assert_eq!(screen.intersected(&outside), Rect::default());
    }

    #[test]
    fn test_membership_all_desktops_is_not_named() {
        let desktop = DesktopId::Number(2);
        assert!(Membership::AllDesktops.includes(&desktop));
        assert!(!Membership::AllDesktops.names(&desktop));

        let explicit = Membership::Desktops(vec![DesktopId::Number(2)]);
        assert!(explicit.includes(&desktop));
        assert!(explicit.names(&desktop));
        assert!(!explicit.includes(&DesktopId::Number(3)));
    }

    #[test]
    fn test_desktop_id_serializes_flat() {
        assert_eq!(
            serde_json::to_string(&DesktopId::Number(3)).unwrap(),
            "3".to_string()
        );
        assert_eq!(
            serde_json::to_string(&DesktopId::Token("abc".into())).unwrap(),
            "\"abc\"".to_string()
        );
    }
}
