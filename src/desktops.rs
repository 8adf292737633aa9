//! Desktop records and the pure parts of the window census.

use crate::{
    config::WindowNameSubstitution,
    services::{BackendKind, DesktopEntry, DesktopId, Rect, WindowKind, WindowRecord},
};
use regex::Regex;
use serde::Serialize;

/// Separators between a document and the application in window titles.
const TITLE_SEPARATORS: [&str; 3] = [" - ", " – ", " — "];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DesktopRecord {
    pub id: DesktopId,
    /// 1-based display index.
    pub number: u32,
    pub name: String,
    pub is_current: bool,
    pub is_empty: bool,
    pub is_urgent: bool,
    pub active_window_name: String,
    pub window_name_list: Vec<String>,
}

impl DesktopRecord {
    pub fn from_entry(kind: BackendKind, entry: DesktopEntry, current: Option<&DesktopId>) -> Self {
        Self {
            is_current: current == Some(&entry.id),
            number: kind.display_index(entry.position),
            id: entry.id,
            name: entry.name,
            is_empty: false,
            is_urgent: false,
            active_window_name: String::new(),
            window_name_list: Vec::new(),
        }
    }

    /// Fills the window-derived fields from a census of this desktop.
    pub fn fill_windows(&mut self, census: &[WindowRecord], names: &WindowNames, kind: BackendKind) {
        self.is_empty = census.is_empty();
        self.is_urgent = census.iter().any(|w| w.demands_attention);
        self.window_name_list = census.iter().map(|w| names.display_name(kind, w)).collect();
        self.active_window_name = self.window_name_list.first().cloned().unwrap_or_default();
    }
}

/// Whether `window` counts toward the occupancy of `desktop`.
///
/// With a `screen`, windows with less than half their width or height on it
/// are left out.
pub fn counts_toward(window: &WindowRecord, desktop: &DesktopId, screen: Option<&Rect>) -> bool {
    if window.skip_taskbar || window.skip_pager || window.skip_switcher {
        return false;
    }
    if window.kind != WindowKind::Normal {
        return false;
    }
    if !window.membership.includes(desktop) {
        return false;
    }

    match screen {
        Some(screen) => {
            let geometry = &window.geometry;
            let visible = screen.intersected(geometry);
            visible.width >= geometry.width / 2 && visible.height >= geometry.height / 2
        }
        None => true,
    }
}

/// Windows on `desktop`, top-most first. `stacking` is bottom-most first.
pub fn census(stacking: &[WindowRecord], desktop: &DesktopId, screen: Option<&Rect>) -> Vec<WindowRecord> {
    stacking
        .iter()
        .rev()
        .filter(|w| counts_toward(w, desktop, screen))
        .cloned()
        .collect()
}

/// Display indexes of the desktops holding no windows.
///
/// Strict: the desktop's census is empty. Lenient: no counted window names the
/// desktop explicitly, so windows on all desktops are ignored.
pub fn empty_desktops(desktops: &[DesktopRecord], stacking: &[WindowRecord], strict: bool) -> Vec<u32> {
    desktops
        .iter()
        .filter(|desktop| {
            let windows = census(stacking, &desktop.id, None);
            if strict {
                windows.is_empty()
            } else {
                !windows.iter().any(|w| w.membership.names(&desktop.id))
            }
        })
        .map(|desktop| desktop.number)
        .collect()
}

/// The application name shown for each window.
pub struct WindowNames {
    substitutions: Vec<(Regex, String)>,
}

impl WindowNames {
    pub fn new(substitutions: &[WindowNameSubstitution]) -> Self {
        let substitutions = substitutions
            .iter()
            .filter_map(|s| match Regex::new(&s.pattern) {
                Ok(regex) => Some((regex, s.name.clone())),
                Err(e) => {
                    log::warn!("Skipping window name pattern {:?}: {e}", s.pattern);
                    None
                }
            })
            .collect();

        Self { substitutions }
    }

    /// The legacy backend names windows by class, the modern one by title.
    pub fn display_name(&self, kind: BackendKind, window: &WindowRecord) -> String {
        match kind {
            BackendKind::Legacy => self.substitute(&window.class),
            BackendKind::Modern => application_from_title(&window.title)
                .unwrap_or(&window.class)
                .to_string(),
        }
    }

    fn substitute(&self, class: &str) -> String {
        self.substitutions
            .iter()
            .find(|(regex, _)| regex.is_match(class))
            .map(|(_, name)| name.clone())
            .unwrap_or_else(|| class.to_string())
    }
}

/// "Document.txt - LibreOffice Writer" gives "LibreOffice Writer".
///
/// None when nothing but whitespace is left to show.
fn application_from_title(title: &str) -> Option<&str> {
    let name = TITLE_SEPARATORS
        .iter()
        .filter_map(|sep| title.rfind(sep).map(|at| at + sep.len()))
        .max()
        .map_or(title, |start| &title[start..])
        .trim();

    (!name.is_empty()).then_some(name)
}
