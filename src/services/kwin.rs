use anyhow::Context;
use itertools::Itertools;
use std::ops::Deref;
use zbus::{Result, proxy, proxy::CacheProperties};

/// KWin's desktop manager service. It is the only interface that can create
/// and remove desktops at a given position on both display servers, and the
/// only one with a rename call.
pub struct KWinDbus<'a>(VirtualDesktopManagerProxy<'a>);

impl<'a> Deref for KWinDbus<'a> {
    type Target = VirtualDesktopManagerProxy<'a>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KWinDesktop {
    /// 0-based.
    pub position: u32,
    pub id: String,
    pub name: String,
}

impl KWinDbus<'static> {
    pub async fn new(conn: &zbus::Connection) -> anyhow::Result<Self> {
        // KWin does not reliably emit PropertiesChanged, so read through every time.
        let proxy = VirtualDesktopManagerProxy::builder(conn)
            .cache_properties(CacheProperties::No)
            .build()
            .await
            .context("Failed to create KWin VirtualDesktopManager proxy")?;

        Ok(Self(proxy))
    }

    pub async fn list(&self) -> anyhow::Result<Vec<KWinDesktop>> {
        Ok(self
            .desktops()
            .await
            .context("Failed to read KWin desktops property")?
            .into_iter()
            .map(|(position, id, name)| KWinDesktop { position, id, name })
            .sorted_by_key(|d| d.position)
            .collect())
    }

    /// Resolves a 0-based position to KWin's desktop id.
    pub async fn id_at(&self, position: u32) -> anyhow::Result<String> {
        self.list()
            .await?
            .into_iter()
            .find(|d| d.position == position)
            .map(|d| d.id)
            .with_context(|| format!("No desktop at position {position}"))
    }
}

#[proxy(
    interface = "org.kde.KWin.VirtualDesktopManager",
    default_service = "org.kde.KWin",
    default_path = "/VirtualDesktopManager"
)]
pub trait VirtualDesktopManager {
    #[zbus(name = "createDesktop")]
    fn create_desktop(&self, position: u32, name: &str) -> Result<()>;

    #[zbus(name = "removeDesktop")]
    fn remove_desktop(&self, id: &str) -> Result<()>;

    #[zbus(name = "setDesktopName")]
    fn set_desktop_name(&self, id: &str, name: &str) -> Result<()>;

    #[zbus(property, name = "desktops")]
    fn desktops(&self) -> Result<Vec<(u32, String, String)>>;
}
