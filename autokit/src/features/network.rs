//! Access points for the DUT, through NetworkManager over the system bus.
//!
//! Connections are added unsaved, so nothing outlives a reboot of the host even if teardown
//! never runs.

use std::collections::HashMap;

use zbus::{
    proxy,
    zvariant::{ObjectPath, OwnedObjectPath, Value},
};

use crate::{Error, Result};

pub const DEFAULT_SSID: &str = "autokit-wifi";
pub const DEFAULT_PSK: &str = "autokit-wifi-psk";

type ConnectionSettings = HashMap<&'static str, HashMap<&'static str, Value<'static>>>;

#[proxy(
    interface = "org.freedesktop.NetworkManager",
    default_service = "org.freedesktop.NetworkManager",
    default_path = "/org/freedesktop/NetworkManager"
)]
trait NetworkManager {
    fn get_device_by_ip_iface(&self, iface: &str) -> zbus::Result<OwnedObjectPath>;

    fn activate_connection(
        &self,
        connection: &ObjectPath<'_>,
        device: &ObjectPath<'_>,
        specific_object: &ObjectPath<'_>,
    ) -> zbus::Result<OwnedObjectPath>;

    fn deactivate_connection(&self, active_connection: &ObjectPath<'_>) -> zbus::Result<()>;
}

#[proxy(
    interface = "org.freedesktop.NetworkManager.Settings",
    default_service = "org.freedesktop.NetworkManager",
    default_path = "/org/freedesktop/NetworkManager/Settings"
)]
trait Settings {
    fn add_connection_unsaved(
        &self,
        connection: ConnectionSettings,
    ) -> zbus::Result<OwnedObjectPath>;
}

#[proxy(
    interface = "org.freedesktop.NetworkManager.Settings.Connection",
    default_service = "org.freedesktop.NetworkManager"
)]
trait SettingsConnection {
    fn delete(&self) -> zbus::Result<()>;
}

#[derive(Debug)]
struct AccessPoint {
    iface: String,
    settings: OwnedObjectPath,
    active: OwnedObjectPath,
}

/// Wired (shared mode) and wireless (WPA-PSK) access points for the DUT. At most one of each.
pub struct Network {
    conn: zbus::Connection,
    wired: Option<AccessPoint>,
    wireless: Option<AccessPoint>,
}

impl Network {
    pub async fn connect() -> Result<Self> {
        let conn = zbus::Connection::system().await.map_err(nm_error)?;
        Ok(Self {
            conn,
            wired: None,
            wireless: None,
        })
    }

    /// Share the host's connection on `iface`. Replaces a previous wired access point.
    pub async fn add_wired_connection(&mut self, iface: &str) -> Result<()> {
        if let Some(ap) = self.wired.take() {
            self.remove(ap).await?;
        }

        let ap = self.add(wired_settings(&connection_id()), iface).await?;
        tracing::info!("Wired access point up on {iface}");
        self.wired = Some(ap);
        Ok(())
    }

    /// Replaces a previous wireless access point.
    pub async fn add_wireless_connection(
        &mut self,
        ssid: &str,
        psk: &str,
        iface: &str,
    ) -> Result<()> {
        if let Some(ap) = self.wireless.take() {
            self.remove(ap).await?;
        }

        let ap = self
            .add(wireless_settings(&connection_id(), ssid, psk), iface)
            .await?;
        tracing::info!("Wireless access point {ssid} up on {iface}");
        self.wireless = Some(ap);
        Ok(())
    }

    /// Take down every access point added by this instance.
    pub async fn teardown(&mut self) {
        for ap in [self.wired.take(), self.wireless.take()].into_iter().flatten() {
            let iface = ap.iface.clone();
            if let Err(e) = self.remove(ap).await {
                tracing::warn!("Failed to remove access point on {iface}: {e}");
            }
        }
    }

    async fn add(&self, settings: ConnectionSettings, iface: &str) -> Result<AccessPoint> {
        let nm = NetworkManagerProxy::new(&self.conn).await.map_err(nm_error)?;
        let nm_settings = SettingsProxy::new(&self.conn).await.map_err(nm_error)?;

        let settings = nm_settings
            .add_connection_unsaved(settings)
            .await
            .map_err(nm_error)?;
        let device = nm.get_device_by_ip_iface(iface).await.map_err(nm_error)?;
        let active = nm
            .activate_connection(
                &settings,
                &device,
                &ObjectPath::from_static_str_unchecked("/"),
            )
            .await
            .map_err(nm_error)?;

        Ok(AccessPoint {
            iface: iface.to_string(),
            settings,
            active,
        })
    }

    async fn remove(&self, ap: AccessPoint) -> Result<()> {
        let nm = NetworkManagerProxy::new(&self.conn).await.map_err(nm_error)?;
        nm.deactivate_connection(&ap.active).await.map_err(nm_error)?;

        SettingsConnectionProxy::builder(&self.conn)
            .path(ap.settings)
            .map_err(nm_error)?
            .build()
            .await
            .map_err(nm_error)?
            .delete()
            .await
            .map_err(nm_error)?;

        tracing::info!("Removed access point on {}", ap.iface);
        Ok(())
    }
}

fn nm_error(e: zbus::Error) -> Error {
    Error::Network(e.to_string())
}

fn connection_id() -> String {
    format!("autokit-{}", uuid::Uuid::new_v4().simple())
}

fn connection_section(id: &str, kind: &'static str) -> HashMap<&'static str, Value<'static>> {
    HashMap::from([
        ("id", Value::from(id.to_string())),
        ("type", Value::from(kind)),
        ("autoconnect", Value::from(false)),
    ])
}

fn ip_sections(settings: &mut ConnectionSettings) {
    settings.insert("ipv4", HashMap::from([("method", Value::from("shared"))]));
    settings.insert("ipv6", HashMap::from([("method", Value::from("ignore"))]));
}

fn wired_settings(id: &str) -> ConnectionSettings {
    let mut settings = HashMap::from([("connection", connection_section(id, "802-3-ethernet"))]);
    ip_sections(&mut settings);
    settings
}

fn wireless_settings(id: &str, ssid: &str, psk: &str) -> ConnectionSettings {
    let mut settings = HashMap::from([
        ("connection", connection_section(id, "802-11-wireless")),
        (
            "802-11-wireless",
            HashMap::from([
                ("mode", Value::from("ap")),
                ("ssid", Value::from(ssid.as_bytes().to_vec())),
            ]),
        ),
        (
            "802-11-wireless-security",
            HashMap::from([
                ("key-mgmt", Value::from("wpa-psk")),
                ("psk", Value::from(psk.to_string())),
            ]),
        ),
    ]);
    ip_sections(&mut settings);
    settings
}
