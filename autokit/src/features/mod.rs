//! Collaborators that sit next to the DUT: access points for it to join and a camera pointed at
//! its display.

#[cfg(feature = "network")]
mod network;
mod video;

#[cfg(feature = "network")]
pub use network::{DEFAULT_PSK, DEFAULT_SSID, Network};
pub use video::Video;
