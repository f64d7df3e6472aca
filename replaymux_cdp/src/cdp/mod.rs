//! Hand-maintained protocol domains.
//!
//! The layout mirrors the upstream protocol split: stable browser domains
//! under [`browser_protocol`], the javascript runtime under [`js_protocol`].
//! Only the methods and events the recorder actually issues or observes are
//! typed; everything else flows through the raw event escape hatch.

pub mod browser_protocol;
pub mod events;
pub mod js_protocol;

pub use events::{CdpEvent, CdpEventMessage};
