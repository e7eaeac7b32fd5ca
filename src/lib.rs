//! Connection and stream-negotiation layer for an XMPP external component.

pub mod component;
pub mod config;

pub use component::{Component, ComponentBuilder, ComponentError};
pub use config::ComponentConfig;
