//! # Pinotify - Message Notifier with a Physical Indicator
//!
//! Pinotify keeps one "active" message per device in sync with a backend, and tells
//! a small serial/Bluetooth indicator to blink while that message is unacknowledged.
//! Pressing the indicator's button sends a dismiss byte back, which acknowledges
//! the message and advances the device's ack watermark.
//!
//! ## Features
//!
//! - **Durable State**: device token, ack watermark and active message survive restarts (sled).
//! - **Device Sync**: one request/response exchange carries the watermark up and the
//!   oldest unacknowledged message down.
//! - **Indicator Link**: connect-on-demand serial/RFCOMM stream with bounded retry and a
//!   background listener for one-byte frames.
//! - **Triggers**: push notifications, a periodic poll and acknowledgements all funnel
//!   through one async service loop.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pinotify::command::{Command, CommandEncoder};
//! use pinotify::config::{ArmedFlag, Config};
//! use pinotify::link::{serial::SerialConnector, LinkTransport};
//! use pinotify::notifier::{LogDisplay, Notifier};
//! use pinotify::state::StateStore;
//! use pinotify::sync::{http::HttpBackend, SyncClient};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let armed = ArmedFlag::new(true);
//!     let store = Arc::new(StateStore::open_sled(config.storage.state_path(), None)?);
//!     let sync = Arc::new(SyncClient::new(
//!         store,
//!         Arc::new(HttpBackend::new(&config.backend)),
//!         armed.clone(),
//!     ));
//!     let transport = Arc::new(LinkTransport::new(
//!         Arc::new(SerialConnector::new(config.link.baud_rate)),
//!         config.link.port.clone(),
//!         config.link.send_attempts,
//!     ));
//!     let encoder = CommandEncoder::new(transport, armed, Command::blink(2, 2)?);
//!     let notifier = Notifier::new(sync, encoder);
//!     notifier.add_display(Arc::new(LogDisplay));
//!
//!     let (triggers, service) = notifier.spawn(config.poll.interval());
//!     triggers.push(None);
//!     tokio::signal::ctrl_c().await?;
//!     triggers.shutdown();
//!     service.await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`state`] - durable local state and change notification
//! - [`sync`] - device sync exchange with the backend
//! - [`link`] - byte stream to the indicator and its listener
//! - [`command`] - one-byte command alphabet and the blink/dismiss encoder
//! - [`notifier`] - triggers and the service loop tying it all together
//! - [`config`] - configuration management and validation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │    Notifier     │ ← Triggers: push, poll, ack, token refresh
//! └─────────────────┘
//!      │        │
//! ┌─────────┐ ┌─────────────────┐
//! │  Sync   │ │ Command Encoder │ ← Blink on new message, dismiss → ack
//! └─────────┘ └─────────────────┘
//!      │        │
//! ┌─────────┐ ┌─────────────────┐
//! │  State  │ │ Link Transport  │ ← Serial / RFCOMM
//! └─────────┘ └─────────────────┘
//! ```

pub mod command;
pub mod config;
pub mod link;
pub mod logutil;
pub mod notifier;
pub mod state;
pub mod sync;
