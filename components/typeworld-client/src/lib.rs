/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! # Type.World client
//!
//! The core of a client that subscribes to remote font-distribution
//! endpoints, synchronizes subscription state with the central
//! coordination server, and installs font binaries under the per-user
//! seat policy enforced by each publisher.
//!
//! The top-level object is [`TypeWorldClient`]. It owns durable state
//! (preferences and keyring), materializes [`Publisher`] and
//! [`Subscription`] handles from it, talks to the central server through
//! a typed [`mothership`] client, defers account/subscription commands
//! while offline, and reacts to live push notifications.
//!
//! ```no_run
//! use typeworld_client::{ClientConfig, TypeWorldClient};
//!
//! # fn main() -> typeworld_client::Result<()> {
//! let client = TypeWorldClient::builder()
//!     .config(ClientConfig::default())
//!     .build()?;
//! let (publisher, subscription) =
//!     client.add_subscription("typeworld://json+https//s9lWvayTEOaB:secret@fonts.example.com/api/")?;
//! println!("{} fonts installed", publisher.amount_installed_fonts()?);
//! # drop(subscription);
//! # Ok(())
//! # }
//! ```
//!
//! Wire-format protocol implementations are not part of this crate; the
//! embedding application registers them with the builder (see
//! [`protocol::ProtocolRegistry`]). The [`testing`] module ships a
//! scriptable in-process publisher used by this crate's own tests.

pub mod cache;
pub mod catalog;
mod client;
pub mod config;
pub mod delegate;
mod error;
pub mod keyring;
pub mod mothership;
pub mod prefs;
pub mod protocol;
mod publisher;
pub mod push;
pub mod queue;
mod subscription;
pub mod testing;
pub mod urls;

pub use client::{ClientBuilder, Invitation, TypeWorldClient};
pub use config::ClientConfig;
pub use delegate::DelegateCallbacks;
pub use error::{ClientError, Result};
pub use publisher::{default_fonts_folder, Publisher};
pub use subscription::Subscription;
pub use urls::SubscriptionUrl;
