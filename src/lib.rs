//! # rswitch - Multi-Vendor Switch Session Automation
//!
//! `rswitch` drives interactive command-line sessions on network switches
//! from Cisco IOS, H3C Comware, Juniper JunOS and Huawei VRP. It detects the
//! vendor of a freshly connected device, tracks the device's mode from its
//! prompts, moves between modes along the vendor's transition commands, and
//! translates vendor-neutral operations into vendor-correct command sequences.
//!
//! ## Features
//!
//! - **Vendor Detection**: Banner signatures and prompt shapes, with explicit ambiguity
//! - **Declarative Profiles**: Each vendor is a JSON document, not a code branch
//! - **Mode Tracking**: Prompt-confirmed transitions from user mode down to interface config
//! - **Fail-Closed Dispatch**: Dangerous and unclassified commands need confirmation
//! - **Cross-Vendor Translation**: Table-driven operations and reverse lookup
//! - **Device Info**: Hostname, version, model, serial and uptime from each vendor's version command
//! - **Async/Await**: One worker per session on Tokio, cancellable at any point
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rswitch::session::{Credentials, MANAGER, OpenOptions};
//! use rswitch::transport::TransportDescriptor;
//! use rswitch::vendor::Mode;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let descriptor = TransportDescriptor::tcp("10.0.0.10", 2001);
//!     let id = MANAGER
//!         .open_with(
//!             &descriptor,
//!             OpenOptions::default().credentials(Credentials::new("admin", "secret")),
//!         )
//!         .await?;
//!
//!     let result = MANAGER.dispatch(&id, "sh ver").await?;
//!     println!("{}", result.output);
//!
//!     MANAGER.request_mode(&id, Mode::Config).await?;
//!     let session = MANAGER.session(&id).await?;
//!     let params = [("id", "10"), ("name", "Marketing")]
//!         .into_iter()
//!         .map(|(k, v)| (k.to_string(), v.to_string()))
//!         .collect();
//!     let vlan = MANAGER.render(&id, "create_vlan", &params).await?;
//!     println!("{:?} would run {:?}", session.vendor, vlan.commands);
//!
//!     MANAGER.close(&id).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Main Components
//!
//! - [`session::SessionManager`] - Opens sessions and serializes dispatch per session
//! - [`vendor::VendorProfile`] - Prompt grammar, aliases, prefixes and transitions of one vendor
//! - [`detect::VendorDetector`] - Infers the vendor from connect-time output
//! - [`channel::CommandChannel`] - Read-until-prompt loop over a [`transport::Transport`]
//! - [`translate::Translator`] - Operation rendering and cross-vendor translation
//! - [`error::SwitchError`] - Error kinds for sessions, profiles and translation

pub mod channel;
pub mod classify;
pub mod config;
pub mod detect;
pub mod error;
pub mod session;
pub mod state;
pub mod translate;
pub mod transport;
pub mod vendor;

pub use channel::CommandResult;
pub use classify::CommandClass;
pub use error::{SwitchError, TransportError};
pub use session::{DeviceSession, SessionManager, SessionStatus};
pub use vendor::{Mode, VendorId};
