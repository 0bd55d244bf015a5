//! Typed client for the klaviyo-relay forwarding API.
//!
//! Downstream automation talks to Klaviyo only through a running relay; it
//! never holds credentials itself.
//!
//! # Example
//!
//! ```no_run
//! use klaviyo_relay_client::{ForwardRequest, RelayClient, Result};
//! use serde_json::json;
//!
//! # async fn example() -> Result<()> {
//! let client = RelayClient::localhost(3001)?;
//!
//! if !client.status().await?.is_ready() {
//!     return Ok(());
//! }
//!
//! let created = client
//!     .forward(&ForwardRequest::post_json("/ajax/flows", json!({"name": "Welcome"})))
//!     .await?;
//! println!("{}", created.status);
//! # Ok(())
//! # }
//! ```
//!
//! Also here: [`invitation`] for accepting account invitations and
//! [`template`] for filling template payloads.

pub mod client;
pub mod error;
pub mod invitation;
pub mod template;
pub mod types;

pub use client::{ClientBuilder, RelayClient};
pub use error::{Error, Result};
pub use invitation::{InvitationEvent, InvitationOutcome, accept_invitation};
pub use template::{TokenMap, TokenPair};
pub use types::*;
