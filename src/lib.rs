//! The core runtime of a MongoDB driver: server discovery and monitoring (SDAM), connection
//! pooling (CMAP), the OP_MSG wire protocol, and the authentication state machines, including
//! the MONGODB-OIDC token cache and its reauthentication protocol.
//!
//! This crate deliberately stops below the user-facing CRUD API: commands go in and replies
//! come out as raw BSON via [`Client::run_command`], and concerns like connection-string
//! parsing, TLS setup, and sessions belong to the layers built on top of it.
//!
//! ```no_run
//! use mongodb_core::{bson::doc, options::ClientOptions, options::ServerAddress, Client};
//!
//! # async fn run() -> mongodb_core::error::Result<()> {
//! let options = ClientOptions::builder()
//!     .hosts(vec![ServerAddress::parse("localhost:27017")?])
//!     .build();
//! let client = Client::with_options(options)?;
//!
//! let reply = client.run_command("admin", doc! { "ping": 1 }, None).await?;
//! assert_eq!(reply.get_f64("ok"), Ok(1.0));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub use bson;

mod bson_util;
mod client;
mod cmap;
mod compression;
pub mod error;
mod hello;
pub mod options;
mod runtime;
mod sdam;
pub mod selection_criteria;

pub use crate::{
    client::{auth::oidc, Client},
    sdam::{ServerInfo, ServerType, TopologyType},
};

/// A boxed future, as returned by the OIDC token callback.
pub type BoxFuture<'a, T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
