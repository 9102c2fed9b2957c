//! IRBIS64 library-server client for the bookmat cabinet.
//!
//! Three layers:
//!
//! - [`record`]: the tag/field/subfield codec and the structured views
//!   over exemplars (field 910) and loans (field 40);
//! - [`connection`]: the per-command TCP protocol (register, search,
//!   read, write, format) with its framing and return-code handling;
//! - [`service`]: the issue/return workflows over pattern-swept index
//!   searches, behind the [`LibraryClient`] trait; [`mock`] provides the
//!   in-memory backend for hosts and tests.

pub mod connection;
pub mod error;
pub mod mock;
pub mod record;
pub mod service;

pub use connection::{IrbisConfig, IrbisConnection, IrbisResponse};
pub use error::IrbisError;
pub use mock::MockLibrary;
pub use record::{Exemplar, Loan, Record, Subfields};
pub use service::{
    IrbisService, LibraryClient, RemoteBook, RemoteBookStatus, RemoteLoan, RemoteRole, RemoteUser,
};
