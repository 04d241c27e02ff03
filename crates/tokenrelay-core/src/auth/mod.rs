//! Credentials and the login session built on them.
//!
//! - `CredentialStore`: durable slot for the access/refresh token pair, with
//!   file, OS keyring and in-memory backends
//! - `decode_identity`: reads subject, role and expiry out of an access token
//! - `SessionController`: login, logout and the identity derived from the
//!   stored pair

pub mod claims;
pub mod credentials;
pub mod session;

pub use claims::{decode_identity, CodecError, Identity, Role};
pub use credentials::{
    CredentialPair, CredentialStore, FileCredentialStore, KeyringCredentialStore,
    MemoryCredentialStore, CREDENTIALS_SLOT,
};
pub use session::{LoginError, LogoutReason, SessionController, SessionEvent};
