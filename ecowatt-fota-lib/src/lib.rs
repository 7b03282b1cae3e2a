//! Secure, resumable firmware-over-the-air (FOTA) update engine.
//!
//! The engine fetches a firmware manifest, streams authenticated and
//! encrypted chunks, writes the plaintext to program storage and activates
//! the new image once its SHA-256 matches the manifest. Progress is persisted
//! after every chunk so an interrupted update resumes where it stopped.
//!
//! Everything that touches hardware or the network is behind a trait:
//!
//! - [`HttpClient`] performs raw GET/POST requests; [`FotaApi`] turns it into
//!   a [`FotaTransport`] speaking the cloud endpoints.
//! - [`StateStore`] persists the [`UpdateState`] record and the pending-boot
//!   marker.
//! - [`FlashWriter`] writes plaintext to the inactive image slot and
//!   activates it.
//!
//! [`Fota`] drives these collaborators through one update cycle.

pub mod crypto;
pub mod digest;
pub mod error;
pub mod flash;
pub mod manifest;
pub mod orchestrator;
pub mod package;
pub mod state;
pub mod transport;

#[cfg(test)]
mod fakes;

pub use crypto::FotaKeys;
pub use digest::{DigestCheckpoint, ImageDigest};
pub use error::{FetchError, FotaError, StorageError};
pub use flash::{is_erased, FlashWriter, ResumeErase};
pub use manifest::{Chunk, ChunkResponse, Report, ReportStatus, UpdateManifest};
pub use orchestrator::{Fota, FotaOutcome, FotaPhase};
pub use package::{FirmwarePackage, PackageError};
pub use state::{StateStore, UpdateState};
pub use transport::{FotaApi, FotaTransport, HttpClient, HttpResponse};
