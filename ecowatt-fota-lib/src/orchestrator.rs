//! The update cycle state machine.
//!
//! ```text
//! Idle -> CheckManifest -> UpToDate
//!                       -> PreparingWrite -> StreamingChunks -> VerifyingImage
//!                                         -> Committing -> RebootPending
//! (any step after CheckManifest) -> Aborted
//! ```
//!
//! One call to [`Fota::run`] is one cycle. Nothing is retried inside a
//! cycle; the caller re-invokes `run` on its own schedule and persisted
//! progress lets the next cycle continue mid-stream.

use crate::crypto::FotaKeys;
use crate::digest::ImageDigest;
use crate::error::{FetchError, FotaError, StorageError};
use crate::flash::FlashWriter;
use crate::manifest::{ReportStatus, UpdateManifest};
use crate::state::{StateStore, UpdateState};
use crate::transport::FotaTransport;
use derive_more::Display;
use log::{debug, error, info, warn};

/// Where the orchestrator currently is in the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum FotaPhase {
    Idle,
    CheckManifest,
    UpToDate,
    PreparingWrite,
    StreamingChunks,
    VerifyingImage,
    Committing,
    RebootPending,
    Aborted,
}

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FotaOutcome {
    /// The published version is already running.
    UpToDate,
    /// The new image was committed and a restart was requested.
    RebootPending { version: String },
    /// The cycle failed; the device keeps running the current image.
    Aborted(FotaError),
}

/// Update engine owning its transport, state store and flash writer for the
/// duration of a cycle.
pub struct Fota<T, S, W> {
    transport: T,
    store: S,
    flash: W,
    keys: FotaKeys,
    phase: FotaPhase,
}

impl<T, S, W> Fota<T, S, W>
where
    T: FotaTransport,
    S: StateStore,
    W: FlashWriter,
{
    pub fn new(transport: T, store: S, flash: W, keys: FotaKeys) -> Self {
        Self {
            transport,
            store,
            flash,
            keys,
            phase: FotaPhase::Idle,
        }
    }

    #[must_use]
    pub fn phase(&self) -> FotaPhase {
        self.phase
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn flash(&self) -> &W {
        &self.flash
    }

    pub fn into_parts(self) -> (T, S, W) {
        (self.transport, self.store, self.flash)
    }

    /// Run one update cycle for a device running `current_version`.
    ///
    /// Failures never escape as panics or errors: they are logged and
    /// returned as [`FotaOutcome::Aborted`].
    pub fn run(&mut self, current_version: &str) -> FotaOutcome {
        self.phase = FotaPhase::Idle;
        self.set_phase(FotaPhase::CheckManifest);
        self.confirm_pending_boot();

        match self.cycle(current_version) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.set_phase(FotaPhase::Aborted);
                if e.is_transient() {
                    warn!("FOTA: cycle aborted, will resume next cycle: {e}");
                } else if e.preserves_progress() {
                    error!("FOTA: cycle aborted, progress kept: {e}");
                } else {
                    error!("FOTA: cycle aborted, progress discarded: {e}");
                }
                FotaOutcome::Aborted(e)
            }
        }
    }

    fn set_phase(&mut self, phase: FotaPhase) {
        debug!("FOTA: {} -> {}", self.phase, phase);
        self.phase = phase;
    }

    /// A freshly activated image reports liveness before anything else.
    fn confirm_pending_boot(&mut self) {
        if !self.store.is_pending_boot() {
            return;
        }
        match self.transport.confirm_boot() {
            Ok(()) => {
                info!("FOTA: boot of new image confirmed");
                if let Err(e) = self.store.clear_pending_boot() {
                    error!("FOTA: failed to clear pending-boot marker: {e}");
                }
            }
            Err(e) => warn!("FOTA: boot confirmation failed, retrying next cycle: {e}"),
        }
    }

    fn cycle(&mut self, current_version: &str) -> Result<FotaOutcome, FotaError> {
        let manifest = self.transport.fetch_manifest()?;
        if manifest.version == current_version {
            info!("FOTA: running version {current_version} is current");
            if let Some(stale) = self.store.load() {
                info!("FOTA: dropping progress record for {}", stale.target_version);
                self.discard_progress();
            }
            self.set_phase(FotaPhase::UpToDate);
            return Ok(FotaOutcome::UpToDate);
        }
        manifest.validate().map_err(FotaError::ManifestInvalid)?;
        info!(
            "FOTA: update {current_version} -> {} ({} bytes in {} chunks)",
            manifest.version, manifest.size, manifest.total_chunks
        );

        self.set_phase(FotaPhase::PreparingWrite);
        let (mut state, mut digest) = self.prepare(&manifest)?;

        self.set_phase(FotaPhase::StreamingChunks);
        self.stream(&manifest, &mut state, &mut digest)?;

        self.set_phase(FotaPhase::VerifyingImage);
        self.verify(&manifest, &state, digest)?;

        self.set_phase(FotaPhase::Committing);
        self.commit(&manifest)?;

        Ok(FotaOutcome::RebootPending {
            version: manifest.version,
        })
    }

    /// Load or create the progress record and open the flash slot.
    fn prepare(&mut self, manifest: &UpdateManifest) -> Result<(UpdateState, ImageDigest), FotaError> {
        let resumed = self.store.load().and_then(|state| {
            if !state.matches(manifest) {
                info!(
                    "FOTA: discarding progress for {} (superseded by {})",
                    state.target_version, manifest.version
                );
                return None;
            }
            let digest = ImageDigest::restore(&state.digest)?;
            Some((state, digest))
        });

        let (state, digest) = match resumed {
            Some((state, digest)) => {
                info!(
                    "FOTA: resuming {} at chunk {}/{}",
                    state.target_version, state.next_chunk_index, state.total_chunks
                );
                (state, digest)
            }
            None => {
                let state = UpdateState::from_manifest(manifest);
                if let Err(e) = self.store.save(&state) {
                    self.discard_progress();
                    return Err(e.into());
                }
                (state, ImageDigest::new())
            }
        };

        if let Err(e) = self.flash.begin(manifest.size, state.written) {
            self.discard_progress();
            return Err(e.into());
        }
        Ok((state, digest))
    }

    fn stream(
        &mut self,
        manifest: &UpdateManifest,
        state: &mut UpdateState,
        digest: &mut ImageDigest,
    ) -> Result<(), FotaError> {
        let total = state.total_chunks;
        for index in state.next_chunk_index..total {
            let chunk = match self.transport.fetch_chunk(&manifest.version, index) {
                Ok(chunk) => chunk,
                Err(FetchError::IndexMismatch { requested, received }) => {
                    self.flash.abort();
                    return Err(FotaError::ChunkIndexMismatch { requested, received });
                }
                Err(e) => {
                    self.flash.abort();
                    return Err(e.into());
                }
            };

            if !self.keys.verify_chunk(index, &chunk.iv, &chunk.ciphertext, &chunk.mac) {
                self.flash.abort();
                return Err(FotaError::Authentication { index });
            }

            let mut data = chunk.ciphertext;
            self.keys.apply_keystream(&chunk.iv, &mut data);

            let written = u32::try_from(data.len())
                .ok()
                .and_then(|len| state.written.checked_add(len))
                .filter(|&written| written <= manifest.size);
            let Some(written) = written else {
                let actual = u64::from(state.written) + data.len() as u64;
                return Err(self.reject_image(
                    manifest,
                    FotaError::ImageSize {
                        expected: manifest.size,
                        actual,
                    },
                ));
            };

            if let Err(e) = self.write_chunk(&data) {
                self.flash.abort();
                self.discard_progress();
                return Err(e.into());
            }
            digest.update(&data);

            let previous = state.written;
            state.next_chunk_index = index + 1;
            state.written = written;
            state.digest = digest.checkpoint();
            if let Err(e) = self.store.save(state) {
                self.flash.abort();
                self.discard_progress();
                return Err(e.into());
            }

            debug!("FOTA: chunk {}/{total} written", index + 1);
            if crosses_milestone(previous, written, manifest.size) {
                info!(
                    "FOTA: {}% ({written}/{} bytes)",
                    percent(written, manifest.size),
                    manifest.size
                );
            }
            if let Err(e) = self.transport.report(ReportStatus::ChunkOk, index, &manifest.version) {
                warn!("FOTA: progress report for chunk {index} failed: {e}");
            }
        }
        Ok(())
    }

    fn write_chunk(&mut self, data: &[u8]) -> Result<(), StorageError> {
        let accepted = self.flash.write(data)?;
        if accepted != data.len() {
            return Err(StorageError::ShortWrite {
                written: accepted,
                expected: data.len(),
            });
        }
        Ok(())
    }

    fn verify(
        &mut self,
        manifest: &UpdateManifest,
        state: &UpdateState,
        digest: ImageDigest,
    ) -> Result<(), FotaError> {
        if state.written != manifest.size {
            return Err(self.reject_image(
                manifest,
                FotaError::ImageSize {
                    expected: manifest.size,
                    actual: u64::from(state.written),
                },
            ));
        }

        let actual = digest.finalize_hex();
        if !actual.eq_ignore_ascii_case(&manifest.content_hash) {
            return Err(self.reject_image(
                manifest,
                FotaError::ImageIntegrity {
                    expected: manifest.content_hash.to_ascii_lowercase(),
                    actual,
                },
            ));
        }
        info!("FOTA: image hash verified ({actual})");
        Ok(())
    }

    fn commit(&mut self, manifest: &UpdateManifest) -> Result<(), FotaError> {
        if let Err(e) = self.flash.commit(true) {
            self.discard_progress();
            return Err(e.into());
        }
        if let Err(e) = self.store.mark_pending_boot() {
            error!("FOTA: failed to set pending-boot marker: {e}");
        }
        self.discard_progress();
        if let Err(e) =
            self.transport
                .report(ReportStatus::Done, manifest.total_chunks, &manifest.version)
        {
            warn!("FOTA: completion report failed: {e}");
        }

        info!("FOTA: {} activated, restarting", manifest.version);
        self.set_phase(FotaPhase::RebootPending);
        self.flash.restart();
        Ok(())
    }

    /// Drop a fully received image that failed its integrity checks.
    fn reject_image(&mut self, manifest: &UpdateManifest, error: FotaError) -> FotaError {
        self.flash.abort();
        self.discard_progress();
        if let Err(e) =
            self.transport
                .report(ReportStatus::ShaFail, manifest.total_chunks, &manifest.version)
        {
            warn!("FOTA: failure report failed: {e}");
        }
        error
    }

    fn discard_progress(&mut self) {
        if let Err(e) = self.store.clear() {
            error!("FOTA: failed to clear update state: {e}");
        }
    }
}

#[allow(clippy::cast_possible_truncation)] // at most 100
fn percent(written: u32, size: u32) -> u32 {
    (u64::from(written) * 100 / u64::from(size.max(1))) as u32
}

/// Whether progress went past a 10% boundary.
fn crosses_milestone(before: u32, after: u32, size: u32) -> bool {
    percent(before, size) / 10 != percent(after, size) / 10
}
