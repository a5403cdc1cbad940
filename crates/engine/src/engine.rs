//! Engine struct and open/close logic
//!
//! An [`Engine`] owns a directory holding `vellum.toml`, the volume files it
//! opens, and after a fatal shutdown a `vellum.fatal` marker. It is the only
//! path to volume I/O, which lets a single [`FatalLatch`] stop every
//! operation once something unrecoverable is detected.
//!
//! ## Shutdown
//!
//! - [`Engine::close`]: force and close every volume, remove lock files and
//!   transient volume files.
//! - [`Engine::crash`]: drop every handle without flushing, leaving lock
//!   files behind exactly as a killed process would.
//! - [`Engine::fatal`]: trip the latch; every later call fails with the
//!   recorded cause. The emergency step forces open volumes and writes the
//!   fatal marker.

use crate::config::{EngineConfig, CONFIG_FILE_NAME};
use crate::latch::FatalLatch;
use crate::volume::Volume;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use vellum_core::{FatalCause, VellumError, VellumResult, VolumeSpec};
use vellum_durability::{CancelToken, ChannelOpener, FileOpener, MediatedChannel};

/// Marker file written into the engine directory when the latch trips.
pub const FATAL_MARKER_FILE: &str = "vellum.fatal";

/// State every volume of one engine consults before doing I/O.
#[derive(Debug, Default)]
pub(crate) struct EngineState {
    latch: FatalLatch,
    shut_down: AtomicBool,
}

impl EngineState {
    /// Latch first, so a tripped engine reports its cause even after close.
    pub(crate) fn check(&self) -> VellumResult<()> {
        self.latch.check_ok()?;
        if self.shut_down.load(Ordering::Acquire) {
            return Err(VellumError::ShutDown);
        }
        Ok(())
    }
}

/// Embedded storage engine instance.
#[derive(Debug)]
pub struct Engine {
    dir: PathBuf,
    config: EngineConfig,
    opener: Arc<dyn ChannelOpener>,
    state: Arc<EngineState>,
    volumes: DashMap<String, Arc<Volume>>,
    previous_fatal: Option<FatalCause>,
}

impl Engine {
    /// Open the engine in `dir`, creating the directory and a default
    /// `vellum.toml` when missing.
    ///
    /// # Example
    ///
    /// ```text
    /// use vellum_engine::Engine;
    ///
    /// let engine = Engine::open("/path/to/engine")?;
    /// ```
    pub fn open<P: AsRef<Path>>(dir: P) -> VellumResult<Arc<Self>> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let config_path = dir.join(CONFIG_FILE_NAME);
        EngineConfig::write_default_if_missing(&config_path)?;
        let cfg = EngineConfig::from_file(&config_path)?;

        Self::with_opener(dir, cfg, Arc::new(FileOpener))
    }

    /// Open the engine in `dir` with an explicit configuration.
    ///
    /// The config is written to `vellum.toml` so a later [`Engine::open`]
    /// picks up the same settings.
    pub fn open_with_config<P: AsRef<Path>>(dir: P, cfg: EngineConfig) -> VellumResult<Arc<Self>> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        cfg.validate()?;
        cfg.write_to_file(&dir.join(CONFIG_FILE_NAME))?;
        Self::with_opener(dir, cfg, Arc::new(FileOpener))
    }

    /// Open the engine with volume files reached through `opener`.
    ///
    /// The directory itself, which holds the config and the fatal marker,
    /// is always on the local filesystem. `vellum.toml` is not read or
    /// written here.
    pub fn with_opener<P: AsRef<Path>>(
        dir: P,
        cfg: EngineConfig,
        opener: Arc<dyn ChannelOpener>,
    ) -> VellumResult<Arc<Self>> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        cfg.validate()?;

        let previous_fatal = take_fatal_marker(&dir)?;

        let engine = Arc::new(Engine {
            dir,
            config: cfg.clone(),
            opener,
            state: Arc::new(EngineState::default()),
            volumes: DashMap::new(),
            previous_fatal,
        });

        for spec in cfg.volumes {
            engine.open_volume(spec)?;
        }

        info!(
            target: "vellum::engine",
            dir = %engine.dir.display(),
            volumes = engine.volumes.len(),
            "engine opened"
        );
        Ok(engine)
    }

    /// Engine directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Configuration the engine was opened with
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Cause recorded by a previous instance that shut down on a fatal
    /// error in this directory
    pub fn previous_fatal(&self) -> Option<&FatalCause> {
        self.previous_fatal.as_ref()
    }

    // ========================================================================
    // Volumes
    // ========================================================================

    /// Open a volume and register it under its alias, or its path when no
    /// alias is set.
    ///
    /// Read-only volumes take a shared lock on the volume's lock file and
    /// read-write volumes an exclusive one; the lock is held until the
    /// volume closes. Newly created volumes are extended to the spec's
    /// initial page count.
    ///
    /// # Errors
    ///
    /// - `VolumeExists`: the name is taken, or `create_only` and the file
    ///   exists
    /// - `VolumeNotFound`: the file is missing and the spec does not create
    /// - `VolumeInUse`: another handle holds an incompatible lock
    pub fn open_volume(&self, spec: VolumeSpec) -> VellumResult<Arc<Volume>> {
        self.check_ok()?;
        self.check_open()?;
        spec.validate()?;

        let name = spec.describe();
        if self.volumes.contains_key(&name) {
            return Err(VellumError::VolumeExists(name));
        }

        let path = spec.resolve_path(&self.dir);
        let existed = self.opener.exists(&path);
        if existed && spec.create_only {
            return Err(VellumError::VolumeExists(name));
        }
        if !existed && !(spec.create || spec.create_only) {
            return Err(VellumError::VolumeNotFound(name));
        }

        let channel = MediatedChannel::open(&path, spec.access_mode(), Arc::clone(&self.opener))?;
        let file_lock = match channel.try_lock(0, u64::MAX, spec.read_only) {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                // The lock file belongs to whoever holds it
                channel.abandon();
                return Err(VellumError::VolumeInUse(name));
            }
            Err(e) => {
                channel.abandon();
                return Err(e.into());
            }
        };

        let volume = Arc::new(Volume::new(
            spec,
            path,
            channel,
            file_lock,
            Arc::clone(&self.state),
        ));

        if !existed {
            if let Some(pages) = volume.spec().initial_pages() {
                if let Err(e) = volume.extend_to_pages(pages, &CancelToken::new()) {
                    // Best effort; the extension failure is what gets reported
                    let _ = volume.close(false);
                    return Err(e);
                }
            }
        }

        match self.volumes.entry(name.clone()) {
            Entry::Occupied(_) => {
                let _ = volume.close(false);
                Err(VellumError::VolumeExists(name))
            }
            Entry::Vacant(slot) => {
                info!(
                    target: "vellum::engine",
                    volume = %name,
                    path = %volume.path().display(),
                    read_only = volume.is_read_only(),
                    created = !existed,
                    "volume opened"
                );
                slot.insert(Arc::clone(&volume));
                Ok(volume)
            }
        }
    }

    /// Look up an open volume by name.
    pub fn volume(&self, name: &str) -> VellumResult<Arc<Volume>> {
        self.check_ok()?;
        self.check_open()?;
        self.volumes
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| VellumError::VolumeNotFound(name.to_string()))
    }

    /// Names of all open volumes, sorted
    pub fn volume_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.volumes.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    // ========================================================================
    // Fatal latch
    // ========================================================================

    /// Fail with the recorded cause once the engine has hit a fatal error.
    pub fn check_ok(&self) -> VellumResult<()> {
        self.state.latch.check_ok()
    }

    /// Check if the engine has hit a fatal error
    pub fn is_tripped(&self) -> bool {
        self.state.latch.is_tripped()
    }

    /// Cause the latch recorded, if the engine has hit a fatal error
    pub fn fatal_cause(&self) -> Option<&FatalCause> {
        self.state.latch.cause()
    }

    /// Shut the engine down on an unrecoverable error.
    ///
    /// Returns the error to propagate, carrying the cause the latch holds:
    /// `message` for the first caller, the original cause for every later
    /// one.
    ///
    /// ```text
    /// if checksum != expected {
    ///     return Err(engine.fatal(format!("corruption detected at page {}", page)));
    /// }
    /// ```
    pub fn fatal(&self, message: impl Into<String>) -> VellumError {
        self.trip(FatalCause::new(message))
    }

    /// Like [`Engine::fatal`], recording the error that exposed the problem.
    pub fn fatal_with_source(
        &self,
        message: impl Into<String>,
        source: &dyn std::error::Error,
    ) -> VellumError {
        self.trip(FatalCause::new(message).with_source(source))
    }

    fn trip(&self, cause: FatalCause) -> VellumError {
        let recorded = self
            .state
            .latch
            .trip_with(cause, |cause| self.emergency_step(cause));
        VellumError::Fatal(recorded)
    }

    /// Force every open volume (when configured) and write the fatal marker.
    /// Volume failures are logged and do not stop the remaining volumes.
    fn emergency_step(&self, cause: &FatalCause) -> VellumResult<()> {
        if self.config.emergency_flush && !self.state.shut_down.load(Ordering::Acquire) {
            let volumes: Vec<Arc<Volume>> =
                self.volumes.iter().map(|e| Arc::clone(e.value())).collect();
            for volume in volumes {
                if let Err(e) = volume.emergency_force() {
                    warn!(
                        target: "vellum::engine",
                        volume = %volume.name(),
                        error = %e,
                        "emergency flush failed"
                    );
                }
            }
        }
        write_fatal_marker(&self.dir, cause)
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Check if the engine has been closed or crashed
    pub fn is_shut_down(&self) -> bool {
        self.state.shut_down.load(Ordering::Acquire)
    }

    /// Close the engine gracefully.
    ///
    /// Forces and closes every volume, deleting lock files and transient
    /// volume files. A tripped engine skips the flush and returns its fatal
    /// error once resources are released. Calling `close` again is a no-op.
    pub fn close(&self) -> VellumResult<()> {
        if self.state.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let cause = self.state.latch.cause().cloned();
        let flush = cause.is_none();
        let mut first_error = None;

        for volume in self.drain_volumes() {
            if let Err(e) = volume.close(flush) {
                warn!(target: "vellum::engine", volume = %volume.name(), error = %e, "volume close failed");
                first_error.get_or_insert(e);
            }
            if volume.is_transient() {
                if let Err(e) = self.opener.remove(volume.path()) {
                    warn!(
                        target: "vellum::engine",
                        volume = %volume.name(),
                        error = %e,
                        "failed to remove transient volume"
                    );
                }
            }
        }

        info!(target: "vellum::engine", dir = %self.dir.display(), "engine closed");

        match (cause, first_error) {
            (Some(cause), _) => Err(VellumError::Fatal(cause)),
            (None, Some(e)) => Err(e),
            (None, None) => Ok(()),
        }
    }

    /// Stop the engine as a killed process would: no flush, no lock-file
    /// cleanup, no fatal marker. Irreversible.
    pub fn crash(&self) {
        if self.state.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        for volume in self.drain_volumes() {
            volume.abandon();
        }
        warn!(target: "vellum::engine", dir = %self.dir.display(), "engine crashed");
    }

    fn drain_volumes(&self) -> Vec<Arc<Volume>> {
        let names = self.volume_names();
        names
            .iter()
            .filter_map(|name| self.volumes.remove(name).map(|(_, volume)| volume))
            .collect()
    }

    fn check_open(&self) -> VellumResult<()> {
        if self.is_shut_down() {
            Err(VellumError::ShutDown)
        } else {
            Ok(())
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.is_shut_down() {
            let _ = self.close();
        }
    }
}

fn write_fatal_marker(dir: &Path, cause: &FatalCause) -> VellumResult<()> {
    let content = serde_json::to_vec_pretty(cause)
        .map_err(|e| VellumError::invalid_input(format!("failed to encode fatal cause: {}", e)))?;
    std::fs::write(dir.join(FATAL_MARKER_FILE), content)?;
    Ok(())
}

/// Read and remove a fatal marker left by a previous instance.
fn take_fatal_marker(dir: &Path) -> VellumResult<Option<FatalCause>> {
    let path = dir.join(FATAL_MARKER_FILE);
    let content = match std::fs::read(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let cause = serde_json::from_slice::<FatalCause>(&content).unwrap_or_else(|e| {
        FatalCause::new("unreadable fatal marker").with_source(&e)
    });
    warn!(
        target: "vellum::engine",
        dir = %dir.display(),
        cause = %cause,
        tripped_at = %cause.tripped_at,
        age_secs = (Utc::now() - cause.tripped_at).num_seconds(),
        "previous engine instance shut down on a fatal error"
    );
    std::fs::remove_file(&path)?;
    Ok(Some(cause))
}
