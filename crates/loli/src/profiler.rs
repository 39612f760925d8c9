use std::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    path::Path,
    ptr,
    sync::{
        atomic::{AtomicPtr, AtomicUsize, Ordering},
        Arc,
    },
    thread,
};

use parking_lot::{const_mutex, Mutex};

use crate::{
    config::{HookConfig, LoliConf},
    error::{LoliError, Result},
    exporter::{AutoDump, Exporter},
    interceptor::{GotInterceptor, InstallReport, Interceptor},
    recorder::Recorder,
};

const UNINSTALLED: usize = 0;
const INSTALLING: usize = 1;
const INSTALLED: usize = 2;

/// State owned by an installed engine.
pub struct Profiler {
    recorder: Arc<Recorder>,
    exporter: Exporter,
    report: InstallReport,
}

impl Profiler {
    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    pub fn exporter(&self) -> &Exporter {
        &self.exporter
    }

    /// What the interceptor patched at install time.
    pub fn report(&self) -> &InstallReport {
        &self.report
    }

    pub fn config(&self) -> &HookConfig {
        self.recorder.config()
    }

    /// See [`Exporter::dump`].
    pub fn dump<P: AsRef<Path>>(&self, append: bool, path: P) -> Result<usize> {
        self.exporter.dump(self.recorder.store(), append, path)
    }

    /// See [`Exporter::tick`], failures are logged and dropped.
    pub fn tick(&self) {
        if let Some(Err(err)) = self.exporter.tick(self.recorder.store()) {
            log::error!("scheduled dump failed: {}", err);
        }
    }
}

/// Install once, never uninstall.
///
/// The hooks outlive any caller, so the engine hands out `&Profiler` only after a successful
/// install and keeps it until the engine itself is dropped (never, for the process-wide one).
///
/// The recorder is reachable by the trampolines before the first slot is patched, so nothing
/// allocated while the interceptor works is missed. A recorder left behind by a failed install
/// may still be in use on another thread; it is retired, not freed.
pub struct Engine<I> {
    interceptor: I,
    state: AtomicUsize,
    recorder: AtomicPtr<Recorder>,
    retired: Mutex<Vec<Arc<Recorder>>>,
    profiler: UnsafeCell<MaybeUninit<Profiler>>,
}

unsafe impl<I: Sync> Sync for Engine<I> {}
unsafe impl<I: Send> Send for Engine<I> {}

impl<I: Interceptor> Engine<I> {
    pub const fn new(interceptor: I) -> Self {
        Self {
            interceptor,
            state: AtomicUsize::new(UNINSTALLED),
            recorder: AtomicPtr::new(ptr::null_mut()),
            retired: const_mutex(Vec::new()),
            profiler: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Hook the configured libraries.
    ///
    /// Fails with [`LoliError::AlreadyInstalled`] on any call after the first successful one (or
    /// while one is in flight), leaving the installed hooks untouched. A failed install may be
    /// retried.
    pub fn install(&self, config: HookConfig) -> Result<&Profiler> {
        if self
            .state
            .compare_exchange(UNINSTALLED, INSTALLING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::warn!("install rejected, hooks are already installed");
            return Err(LoliError::AlreadyInstalled);
        }

        log::info!(
            "hooking {:?}, min record size {}",
            config.libraries(),
            config.min_record_size()
        );

        let recorder = Arc::new(Recorder::new(config));

        self.recorder
            .store(Arc::as_ptr(&recorder) as *mut Recorder, Ordering::Release);

        let report = match self.interceptor.install(recorder.config().libraries()) {
            Ok(report) => report,
            Err(err) => {
                log::error!("install failed: {}", err);
                self.recorder.store(ptr::null_mut(), Ordering::Release);
                self.retired.lock().push(recorder);
                self.state.store(UNINSTALLED, Ordering::Release);
                return Err(err);
            }
        };

        log::info!(
            "hooked {} allocator slots in {} objects",
            report.patched_slots(),
            report.libraries.len()
        );

        let profiler = Profiler {
            recorder,
            exporter: Exporter::new(),
            report,
        };

        unsafe { (*self.profiler.get()).write(profiler) };

        self.state.store(INSTALLED, Ordering::Release);

        self.profiler().ok_or(LoliError::NotInstalled)
    }

    /// Recorder the trampolines report to, set from the start of an install.
    #[inline]
    pub(crate) fn recorder(&self) -> Option<&Recorder> {
        unsafe { self.recorder.load(Ordering::Acquire).as_ref() }
    }

    pub fn is_installed(&self) -> bool {
        self.state.load(Ordering::Acquire) == INSTALLED
    }

    /// The installed profiler, `None` before a successful install.
    #[inline]
    pub fn profiler(&self) -> Option<&Profiler> {
        if self.is_installed() {
            Some(unsafe { (*self.profiler.get()).assume_init_ref() })
        } else {
            None
        }
    }

    pub fn dump<P: AsRef<Path>>(&self, append: bool, path: P) -> Result<usize> {
        self.profiler()
            .ok_or(LoliError::NotInstalled)?
            .dump(append, path)
    }

    /// Per host frame, a no-op until installed.
    pub fn tick(&self) {
        if let Some(profiler) = self.profiler() {
            profiler.tick();
        }
    }

    pub fn set_auto_dump(&self, auto_dump: Option<AutoDump>) -> Result<()> {
        self.profiler()
            .ok_or(LoliError::NotInstalled)?
            .exporter()
            .set_auto_dump(auto_dump);

        Ok(())
    }
}

impl<I> Drop for Engine<I> {
    fn drop(&mut self) {
        if *self.state.get_mut() == INSTALLED {
            unsafe { self.profiler.get_mut().assume_init_drop() };
        }
    }
}

static ENGINE: Engine<GotInterceptor> = Engine::new(GotInterceptor);

/// The process-wide engine the C ABI drives.
pub fn global_engine() -> &'static Engine<GotInterceptor> {
    &ENGINE
}

/// Recorder reached by the trampolines.
#[inline]
pub(crate) fn installed_recorder() -> Option<&'static Recorder> {
    ENGINE.recorder()
}

/// Install the process-wide hooks, see [`Engine::install`].
pub fn install(config: HookConfig) -> Result<InstallReport> {
    ENGINE
        .install(config)
        .map(|profiler| profiler.report().clone())
}

/// Install from a [`LoliConf`] after its delay, on a background thread, leaving the host time to
/// load the libraries to hook.
pub fn install_deferred(conf: LoliConf) -> Result<()> {
    log::info!(
        "hook delay {:?}, min record size {}, libraries {}",
        conf.delay,
        conf.min_record_size,
        conf.libraries
    );

    thread::Builder::new()
        .name("loli-hook".into())
        .spawn(move || {
            thread::sleep(conf.delay);

            if let Err(err) = install(conf.hook_config()) {
                log::error!("deferred install failed: {}", err);
            }
        })?;

    Ok(())
}

/// Export the process-wide table, see [`Exporter::dump`].
pub fn dump<P: AsRef<Path>>(append: bool, path: P) -> Result<usize> {
    ENGINE.dump(append, path)
}

/// Per host frame bookkeeping.
pub fn tick() {
    ENGINE.tick()
}

/// Set or clear the schedule driven by [`tick`].
pub fn set_auto_dump(auto_dump: Option<AutoDump>) -> Result<()> {
    ENGINE.set_auto_dump(auto_dump)
}
