use std::{
  sync::Arc,
  thread::{self, JoinHandle},
  time::Instant,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::{
  counter::{CounterSet, KeyCounter},
  db::Engine,
  errors::{Errors, Result},
  option::{GcOptions, Options},
  prefix::Prefix,
};

/// Owns the engine shared by every view and store opened from one database,
/// along with the background thread that reclaims its value log.
pub struct Monitor {
  db: Arc<Engine>,
  options: Options,
  stop_gc: Mutex<Option<Sender<()>>>,
  gc: Mutex<Option<JoinHandle<()>>>,
  counters: CounterSet,
}

impl Monitor {
  /// Opens the engine and starts the reclamation scheduler.
  pub fn open(options: Options) -> Result<Arc<Self>> {
    let db = Arc::new(Engine::open(options.engine_options())?);

    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
    let handle = {
      let db = db.clone();
      let gc_opts = options.gc;
      let auto_sync = options.auto_sync;
      thread::spawn(move || run_gc_scheduler(db, gc_opts, auto_sync, stop_rx))
    };

    let counters = CounterSet::load(&options.dir_path, options.persist_count, options.read_only);
    Ok(Arc::new(Self {
      db,
      options,
      stop_gc: Mutex::new(Some(stop_tx)),
      gc: Mutex::new(Some(handle)),
      counters,
    }))
  }

  pub fn db(&self) -> &Arc<Engine> {
    &self.db
  }

  pub fn options(&self) -> &Options {
    &self.options
  }

  /// The engine's own flag is authoritative; the monitor keeps none.
  pub fn is_closed(&self) -> bool {
    self.db.is_closed()
  }

  /// Stops the scheduler, waits for it to exit, then closes the engine.
  ///
  /// Safe to call repeatedly and from several threads: only the first call
  /// waits, and none returns before the engine is closed.
  pub fn close(&self) -> Result<()> {
    let mut gc = self.gc.lock();
    // Dropping the sender disconnects the channel and wakes the scheduler.
    drop(self.stop_gc.lock().take());
    if let Some(handle) = gc.take() {
      if handle.join().is_err() {
        warn!("value log gc thread panicked");
      }
    }
    self.db.close()
  }

  /// The persisted key counter for `prefix`, when counting is enabled.
  pub(crate) fn counter(&self, prefix: &Prefix) -> Option<Arc<KeyCounter>> {
    self.counters.get(prefix)
  }

  /// Runs a mutation of `real_key` returning its effect on the key count.
  pub(crate) fn track_mutation<T, F>(&self, real_key: &[u8], op: F) -> Result<T>
  where
    F: FnOnce() -> Result<(T, i64)>,
  {
    self.counters.track(real_key, op)
  }
}

impl Drop for Monitor {
  fn drop(&mut self) {
    if let Err(e) = self.close() {
      warn!("error whilst closing database: {}", e);
    }
  }
}

/// Size and time of the last reclamation pass.
struct GcBaseline {
  size: u64,
  at: Instant,
}

fn run_gc_scheduler(db: Arc<Engine>, opts: GcOptions, auto_sync: bool, stop: Receiver<()>) {
  let mut baseline = run_gc_pass(&db, &opts);
  loop {
    let size = db.size();
    let delta = size.abs_diff(baseline.size);
    if delta > opts.size_threshold || baseline.at.elapsed() >= opts.max_interval {
      baseline = run_gc_pass(&db, &opts);
    }
    if auto_sync {
      if let Err(e) = db.sync() {
        warn!("background sync failed: {}", e);
      }
    }
    match stop.recv_timeout(opts.interval) {
      Err(RecvTimeoutError::Timeout) => continue,
      Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
    }
  }
  info!("value log gc scheduler stopped");
}

// A successful collection is retried once, to reclaim more than one file per pass.
fn run_gc_pass(db: &Engine, opts: &GcOptions) -> GcBaseline {
  if log_gc_result(db.run_value_log_gc(opts.discard_ratio)) {
    log_gc_result(db.run_value_log_gc(opts.discard_ratio));
  }
  GcBaseline {
    size: db.size(),
    at: Instant::now(),
  }
}

fn log_gc_result(res: Result<()>) -> bool {
  match res {
    Ok(()) => {
      debug!("value log gc reclaimed a data file");
      true
    }
    Err(Errors::NoRewrite) => false,
    Err(e) => {
      warn!("value log gc failed: {}", e);
      false
    }
  }
}
