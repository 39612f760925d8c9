use std::{
    fmt,
    fs::{self, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant, SystemTime},
};

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    error::{LoliError, Result},
    fingerprint::{parse_hex, Fingerprint},
    store::{AllocationRecord, SnapshotStore},
};

/// One line of a dump file: `address,size,fingerprint,timestamp`.
///
/// The column order and the `,` / `;` delimiters are read by external analysis tools and must not
/// change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpRow {
    pub address: usize,
    pub size: usize,
    pub fingerprint: Fingerprint,
    pub timestamp: u64,
}

impl From<&AllocationRecord> for DumpRow {
    fn from(record: &AllocationRecord) -> Self {
        Self {
            address: record.address,
            size: record.size,
            fingerprint: record.fingerprint.clone(),
            timestamp: record.timestamp,
        }
    }
}

impl fmt::Display for DumpRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#x},{},{},{}",
            self.address, self.size, self.fingerprint, self.timestamp
        )
    }
}

impl FromStr for DumpRow {
    type Err = String;

    fn from_str(line: &str) -> std::result::Result<Self, Self::Err> {
        let columns = line.trim_end().split(',').collect::<Vec<_>>();

        if columns.len() != 4 {
            return Err(format!("expect 4 columns, got {}", columns.len()));
        }

        Ok(Self {
            address: parse_hex(columns[0]).map_err(|err| format!("address: {}", err))?,
            size: columns[1]
                .parse()
                .map_err(|err| format!("size: {}", err))?,
            fingerprint: columns[2]
                .parse()
                .map_err(|err| format!("fingerprint: {}", err))?,
            timestamp: columns[3]
                .parse()
                .map_err(|err| format!("timestamp: {}", err))?,
        })
    }
}

/// Read every row of a dump file.
pub fn read_dump<P: AsRef<Path>>(path: P) -> Result<Vec<DumpRow>> {
    let content = fs::read_to_string(path)?;

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            line.parse().map_err(|message| LoliError::Parse {
                line: index + 1,
                message,
            })
        })
        .collect()
}

/// Periodic export driven by [`Exporter::tick`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoDump {
    pub path: PathBuf,
    pub interval: Duration,
    pub append: bool,
}

struct Schedule {
    auto_dump: AutoDump,
    last: Instant,
}

/// Writes [`SnapshotStore`] contents to dump files.
///
/// An append dump writes only the live records no earlier dump has written. Records are flagged
/// in the store once their dump succeeded, so a block inserted while a dump copies the shards is
/// picked up by the next one.
#[derive(Default)]
pub struct Exporter {
    dumping: Mutex<()>,
    schedule: Mutex<Option<Schedule>>,
    ticks: AtomicU64,
}

impl Exporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write the store to `path`, returns the number of rows written.
    pub fn dump<P: AsRef<Path>>(
        &self,
        store: &SnapshotStore,
        append: bool,
        path: P,
    ) -> Result<usize> {
        let path = path.as_ref();

        let _dumping = self.dumping.lock();

        let records = if append {
            store.unexported()
        } else {
            store.snapshot()
        };

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(path)?;

        let mut writer = BufWriter::new(file);

        for record in &records {
            writeln!(writer, "{}", DumpRow::from(record))?;
        }

        writer.flush()?;

        store.mark_exported(&records);

        log::info!(
            "dump {} rows to {}, append={}",
            records.len(),
            path.display(),
            append
        );

        Ok(records.len())
    }

    /// Replace the tick schedule, `None` disables it. The first export happens one interval later.
    pub fn set_auto_dump(&self, auto_dump: Option<AutoDump>) {
        *self.schedule.lock() = auto_dump.map(|auto_dump| Schedule {
            auto_dump,
            last: Instant::now(),
        });
    }

    pub fn auto_dump(&self) -> Option<AutoDump> {
        self.schedule
            .lock()
            .as_ref()
            .map(|schedule| schedule.auto_dump.clone())
    }

    /// Per-frame bookkeeping. Returns the dump result when the schedule fired on this tick.
    pub fn tick(&self, store: &SnapshotStore) -> Option<Result<usize>> {
        self.ticks.fetch_add(1, Ordering::Relaxed);

        let auto_dump = {
            let mut schedule = self.schedule.lock();
            let schedule = schedule.as_mut()?;

            if schedule.last.elapsed() < schedule.auto_dump.interval {
                return None;
            }

            schedule.last = Instant::now();
            schedule.auto_dump.clone()
        };

        Some(self.dump(store, auto_dump.append, &auto_dump.path))
    }

    /// Number of [`tick`](Self::tick) calls so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }
}

/// A dump file name in the current working directory, stamped with the local time.
pub fn default_dump_path() -> PathBuf {
    let datetime: DateTime<Local> = SystemTime::now().into();

    PathBuf::from(format!(
        "./loli.{}.csv",
        datetime.format("%Y_%m_%d_%H_%M_%S_%3f")
    ))
}

/// Copy `/proc/self/smaps` to `path`, the mapping table needed to attribute fingerprint addresses
/// to libraries offline.
pub fn dump_smaps<P: AsRef<Path>>(path: P) -> Result<()> {
    // procfs reports a zero length, read it whole instead of fs::copy.
    let smaps = fs::read("/proc/self/smaps")?;

    fs::write(path.as_ref(), smaps)?;

    log::info!("dump smaps to {}", path.as_ref().display());

    Ok(())
}
