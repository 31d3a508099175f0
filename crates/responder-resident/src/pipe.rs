//! Named pipe pair between the dispatcher (master) and a resident host (slave).
//!
//! A pair is two FIFOs next to each other: `<base>-m2s` carries master → slave
//! traffic and `<base>-s2m` the replies. The master creates and opens both
//! before spawning the slave, which receives `<base>` on its command line.

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use tokio::net::unix::pipe;
use tracing::{debug, warn};

pub const MASTER_TO_SLAVE_SUFFIX: &str = "-m2s";
pub const SLAVE_TO_MASTER_SUFFIX: &str = "-s2m";

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut path = OsString::from(base.as_os_str());
    path.push(suffix);
    PathBuf::from(path)
}

/// The two FIFOs of one connection. Removed from disk on drop.
#[derive(Debug)]
pub struct PipePair {
    base: PathBuf,
}

impl PipePair {
    /// Create both FIFOs as `<dir>/<name>-m2s` and `<dir>/<name>-s2m`.
    pub fn create(dir: &Path, name: &str) -> io::Result<Self> {
        let pair = Self {
            base: dir.join(name),
        };
        let mode = Mode::S_IRUSR | Mode::S_IWUSR;
        // If the second mkfifo fails, dropping `pair` removes the first.
        mkfifo(&pair.master_to_slave(), mode).map_err(io::Error::from)?;
        mkfifo(&pair.slave_to_master(), mode).map_err(io::Error::from)?;
        debug!("Created pipe pair {}", pair.base.display());
        Ok(pair)
    }

    /// The path handed to the slave.
    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn master_to_slave(&self) -> PathBuf {
        with_suffix(&self.base, MASTER_TO_SLAVE_SUFFIX)
    }

    pub fn slave_to_master(&self) -> PathBuf {
        with_suffix(&self.base, SLAVE_TO_MASTER_SUFFIX)
    }

    /// Open the master ends: a receiver on `-s2m` and a sender on `-m2s`.
    ///
    /// Both are opened read-write so neither open blocks nor fails while the
    /// slave has not started yet. The master therefore never sees EOF; slave
    /// death is observed through process collection.
    pub fn open_master(&self) -> io::Result<(pipe::Receiver, pipe::Sender)> {
        let receiver = pipe::OpenOptions::new()
            .read_write(true)
            .open_receiver(self.slave_to_master())?;
        let sender = pipe::OpenOptions::new()
            .read_write(true)
            .open_sender(self.master_to_slave())?;
        Ok((receiver, sender))
    }
}

impl Drop for PipePair {
    fn drop(&mut self) {
        for path in [self.master_to_slave(), self.slave_to_master()] {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to remove pipe {}: {}", path.display(), e);
                }
            }
        }
    }
}

/// Open the slave ends of the pair rooted at `base`.
///
/// The master must already hold its ends open. The receiver is opened
/// read-only so that the slave sees EOF once the master goes away.
pub async fn open_slave(base: &Path) -> io::Result<(pipe::Receiver, pipe::Sender)> {
    let m2s = with_suffix(base, MASTER_TO_SLAVE_SUFFIX);
    let file = tokio::task::spawn_blocking(move || std::fs::File::open(m2s))
        .await
        .map_err(io::Error::other)??;
    let receiver = pipe::Receiver::from_file(file)?;
    let sender = pipe::OpenOptions::new().open_sender(with_suffix(base, SLAVE_TO_MASTER_SUFFIX))?;
    Ok((receiver, sender))
}
