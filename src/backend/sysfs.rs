// Shared sysfs GPIO plumbing and a thread-driven software PWM
//
// Line layout under the root (normally /sys/class/gpio):
//   export, unexport         write the line number to claim/free it
//   gpio<N>/direction        "in" | "out"
//   gpio<N>/value            "0" | "1"

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use spin_sleep::SpinSleeper;
use tracing::{debug, warn};

use super::{Level, PinMode, PwmOutput};
use crate::error::Result;

// udev may take a moment to create gpio<N> after an export
const EXPORT_TIMEOUT: Duration = Duration::from_millis(200);

pub(crate) struct SysfsGpio {
    root: PathBuf,
}

impl SysfsGpio {
    pub(crate) fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn line_dir(&self, line: u32) -> PathBuf {
        self.root.join(format!("gpio{}", line))
    }

    pub(crate) fn value_path(&self, line: u32) -> PathBuf {
        self.line_dir(line).join("value")
    }

    pub(crate) fn export(&self, line: u32) -> io::Result<()> {
        let dir = self.line_dir(line);
        if dir.exists() {
            return Ok(());
        }
        fs::write(self.root.join("export"), line.to_string())?;

        let deadline = Instant::now() + EXPORT_TIMEOUT;
        while !dir.exists() {
            if Instant::now() >= deadline {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("gpio{} did not appear after export", line),
                ));
            }
            thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }

    pub(crate) fn set_mode(&self, line: u32, mode: PinMode) -> io::Result<()> {
        let direction = match mode {
            PinMode::Input => "in",
            PinMode::Output => "out",
        };
        fs::write(self.line_dir(line).join("direction"), direction)
    }

    pub(crate) fn write(&self, line: u32, level: Level) -> io::Result<()> {
        fs::write(self.value_path(line), level_str(level))
    }

    pub(crate) fn unexport(&self, line: u32) -> io::Result<()> {
        if !self.line_dir(line).exists() {
            return Ok(());
        }
        fs::write(self.root.join("unexport"), line.to_string())
    }

    pub(crate) fn claim(&self, line: u32, mode: PinMode) -> Result<()> {
        self.export(line)?;
        self.set_mode(line, mode)?;
        debug!("sysfs line {} claimed as {:?}", line, mode);
        Ok(())
    }
}

fn level_str(level: Level) -> &'static str {
    match level {
        Level::Low => "0",
        Level::High => "1",
    }
}

/// Software PWM: a worker thread toggles the line's value file
pub(crate) struct SoftPwm {
    value_path: PathBuf,
    frequency: u32,
    resolution: u32,
    duty: Arc<AtomicU32>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl SoftPwm {
    pub(crate) fn new(value_path: PathBuf, frequency: u32, resolution: u32) -> Self {
        Self {
            value_path,
            frequency: frequency.max(1),
            resolution,
            duty: Arc::new(AtomicU32::new(0)),
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    fn spawn(&mut self) -> Result<()> {
        let file = OpenOptions::new().write(true).open(&self.value_path)?;
        let duty = Arc::clone(&self.duty);
        let stop = Arc::clone(&self.stop);
        let period = Duration::from_secs(1) / self.frequency;
        let resolution = self.resolution;
        stop.store(false, Ordering::SeqCst);

        let worker = thread::Builder::new()
            .name(format!("soft-pwm-{}", self.value_path.display()))
            .spawn(move || run_soft_pwm(file, duty, stop, period, resolution))?;
        self.worker = Some(worker);
        Ok(())
    }
}

fn run_soft_pwm(
    file: File,
    duty: Arc<AtomicU32>,
    stop: Arc<AtomicBool>,
    period: Duration,
    resolution: u32,
) {
    let sleeper = SpinSleeper::default();
    let mut last: Option<Level> = None;
    let mut put = |level: Level| {
        if last != Some(level) {
            if let Err(e) = file.write_at(level_str(level).as_bytes(), 0) {
                warn!("Software PWM write failed: {}", e);
            }
            last = Some(level);
        }
    };

    while !stop.load(Ordering::SeqCst) {
        let raw = duty.load(Ordering::SeqCst).min(resolution);
        if raw == 0 {
            put(Level::Low);
            sleeper.sleep(period);
        } else if raw == resolution {
            put(Level::High);
            sleeper.sleep(period);
        } else {
            let high = period.mul_f64(f64::from(raw) / f64::from(resolution));
            put(Level::High);
            sleeper.sleep(high);
            put(Level::Low);
            sleeper.sleep(period - high);
        }
    }
    put(Level::Low);
}

impl PwmOutput for SoftPwm {
    fn resolution(&self) -> u32 {
        self.resolution
    }

    fn set_duty(&mut self, raw: u32) -> Result<()> {
        self.duty.store(raw.min(self.resolution), Ordering::SeqCst);
        if self.worker.is_none() {
            self.spawn()?;
        }
        Ok(())
    }

    fn disable(&mut self) -> Result<()> {
        self.duty.store(0, Ordering::SeqCst);
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Software PWM worker for {} panicked", self.value_path.display());
            }
        }
        Ok(())
    }
}

impl Drop for SoftPwm {
    fn drop(&mut self) {
        let _ = self.disable();
    }
}
