//! Telemetry backends for training metrics.
//!
//! The orchestrator publishes per-epoch scalars through a `MetricsLogger`
//! fan-out. With no backend attached every call is a no-op and the training
//! run behaves identically, so external trackers stay strictly optional.

use crate::{TrainError, TrainResult};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Trait for telemetry backends.
pub trait LoggingBackend {
    /// Log a scalar metric at a step (here: epoch) number.
    fn log_scalar(&mut self, name: &str, value: f64, step: usize) -> TrainResult<()>;

    /// Log a text message.
    fn log_text(&mut self, message: &str) -> TrainResult<()>;

    /// Flush any buffered output.
    fn flush(&mut self) -> TrainResult<()>;
}

/// Console backend that prints to stdout.
#[derive(Debug, Clone, Default)]
pub struct ConsoleLogger;

impl ConsoleLogger {
    /// Create a new console logger.
    pub fn new() -> Self {
        Self
    }
}

impl LoggingBackend for ConsoleLogger {
    fn log_scalar(&mut self, name: &str, value: f64, step: usize) -> TrainResult<()> {
        println!("epoch {step}: {name} = {value:.6}");
        Ok(())
    }

    fn log_text(&mut self, message: &str) -> TrainResult<()> {
        println!("{message}");
        Ok(())
    }

    fn flush(&mut self) -> TrainResult<()> {
        use std::io::stdout;
        stdout()
            .flush()
            .map_err(|e| TrainError::Other(format!("Failed to flush stdout: {}", e)))
    }
}

/// Appends one JSON record per scalar to a file, for later analysis.
#[derive(Debug)]
pub struct JsonlLogger {
    file: File,
    path: PathBuf,
}

impl JsonlLogger {
    /// Create a logger appending to `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> TrainResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| TrainError::Other(format!("Failed to open log file {:?}: {}", path, e)))?;
        Ok(Self { file, path })
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LoggingBackend for JsonlLogger {
    fn log_scalar(&mut self, name: &str, value: f64, step: usize) -> TrainResult<()> {
        let record = serde_json::json!({ "step": step, "metric": name, "value": value });
        writeln!(self.file, "{record}")
            .map_err(|e| TrainError::Other(format!("Failed to write to log file: {}", e)))
    }

    fn log_text(&mut self, message: &str) -> TrainResult<()> {
        let record = serde_json::json!({ "message": message });
        writeln!(self.file, "{record}")
            .map_err(|e| TrainError::Other(format!("Failed to write to log file: {}", e)))
    }

    fn flush(&mut self) -> TrainResult<()> {
        self.file
            .flush()
            .map_err(|e| TrainError::Other(format!("Failed to flush log file: {}", e)))
    }
}

/// Fans metrics out to any number of backends, tracking the step counter.
#[derive(Default)]
pub struct MetricsLogger {
    backends: Vec<Box<dyn LoggingBackend>>,
    current_step: usize,
}

impl MetricsLogger {
    /// Create a logger with no backends (all operations no-ops).
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a backend.
    pub fn add_backend(&mut self, backend: Box<dyn LoggingBackend>) {
        self.backends.push(backend);
    }

    /// Number of attached backends.
    pub fn num_backends(&self) -> usize {
        self.backends.len()
    }

    /// Log a scalar at the current step.
    pub fn log_scalar(&mut self, name: &str, value: f64) -> TrainResult<()> {
        for backend in &mut self.backends {
            backend.log_scalar(name, value, self.current_step)?;
        }
        Ok(())
    }

    /// Log a text message.
    pub fn log_text(&mut self, message: &str) -> TrainResult<()> {
        for backend in &mut self.backends {
            backend.log_text(message)?;
        }
        Ok(())
    }

    /// Advance the step counter (called once per epoch by the orchestrator).
    pub fn step(&mut self) {
        self.current_step += 1;
    }

    /// Set the step counter explicitly.
    pub fn set_step(&mut self, step: usize) {
        self.current_step = step;
    }

    /// Current step counter.
    pub fn current_step(&self) -> usize {
        self.current_step
    }

    /// Flush all backends.
    pub fn flush(&mut self) -> TrainResult<()> {
        for backend in &mut self.backends {
            backend.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Debug, Default)]
    struct RecordingBackend {
        scalars: Rc<RefCell<Vec<(String, f64, usize)>>>,
    }

    impl LoggingBackend for RecordingBackend {
        fn log_scalar(&mut self, name: &str, value: f64, step: usize) -> TrainResult<()> {
            self.scalars.borrow_mut().push((name.to_string(), value, step));
            Ok(())
        }

        fn log_text(&mut self, _message: &str) -> TrainResult<()> {
            Ok(())
        }

        fn flush(&mut self) -> TrainResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_no_backends_is_a_noop() {
        let mut logger = MetricsLogger::new();
        assert_eq!(logger.num_backends(), 0);
        logger.log_scalar("train/loss", 0.5).unwrap();
        logger.log_text("hello").unwrap();
        logger.flush().unwrap();
    }

    #[test]
    fn test_step_counter_tags_scalars() {
        let records = Rc::new(RefCell::new(Vec::new()));
        let backend = RecordingBackend {
            scalars: Rc::clone(&records),
        };

        let mut logger = MetricsLogger::new();
        logger.add_backend(Box::new(backend));

        logger.set_step(3);
        logger.log_scalar("train/loss", 0.5).unwrap();
        logger.step();
        logger.log_scalar("train/loss", 0.4).unwrap();

        let seen = records.borrow();
        assert_eq!(seen[0].2, 3);
        assert_eq!(seen[1].2, 4);
        assert_eq!(logger.current_step(), 4);
    }

    #[test]
    fn test_jsonl_records_are_one_per_line() {
        let path = std::env::temp_dir().join(format!(
            "fewshot-train-log-{}-{}.jsonl",
            std::process::id(),
            line!()
        ));
        std::fs::remove_file(&path).ok();

        {
            let mut logger = JsonlLogger::new(&path).unwrap();
            logger.log_scalar("val/acc", 0.75, 1).unwrap();
            logger.log_scalar("val/acc", 0.80, 2).unwrap();
            logger.flush().unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let record: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(record["metric"], "val/acc");
        assert_eq!(record["step"], 2);

        std::fs::remove_file(&path).ok();
    }
}
