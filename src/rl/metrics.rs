//! Metrics and CSV logging for RL training

use std::collections::{BTreeMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use super::env::StatsSummary;

/// Moving average calculator
#[derive(Debug, Clone)]
pub struct MovingAverage {
    values: VecDeque<f32>,
    window_size: usize,
    sum: f32,
}

impl MovingAverage {
    pub fn new(window_size: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(window_size),
            window_size,
            sum: 0.0,
        }
    }

    pub fn push(&mut self, value: f32) {
        if self.values.len() >= self.window_size {
            if let Some(old) = self.values.pop_front() {
                self.sum -= old;
            }
        }
        self.values.push_back(value);
        self.sum += value;
    }

    pub fn average(&self) -> f32 {
        if self.values.is_empty() {
            0.0
        } else {
            self.sum / self.values.len() as f32
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Training progress tracker
#[derive(Debug)]
pub struct TrainingMetrics {
    /// Objective statistic over recent summaries
    pub objective: MovingAverage,
    /// Most recent summary
    pub last_summary: Option<StatsSummary>,
    /// Number of summaries received
    pub summaries: usize,
    /// Completed evaluate/train iterations
    pub epoch: usize,
    /// Agent steps reported by the learner
    pub global_step: u64,
    objective_key: String,
    start_time: Instant,
    last_log_time: Instant,
}

impl TrainingMetrics {
    pub fn new(objective_key: impl Into<String>, window_size: usize) -> Self {
        let now = Instant::now();
        Self {
            objective: MovingAverage::new(window_size),
            last_summary: None,
            summaries: 0,
            epoch: 0,
            global_step: 0,
            objective_key: objective_key.into(),
            start_time: now,
            last_log_time: now,
        }
    }

    /// Record a periodic summary; returns the objective value it carried
    pub fn record_summary(&mut self, summary: StatsSummary) -> Option<f32> {
        let value = summary.get(&self.objective_key);
        if let Some(value) = value {
            self.objective.push(value);
        }
        self.summaries += 1;
        self.last_summary = Some(summary);
        value
    }

    pub fn update_epoch(&mut self, epoch: usize, global_step: u64) {
        self.epoch = epoch;
        self.global_step = global_step;
    }

    pub fn training_duration_secs(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    pub fn steps_per_second(&self) -> f64 {
        let duration = self.training_duration_secs();
        if duration > 0.0 {
            self.global_step as f64 / duration
        } else {
            0.0
        }
    }

    /// Final statistics handed back to the caller: the last summary with the
    /// objective replaced by its moving average.
    pub fn final_summary(&self) -> StatsSummary {
        let mut summary = self.last_summary.clone().unwrap_or_default();
        if !self.objective.is_empty() {
            summary.insert(self.objective_key.clone(), self.objective.average());
        }
        summary
    }

    pub fn log_to_console(&mut self) {
        self.last_log_time = Instant::now();

        tracing::info!(
            "Epoch {} | Steps {} | SPS {:.1}",
            self.epoch,
            self.global_step,
            self.steps_per_second()
        );
        if let Some(summary) = &self.last_summary {
            tracing::info!(
                "  {}={:.3} (avg {:.3} over {}), length={:.1}",
                self.objective_key,
                summary.get(&self.objective_key).unwrap_or_default(),
                self.objective.average(),
                self.objective.len(),
                summary.get("length").unwrap_or_default()
            );
        }
    }

    pub fn secs_since_last_log(&self) -> f64 {
        self.last_log_time.elapsed().as_secs_f64()
    }
}

/// Appends every summary statistic to `<log_dir>/<key>.csv`
#[derive(Debug)]
pub struct StatsLogger {
    log_dir: PathBuf,
    files: BTreeMap<String, File>,
}

impl StatsLogger {
    pub fn new(log_dir: impl AsRef<Path>) -> io::Result<Self> {
        let log_dir = log_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&log_dir)?;
        Ok(Self {
            log_dir,
            files: BTreeMap::new(),
        })
    }

    pub fn log_summary(&mut self, summary: &StatsSummary, step: u64) -> io::Result<()> {
        for (key, value) in &summary.values {
            self.log_scalar(key, *value, step)?;
        }
        Ok(())
    }

    pub fn log_scalar(&mut self, key: &str, value: f32, step: u64) -> io::Result<()> {
        if !self.files.contains_key(key) {
            let path = self.log_dir.join(format!("{}.csv", key.replace('/', "_")));
            let exists = path.exists();
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            if !exists {
                writeln!(file, "step,value")?;
            }
            self.files.insert(key.to_string(), file);
        }

        if let Some(file) = self.files.get_mut(key) {
            writeln!(file, "{},{}", step, value)?;
        }
        Ok(())
    }

    /// Flush and release every open file
    pub fn close(&mut self) -> io::Result<()> {
        for file in self.files.values_mut() {
            file.flush()?;
        }
        self.files.clear();
        tracing::debug!("Stats logs saved to {}", self.log_dir.display());
        Ok(())
    }

    pub fn open_files(&self) -> usize {
        self.files.len()
    }
}
