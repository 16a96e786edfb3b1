//! # Envelope Generator Bench Library
//!
//! This library drives a bench sweep of the FM chip's envelope generator.
//! For every test vector it writes the register settings to the command file
//! read by the external programmer tool, runs the measurement tool, and
//! collects the measured attack/release times next to the rates the chip is
//! expected to derive from those settings.

use crossterm::style::Stylize;
use log::{debug, info, warn};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

/// The rate field is 6 bits wide; anything above saturates here.
pub const MAX_RATE: u8 = 63;

/// First header line of the sweep table.
pub const TABLE_HEADER: &str = "AR | RR |  KC  |  KS  | Rate | Attack | Rate | Release";
/// Second header line of the sweep table.
pub const TABLE_RULE: &str = "---|----|------|------|------|--------|------|--------";

const ATTACK_MARKER: &str = "Attack: ";
const RELEASE_MARKER: &str = "Release: ";
const ERROR_TAG: &str = "[ERROR]";

/// One register setting of the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestVector {
    pub attack_rate: u8,
    pub release_rate: u8,
    pub key_code: u8,
    pub key_scale: u8,
}

impl TestVector {
    pub const fn new(attack_rate: u8, release_rate: u8, key_code: u8, key_scale: u8) -> Self {
        Self {
            attack_rate,
            release_rate,
            key_code,
            key_scale,
        }
    }

    /// Rate the chip should use for the attack segment.
    pub fn expected_attack_rate(&self) -> u8 {
        calc_rate(u32::from(self.attack_rate), self.key_code, self.key_scale)
    }

    /// Rate the chip should use for the release segment.
    pub fn expected_release_rate(&self) -> u8 {
        calc_rate(
            release_rate_param(self.release_rate),
            self.key_code,
            self.key_scale,
        )
    }
}

/// The bench run: six attack/release pairs across four key codes, then the
/// key-scale settings at a fixed key code.
pub const TEST_VECTORS: [TestVector; 27] = [
    TestVector::new(31, 15, 0x60, 0),
    TestVector::new(31, 15, 0x40, 0),
    TestVector::new(31, 15, 0x20, 0),
    TestVector::new(31, 15, 0x00, 0),
    TestVector::new(29, 14, 0x60, 0),
    TestVector::new(29, 14, 0x40, 0),
    TestVector::new(29, 14, 0x20, 0),
    TestVector::new(29, 14, 0x00, 0),
    TestVector::new(27, 13, 0x60, 0),
    TestVector::new(27, 13, 0x40, 0),
    TestVector::new(27, 13, 0x20, 0),
    TestVector::new(27, 13, 0x00, 0),
    TestVector::new(25, 12, 0x60, 0),
    TestVector::new(25, 12, 0x40, 0),
    TestVector::new(25, 12, 0x20, 0),
    TestVector::new(25, 12, 0x00, 0),
    TestVector::new(23, 11, 0x60, 0),
    TestVector::new(23, 11, 0x40, 0),
    TestVector::new(23, 11, 0x20, 0),
    TestVector::new(23, 11, 0x00, 0),
    TestVector::new(21, 10, 0x60, 0),
    TestVector::new(21, 10, 0x40, 0),
    TestVector::new(21, 10, 0x20, 0),
    TestVector::new(21, 10, 0x00, 0),
    TestVector::new(25, 11, 0x20, 1),
    TestVector::new(25, 11, 0x20, 2),
    TestVector::new(25, 11, 0x20, 3),
];

/// Computes the effective envelope rate from a nominal rate and the key
/// scaling settings, saturating at [`MAX_RATE`].
///
/// Only the low two bits of `key_scale` are used, as in the register field.
pub fn calc_rate(rate_param: u32, key_code: u8, key_scale: u8) -> u8 {
    let shift = 5 - (key_scale & 0x03);
    let rate = rate_param
        .saturating_mul(2)
        .saturating_add(u32::from(key_code >> shift));
    rate.min(u32::from(MAX_RATE)) as u8
}

/// Release rates sit on the odd rate codes.
pub fn release_rate_param(release_rate: u8) -> u32 {
    2 * u32::from(release_rate) + 1
}

/// The three register values programmed for one test vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterConfig {
    pub reg_28: u8,
    pub reg_80: u8,
    pub reg_e0: u8,
}

impl From<&TestVector> for RegisterConfig {
    fn from(vector: &TestVector) -> Self {
        // Sums, not ORs: an attack rate >= 0x40 spills into the key-scale bits.
        Self {
            reg_28: vector.key_code,
            reg_80: vector
                .key_scale
                .wrapping_mul(0x40)
                .wrapping_add(vector.attack_rate),
            reg_e0: 0xf0u8.wrapping_add(vector.release_rate),
        }
    }
}

impl RegisterConfig {
    /// The lines of the command file, in the order the programmer tool
    /// replays them.
    pub fn command_lines(&self) -> [String; 12] {
        [
            String::from("2087"),
            format!("28{:02x}", self.reg_28),
            String::from("4001"),
            String::from("6000"),
            format!("80{:02x}", self.reg_80),
            String::from("a000"),
            format!("e0{:02x}", self.reg_e0),
            String::from("0808"),
            String::from("0008"),
            String::from("0800"),
            String::from("00ff"),
            String::from("0000"),
        ]
    }
}

/// Writes the command file for `vector`, replacing whatever was there.
pub fn configure(path: &Path, vector: &TestVector) -> Result<RegisterConfig, BenchError> {
    let registers = RegisterConfig::from(vector);
    let mut contents = String::new();
    for line in registers.command_lines() {
        contents.push_str(&line);
        contents.push('\n');
    }
    fs::write(path, contents).map_err(|source| BenchError::CommandFile {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(
        "Wrote {}: 28{:02x} 80{:02x} e0{:02x}",
        path.display(),
        registers.reg_28,
        registers.reg_80,
        registers.reg_e0
    );
    Ok(registers)
}

/// Attack and release times reported by the measurement tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reading {
    pub attack_time: i64,
    pub release_time: i64,
}

// Errors raised at the measurement tool boundary.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The tool could not be started at all.
    #[error("could not start measurement tool: {0}")]
    Launch(#[source] io::Error),
    /// The tool ran but exited unsuccessfully.
    #[error("measurement tool failed ({})", exit_description(.code))]
    ProcessFailed {
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    /// The output lacks an attack or release time.
    #[error("measurement output has no attack/release times")]
    MalformedOutput(String),
}

impl DeviceError {
    /// Fatal errors end the sweep; the rest only lose one row.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DeviceError::Launch(_))
    }
}

fn exit_description(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit status {}", code),
        None => String::from("terminated by signal"),
    }
}

#[derive(Debug, Error)]
pub enum BenchError {
    #[error("failed to write command file {}", .path.display())]
    CommandFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("failed to write sweep report")]
    Report(#[from] io::Error),
}

/// Extracts the attack and release times from the tool's text output.
///
/// Each number must be followed by a space (`Attack: 12 us`). A number that
/// ends its line without one, as in `Attack: 12\nRelease: 34`, runs into the
/// next line and the output is reported as malformed.
pub fn parse_reading(text: &str) -> Result<Reading, DeviceError> {
    let malformed = || DeviceError::MalformedOutput(text.to_owned());
    let attack_time = field_after(text, ATTACK_MARKER).ok_or_else(malformed)?;
    let release_time = field_after(text, RELEASE_MARKER).ok_or_else(malformed)?;
    Ok(Reading {
        attack_time,
        release_time,
    })
}

// The number runs from the marker up to the next space.
fn field_after(text: &str, marker: &str) -> Option<i64> {
    let (_, rest) = text.split_once(marker)?;
    rest.split(' ').next()?.trim().parse().ok()
}

/// Anything that can take one envelope measurement of the configured chip.
pub trait Device {
    fn measure(&mut self) -> Result<Reading, DeviceError>;
}

/// Locations of the command file and the measurement tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchConfig {
    pub working_dir: PathBuf,
    pub command_file: PathBuf,
    pub tool: PathBuf,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("."),
            command_file: PathBuf::from("music.txt"),
            tool: PathBuf::from("./atten.sh"),
        }
    }
}

impl BenchConfig {
    pub fn command_file_path(&self) -> PathBuf {
        self.working_dir.join(&self.command_file)
    }

    pub fn tool_path(&self) -> PathBuf {
        self.working_dir.join(&self.tool)
    }
}

/// Runs the external measurement tool, blocking until it exits.
#[derive(Debug, Clone)]
pub struct ExternalTool {
    program: PathBuf,
    working_dir: PathBuf,
}

impl ExternalTool {
    pub fn new(config: &BenchConfig) -> Self {
        // The child runs inside working_dir, so a relative program path would
        // be resolved against it a second time.
        let joined = config.tool_path();
        let program = std::path::absolute(&joined).unwrap_or(joined);
        Self {
            program,
            working_dir: config.working_dir.clone(),
        }
    }
}

impl Device for ExternalTool {
    fn measure(&mut self) -> Result<Reading, DeviceError> {
        debug!("Running {}", self.program.display());
        let output = Command::new(&self.program)
            .current_dir(&self.working_dir)
            .output()
            .map_err(DeviceError::Launch)?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Err(DeviceError::ProcessFailed {
                code: output.status.code(),
                stdout,
                stderr,
            });
        }
        parse_reading(&format!("{}{}", stdout, stderr))
    }
}

/// One line of the sweep table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepRow {
    pub vector: TestVector,
    pub attack_rate: u8,
    pub release_rate: u8,
    /// `None` when this iteration produced no valid measurement.
    pub reading: Option<Reading>,
}

impl SweepRow {
    pub fn new(vector: TestVector, reading: Option<Reading>) -> Self {
        Self {
            vector,
            attack_rate: vector.expected_attack_rate(),
            release_rate: vector.expected_release_rate(),
            reading,
        }
    }
}

impl fmt::Display for SweepRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (attack_time, release_time) = match self.reading {
            Some(reading) => (
                reading.attack_time.to_string(),
                reading.release_time.to_string(),
            ),
            None => (String::from("-"), String::from("-")),
        };
        write!(
            f,
            "{:2} | {:2} | 0x{:02x} |  {}   | {:4} | {:>6} | {:4} | {:>6}",
            self.vector.attack_rate,
            self.vector.release_rate,
            self.vector.key_code,
            self.vector.key_scale,
            self.attack_rate,
            attack_time,
            self.release_rate,
            release_time
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub rows: Vec<SweepRow>,
}

impl SweepSummary {
    /// Number of rows without a measurement.
    pub fn failures(&self) -> usize {
        self.rows.iter().filter(|row| row.reading.is_none()).count()
    }
}

/// The sweep driver: programs each vector, measures it, prints the table.
pub struct Bench<D> {
    config: BenchConfig,
    device: D,
    styled: bool,
}

impl<D: Device> Bench<D> {
    pub fn new(config: BenchConfig, device: D) -> Self {
        Self {
            config,
            device,
            styled: false,
        }
    }

    /// Colors the diagnostics; only worth it when `out` is a terminal.
    pub fn with_styling(mut self, styled: bool) -> Self {
        self.styled = styled;
        self
    }

    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Sweeps `vectors` in order, writing the table to `out`.
    ///
    /// A failed measurement is reported and leaves its row empty; the sweep
    /// carries on. Command-file errors, a tool that cannot be launched, and
    /// errors writing to `out` end the sweep.
    pub fn run<W: Write>(
        &mut self,
        vectors: &[TestVector],
        out: &mut W,
    ) -> Result<SweepSummary, BenchError> {
        let command_file = self.config.command_file_path();
        info!(
            "Sweeping {} test vectors via {}",
            vectors.len(),
            command_file.display()
        );

        writeln!(out, "{}", TABLE_HEADER)?;
        writeln!(out, "{}", TABLE_RULE)?;

        let mut summary = SweepSummary::default();
        for vector in vectors {
            // The file must hold this vector before the tool runs.
            configure(&command_file, vector)?;

            let reading = match self.device.measure() {
                Ok(reading) => Some(reading),
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    warn!("No reading for {:?}: {}", vector, e);
                    report_failure(out, &e, self.styled)?;
                    None
                }
            };

            let row = SweepRow::new(*vector, reading);
            writeln!(out, "{}", row)?;
            summary.rows.push(row);
        }

        info!(
            "Sweep finished: {} rows, {} without a reading",
            summary.rows.len(),
            summary.failures()
        );
        Ok(summary)
    }
}

fn report_failure<W: Write>(out: &mut W, error: &DeviceError, styled: bool) -> io::Result<()> {
    if styled {
        writeln!(out, "{} {}", ERROR_TAG.red(), error)?;
    } else {
        writeln!(out, "{} {}", ERROR_TAG, error)?;
    }
    match error {
        DeviceError::ProcessFailed { stdout, stderr, .. } => {
            writeln!(out, "stdout: {}", stdout.trim_end())?;
            writeln!(out, "stderr: {}", stderr.trim_end())?;
        }
        DeviceError::MalformedOutput(raw) => writeln!(out, "{}", raw.trim_end())?,
        DeviceError::Launch(_) => {}
    }
    Ok(())
}
