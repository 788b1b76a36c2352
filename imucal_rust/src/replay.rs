//! Recorded IMU captures in CSV form.
//!
//! One row per synchronized event:
//! `timestamp,ax,ay,az,mx,my,mz,gx,gy,gz`. A header row starting with
//! `timestamp`, blank lines and `#` comments are skipped.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use imucal_core::RawSample;
use nalgebra::Vector3;
use thiserror::Error;

pub const REPLAY_COLUMNS: usize = 10;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("failed to read capture: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: expected {} columns, found {found}", REPLAY_COLUMNS)]
    ColumnCount { line: usize, found: usize },
    #[error("line {line}: invalid number {value:?}")]
    InvalidNumber { line: usize, value: String },
    #[error("capture contains no samples")]
    Empty,
}

pub fn read_samples(path: &Path) -> Result<Vec<RawSample>, ReplayError> {
    let file = File::open(path)?;
    parse_samples(BufReader::new(file))
}

pub fn parse_samples(reader: impl BufRead) -> Result<Vec<RawSample>, ReplayError> {
    let mut samples = Vec::new();

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty()
            || trimmed.starts_with('#')
            || trimmed.to_ascii_lowercase().starts_with("timestamp")
        {
            continue;
        }
        samples.push(parse_row(idx + 1, trimmed)?);
    }

    if samples.is_empty() {
        return Err(ReplayError::Empty);
    }
    Ok(samples)
}

fn parse_row(line: usize, row: &str) -> Result<RawSample, ReplayError> {
    let fields: Vec<&str> = row.split(',').map(str::trim).collect();
    if fields.len() != REPLAY_COLUMNS {
        return Err(ReplayError::ColumnCount {
            line,
            found: fields.len(),
        });
    }

    let mut values = [0.0; REPLAY_COLUMNS];
    for (value, field) in values.iter_mut().zip(&fields) {
        *value = field.parse().map_err(|_| ReplayError::InvalidNumber {
            line,
            value: field.to_string(),
        })?;
    }

    Ok(RawSample::new(
        values[0],
        Vector3::new(values[1], values[2], values[3]),
        Vector3::new(values[4], values[5], values[6]),
        Vector3::new(values[7], values[8], values[9]),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rows_and_skips_header() {
        let csv = "timestamp,ax,ay,az,mx,my,mz,gx,gy,gz\n\
                   # bench capture\n\
                   0.00, 0.01,-0.02,0.98, 21.5,-3.25,40.0, 0.001,0.0,-0.002\n\
                   \n\
                   0.01,0.02,-0.01,0.99,21.0,-3.0,40.5,0,0,0\n";
        let samples = parse_samples(csv.as_bytes()).unwrap();

        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].timestamp_seconds, 0.0);
        assert_eq!(samples[0].accel, Vector3::new(0.01, -0.02, 0.98));
        assert_eq!(samples[0].mag, Vector3::new(21.5, -3.25, 40.0));
        assert_eq!(samples[0].angular_velocity, Vector3::new(0.001, 0.0, -0.002));
        assert_eq!(samples[1].timestamp_seconds, 0.01);
    }

    #[test]
    fn reports_line_of_bad_row() {
        let csv = "timestamp,ax,ay,az,mx,my,mz,gx,gy,gz\n0,1,2,3,4,5,6,7,8\n";
        assert!(matches!(
            parse_samples(csv.as_bytes()),
            Err(ReplayError::ColumnCount { line: 2, found: 9 })
        ));

        let csv = "0,1,2,3,4,5,six,7,8,9\n";
        match parse_samples(csv.as_bytes()) {
            Err(ReplayError::InvalidNumber { line, value }) => {
                assert_eq!(line, 1);
                assert_eq!(value, "six");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn header_only_is_empty() {
        assert!(matches!(
            parse_samples("timestamp,ax,ay,az,mx,my,mz,gx,gy,gz\n".as_bytes()),
            Err(ReplayError::Empty)
        ));
    }
}
