//! NMEA-0183 parsing for the GGA and RMC sentences the location activity uses.
//!
//! Sentences must carry a valid `*hh` checksum. Any talker id is accepted
//! (`$GP`, `$GN`, `$GL`, ...).

use thiserror::Error;

use crate::domain::GpsFix;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NmeaError {
    #[error("not an nmea sentence")]
    NotNmea,
    #[error("checksum mismatch (expected {expected:02X}, got {actual:02X})")]
    Checksum { expected: u8, actual: u8 },
    #[error("unsupported sentence {0}")]
    Unsupported(String),
    #[error("malformed {0} sentence")]
    Malformed(&'static str),
}

/// GGA: fix data
#[derive(Debug, Clone, PartialEq)]
pub struct Gga {
    pub time: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub quality: u8,
    pub satellites: u32,
    pub altitude: Option<f64>,
}

/// RMC: recommended minimum data
#[derive(Debug, Clone, PartialEq)]
pub struct Rmc {
    pub time: String,
    pub active: bool,
    pub date: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Sentence {
    Gga(Gga),
    Rmc(Rmc),
}

pub fn parse_sentence(line: &str) -> Result<Sentence, NmeaError> {
    let line = line.trim();
    let body = line.strip_prefix('$').ok_or(NmeaError::NotNmea)?;
    let (payload, checksum) = body.split_once('*').ok_or(NmeaError::NotNmea)?;
    let expected = u8::from_str_radix(checksum.trim(), 16).map_err(|_| NmeaError::NotNmea)?;
    let actual = payload.bytes().fold(0u8, |acc, b| acc ^ b);
    if expected != actual {
        return Err(NmeaError::Checksum { expected, actual });
    }

    let fields: Vec<&str> = payload.split(',').collect();
    let kind = fields[0];
    if kind.len() != 5 || !kind.is_ascii() {
        return Err(NmeaError::Unsupported(kind.to_string()));
    }
    match &kind[2..] {
        "GGA" => parse_gga(&fields).map(Sentence::Gga),
        "RMC" => parse_rmc(&fields).map(Sentence::Rmc),
        other => Err(NmeaError::Unsupported(other.to_string())),
    }
}

fn parse_gga(f: &[&str]) -> Result<Gga, NmeaError> {
    if f.len() < 10 {
        return Err(NmeaError::Malformed("GGA"));
    }
    Ok(Gga {
        time: f[1].to_string(),
        latitude: coordinate(f[2], f[3], 2),
        longitude: coordinate(f[4], f[5], 3),
        quality: f[6].parse().unwrap_or(0),
        satellites: f[7].parse().unwrap_or(0),
        altitude: f[9].parse().ok(),
    })
}

fn parse_rmc(f: &[&str]) -> Result<Rmc, NmeaError> {
    if f.len() < 10 {
        return Err(NmeaError::Malformed("RMC"));
    }
    Ok(Rmc { time: f[1].to_string(), active: f[2] == "A", date: f[9].to_string() })
}

/// "ddmm.mmmm" + hemisphere -> signed decimal degrees
fn coordinate(value: &str, hemisphere: &str, degree_digits: usize) -> Option<f64> {
    if value.len() <= degree_digits || !value.is_ascii() {
        return None;
    }
    let degrees: f64 = value[..degree_digits].parse().ok()?;
    let minutes: f64 = value[degree_digits..].parse().ok()?;
    let decimal = degrees + minutes / 60.0;
    match hemisphere {
        "N" | "E" => Some(decimal),
        "S" | "W" => Some(-decimal),
        _ => None,
    }
}

/// "hhmmss.sss" + "ddmmyy" -> "yyyy-mm-dd hh:mm:ss"
fn utc_stamp(time: &str, date: &str) -> Option<String> {
    if time.len() < 6 || date.len() != 6 || !time.is_ascii() || !date.is_ascii() {
        return None;
    }
    let yy: u32 = date[4..6].parse().ok()?;
    let year = if yy < 80 { 2000 + yy } else { 1900 + yy };
    Some(format!(
        "{}-{}-{} {}:{}:{}",
        year, &date[2..4], &date[0..2],
        &time[0..2], &time[2..4], &time[4..6]
    ))
}

/// folds sentences into the current fix
#[derive(Debug, Default)]
pub struct FixTracker {
    fix: GpsFix,
}

impl FixTracker {
    /// returns a snapshot whenever a GGA completes an observation
    pub fn update(&mut self, sentence: Sentence) -> Option<GpsFix> {
        match sentence {
            Sentence::Gga(gga) => {
                self.fix.latitude = gga.latitude;
                self.fix.longitude = gga.longitude;
                self.fix.altitude = gga.altitude;
                self.fix.satellites = gga.satellites;
                self.fix.fix = gga.quality > 0;
                Some(self.fix.clone())
            }
            Sentence::Rmc(rmc) => {
                if rmc.active {
                    self.fix.fix = true;
                }
                if let Some(stamp) = utc_stamp(&rmc.time, &rmc.date) {
                    self.fix.timestamp = Some(stamp);
                }
                None
            }
        }
    }
}
