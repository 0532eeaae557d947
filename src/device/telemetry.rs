use std::collections::BTreeMap;
use log::debug;
use serde::Serialize;

use crate::device::constants::{FLEX_SENSORS, GYRO_AXES};

/// One parsed telemetry line. Each line produces a fresh snapshot; values are never merged across lines.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SensorValues {
    pub flex: BTreeMap<String, f32>,
    pub gyro: BTreeMap<String, f32>,
}

impl SensorValues {
    pub fn is_empty(&self) -> bool {
        self.flex.is_empty() && self.gyro.is_empty()
    }

    fn record(&mut self, key: &str, value: f32) {
        if FLEX_SENSORS.contains(&key) {
            self.flex.insert(key.to_string(), value);
        } else if GYRO_AXES.contains(&key) {
            self.gyro.insert(key.to_string(), value);
        }
    }
}

struct Reading<'a> {
    key: &'a str,
    number: &'a str,
    end: usize,
}

// whitespace as understood by the firmware's serial output: ASCII only
fn is_space(byte: u8) -> bool {
    matches!(byte, b' ' | b'\t' | b'\n' | b'\r' | b'\x0B' | b'\x0C')
}

fn is_digit_at(bytes: &[u8], index: usize) -> bool {
    bytes.get(index).is_some_and(|b| b.is_ascii_digit())
}

// optionally signed decimal: digits, ".digits" or "digits.digits"; no exponent
fn match_number(bytes: &[u8], start: usize) -> Option<usize> {
    let mut cursor = start;
    if matches!(bytes.get(cursor), Some(b'-' | b'+')) {
        cursor += 1;
    }

    let integer_start = cursor;
    while is_digit_at(bytes, cursor) {
        cursor += 1;
    }

    if bytes.get(cursor) == Some(&b'.') && is_digit_at(bytes, cursor + 1) {
        cursor += 1;
        while is_digit_at(bytes, cursor) {
            cursor += 1;
        }
        return Some(cursor);
    }

    if cursor > integer_start {
        Some(cursor)
    } else {
        None
    }
}

// KEY ":" whitespace* NUMBER, where KEY is an uppercase letter with an optional digit
fn match_reading(line: &str, start: usize) -> Option<Reading<'_>> {
    let bytes = line.as_bytes();
    if !bytes.get(start)?.is_ascii_uppercase() {
        return None;
    }

    let mut colon = start + 1;
    if is_digit_at(bytes, colon) && bytes.get(colon + 1) == Some(&b':') {
        colon += 1;
    }
    if bytes.get(colon) != Some(&b':') {
        return None;
    }

    let mut number_start = colon + 1;
    while bytes.get(number_start).is_some_and(|b| is_space(*b)) {
        number_start += 1;
    }

    let end = match_number(bytes, number_start)?;

    Some(Reading {
        key: &line[start..colon],
        number: &line[number_start..end],
        end,
    })
}

/// Extracts every `KEY:NUMBER` pair from a telemetry line.
///
/// Flex keys (`F1`..`F5`) and gyro axes (`X`, `Y`, `Z`) are kept, any other key is ignored.
/// Noise around the pairs is skipped. Returns `None` when nothing was recognised.
pub fn parse_sensor_line(line: &str) -> Option<SensorValues> {
    let mut values = SensorValues::default();
    let mut cursor = 0;

    while cursor < line.len() {
        let reading = match match_reading(line, cursor) {
            Some(reading) => reading,
            None => {
                cursor += 1;
                continue;
            }
        };
        cursor = reading.end;

        match reading.number.parse::<f32>() {
            Ok(value) => values.record(reading.key, value),
            Err(err) => debug!("Dropping malformed reading {}:{} ({})", reading.key, reading.number, err),
        }
    }

    if values.is_empty() {
        None
    } else {
        Some(values)
    }
}
