//! Normative types: the conventional layouts for PV values
//!
//! Only the scalar types are built here. A server PV is usually created
//! from [`NtScalar`]:
//!
//! ```
//! use pvars::data::nt::NtScalar;
//!
//! let value = NtScalar::new(3.13).units("mm").build().unwrap();
//! assert_eq!(value.type_name(), "epics:nt/NTScalar:1.0");
//! assert_eq!(value.locate("display.units").unwrap().as_str(), Some("mm"));
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::{DataError, PvaData, Structure};

pub const NT_SCALAR: &str = "epics:nt/NTScalar:1.0";
pub const NT_SCALAR_ARRAY: &str = "epics:nt/NTScalarArray:1.0";

/// Alarm severities, as carried in `alarm.severity`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    NoAlarm = 0,
    Minor = 1,
    Major = 2,
    Invalid = 3,
}

/// An `alarm_t` structure
pub fn alarm(severity: Severity, status: i32, message: &str) -> Structure {
    Structure {
        name: "alarm".into(),
        type_name: "alarm_t".into(),
        fields: vec![
            PvaData::int("severity", severity as i32),
            PvaData::int("status", status),
            PvaData::string("message", message),
        ],
        type_id: None,
    }
}

/// A `time_t` structure holding the given time
pub fn time_stamp(time: SystemTime) -> Structure {
    let (seconds, nanoseconds) = split_time(time);
    Structure {
        name: "timeStamp".into(),
        type_name: "time_t".into(),
        fields: vec![
            PvaData::long("secondsPastEpoch", seconds),
            PvaData::int("nanoseconds", nanoseconds),
            PvaData::int("userTag", 0),
        ],
        type_id: None,
    }
}

fn split_time(time: SystemTime) -> (i64, i32) {
    match time.duration_since(UNIX_EPOCH) {
        Ok(since) => (since.as_secs() as i64, since.subsec_nanos() as i32),
        Err(before) => {
            let before = before.duration();
            let mut seconds = -(before.as_secs() as i64);
            let mut nanoseconds = before.subsec_nanos() as i32;
            if nanoseconds > 0 {
                seconds -= 1;
                nanoseconds = 1_000_000_000 - nanoseconds;
            }
            (seconds, nanoseconds)
        }
    }
}

/// Set `timeStamp` of a structure
pub fn set_time(value: &mut Structure, time: SystemTime) -> Result<(), DataError> {
    let (seconds, nanoseconds) = split_time(time);
    value
        .locate_mut("timeStamp.secondsPastEpoch")?
        .set_value(seconds)?;
    value.locate_mut("timeStamp.nanoseconds")?.set_value(nanoseconds)
}

/// Read `timeStamp` of a structure
pub fn get_time(value: &Structure) -> Result<SystemTime, DataError> {
    let number = |path: &str| -> Result<i64, DataError> {
        let field = value.locate(path)?;
        field
            .as_i64()
            .ok_or_else(|| DataError::cannot_convert(field, "long"))
    };
    let seconds = number("timeStamp.secondsPastEpoch")?;
    let nanoseconds = Duration::from_nanos(number("timeStamp.nanoseconds")?.clamp(0, 999_999_999) as u64);
    let time = if seconds >= 0 {
        UNIX_EPOCH + Duration::from_secs(seconds as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(seconds.unsigned_abs())
    };
    Ok(time + nanoseconds)
}

/// Set the `alarm` of a structure
pub fn set_alarm(
    value: &mut Structure,
    severity: Severity,
    status: i32,
    message: &str,
) -> Result<(), DataError> {
    value.locate_mut("alarm.severity")?.set_value(severity as i32)?;
    value.locate_mut("alarm.status")?.set_value(status)?;
    value.locate_mut("alarm.message")?.set_value(message)
}

/// Builder for `NTScalar` and `NTScalarArray` structures
///
/// The value type decides which: array values build an `NTScalarArray`.
#[derive(Debug, Clone)]
pub struct NtScalar {
    name: String,
    value: PvaData,
    description: Option<String>,
    units: Option<String>,
    precision: Option<i32>,
    display_limits: Option<(f64, f64)>,
    control: Option<(f64, f64, f64)>,
    time: Option<SystemTime>,
}

impl NtScalar {
    pub fn new(value: impl Into<PvaData>) -> NtScalar {
        NtScalar {
            name: String::new(),
            value: value.into(),
            description: None,
            units: None,
            precision: None,
            display_limits: None,
            control: None,
            time: None,
        }
    }

    /// Name of the top level structure
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }
    pub fn description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }
    pub fn units(mut self, units: &str) -> Self {
        self.units = Some(units.to_string());
        self
    }
    pub fn precision(mut self, precision: i32) -> Self {
        self.precision = Some(precision);
        self
    }
    pub fn display_limits(mut self, low: f64, high: f64) -> Self {
        self.display_limits = Some((low, high));
        self
    }
    pub fn control(mut self, low: f64, high: f64, min_step: f64) -> Self {
        self.control = Some((low, high, min_step));
        self
    }
    /// Initial time stamp, instead of the time of building
    pub fn time(mut self, time: SystemTime) -> Self {
        self.time = Some(time);
        self
    }

    pub fn build(self) -> Result<Structure, DataError> {
        let type_name = match &self.value {
            PvaData::Scalar { .. } => NT_SCALAR,
            PvaData::Array { .. } => NT_SCALAR_ARRAY,
            other => {
                return Err(DataError::Incompatible(format!(
                    "NTScalar value must be a scalar or scalar array, not {}",
                    other.type_name()
                )));
            }
        };
        let mut value = self.value;
        value.set_name("value");

        let mut fields = vec![value];
        if let Some(description) = &self.description {
            fields.push(PvaData::string("description", description));
        }
        fields.push(alarm(Severity::NoAlarm, 0, "NONE").into());
        fields.push(time_stamp(self.time.unwrap_or_else(SystemTime::now)).into());

        if self.units.is_some() || self.precision.is_some() || self.display_limits.is_some() {
            let (low, high) = self.display_limits.unwrap_or_default();
            fields.push(
                Structure::new(
                    "display",
                    "display_t",
                    vec![
                        PvaData::double("limitLow", low),
                        PvaData::double("limitHigh", high),
                        PvaData::string("description", self.description.unwrap_or_default()),
                        PvaData::string("units", self.units.unwrap_or_default()),
                        PvaData::int("precision", self.precision.unwrap_or(0)),
                    ],
                )?
                .into(),
            );
        }
        if let Some((low, high, min_step)) = self.control {
            fields.push(
                Structure::new(
                    "control",
                    "control_t",
                    vec![
                        PvaData::double("limitLow", low),
                        PvaData::double("limitHigh", high),
                        PvaData::double("minStep", min_step),
                    ],
                )?
                .into(),
            );
        }
        Structure::new(self.name, type_name, fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ArrayValue;

    #[test]
    fn test_scalar_layout() {
        let value = NtScalar::new(3.13)
            .name("demo")
            .time(UNIX_EPOCH + Duration::new(100, 5))
            .build()
            .unwrap();
        assert_eq!(
            value.format_type(),
            "epics:nt/NTScalar:1.0 demo\n    double value\n    alarm_t alarm\n        int severity\n        int status\n        string message\n    time_t timeStamp\n        long secondsPastEpoch\n        int nanoseconds\n        int userTag"
        );
        assert_eq!(value.locate("timeStamp.secondsPastEpoch").unwrap().as_i64(), Some(100));
        assert_eq!(get_time(&value).unwrap(), UNIX_EPOCH + Duration::new(100, 5));
    }

    #[test]
    fn test_array_with_options() {
        let value = NtScalar::new(vec![1i32, 2, 3])
            .description("Counts")
            .precision(2)
            .control(0.0, 10.0, 0.5)
            .build()
            .unwrap();
        assert_eq!(value.type_name(), NT_SCALAR_ARRAY);
        assert_eq!(value.get("value").unwrap().as_array(), Some(&ArrayValue::Int(vec![1, 2, 3])));
        assert_eq!(value.get("description").unwrap().as_str(), Some("Counts"));
        assert_eq!(value.locate("display.precision").unwrap().as_i64(), Some(2));
        assert_eq!(value.locate("control.minStep").unwrap().as_f64(), Some(0.5));
    }

    #[test]
    fn test_not_a_scalar() {
        let inner = alarm(Severity::Major, 1, "HIGH");
        assert!(NtScalar::new(inner).build().is_err());
    }

    #[test]
    fn test_set_time_and_alarm() {
        let mut value = NtScalar::new(1.0).build().unwrap();
        let before = UNIX_EPOCH - Duration::new(2, 250_000_000);
        set_time(&mut value, before).unwrap();
        assert_eq!(value.locate("timeStamp.secondsPastEpoch").unwrap().as_i64(), Some(-3));
        assert_eq!(value.locate("timeStamp.nanoseconds").unwrap().as_i64(), Some(750_000_000));
        assert_eq!(get_time(&value).unwrap(), before);

        set_alarm(&mut value, Severity::Minor, 3, "LOW").unwrap();
        assert_eq!(value.locate("alarm.severity").unwrap().as_i64(), Some(1));
        assert_eq!(value.locate("alarm.message").unwrap().as_str(), Some("LOW"));

        let bare = Structure::new("x", "", vec![PvaData::double("value", 0.0)]).unwrap();
        assert!(get_time(&bare).is_err());
    }
}
