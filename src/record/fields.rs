//! Declared metric field order
//!
//! The raw record arrives from `/usr/bin/time` as one comma-joined line whose
//! positions map onto the declared raw field order: the launcher-supplied
//! prefix (`ncores`, `nthreads`, `ntrial`) followed by the GNU time
//! conversions. The full CSV field list appends the deductive fields in their
//! chain order.

use std::collections::HashMap;

use crate::record::deductive;

/// One field reported by `/usr/bin/time`, with its `-f` conversion character
pub struct GnuTimeField {
    /// Column name in the output CSV
    pub key: &'static str,
    /// `%<fmt>` conversion character
    pub fmt: char,
    /// What the value measures
    pub description: &'static str,
}

/// GNU time conversions captured for every trial, in raw-record order
pub const GNU_TIME_FIELDS: &[GnuTimeField] = &[
    GnuTimeField {
        key: "elapsed",
        fmt: 'e',
        description: "Elapsed real (wall clock) time used by the process, in seconds",
    },
    GnuTimeField {
        key: "usertime",
        fmt: 'U',
        description: "CPU-seconds used directly by the process (user mode)",
    },
    GnuTimeField {
        key: "systime",
        fmt: 'S',
        description: "CPU-seconds used by the system on behalf of the process (kernel mode)",
    },
    GnuTimeField {
        key: "cpupercent",
        fmt: 'P',
        description: "Percentage of the CPU this job got (user+system over wall time)",
    },
    GnuTimeField {
        key: "volswitch",
        fmt: 'w',
        description: "Voluntary context switches (e.g. waiting on I/O)",
    },
    GnuTimeField {
        key: "invswitch",
        fmt: 'c',
        description: "Involuntary context switches (time slice expired)",
    },
    GnuTimeField {
        key: "minpgfaults",
        fmt: 'R',
        description: "Minor (recoverable) page faults",
    },
];

/// Launcher-supplied columns preceding the GNU time conversions
pub const RAW_PREFIX_FIELDS: &[&str] = &["ncores", "nthreads", "ntrial"];

/// Raw record field order: prefix columns then GNU time columns
pub fn raw_field_keys() -> Vec<&'static str> {
    RAW_PREFIX_FIELDS
        .iter()
        .copied()
        .chain(GNU_TIME_FIELDS.iter().map(|f| f.key))
        .collect()
}

/// Full declared CSV field order: raw fields then deductive fields
pub fn all_field_keys() -> Vec<&'static str> {
    raw_field_keys()
        .into_iter()
        .chain(deductive::chain().iter().map(|f| f.key))
        .collect()
}

/// `-f` format string handed to `/usr/bin/time` for the GNU time columns
pub fn gnu_time_format() -> String {
    GNU_TIME_FIELDS
        .iter()
        .map(|f| format!("%{}", f.fmt))
        .collect::<Vec<_>>()
        .join(",")
}

/// One structured performance record under construction.
///
/// Values are kept by field name; column order is imposed at sink time from
/// the declared field list, so construction order never leaks into output.
#[derive(Debug, Default, Clone)]
pub struct MetricRecord {
    values: HashMap<&'static str, String>,
}

impl MetricRecord {
    /// Empty record
    pub fn new() -> Self {
        Self::default()
    }

    /// Position-map one raw comma-joined line onto the raw field order.
    /// Trailing unmapped positions (or missing trailing fields) are dropped,
    /// mirroring a positional zip.
    pub fn from_raw_line(line: &str) -> Self {
        let mut record = Self::new();
        for (key, value) in raw_field_keys().into_iter().zip(line.trim().split(',')) {
            record.set(key, value);
        }
        record
    }

    /// Field value, if set
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Whether the field has been set
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Set a field value
    pub fn set(&mut self, key: &'static str, value: impl Into<String>) {
        self.values.insert(key, value.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gnu_time_format() {
        assert_eq!(gnu_time_format(), "%e,%U,%S,%P,%w,%c,%R");
    }

    #[test]
    fn test_raw_field_order() {
        assert_eq!(
            raw_field_keys(),
            vec![
                "ncores",
                "nthreads",
                "ntrial",
                "elapsed",
                "usertime",
                "systime",
                "cpupercent",
                "volswitch",
                "invswitch",
                "minpgfaults"
            ]
        );
    }

    #[test]
    fn test_all_fields_extend_raw_fields() {
        let all = all_field_keys();
        let raw = raw_field_keys();
        assert_eq!(&all[..raw.len()], &raw[..]);
        assert!(all.contains(&"oversub"));
        assert!(all.contains(&"timestamp"));
    }

    #[test]
    fn test_from_raw_line_position_mapping() {
        let rec = MetricRecord::from_raw_line("4,8,0,1.23,0.5,0.1,98%,3,1,12");
        assert_eq!(rec.get("ncores"), Some("4"));
        assert_eq!(rec.get("nthreads"), Some("8"));
        assert_eq!(rec.get("ntrial"), Some("0"));
        assert_eq!(rec.get("elapsed"), Some("1.23"));
        assert_eq!(rec.get("cpupercent"), Some("98%"));
        assert_eq!(rec.get("minpgfaults"), Some("12"));
        assert!(!rec.contains("oversub"));
    }

    #[test]
    fn test_from_raw_line_short_record() {
        let rec = MetricRecord::from_raw_line("4,8");
        assert_eq!(rec.get("ncores"), Some("4"));
        assert!(!rec.contains("ntrial"));
    }
}
