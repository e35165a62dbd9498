//! Deductive post-processing of metric records
//!
//! A deductive field is computed from fields already present. The chain is an
//! ordered sequence of pure transforms, not a class hierarchy: each entry has
//! a declared name and an explicit skip-if-already-present rule, and later
//! transforms may read fields written by earlier ones, so the order below is
//! load-bearing.

use crate::error::{Result, SweepError};
use crate::record::fields::MetricRecord;

/// One named deductive transform over a record
pub struct DeductiveField {
    /// Column name this transform owns
    pub key: &'static str,
    /// What the transform deduces
    pub description: &'static str,
    /// The transform itself; idempotent per its skip rule
    pub apply: fn(&mut MetricRecord) -> Result<()>,
}

/// The deductive chain, in application order
pub fn chain() -> &'static [DeductiveField] {
    &[
        DeductiveField {
            key: "note",
            description:
                "Diagnostic lines GNU time prepends on abnormal workload exit, split off so \
                 the numeric columns stay parseable",
            apply: apply_note,
        },
        DeductiveField {
            key: "oversub",
            description: "Thread oversubscription ratio, nthreads over ncores",
            apply: apply_oversub,
        },
        DeductiveField {
            key: "cputime",
            description: "Total CPU-seconds, user plus system",
            apply: apply_cputime,
        },
        DeductiveField {
            key: "timestamp",
            description: "Record creation time, ISO-8601",
            apply: apply_timestamp,
        },
    ]
}

/// Run the whole chain over one record
pub fn apply_all(record: &mut MetricRecord) -> Result<()> {
    for field in chain() {
        (field.apply)(record)?;
    }
    Ok(())
}

/// When the workload exits abnormally, GNU time writes lines like
/// `Command exited with non-zero status 1` ahead of the record, which land
/// inside the first column. Move them into `note` and restore `ncores`.
/// Deliberately overridable: re-running the fixup is harmless.
fn apply_note(record: &mut MetricRecord) -> Result<()> {
    let Some(first) = record.get("ncores") else {
        return Ok(());
    };
    if !first.starts_with("Command") {
        return Ok(());
    }
    let mut lines: Vec<&str> = first.lines().collect();
    let ncores = lines
        .pop()
        .ok_or_else(|| SweepError::parse("note", "empty ncores column"))?
        .to_string();
    let note = lines.join("; ");
    record.set("ncores", ncores);
    record.set("note", note);
    Ok(())
}

fn apply_oversub(record: &mut MetricRecord) -> Result<()> {
    if record.contains("oversub") {
        return Ok(());
    }
    let nthreads: u64 = parse_field(record, "nthreads")?;
    let ncores: u64 = parse_field(record, "ncores")?;
    if ncores == 0 {
        return Err(SweepError::parse("oversub", "ncores is zero"));
    }
    record.set("oversub", (nthreads / ncores).to_string());
    Ok(())
}

fn apply_cputime(record: &mut MetricRecord) -> Result<()> {
    if record.contains("cputime") {
        return Ok(());
    }
    let user: f64 = parse_field(record, "usertime")?;
    let sys: f64 = parse_field(record, "systime")?;
    record.set("cputime", format_seconds(user + sys));
    Ok(())
}

fn apply_timestamp(record: &mut MetricRecord) -> Result<()> {
    if record.contains("timestamp") {
        return Ok(());
    }
    record.set(
        "timestamp",
        chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
    );
    Ok(())
}

fn parse_field<T: std::str::FromStr>(record: &MetricRecord, key: &'static str) -> Result<T> {
    let raw = record
        .get(key)
        .ok_or_else(|| SweepError::parse(key, "field missing"))?;
    raw.trim()
        .parse()
        .map_err(|_| SweepError::parse(key, format!("unparsable value '{}'", raw)))
}

/// Render seconds without float-noise (0.5 + 0.1 prints as 0.6, not
/// 0.6000000000000001)
fn format_seconds(v: f64) -> String {
    let s = format!("{:.6}", v);
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_on_raw_record() {
        let mut rec = MetricRecord::from_raw_line("4,8,0,1.23,0.5,0.1,98%,3,1,12");
        apply_all(&mut rec).unwrap();
        assert_eq!(rec.get("oversub"), Some("2"));
        assert_eq!(rec.get("cputime"), Some("0.6"));
        assert!(rec.contains("timestamp"));
        assert!(!rec.contains("note"));
    }

    #[test]
    fn test_oversub_integer_division() {
        let mut rec = MetricRecord::new();
        rec.set("ncores", "4");
        rec.set("nthreads", "9");
        apply_oversub(&mut rec).unwrap();
        assert_eq!(rec.get("oversub"), Some("2"));
    }

    #[test]
    fn test_oversub_skips_when_present() {
        let mut rec = MetricRecord::new();
        rec.set("ncores", "4");
        rec.set("nthreads", "8");
        rec.set("oversub", "preset");
        apply_oversub(&mut rec).unwrap();
        assert_eq!(rec.get("oversub"), Some("preset"));
    }

    #[test]
    fn test_timestamp_skips_when_present() {
        let mut rec = MetricRecord::new();
        rec.set("timestamp", "2024-01-01T00:00:00");
        apply_timestamp(&mut rec).unwrap();
        assert_eq!(rec.get("timestamp"), Some("2024-01-01T00:00:00"));
    }

    #[test]
    fn test_note_splits_diagnostic_lines() {
        let mut rec = MetricRecord::new();
        rec.set(
            "ncores",
            "Command exited with non-zero status 1\nCommand terminated by signal 9\n4",
        );
        rec.set("nthreads", "8");
        apply_note(&mut rec).unwrap();
        assert_eq!(rec.get("ncores"), Some("4"));
        assert_eq!(
            rec.get("note"),
            Some("Command exited with non-zero status 1; Command terminated by signal 9")
        );
    }

    #[test]
    fn test_note_leaves_clean_records_alone() {
        let mut rec = MetricRecord::new();
        rec.set("ncores", "4");
        apply_note(&mut rec).unwrap();
        assert_eq!(rec.get("ncores"), Some("4"));
        assert!(!rec.contains("note"));
    }

    #[test]
    fn test_cputime_missing_field_is_an_error() {
        let mut rec = MetricRecord::new();
        rec.set("usertime", "0.5");
        assert!(apply_cputime(&mut rec).is_err());
    }

    #[test]
    fn test_format_seconds() {
        assert_eq!(format_seconds(0.5 + 0.1), "0.6");
        assert_eq!(format_seconds(2.0), "2");
        assert_eq!(format_seconds(1.25), "1.25");
    }

    #[test]
    fn test_chain_order_declares_all_keys() {
        let keys: Vec<_> = chain().iter().map(|f| f.key).collect();
        assert_eq!(keys, vec!["note", "oversub", "cputime", "timestamp"]);
    }
}
