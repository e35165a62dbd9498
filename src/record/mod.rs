//! Metric records: declared fields, deductive post-processing, CSV sink

pub mod deductive;
pub mod fields;
pub mod sink;

pub use fields::MetricRecord;
pub use sink::CsvSink;
