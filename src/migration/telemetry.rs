//! Migration telemetry instruments and recording helpers.

use crate::schema::Bucket;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

struct MigrationInstruments {
    completed: Counter<u64>,
    read_failures: Counter<u64>,
    write_failures: Counter<u64>,
    records_written: Counter<u64>,
    records_skipped: Counter<u64>,
    rate_limit_wait_seconds: Histogram<f64>,
    rate_limit_rate: Histogram<f64>,
}

fn instruments() -> &'static MigrationInstruments {
    static INSTRUMENTS: OnceLock<MigrationInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("rollup.migration");
        MigrationInstruments {
            completed: meter
                .u64_counter("rollup.migration.completed")
                .with_description("Schedules whose aggregate data finished migrating")
                .init(),
            read_failures: meter
                .u64_counter("rollup.migration.read.failures")
                .with_description("Legacy reads that failed and were requeued")
                .init(),
            write_failures: meter
                .u64_counter("rollup.migration.write.failures")
                .with_description("Aggregate write batches that failed and were retried")
                .init(),
            records_written: meter
                .u64_counter("rollup.migration.records.written")
                .with_description("Aggregate records written to the target table")
                .init(),
            records_skipped: meter
                .u64_counter("rollup.migration.records.skipped")
                .with_description("Legacy groups not migrated, by reason")
                .init(),
            rate_limit_wait_seconds: meter
                .f64_histogram("rollup.rate_limit.wait")
                .with_description("Time spent waiting for a request permit")
                .with_unit("s")
                .init(),
            rate_limit_rate: meter
                .f64_histogram("rollup.rate_limit.rate")
                .with_description("Target request rate applied to a limiter")
                .with_unit("{request}/s")
                .init(),
        }
    })
}

fn bucket_attr(bucket: Bucket) -> [KeyValue; 1] {
    [KeyValue::new("bucket", bucket.as_str())]
}

pub fn record_migration_completed(bucket: Bucket) {
    instruments().completed.add(1, &bucket_attr(bucket));
}

pub fn record_read_failure(bucket: Bucket) {
    instruments().read_failures.add(1, &bucket_attr(bucket));
}

pub fn record_write_failure(bucket: Bucket) {
    instruments().write_failures.add(1, &bucket_attr(bucket));
}

pub fn record_records_written(bucket: Bucket, records: u64) {
    instruments()
        .records_written
        .add(records, &bucket_attr(bucket));
}

pub fn record_records_skipped(bucket: Bucket, reason: &'static str, records: u64) {
    if records == 0 {
        return;
    }
    instruments().records_skipped.add(
        records,
        &[
            KeyValue::new("bucket", bucket.as_str()),
            KeyValue::new("reason", reason),
        ],
    );
}

pub fn record_rate_limit_wait(limiter: &'static str, wait_seconds: f64) {
    instruments()
        .rate_limit_wait_seconds
        .record(wait_seconds, &[KeyValue::new("limiter", limiter)]);
}

pub fn record_rate(limiter: &'static str, rate: f64) {
    instruments()
        .rate_limit_rate
        .record(rate, &[KeyValue::new("limiter", limiter)]);
}
