//! Metric names
//!
//! Recorded through the `metrics` facade; the daemon installs the
//! Prometheus recorder. Without a recorder every call is a no-op.

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};

pub const JOURNAL_APPENDED_ENTRIES: &str = "meridian_journal_appended_entries_total";
pub const JOURNAL_APPENDED_BYTES: &str = "meridian_journal_appended_bytes_total";
pub const JOURNAL_APPEND_FAILURES: &str = "meridian_journal_append_failures_total";
pub const JOURNAL_LAST_SEQUENCE: &str = "meridian_journal_last_sequence";
pub const JOURNAL_FIRST_SEQUENCE: &str = "meridian_journal_first_sequence";

pub const WRITER_BATCH_SIZE: &str = "meridian_writer_batch_entries";
pub const WRITER_REJECTED: &str = "meridian_writer_rejected_total";

pub const STORE_APPLIED_SEQUENCE: &str = "meridian_store_applied_sequence";
pub const REPLAY_ENTRIES: &str = "meridian_replay_entries_total";
pub const REPLAY_SKIPPED: &str = "meridian_replay_skipped_total";

pub const REPLICATION_PULLS: &str = "meridian_replication_pulls_total";
pub const REPLICATION_PULL_ERRORS: &str = "meridian_replication_pull_errors_total";
pub const REPLICATION_IMAGES_INSTALLED: &str = "meridian_replication_images_installed_total";

pub const CHECKPOINT_CREATED: &str = "meridian_checkpoint_created_total";
pub const CHECKPOINT_FAILURES: &str = "meridian_checkpoint_failures_total";
pub const CHECKPOINT_LAST_SEQUENCE: &str = "meridian_checkpoint_last_sequence";
pub const CHECKPOINT_SIZE_BYTES: &str = "meridian_checkpoint_size_bytes";

pub const ROLE_TRANSITIONS: &str = "meridian_role_transitions_total";
pub const LEADER_STEP_DOWNS: &str = "meridian_leader_step_downs_total";
pub const LEADER_EPOCH: &str = "meridian_leader_epoch";

pub const REQUESTS_SUBMITTED: &str = "meridian_requests_submitted_total";
pub const REQUESTS_FAILED: &str = "meridian_requests_failed_total";

/// Register descriptions with the installed recorder
pub fn describe_metrics() {
    describe_counter!(
        JOURNAL_APPENDED_ENTRIES,
        Unit::Count,
        "Entries made durable in the local journal"
    );
    describe_counter!(
        JOURNAL_APPENDED_BYTES,
        Unit::Bytes,
        "Encoded bytes appended to the local journal"
    );
    describe_counter!(
        JOURNAL_APPEND_FAILURES,
        Unit::Count,
        "Journal appends that failed to become durable"
    );
    describe_gauge!(JOURNAL_LAST_SEQUENCE, "Last durable sequence id");
    describe_gauge!(JOURNAL_FIRST_SEQUENCE, "First retained sequence id");
    describe_histogram!(
        WRITER_BATCH_SIZE,
        Unit::Count,
        "Entries per journal writer batch"
    );
    describe_counter!(
        WRITER_REJECTED,
        Unit::Count,
        "Proposals rejected by validation before sequencing"
    );
    describe_gauge!(STORE_APPLIED_SEQUENCE, "Last applied sequence id");
    describe_counter!(REPLAY_ENTRIES, Unit::Count, "Entries applied by replay");
    describe_counter!(
        REPLAY_SKIPPED,
        Unit::Count,
        "Entries skipped by the replay error policy"
    );
    describe_counter!(REPLICATION_PULLS, Unit::Count, "Pulls from the leader");
    describe_counter!(
        REPLICATION_PULL_ERRORS,
        Unit::Count,
        "Failed pulls from the leader"
    );
    describe_counter!(
        REPLICATION_IMAGES_INSTALLED,
        Unit::Count,
        "Checkpoint images installed from the leader"
    );
    describe_counter!(CHECKPOINT_CREATED, Unit::Count, "Checkpoint images written");
    describe_counter!(
        CHECKPOINT_FAILURES,
        Unit::Count,
        "Checkpoint attempts that failed"
    );
    describe_gauge!(
        CHECKPOINT_LAST_SEQUENCE,
        "Sequence id covered by the newest image"
    );
    describe_gauge!(
        CHECKPOINT_SIZE_BYTES,
        Unit::Bytes,
        "Size of the newest image"
    );
    describe_counter!(ROLE_TRANSITIONS, Unit::Count, "Role transitions");
    describe_counter!(
        LEADER_STEP_DOWNS,
        Unit::Count,
        "Times this node gave up leadership after a failure"
    );
    describe_gauge!(LEADER_EPOCH, "Epoch of the current leader");
    describe_counter!(REQUESTS_SUBMITTED, Unit::Count, "Operations submitted");
    describe_counter!(REQUESTS_FAILED, Unit::Count, "Operations that failed");
}
