use crate::{
    obs::{CommandLog, DiagnosticEvent, DiagnosticsSink, ExecutedResult, TracingSink, format_command},
    storage::{DbParameter, DbType, ExecuteMode, ParameterDirection},
    value::Value,
};
use std::{sync::Arc, time::Duration};
use ulid::Ulid;

fn parameters() -> Vec<Arc<DbParameter>> {
    let mut first = DbParameter::new("@FirstParameter", Value::Int(17));
    first.db_type = Some(DbType::Int64);
    let second = DbParameter::new("@out", Value::Null).with_direction(ParameterDirection::Output);

    vec![Arc::new(first), Arc::new(second)]
}

#[test]
fn command_log_hides_values_without_sensitive_logging() {
    let log = CommandLog::capture(
        Ulid::nil(),
        ExecuteMode::Reader,
        false,
        "SELECT 1",
        &parameters(),
        None,
        false,
    );

    assert_eq!(
        format_command(&log),
        "[Parameters=[@FirstParameter='?' (DbType = Int64), @out='?' (Direction = Output)], \
         CommandType='Text', CommandTimeout='30']\nSELECT 1"
    );
    assert!(log.parameters.iter().all(|p| p.value.is_none()));
}

#[test]
fn command_log_shows_values_with_sensitive_logging() {
    let log = CommandLog::capture(
        Ulid::nil(),
        ExecuteMode::NonQuery,
        true,
        "UPDATE t",
        &parameters(),
        Some(Duration::from_secs(5)),
        true,
    );

    assert_eq!(
        format_command(&log),
        "[Parameters=[@FirstParameter='17' (DbType = Int64), @out=NULL (Direction = Output)], \
         CommandType='Text', CommandTimeout='5']\nUPDATE t"
    );
}

#[test]
fn tracing_sink_accepts_every_event_without_a_subscriber() {
    let sink = TracingSink::new();
    let log = CommandLog::capture(
        Ulid::nil(),
        ExecuteMode::Scalar,
        false,
        "SELECT 1",
        &[],
        None,
        true,
    );

    sink.record(&DiagnosticEvent::CommandExecuting { command: &log });
    sink.record(&DiagnosticEvent::CommandExecuted {
        command: &log,
        elapsed: Duration::from_millis(3),
        result: &ExecutedResult::Scalar(Value::Int(1)),
    });
    sink.record(&DiagnosticEvent::CursorBuffered { rows: 2 });
}
