use crate::{
    config::QueryOptions,
    storage::{
        AnsiDialect, CommandContext, CommandError, CommandResult, DbCommand, DbConnection,
        DefaultTypeMappingSource, ExecuteMode, ParameterError, ParameterValues, ProviderError,
        RelationalCommand, RelationalConnection, RelationalParameter, TransactionId,
    },
    test_support::{FakeDatabase, RecordingSink, text},
    value::Value,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Harness {
    db: FakeDatabase,
    connection: RelationalConnection,
    sink: RecordingSink,
    options: QueryOptions,
}

impl Harness {
    fn new(db: FakeDatabase) -> Self {
        let connection = db.connection();
        Self {
            db,
            connection,
            sink: RecordingSink::default(),
            options: QueryOptions::default(),
        }
    }

    fn ctx(&self) -> CommandContext<'_> {
        CommandContext {
            connection: &self.connection,
            type_mappings: &DefaultTypeMappingSource,
            dialect: &AnsiDialect,
            sink: &self.sink,
            options: &self.options,
        }
    }
}

fn parameterized() -> RelationalCommand {
    RelationalCommand::new(
        "SELECT 1 WHERE a = @FirstParameter AND b = @SecondParameter",
        vec![
            RelationalParameter::dynamic("FirstInvariant", "@FirstParameter"),
            RelationalParameter::dynamic("SecondInvariant", "@SecondParameter"),
        ],
    )
}

#[test]
fn null_value_map_fails_before_any_provider_call() {
    let harness = Harness::new(FakeDatabase::new());

    for mode in [ExecuteMode::NonQuery, ExecuteMode::Scalar, ExecuteMode::Reader] {
        let err = parameterized()
            .execute(&harness.ctx(), mode, None)
            .expect_err("declared parameters need values");

        assert!(matches!(
            err,
            CommandError::Parameter(ParameterError::MissingValue { ref name }) if name == "FirstInvariant"
        ));
    }

    assert!(
        harness.db.log().is_empty(),
        "no provider call may happen: {:?}",
        harness.db.log()
    );
    assert!(harness.sink.events().is_empty());
}

#[test]
fn missing_single_value_fails_and_disposes_command() {
    let harness = Harness::new(FakeDatabase::new());
    let values = ParameterValues::new().with("FirstInvariant", Value::Int(1));

    let err = parameterized()
        .execute(&harness.ctx(), ExecuteMode::NonQuery, Some(&values))
        .expect_err("second value is missing");

    assert!(matches!(
        err,
        CommandError::Parameter(ParameterError::MissingValue { ref name }) if name == "SecondInvariant"
    ));
    assert_eq!(harness.db.count("dispose_command"), 1);
    assert_eq!(harness.db.count("open"), 0);
}

#[test]
fn non_query_runs_full_lifecycle_and_cleans_up() {
    let harness = Harness::new(FakeDatabase::new());
    let values = ParameterValues::new()
        .with("FirstInvariant", Value::Int(1))
        .with("SecondInvariant", text("x"));

    let result = parameterized()
        .execute(&harness.ctx(), ExecuteMode::NonQuery, Some(&values))
        .expect("non-query should succeed");

    assert!(matches!(result, CommandResult::NonQuery(0)));
    assert_eq!(
        harness.sink.events(),
        vec!["executing ExecuteNonQuery", "executed ExecuteNonQuery"]
    );
    assert_eq!(harness.db.count("open"), 1);
    assert_eq!(harness.db.count("close"), 1);
    assert_eq!(harness.db.count("dispose_command"), 1);
    assert_eq!(harness.db.count("clear_parameters"), 1);
    assert_eq!(harness.connection.open_count(), 0);

    let executed = harness.db.executed();
    assert_eq!(
        executed[0].parameters,
        vec![
            ("@FirstParameter".to_string(), Value::Int(1)),
            ("@SecondParameter".to_string(), text("x")),
        ]
    );
}

#[test]
fn scalar_normalizes_provider_null() {
    let harness = Harness::new(FakeDatabase::new());
    let command = RelationalCommand::new("SELECT NULL", Vec::new());

    let value = command
        .execute_scalar(&harness.ctx(), None)
        .expect("scalar should succeed");

    assert_eq!(value, Value::Null);

    let harness = Harness::new(FakeDatabase::new().with_scalar(Value::Int(42)));
    let value = command
        .execute_scalar(&harness.ctx(), None)
        .expect("scalar should succeed");

    assert_eq!(value, Value::Int(42));
}

#[test]
fn reader_failure_logs_one_error_and_cleans_up() {
    let harness = Harness::new(FakeDatabase::new().failing_on("SELECT"));
    let command = RelationalCommand::new("SELECT * FROM t", Vec::new());

    let err = command
        .execute_reader(&harness.ctx(), None)
        .expect_err("provider fault propagates");

    assert!(matches!(err, CommandError::Provider(ProviderError::Fault { .. })));
    assert_eq!(harness.sink.count_prefix("error ExecuteReader"), 1);
    assert_eq!(harness.sink.count_prefix("executed"), 0);
    assert_eq!(
        harness.sink.events().last().map(String::as_str),
        Some("error ExecuteReader: provider fault: boom")
    );
    assert_eq!(harness.db.count("dispose_command"), 1);
    assert_eq!(harness.db.count("close"), 1);
}

#[test]
fn reader_success_defers_cleanup_until_reader_is_dropped() {
    let harness = Harness::new(
        FakeDatabase::new().with_rows("FROM t", vec![vec![Value::Int(1)], vec![Value::Null]]),
    );
    let command = RelationalCommand::new("SELECT a FROM t", Vec::new());

    let mut reader = command
        .execute_reader(&harness.ctx(), None)
        .expect("reader should open");

    assert_eq!(harness.sink.count_prefix("executing ExecuteReader"), 1);
    assert_eq!(harness.sink.count_prefix("executed ExecuteReader"), 1);
    assert_eq!(harness.db.count("close"), 0, "connection must stay open");
    assert_eq!(harness.db.count("dispose_command"), 0);

    assert!(reader.read().expect("first row"));
    assert_eq!(reader.current_values(), vec![Value::Int(1)]);
    assert!(reader.read().expect("second row"));
    assert_eq!(reader.current_values(), vec![Value::Null]);
    assert!(!reader.read().expect("end"));

    drop(reader);

    assert_eq!(harness.db.count("close_reader FROM t"), 1);
    assert_eq!(harness.db.count("dispose_command"), 1);
    assert_eq!(harness.db.count("close"), 1);
    let close_reader = harness.db.position("close_reader FROM t").expect("reader closed");
    let close = harness.db.position("close").expect("connection closed");
    assert!(
        close_reader < close,
        "reader must close before the connection"
    );
}

#[test]
fn transaction_and_timeout_flow_to_provider_command() {
    let mut harness = Harness::new(FakeDatabase::new());
    harness.options.command_timeout_secs = Some(12);
    harness.connection.set_transaction(Some(TransactionId(9)));

    RelationalCommand::new("DELETE FROM t", Vec::new())
        .execute_non_query(&harness.ctx(), None)
        .expect("delete succeeds");

    let executed = harness.db.executed();
    assert_eq!(executed[0].transaction, Some(TransactionId(9)));
    assert_eq!(executed[0].timeout, Some(Duration::from_secs(12)));

    harness.connection.set_command_timeout(Some(Duration::from_secs(3)));
    RelationalCommand::new("DELETE FROM t", Vec::new())
        .execute_non_query(&harness.ctx(), None)
        .expect("delete succeeds");

    assert_eq!(
        harness.db.executed()[1].timeout,
        Some(Duration::from_secs(3)),
        "connection timeout wins over options"
    );
}

#[test]
fn outer_open_reference_keeps_connection_open_across_commands() {
    let harness = Harness::new(FakeDatabase::new());
    harness.connection.open().expect("open");

    RelationalCommand::new("UPDATE t SET a = 1", Vec::new())
        .execute_non_query(&harness.ctx(), None)
        .expect("update succeeds");

    assert_eq!(harness.db.count("open"), 1);
    assert_eq!(harness.db.count("close"), 0);
    assert_eq!(harness.connection.open_count(), 1);

    harness.connection.close().expect("close");
    assert_eq!(harness.db.count("close"), 1);
}

#[tokio::test]
async fn async_reader_logs_async_lifecycle() {
    let harness = Harness::new(FakeDatabase::new().with_rows("FROM t", vec![vec![Value::Int(5)]]));
    let cancel = CancellationToken::new();

    let mut reader = RelationalCommand::new("SELECT a FROM t", Vec::new())
        .execute_reader_async(&harness.ctx(), None, &cancel)
        .await
        .expect("async reader opens");

    assert!(reader.read_async(&cancel).await.expect("row"));
    assert_eq!(reader.current_values(), vec![Value::Int(5)]);
    drop(reader);

    assert_eq!(
        harness.sink.events(),
        vec!["executing ExecuteReader", "executed ExecuteReader"]
    );
    assert_eq!(harness.db.count("close"), 1);
}

#[tokio::test]
async fn async_execution_honors_cancellation() {
    let harness = Harness::new(FakeDatabase::new());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = RelationalCommand::new("SELECT 1", Vec::new())
        .execute_async(&harness.ctx(), ExecuteMode::Scalar, None, &cancel)
        .await
        .expect_err("cancelled before open");

    assert!(matches!(err, CommandError::Provider(ProviderError::Cancelled)));
    assert_eq!(harness.connection.open_count(), 0);
    assert_eq!(harness.db.count("dispose_command"), 1);
}

///
/// StalledConnection
///
/// Connection whose async open never completes.
///

struct StalledConnection;

#[async_trait::async_trait]
impl DbConnection for StalledConnection {
    fn open(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn open_async(&self, _cancel: &CancellationToken) -> Result<(), ProviderError> {
        std::future::pending().await
    }

    fn close(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    fn create_command(&self) -> Result<Box<dyn DbCommand>, ProviderError> {
        Err(ProviderError::fault("stalled connection has no commands"))
    }
}

#[tokio::test]
async fn abandoned_async_open_gives_its_reference_back() {
    let connection = RelationalConnection::new(StalledConnection);
    let cancel = CancellationToken::new();

    let outcome =
        tokio::time::timeout(Duration::from_millis(10), connection.open_async(&cancel)).await;

    assert!(outcome.is_err(), "the open never completes");
    assert_eq!(connection.open_count(), 0, "the dropped open must not hold a reference");

    connection.open().expect("a later open performs the physical open");
    assert_eq!(connection.open_count(), 1);
}

#[test]
fn result_of_another_mode_is_a_provider_fault() {
    let err = CommandResult::Scalar(Value::Int(1))
        .into_rows_affected()
        .expect_err("a scalar is not a row count");
    assert!(
        matches!(
            err,
            CommandError::Provider(ProviderError::Fault { ref message, .. })
                if message == "ExecuteNonQuery returned an ExecuteScalar result"
        ),
        "{err:?}"
    );

    assert!(CommandResult::NonQuery(3).into_scalar().is_err());
    assert!(matches!(CommandResult::NonQuery(3).into_rows_affected(), Ok(3)));
}
