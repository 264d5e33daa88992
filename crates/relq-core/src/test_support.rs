//! Shared fixtures for unit tests: a scripted in-memory provider, a
//! recording diagnostics sink, and a small mapped model.

use crate::{
    model::{EntityBuilder, Model},
    obs::{DiagnosticEvent, DiagnosticsSink},
    storage::{
        DbCommand, DbConnection, DbDataReader, DbParameter, ProviderError, RawValue,
        RelationalConnection, TransactionId,
    },
    value::Value,
};
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};

pub(crate) type EventLog = Arc<Mutex<Vec<String>>>;

///
/// FakeScript
///
/// Canned results keyed by a SQL fragment; the first fragment contained
/// in the executed text wins.
///

#[derive(Debug, Default)]
pub(crate) struct FakeScript {
    pub rows: Vec<(String, Vec<Vec<Value>>)>,
    pub fail_on: Vec<String>,
    pub scalar: Option<Value>,
    pub rows_affected: u64,
    pub executed: Vec<ExecutedCommand>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ExecutedCommand {
    pub text: String,
    pub parameters: Vec<(String, Value)>,
    pub transaction: Option<TransactionId>,
    pub timeout: Option<Duration>,
}

///
/// FakeDatabase
///

#[derive(Clone, Debug, Default)]
pub(crate) struct FakeDatabase {
    log: EventLog,
    script: Arc<Mutex<FakeScript>>,
    mars: bool,
}

impl FakeDatabase {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_rows(self, fragment: &str, rows: Vec<Vec<Value>>) -> Self {
        self.script.lock().rows.push((fragment.to_string(), rows));
        self
    }

    pub(crate) fn failing_on(self, fragment: &str) -> Self {
        self.script.lock().fail_on.push(fragment.to_string());
        self
    }

    pub(crate) fn with_scalar(self, value: Value) -> Self {
        self.script.lock().scalar = Some(value);
        self
    }

    pub(crate) const fn with_mars(mut self) -> Self {
        self.mars = true;
        self
    }

    pub(crate) fn connection(&self) -> RelationalConnection {
        RelationalConnection::new(FakeConnection {
            log: Arc::clone(&self.log),
            script: Arc::clone(&self.script),
            mars: self.mars,
        })
    }

    pub(crate) fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub(crate) fn executed(&self) -> Vec<ExecutedCommand> {
        self.script.lock().executed.clone()
    }

    pub(crate) fn count(&self, entry: &str) -> usize {
        self.log.lock().iter().filter(|e| e.as_str() == entry).count()
    }

    pub(crate) fn position(&self, entry: &str) -> Option<usize> {
        self.log.lock().iter().position(|e| e.as_str() == entry)
    }
}

struct FakeConnection {
    log: EventLog,
    script: Arc<Mutex<FakeScript>>,
    mars: bool,
}

impl DbConnection for FakeConnection {
    fn open(&self) -> Result<(), ProviderError> {
        self.log.lock().push("open".to_string());
        Ok(())
    }

    fn close(&self) -> Result<(), ProviderError> {
        self.log.lock().push("close".to_string());
        Ok(())
    }

    fn create_command(&self) -> Result<Box<dyn DbCommand>, ProviderError> {
        self.log.lock().push("create_command".to_string());
        Ok(Box::new(FakeCommand {
            log: Arc::clone(&self.log),
            script: Arc::clone(&self.script),
            ..FakeCommand::default()
        }))
    }

    fn supports_multiple_active_result_sets(&self) -> bool {
        self.mars
    }
}

///
/// FakeCommand
///
/// Also usable standalone to observe parameter binding.
///

#[derive(Default)]
pub(crate) struct FakeCommand {
    log: EventLog,
    script: Arc<Mutex<FakeScript>>,
    text: String,
    parameters: Vec<Arc<DbParameter>>,
    transaction: Option<TransactionId>,
    timeout: Option<Duration>,
}

impl FakeCommand {
    fn record_execution(&self, kind: &str) -> Result<(), ProviderError> {
        self.log.lock().push(format!("{kind} {}", self.text));

        let mut script = self.script.lock();
        script.executed.push(ExecutedCommand {
            text: self.text.clone(),
            parameters: self
                .parameters
                .iter()
                .map(|p| (p.name.clone(), p.value.clone()))
                .collect(),
            transaction: self.transaction,
            timeout: self.timeout,
        });

        if script.fail_on.iter().any(|f| self.text.contains(f.as_str())) {
            return Err(ProviderError::fault("boom"));
        }

        Ok(())
    }
}

impl DbCommand for FakeCommand {
    fn set_command_text(&mut self, text: &str) {
        self.text = text.to_string();
    }

    fn set_transaction(&mut self, transaction: Option<TransactionId>) {
        self.transaction = transaction;
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    fn add_parameter(&mut self, parameter: Arc<DbParameter>) {
        self.parameters.push(parameter);
    }

    fn parameters(&self) -> &[Arc<DbParameter>] {
        &self.parameters
    }

    fn clear_parameters(&mut self) {
        self.log.lock().push("clear_parameters".to_string());
        self.parameters.clear();
    }

    fn execute_non_query(&mut self) -> Result<u64, ProviderError> {
        self.record_execution("execute_non_query")?;
        Ok(self.script.lock().rows_affected)
    }

    fn execute_scalar(&mut self) -> Result<RawValue, ProviderError> {
        self.record_execution("execute_scalar")?;
        Ok(self
            .script
            .lock()
            .scalar
            .clone()
            .map_or(RawValue::DbNull, RawValue::from))
    }

    fn execute_reader(&mut self) -> Result<Box<dyn DbDataReader>, ProviderError> {
        self.record_execution("execute_reader")?;

        let script = self.script.lock();
        let (label, rows) = script
            .rows
            .iter()
            .find(|(fragment, _)| self.text.contains(fragment.as_str()))
            .cloned()
            .unwrap_or_else(|| (self.text.clone(), Vec::new()));

        Ok(Box::new(FakeReader {
            log: Arc::clone(&self.log),
            label,
            rows,
            position: None,
        }))
    }

    fn dispose(&mut self) {
        self.log.lock().push("dispose_command".to_string());
    }
}

struct FakeReader {
    log: EventLog,
    label: String,
    rows: Vec<Vec<Value>>,
    position: Option<usize>,
}

impl DbDataReader for FakeReader {
    fn field_count(&self) -> usize {
        self.rows.first().map_or(0, Vec::len)
    }

    fn read(&mut self) -> Result<bool, ProviderError> {
        let next = self.position.map_or(0, |p| p + 1);
        self.position = Some(next);
        if next < self.rows.len() {
            self.log.lock().push(format!("read {}", self.label));
            return Ok(true);
        }

        Ok(false)
    }

    fn get_value(&self, ordinal: usize) -> RawValue {
        self.position
            .and_then(|p| self.rows.get(p))
            .and_then(|row| row.get(ordinal))
            .cloned()
            .map_or(RawValue::DbNull, RawValue::from)
    }

    fn close(&mut self) {
        self.log.lock().push(format!("close_reader {}", self.label));
    }
}

///
/// RecordingSink
///

#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    events: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub(crate) fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub(crate) fn count_prefix(&self, prefix: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }
}

impl DiagnosticsSink for RecordingSink {
    fn record(&self, event: &DiagnosticEvent<'_>) {
        let line = match *event {
            DiagnosticEvent::CommandExecuting { command } => {
                format!("executing {}", command.mode.method_name())
            }
            DiagnosticEvent::CommandExecuted { command, .. } => {
                format!("executed {}", command.mode.method_name())
            }
            DiagnosticEvent::CommandError { command, error, .. } => {
                format!("error {}: {error}", command.mode.method_name())
            }
            DiagnosticEvent::ClientEvaluation { clause, expression } => {
                format!("client_eval {clause}: {expression}")
            }
            DiagnosticEvent::CursorBuffered { rows } => format!("buffered {rows}"),
        };
        self.events.lock().push(line);
    }
}

/// Customers, orders, and a small animal hierarchy.
///
/// Customer columns: Id, Name, City. Order columns: Id, CustomerId, Total.
/// Animal columns: Id, Name, Kind (discriminator).
pub(crate) fn sample_model() -> Arc<Model> {
    let model = Model::builder()
        .entity(
            EntityBuilder::new("Customer")
                .table("Customers")
                .column("Id")
                .column("Name")
                .column("City")
                .computed("Nickname", |c| match c.get("Name") {
                    Value::Text(name) => Value::Text(format!("~{name}")),
                    _ => Value::Null,
                })
                .key(["Id"])
                .collection("Orders", "Order", "Id", "CustomerId"),
        )
        .entity(
            EntityBuilder::new("Order")
                .table("Orders")
                .column("Id")
                .column("CustomerId")
                .column("Total")
                .key(["Id"])
                .reference("Customer", "Customer", "CustomerId", "Id"),
        )
        .entity(
            EntityBuilder::new("Animal")
                .table("Animals")
                .is_abstract()
                .column("Id")
                .column("Name")
                .column("Kind")
                .discriminator("Kind")
                .key(["Id"]),
        )
        .entity(
            EntityBuilder::new("Cat")
                .base("Animal")
                .discriminator_value("Cat"),
        )
        .entity(
            EntityBuilder::new("Dog")
                .base("Animal")
                .discriminator_value("Dog"),
        )
        .build()
        .expect("sample model should build");

    Arc::new(model)
}

pub(crate) fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}
