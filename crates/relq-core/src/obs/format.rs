use crate::{
    storage::{DbParameter, DbType, ExecuteMode, ParameterDirection},
    value::Value,
};
use std::{fmt::Write as _, sync::Arc, time::Duration};
use ulid::Ulid;

/// Timeout reported when neither the command nor the connection sets one.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;

///
/// ParameterLog
///
/// Loggable view of one bound parameter. `value` is only captured when
/// sensitive data logging is enabled.
///

#[derive(Clone, Debug, PartialEq)]
pub struct ParameterLog {
    pub name: String,
    pub value: Option<Value>,
    pub db_type: Option<DbType>,
    pub direction: ParameterDirection,
}

///
/// CommandLog
///
/// Snapshot of one command execution shared by its lifecycle events.
///

#[derive(Clone, Debug, PartialEq)]
pub struct CommandLog {
    pub command_id: Ulid,
    pub mode: ExecuteMode,
    pub is_async: bool,
    pub command_text: String,
    pub parameters: Vec<ParameterLog>,
    pub timeout: Option<Duration>,
    pub sensitive: bool,
}

impl CommandLog {
    #[must_use]
    pub fn capture(
        command_id: Ulid,
        mode: ExecuteMode,
        is_async: bool,
        command_text: &str,
        parameters: &[Arc<DbParameter>],
        timeout: Option<Duration>,
        sensitive: bool,
    ) -> Self {
        let parameters = parameters
            .iter()
            .map(|p| ParameterLog {
                name: p.name.clone(),
                value: sensitive.then(|| p.value.clone()),
                db_type: p.db_type,
                direction: p.direction,
            })
            .collect();

        Self {
            command_id,
            mode,
            is_async,
            command_text: command_text.to_string(),
            parameters,
            timeout,
            sensitive,
        }
    }
}

/// Render a command the way it appears in the command log:
///
/// `[Parameters=[@p0='?' (DbType = Int64)], CommandType='Text', CommandTimeout='30']`
/// followed by a newline and the command text.
#[must_use]
pub fn format_command(command: &CommandLog) -> String {
    let mut out = String::from("[Parameters=[");
    for (i, parameter) in command.parameters.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        format_parameter(&mut out, parameter);
    }

    let timeout = command
        .timeout
        .map_or(DEFAULT_COMMAND_TIMEOUT_SECS, |t| t.as_secs());
    let _ = write!(
        out,
        "], CommandType='Text', CommandTimeout='{timeout}']\n{}",
        command.command_text
    );

    out
}

fn format_parameter(out: &mut String, parameter: &ParameterLog) {
    out.push_str(&parameter.name);
    match &parameter.value {
        None => out.push_str("='?'"),
        Some(Value::Null) => out.push_str("=NULL"),
        Some(value) => {
            let _ = write!(out, "='{value}'");
        }
    }

    let mut facets = Vec::new();
    if let Some(db_type) = parameter.db_type {
        facets.push(format!("DbType = {db_type:?}"));
    }
    if parameter.direction != ParameterDirection::Input {
        facets.push(format!("Direction = {:?}", parameter.direction));
    }
    if !facets.is_empty() {
        let _ = write!(out, " ({})", facets.join(", "));
    }
}
