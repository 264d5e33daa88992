use std::borrow::Cow;

///
/// SqlDialect
///
/// Provider hook for the few textual decisions the generic SQL generator
/// and command layer leave open.
///

pub trait SqlDialect: Send + Sync {
    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn parameter_placeholder(&self, name: &str) -> String {
        format!("@{name}")
    }

    /// Final adjustment applied to command text right before execution.
    fn adjust_command_text<'a>(&self, text: &'a str) -> Cow<'a, str> {
        Cow::Borrowed(text)
    }

    fn true_literal(&self) -> &'static str {
        "TRUE"
    }

    fn false_literal(&self) -> &'static str {
        "FALSE"
    }
}

///
/// AnsiDialect
///

#[derive(Clone, Copy, Debug, Default)]
pub struct AnsiDialect;

impl SqlDialect for AnsiDialect {}
