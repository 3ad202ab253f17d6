//! Error-handling code.

use std::{error::Error as StdError, fmt};

use anyhow::Error;

/// Support for displaying an error together with everything that caused it.
pub trait DisplayCausesExt {
    /// Display the error and its causes on separate lines, plus a backtrace
    /// if one was captured. Meant for logs.
    fn display_causes_and_backtrace(&self) -> DisplayCauses<'_>;

    /// Display the error and its causes on a single line, separated by `: `.
    /// Meant for messages returned to the API server.
    fn display_causes_inline(&self) -> DisplayCauses<'_>;
}

impl DisplayCausesExt for Error {
    fn display_causes_and_backtrace(&self) -> DisplayCauses<'_> {
        DisplayCauses {
            err: &**self,
            backtrace: Some(self),
        }
    }

    fn display_causes_inline(&self) -> DisplayCauses<'_> {
        DisplayCauses {
            err: &**self,
            backtrace: None,
        }
    }
}

/// Helper type used to display errors.
pub struct DisplayCauses<'a> {
    /// The error to display.
    err: &'a (dyn StdError + 'static),

    /// Where to get a backtrace from, when we want multi-line output.
    backtrace: Option<&'a Error>,
}

impl fmt::Display for DisplayCauses<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.backtrace {
            Some(err) => {
                writeln!(f, "ERROR: {}", self.err)?;
                let mut source = self.err.source();
                while let Some(next) = source {
                    writeln!(f, "  caused by: {}", next)?;
                    source = next.source();
                }
                write!(f, "{}", err.backtrace())
            }
            None => {
                write!(f, "{}", self.err)?;
                let mut source = self.err.source();
                while let Some(next) = source {
                    write!(f, ": {}", next)?;
                    source = next.source();
                }
                Ok(())
            }
        }
    }
}

#[test]
fn inline_causes_are_joined() {
    use anyhow::Context;

    let err = Err::<(), _>(json_syntax_error())
        .context("unable to decode Pod")
        .unwrap_err();
    assert_eq!(
        err.display_causes_inline().to_string(),
        "unable to decode Pod: expected value at line 1 column 1",
    );
}

#[test]
fn multi_line_causes_list_every_source() {
    use anyhow::Context;

    let err = std::fs::read_to_string("/nonexistent/instances.json")
        .context("could not read instances file")
        .unwrap_err();
    let shown = err.display_causes_and_backtrace().to_string();
    assert!(shown.starts_with("ERROR: could not read instances file\n"));
    assert!(shown.contains("  caused by: "));
}

#[cfg(test)]
fn json_syntax_error() -> serde_json::Error {
    serde_json::from_str::<serde_json::Value>("}").unwrap_err()
}
