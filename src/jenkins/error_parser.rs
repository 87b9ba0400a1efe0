use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// A structured error location parsed out of a pipeline build log.
///
/// `column` and `message` are only present for compiler-style errors;
/// runtime stack-trace frames carry just a path and line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroovyError {
    pub path: String,
    pub line: u32,
    pub column: Option<u32>,
    pub message: Option<String>,
}

/*
Compiler-style error:

    WorkflowScript: 9: expecting ''', found '\n' @ line 9, column 32.
                       echo '"$Person"
                                      ^
*/
static RE_COMPILE_ERROR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<path>[^:]+):(?P<line>[^:]+):(?P<message>[^@]+) @ line \d+, column (?P<column>\d+)")
        .unwrap()
});

/*
Runtime stack-trace frame:

    at WorkflowScript.run(WorkflowScript:2)
*/
static RE_RUNTIME_ERROR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"WorkflowScript\.run\((?P<path>[^:]+):(?P<line>\d+)\)").unwrap());

/// Scans a build log for Groovy error locations.
///
/// Each physical line is tested against both known patterns
/// independently, so a line matching both yields two records. Lines
/// whose captured line number does not parse are skipped; the function
/// never fails and an empty log yields an empty list.
pub fn parse_groovy_errors(text: &str) -> Vec<GroovyError> {
    let mut errors = Vec::new();

    for line in text.lines() {
        if let Some(caps) = RE_COMPILE_ERROR.captures(line) {
            if let Ok(line_number) = caps["line"].trim().parse::<u32>() {
                errors.push(GroovyError {
                    path: caps["path"].to_string(),
                    line: line_number,
                    column: caps["column"].parse().ok(),
                    message: Some(caps["message"].trim().to_string()),
                });
            }
        }

        if let Some(caps) = RE_RUNTIME_ERROR.captures(line) {
            if let Ok(line_number) = caps["line"].parse::<u32>() {
                errors.push(GroovyError {
                    path: caps["path"].to_string(),
                    line: line_number,
                    column: None,
                    message: None,
                });
            }
        }
    }

    errors
}
