use console::style;

use crate::jenkins::GroovyError;

/// Styling helpers for terminal output
pub fn bright_green(text: impl std::fmt::Display) -> console::StyledObject<String> {
    style(text.to_string()).bright().green()
}

pub fn bright_red(text: impl std::fmt::Display) -> console::StyledObject<String> {
    style(text.to_string()).bright().red()
}

pub fn cyan(text: impl std::fmt::Display) -> console::StyledObject<String> {
    style(text.to_string()).cyan()
}

pub fn dim(text: impl std::fmt::Display) -> console::StyledObject<String> {
    style(text.to_string()).dim()
}

pub fn magenta_bold(text: impl std::fmt::Display) -> console::StyledObject<String> {
    style(text.to_string()).magenta().bold()
}

/// Prints the jenkins-runner banner to stderr.
pub fn print_banner() {
    eprintln!(
        r"
{} {}
  {}
",
        magenta_bold("⚡ jenkins-runner"),
        dim(env!("CARGO_PKG_VERSION")),
        dim("Run pipeline scripts on Jenkins")
    );
}

/// Renders parsed Groovy error locations to stderr, one per line.
pub fn print_groovy_errors(errors: &[GroovyError]) {
    if errors.is_empty() {
        return;
    }

    eprintln!("{}", bright_red("Script errors:"));
    for error in errors {
        let location = match error.column {
            Some(column) => format!("{}:{}:{column}", error.path, error.line),
            None => format!("{}:{}", error.path, error.line),
        };
        match &error.message {
            Some(message) => eprintln!("  {} {message}", cyan(location)),
            None => eprintln!("  {}", cyan(location)),
        }
    }
}
