#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Help,
    Prompts,
    Prompt(Option<String>),
    ShowPrompt,
    Trace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParseError {
    message: String,
}

impl ParseError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub(crate) fn message(&self) -> &str {
        &self.message
    }
}

pub(crate) const HELP_TEXT: &str = "Available commands:\n  /help                Show this command list\n  /prompts             List prompt variants\n  /prompt [name]       Show or switch the active prompt variant\n  /show_prompt         Print the active variant's system prompt\n  /trace               Show path to the current trace file\nAnything else is asked as a question. Type exit, quit or q to leave.";

pub(crate) fn parse_command(line: &str) -> Result<Command, ParseError> {
    if !line.starts_with('/') {
        return Err(ParseError::new("not a command"));
    }

    let trimmed = line.trim();
    let command_text = &trimmed[1..];
    let mut parts = command_text.splitn(2, char::is_whitespace);
    let name = parts.next().unwrap_or("").to_ascii_lowercase();
    if name.is_empty() {
        return Err(ParseError::new("empty command. Try /help"));
    }
    let rest = parts.next().map(str::trim).unwrap_or("");

    match name.as_str() {
        "help" => expect_no_args(rest, Command::Help, "usage: /help"),
        "prompts" => expect_no_args(rest, Command::Prompts, "usage: /prompts"),
        "prompt" => parse_prompt(rest),
        "show_prompt" => expect_no_args(rest, Command::ShowPrompt, "usage: /show_prompt"),
        "trace" => expect_no_args(rest, Command::Trace, "usage: /trace"),
        _ => Err(ParseError::new(format!(
            "unknown command '/{name}'. Try /help"
        ))),
    }
}

pub(crate) fn is_command_line(line: &str) -> bool {
    line.starts_with('/')
}

fn expect_no_args(rest: &str, command: Command, usage: &str) -> Result<Command, ParseError> {
    if rest.is_empty() {
        Ok(command)
    } else {
        Err(ParseError::new(usage))
    }
}

fn parse_prompt(rest: &str) -> Result<Command, ParseError> {
    if rest.is_empty() {
        return Ok(Command::Prompt(None));
    }
    if rest.contains(char::is_whitespace) {
        return Err(ParseError::new("usage: /prompt [name]"));
    }
    Ok(Command::Prompt(Some(rest.to_string())))
}
