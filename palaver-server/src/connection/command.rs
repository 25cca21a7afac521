//! Slash-command parsing.
//!
//! A line starting with `/` is parsed into a tagged [`Command`] before any
//! state is touched; an unrecognized name fails closed at the parse step
//! and produces an error for the caller only.

/// The fixed command set.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Nick { name: String },
    Create { name: String },
    List { keyword: Option<String> },
    Delete { name: String },
    Join { name: String },
    Quit { name: String },
    Users { channel: Option<String> },
    Msg { to: String, content: String },
    Rename { old_name: String, new_name: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    UnknownCommand(String),
    Usage(&'static str),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::UnknownCommand(name) => write!(f, "Unknown command: {name}"),
            ParseError::Usage(usage) => write!(f, "{usage}"),
        }
    }
}

/// Whether a message line is a command rather than free text.
pub fn is_command(line: &str) -> bool {
    line.starts_with('/')
}

impl Command {
    /// Parse a `/command args` line. Missing single arguments become empty
    /// strings so the handlers' own validation reports the precise error
    /// ("Channel name cannot be empty" and friends).
    pub fn parse(line: &str) -> Result<Command, ParseError> {
        let mut parts = line.split_whitespace();
        let name = parts.next().unwrap_or("");
        let args: Vec<&str> = parts.collect();

        let first = |args: &[&str]| args.first().unwrap_or(&"").to_string();

        match name {
            "/nick" => Ok(Command::Nick { name: first(&args) }),
            "/create" => Ok(Command::Create { name: first(&args) }),
            "/list" => Ok(Command::List {
                keyword: args.first().map(|s| s.to_string()),
            }),
            "/delete" => Ok(Command::Delete { name: first(&args) }),
            "/join" => Ok(Command::Join { name: first(&args) }),
            "/quit" => Ok(Command::Quit { name: first(&args) }),
            "/users" => Ok(Command::Users {
                channel: args.first().map(|s| s.to_string()),
            }),
            "/msg" => {
                if args.len() < 2 {
                    return Err(ParseError::Usage("Usage: /msg <nickname> <message>"));
                }
                Ok(Command::Msg {
                    to: args[0].to_string(),
                    content: args[1..].join(" "),
                })
            }
            "/rename" => Ok(Command::Rename {
                old_name: first(&args),
                new_name: args.get(1).unwrap_or(&"").to_string(),
            }),
            other => Err(ParseError::UnknownCommand(other.to_string())),
        }
    }
}
