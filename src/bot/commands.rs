/// A prefix command parsed from a chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `play <query>`; the query may be empty, which the handler rejects.
    Play { query: String },
    Stop,
    Skip,
    Queue,
    Help,
    Unknown(String),
}

impl Command {
    /// Parses `content` if it starts with `prefix`. Anything else is not a
    /// command and yields `None`.
    pub fn parse(content: &str, prefix: &str) -> Option<Self> {
        let body = content.strip_prefix(prefix)?.trim();
        let mut parts = body.splitn(2, char::is_whitespace);
        let name = parts.next().filter(|n| !n.is_empty())?.to_lowercase();
        let args = parts.next().map(str::trim).unwrap_or_default();

        let command = match name.as_str() {
            "play" | "p" => Command::Play {
                query: collapse_whitespace(args),
            },
            "stop" => Command::Stop,
            "skip" | "next" => Command::Skip,
            "queue" | "q" => Command::Queue,
            "help" => Command::Help,
            _ => Command::Unknown(name),
        };
        Some(command)
    }

    pub fn name(&self) -> &str {
        match self {
            Command::Play { .. } => "play",
            Command::Stop => "stop",
            Command::Skip => "skip",
            Command::Queue => "queue",
            Command::Help => "help",
            Command::Unknown(name) => name,
        }
    }
}

/// Search queries are joined with single spaces; the cache keys on them.
fn collapse_whitespace(args: &str) -> String {
    args.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_play() {
        assert_eq!(
            Command::parse("!play  daft punk   one more time ", "!"),
            Some(Command::Play {
                query: "daft punk one more time".into()
            })
        );
        assert_eq!(
            Command::parse("!PLAY https://youtu.be/FGBhQbmPwH8", "!"),
            Some(Command::Play {
                query: "https://youtu.be/FGBhQbmPwH8".into()
            })
        );
        assert_eq!(
            Command::parse("!play", "!"),
            Some(Command::Play { query: String::new() })
        );
    }

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(Command::parse("!stop", "!"), Some(Command::Stop));
        assert_eq!(Command::parse("!skip", "!"), Some(Command::Skip));
        assert_eq!(Command::parse("!queue", "!"), Some(Command::Queue));
        assert_eq!(Command::parse("?help", "?"), Some(Command::Help));
        assert_eq!(Command::parse("!! skip", "!!"), Some(Command::Skip));
    }

    #[test]
    fn test_non_commands_are_ignored() {
        assert_eq!(Command::parse("hello there", "!"), None);
        assert_eq!(Command::parse("!", "!"), None);
        assert_eq!(Command::parse("!   ", "!"), None);
    }

    #[test]
    fn test_unknown_command() {
        let command = Command::parse("!dance now", "!").unwrap();
        assert_eq!(command, Command::Unknown("dance".into()));
        assert_eq!(command.name(), "dance");
    }
}
