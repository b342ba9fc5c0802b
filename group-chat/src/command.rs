//! Parsing of the slash commands an authenticated client may send.
//!
//! The first whitespace-delimited token names the command. A recipient or group
//! name is the single token after it; message text is everything after the
//! whitespace that follows that token, spaces included.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Msg { recipient: String, text: String },
    Broadcast { text: String },
    CreateGroup { name: String },
    JoinGroup { name: String },
    LeaveGroup { name: String },
    GroupMsg { name: String, text: String },
    Exit,
    Unknown,
}

/// A line that could not become a [`Command`]. `Display` is the reply sent to
/// the client.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Empty command.")]
    Empty,
    #[error("Invalid {command} syntax. Use: {usage}")]
    InvalidSyntax {
        command: &'static str,
        usage: &'static str,
    },
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(ParseError::Empty);
        }

        let (name, rest) = split_token(line);
        let command = match name {
            "/msg" => {
                let (recipient, text) = target_and_text(rest)
                    .ok_or_else(|| invalid("/msg", "/msg <username> <message>"))?;
                Command::Msg { recipient, text }
            }
            "/broadcast" => Command::Broadcast {
                text: rest.to_string(),
            },
            "/create_group" => Command::CreateGroup {
                name: group_name(rest)
                    .ok_or_else(|| invalid("/create_group", "/create_group <group_name>"))?,
            },
            "/join_group" => Command::JoinGroup {
                name: group_name(rest)
                    .ok_or_else(|| invalid("/join_group", "/join_group <group_name>"))?,
            },
            "/leave_group" => Command::LeaveGroup {
                name: group_name(rest)
                    .ok_or_else(|| invalid("/leave_group", "/leave_group <group_name>"))?,
            },
            "/group_msg" => {
                let (name, text) = target_and_text(rest).ok_or_else(|| {
                    invalid("/group_msg", "/group_msg <group_name> <message>")
                })?;
                Command::GroupMsg { name, text }
            }
            "/exit" => Command::Exit,
            _ => Command::Unknown,
        };
        Ok(command)
    }
}

fn invalid(command: &'static str, usage: &'static str) -> ParseError {
    ParseError::InvalidSyntax { command, usage }
}

fn split_token(input: &str) -> (&str, &str) {
    input
        .split_once(char::is_whitespace)
        .unwrap_or((input, ""))
}

fn group_name(args: &str) -> Option<String> {
    let (name, _) = split_token(args.trim_start());
    (!name.is_empty()).then(|| name.to_string())
}

fn target_and_text(args: &str) -> Option<(String, String)> {
    let (target, text) = args.trim_start().split_once(char::is_whitespace)?;
    if target.is_empty() {
        return None;
    }
    Some((target.to_string(), text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_private_message_with_spaces() {
        assert_eq!(
            Command::parse("/msg bob hello there bob"),
            Ok(Command::Msg {
                recipient: "bob".into(),
                text: "hello there bob".into()
            })
        );
    }

    #[test]
    fn private_message_needs_recipient_and_text() {
        for line in ["/msg", "/msg bob", "/msg   bob  "] {
            let error = Command::parse(line).expect_err(line);
            assert_eq!(
                error.to_string(),
                "Invalid /msg syntax. Use: /msg <username> <message>"
            );
        }
    }

    #[test]
    fn broadcast_allows_empty_text() {
        assert_eq!(
            Command::parse("/broadcast"),
            Ok(Command::Broadcast { text: String::new() })
        );
        assert_eq!(
            Command::parse("/broadcast hi all"),
            Ok(Command::Broadcast {
                text: "hi all".into()
            })
        );
    }

    #[test]
    fn group_commands_take_single_name_token() {
        assert_eq!(
            Command::parse("/create_group team"),
            Ok(Command::CreateGroup {
                name: "team".into()
            })
        );
        assert_eq!(
            Command::parse("/join_group team extra"),
            Ok(Command::JoinGroup {
                name: "team".into()
            })
        );
        assert_eq!(
            Command::parse("/leave_group  team"),
            Ok(Command::LeaveGroup {
                name: "team".into()
            })
        );
        assert!(matches!(
            Command::parse("/create_group"),
            Err(ParseError::InvalidSyntax {
                command: "/create_group",
                ..
            })
        ));
    }

    #[test]
    fn group_message_splits_name_from_text() {
        assert_eq!(
            Command::parse("/group_msg team hi there"),
            Ok(Command::GroupMsg {
                name: "team".into(),
                text: "hi there".into()
            })
        );
        assert!(Command::parse("/group_msg team").is_err());
    }

    #[test]
    fn empty_and_unknown_lines() {
        assert_eq!(Command::parse("   "), Err(ParseError::Empty));
        assert_eq!(Command::parse("hello"), Ok(Command::Unknown));
        assert_eq!(Command::parse("/msgbob hi"), Ok(Command::Unknown));
        assert_eq!(Command::parse("/exit"), Ok(Command::Exit));
    }
}
