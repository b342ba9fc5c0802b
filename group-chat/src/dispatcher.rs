use tracing::debug;

use crate::{
    command::Command,
    registry::{ConnectionHandle, ConnectionRegistry, GroupRegistry},
};

/// Whether the session should keep reading after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Routes one line from an authenticated session to the registries.
///
/// Every rejected command produces exactly one reply line to the caller.
pub struct Dispatcher<'a> {
    connections: &'a ConnectionRegistry,
    groups: &'a GroupRegistry,
}

impl<'a> Dispatcher<'a> {
    pub fn new(connections: &'a ConnectionRegistry, groups: &'a GroupRegistry) -> Self {
        Self {
            connections,
            groups,
        }
    }

    pub fn dispatch(&self, caller: &ConnectionHandle, username: &str, line: &str) -> Flow {
        match Command::parse(line) {
            Ok(command) => self.execute(caller, username, command),
            Err(error) => {
                debug!(username, %error, "rejected command");
                caller.send_line(&error.to_string());
                Flow::Continue
            }
        }
    }

    fn execute(&self, caller: &ConnectionHandle, username: &str, command: Command) -> Flow {
        match command {
            Command::Msg { recipient, text } => {
                let line = format!("[{username}]: {text}");
                if !self.connections.send_to_user(&recipient, &line) {
                    caller.send_line("User not found.");
                }
            }
            Command::Broadcast { text } => {
                let line = format!("[{username}]: {text}");
                let recipients = self.connections.broadcast_except(caller.id(), &line);
                debug!(username, recipients, "broadcast delivered");
            }
            Command::CreateGroup { name } => match self.groups.create(&name, caller) {
                Ok(()) => {
                    debug!(username, group = %name, "group created");
                    caller.send_line(&format!("Group {name} created."));
                }
                Err(error) => {
                    caller.send_line(&error.to_string());
                }
            },
            Command::JoinGroup { name } => {
                let notice = format!("{username} joined the group {name}.");
                match self.groups.join(&name, caller, &notice) {
                    Ok(()) => caller.send_line(&format!("You joined the group {name}.")),
                    Err(error) => caller.send_line(&error.to_string()),
                };
            }
            Command::LeaveGroup { name } => {
                let notice = format!("{username} left the group {name}.");
                match self.groups.leave(&name, caller.id(), &notice) {
                    Ok(deleted) => {
                        if deleted {
                            debug!(group = %name, "group removed after last member left");
                        }
                        caller.send_line(&format!("You left the group {name}."));
                    }
                    Err(error) => {
                        caller.send_line(&error.to_string());
                    }
                }
            }
            Command::GroupMsg { name, text } => {
                let line = format!("[{username}][Group {name}]: {text}");
                if let Err(error) = self.groups.send(&name, caller.id(), &line) {
                    caller.send_line(&error.to_string());
                }
            }
            Command::Exit => return Flow::Exit,
            Command::Unknown => {
                caller.send_line("Unknown command.");
            }
        }
        Flow::Continue
    }
}
