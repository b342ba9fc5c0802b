use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
};

use clap::{Args, Parser, Subcommand};

use crate::server::ServerConfig;

/// Port the server listens on and the client connects to by default.
pub const DEFAULT_PORT: u16 = 12345;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat server.
    Server(ServerArgs),
    /// Connect to a chat server from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address to bind. Use port 0 for an ephemeral port.
    #[arg(
        long,
        env = "GROUP_CHAT_LISTEN",
        default_value_t = SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT))
    )]
    pub listen: SocketAddr,

    /// File with one `username:password` pair per line.
    #[arg(long, env = "GROUP_CHAT_USERS", default_value = "users.txt")]
    pub users: PathBuf,

    /// Maximum number of concurrent sessions; unlimited when omitted.
    #[arg(long, env = "GROUP_CHAT_MAX_SESSIONS")]
    pub max_sessions: Option<usize>,
}

impl From<ServerArgs> for ServerConfig {
    fn from(args: ServerArgs) -> Self {
        Self {
            listen: args.listen,
            users: args.users,
            max_sessions: args.max_sessions,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the server to connect to.
    #[arg(
        long,
        default_value_t = SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT))
    )]
    pub server: SocketAddr,
}
