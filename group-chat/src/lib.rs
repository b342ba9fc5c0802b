//! Authenticated multi-client TCP chat server with private messages and groups.
//!
//! Clients speak a newline-delimited text protocol: after logging in with a
//! username and password from the credential file they send slash commands
//! such as `/msg`, `/broadcast` and `/group_msg`.
//!
//! - [`cli`] parses the command line for server and client modes.
//! - [`credentials`] loads the `username:password` file.
//! - [`registry`] holds the shared connection and group registries.
//! - [`command`] parses command lines; [`dispatcher`] executes them.
//! - [`session`] runs one connection from login to teardown.
//! - [`server`] accepts connections and supervises session tasks.
//! - [`client`] is a small interactive terminal client.

pub mod cli;
pub mod client;
pub mod command;
pub mod credentials;
pub mod dispatcher;
pub mod registry;
pub mod server;
pub mod session;
