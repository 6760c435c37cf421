//! Command table and dispatcher.
//!
//! Each entry maps a lowercase command name to its handler, the exact number
//! of arguments it takes (command name included) and whether its last
//! argument arrives as a bulk payload. Handlers only run once the dispatcher
//! has validated the name and arity, and they consume the argument list so
//! values can move straight into the keyspace.

use crate::object::Object;
use crate::protocol::Reply;
use crate::storage::Storage;
use bytes::Bytes;
use tracing::trace;

/// Handlers receive exactly `arity` arguments, name included.
type Handler = fn(Vec<Bytes>, &mut Storage) -> Bytes;

/// How a command's arguments are delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Every argument is on the command line
    Inline,
    /// The last token is a byte count and the payload follows the line
    Bulk,
}

/// Command table entry
pub struct CommandSpec {
    pub name: &'static str,
    pub handler: Handler,
    pub arity: usize,
    pub kind: CommandKind,
}

static COMMAND_TABLE: &[CommandSpec] = &[
    CommandSpec {
        name: "ping",
        handler: ping_command,
        arity: 1,
        kind: CommandKind::Inline,
    },
    CommandSpec {
        name: "echo",
        handler: echo_command,
        arity: 2,
        kind: CommandKind::Bulk,
    },
    CommandSpec {
        name: "set",
        handler: set_command,
        arity: 3,
        kind: CommandKind::Bulk,
    },
    CommandSpec {
        name: "get",
        handler: get_command,
        arity: 2,
        kind: CommandKind::Inline,
    },
    CommandSpec {
        name: "del",
        handler: del_command,
        arity: 2,
        kind: CommandKind::Inline,
    },
    CommandSpec {
        name: "exists",
        handler: exists_command,
        arity: 2,
        kind: CommandKind::Inline,
    },
];

/// Find a command by its lowercase name
pub fn lookup(name: &[u8]) -> Option<&'static CommandSpec> {
    COMMAND_TABLE.iter().find(|cmd| cmd.name.as_bytes() == name)
}

/// What the connection should do after dispatch
#[derive(Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// Send this reply and reset the parse state
    Reply(Bytes),
    /// The command's bulk payload has to be read before it can run
    ReadBulk,
    /// Close the connection without replying
    Quit,
}

/// Validate and, when possible, execute the command in `args`.
///
/// The argument list is taken when a handler runs; otherwise it is left for
/// the caller to reset or to complete with a bulk payload.
pub fn dispatch(args: &mut Vec<Bytes>, bulk_resolved: bool, storage: &mut Storage) -> Dispatch {
    let Some(name) = args.first().map(|name| name.to_ascii_lowercase()) else {
        return Dispatch::Reply(Reply::unknown_command());
    };

    if name == b"quit" {
        return Dispatch::Quit;
    }

    let Some(cmd) = lookup(&name) else {
        trace!(command = %String::from_utf8_lossy(&name), "Unknown command");
        return Dispatch::Reply(Reply::unknown_command());
    };

    if cmd.arity != args.len() {
        trace!(command = cmd.name, argc = args.len(), arity = cmd.arity, "Wrong arity");
        return Dispatch::Reply(Reply::wrong_arity());
    }

    if cmd.kind == CommandKind::Bulk && !bulk_resolved {
        return Dispatch::ReadBulk;
    }

    trace!(command = cmd.name, "Executing command");
    Dispatch::Reply((cmd.handler)(std::mem::take(args), storage))
}

fn ping_command(_args: Vec<Bytes>, _storage: &mut Storage) -> Bytes {
    Reply::pong()
}

fn echo_command(args: Vec<Bytes>, _storage: &mut Storage) -> Bytes {
    Reply::bulk(&args[1])
}

fn set_command(mut args: Vec<Bytes>, storage: &mut Storage) -> Bytes {
    let value = args.swap_remove(2);
    let key = args.swap_remove(1);

    storage.insert_or_replace(key, Object::string(value));
    Reply::ok()
}

fn get_command(args: Vec<Bytes>, storage: &mut Storage) -> Bytes {
    match storage.lookup(&args[1]) {
        None => Reply::nil(),
        Some(obj) => match obj.as_bytes() {
            Some(value) => Reply::bulk(value),
            None => Reply::bulk_error("GET against key not holding a string value"),
        },
    }
}

fn del_command(args: Vec<Bytes>, storage: &mut Storage) -> Bytes {
    storage.remove(&args[1]);
    Reply::ok()
}

fn exists_command(args: Vec<Bytes>, storage: &mut Storage) -> Bytes {
    Reply::boolean(storage.lookup(&args[1]).is_some())
}
