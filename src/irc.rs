//! IRC message parsing and formatting.
//!
//! Implements the RFC 1459 / RFC 2812 message format: optional prefix,
//! command, parameters, trailing parameter.

use std::fmt;

/// A parsed IRC message.
#[derive(Debug, Clone)]
pub struct Message {
    /// Optional message prefix (server or user origin).
    pub prefix: Option<String>,
    /// The IRC command (e.g. "NICK", "PRIVMSG", "001").
    pub command: String,
    /// Command parameters.
    pub params: Vec<String>,
}

impl Message {
    /// Parse a raw IRC line into a Message.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);

        // the trailing parameter begins at the first " :" and may contain
        // spaces; everything before it is plain space-separated words
        let (head, trailing) = match line.split_once(" :") {
            Some((head, trailing)) => (head, Some(trailing)),
            None => (line, None),
        };

        let mut words = head.split_ascii_whitespace();
        let mut first = words.next()?;
        let prefix = match first.strip_prefix(':') {
            Some(origin) => {
                first = words.next()?;
                Some(origin.to_string())
            }
            None => None,
        };
        let command = first.to_ascii_uppercase();
        let mut params: Vec<String> = words.map(str::to_string).collect();
        if let Some(trailing) = trailing {
            params.push(trailing.to_string());
        }

        Some(Message {
            prefix,
            command,
            params,
        })
    }

    /// Create a new message with no prefix.
    pub fn new(command: &str, params: Vec<&str>) -> Self {
        Message {
            prefix: None,
            command: command.to_string(),
            params: params.into_iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Create a new message with a server prefix.
    pub fn from_server(server: &str, command: &str, params: Vec<&str>) -> Self {
        Message {
            prefix: Some(server.to_string()),
            command: command.to_string(),
            params: params.into_iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref prefix) = self.prefix {
            write!(f, ":{prefix} ")?;
        }
        f.write_str(&self.command)?;
        let Some((last, middle)) = self.params.split_last() else {
            return Ok(());
        };
        for param in middle {
            write!(f, " {param}")?;
        }
        if last.is_empty() || last.starts_with(':') || last.contains(' ') {
            write!(f, " :{last}")
        } else {
            write!(f, " {last}")
        }
    }
}

// Welcome numerics
pub const RPL_WELCOME: &str = "001";
pub const RPL_YOURHOST: &str = "002";
pub const RPL_CREATED: &str = "003";
pub const RPL_MYINFO: &str = "004";

// LUSERS numerics
pub const RPL_LUSERCLIENT: &str = "251";
pub const RPL_LUSERCHANNELS: &str = "254";
pub const RPL_LUSERME: &str = "255";
pub const RPL_LOCALUSERS: &str = "265";
pub const RPL_GLOBALUSERS: &str = "266";

// Channel numerics
pub const RPL_CHANNELMODEIS: &str = "324";
pub const RPL_CREATIONTIME: &str = "329";
pub const RPL_NOTOPIC: &str = "331";
pub const RPL_TOPIC: &str = "332";
pub const RPL_TOPICWHOTIME: &str = "333";
pub const RPL_NAMREPLY: &str = "353";
pub const RPL_ENDOFNAMES: &str = "366";
pub const RPL_BANLIST: &str = "367";
pub const RPL_ENDOFBANLIST: &str = "368";

// WHOIS numerics
pub const RPL_WHOISUSER: &str = "311";
pub const RPL_WHOISSERVER: &str = "312";
pub const RPL_ENDOFWHOIS: &str = "318";

// MOTD numerics
pub const RPL_MOTDSTART: &str = "375";
pub const RPL_MOTD: &str = "372";
pub const RPL_ENDOFMOTD: &str = "376";

// Mode query
pub const RPL_UMODEIS: &str = "221";

// Errors
pub const ERR_NOSUCHNICK: &str = "401";
pub const ERR_NOSUCHCHANNEL: &str = "403";
pub const ERR_CANNOTSENDTOCHAN: &str = "404";
pub const ERR_UNKNOWNCOMMAND: &str = "421";
pub const ERR_NONICKNAMEGIVEN: &str = "431";
pub const ERR_ERRONEUSNICKNAME: &str = "432";
pub const ERR_NICKNAMEINUSE: &str = "433";
pub const ERR_USERNOTINCHANNEL: &str = "441";
pub const ERR_NOTONCHANNEL: &str = "442";
pub const ERR_NOTREGISTERED: &str = "451";
pub const ERR_NEEDMOREPARAMS: &str = "461";
pub const ERR_UNKNOWNMODE: &str = "472";
pub const ERR_INVITEONLYCHAN: &str = "473";
pub const ERR_BANNEDFROMCHAN: &str = "474";
pub const ERR_BADCHANNELKEY: &str = "475";
pub const ERR_CHANOPRIVSNEEDED: &str = "482";
