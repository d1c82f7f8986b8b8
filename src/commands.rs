//! Outbound command frames understood by the CMS50EW.
//!
//! Every command is a fixed 9-byte frame: the `0x7D 0x81` preamble, an opcode,
//! and six `0x80` padding bytes. Several commands are never issued by this
//! crate; they are kept here because they document the device's vocabulary.

use std::fmt;
use std::str::FromStr;

/// Length of every command frame.
pub const FRAME_LEN: usize = 9;

const PREAMBLE: [u8; 2] = [0x7D, 0x81];
const PADDING: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Hello1,
    Hello2,
    Hello3,
    SessionHello,
    GetSessionCount,
    GetSessionTime,
    GetSessionDuration,
    GetUserInfo,
    GetSessionData,
    GetDeviceId,
    GetInfo,
    GetModel,
    GetVendor,
    SessionErase,
    Custom,
    SessionStuff,
    GetLiveData,
}

impl Command {
    pub const ALL: [Command; 17] = [
        Command::Hello1,
        Command::Hello2,
        Command::Hello3,
        Command::SessionHello,
        Command::GetSessionCount,
        Command::GetSessionTime,
        Command::GetSessionDuration,
        Command::GetUserInfo,
        Command::GetSessionData,
        Command::GetDeviceId,
        Command::GetInfo,
        Command::GetModel,
        Command::GetVendor,
        Command::SessionErase,
        Command::Custom,
        Command::SessionStuff,
        Command::GetLiveData,
    ];

    /// Third byte of the frame.
    pub const fn opcode(self) -> u8 {
        match self {
            Command::Hello1 => 0xA7,
            Command::Hello2 => 0xA2,
            Command::Hello3 => 0xA0,
            Command::SessionHello => 0xAD,
            Command::GetSessionCount => 0xA3,
            Command::GetSessionTime => 0xA5,
            Command::GetSessionDuration => 0xA4,
            Command::GetUserInfo => 0xAB,
            Command::GetSessionData => 0xA6,
            Command::GetDeviceId => 0xAA,
            Command::GetInfo => 0xB0,
            Command::GetModel => 0xA8,
            Command::GetVendor => 0xA9,
            Command::SessionErase => 0xAE,
            Command::Custom => 0xF5,
            Command::SessionStuff => 0xAF,
            Command::GetLiveData => 0xA1,
        }
    }

    /// The complete frame as written to the transport.
    pub const fn frame(self) -> [u8; FRAME_LEN] {
        [
            PREAMBLE[0],
            PREAMBLE[1],
            self.opcode(),
            PADDING,
            PADDING,
            PADDING,
            PADDING,
            PADDING,
            PADDING,
        ]
    }

    pub const fn name(self) -> &'static str {
        match self {
            Command::Hello1 => "hello1",
            Command::Hello2 => "hello2",
            Command::Hello3 => "hello3",
            Command::SessionHello => "session-hello",
            Command::GetSessionCount => "get-session-count",
            Command::GetSessionTime => "get-session-time",
            Command::GetSessionDuration => "get-session-duration",
            Command::GetUserInfo => "get-user-info",
            Command::GetSessionData => "get-session-data",
            Command::GetDeviceId => "get-device-id",
            Command::GetInfo => "get-info",
            Command::GetModel => "get-model",
            Command::GetVendor => "get-vendor",
            Command::SessionErase => "session-erase",
            Command::Custom => "custom",
            Command::SessionStuff => "session-stuff",
            Command::GetLiveData => "get-live-data",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown command name: {0}")]
pub struct UnknownCommand(pub String);

impl FromStr for Command {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::ALL
            .into_iter()
            .find(|c| c.name() == s)
            .ok_or_else(|| UnknownCommand(s.to_string()))
    }
}

/// Frame for a catalog entry, looked up by its protocol name.
pub fn lookup(name: &str) -> Result<[u8; FRAME_LEN], UnknownCommand> {
    name.parse::<Command>().map(Command::frame)
}
