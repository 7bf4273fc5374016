/// Command codes carried in the header.
///
/// `0x4001..=0x4006` drive hole punching, `0x4010..=0x4016` the connection
/// handshake and its rejections, `0x4020..=0x4023` an established connection.
/// `0x4030..=0x4033` are reserved for an orderly close and currently ignored.
#[derive(Eq, PartialEq, Copy, Clone, Debug, Hash)]
pub enum Command {
    Propose,
    ProposeAck,
    Confirm,
    ConfirmAck,
    Ping,
    Pong,
    Syn1,
    Sack1,
    Syn2,
    Sack2,
    Deny,
    NoPort,
    NoConv,
    Data,
    DataAck,
    Alive,
    AliveAck,
    Close(i32),
    Unknown(i32),
}

impl Command {
    /// Codes delivered to a connection by destination port.
    pub fn is_port_bound(&self) -> bool {
        (0x4012..=0x4033).contains(&i32::from(*self))
    }
    pub fn is_rejection(&self) -> bool {
        matches!(self, Command::Deny | Command::NoPort | Command::NoConv)
    }
}

impl From<i32> for Command {
    fn from(value: i32) -> Self {
        match value {
            0x4001 => Command::Propose,
            0x4002 => Command::ProposeAck,
            0x4003 => Command::Confirm,
            0x4004 => Command::ConfirmAck,
            0x4005 => Command::Ping,
            0x4006 => Command::Pong,
            0x4010 => Command::Syn1,
            0x4011 => Command::Sack1,
            0x4012 => Command::Syn2,
            0x4013 => Command::Sack2,
            0x4014 => Command::Deny,
            0x4015 => Command::NoPort,
            0x4016 => Command::NoConv,
            0x4020 => Command::Data,
            0x4021 => Command::DataAck,
            0x4022 => Command::Alive,
            0x4023 => Command::AliveAck,
            0x4030..=0x4033 => Command::Close(value),
            _ => Command::Unknown(value),
        }
    }
}

impl From<Command> for i32 {
    fn from(value: Command) -> Self {
        match value {
            Command::Propose => 0x4001,
            Command::ProposeAck => 0x4002,
            Command::Confirm => 0x4003,
            Command::ConfirmAck => 0x4004,
            Command::Ping => 0x4005,
            Command::Pong => 0x4006,
            Command::Syn1 => 0x4010,
            Command::Sack1 => 0x4011,
            Command::Syn2 => 0x4012,
            Command::Sack2 => 0x4013,
            Command::Deny => 0x4014,
            Command::NoPort => 0x4015,
            Command::NoConv => 0x4016,
            Command::Data => 0x4020,
            Command::DataAck => 0x4021,
            Command::Alive => 0x4022,
            Command::AliveAck => 0x4023,
            Command::Close(v) | Command::Unknown(v) => v,
        }
    }
}
